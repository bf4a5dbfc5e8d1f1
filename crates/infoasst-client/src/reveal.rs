//! Typewriter reveal: decouples how fast answer text arrives from how fast it
//! is shown.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::trace;

/// Characters waiting to be shown plus what has been shown so far.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RevealQueue {
    pending: VecDeque<char>,
    visible: String,
    revealed: usize,
}

impl RevealQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `text` one char at a time, preserving order.
    pub fn enqueue(&mut self, text: &str) {
        self.pending.extend(text.chars());
    }

    /// Moves exactly one char to the visible buffer.
    pub fn tick(&mut self) -> Option<char> {
        let ch = self.pending.pop_front()?;
        self.visible.push(ch);
        self.revealed += 1;
        Some(ch)
    }

    /// Moves everything pending to the visible buffer.
    pub fn reveal_all(&mut self) {
        self.revealed += self.pending.len();
        self.visible.extend(self.pending.drain(..));
    }

    /// Discards pending and visible text.
    pub fn reset(&mut self) {
        self.pending.clear();
        self.visible.clear();
        self.revealed = 0;
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Number of chars revealed so far.
    pub fn revealed(&self) -> usize {
        self.revealed
    }

    pub fn visible(&self) -> &str {
        &self.visible
    }
}

/// Snapshot published after every change to a [`Typewriter`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RevealProgress {
    /// Chars revealed since the last reset.
    pub revealed: usize,
    /// Chars still queued.
    pub pending: usize,
    /// Whether the tick loop is active.
    pub running: bool,
    /// Incremented by every reset; lets observers notice discarded output.
    pub generation: u64,
}

struct State {
    queue: RevealQueue,
    /// Bumped by `reset`; identifies the answer session feeding the queue.
    generation: u64,
    /// Bumped by `reset` and `skip_to_end`; identifies the live tick loop.
    epoch: u64,
    running: bool,
    ticker: Option<JoinHandle<()>>,
}

struct Shared {
    state: Mutex<State>,
    interval: Duration,
    progress: watch::Sender<RevealProgress>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, state: &State) {
        self.progress.send_replace(RevealProgress {
            revealed: state.queue.revealed(),
            pending: state.queue.pending_len(),
            running: state.running,
            generation: state.generation,
        });
    }
}

/// Reveals queued text one char per tick on a Tokio timer.
///
/// Cloning gives another handle to the same queue. `start` must be called
/// from within a Tokio runtime.
#[derive(Clone)]
pub struct Typewriter {
    shared: Arc<Shared>,
}

impl Typewriter {
    /// Default delay between two revealed chars.
    pub const DEFAULT_INTERVAL: Duration = Duration::from_millis(30);

    pub fn new(interval: Duration) -> Self {
        let (progress, _) = watch::channel(RevealProgress::default());
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    queue: RevealQueue::new(),
                    generation: 0,
                    epoch: 0,
                    running: false,
                    ticker: None,
                }),
                interval: if interval.is_zero() {
                    Self::DEFAULT_INTERVAL
                } else {
                    interval
                },
                progress,
            }),
        }
    }

    pub fn interval(&self) -> Duration {
        self.shared.interval
    }

    /// Queues text behind whatever is already pending. Does not start the
    /// tick loop.
    pub fn enqueue(&self, text: &str) {
        if text.is_empty() {
            return;
        }
        let mut state = self.shared.lock();
        state.queue.enqueue(text);
        self.shared.publish(&state);
    }

    /// Starts the tick loop unless it is already running or there is nothing
    /// to reveal.
    pub fn start(&self) {
        let mut state = self.shared.lock();
        self.start_locked(&mut state);
    }

    fn start_locked(&self, state: &mut State) {
        if state.running || state.queue.is_empty() {
            return;
        }
        state.running = true;
        let epoch = state.epoch;
        state.ticker = Some(tokio::spawn(tick_loop(Arc::clone(&self.shared), epoch)));
        self.shared.publish(state);
    }

    /// Current reset generation.
    pub fn generation(&self) -> u64 {
        self.shared.lock().generation
    }

    /// Enqueues and starts only if no reset happened since `generation` was
    /// read. Returns `false` when the text belongs to an abandoned session.
    pub(crate) fn feed(&self, generation: u64, text: &str) -> bool {
        let mut state = self.shared.lock();
        if state.generation != generation {
            return false;
        }
        if !text.is_empty() {
            state.queue.enqueue(text);
            self.shared.publish(&state);
        }
        self.start_locked(&mut state);
        true
    }

    /// Discards pending and visible text and stops the tick loop.
    ///
    /// A tick racing with the reset sees the new epoch and exits without
    /// touching the queue.
    pub fn reset(&self) {
        let mut state = self.shared.lock();
        state.generation = state.generation.wrapping_add(1);
        state.epoch = state.epoch.wrapping_add(1);
        state.queue.reset();
        state.running = false;
        if let Some(handle) = state.ticker.take() {
            handle.abort();
        }
        self.shared.publish(&state);
    }

    /// Reveals everything pending at once and stops the tick loop.
    pub fn skip_to_end(&self) {
        let mut state = self.shared.lock();
        state.epoch = state.epoch.wrapping_add(1);
        state.queue.reveal_all();
        state.running = false;
        if let Some(handle) = state.ticker.take() {
            handle.abort();
        }
        self.shared.publish(&state);
    }

    pub fn is_running(&self) -> bool {
        self.shared.lock().running
    }

    pub fn pending_len(&self) -> usize {
        self.shared.lock().queue.pending_len()
    }

    pub fn visible_text(&self) -> String {
        self.shared.lock().queue.visible().to_string()
    }

    pub fn progress(&self) -> RevealProgress {
        *self.shared.progress.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<RevealProgress> {
        self.shared.progress.subscribe()
    }

    /// Waits until every queued char has been revealed, starting the tick
    /// loop if text is pending but no loop is active.
    pub async fn wait_idle(&self) {
        let mut rx = self.subscribe();
        loop {
            let progress = *rx.borrow_and_update();
            if progress.pending == 0 && !progress.running {
                return;
            }
            if !progress.running {
                self.start();
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

impl Default for Typewriter {
    fn default() -> Self {
        Self::new(Self::DEFAULT_INTERVAL)
    }
}

impl std::fmt::Debug for Typewriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Typewriter")
            .field("interval", &self.shared.interval)
            .field("progress", &self.progress())
            .finish()
    }
}

async fn tick_loop(shared: Arc<Shared>, epoch: u64) {
    let mut ticker = tokio::time::interval(shared.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick of a Tokio interval completes immediately.
    ticker.tick().await;
    loop {
        ticker.tick().await;
        let mut state = shared.lock();
        if state.epoch != epoch {
            return;
        }
        match state.queue.tick() {
            Some(ch) => {
                trace!(event = "reveal.tick", ch = %ch.escape_debug(), "revealed char");
                shared.publish(&state);
            }
            None => {
                state.running = false;
                state.ticker = None;
                shared.publish(&state);
                return;
            }
        }
    }
}
