use std::path::{Path, PathBuf};

use once_cell::sync::OnceCell;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::SubscriberInitExt as _;

static INIT: OnceCell<()> = OnceCell::new();

const ENABLED_VAR: &str = "INFOASST_OBSERVABILITY_ENABLED";
const LEVEL_VAR: &str = "INFOASST_LOG_LEVEL";
const JSON_PATH_VAR: &str = "INFOASST_JSON_LOG_PATH";
const DEFAULT_LOG_FILE: &str = "infoasst.logs.jsonl";

fn parse_bool_env(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" | "enabled" => Some(true),
        "0" | "false" | "no" | "off" | "disabled" => Some(false),
        _ => None,
    }
}

/// Logging settings read from `INFOASST_*` variables.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LogSettings {
    pub enabled: bool,
    /// Filter directive. `None` falls back to `RUST_LOG`, then to the
    /// caller's default level.
    pub filter: Option<String>,
    /// JSONL log file. `None` logs to stderr.
    pub json_log_path: Option<PathBuf>,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            filter: None,
            json_log_path: None,
        }
    }
}

impl LogSettings {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Resolves settings through `lookup` instead of the process
    /// environment. Blank values count as unset; an unparsable enable flag
    /// keeps logging on and an invalid filter is ignored.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let value = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        Self {
            enabled: value(ENABLED_VAR)
                .and_then(|v| parse_bool_env(&v))
                .unwrap_or(true),
            filter: value(LEVEL_VAR).filter(|v| EnvFilter::try_new(v).is_ok()),
            json_log_path: value(JSON_PATH_VAR).map(PathBuf::from),
        }
    }

    fn env_filter(&self, default_level: &str) -> EnvFilter {
        if let Some(directive) = &self.filter
            && let Ok(filter) = EnvFilter::try_new(directive)
        {
            return filter;
        }
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level))
    }

    /// Directory and file name of the JSONL log, if one is configured.
    fn json_target(&self) -> Option<(PathBuf, String)> {
        let path = self.json_log_path.as_deref()?;
        let dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map_or_else(|| PathBuf::from("."), Path::to_path_buf);
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or(DEFAULT_LOG_FILE)
            .to_string();
        Some((dir, file_name))
    }
}

/// Initialize logging once per process.
///
/// Environment variables:
/// - `INFOASST_OBSERVABILITY_ENABLED`: optional enable/disable flag (default enabled).
/// - `INFOASST_LOG_LEVEL`: optional level/filter override (`info`, `debug`, etc.).
/// - `INFOASST_JSON_LOG_PATH`: optional log file path. If set, logs are JSONL in that file.
///   If unset, logs go to stderr so they never interleave with revealed answer text.
/// - `RUST_LOG`: optional filter override.
pub fn init_observability() {
    init_observability_with(LogSettings::from_env(), "warn");
}

/// Installs the subscriber described by `settings`. Only the first call in a
/// process has any effect; returns whether this call was it.
pub fn init_observability_with(settings: LogSettings, default_level: &str) -> bool {
    let mut installed = false;
    INIT.get_or_init(|| {
        installed = true;
        if !settings.enabled {
            return;
        }

        let env_filter = settings.env_filter(default_level);
        if let Some((dir, file_name)) = settings.json_target() {
            let _ = std::fs::create_dir_all(&dir);
            let writer = tracing_appender::rolling::never(dir, file_name);
            let json_layer = tracing_subscriber::fmt::layer()
                .json()
                .with_current_span(true)
                .with_span_list(true)
                .with_target(false)
                .with_writer(writer);
            let _ = tracing_subscriber::registry()
                .with(env_filter)
                .with(json_layer)
                .try_init();
        } else {
            let console_layer = tracing_subscriber::fmt::layer()
                .compact()
                .with_target(false)
                .with_writer(std::io::stderr);
            let _ = tracing_subscriber::registry()
                .with(env_filter)
                .with(console_layer)
                .try_init();
        }
    });
    installed
}
