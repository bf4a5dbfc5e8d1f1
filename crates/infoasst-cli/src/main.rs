//! Terminal front end: streams answers with a typewriter effect and lists
//! their citations and follow-up questions.

mod render;

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use infoasst_client::observability::init_observability;
use infoasst_client::prelude::*;
use infoasst_client::{AskRequest, render_preview};
use tokio::io::{AsyncBufReadExt as _, BufReader};
use tracing::info;

use crate::render::{print_answer, print_preview, stream_answer};

#[derive(Parser, Debug)]
#[command(name = "infoasst", about = "Chat with an Information Assistant backend")]
struct Cli {
    /// Backend base URL; overrides INFOASST_BASE_URL.
    #[arg(long, global = true)]
    base_url: Option<String>,
    /// Optional .env file loaded before reading the environment.
    #[arg(long, global = true)]
    env_file: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Interactive chat. `/clear` starts over, `/regenerate` re-asks, `/quit` exits.
    Chat {
        #[arg(long, value_enum, default_value_t = ModeArg::Work)]
        mode: ModeArg,
        /// Approach code (0-4); defaults to the mode's approach.
        #[arg(long)]
        approach: Option<u8>,
        /// Print answers at once instead of revealing them char by char.
        #[arg(long)]
        no_typewriter: bool,
    },
    /// Ask one question without history.
    Ask {
        question: String,
        #[arg(long, default_value_t = 0)]
        approach: u8,
    },
    /// Show the indexed chunk behind a citation path.
    Citation {
        path: String,
        /// Also fetch and preview the cited file by key.
        #[arg(long)]
        content: Option<String>,
    },
    /// GET a JSON status endpoint such as `/getInfoData`.
    Get { path: String },
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum ModeArg {
    Work,
    Web,
    Ungrounded,
}

impl From<ModeArg> for ChatMode {
    fn from(value: ModeArg) -> Self {
        match value {
            ModeArg::Work => ChatMode::WorkOnly,
            ModeArg::Web => ChatMode::WorkPlusWeb,
            ModeArg::Ungrounded => ChatMode::Ungrounded,
        }
    }
}

fn approach_from_code(code: u8) -> Result<Approach, ClientError> {
    Approach::from_code(code)
        .ok_or_else(|| ClientError::Validation(format!("unknown approach code {code}")))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    match &cli.env_file {
        Some(path) => {
            dotenvy::from_path(path)?;
        }
        None => {
            dotenvy::dotenv().ok();
        }
    }
    init_observability();

    let mut config = ClientConfig::from_env()?;
    if let Some(base_url) = cli.base_url {
        config = config.base_url(base_url);
    }
    let client = InfoAssistClient::new(config)?;
    info!(event = "cli.start", base_url = %client.config().base_url, "client ready");

    match cli.command {
        Command::Chat {
            mode,
            approach,
            no_typewriter,
        } => {
            let mut conversation = Conversation::new(mode.into());
            if let Some(code) = approach {
                conversation.set_approach(approach_from_code(code)?)?;
            }
            chat_loop(&client, conversation, !no_typewriter).await?;
        }
        Command::Ask { question, approach } => {
            let response = client
                .ask(&AskRequest::new(question, approach_from_code(approach)?))
                .await?;
            let parsed = parse_answer(
                &response.answer,
                &response.citation_lookup,
                &ParseOptions::default().prefix_segments(client.config().citation_prefix_segments),
            );
            print_answer(&parsed, true)?;
        }
        Command::Citation { path, content } => {
            let panel = CitationPanel::load(&client, &path).await;
            match panel.detail() {
                Some(detail) => println!("{}", serde_json::to_string_pretty(detail)?),
                None => println!("(citation detail unavailable)"),
            }
            if let Some(key) = content {
                let bytes = client.fetch_content(&key).await?;
                print_preview(&render_preview(RenderMode::for_path(&key), &key, &bytes));
            }
        }
        Command::Get { path } => {
            let value = client.get_opaque(&path).await?;
            println!("{}", serde_json::to_string_pretty(&value)?);
        }
    }
    Ok(())
}

async fn chat_loop(
    client: &InfoAssistClient,
    mut conversation: Conversation,
    typewriter_enabled: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let typewriter = client.typewriter();
    let options = ParseOptions::default().prefix_segments(client.config().citation_prefix_segments);
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    println!("mode: {:?}, approach: {}", conversation.mode(), conversation.approach());
    while let Some(line) = lines.next_line().await? {
        let question = match line.trim() {
            "" => continue,
            "/quit" | "/exit" => break,
            "/clear" => {
                conversation.clear();
                typewriter.reset();
                println!("(conversation cleared)");
                continue;
            }
            "/regenerate" => match conversation.regenerate() {
                Some(question) => question,
                None => {
                    println!("(nothing to regenerate)");
                    continue;
                }
            },
            other => other.to_string(),
        };

        let request = conversation.begin_turn(question)?;
        let stream = match client.chat_stream(&request, typewriter.clone()).await {
            Ok(stream) => stream,
            Err(err) => {
                conversation.abandon_turn();
                eprintln!("error: {err}");
                continue;
            }
        };

        match stream_answer(stream, typewriter_enabled, options.clone(), &mut std::io::stdout()).await {
            Ok((response, parsed)) => {
                print_answer(&parsed, false)?;
                conversation.record_answer(response)?;
            }
            Err(err) => {
                conversation.abandon_turn();
                eprintln!("\nerror: {err}");
            }
        }
    }
    Ok(())
}
