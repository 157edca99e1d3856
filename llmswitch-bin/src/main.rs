use std::io::{self, Write};
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use futures_util::StreamExt;
use llmswitch_core::{
    Config, get_client,
    model::{ChatMessage, ChatRequest},
    stream::StreamEvent,
};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(author, version, about = "llmswitch CLI: talk to the model selected by LLM_TYPE", long_about = None)]
struct Cli {
    /// Read configuration from a JSON/TOML file instead of the environment
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Send a chat request and print the folded response
    Chat {
        #[arg(short, long, help = "Message from the user")]
        message: String,
        #[arg(short, long, help = "Optional system prompt")]
        system: Option<String>,
    },
    /// Stream a chat request (prints deltas live)
    Stream {
        #[arg(short, long, help = "Message from the user")]
        message: String,
        #[arg(short, long, help = "Optional system prompt")]
        system: Option<String>,
    },
    /// Print which provider and model the configuration selects
    Show,
}

fn request(message: String, system: Option<String>) -> ChatRequest {
    let mut messages: Vec<ChatMessage> = system.into_iter().map(ChatMessage::system).collect();
    messages.push(ChatMessage::user(message));
    ChatRequest {
        messages,
        ..ChatRequest::default()
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();
    let cfg = match &cli.config {
        Some(path) => Config::from_path(path)?,
        None => Config::from_env()?,
    };
    let client = get_client(&cfg)?;

    match cli.command {
        Commands::Show => {
            let params = client.params();
            println!(
                "{} model={} temperature={} streaming={}",
                client.llm_type(),
                client.model(),
                params.temperature,
                params.streaming
            );
        }
        Commands::Chat { message, system } => {
            let resp = client.chat(request(message, system)).await?;
            println!("{} -> {}", resp.provider, resp.text);
            eprintln!(
                "[stop: {:?}, tokens: {}/{}, {} ms, request id: {}]",
                resp.stop_reason,
                resp.usage_prompt,
                resp.usage_completion,
                resp.latency_ms,
                resp.provider_request_id.as_deref().unwrap_or("-")
            );
        }
        Commands::Stream { message, system } => {
            let mut stream = client.chat_stream(request(message, system)).await?;
            let mut saw_delta = false;
            while let Some(ev) = stream.next().await {
                match ev {
                    StreamEvent::RequestId(id) => {
                        tracing::debug!(llm.req_id = %id, "provider request id");
                    }
                    StreamEvent::DeltaText(txt) => {
                        saw_delta = true;
                        print!("{txt}");
                        io::stdout().flush().ok();
                    }
                    StreamEvent::Usage { prompt, completion } => {
                        tracing::debug!(?prompt, ?completion, "usage");
                    }
                    StreamEvent::Stop { reason } => {
                        if saw_delta {
                            println!();
                        }
                        eprintln!("[stop: {:?}]", reason);
                    }
                    StreamEvent::Error(err) => {
                        if saw_delta {
                            println!();
                        }
                        return Err(err.into());
                    }
                    _ => {}
                }
            }
        }
    }

    Ok(())
}
