#![deny(unsafe_code)]

//! Threadline CLI — talk to a completion API with conversation memory.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use threadline_config::AppConfig;
use threadline_core::llm::{self, ChatMessage, ChatRequest, CompletionRequest};
use threadline_core::logging::{LogCollector, LogReader};
use threadline_core::session::SessionLifecycle;
use threadline_core::store::{self, ConversationStore};
use threadline_core::ConversationClient;
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Threadline — conversational memory for completion APIs.
#[derive(Parser)]
#[command(name = "threadline", version, about, long_about = None)]
struct Cli {
    /// Path to configuration file.
    #[arg(short, long, default_value = "threadline.toml")]
    config: PathBuf,

    /// Increase log verbosity (-v, -vv, -vvv).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Print how the context window was built after the command runs.
    #[arg(long)]
    diagnostics: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Single-prompt completion with conversation history.
    Complete {
        #[arg(short, long)]
        user: String,

        /// Channel the conversation is held with.
        #[arg(long)]
        channel: Option<String>,

        #[arg(required = true)]
        prompt: Vec<String>,
    },

    /// Chat completion with conversation history.
    Chat {
        #[arg(short, long)]
        user: String,

        #[arg(long)]
        channel: Option<String>,

        #[arg(required = true)]
        message: Vec<String>,
    },

    /// Close the user's conversation.
    Close {
        #[arg(short, long)]
        user: String,
    },

    /// Show the paired history of the user's conversation.
    History {
        #[arg(short, long)]
        user: String,
    },

    /// Validate and display configuration.
    Config {
        /// Show the resolved configuration.
        #[arg(long)]
        show: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let (config, found) = load_config(&cli.config).await?;
    let diagnostics = init_tracing(&cli, &config);
    if !found {
        info!(path = %cli.config.display(), "Config file not found, using defaults");
    }

    let outcome = match &cli.command {
        Commands::Complete {
            user,
            channel,
            prompt,
        } => cmd_complete(&config, user, channel.as_deref(), &prompt.join(" ")).await,
        Commands::Chat {
            user,
            channel,
            message,
        } => cmd_chat(&config, user, channel.as_deref(), &message.join(" ")).await,
        Commands::Close { user } => cmd_close(&config, user).await,
        Commands::History { user } => cmd_history(&config, user).await,
        Commands::Config { show } => cmd_config(&cli.config, &config, *show),
    };

    if let Some(reader) = diagnostics {
        print_diagnostics(&reader);
    }
    outcome
}

/// Install the global subscriber. With `--diagnostics`, a collector also
/// records the core's debug events regardless of the console filter.
fn init_tracing(cli: &Cli, config: &AppConfig) -> Option<LogReader> {
    let level = match cli.verbose {
        0 => config.logging.level.as_str(),
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let console = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_filter(filter);

    let collector = cli.diagnostics.then(|| LogCollector::new(256));
    let reader = collector.as_ref().map(LogCollector::reader);
    let capture = collector.map(|c| c.with_filter(EnvFilter::new("threadline_core=debug")));

    tracing_subscriber::registry()
        .with(console)
        .with(capture)
        .init();
    reader
}

fn print_diagnostics(reader: &LogReader) {
    eprintln!("── diagnostics ──");
    for entry in reader.entries() {
        let fields: Vec<String> = entry
            .fields
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect();
        eprintln!(
            "[{:>8.3}s] {:<5} {} {}",
            entry.elapsed_secs,
            entry.level,
            entry.message,
            fields.join(" ")
        );
    }
}

async fn build_client(config: &AppConfig) -> Result<ConversationClient> {
    let provider = llm::create_provider(&config.llm).context("failed to create provider")?;
    let store = open_store(config).await?;
    Ok(ConversationClient::from_config(
        &config.conversation,
        provider,
        store,
    ))
}

async fn open_store(config: &AppConfig) -> Result<Arc<dyn ConversationStore>> {
    if config.store.backend == "memory" {
        info!("Using the in-memory store; history will not outlive this process");
    }
    store::open_store(&config.store)
        .await
        .with_context(|| format!("failed to open '{}' store", config.store.backend))
}

async fn cmd_complete(
    config: &AppConfig,
    user: &str,
    channel: Option<&str>,
    prompt: &str,
) -> Result<()> {
    let client = build_client(config).await?;
    let request = CompletionRequest {
        model: config.llm.completion_model.clone(),
        prompt: prompt.to_string(),
        max_tokens: config.llm.max_tokens,
        temperature: config.llm.temperature,
        user: user.to_string(),
        ..CompletionRequest::default()
    };

    let channel = channel.unwrap_or(client.default_channel());
    let response = client.complete_with_channel(request, channel).await?;
    match response.choices.first() {
        Some(choice) => println!("{}", choice.text.trim()),
        None => eprintln!("(no completion returned)"),
    }
    Ok(())
}

async fn cmd_chat(
    config: &AppConfig,
    user: &str,
    channel: Option<&str>,
    message: &str,
) -> Result<()> {
    let client = build_client(config).await?;
    let request = ChatRequest {
        model: config.llm.model.clone(),
        messages: vec![ChatMessage::user(message)],
        max_tokens: config.llm.max_tokens,
        temperature: config.llm.temperature,
        user: user.to_string(),
        ..ChatRequest::default()
    };

    let channel = channel.unwrap_or(client.default_channel());
    let response = client.chat_complete_with_channel(request, channel).await?;
    match response.choices.first() {
        Some(choice) => println!("{}", choice.message.content.trim()),
        None => eprintln!("(no completion returned)"),
    }
    Ok(())
}

/// Open the store for a command that only reads or closes existing state.
async fn open_durable_store(config: &AppConfig) -> Result<Arc<dyn ConversationStore>> {
    if config.store.backend == "memory" {
        bail!(
            "the memory store keeps nothing between runs; set [store] backend to \"sqlite\" or \"json\""
        );
    }
    open_store(config).await
}

async fn cmd_close(config: &AppConfig, user: &str) -> Result<()> {
    let store = open_durable_store(config).await?;
    SessionLifecycle::new(store.as_ref()).close(user).await?;
    println!("Conversation for '{user}' closed.");
    Ok(())
}

async fn cmd_history(config: &AppConfig, user: &str) -> Result<()> {
    let store = open_durable_store(config).await?;
    let messages = SessionLifecycle::new(store.as_ref())
        .history(user, config.conversation.max_turns)
        .await?;
    if messages.is_empty() {
        println!("No active conversation for '{user}'.");
        return Ok(());
    }
    for message in messages {
        println!("{:>12}: {}", message.from_user_id, message.content);
    }
    Ok(())
}

fn cmd_config(config_path: &Path, config: &AppConfig, show: bool) -> Result<()> {
    if show {
        let mut shown = config.clone();
        if !shown.llm.api_key.is_empty() {
            shown.llm.api_key = "[REDACTED]".to_string();
        }
        let toml_str = toml::to_string_pretty(&shown).context("failed to render config")?;
        println!("{toml_str}");
    } else {
        println!("Configuration at '{}' is valid.", config_path.display());
    }
    Ok(())
}

/// Load the config file, falling back to defaults when it does not exist.
/// The flag reports whether the file was found.
async fn load_config(path: &Path) -> Result<(AppConfig, bool)> {
    if tokio::fs::try_exists(path).await.unwrap_or(false) {
        let config = AppConfig::load(path)
            .await
            .with_context(|| format!("failed to load '{}'", path.display()))?;
        Ok((config, true))
    } else {
        Ok((AppConfig::default(), false))
    }
}
