use std::future::Future;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader, Lines};

use parley::config::{self, DEFAULT_BASE_URL};
use parley::models::Attachment;
use parley::providers::{ChatMessage, InferenceBackend, OllamaProvider};
use parley::services::export::export_to_markdown;
use parley::services::{
    AppSettings, ConversationSession, ConversationStore, Database, Ledger, LedgerError,
    SettingsService, TurnContext, TurnOutcome, TurnUpdate,
};

/// Chat with a locally hosted model and keep the history.
#[derive(Parser)]
#[command(name = "parley", version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// More log output (-v for debug, -vv for trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// SQLite database file.
    #[arg(long, env = "PARLEY_DB_PATH", global = true)]
    pub db: Option<PathBuf>,

    /// Base URL of the Ollama server.
    #[arg(long, env = "PARLEY_OLLAMA_URL", default_value = DEFAULT_BASE_URL, global = true)]
    pub url: String,

    /// Owner of the conversations.
    #[arg(long, env = "PARLEY_USER", global = true)]
    pub user: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start an interactive chat.
    Chat {
        /// Continue an existing conversation.
        #[arg(long)]
        conversation: Option<String>,

        /// Keep this chat out of the database.
        #[arg(long, conflicts_with = "conversation")]
        ephemeral: bool,

        /// Model to talk to.
        #[arg(long)]
        model: Option<String>,

        /// File sent along with the first message.
        #[arg(long)]
        attach: Option<PathBuf>,
    },

    /// List stored conversations, most recent first.
    #[command(alias = "ls")]
    Conversations,

    /// Print the messages of a conversation.
    Show { id: String },

    /// Delete a conversation and its messages.
    #[command(alias = "rm")]
    Delete { id: String },

    /// Export a conversation as Markdown.
    Export {
        id: String,

        /// Write to this file instead of stdout.
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// List models available on the server.
    Models,

    /// Show or change stored settings.
    Settings {
        #[arg(long)]
        model: Option<String>,

        #[arg(long)]
        temperature: Option<f32>,

        /// System prompt; pass an empty string to remove it.
        #[arg(long)]
        system_prompt: Option<String>,

        /// Interval between streamed screen updates, in milliseconds.
        #[arg(long)]
        batch_ms: Option<u64>,
    },
}

/// Everything a command needs, opened once.
pub struct AppContext {
    pub ledger: Ledger,
    pub backend: Arc<OllamaProvider>,
    pub settings: AppSettings,
    pub user: String,
}

impl AppContext {
    pub async fn init(cli: &Cli) -> Result<Self> {
        let path = match &cli.db {
            Some(path) => path.clone(),
            None => config::default_db_path()
                .context("Cannot locate a data directory; set PARLEY_DB_PATH")?,
        };
        let db = Database::open(&path)
            .with_context(|| format!("Failed to open database at {}", path.display()))?;
        let settings = SettingsService::load(&db).await;
        let backend = OllamaProvider::new(&cli.url)
            .with_context(|| format!("Invalid server URL '{}'", cli.url))?;

        Ok(Self {
            ledger: Ledger::new(db),
            backend: Arc::new(backend),
            settings,
            user: cli.user.clone().unwrap_or_else(config::default_user),
        })
    }
}

pub async fn run(cli: Cli) -> Result<()> {
    let ctx = AppContext::init(&cli).await?;

    match cli.command {
        Commands::Chat {
            conversation,
            ephemeral,
            model,
            attach,
        } => chat(&ctx, conversation, ephemeral, model, attach).await,
        Commands::Conversations => list_conversations(&ctx).await,
        Commands::Show { id } => show(&ctx, &id).await,
        Commands::Delete { id } => delete(&ctx, &id).await,
        Commands::Export { id, output } => export(&ctx, &id, output).await,
        Commands::Models => models(&ctx).await,
        Commands::Settings {
            model,
            temperature,
            system_prompt,
            batch_ms,
        } => {
            let mut settings = ctx.settings.clone();
            if let Some(model) = model {
                settings.default_model = model;
            }
            if temperature.is_some() {
                settings.temperature = temperature;
            }
            if let Some(prompt) = system_prompt {
                settings.system_prompt = Some(prompt).filter(|p| !p.trim().is_empty());
            }
            if let Some(ms) = batch_ms {
                settings.stream_batch_ms = ms;
            }
            if settings != ctx.settings {
                SettingsService::save(ctx.ledger.database(), &settings).await?;
            }
            println!("{}", serde_json::to_string_pretty(&settings)?);
            Ok(())
        }
    }
}

fn not_found(err: LedgerError, id: &str) -> anyhow::Error {
    match err {
        LedgerError::NotFound(_) => anyhow::anyhow!("Conversation {} not found", id),
        other => other.into(),
    }
}

async fn list_conversations(ctx: &AppContext) -> Result<()> {
    let conversations = ctx.ledger.list_conversations(&ctx.user).await?;
    if conversations.is_empty() {
        println!("No conversations yet.");
        return Ok(());
    }
    for conv in conversations {
        println!(
            "{}  {}  {}",
            conv.id,
            conv.updated_at.format("%Y-%m-%d %H:%M"),
            conv.display_title()
        );
    }
    Ok(())
}

async fn show(ctx: &AppContext, id: &str) -> Result<()> {
    let conversation = ctx
        .ledger
        .conversation(id, &ctx.user)
        .await
        .map_err(|e| not_found(e, id))?;
    let messages = ctx.ledger.list_messages(id, &ctx.user).await?;

    println!("# {}", conversation.display_title());
    for msg in messages {
        println!("\n[{}] {}:\n{}", msg.position, msg.role.as_str(), msg.content);
    }
    Ok(())
}

async fn delete(ctx: &AppContext, id: &str) -> Result<()> {
    ctx.ledger
        .delete_conversation(id, &ctx.user)
        .await
        .map_err(|e| not_found(e, id))?;
    println!("Deleted {}", id);
    Ok(())
}

async fn export(ctx: &AppContext, id: &str, output: Option<PathBuf>) -> Result<()> {
    let conversation = ctx
        .ledger
        .conversation(id, &ctx.user)
        .await
        .map_err(|e| not_found(e, id))?;
    let messages = ctx.ledger.list_messages(id, &ctx.user).await?;
    let markdown = export_to_markdown(&conversation, &messages);

    match output {
        Some(path) => {
            std::fs::write(&path, markdown)
                .with_context(|| format!("Failed to write {}", path.display()))?;
            println!("Exported to {}", path.display());
        }
        None => print!("{}", markdown),
    }
    Ok(())
}

async fn models(ctx: &AppContext) -> Result<()> {
    let models = ctx.backend.list_models().await?;
    if models.is_empty() {
        println!("No models installed.");
    }
    for model in models {
        match model.size {
            Some(size) => println!("{}  ({:.1} GB)", model.name, size as f64 / 1e9),
            None => println!("{}", model.name),
        }
    }
    Ok(())
}

const IMAGE_TYPES: &[(&str, &str)] = &[
    ("png", "image/png"),
    ("jpg", "image/jpeg"),
    ("jpeg", "image/jpeg"),
    ("gif", "image/gif"),
    ("webp", "image/webp"),
];

fn load_attachment(path: &Path) -> Result<Attachment> {
    let data = std::fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string());
    let ext = path
        .extension()
        .map(|e| e.to_string_lossy().to_lowercase())
        .unwrap_or_default();

    if let Some((_, mime)) = IMAGE_TYPES.iter().find(|(e, _)| *e == ext) {
        return Ok(Attachment::image(name, *mime, data));
    }
    let text = String::from_utf8(data)
        .with_context(|| format!("{} is neither an image nor UTF-8 text", path.display()))?;
    Ok(Attachment::text(name, text))
}

/// Next input line, or `None` on EOF or interrupt.
async fn read_line<R, F>(lines: &mut Lines<R>, interrupt: F) -> Result<Option<String>>
where
    R: AsyncBufRead + Unpin,
    F: Future<Output = std::io::Result<()>>,
{
    tokio::select! {
        line = lines.next_line() => Ok(line?),
        _ = interrupt => Ok(None),
    }
}

fn prompt() -> Result<()> {
    print!("> ");
    std::io::stdout().flush()?;
    Ok(())
}

async fn chat(
    ctx: &AppContext,
    conversation: Option<String>,
    ephemeral: bool,
    model: Option<String>,
    attach: Option<PathBuf>,
) -> Result<()> {
    let mut conversation_id = None;
    let mut stored_model = None;
    if let Some(id) = conversation {
        let conv = ctx
            .ledger
            .conversation(&id, &ctx.user)
            .await
            .map_err(|e| not_found(e, &id))?;
        println!("Continuing \"{}\"", conv.display_title());
        stored_model = conv.model;
        conversation_id = Some(id);
    }
    let model = model
        .or(stored_model)
        .unwrap_or_else(|| ctx.settings.default_model.clone());

    let mut attachment = attach.as_deref().map(load_attachment).transpose()?;

    let store: Arc<dyn ConversationStore> = Arc::new(ctx.ledger.clone());
    let backend: Arc<dyn InferenceBackend> = ctx.backend.clone();
    let session = Arc::new(ConversationSession::new(
        store,
        backend,
        ctx.settings.session_config(),
    ));

    if let Some(draft) = ctx.ledger.draft(&ctx.user).await? {
        println!("(saved draft: {})", draft.content);
    }
    println!("Talking to {}. /quit to leave, Ctrl-C stops an answer.", model);

    let mut history: Vec<ChatMessage> = Vec::new();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        prompt()?;
        let Some(line) = read_line(&mut lines, tokio::signal::ctrl_c()).await? else {
            println!();
            break;
        };
        let line = line.trim().to_string();

        match line.as_str() {
            "" => continue,
            "/quit" => break,
            "/clear" => {
                ctx.ledger.clear_draft(&ctx.user).await?;
                println!("Draft cleared.");
                continue;
            }
            "/draft" => {
                match ctx.ledger.draft(&ctx.user).await? {
                    Some(draft) => println!("{}", draft.content),
                    None => println!("No draft."),
                }
                continue;
            }
            _ => {}
        }
        if let Some(text) = line.strip_prefix("/draft ") {
            ctx.ledger
                .save_draft(&ctx.user, conversation_id.as_deref(), text)
                .await?;
            println!("Draft saved.");
            continue;
        }

        let turn = TurnContext {
            user_id: ctx.user.clone(),
            conversation_id: conversation_id.clone(),
            model: model.clone(),
            ephemeral,
            history: history.clone(),
        };
        let mut handle = session.submit_turn(turn, line.clone(), attachment.take());

        let mut shown = String::new();
        loop {
            tokio::select! {
                update = handle.next_update() => match update {
                    Some(TurnUpdate::ConversationCreated(id)) => conversation_id = Some(id),
                    Some(TurnUpdate::Partial(text)) => {
                        if let Some(fresh) = text.strip_prefix(shown.as_str()) {
                            print!("{}", fresh);
                            std::io::stdout().flush()?;
                            shown = text;
                        }
                    }
                    None => break,
                },
                _ = tokio::signal::ctrl_c() => handle.abort(),
            }
        }

        match handle.outcome().await {
            TurnOutcome::Settled {
                text, persisted, ..
            } => {
                if text != shown.trim() {
                    println!("\n\n{}", text);
                } else {
                    println!();
                }
                if !ephemeral && !persisted {
                    eprintln!("(answer could not be saved)");
                }
                if ephemeral {
                    history.push(ChatMessage::user(line));
                    history.push(ChatMessage::assistant(text));
                }
            }
            TurnOutcome::Stopped { .. } => println!("\n[stopped]"),
            TurnOutcome::Failed { error, partial } => {
                if !partial.is_empty() && shown.is_empty() {
                    println!("{}", partial);
                }
                eprintln!("\nError: {}", error);
            }
        }
    }

    Ok(())
}
