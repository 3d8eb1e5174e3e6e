//! RideChat CLI
//!
//! Headless client for the ride chat: watch live traffic and the unread
//! badge, send a message, read history, list and delete conversations.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use chrono::Local;
use clap::{Parser, Subcommand};
use ridechat_core::{
    ChatClient, ClientConfig, Conversation, ConversationKey, Credentials, EmpId, Message,
    PushEvent, RideId,
};
use tokio::sync::mpsc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// RideChat terminal client
#[derive(Parser)]
#[command(name = "ridechat-cli")]
#[command(about = "Ride chat from the terminal")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file path (JSON); defaults to the user config directory
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Bearer token; falls back to RIDECHAT_TOKEN
    #[arg(long)]
    token: Option<String>,

    /// Local employee id
    #[arg(long)]
    me: i64,
}

#[derive(Subcommand)]
enum Commands {
    /// Print live chat events and badge changes until Ctrl-C
    Watch,

    /// Send one message
    Send {
        #[arg(long)]
        ride: i64,

        /// Counterpart employee id
        #[arg(long)]
        to: i64,

        text: String,
    },

    /// Print a conversation's history, oldest first
    History {
        #[arg(long)]
        ride: i64,

        /// Counterpart employee id
        #[arg(long)]
        with: i64,

        /// Number of pages to fetch
        #[arg(long, default_value_t = 1)]
        pages: u32,

        /// Print raw JSON instead of lines
        #[arg(long)]
        json: bool,
    },

    /// List conversations, most recent first
    List,

    /// Delete a conversation for both participants
    Delete {
        #[arg(long)]
        ride: i64,

        /// Counterpart employee id
        #[arg(long)]
        with: i64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "ridechat_cli=info,ridechat_core=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    let config_path = cli.config.clone().unwrap_or_else(default_config_path);
    let config = ClientConfig::load(&config_path)
        .with_context(|| format!("loading config from {:?}", config_path))?;
    tracing::debug!("Using config {:?}", config_path);

    let token = cli
        .token
        .clone()
        .or_else(|| std::env::var("RIDECHAT_TOKEN").ok())
        .context("no token given (use --token or RIDECHAT_TOKEN)")?;

    let me = EmpId(cli.me);
    let client = ChatClient::new(config, me, Credentials::with_token(token))?;

    match cli.command {
        Commands::Watch => watch(&client).await?,
        Commands::Send { ride, to, text } => {
            send(&client, ConversationKey::new(RideId(ride), EmpId(to)), &text).await?
        }
        Commands::History {
            ride,
            with,
            pages,
            json,
        } => history(&client, ConversationKey::new(RideId(ride), EmpId(with)), pages, json).await?,
        Commands::List => list(&client).await?,
        Commands::Delete { ride, with } => {
            let key = ConversationKey::new(RideId(ride), EmpId(with));
            client.delete_conversation(key).await?;
            println!("Deleted conversation {}", key);
        }
    }

    client.shutdown();
    Ok(())
}

fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("ridechat")
        .join("config.json")
}

async fn watch(client: &ChatClient) -> anyhow::Result<()> {
    if let Err(e) = client.refresh_conversations().await {
        tracing::warn!("Could not load conversations: {}", e);
    }

    let me = client.me();
    let _printer = client.add_listener(move |event| match event {
        PushEvent::ChatMessage(msg) => println!("{}", format_message(msg, me)),
        PushEvent::ReadReceipt {
            ride_id,
            reader,
            up_to,
        } => println!(
            "ride {}: {} read up to {}",
            ride_id,
            reader,
            up_to.with_timezone(&Local).format("%H:%M:%S")
        ),
        PushEvent::Closed { ride_id } => println!("ride {}: chat closed", ride_id),
        PushEvent::Deleted { ride_id, by, .. } => {
            println!("ride {}: conversation deleted by {}", ride_id, by)
        }
    });
    client.start();

    let mut badge = client.badge();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            changed = badge.changed() => {
                if changed.is_err() {
                    break;
                }
                println!("unread: {}", *badge.borrow_and_update());
            }
        }
    }
    tracing::info!("Stopping");
    Ok(())
}

async fn send(client: &ChatClient, key: ConversationKey, text: &str) -> anyhow::Result<()> {
    if let Err(e) = client.refresh_conversations().await {
        tracing::warn!("Could not load conversations: {}", e);
    }

    // The server echoes accepted messages back to the sender.
    let (tx, mut echoed) = mpsc::unbounded_channel();
    let me = client.me();
    let _echo = client.add_listener(move |event| {
        if let PushEvent::ChatMessage(msg) = event {
            if msg.is_from(me) && msg.conversation_key(me) == key {
                let _ = tx.send(msg.clone());
            }
        }
    });

    client.send_message(key, text)?;

    match tokio::time::timeout(Duration::from_secs(10), echoed.recv()).await {
        Ok(Some(msg)) => println!("{}", format_message(&msg, me)),
        _ => tracing::warn!("No confirmation from server, message may not have been delivered"),
    }
    Ok(())
}

async fn history(client: &ChatClient, key: ConversationKey, pages: u32, json: bool) -> anyhow::Result<()> {
    for _ in 0..pages.max(1) {
        if client.load_older(key).await?.is_none() {
            break;
        }
    }

    let messages = client.messages(&key);
    if json {
        println!("{}", serde_json::to_string_pretty(&messages)?);
    } else {
        for msg in &messages {
            println!("{}", format_message(msg, client.me()));
        }
    }
    Ok(())
}

async fn list(client: &ChatClient) -> anyhow::Result<()> {
    client.refresh_conversations().await?;
    for conversation in client.conversations() {
        println!("{}", format_conversation(&conversation));
    }
    Ok(())
}

fn format_message(msg: &Message, me: EmpId) -> String {
    let who = if msg.is_from(me) {
        "me".to_string()
    } else {
        msg.from_id.to_string()
    };
    let read = if msg.is_from(me) && msg.read { " (read)" } else { "" };
    format!(
        "[{}] ride {} {}: {}{}",
        msg.timestamp.with_timezone(&Local).format("%Y-%m-%d %H:%M"),
        msg.ride_id,
        who,
        msg.content,
        read
    )
}

fn format_conversation(conversation: &Conversation) -> String {
    let name = conversation
        .counterpart_name
        .clone()
        .unwrap_or_else(|| format!("emp {}", conversation.key.counterpart_id));
    let mut line = format!("ride {:<6} {:<20}", conversation.key.ride_id.0, name);
    if conversation.unread_count > 0 {
        line.push_str(&format!(" [{} unread]", conversation.unread_count));
    }
    if conversation.closed {
        line.push_str(" [closed]");
    }
    if let Some(preview) = &conversation.last_preview {
        line.push_str(&format!("  {}", preview));
    }
    line
}
