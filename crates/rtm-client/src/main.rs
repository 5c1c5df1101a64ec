//! rtm-cli -- inspect routing, open a session, browse the local store.
//!
//! Usage:
//!   rtm-cli route                      # Resolve the gateway endpoint
//!   rtm-cli open                       # Open a session, log events until Ctrl-C
//!   rtm-cli conversations              # List stored conversations
//!   rtm-cli history <conversation>     # Print stored messages

use clap::{Parser, Subcommand, ValueEnum};
use std::sync::Arc;

use rtm_client::config::ClientConfig;
use rtm_client::http::{HttpClient, ReqwestHttp, SignatureProvider, UserSessionSigner};
use rtm_client::router::Router;
use rtm_client::transport::TcpConnector;
use rtm_client::{expand_tilde, ConnectionRegistry, OpenMode, Session, SessionEvent};
use rtm_storage::{
    ConversationOrder, LocalStore, MessageRange, QueryDirection, SqliteLocalStore,
};

#[derive(Parser)]
#[command(name = "rtm-cli", about = "Real-time messaging client")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "~/.rtm/config.toml")]
    config: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Resolve and print the router table
    Route,
    /// Open a session and log events until Ctrl-C
    Open {
        /// User session token used to sign the open
        #[arg(long)]
        session_token: Option<String>,
        /// Resume without kicking other devices using the same tag
        #[arg(long)]
        reconnect: bool,
    },
    /// List stored conversations
    Conversations {
        #[arg(long, value_enum, default_value_t = Order::LastMessage)]
        order: Order,
    },
    /// Print stored messages of a conversation, newest first
    History {
        conversation: String,
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum Order {
    LastMessage,
    Updated,
    Created,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "rtm_client=info".into()),
        )
        .init();

    let cli = Cli::parse();
    let cfg = ClientConfig::load_or_default(&expand_tilde(&cli.config))?;

    match cli.command {
        Commands::Route => {
            let http: Arc<dyn HttpClient> =
                Arc::new(ReqwestHttp::new(&cfg.app.app_id, &cfg.app.app_key)?);
            let cache_dir = cfg.client.router_cache.as_deref().map(expand_tilde);
            let router = Router::new(http, &cfg.app.router_server, &cfg.app.app_id, cache_dir.as_deref());
            let table = router.route().await?;
            println!("{}", serde_json::to_string_pretty(&table)?);
        }
        Commands::Open {
            session_token,
            reconnect,
        } => run_session(cfg, session_token, reconnect).await?,
        Commands::Conversations { order } => {
            let store = open_store(&cfg)?;
            let order = match order {
                Order::LastMessage => ConversationOrder::LastMessageSentTimestamp,
                Order::Updated => ConversationOrder::UpdatedTimestamp,
                Order::Created => ConversationOrder::CreatedTimestamp,
            };
            for stored in store.list_conversations(order)? {
                let name = stored.row.raw_data.get("name").and_then(|v| v.as_str()).unwrap_or("-");
                let last = stored
                    .last_message
                    .as_ref()
                    .map(|m| m.sent_timestamp.to_string())
                    .unwrap_or_else(|| "-".into());
                let outdated = if stored.row.outdated { " (outdated)" } else { "" };
                println!("{}\t{}\tlast={}{}", stored.row.id, name, last, outdated);
            }
        }
        Commands::History {
            conversation,
            limit,
        } => {
            let store = open_store(&cfg)?;
            let page = store.select_messages(&MessageRange {
                conversation_id: conversation,
                start: None,
                end: None,
                direction: QueryDirection::NewToOld,
                limit,
            })?;
            for row in page.messages.iter().rev() {
                println!(
                    "{}\t{}\t{}\t{}{}",
                    row.sent_timestamp,
                    row.message_id,
                    row.from_peer_id.as_deref().unwrap_or("-"),
                    row.content.as_deref().unwrap_or(""),
                    if row.breakpoint { "\t[breakpoint]" } else { "" },
                );
            }
            if page.has_breakpoint {
                eprintln!("history may be incomplete; fetch from the server to fill gaps");
            }
        }
    }

    Ok(())
}

fn open_store(cfg: &ClientConfig) -> anyhow::Result<SqliteLocalStore> {
    let path = cfg
        .client
        .database
        .as_deref()
        .ok_or_else(|| anyhow::anyhow!("no database configured"))?;
    Ok(SqliteLocalStore::open(&expand_tilde(path))?)
}

async fn run_session(
    cfg: ClientConfig,
    session_token: Option<String>,
    reconnect: bool,
) -> anyhow::Result<()> {
    let http: Arc<dyn HttpClient> = Arc::new(ReqwestHttp::new(&cfg.app.app_id, &cfg.app.app_key)?);
    let registry = ConnectionRegistry::new(
        Arc::new(TcpConnector),
        http.clone(),
        cfg.app.router_server.clone(),
        cfg.client.router_cache.as_deref().map(expand_tilde),
    );
    let store: Option<Arc<dyn LocalStore>> = match &cfg.client.database {
        Some(_) => Some(Arc::new(open_store(&cfg)?)),
        None => None,
    };
    let signer: Option<Arc<dyn SignatureProvider>> = session_token.map(|token| {
        Arc::new(UserSessionSigner::new(http.clone(), cfg.app.api_server.clone(), token))
            as Arc<dyn SignatureProvider>
    });

    let session = Session::new(&cfg, registry, store, signer)?;
    let mut events = session.events();
    let mode = if reconnect {
        OpenMode::Reconnect
    } else {
        OpenMode::Forced
    };

    tracing::info!(
        client = %session.client_id(),
        app = %cfg.app.app_id,
        version = env!("CARGO_PKG_VERSION"),
        "starting rtm-cli session"
    );
    session.open(mode).await?;

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(SessionEvent::Conversation { conversation, event }) => {
                    tracing::info!(conversation = %conversation.id(), ?event, "event");
                }
                Ok(SessionEvent::DidClose(error)) => {
                    tracing::warn!(code = error.code(), "session closed by server: {error}");
                    return Ok(());
                }
                Ok(other) => tracing::info!(event = ?other, "session event"),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!("event stream lagged, missed {n} events");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => return Ok(()),
            },
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("shutting down");
                break;
            }
        }
    }

    if let Err(e) = session.close().await {
        tracing::warn!("close failed: {e}");
    }
    Ok(())
}
