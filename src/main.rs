//! Los Libros Reader
//!
//! `serve` runs the reference progress authority. `open` and `sync` drive the
//! engine against a configured authority from the command line.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use tokio::signal;
use tokio::sync::{broadcast, watch};
use tower_http::cors::{Any, CorsLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use libros_reader::authority::server::{self, ProgressLedger};
use libros_reader::authority::{HttpAuthority, RemoteAuthority};
use libros_reader::container::{ContainerSource, TocEntry};
use libros_reader::store::{PositionStore, SqliteBackend};
use libros_reader::sync::{SyncCoordinator, SyncEvent, SyncWorker};
use libros_reader::{Config, Session, SessionActor, SessionDeps};

const USAGE: &str = "usage:
  libros-reader serve
  libros-reader open <user-id> <book-id> <epub-path|url> [address]
  libros-reader sync <user-id> [book-id]";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "libros_reader=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    dotenvy::dotenv().ok();
    let config = Config::from_env();

    let args: Vec<String> = std::env::args().skip(1).collect();
    match args.iter().map(String::as_str).collect::<Vec<_>>().as_slice() {
        ["serve"] => serve(config).await,
        ["open", user_id, book_id, source] => open(config, user_id, book_id, source, None).await,
        ["open", user_id, book_id, source, address] => {
            open(config, user_id, book_id, source, Some(*address)).await
        }
        ["sync", user_id] => sync_all(config, user_id).await,
        ["sync", user_id, book_id] => sync_book(config, user_id, book_id).await,
        _ => bail!("{}", USAGE),
    }
}

async fn serve(config: Config) -> anyhow::Result<()> {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = server::router(ProgressLedger::new()).layer(cors);

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .context("invalid SERVER_HOST/SERVER_PORT")?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;
    tracing::info!("Progress authority listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Server shutdown complete");
    Ok(())
}

async fn engine(config: &Config) -> anyhow::Result<(PositionStore, Arc<dyn RemoteAuthority>)> {
    let backend = SqliteBackend::connect(&config.database.url)
        .await
        .context("failed to open progress database")?;
    tracing::info!("Progress database at {}", config.database.url);

    let mut authority = HttpAuthority::new(&config.authority.url, config.authority.timeout)
        .context("failed to build authority client")?;
    if let Some(key) = &config.authority.api_key {
        authority = authority.with_api_key(key);
    }

    Ok((PositionStore::new(Arc::new(backend)), Arc::new(authority)))
}

/// Open a book, optionally move to `address`, close it and wait for the
/// background sync to settle
async fn open(
    config: Config,
    user_id: &str,
    book_id: &str,
    source: &str,
    address: Option<&str>,
) -> anyhow::Result<()> {
    let (store, authority) = engine(&config).await?;
    let coordinator = Arc::new(SyncCoordinator::new(
        store.clone(),
        authority.clone(),
        config.engine.clone(),
    ));
    let mut sync_events = coordinator.subscribe();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (sync, worker) = SyncWorker::spawn(
        coordinator.clone(),
        config.engine.sync_debounce,
        shutdown_rx,
    );

    let deps = SessionDeps::new(store.clone(), authority)
        .with_config(config.engine.clone())
        .with_sync(sync);
    let (session, mut events, actor) = SessionActor::new(Session::new(user_id, deps))
        .with_sync_events(coordinator.subscribe())
        .spawn();

    let source = if source.starts_with("http://") || source.starts_with("https://") {
        ContainerSource::Url(source.to_string())
    } else {
        ContainerSource::Path(PathBuf::from(source))
    };

    let snapshot = session.open_book(book_id, source).await?;
    println!("{}", serde_json::to_string_pretty(&session.metadata().await?)?);
    for entry in session.table_of_contents().await? {
        print_toc(&entry, 0);
    }
    println!("{}", serde_json::to_string_pretty(&snapshot)?);

    if let Some(address) = address {
        let position = session.on_position_changed(address).await?;
        println!("{}", serde_json::to_string_pretty(&position)?);
    }
    session.close_book().await?;

    if !store.pending(user_id, book_id).await?.is_empty() {
        tokio::select! {
            _ = settled(&mut sync_events, user_id, book_id) => {}
            _ = shutdown_signal() => {
                tracing::info!("Leaving checkpoints pending for the next sync");
            }
        }
    }

    let _ = shutdown_tx.send(true);
    worker.await?;
    drop(session);
    actor.await?;
    while let Ok(event) = events.try_recv() {
        tracing::debug!(?event, "session event");
    }
    Ok(())
}

/// Wait until a book's checkpoints are accepted or refused
async fn settled(events: &mut broadcast::Receiver<SyncEvent>, user_id: &str, book_id: &str) {
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(_)) => continue,
            Err(broadcast::error::RecvError::Closed) => return,
        };
        if event.user_id() != user_id || event.book_id() != book_id {
            continue;
        }
        match event {
            SyncEvent::Synced {
                remote_time_spent_seconds,
                ..
            } => {
                println!("synced, {}s read in total", remote_time_spent_seconds);
                return;
            }
            SyncEvent::Rejected { reason, .. } => {
                println!("rejected: {}", reason);
                return;
            }
            SyncEvent::Deferred {
                error, retry_in, ..
            } => {
                tracing::info!(?retry_in, "sync deferred: {}", error);
            }
            SyncEvent::Degraded { pending, .. } => {
                tracing::warn!(pending, "sync degraded");
            }
        }
    }
}

fn print_toc(entry: &TocEntry, depth: usize) {
    let section = entry
        .section_index
        .map(|i| format!(" [{}]", i))
        .unwrap_or_default();
    println!("{}{}{}", "  ".repeat(depth), entry.label, section);
    for child in &entry.children {
        print_toc(child, depth + 1);
    }
}

/// Drain one book's pending checkpoints, retrying until Ctrl+C
async fn sync_book(config: Config, user_id: &str, book_id: &str) -> anyhow::Result<()> {
    let (store, authority) = engine(&config).await?;
    let coordinator = SyncCoordinator::new(store, authority, config.engine);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        let _ = shutdown_tx.send(true);
    });

    let outcome = coordinator
        .sync_until_drained(user_id, book_id, shutdown_rx)
        .await?
        .into_result()?;
    println!("{}", serde_json::to_string_pretty(&outcome)?);
    Ok(())
}

/// One push attempt for every book with pending checkpoints
async fn sync_all(config: Config, user_id: &str) -> anyhow::Result<()> {
    let (store, authority) = engine(&config).await?;
    let coordinator = SyncCoordinator::new(store.clone(), authority, config.engine);

    let books = store.books_with_pending(user_id).await?;
    if books.is_empty() {
        tracing::info!(user_id, "nothing to sync");
    }
    let mut failed = 0;
    for book_id in books {
        match coordinator.push_pending(user_id, &book_id).await?.into_result() {
            Ok(outcome) => println!("{}: {}", book_id, serde_json::to_string(&outcome)?),
            Err(e) => {
                tracing::error!(%book_id, "{}", e);
                failed += 1;
            }
        }
    }
    if failed > 0 {
        bail!("{} book(s) did not sync", failed);
    }
    Ok(())
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, starting graceful shutdown...");
        },
        _ = terminate => {
            tracing::info!("Received SIGTERM, starting graceful shutdown...");
        },
    }
}
