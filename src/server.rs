//! TCP accept loop driving the engine's task queue

use anyhow::{Context, Result};
use std::io;
use std::net::TcpListener;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{info, warn};

use crate::config::ServerConfig;
use crate::engine::{Engine, Task};
use crate::journal::TransferJournal;
use crate::scheduler::{Clock, SystemClock, TaskQueue};
use crate::store::{FsStore, Store};
use crate::transport::TcpTransport;

/// Accept any pending connections without blocking.
fn accept_pending<S: Store, C: Clock>(
    listener: &TcpListener,
    engine: &mut Engine<S, C>,
    queue: &mut TaskQueue<Task>,
) -> usize {
    let mut accepted = 0;
    loop {
        match listener.accept() {
            Ok((stream, addr)) => match TcpTransport::new(stream) {
                Ok(transport) => {
                    engine.accept(queue, Box::new(transport));
                    accepted += 1;
                }
                Err(e) => warn!(%addr, error = %e, "failed to configure connection"),
            },
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(e) => {
                warn!(error = %e, "accept failed");
                break;
            }
        }
    }
    accepted
}

/// Run the scheduler until `shutdown` is set. One queued step runs per
/// iteration; new connections are picked up between steps.
pub fn serve<S: Store, C: Clock>(
    listener: TcpListener,
    engine: &mut Engine<S, C>,
    shutdown: &AtomicBool,
    idle_poll_ms: u64,
) -> Result<()> {
    listener.set_nonblocking(true).context("Failed to make listener non-blocking")?;
    let mut queue = TaskQueue::new();
    while !shutdown.load(Ordering::SeqCst) {
        let accepted = accept_pending(&listener, engine, &mut queue);
        if !engine.step(&mut queue) && accepted == 0 {
            engine.clock().sleep_ms(idle_poll_ms);
        }
    }
    info!(sessions = engine.session_count(), "shutting down");
    engine.close_all();
    Ok(())
}

/// Open the on-disk store, seeding the configured admin on first start.
pub fn open_store(config: &ServerConfig) -> Result<FsStore> {
    std::fs::create_dir_all(&config.root)
        .with_context(|| format!("Failed to create store root: {}", config.root.display()))?;
    let mut store = FsStore::open(&config.root)
        .with_context(|| format!("Failed to open store at {}", config.root.display()))?;
    if store.catalog().is_empty() {
        match &config.admin {
            Some(admin) => {
                store
                    .add_subject(&admin.name, &admin.password, true)
                    .context("Failed to create admin subject")?;
                info!(subject = %admin.name, "created admin subject");
            }
            None => warn!("catalog has no subjects and no [admin] is configured; nobody can authenticate"),
        }
    }
    Ok(store)
}

/// Bind, build the engine and serve until `shutdown` is set.
pub fn run(config: &ServerConfig, shutdown: &AtomicBool) -> Result<()> {
    let store = open_store(config)?;
    let mut engine = Engine::new(config.engine_settings(), store, SystemClock::default());
    if let Some(path) = &config.journal {
        info!(path = %path.display(), "transfer journal enabled");
        engine = engine.with_journal(TransferJournal::new(path));
    }
    let listener =
        TcpListener::bind(&config.bind).with_context(|| format!("Failed to bind {}", config.bind))?;
    info!(bind = %config.bind, root = %config.root.display(), version = %config.version, "spmd listening");
    serve(listener, &mut engine, shutdown, config.idle_poll_ms)
}
