use anyhow::{Context, Result};
use parking_lot::Mutex;
use std::{net::SocketAddr, sync::Arc, time::Duration};
use tokio::{
    net::TcpListener,
    sync::{Mutex as AsyncMutex, Semaphore},
    task::JoinHandle,
};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{debug, info, warn};

use crate::config::{ResourceLimits, ServerConfig};
use crate::connection::{handle_connection, ConnectionContext};
use crate::engine::EngineHandle;
use crate::error::ServerError;
use crate::governor::{self, GovernorHandle};

/// A running zerodb server.
///
/// ## Task Layout
/// ```text
/// accept task ──spawn──▶ connection task (one per client, holds a permit)
///      │                        │
///      │                        ▼
///      │                  EngineHandle (one statement at a time)
///      │                        ▲
/// governor task ─── idle? release()
/// ```
///
/// Sockets accepted while all `max_connections` permits are taken are closed
/// at once, before any handshake byte is written.
pub struct Server {
    local_addr: SocketAddr,
    limits: ResourceLimits,
    engine: Arc<EngineHandle>,
    governor: GovernorHandle,
    permits: Arc<Semaphore>,
    handlers: TaskTracker,
    handler_shutdown: CancellationToken,
    accept_shutdown: CancellationToken,
    accept_task: Mutex<Option<JoinHandle<()>>>,
    stopped: AsyncMutex<bool>,
}

impl Server {
    /// Opens the engine, binds the listener and starts the governor and the
    /// accept loop.
    pub async fn start(config: ServerConfig) -> Result<Self> {
        let limits = config.limits();
        Self::start_with_limits(config, limits).await
    }

    /// Like [`start`](Self::start) with explicit limits, for sub-second
    /// idle thresholds and ticks.
    pub async fn start_with_limits(config: ServerConfig, limits: ResourceLimits) -> Result<Self> {
        let engine = EngineHandle::open(&config.storage_path, config.buffer_pool_pages)
            .await
            .with_context(|| format!("opening storage engine at {}", config.storage_path))?;
        let engine = Arc::new(engine);

        let addr = config.listen_addr();
        let listener = match TcpListener::bind(&addr).await {
            Ok(listener) => listener,
            Err(e) => {
                if let Err(close) = engine.close().await {
                    warn!(error = %close, "closing engine after failed bind");
                }
                return Err(e).with_context(|| format!("binding {}", addr));
            }
        };
        let local_addr = listener.local_addr()?;
        info!(
            %local_addr,
            storage = %config.storage_path,
            max_connections = limits.max_connections,
            idle_timeout = ?limits.idle_threshold,
            "listening"
        );

        let governor = governor::spawn(engine.clone(), limits);
        let permits = Arc::new(Semaphore::new(limits.max_connections));
        let handlers = TaskTracker::new();
        let handler_shutdown = CancellationToken::new();
        let accept_shutdown = CancellationToken::new();

        let acceptor = Acceptor {
            listener,
            engine: engine.clone(),
            permits: permits.clone(),
            max_connections: limits.max_connections,
            handlers: handlers.clone(),
            handler_shutdown: handler_shutdown.clone(),
            server_version: config.server_version.clone(),
        };
        let accept_task = tokio::spawn(acceptor.run(accept_shutdown.clone()));

        Ok(Self {
            local_addr,
            limits,
            engine,
            governor,
            permits,
            handlers,
            handler_shutdown,
            accept_shutdown,
            accept_task: Mutex::new(Some(accept_task)),
            stopped: AsyncMutex::new(false),
        })
    }

    /// The bound address; reports the real port when configured with 0.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn limits(&self) -> ResourceLimits {
        self.limits
    }

    pub fn engine(&self) -> &Arc<EngineHandle> {
        &self.engine
    }

    pub fn governor(&self) -> &GovernorHandle {
        &self.governor
    }

    /// Connections currently holding a permit.
    pub fn active_connections(&self) -> usize {
        self.limits.max_connections - self.permits.available_permits()
    }

    /// Stops the server, in order:
    /// 1. stop the accept loop, closing the listener
    /// 2. cancel connection handlers and wait for them
    /// 3. stop the governor
    /// 4. close the engine
    ///
    /// Calling it again is a no-op.
    pub async fn stop(&self) -> Result<()> {
        let mut stopped = self.stopped.lock().await;
        if *stopped {
            return Ok(());
        }
        *stopped = true;
        info!(active = self.active_connections(), "stopping server");

        self.stop_accepting().await;

        self.handler_shutdown.cancel();
        self.handlers.close();
        self.handlers.wait().await;
        debug!("connection handlers finished");

        self.governor.stop().await;
        self.engine.close().await?;
        info!("server stopped");
        Ok(())
    }

    /// Ends the accept loop and waits for it, dropping the listener. No
    /// client connecting afterwards is greeted.
    async fn stop_accepting(&self) {
        self.accept_shutdown.cancel();
        let accept_task = self.accept_task.lock().take();
        if let Some(task) = accept_task {
            if let Err(e) = task.await {
                warn!(error = %e, "accept task ended abnormally");
            }
        }
    }

    pub async fn is_stopped(&self) -> bool {
        *self.stopped.lock().await
    }
}

struct Acceptor {
    listener: TcpListener,
    engine: Arc<EngineHandle>,
    permits: Arc<Semaphore>,
    max_connections: usize,
    handlers: TaskTracker,
    handler_shutdown: CancellationToken,
    server_version: String,
}

impl Acceptor {
    async fn run(self, shutdown: CancellationToken) {
        let mut next_id: u32 = 1;
        loop {
            let accepted = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                accepted = self.listener.accept() => accepted,
            };
            let (socket, peer) = match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    continue;
                }
            };

            let Ok(permit) = self.permits.clone().try_acquire_owned() else {
                let err = ServerError::Capacity { max: self.max_connections };
                warn!(%peer, error = %err, "rejecting connection");
                drop(socket);
                continue;
            };

            let id = next_id;
            next_id = next_id.checked_add(1).unwrap_or(1);
            let ctx = ConnectionContext {
                id,
                engine: self.engine.clone(),
                server_version: self.server_version.clone(),
                shutdown: self.handler_shutdown.clone(),
            };
            self.handlers.spawn(async move {
                let _permit = permit;
                if let Err(e) = socket.set_nodelay(true) {
                    debug!(conn = id, error = %e, "set_nodelay failed");
                }
                debug!(conn = id, %peer, "accepted");
                match handle_connection(socket, ctx).await {
                    Ok(()) => debug!(conn = id, %peer, "client disconnected"),
                    Err(e) => warn!(conn = id, %peer, error = %e, "connection ended with error"),
                }
            });
        }
        info!("accept loop stopped");
    }
}

/// Starts a server, waits for Ctrl-C or SIGTERM, then stops it.
pub async fn run_until_shutdown(config: ServerConfig) -> Result<()> {
    let server = Server::start(config).await?;
    shutdown_signal().await;
    server.stop().await
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "cannot listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Ctrl-C received"),
        _ = terminate => info!("SIGTERM received"),
    }
}
