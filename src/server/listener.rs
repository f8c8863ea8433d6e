//! Connection server
//!
//! Binds one listener per configured address family on a single port and
//! hands every accepted socket to a [`ConnectionHandler`] on its own task.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;

use crate::error::{Error, Result};
use crate::server::config::ServerConfig;
use crate::server::connection::Connection;

/// Application side of a connection server
pub trait ConnectionHandler: Send + Sync + 'static {
    /// Serve one client until it is done. Errors abort only this connection.
    fn handle(&self, conn: Connection) -> impl Future<Output = Result<()>> + Send;

    /// Called once after the accept loops exit
    fn cleanup(&self) {}
}

/// Accept loop over one or more listeners
pub struct ConnectionServer<H: ConnectionHandler> {
    config: ServerConfig,
    handler: Arc<H>,
    listeners: Vec<TcpListener>,
    next_conn_id: Arc<AtomicU64>,
    connection_semaphore: Option<Arc<Semaphore>>,
    stop_tx: watch::Sender<bool>,
}

impl<H: ConnectionHandler> ConnectionServer<H> {
    /// Bind every configured address. Addresses that fail are skipped;
    /// failing all of them is an error.
    pub async fn bind(config: ServerConfig, handler: H) -> Result<Self> {
        let mut listeners = Vec::new();
        for ip in &config.bind_addrs {
            let addr = SocketAddr::new(*ip, config.port);
            match TcpListener::bind(addr).await {
                Ok(listener) => {
                    tracing::info!(addr = %addr, "Listening");
                    listeners.push(listener);
                }
                Err(e) => tracing::debug!(addr = %addr, error = %e, "Bind failed"),
            }
        }
        if listeners.is_empty() {
            return Err(Error::Bind { port: config.port });
        }

        let connection_semaphore = if config.max_connections > 0 {
            Some(Arc::new(Semaphore::new(config.max_connections)))
        } else {
            None
        };
        let (stop_tx, _) = watch::channel(false);

        Ok(Self {
            config,
            handler: Arc::new(handler),
            listeners,
            next_conn_id: Arc::new(AtomicU64::new(1)),
            connection_semaphore,
            stop_tx,
        })
    }

    /// Port actually bound (useful with port 0)
    pub fn local_port(&self) -> u16 {
        self.listeners
            .first()
            .and_then(|l| l.local_addr().ok())
            .map(|a| a.port())
            .unwrap_or(self.config.port)
    }

    pub fn handler(&self) -> &Arc<H> {
        &self.handler
    }

    /// Handle that makes [`run`](Self::run) return
    pub fn stopper(&self) -> ServerStopper {
        ServerStopper {
            tx: self.stop_tx.clone(),
        }
    }

    /// Accept until stopped, then call the handler's cleanup hook.
    ///
    /// In-flight connections are not cancelled; they finish on their own.
    pub async fn run(self) {
        let port = self.local_port();
        let mut loops = JoinSet::new();
        for listener in self.listeners {
            loops.spawn(accept_loop(
                listener,
                self.config.clone(),
                Arc::clone(&self.handler),
                Arc::clone(&self.next_conn_id),
                self.connection_semaphore.clone(),
                self.stop_tx.subscribe(),
            ));
        }
        while loops.join_next().await.is_some() {}

        self.handler.cleanup();
        tracing::debug!(port = port, "Server stopped");
    }
}

/// Stops a running [`ConnectionServer`]
#[derive(Debug, Clone)]
pub struct ServerStopper {
    tx: watch::Sender<bool>,
}

impl ServerStopper {
    /// Idempotent
    pub fn stop(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_stopped(&self) -> bool {
        *self.tx.borrow()
    }
}

async fn accept_loop<H: ConnectionHandler>(
    listener: TcpListener,
    config: ServerConfig,
    handler: Arc<H>,
    next_conn_id: Arc<AtomicU64>,
    semaphore: Option<Arc<Semaphore>>,
    mut stop: watch::Receiver<bool>,
) {
    loop {
        if *stop.borrow_and_update() {
            break;
        }
        let accepted = tokio::select! {
            changed = stop.changed() => {
                if changed.is_err() {
                    break;
                }
                continue;
            }
            accepted = listener.accept() => accepted,
        };
        match accepted {
            Ok((socket, peer)) => {
                spawn_connection(socket, peer, &config, &handler, &next_conn_id, &semaphore);
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to accept connection");
            }
        }
    }
}

fn spawn_connection<H: ConnectionHandler>(
    socket: TcpStream,
    peer: SocketAddr,
    config: &ServerConfig,
    handler: &Arc<H>,
    next_conn_id: &AtomicU64,
    semaphore: &Option<Arc<Semaphore>>,
) {
    // Check connection limit
    let permit = if let Some(sem) = semaphore {
        match sem.clone().try_acquire_owned() {
            Ok(permit) => Some(permit),
            Err(_) => {
                tracing::warn!(peer = %peer, "Connection rejected: limit reached");
                return;
            }
        }
    } else {
        None
    };

    let conn_id = next_conn_id.fetch_add(1, Ordering::Relaxed);
    tracing::debug!(conn_id = conn_id, peer = %peer, "New connection");

    if config.tcp_nodelay {
        if let Err(e) = socket.set_nodelay(true) {
            tracing::debug!(error = %e, "Failed to set TCP_NODELAY");
        }
    }

    let handler = Arc::clone(handler);
    tokio::spawn(async move {
        let _permit = permit;
        let connection = Connection::new(conn_id, socket, Some(peer));
        if let Err(e) = handler.handle(connection).await {
            tracing::debug!(conn_id = conn_id, error = %e, "Connection error");
        }
        tracing::debug!(conn_id = conn_id, "Connection closed");
    });
}
