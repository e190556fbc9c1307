use std::{
    net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use log::{debug, info, warn};

use crate::{
    config::ServerConfig,
    engine::{AllowAll, Authenticator, Engine},
};

use super::{ConnectionSession, ThreadPool, transport::TransportError};

/// Accepts connections and runs one [`ConnectionSession`] per connection on a worker pool.
pub struct Server {
    listener: TcpListener,
    config: Arc<ServerConfig>,
    engine: Arc<dyn Engine>,
    authenticator: Arc<dyn Authenticator>,
    pool: ThreadPool,
    shutdown: Arc<AtomicBool>,
}

/// Stops a running [`Server::listen`] loop from another thread.
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    flag: Arc<AtomicBool>,
    address: SocketAddr,
}

impl ShutdownHandle {
    pub fn shutdown(&self) {
        self.flag.store(true, Ordering::Release);
        // Wake the blocking accept.
        if let Err(e) = TcpStream::connect(self.address) {
            debug!("shutdown wake-up connection failed: {e}");
        }
    }
}

impl Server {
    pub fn bind(
        address: impl ToSocketAddrs,
        config: ServerConfig,
        engine: Arc<dyn Engine>,
    ) -> Result<Self, TransportError> {
        let listener = TcpListener::bind(address)?;
        Ok(Self {
            listener,
            pool: ThreadPool::new("connection", config.workers.max(1)),
            config: Arc::new(config),
            engine,
            authenticator: Arc::new(AllowAll),
            shutdown: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn with_authenticator(mut self, authenticator: Arc<dyn Authenticator>) -> Self {
        self.authenticator = authenticator;
        self
    }

    pub fn local_addr(&self) -> Result<SocketAddr, TransportError> {
        Ok(self.listener.local_addr()?)
    }

    pub fn shutdown_handle(&self) -> Result<ShutdownHandle, TransportError> {
        Ok(ShutdownHandle {
            flag: Arc::clone(&self.shutdown),
            address: self.local_addr()?,
        })
    }

    /// Serves until shut down. Returns once every open connection has finished.
    pub fn listen(self) -> Result<(), TransportError> {
        info!(
            "{} listening at {} with {} connection workers",
            self.config.name,
            self.local_addr()?,
            self.pool.size()
        );

        for stream in self.listener.incoming() {
            if self.shutdown.load(Ordering::Acquire) {
                info!("shutting down, waiting for open connections");
                break;
            }

            match stream {
                Ok(stream) => {
                    let engine = Arc::clone(&self.engine);
                    let authenticator = Arc::clone(&self.authenticator);
                    let config = Arc::clone(&self.config);
                    let res = self.pool.execute(move || {
                        handle_connection(stream, engine, authenticator, config)
                    });
                    if let Err(e) = res {
                        warn!("dropping connection: {e}");
                    }
                }
                Err(e) => warn!("broken connection: {e:?}"),
            }
        }
        Ok(())
    }
}

fn handle_connection(
    stream: TcpStream,
    engine: Arc<dyn Engine>,
    authenticator: Arc<dyn Authenticator>,
    config: Arc<ServerConfig>,
) {
    let peer = stream
        .peer_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|_| "unknown peer".to_string());
    debug!("accepted connection from {peer}");

    let session = ConnectionSession::new(stream, engine, authenticator, config);
    match session.run() {
        Ok(()) => debug!("connection from {peer} closed"),
        Err(e) => warn!("connection from {peer} terminated: {e}"),
    }
}
