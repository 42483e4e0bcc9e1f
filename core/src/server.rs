use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::info;
use tracing::warn;

use crate::config::ServerConfig;
use crate::mailbox::Mailbox;
use crate::registry::SessionRegistry;
use crate::shell::serve_connection;
use crate::user_pipe::UserPipeRegistry;

/// The structures every session shares. Each guards itself; none is ever
/// locked while another is held.
#[derive(Debug)]
pub struct ServerServices {
    pub sessions: SessionRegistry,
    pub user_pipes: UserPipeRegistry,
    pub mailbox: Mailbox,
    pub config: ServerConfig,
}

impl ServerServices {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            sessions: SessionRegistry::new(config.user_limit),
            user_pipes: UserPipeRegistry::new(),
            mailbox: Mailbox::new(config.mailbox_stall_timeout()),
            config,
        }
    }
}

pub struct Server {
    listener: TcpListener,
    services: Arc<ServerServices>,
}

impl Server {
    pub async fn bind(addr: SocketAddr, config: ServerConfig) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            services: Arc::new(ServerServices::new(config)),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn services(&self) -> Arc<ServerServices> {
        Arc::clone(&self.services)
    }

    /// Accept connections forever.
    pub async fn run(self) {
        self.run_until(std::future::pending::<()>()).await;
    }

    /// Accept connections until `shutdown` resolves. Sessions already
    /// running are left to finish on the runtime.
    pub async fn run_until(self, shutdown: impl Future<Output = ()>) {
        tokio::pin!(shutdown);
        info!(addr = ?self.local_addr().ok(), "accepting connections");
        loop {
            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        tokio::spawn(serve_connection(Arc::clone(&self.services), stream, addr));
                    }
                    // Transient (e.g. out of descriptors); keep accepting.
                    Err(err) => warn!(error = %err, "accept failed"),
                },
                () = &mut shutdown => {
                    info!("shutdown requested; no longer accepting connections");
                    break;
                }
            }
        }
    }
}
