#![allow(dead_code)]

use std::net::SocketAddr;
use std::time::Duration;

use npshell_core::Server;
use npshell_core::ServerConfig;
use tokio::io::AsyncReadExt;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;

pub const PROMPT: &str = "% ";
const READ_TIMEOUT: Duration = Duration::from_secs(10);

pub fn test_config(user_limit: usize) -> ServerConfig {
    ServerConfig {
        user_limit,
        default_path: "/bin:/usr/bin".to_string(),
        ..ServerConfig::default()
    }
}

/// Start a server on an ephemeral loopback port.
pub async fn start_server(config: ServerConfig) -> SocketAddr {
    let server = Server::bind(SocketAddr::from(([127, 0, 0, 1], 0)), config)
        .await
        .expect("bind test server");
    let addr = server.local_addr().expect("local addr");
    tokio::spawn(server.run());
    addr
}

/// Line-oriented test client that keeps unread bytes between reads.
pub struct Client {
    stream: TcpStream,
    pending: String,
}

impl Client {
    /// Connect and consume the greeting up to the first prompt.
    pub async fn connect(addr: SocketAddr) -> (Self, String) {
        let stream = TcpStream::connect(addr).await.expect("connect");
        let mut client = Self {
            stream,
            pending: String::new(),
        };
        let greeting = client.read_until(PROMPT).await;
        (client, greeting)
    }

    /// Connect without waiting for a prompt.
    pub async fn connect_raw(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.expect("connect");
        Self {
            stream,
            pending: String::new(),
        }
    }

    pub async fn send(&mut self, line: &str) {
        self.stream
            .write_all(format!("{line}\n").as_bytes())
            .await
            .expect("send line");
    }

    /// Send `line` and return everything up to and including the next prompt.
    pub async fn run(&mut self, line: &str) -> String {
        self.send(line).await;
        self.read_until(PROMPT).await
    }

    /// Read until `needle` has been seen; return the text through it.
    pub async fn read_until(&mut self, needle: &str) -> String {
        let deadline = tokio::time::Instant::now() + READ_TIMEOUT;
        loop {
            if let Some(index) = self.pending.find(needle) {
                let rest = self.pending.split_off(index + needle.len());
                return std::mem::replace(&mut self.pending, rest);
            }
            let mut buf = [0u8; 4096];
            let read = tokio::time::timeout_at(deadline, self.stream.read(&mut buf))
                .await
                .unwrap_or_else(|_| {
                    panic!("timed out waiting for {needle:?}; got {:?}", self.pending)
                })
                .expect("read");
            assert!(
                read > 0,
                "connection closed waiting for {needle:?}; got {:?}",
                self.pending
            );
            self.pending.push_str(&String::from_utf8_lossy(&buf[..read]));
        }
    }

    /// Read through the end of the line containing `needle`.
    pub async fn read_notice(&mut self, needle: &str) -> String {
        let mut text = self.read_until(needle).await;
        text.push_str(&self.read_until("\n").await);
        text
    }

    /// Read until the server closes the connection.
    pub async fn read_to_end(&mut self) -> String {
        let mut rest = Vec::new();
        tokio::time::timeout(READ_TIMEOUT, self.stream.read_to_end(&mut rest))
            .await
            .expect("timed out waiting for close")
            .expect("read");
        let mut text = std::mem::take(&mut self.pending);
        text.push_str(&String::from_utf8_lossy(&rest));
        text
    }
}
