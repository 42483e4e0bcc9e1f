//! Multi-user shell server: sessions connect over TCP and run pipelines
//! that can pass output to later command lines (numbered pipes) or to other
//! users (user pipes), and can message each other.

mod config;
mod dispatch;
mod error;
mod executor;
mod fd;
mod mailbox;
pub mod notice;
mod numbered_pipe;
mod outbox;
pub mod parser;
mod process_death;
mod registry;
mod relay;
mod server;
mod session_id;
mod shell;
mod user_pipe;

pub use config::DEFAULT_PATH;
pub use config::DEFAULT_USER_LIMIT;
pub use config::ServerConfig;
pub use error::ConfigError;
pub use error::Result;
pub use error::ShellError;
pub use error::notice_line;
pub use executor::EXIT_NOT_FOUND;
pub use executor::LineStatus;
pub use mailbox::Audience;
pub use mailbox::Consumed;
pub use mailbox::Mailbox;
pub use mailbox::MessageId;
pub use numbered_pipe::NumberedPipeTable;
pub use outbox::Outbox;
pub use outbox::OutboxClosed;
pub use outbox::OutputWriter;
pub use outbox::spawn_writer;
pub use registry::SessionHandle;
pub use registry::SessionInfo;
pub use registry::SessionRegistry;
pub use registry::UNNAMED;
pub use server::Server;
pub use server::ServerServices;
pub use session_id::SessionId;
pub use shell::serve_connection;
pub use user_pipe::UserPipeRegistry;
