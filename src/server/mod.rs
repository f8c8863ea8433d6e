//! Hand-rolled TCP server framework
//!
//! Both the control port and every live-stream port run on
//! [`ConnectionServer`]: an accept loop spawning one task per connection,
//! with line and length based reads on [`Connection`] instead of a full
//! HTTP stack.

pub mod config;
pub mod connection;
pub mod listener;
pub mod response;

pub use config::ServerConfig;
pub use connection::Connection;
pub use listener::{ConnectionHandler, ConnectionServer, ServerStopper};
pub use response::StatusCode;
