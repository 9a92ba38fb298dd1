use std::io;

use thiserror::Error;

/// Connection-level failures. These are caught at the top of the client
/// handler and never reach the worker accept loop.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// The upstream dial was rejected or timed out.
    #[error("error while connecting: {0}")]
    Connect(String),

    /// No bytes arrived from the connected server within the configured
    /// inactivity window.
    #[error("inactivity timeout")]
    Inactivity,

    #[error("socket error: {0}")]
    Socket(#[from] io::Error),

    #[error("route decision rejected: {0}")]
    Decision(#[from] super::route::DecisionError),

    /// The pipe was closed by a rewriter; further reads/writes are refused.
    #[error("pipe is closed")]
    Closed,
}
