//! Crate-wide error type.
//!
//! The transport layers (`xdr`, `rpc`, `vxi11`) speak `io::Result` and any `io::Error`
//! that reaches session code becomes [`Error::SessionUnavailable`] through `?`. Everything
//! above the transport returns [`Result`].

use std::io;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::session::TriggerSource;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("sweep did not complete within {elapsed:?} ({polls} mode reads)")]
    Timeout { elapsed: Duration, polls: usize },

    #[error("instrument session unavailable: {0}")]
    SessionUnavailable(#[from] io::Error),

    #[error("wait for sweep completion interrupted (trigger source: {})", describe_source(.trigger_source))]
    InterruptedWait { trigger_source: Option<TriggerSource> },

    #[error("invalid value for {name}: {reason}")]
    InvalidParameter { name: &'static str, reason: String },

    #[error("unexpected response to {command:?}: {response:?}")]
    UnexpectedResponse { command: String, response: String },

    #[error("no session registered for address {0:?}")]
    UnknownAddress(String),

    #[error("session at {address:?} is still held by {handles} other handle(s)")]
    SessionInUse { address: String, handles: usize },

    #[error("unable to access {}: {source}", .path.display())]
    Storage { path: PathBuf, source: io::Error },

    #[error("configuration error: {0}")]
    Config(#[from] toml::de::Error),
}

impl Error {
    pub(crate) fn invalid(name: &'static str, reason: impl Into<String>) -> Self {
        Error::InvalidParameter { name, reason: reason.into() }
    }

    pub(crate) fn unexpected(command: &str, response: &str) -> Self {
        Error::UnexpectedResponse { command: command.to_owned(), response: response.to_owned() }
    }

    pub(crate) fn storage(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Error::Storage { path: path.into(), source }
    }
}

fn describe_source(source: &Option<TriggerSource>) -> String {
    match source {
        Some(s) => s.to_string(),
        None => "unknown".to_owned(),
    }
}
