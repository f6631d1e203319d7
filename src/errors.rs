use std::any::Any;
use std::error::Error as StdError;
use std::io;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// All errors that can occur during the use of may_remoting.
#[derive(Debug, Error)]
pub enum Error {
    /// Any IO error.
    #[error("IO err: {0}")]
    Io(#[from] io::Error),
    /// Error in serializing a request, a response or an envelope field.
    ///
    /// Typically this indicates a faulty implementation of `serde::Serialize`.
    #[error("serialize err: {0}")]
    Serialize(String),
    /// Error in deserializing a request, a response or an envelope field.
    #[error("deserialize err: {0}")]
    Deserialize(String),
    /// A frame declared a length outside of the accepted range.
    #[error("frame too large: len={len}, max={max}")]
    FrameTooLarge {
        /// the declared or encoded frame length
        len: i64,
        /// the configured maximum
        max: usize,
    },
    /// The peer closed the channel.
    #[error("peer disconnected")]
    PeerDisconnected,
    /// The component was used after it was stopped.
    #[error("illegal state: {0}")]
    IllegalState(String),
    /// No service is registered under the requested id.
    #[error("unknown service: {0}")]
    UnknownService(String),
    /// The service does not expose the requested method.
    #[error("unknown method: {0}")]
    UnknownMethod(String),
    /// The remote side reported a failure for this call.
    #[error("remote failure: {0}")]
    Remote(#[from] RemoteError),
    /// A service method failed, the real cause is wrapped.
    #[error("invocation failed: {0}")]
    Invocation(#[source] Box<dyn StdError + Send + Sync>),
    /// The server was unable to reply to the client within the configured time.
    #[error("the server was unable to reply within the configured time")]
    Timeout,
}

impl Error {
    /// wrap an application error raised by a service method
    pub fn invocation<E>(err: E) -> Self
    where
        E: Into<Box<dyn StdError + Send + Sync>>,
    {
        Error::Invocation(err.into())
    }

    /// the failure kind reported on the wire
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Io(_) => "io",
            Error::Serialize(_) => "serialize",
            Error::Deserialize(_) => "deserialize",
            Error::FrameTooLarge { .. } => "frame-too-large",
            Error::PeerDisconnected => "disconnected",
            Error::IllegalState(_) => "illegal-state",
            Error::UnknownService(_) => "unknown-service",
            Error::UnknownMethod(_) => "unknown-method",
            Error::Remote(_) => "remote",
            Error::Invocation(_) => "application",
            Error::Timeout => "timeout",
        }
    }
}

/// A serializable, server-supplied failure.
///
/// This is what travels in the failure slot of a response frame and what the
/// caller finally gets wrapped in [`Error::Remote`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("{kind}: {message}")]
pub struct RemoteError {
    /// short machine readable category, e.g. `panic` or `unknown-service`
    pub kind: String,
    /// human readable description of the root cause
    pub message: String,
}

impl RemoteError {
    /// create a new remote failure
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        RemoteError {
            kind: kind.into(),
            message: message.into(),
        }
    }

    /// convert a local error into the failure sent back to the caller
    ///
    /// wrapped invocation failures are unwrapped down to their root cause
    pub fn from_error(err: &Error) -> Self {
        match err {
            Error::Remote(remote) => remote.clone(),
            Error::Invocation(cause) => {
                let mut root: &(dyn StdError + 'static) = cause.as_ref();
                while let Some(next) = root.source() {
                    root = next;
                }
                RemoteError::new(err.kind(), root.to_string())
            }
            _ => RemoteError::new(err.kind(), err.to_string()),
        }
    }

    /// convert the payload of a caught panic
    pub fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&'static str>() {
            (*s).to_owned()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "rpc panicked in server!".to_owned()
        };
        RemoteError::new("panic", message)
    }
}

impl From<&Error> for RemoteError {
    fn from(err: &Error) -> Self {
        RemoteError::from_error(err)
    }
}
