//! Error types for channel operations and the runtime.

use std::any::Any;
use std::fmt;

use thiserror::Error;

/// Payload captured from a panicking microthread.
pub type Panic = Box<dyn Any + Send + 'static>;

/// Reading from a channel whose writer side is gone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("reader exhausted: channel closed")]
pub struct RecvError;

/// Sending on a channel whose reader side is gone. Carries the
/// undelivered value back to the caller.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct SendError<T>(pub T);

impl<T> fmt::Debug for SendError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SendError(..)")
    }
}

impl<T> fmt::Display for SendError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("sending on a closed channel")
    }
}

impl<T> std::error::Error for SendError<T> {}

/// Runtime-level errors.
#[derive(Debug, Error)]
pub enum Error {
    /// Stack allocation for a new microthread failed.
    #[error("failed to allocate a microthread stack")]
    Spawn(#[source] std::io::Error),

    /// The reply endpoint of an RPC died before a reply arrived.
    #[error("rpc peer died before replying")]
    RpcDead,

    /// The global panic channel already has a reader attached.
    #[error("global panic channel already attached")]
    HandlerAttached,
}
