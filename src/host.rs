//! The contract between an input and the pipeline that drives it.

use std::{collections::BTreeMap, time::Duration};

use async_trait::async_trait;
use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;

pub mod registry;

/// A message handed to the pipeline.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Message {
    payload: Vec<u8>,
    metadata: BTreeMap<String, String>,
}

impl Message {
    pub fn new(payload: Vec<u8>) -> Self {
        Self {
            payload,
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_metadata(mut self, metadata: BTreeMap<String, String>) -> Self {
        self.metadata.extend(metadata);
        self
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn metadata(&self) -> &BTreeMap<String, String> {
        &self.metadata
    }
}

/// Called by the pipeline once a message was processed, with the rejection reason on failure.
pub type AckFn = Box<dyn FnOnce(Result<(), String>) -> BoxFuture<'static, ()> + Send>;

/// An asynchronous source of messages.
///
/// Methods take `&self` so that `close` can be called while a `read` is pending.
#[async_trait]
pub trait Input: Send + Sync {
    /// Establishes the input. Calling it again once connected does nothing.
    async fn connect(&self) -> Result<(), InputError>;

    /// Waits for the next message.
    async fn read(&self, ctx: &CancellationToken) -> Result<(Message, AckFn), InputError>;

    async fn close(&self) -> Result<(), InputError>;
}

#[derive(Debug, thiserror::Error)]
pub enum InputError {
    #[error("input is not connected")]
    NotConnected,
    #[error("input has no more messages")]
    EndOfInput,
    #[error("read was cancelled")]
    Cancelled,
    #[error("input did not shut down within {0:?}")]
    ShutdownTimeout(Duration),
    #[error("cannot connect input: {0}")]
    Connect(#[source] Box<dyn std::error::Error + Send + Sync>),
}
