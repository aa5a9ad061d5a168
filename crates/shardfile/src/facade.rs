//! Request adapters in front of the persist executor
//!
//! A [`Reader`] or [`Writer`] owns one response channel. Every request it
//! submits is wrapped into an operation answering on that channel, so all
//! responses for a facade (and its clones) arrive on the receiver returned
//! alongside it. Responses for different keys may arrive in any order.
//!
//! Order is only guaranteed inside one batch: the requests passed to a
//! single `write_batch` or `read_batch` call run back to back on one lock
//! acquisition and answer in that order. Separate calls for the same key
//! become separate batches that may land on different workers, so they run
//! in whatever order those workers acquire the key. Callers that need a
//! write to precede a read must put both in one batch or wait for the write
//! response first.

use crate::executor::Batch;
use crate::operation::{
    Operation, ReadOperation, ReadRequest, ReadResponse, WriteOperation, WriteRequest,
    WriteResponse,
};
use crate::store::Key;
use crate::{Result, StoreError};
use tokio::sync::mpsc;

async fn submit<K: Key>(input: &mpsc::Sender<Batch<K>>, batch: Batch<K>) -> Result<()> {
    input.send(batch).await.map_err(|e| {
        StoreError::Closed(format!(
            "executor input closed, batch for key {} not submitted",
            e.0.key()
        ))
    })
}

/// Submits reads to the executor.
#[derive(Debug, Clone)]
pub struct Reader<K> {
    input: mpsc::Sender<Batch<K>>,
    respond: mpsc::UnboundedSender<ReadResponse<K>>,
}

impl<K: Key> Reader<K> {
    /// Create a reader feeding `input`, with the receiver for its responses.
    pub fn new(
        input: mpsc::Sender<Batch<K>>,
    ) -> (Self, mpsc::UnboundedReceiver<ReadResponse<K>>) {
        let (respond, responses) = mpsc::unbounded_channel();
        (Self { input, respond }, responses)
    }

    /// Submit one read as a single-operation batch.
    ///
    /// Waits while the executor input is full.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Closed` if the executor no longer accepts batches
    pub async fn read(&self, request: ReadRequest<K>) -> Result<()> {
        let op = ReadOperation::new(request, self.respond.clone());
        submit(&self.input, Batch::single(op)).await
    }

    /// Submit several reads of one key to run under a single acquisition.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::InvalidBatch` for an empty or mixed-key request
    /// list, or `StoreError::Closed` if the executor no longer accepts batches
    pub async fn read_batch(&self, requests: Vec<ReadRequest<K>>) -> Result<()> {
        let ops: Vec<Operation<K>> = requests
            .into_iter()
            .map(|request| ReadOperation::new(request, self.respond.clone()).into())
            .collect();
        submit(&self.input, Batch::new(ops)?).await
    }
}

/// Submits appends to the executor.
#[derive(Debug, Clone)]
pub struct Writer<K> {
    input: mpsc::Sender<Batch<K>>,
    respond: mpsc::UnboundedSender<WriteResponse<K>>,
}

impl<K: Key> Writer<K> {
    /// Create a writer feeding `input`, with the receiver for its responses.
    pub fn new(
        input: mpsc::Sender<Batch<K>>,
    ) -> (Self, mpsc::UnboundedReceiver<WriteResponse<K>>) {
        let (respond, responses) = mpsc::unbounded_channel();
        (Self { input, respond }, responses)
    }

    /// Submit one append as a single-operation batch.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Closed` if the executor no longer accepts batches
    pub async fn write(&self, request: WriteRequest<K>) -> Result<()> {
        let op = WriteOperation::new(request, self.respond.clone());
        submit(&self.input, Batch::single(op)).await
    }

    /// Submit several appends to one key; they land contiguously and in
    /// order.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::InvalidBatch` for an empty or mixed-key request
    /// list, or `StoreError::Closed` if the executor no longer accepts batches
    pub async fn write_batch(&self, requests: Vec<WriteRequest<K>>) -> Result<()> {
        let ops: Vec<Operation<K>> = requests
            .into_iter()
            .map(|request| WriteOperation::new(request, self.respond.clone()).into())
            .collect();
        submit(&self.input, Batch::new(ops)?).await
    }
}
