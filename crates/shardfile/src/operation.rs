//! Units of work executed against an exclusively held shard file

use crate::fs::FsFile;
use crate::{Result, StoreError};
use bytes::Bytes;
use std::io::{self, Seek, SeekFrom, Write};
use tokio::sync::mpsc;
use tracing::debug;

/// Read `size` bytes at `offset` from the file for `key`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadRequest<K> {
    /// Target key
    pub key: K,
    /// Byte offset to start reading at
    pub offset: u64,
    /// Number of bytes to read
    pub size: usize,
}

impl<K> ReadRequest<K> {
    /// Creates a read request.
    pub const fn new(key: K, offset: u64, size: usize) -> Self {
        Self { key, offset, size }
    }
}

/// Outcome of a [`ReadRequest`].
#[derive(Debug)]
pub struct ReadResponse<K> {
    /// The request this answers
    pub request: ReadRequest<K>,
    /// Bytes read, or why they could not be
    pub result: Result<Bytes>,
}

/// Append `payload` to the file for `key`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteRequest<K> {
    /// Target key
    pub key: K,
    /// Bytes to append
    pub payload: Bytes,
}

impl<K> WriteRequest<K> {
    /// Creates a write request.
    pub fn new(key: K, payload: impl Into<Bytes>) -> Self {
        Self {
            key,
            payload: payload.into(),
        }
    }
}

/// Outcome of a [`WriteRequest`].
#[derive(Debug)]
pub struct WriteResponse<K> {
    /// The request this answers
    pub request: WriteRequest<K>,
    /// Offset the payload was written at
    pub result: Result<u64>,
}

/// A read bound to the channel its response goes to.
#[derive(Debug)]
pub struct ReadOperation<K> {
    request: ReadRequest<K>,
    respond: mpsc::UnboundedSender<ReadResponse<K>>,
}

impl<K: std::fmt::Display> ReadOperation<K> {
    /// Creates a read operation answering on `respond`.
    pub const fn new(
        request: ReadRequest<K>,
        respond: mpsc::UnboundedSender<ReadResponse<K>>,
    ) -> Self {
        Self { request, respond }
    }

    /// The wrapped request.
    pub const fn request(&self) -> &ReadRequest<K> {
        &self.request
    }

    fn exec<F: FsFile>(self, file: std::result::Result<&mut F, &StoreError>) {
        let result = match file {
            Ok(file) => read_exact_at(file, &self.request),
            Err(e) => Err(e.duplicate()),
        };

        let response = ReadResponse {
            request: self.request,
            result,
        };
        if self.respond.send(response).is_err() {
            debug!("Read response dropped, receiver is gone");
        }
    }
}

/// A write bound to the channel its response goes to.
#[derive(Debug)]
pub struct WriteOperation<K> {
    request: WriteRequest<K>,
    respond: mpsc::UnboundedSender<WriteResponse<K>>,
}

impl<K> WriteOperation<K> {
    /// Creates a write operation answering on `respond`.
    pub const fn new(
        request: WriteRequest<K>,
        respond: mpsc::UnboundedSender<WriteResponse<K>>,
    ) -> Self {
        Self { request, respond }
    }

    /// The wrapped request.
    pub const fn request(&self) -> &WriteRequest<K> {
        &self.request
    }

    fn exec<F: FsFile>(self, file: std::result::Result<&mut F, &StoreError>) {
        let result = match file {
            Ok(file) => append(file, &self.request.payload),
            Err(e) => Err(e.duplicate()),
        };

        let response = WriteResponse {
            request: self.request,
            result,
        };
        if self.respond.send(response).is_err() {
            debug!("Write response dropped, receiver is gone");
        }
    }
}

/// One unit of I/O work bound to a key.
#[derive(Debug)]
pub enum Operation<K> {
    /// Positional read
    Read(ReadOperation<K>),
    /// Append
    Write(WriteOperation<K>),
}

impl<K: std::fmt::Display> Operation<K> {
    /// Key whose file this operation needs.
    pub fn target(&self) -> &K {
        match self {
            Self::Read(op) => &op.request.key,
            Self::Write(op) => &op.request.key,
        }
    }

    /// Run against the exclusively held file, or report why the file could
    /// not be acquired without touching any handle.
    pub fn exec<F: FsFile>(self, file: std::result::Result<&mut F, &StoreError>) {
        match self {
            Self::Read(op) => op.exec(file),
            Self::Write(op) => op.exec(file),
        }
    }
}

impl<K> From<ReadOperation<K>> for Operation<K> {
    fn from(op: ReadOperation<K>) -> Self {
        Self::Read(op)
    }
}

impl<K> From<WriteOperation<K>> for Operation<K> {
    fn from(op: WriteOperation<K>) -> Self {
        Self::Write(op)
    }
}

fn read_exact_at<K: std::fmt::Display, F: FsFile>(
    file: &mut F,
    request: &ReadRequest<K>,
) -> Result<Bytes> {
    let short = |actual| StoreError::ShortRead {
        key: request.key.to_string(),
        offset: request.offset,
        expected: request.size,
        actual,
    };

    // Size the buffer from what the file holds, not from the request alone
    let available = file.seek(SeekFrom::End(0))?.saturating_sub(request.offset);
    if !u64::try_from(request.size).is_ok_and(|size| size <= available) {
        return Err(short(usize::try_from(available).unwrap_or(usize::MAX)));
    }

    let mut buf = vec![0u8; request.size];
    let mut filled = 0;

    while filled < buf.len() {
        match file.read_at(&mut buf[filled..], request.offset + filled as u64) {
            Ok(0) => return Err(short(filled)),
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e.into()),
        }
    }

    Ok(Bytes::from(buf))
}

// Writes only ever go to the end of the file
fn append<F: FsFile>(file: &mut F, payload: &[u8]) -> Result<u64> {
    let offset = file.seek(SeekFrom::End(0))?;
    file.write_all(payload)?;
    Ok(offset)
}
