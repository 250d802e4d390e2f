//! Verifying blob reader

use bytes::Bytes;
use cachet_digest::{Algorithm, Hash, Integrity, IntegrityHasher};
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tracing::warn;

use crate::errors::{CasError, Result};

/// Result of a stream that hashed to what it was expected to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Verified {
    pub algorithm: Algorithm,
    pub size: u64,
}

/// Streams a blob while hashing it.
///
/// Bytes are handed out as they are read, before anything is known about
/// their validity. Once the stream is exhausted, call [`finish`] to learn
/// whether what was delivered was correct; output from a stream whose
/// `finish` fails must be discarded.
///
/// [`finish`]: ContentReader::finish
pub struct ContentReader {
    file: File,
    file_len: u64,
    hash: Hash,
    integrity: Integrity,
    expected_size: Option<u64>,
    hasher: IntegrityHasher,
    bytes_read: u64,
}

impl ContentReader {
    pub(crate) fn new(
        file: File,
        file_len: u64,
        hash: Hash,
        integrity: Integrity,
        expected_size: Option<u64>,
    ) -> Self {
        let hasher = IntegrityHasher::new(&[hash.algorithm()]);
        Self {
            file,
            file_len,
            hash,
            integrity,
            expected_size,
            hasher,
            bytes_read: 0,
        }
    }

    /// Size of the blob file when it was opened.
    pub fn file_len(&self) -> u64 {
        self.file_len
    }

    /// The hash whose path this reader resolved to.
    pub fn hash(&self) -> &Hash {
        &self.hash
    }

    pub fn bytes_read(&self) -> u64 {
        self.bytes_read
    }

    /// Drain anything left unread, then compare size and digest.
    pub async fn finish(mut self) -> Result<Verified> {
        let mut sink = [0u8; 8192];
        loop {
            let n = self.read(&mut sink).await?;
            if n == 0 {
                break;
            }
        }
        self.verify()
    }

    /// Read the whole blob and verify it.
    pub async fn read_all(mut self) -> Result<Bytes> {
        let mut data = Vec::with_capacity(self.file_len as usize);
        AsyncReadExt::read_to_end(&mut self, &mut data).await?;
        self.verify()?;
        Ok(Bytes::from(data))
    }

    /// Copy the blob into `writer`, verifying once the copy is complete.
    pub async fn copy_to<W>(mut self, writer: &mut W) -> Result<Verified>
    where
        W: AsyncWrite + Unpin,
    {
        tokio::io::copy(&mut self, writer).await?;
        writer.flush().await?;
        self.verify()
    }

    fn verify(self) -> Result<Verified> {
        if let Some(expected) = self.expected_size {
            if expected != self.bytes_read {
                warn!(
                    "Size mismatch reading {}: expected {}, got {}",
                    self.hash, expected, self.bytes_read
                );
                return Err(CasError::SizeMismatch {
                    expected,
                    actual: self.bytes_read,
                });
            }
        }

        let actual = self.hasher.finish();
        if actual.strongest() != &self.hash {
            warn!("Integrity mismatch reading {}: got {}", self.hash, actual);
            return Err(CasError::IntegrityMismatch {
                expected: self.integrity,
                actual,
            });
        }

        Ok(Verified {
            algorithm: self.hash.algorithm(),
            size: self.bytes_read,
        })
    }
}

impl AsyncRead for ContentReader {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = &mut *self;
        let before = buf.filled().len();
        match Pin::new(&mut this.file).poll_read(cx, buf) {
            Poll::Ready(Ok(())) => {
                let chunk = &buf.filled()[before..];
                this.hasher.update(chunk);
                this.bytes_read += chunk.len() as u64;
                Poll::Ready(Ok(()))
            }
            other => other,
        }
    }
}
