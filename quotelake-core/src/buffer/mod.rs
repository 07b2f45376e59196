//! Durable buffer writer.
//!
//! Records are serialized as one JSON line each and handed to a
//! [`DurableBuffer`]. Success is reported only after the buffer acknowledges
//! durable receipt. Transient failures are retried with the same payload,
//! so delivery is at-least-once.

pub mod file;

pub use file::{BufferStats, FileBuffer};

use crate::domain::RawObservation;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Acknowledgement of durable receipt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ack {
    pub record_id: String,
    pub shard: usize,
}

#[derive(Debug, Error)]
pub enum BufferError {
    #[error("transient buffer failure: {0}")]
    Transient(String),

    #[error("record rejected: {0}")]
    Rejected(String),

    #[error("buffer I/O: {0}")]
    Io(#[from] std::io::Error),
}

impl BufferError {
    /// Whether resubmitting the same payload may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, BufferError::Transient(_) | BufferError::Io(_))
    }
}

/// Fatal failure to hand a record to the buffer.
#[derive(Debug, Error)]
pub enum BufferSubmissionError {
    #[error("failed to serialize record for {symbol}: {source}")]
    Serialize {
        symbol: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("buffer refused record for {symbol} after {attempts} attempt(s): {source}")]
    Exhausted {
        symbol: String,
        attempts: u32,
        #[source]
        source: BufferError,
    },
}

impl BufferSubmissionError {
    pub fn symbol(&self) -> &str {
        match self {
            BufferSubmissionError::Serialize { symbol, .. }
            | BufferSubmissionError::Exhausted { symbol, .. } => symbol,
        }
    }
}

/// Write side of an append-only buffer.
pub trait DurableBuffer: Send + Sync {
    /// Submit one newline-terminated record. Returns once it is durable.
    fn put_record(&self, data: &[u8]) -> Result<Ack, BufferError>;
}

/// Read side of the buffer, used by the transformer.
pub trait BufferSource: Send + Sync {
    /// Every buffered line, shard by shard, each shard in insertion order.
    fn read_lines(&self) -> Result<Vec<String>, BufferError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(200),
        }
    }
}

impl RetryPolicy {
    /// Delay before attempt `attempt + 1`: exponential with up to 50% jitter.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = self.base_delay.saturating_mul(1u32 << attempt.min(16).saturating_sub(1));
        let jitter_ceiling = exp.as_millis() as u64 / 2;
        let jitter = if jitter_ceiling == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=jitter_ceiling)
        };
        exp + Duration::from_millis(jitter)
    }
}

/// Serializes observations and submits them with bounded retries.
pub struct BufferWriter {
    buffer: Arc<dyn DurableBuffer>,
    retry: RetryPolicy,
}

impl BufferWriter {
    pub fn new(buffer: Arc<dyn DurableBuffer>, retry: RetryPolicy) -> Self {
        Self { buffer, retry }
    }

    pub fn append(&self, record: &RawObservation) -> Result<Ack, BufferSubmissionError> {
        let line = record
            .to_buffer_line()
            .map_err(|source| BufferSubmissionError::Serialize {
                symbol: record.symbol.clone(),
                source,
            })?;

        let max_attempts = self.retry.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.buffer.put_record(line.as_bytes()) {
                Ok(ack) => {
                    tracing::debug!(
                        symbol = %record.symbol,
                        record_id = %ack.record_id,
                        attempt,
                        "buffer ack"
                    );
                    return Ok(ack);
                }
                Err(e) if e.is_transient() && attempt < max_attempts => {
                    let delay = self.retry.backoff(attempt);
                    tracing::warn!(
                        symbol = %record.symbol,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "buffer submit failed, retrying"
                    );
                    std::thread::sleep(delay);
                }
                Err(source) => {
                    return Err(BufferSubmissionError::Exhausted {
                        symbol: record.symbol.clone(),
                        attempts: attempt,
                        source,
                    });
                }
            }
        }
    }
}
