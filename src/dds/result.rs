//! Error taxonomy of the history and reliability cores.
//!
//! Capacity and invalid-argument failures surface to the application and
//! may be retried by it; stale protocol counters are swallowed where they
//! are detected; invariant violations abort the affected handle only.

use thiserror::Error;

/// Why a reader history refused an incoming sample. Mirrors the DDS
/// SampleRejectedStatus reason codes.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SampleRejectedReason {
  SamplesLimit,
  InstancesLimit,
  SamplesPerInstanceLimit,
}

#[derive(Debug, Error)]
pub enum HistoryError {
  /// The history cannot admit the sample right now. The caller may retry
  /// after samples are acknowledged or taken.
  #[error("history capacity exhausted: {0}")]
  CapacityFull(&'static str),

  /// The request can never succeed as issued.
  #[error("invalid argument: {0}")]
  InvalidArgument(String),

  /// Payload exceeds the fragmentation threshold and the writer publishes
  /// synchronously, so it cannot be fragmented.
  #[error("payload of {size} bytes exceeds fragmentation threshold {threshold} under synchronous publish mode")]
  TooLarge { size: usize, threshold: u32 },

  /// Blocking admission ran out of time before space appeared.
  #[error("add_change timed out after max_blocking_time")]
  Timeout,

  /// Internal bookkeeping no longer matches the pool. The handle is
  /// unusable; the process is not.
  #[error("history invariant violated: {0}")]
  Fatal(String),
}

pub type HistoryResult<T> = Result<T, HistoryError>;

#[derive(Debug, Error)]
pub enum WriteError {
  #[error(transparent)]
  History(#[from] HistoryError),

  /// Transient I/O trouble; retried internally before surfacing.
  #[error("transient write failure: {0}")]
  Transient(String),
}

pub type WriteResult<T> = Result<T, WriteError>;

#[derive(Debug, Error)]
pub enum ReadError {
  #[error("read bookkeeping is inconsistent: {0}")]
  Fatal(String),
}

pub type ReadResult<T> = Result<T, ReadError>;
