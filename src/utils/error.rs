// This code is licensed under Elastic License 2.0
// https://www.elastic.co/licensing/elastic-license

use thiserror::Error;

#[derive(Debug, Error, Eq, PartialEq)]
/// Collection of errors on the ingest path.
///
/// Every recognized fault maps to exactly one variant, so callers can decide
/// retryability programmatically instead of parsing log output.
pub enum IngestError {
  /// The request body is not syntactically valid JSON. Client fault, never retried.
  #[error("Malformed payload. {0}")]
  MalformedPayload(String),

  /// The queue is over its configured depth threshold. The caller may retry later.
  #[error("Queue depth {depth} is over the configured threshold {threshold}.")]
  Overloaded { depth: u64, threshold: u64 },

  /// The backing store cannot be reached. Reconnection happens in the
  /// background; the failing request is surfaced, not silently retried.
  #[error("Queue unavailable. {0}")]
  QueueUnavailable(String),

  /// The store rejected the entry or returned an unexpected response.
  /// Non-retryable; must not trigger reconnection.
  #[error("Queue protocol error. {0}")]
  QueueProtocolError(String),
}
