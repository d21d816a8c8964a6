// This code is licensed under Elastic License 2.0
// https://www.elastic.co/licensing/elastic-license

//! Client adapter for the Redis list that backs the ingestion queue.
//!
//! A push is a single atomic `RPUSH`; ordering among concurrent pushes is
//! whatever order Redis serialized them in. The adapter owns the connection
//! lifecycle: requests never wait for a reconnect, they fail fast while the
//! connection is down and the background supervisor re-establishes it.

use std::time::Duration;

use async_trait::async_trait;
use crossbeam::atomic::AtomicCell;
use log::{debug, error, info, warn};
use redis::aio::MultiplexedConnection;
use redis::RedisError;
use tokio::sync::RwLock;
use tokio::time::timeout;
use tokio_retry::strategy::{jitter, ExponentialBackoff};

use crate::utils::error::IngestError;
use crate::utils::settings::QueueSettings;

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
/// Health of the connection to the backing store.
pub enum ConnectionState {
  Connected,
  Reconnecting,
  Unavailable,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
/// Client-side contract for the shared ingestion queue.
///
/// The service root owns one implementation and hands it to every handler
/// invocation, so tests can substitute a fake.
pub trait QueueClient: Send + Sync {
  /// Append one serialized entry to the queue.
  ///
  /// Returns the entry's position, i.e. the queue length right after the
  /// append. Exactly one entry is appended on success; nothing is appended
  /// on failure.
  async fn push(&self, serialized_entry: String) -> Result<u64, IngestError>;

  /// Current connection state, readable by any request without locking.
  fn connection_state(&self) -> ConnectionState;

  /// Best-effort queue depth. May be slightly stale; backpressure decisions
  /// do not require a perfectly consistent count.
  fn depth_estimate(&self) -> u64;
}

// Connection-class faults are worth a reconnect. Everything else is the store
// answering and rejecting, and must not churn the connection.
fn is_retryable(error: &RedisError) -> bool {
  error.is_io_error()
    || error.is_timeout()
    || error.is_connection_dropped()
    || error.is_connection_refusal()
}

/// Queue client backed by a Redis list.
pub struct RedisQueue {
  client: redis::Client,
  connection: RwLock<Option<MultiplexedConnection>>,
  state: AtomicCell<ConnectionState>,
  depth: AtomicCell<u64>,
  queue_name: String,
  push_timeout: Duration,
  max_entry_bytes: usize,
  reconnect_base_millis: u64,
  reconnect_max_delay: Duration,
  reconnect_max_attempts: usize,
  probe_interval: Duration,
}

impl RedisQueue {
  /// Create a queue client from settings. No connection is made here; call
  /// `connect` to establish the initial one.
  pub fn new(settings: &QueueSettings) -> Result<Self, IngestError> {
    let client = redis::Client::open(settings.get_url())
      .map_err(|e| IngestError::QueueUnavailable(e.to_string()))?;

    Ok(RedisQueue {
      client,
      connection: RwLock::new(None),
      state: AtomicCell::new(ConnectionState::Reconnecting),
      depth: AtomicCell::new(0),
      queue_name: settings.get_queue_name().to_owned(),
      push_timeout: Duration::from_millis(settings.get_push_timeout_millis()),
      max_entry_bytes: settings.get_max_entry_bytes(),
      reconnect_base_millis: settings.get_reconnect_base_millis(),
      reconnect_max_delay: Duration::from_millis(settings.get_reconnect_max_delay_millis()),
      reconnect_max_attempts: settings.get_reconnect_max_attempts(),
      probe_interval: Duration::from_secs(settings.get_probe_interval_seconds()),
    })
  }

  /// Establish the initial connection. On failure the client stays in
  /// Reconnecting and the background supervisor keeps trying, so the server
  /// can start before the store is up.
  pub async fn connect(&self) -> Result<(), IngestError> {
    self.try_connect().await
  }

  async fn try_connect(&self) -> Result<(), IngestError> {
    match timeout(
      self.push_timeout,
      self.client.get_multiplexed_async_connection(),
    )
    .await
    {
      Ok(Ok(connection)) => {
        *self.connection.write().await = Some(connection);
        self.state.store(ConnectionState::Connected);
        info!("Connected to queue store for queue {}", self.queue_name);
        Ok(())
      }
      Ok(Err(e)) => Err(IngestError::QueueUnavailable(e.to_string())),
      Err(_) => Err(IngestError::QueueUnavailable(format!(
        "Connect timed out after {:?}",
        self.push_timeout
      ))),
    }
  }

  /// Run one round of reconnection attempts with exponential backoff and
  /// jitter. Ends in Connected, or in Unavailable once the attempt cap is
  /// reached. Called from the background supervisor, never from a request.
  pub async fn reconnect(&self) {
    self.state.store(ConnectionState::Reconnecting);

    // Delays double from 2x the base, capped at the configured maximum.
    let backoff = ExponentialBackoff::from_millis(2)
      .factor(self.reconnect_base_millis)
      .max_delay(self.reconnect_max_delay)
      .map(jitter)
      .take(self.reconnect_max_attempts);

    for (attempt, delay) in backoff.enumerate() {
      tokio::time::sleep(delay).await;

      match self.try_connect().await {
        Ok(()) => {
          info!(
            "Reconnected to queue store after {} attempt(s)",
            attempt + 1
          );
          return;
        }
        Err(e) => {
          warn!("Reconnect attempt {} failed: {}", attempt + 1, e);
        }
      }
    }

    error!(
      "Could not reconnect to queue store after {} attempts, marking queue unavailable",
      self.reconnect_max_attempts
    );
    self.state.store(ConnectionState::Unavailable);
  }

  /// Refresh the depth estimate from the store. Best-effort; a failure here
  /// only flags the connection, it does not fail any request.
  pub async fn refresh_depth(&self) {
    if self.state.load() != ConnectionState::Connected {
      return;
    }

    let connection = self.connection.read().await.as_ref().cloned();
    let mut connection = match connection {
      Some(connection) => connection,
      None => return,
    };

    let mut llen = redis::cmd("LLEN");
    llen.arg(&self.queue_name);

    match timeout(self.push_timeout, llen.query_async::<u64>(&mut connection)).await {
      Ok(Ok(depth)) => {
        debug!("Queue {} depth is {}", self.queue_name, depth);
        self.depth.store(depth);
      }
      Ok(Err(e)) => {
        warn!("Could not read queue depth: {}", e);
        if is_retryable(&e) {
          self.state.store(ConnectionState::Reconnecting);
        }
      }
      Err(_) => {
        warn!(
          "Queue depth probe timed out after {:?}",
          self.push_timeout
        );
        self.state.store(ConnectionState::Reconnecting);
      }
    }
  }

  /// Get the interval between background health and depth probes.
  pub fn get_probe_interval(&self) -> Duration {
    self.probe_interval
  }
}

#[async_trait]
impl QueueClient for RedisQueue {
  async fn push(&self, serialized_entry: String) -> Result<u64, IngestError> {
    // The store would reject an oversized entry anyway; catching it here
    // keeps the non-retryable fault from ever touching the connection.
    if serialized_entry.len() > self.max_entry_bytes {
      return Err(IngestError::QueueProtocolError(format!(
        "Entry of {} bytes is over the {} byte limit",
        serialized_entry.len(),
        self.max_entry_bytes
      )));
    }

    if self.state.load() != ConnectionState::Connected {
      return Err(IngestError::QueueUnavailable(
        "Queue connection is down".to_owned(),
      ));
    }

    let connection = self.connection.read().await.as_ref().cloned();
    let mut connection = match connection {
      Some(connection) => connection,
      None => {
        return Err(IngestError::QueueUnavailable(
          "Queue connection is not established".to_owned(),
        ))
      }
    };

    let mut rpush = redis::cmd("RPUSH");
    rpush.arg(&self.queue_name).arg(&serialized_entry);

    match timeout(self.push_timeout, rpush.query_async::<u64>(&mut connection)).await {
      Ok(Ok(length)) => {
        // RPUSH replies with the list length after the append, which is both
        // this entry's position and a free refresh of the depth estimate.
        self.depth.store(length);
        Ok(length)
      }
      Ok(Err(e)) => {
        if is_retryable(&e) {
          self.state.store(ConnectionState::Reconnecting);
          Err(IngestError::QueueUnavailable(e.to_string()))
        } else {
          Err(IngestError::QueueProtocolError(e.to_string()))
        }
      }
      Err(_) => {
        self.state.store(ConnectionState::Reconnecting);
        Err(IngestError::QueueUnavailable(format!(
          "Append timed out after {:?}",
          self.push_timeout
        )))
      }
    }
  }

  fn connection_state(&self) -> ConnectionState {
    self.state.load()
  }

  fn depth_estimate(&self) -> u64 {
    self.depth.load()
  }
}

#[cfg(test)]
mod tests {
  use std::fs::File;
  use std::io::Write;

  use tempdir::TempDir;

  use crate::utils::config_test_logger;
  use crate::utils::settings::Settings;

  use super::*;

  /// Write a config pointing at a port nothing listens on, so connection
  /// attempts fail quickly.
  fn create_test_settings(reconnect_max_attempts: usize) -> Settings {
    config_test_logger();

    let config_dir = TempDir::new("queue_test").unwrap();
    let config_dir_path = config_dir.path().to_str().unwrap();
    let config_file_path = format!(
      "{}/{}",
      config_dir_path,
      Settings::get_default_config_file_name()
    );

    {
      let mut file = File::create(config_file_path).unwrap();
      file.write_all(b"[server]\n").unwrap();
      file.write_all(b"port = 3000\n").unwrap();
      file.write_all(b"host = \"0.0.0.0\"\n").unwrap();
      file.write_all(b"[queue]\n").unwrap();
      file.write_all(b"url = \"redis://127.0.0.1:1\"\n").unwrap();
      file.write_all(b"queue_name = \"test_queue\"\n").unwrap();
      file.write_all(b"push_timeout_millis = 100\n").unwrap();
      file.write_all(b"depth_threshold = 10\n").unwrap();
      file.write_all(b"retry_after_seconds = 1\n").unwrap();
      file.write_all(b"max_entry_bytes = 64\n").unwrap();
      file.write_all(b"reconnect_base_millis = 1\n").unwrap();
      file.write_all(b"reconnect_max_delay_millis = 5\n").unwrap();
      let attempts_line = format!("reconnect_max_attempts = {}\n", reconnect_max_attempts);
      file.write_all(attempts_line.as_bytes()).unwrap();
      file.write_all(b"probe_interval_seconds = 1\n").unwrap();
    }

    Settings::new(config_dir_path).expect("Could not parse test config")
  }

  #[test]
  fn test_error_classification() {
    let io_error: RedisError =
      std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset").into();
    assert!(is_retryable(&io_error));

    let response_error: RedisError =
      (redis::ErrorKind::ResponseError, "store rejected entry").into();
    assert!(!is_retryable(&response_error));

    let type_error: RedisError = (redis::ErrorKind::TypeError, "unexpected reply").into();
    assert!(!is_retryable(&type_error));
  }

  #[tokio::test]
  async fn test_push_fails_fast_when_not_connected() {
    let settings = create_test_settings(2);
    let queue = RedisQueue::new(settings.get_queue_settings()).unwrap();

    // No connect call was made, so the client is still Reconnecting.
    assert_eq!(queue.connection_state(), ConnectionState::Reconnecting);

    let result = queue.push("{\"a\":1}".to_owned()).await;
    match result {
      Err(IngestError::QueueUnavailable(_)) => {}
      other => panic!("Expected QueueUnavailable, got {:?}", other),
    }
  }

  #[tokio::test]
  async fn test_oversized_entry_is_a_protocol_error() {
    let settings = create_test_settings(2);
    let queue = RedisQueue::new(settings.get_queue_settings()).unwrap();

    let oversized = format!("\"{}\"", "x".repeat(128));
    let result = queue.push(oversized).await;
    match result {
      Err(IngestError::QueueProtocolError(_)) => {}
      other => panic!("Expected QueueProtocolError, got {:?}", other),
    }
  }

  #[tokio::test]
  async fn test_reconnect_round_ends_unavailable_without_store() {
    let settings = create_test_settings(2);
    let queue = RedisQueue::new(settings.get_queue_settings()).unwrap();

    // Nothing listens on the configured port, so the whole round fails.
    queue.reconnect().await;
    assert_eq!(queue.connection_state(), ConnectionState::Unavailable);

    let result = queue.push("{\"a\":1}".to_owned()).await;
    match result {
      Err(IngestError::QueueUnavailable(_)) => {}
      other => panic!("Expected QueueUnavailable, got {:?}", other),
    }
  }

  #[tokio::test]
  async fn test_initial_connect_failure_leaves_reconnecting() {
    let settings = create_test_settings(2);
    let queue = RedisQueue::new(settings.get_queue_settings()).unwrap();

    let result = queue.connect().await;
    assert!(result.is_err());
    assert_eq!(queue.connection_state(), ConnectionState::Reconnecting);
  }
}
