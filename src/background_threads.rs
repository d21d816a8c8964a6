// This code is licensed under Elastic License 2.0
// https://www.elastic.co/licensing/elastic-license

use std::sync::Arc;

use chrono::Utc;
use log::{error, info};

use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration};

use crate::queue_manager::queue::{ConnectionState, QueueClient, RedisQueue};
use crate::IS_SHUTDOWN;

// Returns true if the specified join handle is not none and is not finished.
fn is_join_handle_running(handle: &Option<JoinHandle<()>>) -> bool {
  match handle {
    Some(handle) => {
      if handle.is_finished() {
        // The thread cooresponding to this handle is finished.
        return false;
      }
    }
    None => return false, // Handle isn't initialized yet - so no thread corresponding to
                          // this handle is running.
  }

  // None of the above conditions are true, so the thread corresponding to this handle
  // is running
  true
}

/// Function to run a reconnection round by starting a new thread as necessory.
/// Returns true if a new reconnect thread was started, returns false otherwise.
fn check_and_start_reconnect_thread(
  queue: Arc<RedisQueue>,
  reconnect_handle: &mut Option<JoinHandle<()>>,
) -> bool {
  if !is_join_handle_running(reconnect_handle) {
    // The thread running the reconnection round isn't started or has finished.
    // Start a new round, and update the reconnect_handle.
    *reconnect_handle = Some(tokio::spawn(async move {
      queue.reconnect().await;
    }));

    return true;
  }

  false
}

/// Function to refresh the queue depth estimate by starting a new thread as
/// necessory. Returns true if a new refresh thread was started.
fn check_and_start_depth_refresh_thread(
  queue: Arc<RedisQueue>,
  refresh_handle: &mut Option<JoinHandle<()>>,
) -> bool {
  if !is_join_handle_running(refresh_handle) {
    *refresh_handle = Some(tokio::spawn(async move {
      queue.refresh_depth().await;
    }));

    return true;
  }

  false
}

/// Supervises the queue connection: runs reconnection rounds whenever the
/// connection drops, re-probes an unavailable store on the probe interval so
/// the gateway recovers without a restart, and periodically refreshes the
/// depth estimate used for backpressure. Requests never do any of this work.
pub async fn check_and_start_background_threads(queue: Arc<RedisQueue>) {
  let mut reconnect_handle: Option<JoinHandle<()>> = None;
  let mut refresh_handle: Option<JoinHandle<()>> = None;

  let probe_interval_ms = queue.get_probe_interval().as_millis() as u64;
  let mut last_reconnect_round_time: u64 = 0;
  let mut last_refresh_time: u64 = 0;

  loop {
    // Check if we need to shut down (typically triggered by the user by sending Ctrl-C
    // on the Siphon server).
    let is_shutdown = IS_SHUTDOWN.load();

    // Exit from the loop after shutting down background threads if is_shutdown is set.
    if is_shutdown {
      // Gather the handles of all the background threads.
      let mut join_handles = Vec::new();
      if let Some(handle) = reconnect_handle {
        join_handles.push(handle);
      }
      if let Some(handle) = refresh_handle {
        join_handles.push(handle);
      }

      // Wait for the background threads to finish and check for errors.
      for handle in join_handles {
        if let Err(e) = handle.await {
          error!("Error while joining thread: {}", e);
        }
      }

      // break from the loop - as we don't want to start any more background threads.
      break;
    }

    let current_time = Utc::now().timestamp_millis() as u64;

    match queue.connection_state() {
      ConnectionState::Connected => {
        // Refresh the depth estimate on the probe interval - if a refresh
        // isn't running already.
        if current_time - last_refresh_time > probe_interval_ms
          && check_and_start_depth_refresh_thread(queue.clone(), &mut refresh_handle)
        {
          last_refresh_time = current_time;
        }
      }
      ConnectionState::Reconnecting => {
        // The connection just dropped - start a reconnection round right away,
        // if one isn't running already.
        if check_and_start_reconnect_thread(queue.clone(), &mut reconnect_handle) {
          info!("Queue connection dropped, starting reconnection round");
          last_reconnect_round_time = current_time;
        }
      }
      ConnectionState::Unavailable => {
        // A full round already failed. Re-probe on the probe interval so the
        // gateway recovers once the store comes back.
        if current_time - last_reconnect_round_time > probe_interval_ms
          && check_and_start_reconnect_thread(queue.clone(), &mut reconnect_handle)
        {
          last_reconnect_round_time = current_time;
        }
      }
    }

    // Sleep for some time before checking the connection again.
    sleep(Duration::from_millis(500)).await;
  } // end loop {..}
}
