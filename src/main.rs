// This code is licensed under Elastic License 2.0
// https://www.elastic.co/licensing/elastic-license

//! The Siphon server application and interface.
//!
//! Siphon is an [Axum](https://docs.rs/axum/latest/axum/) web application that
//! accepts arbitrary JSON payloads and appends them to a shared FIFO queue in
//! Redis, where downstream processors consume them asynchronously. Accepting a
//! payload means it is durably queued, not that it has been processed.
//!
//! The enqueue path is the only interesting part: intake validation, payload
//! framing, admission control, and the queue client with its reconnection and
//! timeout handling. Everything else is plumbing around it.

mod background_threads;
mod queue_manager;
mod utils;

use std::env;
use std::sync::Arc;
use std::time::Instant;

use axum::extract::{DefaultBodyLimit, State};
use axum::response::{IntoResponse, Response};
use axum::{routing::get, routing::post, Router};
use crossbeam::atomic::AtomicCell;
use hyper::header::RETRY_AFTER;
use hyper::StatusCode;
use lazy_static::lazy_static;
use log::{debug, error, info, warn};
use serde_json::value::RawValue;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use crate::background_threads::check_and_start_background_threads;
use crate::queue_manager::admission::AdmissionPolicy;
use crate::queue_manager::envelope::QueueEntry;
use crate::queue_manager::queue::{QueueClient, RedisQueue};
use crate::utils::error::IngestError;
use crate::utils::settings::Settings;
use crate::utils::shutdown::shutdown_signal;

lazy_static! {
  static ref IS_SHUTDOWN: AtomicCell<bool> = AtomicCell::new(false);
}

/// Represents application state.
struct AppState {
  // The queue client is held behind the trait so tests can substitute a fake.
  queue: Arc<dyn QueueClient>,
  policy: AdmissionPolicy,
  settings: Settings,
}

/// Build the router with all routes and shared state.
fn router(shared_state: Arc<AppState>) -> Router {
  Router::new()
    // GET methods
    .route("/", get(ping))
    .route("/ping", get(ping))
    //---
    // POST methods
    .route("/api/ingest", post(ingest))
    // ---
    // State that is passed to each request.
    .with_state(shared_state)
    // ---
    // Layer for tracing in debug mode.
    .layer(TraceLayer::new_for_http())
    // Make the default for body to be 5MB (instead of 2MB http default.)
    .layer(DefaultBodyLimit::max(5 * 1024 * 1024))
}

/// Axum application for Siphon server.
async fn app(config_dir_path: &str) -> (Router, JoinHandle<()>, Arc<AppState>) {
  // Read the settings from the config directory.
  let settings = Settings::new(config_dir_path).unwrap();

  // Create the queue client. It is constructed here and passed into every
  // handler invocation - there is no process-wide singleton to reach for.
  let queue = match RedisQueue::new(settings.get_queue_settings()) {
    Ok(queue) => Arc::new(queue),
    Err(err) => panic!("Unable to initialize queue client with err {}", err),
  };

  // Establish the initial store connection. Failure is not fatal: the
  // background supervisor keeps retrying, and requests fail fast meanwhile.
  if let Err(err) = queue.connect().await {
    warn!(
      "Could not connect to queue store at startup, retrying in the background: {}",
      err
    );
  }

  let policy = AdmissionPolicy::new(settings.get_queue_settings().get_depth_threshold());

  // Start a thread to supervise the queue connection and depth estimate.
  info!("Spawning background threads for queue connection supervision...");
  let background_threads_handle = tokio::spawn(check_and_start_background_threads(queue.clone()));

  let shared_state = Arc::new(AppState {
    queue: queue as Arc<dyn QueueClient>,
    policy,
    settings,
  });

  let router = router(shared_state.clone());

  (router, background_threads_handle, shared_state)
}

async fn run_server() {
  // Config directory path is relative to the current directory, and set in environment
  // variable "SIPHON_CONFIG_DIR_PATH". Defaults to "config" if not set.
  let config_dir_path = &env::var("SIPHON_CONFIG_DIR_PATH").unwrap_or_else(|_| "config".to_owned());

  // Create app.
  let (app, background_threads_handle, shared_state) = app(config_dir_path).await;

  // Start server.
  let port = shared_state.settings.get_server_settings().get_port();
  let host: &str = shared_state.settings.get_server_settings().get_host();
  let connection_string = &format!("{}:{}", host, port);
  let listener = TcpListener::bind(connection_string)
    .await
    .unwrap_or_else(|_| panic!("Could not listen using {}", connection_string));

  info!(
    "Starting Siphon server on {}. Use Ctrl-C or SIGTERM to gracefully exit...",
    connection_string
  );

  axum::serve(listener, app)
    .with_graceful_shutdown(shutdown_signal())
    .await
    .unwrap();

  // Set the flag to indicate the background threads to shutdown, and wait for them to finish.
  IS_SHUTDOWN.store(true);
  info!("Shutting down background threads and waiting for them to finish...");
  background_threads_handle
    .await
    .expect("Error while shutting down the background threads");

  info!("Completed Siphon server shutdown");
}

/// Program entry point.
fn main() {
  // If log level isn't set, set it to info.
  if env::var("RUST_LOG").is_err() {
    env::set_var("RUST_LOG", "info")
  }

  // Set up logging.
  tracing_subscriber::fmt()
    .with_env_filter(EnvFilter::from_default_env())
    .init();

  // Set the number of threads to be 1 less than the number of CPUs (or 1 if there are
  // fewer than 2 CPUs).
  let num_threads = std::cmp::max(1, num_cpus::get() - 1);

  let runtime = tokio::runtime::Builder::new_multi_thread()
    .worker_threads(num_threads) // Limit the number of worker threads
    .enable_all() // Enables both I/O and time drivers
    .build()
    .unwrap();

  runtime.block_on(async {
    run_server().await;
  });
}

/// Accept an arbitrary JSON payload and append it to the ingestion queue.
///
/// 202 means durably queued for asynchronous processing, not processed.
async fn ingest(State(state): State<Arc<AppState>>, body: String) -> Response {
  let request_id = Uuid::new_v4();
  let receive_time = Instant::now();
  let retry_after_seconds = state
    .settings
    .get_queue_settings()
    .get_retry_after_seconds();

  debug!("Ingest request {}: received {} bytes", request_id, body.len());

  // Validate JSON-ness only - the raw bytes pass through to the queue untouched.
  let payload = match serde_json::from_str::<&RawValue>(&body) {
    Ok(payload) => payload,
    Err(e) => {
      let error = IngestError::MalformedPayload(e.to_string());
      return failure_response(request_id, &error, receive_time, retry_after_seconds);
    }
  };

  let serialized = match QueueEntry::new(payload).to_json() {
    Ok(serialized) => serialized,
    Err(error) => {
      return failure_response(request_id, &error, receive_time, retry_after_seconds);
    }
  };

  if let Err(error) = state.policy.admit(state.queue.as_ref()) {
    return failure_response(request_id, &error, receive_time, retry_after_seconds);
  }

  // The append is atomic on the store side, so run it on its own task - a
  // caller that disconnects mid-request must not abort it halfway through.
  let queue = state.queue.clone();
  let push = tokio::spawn(async move { queue.push(serialized).await });

  match push.await {
    Ok(Ok(position)) => {
      info!(
        "Ingest request {}: accepted at queue position {} in {}ms",
        request_id,
        position,
        receive_time.elapsed().as_millis()
      );
      StatusCode::ACCEPTED.into_response()
    }
    Ok(Err(error)) => failure_response(request_id, &error, receive_time, retry_after_seconds),
    Err(e) => {
      error!("Ingest request {}: append task failed: {}", request_id, e);
      let error = IngestError::QueueUnavailable("Append task failed".to_owned());
      failure_response(request_id, &error, receive_time, retry_after_seconds)
    }
  }
}

/// Map a failed ingestion attempt to its HTTP response, and emit the
/// diagnostic record for the attempt (outcome and latency).
fn failure_response(
  request_id: Uuid,
  error: &IngestError,
  receive_time: Instant,
  retry_after_seconds: u64,
) -> Response {
  let latency_ms = receive_time.elapsed().as_millis();
  let retry_after = [(RETRY_AFTER, retry_after_seconds.to_string())];

  match error {
    IngestError::MalformedPayload(_) => {
      debug!(
        "Ingest request {}: rejected in {}ms: {}",
        request_id, latency_ms, error
      );
      (StatusCode::BAD_REQUEST, error.to_string()).into_response()
    }
    IngestError::Overloaded { .. } => {
      warn!(
        "Ingest request {}: shed in {}ms: {}",
        request_id, latency_ms, error
      );
      (
        StatusCode::TOO_MANY_REQUESTS,
        retry_after,
        error.to_string(),
      )
        .into_response()
    }
    IngestError::QueueUnavailable(_) => {
      error!(
        "Ingest request {}: failed in {}ms: {}",
        request_id, latency_ms, error
      );
      (
        StatusCode::SERVICE_UNAVAILABLE,
        retry_after,
        error.to_string(),
      )
        .into_response()
    }
    IngestError::QueueProtocolError(_) => {
      error!(
        "Ingest request {}: failed in {}ms: {}",
        request_id, latency_ms, error
      );
      (StatusCode::INTERNAL_SERVER_ERROR, error.to_string()).into_response()
    }
  }
}

/// Ping to check if the server is up.
async fn ping(State(_state): State<Arc<AppState>>) -> String {
  "OK".to_owned()
}
