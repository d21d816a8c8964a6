// This code is licensed under Elastic License 2.0
// https://www.elastic.co/licensing/elastic-license

use tokio::signal;

/// Completes when the process receives Ctrl-C or SIGTERM, so that the server
/// can drain in-flight requests before exiting.
pub async fn shutdown_signal() {
  let ctrl_c = async {
    signal::ctrl_c()
      .await
      .expect("Failed to install Ctrl-C handler");
  };

  #[cfg(unix)]
  let terminate = async {
    signal::unix::signal(signal::unix::SignalKind::terminate())
      .expect("Failed to install SIGTERM handler")
      .recv()
      .await;
  };

  #[cfg(not(unix))]
  let terminate = std::future::pending::<()>();

  tokio::select! {
    _ = ctrl_c => {},
    _ = terminate => {},
  }
}
