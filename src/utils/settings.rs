// This code is licensed under Elastic License 2.0
// https://www.elastic.co/licensing/elastic-license

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::env;

const DEFAULT_CONFIG_FILE_NAME: &str = "default.toml";

#[derive(Debug, Deserialize)]
/// Settings for the Siphon HTTP server.
pub struct ServerSettings {
  port: u16,
  host: String,
}

impl ServerSettings {
  /// Get the port.
  pub fn get_port(&self) -> u16 {
    self.port
  }

  /// Get the host.
  pub fn get_host(&self) -> &str {
    &self.host
  }
}

#[derive(Debug, Deserialize)]
/// Settings for the queue client and its backpressure policy.
pub struct QueueSettings {
  url: String,
  queue_name: String,
  push_timeout_millis: u64,
  depth_threshold: u64,
  retry_after_seconds: u64,
  max_entry_bytes: usize,
  reconnect_base_millis: u64,
  reconnect_max_delay_millis: u64,
  reconnect_max_attempts: usize,
  probe_interval_seconds: u64,
}

impl QueueSettings {
  /// Get the connection URL for the backing store.
  pub fn get_url(&self) -> &str {
    &self.url
  }

  /// Get the name of the queue that entries are appended to.
  pub fn get_queue_name(&self) -> &str {
    &self.queue_name
  }

  /// Get the bound on a single append call, in milliseconds.
  pub fn get_push_timeout_millis(&self) -> u64 {
    self.push_timeout_millis
  }

  /// Get the queue depth above which new entries are rejected.
  pub fn get_depth_threshold(&self) -> u64 {
    self.depth_threshold
  }

  /// Get the retry hint returned with backpressure responses, in seconds.
  pub fn get_retry_after_seconds(&self) -> u64 {
    self.retry_after_seconds
  }

  /// Get the maximum size of a serialized entry, in bytes.
  pub fn get_max_entry_bytes(&self) -> usize {
    self.max_entry_bytes
  }

  /// Get the base used for reconnection backoff delays, in milliseconds.
  pub fn get_reconnect_base_millis(&self) -> u64 {
    self.reconnect_base_millis
  }

  /// Get the cap on a single reconnection backoff delay, in milliseconds.
  pub fn get_reconnect_max_delay_millis(&self) -> u64 {
    self.reconnect_max_delay_millis
  }

  /// Get the number of reconnection attempts in one round.
  pub fn get_reconnect_max_attempts(&self) -> usize {
    self.reconnect_max_attempts
  }

  /// Get the interval between background health and depth probes, in seconds.
  pub fn get_probe_interval_seconds(&self) -> u64 {
    self.probe_interval_seconds
  }
}

#[derive(Debug, Deserialize)]
/// Settings for Siphon, read from config file.
pub struct Settings {
  server: ServerSettings,
  queue: QueueSettings,
}

impl Settings {
  /// Create Settings from given configuration directory path.
  pub fn new(config_dir_path: &str) -> Result<Self, ConfigError> {
    let run_mode = env::var("RUN_MODE").unwrap_or_else(|_| "development".into());
    let config_default_file_name = format!("{}/{}", config_dir_path, DEFAULT_CONFIG_FILE_NAME);
    let config_environment_file_name = format!("{}/{}.toml", config_dir_path, run_mode);

    let config = Config::builder()
      // Start off by merging in the "default" configuration file
      .add_source(File::with_name(&config_default_file_name))
      // Add in the current environment file
      // Default to 'development' env
      // Note that this file is _optional_
      .add_source(File::with_name(&config_environment_file_name).required(false))
      // Add in settings from the environment (with a prefix of SIPHON)
      .add_source(Environment::with_prefix("siphon"))
      .build()?;

    // You can deserialize (and thus freeze) the entire configuration as
    config.try_deserialize()
  }

  /// Get server settings.
  pub fn get_server_settings(&self) -> &ServerSettings {
    &self.server
  }

  /// Get queue settings.
  pub fn get_queue_settings(&self) -> &QueueSettings {
    &self.queue
  }

  #[cfg(test)]
  /// Get the default config file name.
  pub fn get_default_config_file_name() -> &'static str {
    DEFAULT_CONFIG_FILE_NAME
  }
}
