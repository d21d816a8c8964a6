// This code is licensed under Elastic License 2.0
// https://www.elastic.co/licensing/elastic-license

//! Utilities for managing the Siphon application.

pub(crate) mod error;
pub(crate) mod settings;
pub(crate) mod shutdown;

#[cfg(test)]
/// Configure a logger for tests, ignoring errors if it is already set.
pub(crate) fn config_test_logger() {
  let _ = env_logger::builder().is_test(true).try_init();
}
