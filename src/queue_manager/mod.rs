// This code is licensed under Elastic License 2.0
// https://www.elastic.co/licensing/elastic-license

//! Manages the ingestion queue for Siphon.
//!
//! The queue manager appends accepted payloads to a shared FIFO list in
//! [Redis](https://redis.io), from which downstream processors consume them
//! asynchronously. Redis can be run on a separate system so that consumers can
//! be restarted without losing data; the order consumers observe is the order
//! in which Redis serialized the appends.

pub(crate) mod admission;
pub(crate) mod envelope;
pub(crate) mod queue;
