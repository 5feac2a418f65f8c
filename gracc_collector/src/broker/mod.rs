//! Broker Session and Publisher Worker (SPEC_FULL.md §4.3, §4.4): the part
//! of the collector that owns the long-lived AMQP connection and hands out
//! short-lived, per-bundle publisher channels.

mod session;
mod worker;

pub use session::{BrokerError, BrokerSession};
pub use worker::{PublisherWorker, WorkerError};
