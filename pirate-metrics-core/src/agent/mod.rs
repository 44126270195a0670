//! Background delivery of metrics to a PirateMetrics collector
//!
//! Submitting threads push envelopes onto a bounded queue; a single worker
//! thread pops them in order and posts each one to the collector. Control
//! envelopes (`flush`, `exit`) travel the same queue so they act as
//! barriers behind everything submitted earlier.
//!
//! - [`Agent`]: public lifecycle controller and submission API
//! - [`Transport`] / [`Connector`]: the seam between the worker and the wire
//! - [`DeliveryStats`]: counters for what was queued, delivered and dropped

mod envelope;
mod lifecycle;
mod queue;
mod stats;
mod transport;
mod worker;

#[cfg(test)]
mod testing;

pub use lifecycle::{Agent, AgentBuilder};
pub use stats::DeliveryStats;
pub use transport::{encode_form, Connector, Form, HttpConnector, HttpTransport, Transport};
