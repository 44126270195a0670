//! Background delivery loop
//!
//! One worker per live queue. It pops envelopes in order, posts metric
//! envelopes to the collector, and releases synchronous callers once their
//! envelope has been handled. Failures never leave this module: they are
//! logged, counted, and either retried after a fixed pause or dropped.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, trace, warn};

use super::envelope::{Command, Envelope};
use super::queue::BoundedQueue;
use super::stats::Stats;
use super::transport::{encode_form, Connector, Transport};
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WorkerState {
    Starting,
    Connected,
    Delivering,
    Backoff,
    Terminated,
}

/// What the loop does after handling one envelope
enum Step {
    Continue,
    Reconnect,
    Exit,
}

pub(crate) struct Worker {
    queue: Arc<BoundedQueue>,
    connector: Arc<dyn Connector>,
    api_key: String,
    reconnect_delay: Duration,
    /// Agent-wide switch, cleared while shutting down
    allow_reconnect: Arc<AtomicBool>,
    stats: Arc<Stats>,
    state: WorkerState,
    /// Set after the first refused connection so repeats log at debug
    refused: bool,
}

impl Worker {
    pub(crate) fn new(
        queue: Arc<BoundedQueue>,
        connector: Arc<dyn Connector>,
        api_key: String,
        reconnect_delay: Duration,
        allow_reconnect: Arc<AtomicBool>,
        stats: Arc<Stats>,
    ) -> Self {
        Self {
            queue,
            connector,
            api_key,
            reconnect_delay,
            allow_reconnect,
            stats,
            state: WorkerState::Starting,
            refused: false,
        }
    }

    /// Run until an `exit` envelope is reached or the queue is closed
    pub(crate) fn run(mut self) {
        if let Some(mut transport) = self.connect() {
            while let Some(envelope) = self.queue.pop() {
                match self.handle(transport.as_mut(), envelope) {
                    Step::Continue => {}
                    Step::Exit => break,
                    Step::Reconnect => match self.backoff_and_reconnect() {
                        Some(fresh) => transport = fresh,
                        None => break,
                    },
                }
            }
        }
        // Nothing drains the queue past this point.
        let discarded = self.queue.close();
        if discarded > 0 {
            self.stats.abandoned.add(discarded as u64);
            debug!(discarded, "Discarded metrics queued behind exit");
        }
        self.transition(WorkerState::Terminated);
    }

    /// Open a transport, pausing between attempts. `None` once closed.
    fn connect(&mut self) -> Option<Box<dyn Transport>> {
        loop {
            if self.queue.is_closed() {
                return None;
            }
            match self.connector.connect() {
                Ok(transport) => {
                    self.stats.connects.inc();
                    info!(endpoint = %self.connector.endpoint(), "connected to collector");
                    self.transition(WorkerState::Connected);
                    return Some(transport);
                }
                Err(err) => {
                    error!(
                        endpoint = %self.connector.endpoint(),
                        error = %err,
                        "Failed to open collector transport"
                    );
                    self.transition(WorkerState::Backoff);
                    if self.queue.wait_closed(self.reconnect_delay) {
                        return None;
                    }
                }
            }
        }
    }

    fn backoff_and_reconnect(&mut self) -> Option<Box<dyn Transport>> {
        self.transition(WorkerState::Backoff);
        debug!(delay_ms = self.reconnect_delay.as_millis() as u64, "Backing off");
        if self.queue.wait_closed(self.reconnect_delay) {
            return None;
        }
        self.connect()
    }

    fn handle(&mut self, transport: &mut dyn Transport, envelope: Envelope) -> Step {
        let prepared = match &envelope.command {
            Command::Metric { kind, payload } => Some((
                kind.clone(),
                kind.path(),
                encode_form(&self.api_key, payload),
                payload.len() as u64,
            )),
            Command::Flush | Command::Exit => None,
        };
        let Some((kind, path, form, records)) = prepared else {
            return self.handle_control(envelope);
        };

        self.transition(WorkerState::Delivering);
        debug!(kind = %kind, records, "Sending");

        match submit_isolated(transport, &path, &form) {
            Ok(()) => {
                self.refused = false;
                self.stats.delivered.inc();
                self.stats.records_delivered.add(records);
                self.transition(WorkerState::Connected);
                envelope.complete();
                Step::Continue
            }
            Err(err) => {
                self.stats.failures.inc();
                self.report(&err, kind.as_str());

                if self.queue.is_closed() {
                    // Stopped while the request was in flight.
                    self.stats.abandoned.inc();
                    self.queue.park(envelope);
                    return Step::Exit;
                }

                if self.may_retry(&envelope) {
                    match self.queue.push_front(envelope) {
                        Ok(()) => {
                            self.stats.retries.inc();
                            Step::Reconnect
                        }
                        Err(envelope) => {
                            self.stats.abandoned.inc();
                            self.queue.park(envelope);
                            Step::Exit
                        }
                    }
                } else {
                    warn!(kind = %kind, "Dropping metric, reconnect disabled");
                    self.stats.abandoned.inc();
                    self.transition(WorkerState::Connected);
                    envelope.complete();
                    Step::Continue
                }
            }
        }
    }

    fn handle_control(&self, envelope: Envelope) -> Step {
        let step = match envelope.command {
            Command::Exit => {
                info!(remaining = self.queue.len(), "Exiting");
                Step::Exit
            }
            _ => {
                debug!("Flush barrier reached");
                Step::Continue
            }
        };
        envelope.complete();
        step
    }

    fn may_retry(&self, envelope: &Envelope) -> bool {
        envelope.allow_reconnect
            && self.allow_reconnect.load(Ordering::SeqCst)
            && !self.queue.reconnect_suppressed()
    }

    fn report(&mut self, err: &Error, kind: &str) {
        if err.is_connect() {
            if self.refused {
                debug!(error = %err, "Collector still unreachable");
            } else {
                warn!(
                    endpoint = %self.connector.endpoint(),
                    error = %err,
                    "unable to connect to PirateMetrics"
                );
                self.refused = true;
            }
        } else {
            error!(kind, error = %err, "Exception occurred while delivering metric");
        }
    }

    fn transition(&mut self, next: WorkerState) {
        if self.state != next {
            trace!(from = ?self.state, to = ?next, "worker state");
            self.state = next;
        }
    }
}

/// Submit, turning a panicking transport into an ordinary error
fn submit_isolated(
    transport: &mut dyn Transport,
    path: &str,
    form: &[(String, String)],
) -> Result<()> {
    match panic::catch_unwind(AssertUnwindSafe(|| transport.submit(path, form))) {
        Ok(result) => result,
        Err(payload) => Err(Error::Transport(format!(
            "transport panicked: {}",
            panic_message(payload.as_ref())
        ))),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s
    } else {
        "unknown panic"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::testing::{FakeCollector, Outcome};
    use crate::metric::{IntoPayload, MetricKind};
    use serde_json::json;
    use std::thread;

    struct Harness {
        collector: Arc<FakeCollector>,
        queue: Arc<BoundedQueue>,
        stats: Arc<Stats>,
        allow_reconnect: Arc<AtomicBool>,
    }

    impl Harness {
        fn new(outcomes: &[Outcome]) -> Self {
            crate::logging::init_test();
            let collector = FakeCollector::new();
            collector.script(outcomes);
            Self {
                collector,
                queue: Arc::new(BoundedQueue::new(100)),
                stats: Arc::new(Stats::default()),
                allow_reconnect: Arc::new(AtomicBool::new(true)),
            }
        }

        fn worker(&self, reconnect_delay: Duration) -> Worker {
            Worker::new(
                self.queue.clone(),
                self.collector.connector(),
                "test_token".to_string(),
                reconnect_delay,
                self.allow_reconnect.clone(),
                self.stats.clone(),
            )
        }

        fn spawn(&self) -> thread::JoinHandle<()> {
            let worker = self.worker(Duration::from_millis(10));
            thread::spawn(move || worker.run())
        }
    }

    fn metric(email: &str, allow_reconnect: bool) -> Envelope {
        let payload = json!({ "email": email }).into_payload().unwrap();
        Envelope::metric(MetricKind::Acquisition, payload, allow_reconnect)
    }

    #[test]
    fn test_delivers_in_order_then_exits() {
        let h = Harness::new(&[]);
        for i in 0..3 {
            h.queue.push(metric(&format!("{}@x.com", i), true)).unwrap();
        }
        h.queue.push_control(Envelope::exit(true)).unwrap();
        h.spawn().join().unwrap();

        assert_eq!(h.collector.emails(), vec!["0@x.com", "1@x.com", "2@x.com"]);
        assert_eq!(h.collector.paths()[0], "/api/v1/acquisitions");
        assert_eq!(
            h.collector.forms()[0][0],
            ("api_key".to_string(), "test_token".to_string())
        );
        assert_eq!(h.stats.delivered.get(), 3);
        assert_eq!(h.stats.records_delivered.get(), 3);
    }

    #[test]
    fn test_failure_is_retried_after_reconnect() {
        let h = Harness::new(&[Outcome::Refuse]);
        h.queue.push(metric("a@x.com", true)).unwrap();
        h.queue.push(metric("b@x.com", true)).unwrap();
        h.queue.push_control(Envelope::exit(true)).unwrap();
        h.spawn().join().unwrap();

        // Retried envelope keeps its place and is sent exactly once.
        assert_eq!(h.collector.emails(), vec!["a@x.com", "b@x.com"]);
        assert_eq!(h.collector.connects(), 2);
        assert_eq!(h.stats.retries.get(), 1);
        assert_eq!(h.stats.failures.get(), 1);
    }

    #[test]
    fn test_failure_dropped_when_envelope_disallows_reconnect() {
        let h = Harness::new(&[Outcome::Refuse]);
        h.queue.push(metric("a@x.com", false)).unwrap();
        h.queue.push(metric("b@x.com", true)).unwrap();
        h.queue.push_control(Envelope::exit(true)).unwrap();
        h.spawn().join().unwrap();

        assert_eq!(h.collector.emails(), vec!["b@x.com"]);
        assert_eq!(h.stats.abandoned.get(), 1);
        assert_eq!(h.collector.connects(), 1);
    }

    #[test]
    fn test_pending_no_reconnect_flush_suppresses_retry() {
        let h = Harness::new(&[Outcome::Refuse, Outcome::Refuse]);
        h.queue.push(metric("a@x.com", true)).unwrap();
        h.queue.push(metric("b@x.com", true)).unwrap();
        let (flush, waiter) = Envelope::flush(false).synchronous();
        h.queue.push_control(flush).unwrap();
        let worker = h.spawn();

        assert!(waiter.wait());
        assert!(h.collector.emails().is_empty());
        assert_eq!(h.stats.retries.get(), 0);

        h.queue.push_control(Envelope::exit(true)).unwrap();
        worker.join().unwrap();
    }

    #[test]
    fn test_shutdown_flag_suppresses_retry() {
        let h = Harness::new(&[Outcome::Refuse]);
        h.allow_reconnect.store(false, Ordering::SeqCst);
        h.queue.push(metric("a@x.com", true)).unwrap();
        h.queue.push_control(Envelope::exit(true)).unwrap();
        h.spawn().join().unwrap();

        assert!(h.collector.emails().is_empty());
        assert_eq!(h.stats.abandoned.get(), 1);
    }

    #[test]
    fn test_panicking_transport_is_isolated() {
        let h = Harness::new(&[Outcome::Panic]);
        h.queue.push(metric("a@x.com", true)).unwrap();
        h.queue.push_control(Envelope::exit(true)).unwrap();
        h.spawn().join().unwrap();

        assert_eq!(h.collector.emails(), vec!["a@x.com"]);
        assert_eq!(h.stats.failures.get(), 1);
    }

    #[test]
    fn test_sync_envelope_released_after_delivery() {
        let h = Harness::new(&[]);
        let worker = h.spawn();
        let (envelope, waiter) = metric("a@x.com", true).synchronous();
        h.queue.push(envelope).unwrap();

        assert!(waiter.wait());
        assert_eq!(h.collector.emails(), vec!["a@x.com"]);

        h.queue.close();
        worker.join().unwrap();
    }

    #[test]
    fn test_close_during_backoff_terminates() {
        let h = Harness::new(&[Outcome::Refuse]);
        let worker = h.worker(Duration::from_secs(60));
        let handle = thread::spawn(move || worker.run());
        h.queue.push(metric("a@x.com", true)).unwrap();

        thread::sleep(Duration::from_millis(50));
        assert_eq!(h.queue.close(), 1);
        handle.join().unwrap();
        assert!(h.collector.emails().is_empty());
    }
}
