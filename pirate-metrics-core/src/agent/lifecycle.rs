//! The public agent: owns the queue and worker, and absorbs every failure

use std::process;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{Receiver, RecvTimeoutError};
use parking_lot::Mutex;
use tracing::{debug, error, info, warn, Dispatch};

use super::envelope::Envelope;
use super::queue::{BoundedQueue, Rejected};
use super::stats::{DeliveryStats, Stats};
use super::transport::{Connector, HttpConnector};
use super::worker::Worker;
use crate::config::AgentConfig;
use crate::error::{Error, Result};
use crate::metric::{IntoPayload, MetricKind};

/// A started worker and the queue it drains
struct WorkerHandle {
    queue: Arc<BoundedQueue>,
    thread: JoinHandle<()>,
    /// Disconnects when the worker thread exits
    done: Receiver<()>,
    /// Process that started the worker
    pid: u32,
}

impl WorkerHandle {
    fn is_alive(&self) -> bool {
        self.pid == process::id() && !self.thread.is_finished() && !self.queue.is_closed()
    }
}

/// Builder for [`Agent`]
pub struct AgentBuilder {
    config: AgentConfig,
    connector: Option<Arc<dyn Connector>>,
    dispatch: Option<Dispatch>,
}

impl AgentBuilder {
    /// Deliver through `connector` instead of HTTP to the configured collector
    pub fn connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = Some(connector);
        self
    }

    /// Log through `dispatch` instead of the dispatcher current at `build`
    pub fn dispatch(mut self, dispatch: Dispatch) -> Self {
        self.dispatch = Some(dispatch);
        self
    }

    pub fn build(self) -> Agent {
        let dispatch = self
            .dispatch
            .unwrap_or_else(|| tracing::dispatcher::get_default(|d| d.clone()));

        Agent {
            synchronous: AtomicBool::new(self.config.synchronous),
            config: self.config,
            connector: self.connector,
            dispatch,
            allow_reconnect: Arc::new(AtomicBool::new(true)),
            queue_full_warned: AtomicBool::new(false),
            stats: Arc::new(Stats::default()),
            worker: Mutex::new(None),
        }
    }
}

/// Metrics shipping agent
///
/// Submissions are queued and delivered by a single background worker
/// thread, started lazily on the first submission and restarted
/// transparently after `stop`, after the worker exits, or in a forked
/// child process. No public method returns an error or panics because of
/// delivery problems: failures are logged and the call returns `None`.
///
/// ```rust,no_run
/// use pirate_metrics_core::{Agent, AgentConfig};
/// use serde_json::json;
///
/// let agent = Agent::new(AgentConfig {
///     collector: Some("localhost:10001".to_string()),
///     ..AgentConfig::new("api-key")
/// });
///
/// agent.acquisition(json!({"email": "test@example.com"}));
/// agent.revenue_sync(json!({"email": "test@example.com", "amount_in_cents": 1000}));
/// agent.flush(false);
/// ```
///
/// Dropping an enabled agent runs [`Agent::cleanup`]. Agents that are
/// never dropped (statics, `process::exit`) should call it explicitly.
pub struct Agent {
    config: AgentConfig,
    connector: Option<Arc<dyn Connector>>,
    dispatch: Dispatch,
    synchronous: AtomicBool,
    /// Shared with the worker; cleared by `cleanup`
    allow_reconnect: Arc<AtomicBool>,
    queue_full_warned: AtomicBool,
    stats: Arc<Stats>,
    worker: Mutex<Option<WorkerHandle>>,
}

impl Agent {
    /// Agent delivering over HTTP to the collector named in `config`
    pub fn new(config: AgentConfig) -> Self {
        Self::builder(config).build()
    }

    pub fn builder(config: AgentConfig) -> AgentBuilder {
        AgentBuilder {
            config,
            connector: None,
            dispatch: None,
        }
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    pub fn is_synchronous(&self) -> bool {
        self.synchronous.load(Ordering::SeqCst)
    }

    /// Change the delivery mode used by the plain metric helpers
    pub fn set_synchronous(&self, synchronous: bool) {
        self.synchronous.store(synchronous, Ordering::SeqCst);
    }

    /// True when a worker started by this process is still alive
    pub fn is_running(&self) -> bool {
        self.worker
            .lock()
            .as_ref()
            .map_or(false, WorkerHandle::is_alive)
    }

    /// Envelopes currently waiting for the worker
    pub fn queue_size(&self) -> usize {
        self.worker
            .lock()
            .as_ref()
            .map_or(0, |handle| handle.queue.len())
    }

    pub fn stats(&self) -> DeliveryStats {
        self.stats.snapshot()
    }

    /// Submit a metric.
    ///
    /// With `synchronous` the call blocks until the worker has handled the
    /// envelope (delivered, or dropped after a failure with reconnects
    /// disabled). A synchronous caller whose envelope is discarded by
    /// `stop` stays blocked. Returns the kind once accepted, `None` when
    /// the agent is disabled, the queue is full, or the payload is invalid.
    pub fn submit<P: IntoPayload>(
        &self,
        kind: MetricKind,
        payload: P,
        synchronous: bool,
    ) -> Option<MetricKind> {
        if !self.config.enabled {
            return None;
        }

        self.in_scope(|| match self.send_metric(kind, payload, synchronous) {
            Ok(sent) => sent,
            Err(err) => {
                error!(error = %err, "Exception occurred");
                None
            }
        })
    }

    /// Submit using the agent's default delivery mode
    pub fn submit_default<P: IntoPayload>(&self, kind: MetricKind, payload: P) -> Option<MetricKind> {
        self.submit(kind, payload, self.is_synchronous())
    }

    /// Record a customer acquisition
    ///
    /// ```rust,no_run
    /// # use pirate_metrics_core::{Agent, AgentConfig};
    /// # let agent = Agent::new(AgentConfig::new("key"));
    /// agent.acquisition(serde_json::json!({
    ///     "email": "test@example.com",
    ///     "level": "Double Uranium",
    /// }));
    /// ```
    pub fn acquisition<P: IntoPayload>(&self, customer: P) -> Option<MetricKind> {
        self.submit_default(MetricKind::Acquisition, customer)
    }

    pub fn acquisition_sync<P: IntoPayload>(&self, customer: P) -> Option<MetricKind> {
        self.submit(MetricKind::Acquisition, customer, true)
    }

    pub fn activation<P: IntoPayload>(&self, customer: P) -> Option<MetricKind> {
        self.submit_default(MetricKind::Activation, customer)
    }

    pub fn activation_sync<P: IntoPayload>(&self, customer: P) -> Option<MetricKind> {
        self.submit(MetricKind::Activation, customer, true)
    }

    pub fn retention<P: IntoPayload>(&self, customer: P) -> Option<MetricKind> {
        self.submit_default(MetricKind::Retention, customer)
    }

    pub fn retention_sync<P: IntoPayload>(&self, customer: P) -> Option<MetricKind> {
        self.submit(MetricKind::Retention, customer, true)
    }

    pub fn revenue<P: IntoPayload>(&self, customer: P) -> Option<MetricKind> {
        self.submit_default(MetricKind::Revenue, customer)
    }

    pub fn revenue_sync<P: IntoPayload>(&self, customer: P) -> Option<MetricKind> {
        self.submit(MetricKind::Revenue, customer, true)
    }

    pub fn referral<P: IntoPayload>(&self, customer: P) -> Option<MetricKind> {
        self.submit_default(MetricKind::Referral, customer)
    }

    pub fn referral_sync<P: IntoPayload>(&self, customer: P) -> Option<MetricKind> {
        self.submit(MetricKind::Referral, customer, true)
    }

    /// Block until everything submitted so far has been handled.
    ///
    /// With `allow_reconnect == false`, metrics that fail to deliver ahead
    /// of the flush are dropped instead of retried, so this returns promptly
    /// when the collector is unreachable. No-op (returns false) when the
    /// agent is disabled or no worker is running.
    pub fn flush(&self, allow_reconnect: bool) -> bool {
        if !self.config.enabled {
            return false;
        }

        self.in_scope(|| {
            let Some(queue) = self.live_queue() else {
                return false;
            };
            let (envelope, waiter) = Envelope::flush(allow_reconnect).synchronous();
            if queue.push_control(envelope).is_err() {
                return false;
            }
            debug!(queue_size = queue.len(), allow_reconnect, "Flushing");
            waiter.wait()
        })
    }

    /// Kill the worker immediately, discarding everything still queued.
    ///
    /// A request already in flight may still complete. Synchronous callers
    /// waiting on discarded envelopes are not released. The next
    /// submission starts a fresh worker.
    pub fn stop(&self) {
        self.in_scope(|| {
            let Some(handle) = self.worker.lock().take() else {
                return;
            };
            let discarded = handle.queue.close();
            self.stats.abandoned.add(discarded as u64);
            info!(discarded, "Stopped agent worker");
            retire(handle);
        })
    }

    /// Give queued metrics a bounded amount of time to go out.
    ///
    /// Disables reconnects, queues an `exit` behind everything pending and
    /// waits up to `exit_flush_timeout` for the worker to finish. On
    /// timeout the remaining metrics are dropped and the worker stopped.
    /// Runs automatically when the agent is dropped.
    pub fn cleanup(&self) {
        if !self.config.enabled {
            return;
        }

        self.in_scope(|| {
            let (queue, done) = {
                let worker = self.worker.lock();
                match worker.as_ref() {
                    Some(handle) if handle.is_alive() => (handle.queue.clone(), handle.done.clone()),
                    _ => return,
                }
            };

            info!(queue_size = queue.len(), "Cleaning up agent");
            self.allow_reconnect.store(false, Ordering::SeqCst);
            if queue.push_control(Envelope::exit(false)).is_err() {
                return;
            }

            match done.recv_timeout(self.config.exit_flush_timeout()) {
                Err(RecvTimeoutError::Timeout) => {
                    // The exit envelope itself is not a metric.
                    let pending = queue.len().saturating_sub(1);
                    if pending > 0 {
                        error!(
                            dropped = pending,
                            "Timed out working agent thread on exit, dropping {} metrics", pending
                        );
                    } else {
                        error!("Timed out PirateMetrics Agent, exiting");
                    }
                    self.stop();
                }
                _ => debug!("Agent worker finished"),
            }
        })
    }

    fn in_scope<R>(&self, f: impl FnOnce() -> R) -> R {
        tracing::dispatcher::with_default(&self.dispatch, f)
    }

    fn live_queue(&self) -> Option<Arc<BoundedQueue>> {
        self.worker
            .lock()
            .as_ref()
            .filter(|handle| handle.is_alive())
            .map(|handle| handle.queue.clone())
    }

    fn send_metric<P: IntoPayload>(
        &self,
        kind: MetricKind,
        payload: P,
        synchronous: bool,
    ) -> Result<Option<MetricKind>> {
        let payload = payload.into_payload()?;
        let queue = self.ensure_running()?;
        let envelope = Envelope::metric(
            kind.clone(),
            payload,
            self.allow_reconnect.load(Ordering::SeqCst),
        );
        let (envelope, waiter) = if synchronous {
            let (envelope, waiter) = envelope.synchronous();
            (envelope, Some(waiter))
        } else {
            (envelope, None)
        };

        // Held while waiting: a stopped queue keeps our gate parked.
        let Some(_queue) = self.enqueue(queue, envelope)? else {
            return Ok(None);
        };
        self.accepted(&kind);

        match waiter {
            None => Ok(Some(kind)),
            Some(waiter) => {
                if waiter.wait() {
                    Ok(Some(kind))
                } else {
                    debug!(kind = %kind, "Synchronous metric dropped before delivery");
                    Ok(None)
                }
            }
        }
    }

    /// Push onto `queue`, moving to a fresh worker once if it was closed
    /// after we looked it up. Returns the queue holding the envelope, or
    /// `None` when it was full.
    fn enqueue(
        &self,
        queue: Arc<BoundedQueue>,
        envelope: Envelope,
    ) -> Result<Option<Arc<BoundedQueue>>> {
        let envelope = match queue.push(envelope) {
            Ok(()) => return Ok(Some(queue)),
            Err(Rejected::Full(rejected)) => {
                self.queue_full(&queue, rejected);
                return Ok(None);
            }
            Err(Rejected::Closed(envelope)) => envelope,
        };

        debug!(kind = envelope.label(), "Queue closed under submission, restarting worker");
        let queue = self.ensure_running()?;
        match queue.push(envelope) {
            Ok(()) => Ok(Some(queue)),
            Err(Rejected::Full(rejected)) => {
                self.queue_full(&queue, rejected);
                Ok(None)
            }
            Err(Rejected::Closed(rejected)) => Err(Error::Runtime(format!(
                "worker queue closed twice while submitting {}",
                rejected.label()
            ))),
        }
    }

    fn accepted(&self, kind: &MetricKind) {
        self.queue_full_warned.store(false, Ordering::SeqCst);
        self.stats.enqueued.inc();
        debug!(kind = %kind, "Queueing");
    }

    fn queue_full(&self, queue: &BoundedQueue, rejected: Envelope) {
        self.stats.dropped_overflow.inc();
        let queue_size = queue.len();
        if !self.queue_full_warned.swap(true, Ordering::SeqCst) {
            warn!(queue_size, "Queue full({}), dropping commands...", queue_size);
        }
        debug!(
            kind = rejected.label(),
            queue_size, "Dropping command, queue full"
        );
    }

    /// Return the live queue, starting a worker if there is none
    fn ensure_running(&self) -> Result<Arc<BoundedQueue>> {
        let mut worker = self.worker.lock();
        if let Some(handle) = worker.as_ref() {
            if handle.is_alive() {
                return Ok(handle.queue.clone());
            }
        }

        if let Some(stale) = worker.take() {
            if stale.pid != process::id() {
                info!(
                    parent_pid = stale.pid,
                    pid = process::id(),
                    "Process forked, restarting worker"
                );
            } else {
                let discarded = stale.queue.close();
                self.stats.abandoned.add(discarded as u64);
            }
            retire(stale);
        }

        let handle = self.start_worker()?;
        let queue = handle.queue.clone();
        *worker = Some(handle);
        Ok(queue)
    }

    fn start_worker(&self) -> Result<WorkerHandle> {
        let connector = match &self.connector {
            Some(connector) => connector.clone(),
            None => Arc::new(HttpConnector::new(self.config.base_url()?)),
        };

        self.allow_reconnect.store(true, Ordering::SeqCst);
        let queue = Arc::new(BoundedQueue::new(self.config.max_buffer));
        let worker = Worker::new(
            queue.clone(),
            connector,
            self.config.api_key.clone(),
            self.config.reconnect_delay(),
            self.allow_reconnect.clone(),
            self.stats.clone(),
        );

        let (done_tx, done_rx) = crossbeam_channel::bounded::<()>(0);
        let dispatch = self.dispatch.clone();
        let thread = thread::Builder::new()
            .name("pirate-metrics-worker".to_string())
            .spawn(move || {
                let _done = done_tx;
                tracing::dispatcher::with_default(&dispatch, || worker.run());
            })
            .map_err(|e| Error::Runtime(format!("failed to spawn worker thread: {}", e)))?;

        info!(max_buffer = self.config.max_buffer, "Starting thread");

        Ok(WorkerHandle {
            queue,
            thread,
            done: done_rx,
            pid: process::id(),
        })
    }
}

/// Let go of a worker handle without waiting on its thread
fn retire(handle: WorkerHandle) {
    if handle.pid != process::id() {
        // Inherited across fork: the thread does not exist in this process.
        std::mem::forget(handle);
    }
}

impl Drop for Agent {
    fn drop(&mut self) {
        if self.config.enabled {
            self.cleanup();
        }
    }
}
