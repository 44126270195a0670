//! Agent behaviour through the public API, with an in-memory connector

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

use parking_lot::Mutex;
use pirate_metrics_core::agent::{Connector, Transport};
use pirate_metrics_core::{Agent, AgentConfig, Error, MetricKind, Result};
use serde_json::json;

/// Accepts everything, failing the first `fail_first` submissions
#[derive(Default)]
struct MemoryCollector {
    fail_first: AtomicUsize,
    forms: Mutex<Vec<(String, Vec<(String, String)>)>>,
}

impl MemoryCollector {
    fn emails(&self) -> Vec<String> {
        self.forms
            .lock()
            .iter()
            .flat_map(|(_, form)| form.iter())
            .filter(|(k, _)| k == "data[][email]")
            .map(|(_, v)| v.clone())
            .collect()
    }
}

struct MemoryConnector(Arc<MemoryCollector>);

impl Connector for MemoryConnector {
    fn connect(&self) -> Result<Box<dyn Transport>> {
        Ok(Box::new(MemoryTransport(self.0.clone())))
    }

    fn endpoint(&self) -> String {
        "memory".to_string()
    }
}

struct MemoryTransport(Arc<MemoryCollector>);

impl Transport for MemoryTransport {
    fn submit(&mut self, path: &str, form: &[(String, String)]) -> Result<()> {
        let failing = self
            .0
            .fail_first
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(Error::Status {
                status: 503,
                body: "busy".to_string(),
            });
        }
        self.0.forms.lock().push((path.to_string(), form.to_vec()));
        Ok(())
    }
}

fn agent(collector: &Arc<MemoryCollector>) -> Agent {
    Agent::builder(AgentConfig {
        reconnect_delay_ms: 10,
        ..AgentConfig::new("test_token")
    })
    .connector(Arc::new(MemoryConnector(collector.clone())))
    .build()
}

#[test]
fn test_concurrent_submitters_keep_their_own_order() {
    let collector = Arc::new(MemoryCollector::default());
    let agent = Arc::new(agent(&collector));

    let submitters: Vec<_> = (0..4)
        .map(|t| {
            let agent = agent.clone();
            thread::spawn(move || {
                for i in 0..25 {
                    agent.acquisition(json!({"email": format!("{}-{}", t, i)}));
                }
            })
        })
        .collect();
    for submitter in submitters {
        submitter.join().unwrap();
    }
    assert!(agent.flush(true));

    let emails = collector.emails();
    assert_eq!(emails.len(), 100);
    for t in 0..4 {
        let prefix = format!("{}-", t);
        let seen: Vec<usize> = emails
            .iter()
            .filter_map(|e| e.strip_prefix(&prefix))
            .map(|i| i.parse().unwrap())
            .collect();
        assert_eq!(seen, (0..25).collect::<Vec<_>>());
    }
}

#[test]
fn test_transient_failures_are_retried_in_place() {
    let collector = Arc::new(MemoryCollector::default());
    collector.fail_first.store(2, Ordering::SeqCst);
    let agent = agent(&collector);

    agent.revenue(json!({"email": "a@example.com", "amount_in_cents": 500}));
    agent.revenue(json!({"email": "b@example.com", "amount_in_cents": 700}));
    assert!(agent.flush(true));

    assert_eq!(collector.emails(), vec!["a@example.com", "b@example.com"]);
    let stats = agent.stats();
    assert_eq!(stats.retries, 2);
    assert_eq!(stats.delivered, 2);
    assert_eq!(stats.connects, 3);
}

#[test]
fn test_every_business_kind_has_its_endpoint() {
    let collector = Arc::new(MemoryCollector::default());
    let agent = agent(&collector);

    for kind in MetricKind::BUSINESS {
        assert_eq!(
            agent.submit(kind.clone(), json!({"email": "a@example.com"}), true),
            Some(kind)
        );
    }

    let paths: Vec<String> = collector.forms.lock().iter().map(|(p, _)| p.clone()).collect();
    assert_eq!(
        paths,
        vec![
            "/api/v1/acquisitions",
            "/api/v1/activations",
            "/api/v1/retentions",
            "/api/v1/revenues",
            "/api/v1/referrals",
        ]
    );
}

#[test]
fn test_cleanup_then_reuse() {
    let collector = Arc::new(MemoryCollector::default());
    let agent = agent(&collector);

    agent.acquisition(json!({"email": "before@example.com"}));
    agent.cleanup();
    assert!(!agent.is_running());

    agent.acquisition_sync(json!({"email": "after@example.com"}));
    assert_eq!(
        collector.emails(),
        vec!["before@example.com", "after@example.com"]
    );
}
