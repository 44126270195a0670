//! In-memory collector for unit tests

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;

use super::transport::{Connector, Form, Transport};
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy)]
pub(crate) enum Outcome {
    Accept,
    /// Hold the worker for a while, then accept
    Delay(Duration),
    Refuse,
    Panic,
}

/// Records accepted submissions; scripted outcomes are consumed first
#[derive(Default)]
pub(crate) struct FakeCollector {
    outcomes: Mutex<VecDeque<Outcome>>,
    sent: Mutex<Vec<(String, Form)>>,
    connects: AtomicUsize,
}

impl FakeCollector {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn script(&self, outcomes: &[Outcome]) {
        self.outcomes.lock().extend(outcomes.iter().copied());
    }

    pub(crate) fn connector(self: &Arc<Self>) -> Arc<dyn Connector> {
        Arc::new(FakeConnector(self.clone()))
    }

    pub(crate) fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub(crate) fn paths(&self) -> Vec<String> {
        self.sent.lock().iter().map(|(p, _)| p.clone()).collect()
    }

    pub(crate) fn forms(&self) -> Vec<Form> {
        self.sent.lock().iter().map(|(_, f)| f.clone()).collect()
    }

    /// Every `data[][email]` value received, in arrival order
    pub(crate) fn emails(&self) -> Vec<String> {
        self.sent
            .lock()
            .iter()
            .flat_map(|(_, form)| form.iter())
            .filter(|(k, _)| k == "data[][email]")
            .map(|(_, v)| v.clone())
            .collect()
    }
}

struct FakeConnector(Arc<FakeCollector>);

impl Connector for FakeConnector {
    fn connect(&self) -> Result<Box<dyn Transport>> {
        self.0.connects.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeTransport(self.0.clone())))
    }

    fn endpoint(&self) -> String {
        "fake://collector".to_string()
    }
}

struct FakeTransport(Arc<FakeCollector>);

impl Transport for FakeTransport {
    fn submit(&mut self, path: &str, form: &[(String, String)]) -> Result<()> {
        let outcome = self
            .0
            .outcomes
            .lock()
            .pop_front()
            .unwrap_or(Outcome::Accept);
        match outcome {
            Outcome::Accept => {
                self.0.sent.lock().push((path.to_string(), form.to_vec()));
                Ok(())
            }
            Outcome::Delay(pause) => {
                thread::sleep(pause);
                self.0.sent.lock().push((path.to_string(), form.to_vec()));
                Ok(())
            }
            Outcome::Refuse => Err(Error::Connect("connection refused".to_string())),
            Outcome::Panic => panic!("transport blew up"),
        }
    }
}
