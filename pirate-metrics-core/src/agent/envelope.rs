//! Queued units of work and their completion gates

use crossbeam_channel::{Receiver, Sender};
#[cfg(test)]
use crossbeam_channel::TryRecvError;

use crate::metric::{MetricKind, Payload};

/// What an envelope asks the worker to do
#[derive(Debug)]
pub(crate) enum Command {
    /// Deliver records to the collector
    Metric { kind: MetricKind, payload: Payload },
    /// Barrier: everything queued earlier has been handled once this is popped
    Flush,
    /// Terminate the worker loop
    Exit,
}

/// One queued unit of work
///
/// Envelopes are moved, never cloned: a retry moves the same envelope back
/// to the head of the queue, so it can neither be duplicated nor lost.
#[derive(Debug)]
pub(crate) struct Envelope {
    pub(crate) command: Command,
    pub(crate) allow_reconnect: bool,
    completion: Option<CompletionSignal>,
}

impl Envelope {
    pub(crate) fn metric(kind: MetricKind, payload: Payload, allow_reconnect: bool) -> Self {
        Self {
            command: Command::Metric { kind, payload },
            allow_reconnect,
            completion: None,
        }
    }

    pub(crate) fn flush(allow_reconnect: bool) -> Self {
        Self {
            command: Command::Flush,
            allow_reconnect,
            completion: None,
        }
    }

    pub(crate) fn exit(allow_reconnect: bool) -> Self {
        Self {
            command: Command::Exit,
            allow_reconnect,
            completion: None,
        }
    }

    /// Attach a fresh completion gate, returning the caller's end of it
    pub(crate) fn synchronous(mut self) -> (Self, CompletionWaiter) {
        let (signal, waiter) = completion_gate();
        self.completion = Some(signal);
        (self, waiter)
    }

    pub(crate) fn is_control(&self) -> bool {
        matches!(self.command, Command::Flush | Command::Exit)
    }

    /// Control envelopes queued with reconnects disabled stop the worker
    /// from retrying anything ahead of them.
    pub(crate) fn suppresses_reconnect(&self) -> bool {
        self.is_control() && !self.allow_reconnect
    }

    pub(crate) fn label(&self) -> &str {
        match &self.command {
            Command::Metric { kind, .. } => kind.as_str(),
            Command::Flush => "flush",
            Command::Exit => "exit",
        }
    }

    /// Detach the completion gate without signaling it
    pub(crate) fn take_completion(&mut self) -> Option<CompletionSignal> {
        self.completion.take()
    }

    /// Mark this envelope as fully handled, releasing a synchronous caller
    pub(crate) fn complete(self) {
        if let Some(signal) = self.completion {
            signal.signal();
        }
    }
}

/// Worker-side end of a completion gate
#[derive(Debug)]
pub(crate) struct CompletionSignal(Sender<()>);

impl CompletionSignal {
    fn signal(self) {
        // The caller may have gone away; nothing to do then.
        let _ = self.0.try_send(());
    }
}

/// Caller-side end of a completion gate
#[derive(Debug)]
pub(crate) struct CompletionWaiter(Receiver<()>);

impl CompletionWaiter {
    /// Block until the worker has handled the envelope.
    ///
    /// An envelope discarded by `stop` keeps its gate parked on the closed
    /// queue, so its caller stays blocked. Returns false only if the gate
    /// was dropped without being signaled.
    pub(crate) fn wait(self) -> bool {
        self.0.recv().is_ok()
    }

    /// Neither signaled nor dropped yet
    #[cfg(test)]
    pub(crate) fn is_pending(&self) -> bool {
        matches!(self.0.try_recv(), Err(TryRecvError::Empty))
    }
}

/// A single-slot, single-use signal
fn completion_gate() -> (CompletionSignal, CompletionWaiter) {
    let (tx, rx) = crossbeam_channel::bounded(1);
    (CompletionSignal(tx), CompletionWaiter(rx))
}
