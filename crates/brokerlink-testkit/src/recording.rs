use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use brokerlink::{Identifier, Notifier, TunnelError};

/// Records lifecycle callbacks for assertions. Clones share state.
#[derive(Clone, Default)]
pub struct RecordingNotifier {
    events: Arc<Mutex<Vec<String>>>,
}

impl RecordingNotifier {
    pub fn new() -> RecordingNotifier {
        RecordingNotifier::default()
    }

    /// Event names in callback order: `connected`, `disconnected:<err>`,
    /// `reconnected`, `exited:<err>`.
    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    /// Bare event kinds, without error payloads.
    pub fn kinds(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .map(|e| e.split(':').next().unwrap_or_default().to_owned())
            .collect()
    }

    pub fn count(&self, kind: &str) -> usize {
        self.kinds().iter().filter(|k| *k == kind).count()
    }

    /// Wait until `kind` has been seen `at_least` times or the timeout
    /// lapses (panicking on timeout).
    pub async fn wait_for(&self, kind: &str, at_least: usize, timeout: std::time::Duration) {
        let deadline = tokio::time::Instant::now() + timeout;
        while self.count(kind) < at_least {
            assert!(
                tokio::time::Instant::now() < deadline,
                "timed out waiting for {at_least}x {kind}; saw {:?}",
                self.events()
            );
            tokio::time::sleep(std::time::Duration::from_millis(25)).await;
        }
    }

    fn push(&self, event: String) {
        self.events.lock().unwrap().push(event);
    }
}

impl Notifier for RecordingNotifier {
    fn connected(&self) {
        self.push("connected".to_owned());
    }

    fn disconnected(&self, err: &TunnelError) {
        self.push(format!("disconnected:{err}"));
    }

    fn reconnected(&self) {
        self.push("reconnected".to_owned());
    }

    fn exited(&self, err: &TunnelError) {
        self.push(format!("exited:{err}"));
    }
}

/// Deterministic machine ids plus call accounting, for rebuild-policy
/// assertions. Clones share state.
#[derive(Clone, Default)]
pub struct CountingIdentifier {
    initial_calls: Arc<AtomicU32>,
    rebuild_calls: Arc<AtomicU32>,
}

impl CountingIdentifier {
    pub fn new() -> CountingIdentifier {
        CountingIdentifier::default()
    }

    pub fn rebuilds(&self) -> u32 {
        self.rebuild_calls.load(Ordering::Relaxed)
    }

    pub fn initial_reads(&self) -> u32 {
        self.initial_calls.load(Ordering::Relaxed)
    }
}

impl Identifier for CountingIdentifier {
    fn machine_id(&self, rebuild: bool) -> String {
        if rebuild {
            let n = self.rebuild_calls.fetch_add(1, Ordering::Relaxed) + 1;
            format!("machine-rebuilt-{n}")
        } else {
            self.initial_calls.fetch_add(1, Ordering::Relaxed);
            "machine-initial".to_owned()
        }
    }
}
