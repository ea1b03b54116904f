use crate::reattach::ReattachDescriptor;
use std::collections::HashMap;
use std::sync::Mutex;

/// Result of resolving a set of connections.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResolveResponse {
    /// connection name -> descriptor of the instance serving it
    pub succeeded: HashMap<String, ReattachDescriptor>,
    /// plugin instance -> failure reason
    pub failed: HashMap<String, String>,
}

/// Collects per-instance outcomes of one in-flight resolve.
///
/// Successes and failures have separate locks so tasks finishing different
/// instances do not contend.
#[derive(Default)]
pub struct ResponseAggregate {
    succeeded: Mutex<HashMap<String, ReattachDescriptor>>,
    failed: Mutex<HashMap<String, String>>,
}

impl ResponseAggregate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_success(&self, connection: impl Into<String>, descriptor: ReattachDescriptor) {
        self.succeeded
            .lock()
            .expect("ResponseAggregate lock poisoned")
            .insert(connection.into(), descriptor);
    }

    pub fn add_failure(&self, instance: impl Into<String>, error: impl Into<String>) {
        self.failed
            .lock()
            .expect("ResponseAggregate lock poisoned")
            .insert(instance.into(), error.into());
    }

    /// Drain the collected outcomes.
    pub fn finish(&self) -> ResolveResponse {
        ResolveResponse {
            succeeded: std::mem::take(
                &mut *self.succeeded.lock().expect("ResponseAggregate lock poisoned"),
            ),
            failed: std::mem::take(&mut *self.failed.lock().expect("ResponseAggregate lock poisoned")),
        }
    }
}
