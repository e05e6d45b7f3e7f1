//! Activity classifier abstraction.
//!
//! The `ActivityClassifier` trait decouples the pipeline from any concrete
//! scorer (hand-written rules, a remote model service, a test double).
//! `&mut self` on `classify` lets implementations keep per-call scratch
//! state; all access is serialised through `ClassifierHandle`'s mutex.
//!
//! The pipeline never calls a classifier directly. `worker::ClassifierWorker`
//! owns the single call slot, enforces the timeout and discards late results.

pub mod rules;
pub mod worker;

#[cfg(feature = "remote-classifier")]
pub mod remote;

#[cfg(feature = "remote-classifier")]
pub use remote::{RemoteClassifier, RemoteClassifierConfig};
pub use rules::RuleClassifier;
pub use worker::{ClassifierWorker, Completion, Origin, Outcome};

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::error::Result;
use crate::features::FeatureVector;
use crate::ipc::events::Classification;
use crate::labels::LabelSet;

/// Contract for activity scorers.
pub trait ActivityClassifier: Send + 'static {
    /// Short name used in logs.
    fn name(&self) -> &str {
        "classifier"
    }

    /// One-time preparation before the first `classify` call.
    ///
    /// # Errors
    /// A failure here aborts engine start.
    fn warm_up(&mut self) -> Result<()> {
        Ok(())
    }

    /// Score one feature vector.
    ///
    /// `timeout` is advisory: implementations that perform I/O should bound
    /// their own calls by it. The worker abandons the call at the deadline
    /// either way. The returned classification must carry
    /// `features.timestamp` and a label from `labels`.
    fn classify(
        &mut self,
        features: &FeatureVector,
        labels: &LabelSet,
        timeout: Duration,
    ) -> Result<Classification>;
}

/// Thread-safe reference-counted handle to any `ActivityClassifier`.
#[derive(Clone)]
pub struct ClassifierHandle(pub Arc<Mutex<dyn ActivityClassifier>>);

impl ClassifierHandle {
    pub fn new<C: ActivityClassifier>(classifier: C) -> Self {
        Self(Arc::new(Mutex::new(classifier)))
    }

    pub fn name(&self) -> String {
        self.0.lock().name().to_string()
    }
}

impl std::fmt::Debug for ClassifierHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClassifierHandle").finish_non_exhaustive()
    }
}
