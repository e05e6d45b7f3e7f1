//! Single-slot classifier call manager.
//!
//! A dedicated thread owns the classifier calls. The coordinator hands it at
//! most one job at a time and learns about completion through `results()`,
//! which it selects on alongside its other inputs. A job that overruns its
//! timeout is abandoned: the coordinator is told immediately, and whatever
//! the worker eventually returns for it is discarded. The slot stays occupied
//! until the worker actually returns, so there is never more than one call
//! running against the classifier.

use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender};
use tracing::{debug, warn};

use crate::classifier::ClassifierHandle;
use crate::clock::deadline_after;
use crate::error::{Result, VigilError};
use crate::features::FeatureVector;
use crate::ipc::events::Classification;
use crate::labels::LabelSet;

/// Who asked for a classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    Automatic,
    Manual,
}

struct Job {
    id: u64,
    features: FeatureVector,
}

/// Raw worker reply, matched back to its job by id.
pub struct Outcome {
    id: u64,
    result: Result<Classification>,
    elapsed: Duration,
}

#[derive(Debug, Clone, Copy)]
struct InFlight {
    id: u64,
    origin: Origin,
    deadline: Instant,
    abandoned: bool,
}

/// What a worker reply means for the coordinator.
#[derive(Debug)]
pub enum Completion {
    Classified {
        origin: Origin,
        classification: Classification,
        elapsed: Duration,
    },
    Failed {
        origin: Origin,
        error: VigilError,
    },
    /// Reply for a job that had already timed out.
    Discarded { elapsed: Duration },
}

pub struct ClassifierWorker {
    jobs: Option<Sender<Job>>,
    results: Receiver<Outcome>,
    in_flight: Option<InFlight>,
    next_id: u64,
    timeout: Duration,
    labels: LabelSet,
}

impl ClassifierWorker {
    /// Spawn the worker thread.
    ///
    /// The thread exits once this value is dropped and any running call returns.
    pub fn spawn(classifier: ClassifierHandle, labels: LabelSet, timeout: Duration) -> Result<Self> {
        let (job_tx, job_rx) = crossbeam_channel::bounded::<Job>(1);
        let (result_tx, result_rx) = crossbeam_channel::bounded::<Outcome>(1);
        let thread_labels = labels.clone();

        std::thread::Builder::new()
            .name("vigil-classifier".into())
            .spawn(move || {
                for job in job_rx.iter() {
                    let started = Instant::now();
                    let result = classifier
                        .0
                        .lock()
                        .classify(&job.features, &thread_labels, timeout);
                    let outcome = Outcome {
                        id: job.id,
                        result,
                        elapsed: started.elapsed(),
                    };
                    if result_tx.send(outcome).is_err() {
                        break;
                    }
                }
                debug!("classifier worker exiting");
            })?;

        Ok(Self {
            jobs: Some(job_tx),
            results: result_rx,
            in_flight: None,
            next_id: 0,
            timeout,
            labels,
        })
    }

    pub fn is_idle(&self) -> bool {
        self.in_flight.is_none()
    }

    /// Origin of the current job, if any and not yet abandoned.
    pub fn active_origin(&self) -> Option<Origin> {
        self.in_flight
            .filter(|f| !f.abandoned)
            .map(|f| f.origin)
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Receiver to select on for worker replies.
    pub fn results(&self) -> &Receiver<Outcome> {
        &self.results
    }

    /// Hand `features` to the worker. Gives the vector back if the slot is busy.
    pub fn dispatch(
        &mut self,
        features: FeatureVector,
        origin: Origin,
    ) -> std::result::Result<u64, FeatureVector> {
        if self.in_flight.is_some() {
            return Err(features);
        }
        let Some(jobs) = self.jobs.as_ref() else {
            return Err(features);
        };
        let id = self.next_id;
        match jobs.try_send(Job { id, features }) {
            Ok(()) => {
                self.next_id += 1;
                self.in_flight = Some(InFlight {
                    id,
                    origin,
                    deadline: deadline_after(self.timeout),
                    abandoned: false,
                });
                Ok(id)
            }
            Err(e) => Err(e.into_inner().features),
        }
    }

    /// Abandon the current job if its deadline has passed. Returns its origin
    /// the first time it is abandoned.
    pub fn check_timeout(&mut self, now: Instant) -> Option<Origin> {
        let job = self.in_flight.as_mut()?;
        if job.abandoned || now < job.deadline {
            return None;
        }
        job.abandoned = true;
        warn!(job = job.id, timeout = ?self.timeout, "classifier call abandoned");
        Some(job.origin)
    }

    /// Time until the current job's deadline, if one is pending.
    pub fn until_deadline(&self, now: Instant) -> Option<Duration> {
        self.in_flight
            .filter(|f| !f.abandoned)
            .map(|f| f.deadline.saturating_duration_since(now))
    }

    /// Interpret a reply received from `results()`.
    pub fn complete(&mut self, outcome: Outcome) -> Completion {
        let job = match self.in_flight {
            Some(job) if job.id == outcome.id => job,
            _ => {
                debug!(job = outcome.id, "reply for unknown job");
                return Completion::Discarded {
                    elapsed: outcome.elapsed,
                };
            }
        };
        self.in_flight = None;

        if job.abandoned {
            debug!(job = job.id, elapsed = ?outcome.elapsed, "late classifier reply discarded");
            return Completion::Discarded {
                elapsed: outcome.elapsed,
            };
        }

        match outcome.result.and_then(|c| self.check(c)) {
            Ok(classification) => Completion::Classified {
                origin: job.origin,
                classification,
                elapsed: outcome.elapsed,
            },
            Err(error) => Completion::Failed {
                origin: job.origin,
                error,
            },
        }
    }

    fn check(&self, c: Classification) -> Result<Classification> {
        if !self.labels.contains(&c.label) {
            return Err(VigilError::Classifier(format!(
                "label '{}' is not in the configured label set",
                c.label
            )));
        }
        if !c.confidence.is_finite() || !(0.0..=1.0).contains(&c.confidence) {
            return Err(VigilError::Classifier(format!(
                "confidence {} outside [0, 1]",
                c.confidence
            )));
        }
        Ok(c)
    }

    /// Block up to `grace` for the current job to finish.
    pub fn wait(&mut self, grace: Duration) -> Option<Completion> {
        self.in_flight?;
        let outcome = self.results.recv_timeout(grace).ok()?;
        Some(self.complete(outcome))
    }
}

impl Drop for ClassifierWorker {
    fn drop(&mut self) {
        // Closing the job channel lets the thread exit after its current call.
        self.jobs.take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::ActivityClassifier;
    use crate::labels::ActivityLabel;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct Scripted {
        delay: Duration,
        label: &'static str,
        calls: Arc<AtomicUsize>,
        running: Arc<AtomicUsize>,
        max_running: Arc<AtomicUsize>,
    }

    impl ActivityClassifier for Scripted {
        fn classify(
            &mut self,
            features: &FeatureVector,
            _labels: &LabelSet,
            _timeout: Duration,
        ) -> Result<Classification> {
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_running.fetch_max(now, Ordering::SeqCst);
            self.calls.fetch_add(1, Ordering::SeqCst);
            std::thread::sleep(self.delay);
            self.running.fetch_sub(1, Ordering::SeqCst);
            Ok(Classification::with_uniform_remainder(
                features.timestamp,
                ActivityLabel::from(self.label),
                0.7,
                std::iter::empty::<&ActivityLabel>(),
            ))
        }
    }

    fn fv(ts: u64) -> FeatureVector {
        FeatureVector {
            timestamp: ts,
            audio_features: vec![],
            video_features: vec![],
        }
    }

    fn worker(delay_ms: u64, label: &'static str, timeout_ms: u64) -> (ClassifierWorker, Arc<AtomicUsize>, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let max_running = Arc::new(AtomicUsize::new(0));
        let handle = ClassifierHandle::new(Scripted {
            delay: Duration::from_millis(delay_ms),
            label,
            calls: Arc::clone(&calls),
            running: Arc::new(AtomicUsize::new(0)),
            max_running: Arc::clone(&max_running),
        });
        let w = ClassifierWorker::spawn(handle, LabelSet::default(), Duration::from_millis(timeout_ms))
            .unwrap();
        (w, calls, max_running)
    }

    #[test]
    fn completes_a_job() {
        let (mut w, calls, _) = worker(0, "idle", 1_000);
        assert_eq!(w.dispatch(fv(7), Origin::Automatic), Ok(0));
        assert!(!w.is_idle());
        let outcome = w.results().recv_timeout(Duration::from_secs(2)).unwrap();
        match w.complete(outcome) {
            Completion::Classified {
                origin,
                classification,
                ..
            } => {
                assert_eq!(origin, Origin::Automatic);
                assert_eq!(classification.timestamp, 7);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(w.is_idle());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn huge_timeout_does_not_overflow_deadline() {
        let (mut w, _, _) = worker(0, "idle", u64::MAX);
        w.dispatch(fv(3), Origin::Manual).unwrap();
        assert!(w.check_timeout(Instant::now()).is_none());
        let outcome = w.results().recv_timeout(Duration::from_secs(2)).unwrap();
        assert!(matches!(w.complete(outcome), Completion::Classified { .. }));
    }

    #[test]
    fn busy_slot_rejects_second_dispatch() {
        let (mut w, _, _) = worker(50, "idle", 1_000);
        w.dispatch(fv(1), Origin::Automatic).unwrap();
        let back = w.dispatch(fv(2), Origin::Manual).unwrap_err();
        assert_eq!(back.timestamp, 2);
    }

    #[test]
    fn timed_out_job_is_abandoned_and_reply_discarded() {
        let (mut w, _, max_running) = worker(80, "idle", 10);
        w.dispatch(fv(1), Origin::Manual).unwrap();
        std::thread::sleep(Duration::from_millis(20));

        assert_eq!(w.check_timeout(Instant::now()), Some(Origin::Manual));
        assert_eq!(w.check_timeout(Instant::now()), None);
        assert_eq!(w.active_origin(), None);
        // Slot stays occupied until the worker returns.
        assert!(w.dispatch(fv(2), Origin::Automatic).is_err());

        let outcome = w.results().recv_timeout(Duration::from_secs(2)).unwrap();
        assert!(matches!(w.complete(outcome), Completion::Discarded { .. }));
        assert!(w.is_idle());
        assert_eq!(max_running.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn label_outside_set_fails() {
        let (mut w, _, _) = worker(0, "juggling", 1_000);
        w.dispatch(fv(1), Origin::Automatic).unwrap();
        let outcome = w.results().recv_timeout(Duration::from_secs(2)).unwrap();
        assert!(matches!(
            w.complete(outcome),
            Completion::Failed {
                error: VigilError::Classifier(_),
                ..
            }
        ));
    }

    #[test]
    fn wait_returns_pending_completion() {
        let (mut w, _, _) = worker(20, "video", 1_000);
        assert!(w.wait(Duration::from_millis(1)).is_none());
        w.dispatch(fv(3), Origin::Automatic).unwrap();
        assert!(matches!(
            w.wait(Duration::from_secs(2)),
            Some(Completion::Classified { .. })
        ));
    }
}
