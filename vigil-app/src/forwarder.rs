//! Optional delivery of closed activity records to an external service.
//!
//! Delivery is best effort: each record is tried `1 + retries` times with a
//! fixed delay, then dropped with a warning. The local history is the source
//! of truth.

use std::thread;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use vigil_core::{ActivityEvent, ActivityRecord};

use crate::settings::ForwarderSettings;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ForwardPayload<'a> {
    source: &'static str,
    #[serde(flatten)]
    record: &'a ActivityRecord,
}

pub struct Forwarder {
    client: reqwest::blocking::Client,
    url: String,
    retries: u32,
    retry_delay: Duration,
}

impl Forwarder {
    /// `Ok(None)` when no URL is configured.
    pub fn from_settings(settings: &ForwarderSettings) -> Result<Option<Self>, String> {
        let Some(url) = settings.url.clone() else {
            return Ok(None);
        };
        let client = reqwest::blocking::Client::builder()
            .timeout(settings.timeout())
            .build()
            .map_err(|e| format!("forwarder client build failed: {e}"))?;
        Ok(Some(Self {
            client,
            url,
            retries: settings.retries,
            retry_delay: settings.retry_delay(),
        }))
    }

    /// POST one record. Returns the number of attempts used on success.
    pub fn send(&self, record: &ActivityRecord) -> Result<u32, String> {
        let payload = ForwardPayload {
            source: "vigil",
            record,
        };
        let mut last_error = String::new();
        for attempt in 1..=self.retries + 1 {
            match self.client.post(&self.url).json(&payload).send() {
                Ok(resp) if resp.status().is_success() => return Ok(attempt),
                Ok(resp) => last_error = format!("HTTP {}", resp.status()),
                Err(e) => last_error = e.to_string(),
            }
            debug!(attempt, "forward attempt failed: {last_error}");
            if attempt <= self.retries {
                thread::sleep(self.retry_delay);
            }
        }
        Err(format!(
            "giving up after {} attempts: {last_error}",
            self.retries + 1
        ))
    }

    /// Forward every closed record seen on `rx` until the channel closes.
    ///
    /// Runs on a blocking thread so records are delivered in order.
    pub fn spawn(self, mut rx: broadcast::Receiver<ActivityEvent>) -> JoinHandle<()> {
        tokio::task::spawn_blocking(move || {
            info!(url = %self.url, "history forwarder started");
            loop {
                match rx.blocking_recv() {
                    Ok(event) => {
                        let Some(record) = event.closed else {
                            continue;
                        };
                        match self.send(&record) {
                            Ok(attempts) => debug!(
                                label = %record.label,
                                attempts,
                                "record forwarded"
                            ),
                            Err(e) => warn!(label = %record.label, "record not forwarded: {e}"),
                        }
                    }
                    Err(RecvError::Lagged(n)) => {
                        warn!("forwarder lagged; {n} activity events skipped");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
            info!("history forwarder stopped");
        })
    }
}
