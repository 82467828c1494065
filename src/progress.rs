//! Fire-and-forget progress notifications.
//!
//! The orchestrator calls [`ProgressSink::notify`] synchronously and never
//! looks at the outcome, so implementations must return promptly. Channel
//! sinks drop events instead of waiting for a slow receiver.

use tokio::sync::mpsc;
use tracing::debug;

use crate::models::ProgressEvent;

pub trait ProgressSink: Send + Sync {
    fn notify(&self, event: ProgressEvent);
}

impl<F> ProgressSink for F
where
    F: Fn(ProgressEvent) + Send + Sync,
{
    fn notify(&self, event: ProgressEvent) {
        self(event)
    }
}

impl<T> ProgressSink for mpsc::UnboundedSender<T>
where
    T: From<ProgressEvent> + Send,
{
    fn notify(&self, event: ProgressEvent) {
        if self.send(event.into()).is_err() {
            debug!("progress receiver dropped");
        }
    }
}

impl<T> ProgressSink for mpsc::Sender<T>
where
    T: From<ProgressEvent> + Send,
{
    fn notify(&self, event: ProgressEvent) {
        if let Err(e) = self.try_send(event.into()) {
            debug!(error = %e, "progress event dropped");
        }
    }
}
