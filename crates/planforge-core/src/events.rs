//! Stream event vocabulary and the sink seam between the orchestrator and
//! whatever transport carries events to the client.

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::sync::mpsc;

/// One event on the generation stream.
///
/// A stream is a sequence of `Progress` events terminated by exactly one
/// `Complete` or `Error`.
#[derive(Debug, Clone, PartialEq)]
pub enum ProgressEvent {
    Progress {
        phase: String,
        percent: u8,
        message: String,
        /// Estimated seconds remaining, omitted when no history exists.
        eta_seconds: Option<u64>,
    },
    Complete {
        result_ref: String,
        insight_changes: Value,
    },
    Error {
        message: String,
    },
}

impl ProgressEvent {
    /// Wire shape: `{phase, progress, message, eta?}`, terminating in
    /// `{phase: "complete", result_ref}` or `{phase: "error", error}`.
    pub fn to_json(&self) -> Value {
        match self {
            Self::Progress {
                phase,
                percent,
                message,
                eta_seconds,
            } => {
                let mut obj = json!({
                    "phase": phase,
                    "progress": percent,
                    "message": message,
                });
                if let Some(eta) = eta_seconds {
                    obj["eta"] = json!(eta);
                }
                obj
            }
            Self::Complete {
                result_ref,
                insight_changes,
            } => json!({
                "phase": "complete",
                "progress": 100,
                "result_ref": result_ref,
                "insight_changes": insight_changes,
            }),
            Self::Error { message } => json!({
                "phase": "error",
                "error": message,
            }),
        }
    }

    /// Whether this event ends the stream.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete { .. } | Self::Error { .. })
    }
}

/// The client went away; the stream can no longer be written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SinkClosed;

/// Where stream events go.
///
/// A send failure means the client disconnected. The orchestrator treats
/// that as non-fatal: side effects (ledger, cache, metrics) complete
/// regardless, since a poll or reconnect may pick up the result later.
#[async_trait]
pub trait ProgressSink: Send {
    async fn send(&mut self, event: ProgressEvent) -> Result<(), SinkClosed>;
}

/// Sink over an mpsc channel, used by the SSE transport.
pub struct ChannelSink {
    tx: mpsc::Sender<ProgressEvent>,
}

impl ChannelSink {
    pub fn new(tx: mpsc::Sender<ProgressEvent>) -> Self {
        Self { tx }
    }
}

#[async_trait]
impl ProgressSink for ChannelSink {
    async fn send(&mut self, event: ProgressEvent) -> Result<(), SinkClosed> {
        self.tx.send(event).await.map_err(|_| SinkClosed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn progress_json_shape() {
        let ev = ProgressEvent::Progress {
            phase: "generating".to_string(),
            percent: 52,
            message: "building your plan".to_string(),
            eta_seconds: Some(40),
        };
        let json = ev.to_json();
        assert_eq!(json["phase"], "generating");
        assert_eq!(json["progress"], 52);
        assert_eq!(json["eta"], 40);
    }

    #[test]
    fn eta_is_omitted_when_unknown() {
        let ev = ProgressEvent::Progress {
            phase: "profile".to_string(),
            percent: 10,
            message: "loading profile".to_string(),
            eta_seconds: None,
        };
        assert!(ev.to_json().get("eta").is_none());
    }

    #[test]
    fn terminal_events() {
        let complete = ProgressEvent::Complete {
            result_ref: "plan-123".to_string(),
            insight_changes: Value::Null,
        };
        assert!(complete.is_terminal());
        assert_eq!(complete.to_json()["phase"], "complete");
        assert_eq!(complete.to_json()["result_ref"], "plan-123");

        let error = ProgressEvent::Error {
            message: "generation timed out".to_string(),
        };
        assert!(error.is_terminal());
        assert_eq!(error.to_json()["error"], "generation timed out");
    }

    #[tokio::test]
    async fn channel_sink_reports_disconnect() {
        let (tx, rx) = mpsc::channel(1);
        let mut sink = ChannelSink::new(tx);
        drop(rx);

        let result = sink
            .send(ProgressEvent::Error {
                message: "x".to_string(),
            })
            .await;
        assert_eq!(result, Err(SinkClosed));
    }
}
