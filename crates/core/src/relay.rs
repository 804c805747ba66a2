//! Per-upload event channels between transfer workers and their consumers.
//!
//! Every admitted upload gets one channel keyed by its upload id. Progress
//! flows through it until [`ProgressRelay::finish`] delivers the terminal
//! event and drops the channel in the same step. Events already queued stay
//! readable by the subscriber after the channel is unregistered.

use std::collections::HashMap;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::debug;

use crate::types::{ProgressEvent, UploadedVideo};
use crate::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum UploadEvent {
    Progress(ProgressEvent),
    Succeeded {
        upload_id: String,
        video: UploadedVideo,
    },
    Failed {
        upload_id: String,
        reason: String,
    },
}

impl UploadEvent {
    pub fn upload_id(&self) -> &str {
        match self {
            Self::Progress(p) => &p.upload_id,
            Self::Succeeded { upload_id, .. } | Self::Failed { upload_id, .. } => upload_id,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Progress(_))
    }
}

/// Receiving end of one upload's channel.
#[derive(Debug)]
pub struct RelaySubscription {
    upload_id: String,
    rx: mpsc::UnboundedReceiver<UploadEvent>,
}

impl RelaySubscription {
    pub fn upload_id(&self) -> &str {
        &self.upload_id
    }

    /// Next event, or `None` once the terminal event has been read.
    pub async fn recv(&mut self) -> Option<UploadEvent> {
        self.rx.recv().await
    }

    /// Drains the stream up to and including the terminal event.
    pub async fn collect(mut self) -> Vec<UploadEvent> {
        let mut out = Vec::new();
        while let Some(event) = self.rx.recv().await {
            let terminal = event.is_terminal();
            out.push(event);
            if terminal {
                break;
            }
        }
        out
    }
}

struct Channel {
    tx: mpsc::UnboundedSender<UploadEvent>,
    last: Option<u8>,
}

#[derive(Default)]
pub struct ProgressRelay {
    channels: Mutex<HashMap<String, Channel>>,
}

impl ProgressRelay {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, upload_id: &str) -> Result<RelaySubscription> {
        let mut channels = self.channels.lock().expect("relay mutex poisoned");
        if channels.contains_key(upload_id) {
            return Err(Error::Relay {
                message: format!("channel already registered: {upload_id}"),
            });
        }
        let (tx, rx) = mpsc::unbounded_channel();
        channels.insert(upload_id.to_string(), Channel { tx, last: None });
        debug!(event = "relay.register", upload_id, "relay.register");
        Ok(RelaySubscription {
            upload_id: upload_id.to_string(),
            rx,
        })
    }

    /// Forwards a progress value. Values below the last one sent are dropped.
    pub fn emit(&self, upload_id: &str, percent: u8) {
        let percent = percent.min(100);
        let mut channels = self.channels.lock().expect("relay mutex poisoned");
        let Some(channel) = channels.get_mut(upload_id) else {
            return;
        };
        if channel.last.is_some_and(|last| percent < last) {
            return;
        }
        channel.last = Some(percent);
        // A dropped subscriber only means nobody is watching.
        let _ = channel.tx.send(UploadEvent::Progress(ProgressEvent {
            upload_id: upload_id.to_string(),
            progress: percent,
        }));
    }

    /// Delivers the terminal event and unregisters the channel.
    pub fn finish(&self, terminal: UploadEvent) -> Result<()> {
        if !terminal.is_terminal() {
            return Err(Error::Relay {
                message: "finish requires a terminal event".to_string(),
            });
        }
        let mut channels = self.channels.lock().expect("relay mutex poisoned");
        let channel = channels
            .remove(terminal.upload_id())
            .ok_or_else(|| Error::Relay {
                message: format!("channel not registered: {}", terminal.upload_id()),
            })?;
        debug!(
            event = "relay.finish",
            upload_id = terminal.upload_id(),
            "relay.finish"
        );
        let _ = channel.tx.send(terminal);
        Ok(())
    }

    /// Drops a channel without a terminal event. Returns false when absent.
    pub fn unregister(&self, upload_id: &str) -> bool {
        self.channels
            .lock()
            .expect("relay mutex poisoned")
            .remove(upload_id)
            .is_some()
    }

    pub fn active(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .channels
            .lock()
            .expect("relay mutex poisoned")
            .keys()
            .cloned()
            .collect();
        ids.sort();
        ids
    }
}
