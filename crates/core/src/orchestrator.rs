//! Drives admitted uploads to a terminal state and owns the known-uploads set.
//!
//! Each fresh candidate becomes one spawned task. Progress from the transfer
//! worker is relayed on the task's own channel; the terminal event goes out on
//! the same channel once the known-uploads set reflects the outcome. A failing
//! task never touches its siblings or the known set.

use std::any::Any;
use std::collections::{HashMap, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};

use futures_util::FutureExt;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::dedup::partition;
use crate::progress::ProgressSink;
use crate::relay::{ProgressRelay, RelaySubscription, UploadEvent};
use crate::selection::FileSelector;
use crate::transfer::Transfer;
use crate::types::{
    DuplicateNotice, FileCandidate, ProgressEvent, TaskState, UploadTask, UploadedVideo,
};
use crate::{Error, Result};

#[derive(Debug, Clone, Default)]
pub struct OrchestratorOptions {
    /// `None` starts every admitted upload immediately.
    pub max_concurrent_uploads: Option<usize>,
}

struct Inner {
    transfer: Arc<dyn Transfer>,
    relay: ProgressRelay,
    known: Mutex<Vec<UploadedVideo>>,
    tasks: Mutex<Vec<UploadTask>>,
    notices: Mutex<VecDeque<DuplicateNotice>>,
    limiter: Option<Arc<Semaphore>>,
}

#[derive(Clone)]
pub struct UploadOrchestrator {
    inner: Arc<Inner>,
}

impl UploadOrchestrator {
    pub fn new(transfer: Arc<dyn Transfer>, options: OrchestratorOptions) -> Self {
        let limiter = options
            .max_concurrent_uploads
            .map(|n| Arc::new(Semaphore::new(n.max(1))));
        Self {
            inner: Arc::new(Inner {
                transfer,
                relay: ProgressRelay::new(),
                known: Mutex::new(Vec::new()),
                tasks: Mutex::new(Vec::new()),
                notices: Mutex::new(VecDeque::new()),
                limiter,
            }),
        }
    }

    /// Seeds the known set, e.g. from a saved session. Later paths that repeat
    /// an earlier one are dropped.
    pub fn with_known_uploads(self, videos: Vec<UploadedVideo>) -> Self {
        {
            let mut known = self.inner.known.lock().expect("known mutex poisoned");
            for video in videos {
                if !known.iter().any(|k| k.local_path == video.local_path) {
                    known.push(video);
                }
            }
        }
        self
    }

    /// Admits a batch. Must be called from within a tokio runtime.
    pub fn submit(&self, candidates: Vec<FileCandidate>) -> Submission {
        let known = self.known_uploads();
        let split = partition(candidates, &known);

        let mut accepted = Vec::with_capacity(split.fresh.len());
        let mut subscriptions = HashMap::with_capacity(split.fresh.len());
        let mut handles = Vec::with_capacity(split.fresh.len());

        for candidate in split.fresh {
            let (task, subscription) = self.admit(candidate);
            debug!(
                event = "upload.admitted",
                upload_id = %task.upload_id,
                path = %task.candidate.path,
                size = task.candidate.size,
                "upload.admitted"
            );
            subscriptions.insert(task.upload_id.clone(), subscription);
            let handle = tokio::spawn(run_task(self.inner.clone(), task.clone()));
            handles.push((task.clone(), handle));
            accepted.push(task);
        }

        let duplicates = DuplicateNotice {
            files: split.duplicates,
        };
        if !duplicates.is_empty() {
            info!(
                event = "submit.duplicates",
                count = duplicates.files.len(),
                names = ?duplicates.names(),
                "submit.duplicates"
            );
            self.inner
                .notices
                .lock()
                .expect("notices mutex poisoned")
                .push_back(duplicates.clone());
        }

        Submission {
            accepted,
            duplicates,
            subscriptions,
            handles,
            orchestrator: self.clone(),
        }
    }

    /// Asks the selector for files and submits them.
    ///
    /// A selection failure leaves all state untouched.
    pub fn select_and_submit(&self, selector: &dyn FileSelector) -> Result<Submission> {
        match selector.select_video_files() {
            Ok(files) => Ok(self.submit(files)),
            Err(e) => {
                warn!(event = "selection.failed", error = %e, "selection.failed");
                Err(e)
            }
        }
    }

    /// Removes a known upload by id. Returns false when it was not present.
    pub fn remove(&self, id: &str) -> bool {
        let mut known = self.inner.known.lock().expect("known mutex poisoned");
        match known.iter().position(|v| v.id == id) {
            Some(idx) => {
                let removed = known.remove(idx);
                info!(event = "upload.removed", id, path = %removed.local_path, "upload.removed");
                true
            }
            None => false,
        }
    }

    pub fn known_uploads(&self) -> Vec<UploadedVideo> {
        self.inner.known.lock().expect("known mutex poisoned").clone()
    }

    /// Tasks that have not reached a terminal state, in admission order.
    pub fn in_flight(&self) -> Vec<UploadTask> {
        self.inner.tasks.lock().expect("tasks mutex poisoned").clone()
    }

    pub fn take_duplicate_notices(&self) -> Vec<DuplicateNotice> {
        self.inner
            .notices
            .lock()
            .expect("notices mutex poisoned")
            .drain(..)
            .collect()
    }

    fn admit(&self, candidate: FileCandidate) -> (UploadTask, RelaySubscription) {
        loop {
            let task = UploadTask::admit(candidate.clone());
            match self.inner.relay.register(&task.upload_id) {
                Ok(subscription) => {
                    self.inner
                        .tasks
                        .lock()
                        .expect("tasks mutex poisoned")
                        .push(task.clone());
                    return (task, subscription);
                }
                Err(e) => {
                    warn!(event = "upload.id_collision", error = %e, "upload.id_collision");
                }
            }
        }
    }

    /// Settles a task whose worker never returned. No-op once the worker
    /// already delivered its terminal event.
    fn abandon(&self, upload_id: &str, reason: String) {
        self.inner
            .tasks
            .lock()
            .expect("tasks mutex poisoned")
            .retain(|t| t.upload_id != upload_id);
        let _ = self.inner.relay.finish(UploadEvent::Failed {
            upload_id: upload_id.to_string(),
            reason,
        });
    }
}

/// Result of one [`UploadOrchestrator::submit`] call.
pub struct Submission {
    pub accepted: Vec<UploadTask>,
    pub duplicates: DuplicateNotice,
    subscriptions: HashMap<String, RelaySubscription>,
    handles: Vec<(UploadTask, JoinHandle<UploadTask>)>,
    orchestrator: UploadOrchestrator,
}

impl Submission {
    pub fn take_events(&mut self, upload_id: &str) -> Option<RelaySubscription> {
        self.subscriptions.remove(upload_id)
    }

    /// Every remaining subscription, in admission order.
    pub fn take_all_events(&mut self) -> Vec<RelaySubscription> {
        self.accepted
            .iter()
            .filter_map(|t| self.subscriptions.remove(&t.upload_id))
            .collect()
    }

    /// Waits for every accepted task and returns them in admission order.
    pub async fn join(self) -> Vec<UploadTask> {
        let mut out = Vec::with_capacity(self.handles.len());
        for (admitted, handle) in self.handles {
            match handle.await {
                Ok(task) => out.push(task),
                Err(e) => {
                    error!(
                        event = "upload.aborted",
                        upload_id = %admitted.upload_id,
                        error = %e,
                        "upload.aborted"
                    );
                    let reason = format!("upload task aborted: {e}");
                    self.orchestrator.abandon(&admitted.upload_id, reason.clone());
                    out.push(UploadTask {
                        state: TaskState::Failed,
                        error_reason: Some(reason),
                        ..admitted
                    });
                }
            }
        }
        out
    }
}

struct TaskProgress {
    inner: Arc<Inner>,
}

impl ProgressSink for TaskProgress {
    fn on_progress(&self, event: ProgressEvent) {
        if let Some(task) = self
            .inner
            .tasks
            .lock()
            .expect("tasks mutex poisoned")
            .iter_mut()
            .find(|t| t.upload_id == event.upload_id)
        {
            task.progress = task.progress.max(event.progress.min(100));
        }
        self.inner.relay.emit(&event.upload_id, event.progress);
    }
}

async fn run_task(inner: Arc<Inner>, mut task: UploadTask) -> UploadTask {
    let _permit = match &inner.limiter {
        Some(limiter) => limiter.clone().acquire_owned().await.ok(),
        None => None,
    };

    task.state = TaskState::Transferring;
    set_state(&inner, &task.upload_id, TaskState::Transferring);
    debug!(
        event = "upload.start",
        upload_id = %task.upload_id,
        endpoint = inner.transfer.endpoint(),
        "upload.start"
    );

    let sink: Arc<dyn ProgressSink> = Arc::new(TaskProgress {
        inner: inner.clone(),
    });
    let transfer = async {
        inner
            .transfer
            .transfer(&task.candidate, &task.upload_id, sink)
            .await
    };
    let result = AssertUnwindSafe(transfer)
        .catch_unwind()
        .await
        .unwrap_or_else(|panic| {
            Err(Error::Transfer {
                message: format!("upload worker panicked: {}", panic_message(&*panic)),
            })
        });

    let terminal = match result {
        Ok(receipt) => {
            let video = accept(&inner, &task.candidate, receipt.server_path);
            // The last progress value of a successful upload is always 100.
            if current_progress(&inner, &task.upload_id) < 100 {
                inner.relay.emit(&task.upload_id, 100);
            }
            task.progress = 100;
            task.state = TaskState::Succeeded;
            info!(
                event = "upload.succeeded",
                upload_id = %task.upload_id,
                id = %video.id,
                server_path = %video.server_path,
                "upload.succeeded"
            );
            UploadEvent::Succeeded {
                upload_id: task.upload_id.clone(),
                video,
            }
        }
        Err(e) => {
            let reason = e.reason();
            task.progress = current_progress(&inner, &task.upload_id);
            task.state = TaskState::Failed;
            task.error_reason = Some(reason.clone());
            error!(
                event = "upload.failed",
                upload_id = %task.upload_id,
                path = %task.candidate.path,
                error = %reason,
                "upload.failed"
            );
            UploadEvent::Failed {
                upload_id: task.upload_id.clone(),
                reason,
            }
        }
    };

    inner
        .tasks
        .lock()
        .expect("tasks mutex poisoned")
        .retain(|t| t.upload_id != task.upload_id);
    if let Err(e) = inner.relay.finish(terminal) {
        warn!(
            event = "relay.finish_failed",
            upload_id = %task.upload_id,
            error = %e,
            "relay.finish_failed"
        );
    }
    task
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    panic
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown panic")
}

/// Appends the uploaded video unless its path is already known, in which case
/// the existing record wins.
fn accept(inner: &Inner, candidate: &FileCandidate, server_path: String) -> UploadedVideo {
    let mut known = inner.known.lock().expect("known mutex poisoned");
    if let Some(existing) = known.iter().find(|v| v.local_path == candidate.path) {
        debug!(
            event = "upload.discarded_duplicate",
            path = %candidate.path,
            kept_id = %existing.id,
            "upload.discarded_duplicate"
        );
        return existing.clone();
    }
    let video = UploadedVideo::from_candidate(candidate, server_path);
    known.push(video.clone());
    video
}

fn set_state(inner: &Inner, upload_id: &str, state: TaskState) {
    if let Some(task) = inner
        .tasks
        .lock()
        .expect("tasks mutex poisoned")
        .iter_mut()
        .find(|t| t.upload_id == upload_id)
    {
        task.state = state;
    }
}

fn current_progress(inner: &Inner, upload_id: &str) -> u8 {
    inner
        .tasks
        .lock()
        .expect("tasks mutex poisoned")
        .iter()
        .find(|t| t.upload_id == upload_id)
        .map(|t| t.progress)
        .unwrap_or(0)
}
