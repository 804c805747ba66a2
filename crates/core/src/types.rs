use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use crate::session::now_unix_ms;

/// A file offered for upload, as returned by a [`crate::FileSelector`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileCandidate {
    pub name: String,
    pub path: String,
    pub size: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadedVideo {
    pub id: String,
    pub name: String,
    pub local_path: String,
    pub server_path: String,
    pub size: u64,
}

impl UploadedVideo {
    pub fn from_candidate(candidate: &FileCandidate, server_path: String) -> Self {
        Self {
            id: format!("vid_{}", uuid::Uuid::new_v4()),
            name: candidate.name.clone(),
            local_path: candidate.path.clone(),
            server_path,
            size: candidate.size,
        }
    }

    /// URL for local playback of the original file.
    pub fn preview_url(&self) -> String {
        format!("file://{}", self.local_path)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Pending,
    Transferring,
    Succeeded,
    Failed,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Transferring => "transferring",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadTask {
    pub upload_id: String,
    pub candidate: FileCandidate,
    pub progress: u8,
    pub state: TaskState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_reason: Option<String>,
}

impl UploadTask {
    pub fn admit(candidate: FileCandidate) -> Self {
        Self {
            upload_id: new_upload_id(&candidate.name),
            candidate,
            progress: 0,
            state: TaskState::Pending,
            error_reason: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressEvent {
    pub upload_id: String,
    pub progress: u8,
}

/// Candidates of one batch that were already known by path.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DuplicateNotice {
    pub files: Vec<FileCandidate>,
}

impl DuplicateNotice {
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn names(&self) -> Vec<&str> {
        self.files.iter().map(|f| f.name.as_str()).collect()
    }

    pub fn message(&self) -> String {
        match self.files.as_slice() {
            [] => String::new(),
            [one] => format!(
                "Video \"{}\" has already been added and will not be duplicated.",
                one.name
            ),
            many => format!(
                "{} videos have already been added and will not be duplicated.",
                many.len()
            ),
        }
    }
}

/// Builds an upload id from the file name and the current time.
///
/// The sequence suffix keeps ids distinct for the same name within one millisecond.
pub fn new_upload_id(name: &str) -> String {
    static SEQ: AtomicU64 = AtomicU64::new(0);
    let seq = SEQ.fetch_add(1, Ordering::Relaxed);
    format!(
        "upl_{}_{}_{}",
        sanitize_id_component(name),
        now_unix_ms(),
        seq
    )
}

fn sanitize_id_component(s: &str) -> String {
    s.chars()
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '.' | '-' => c,
            _ => '_',
        })
        .collect()
}
