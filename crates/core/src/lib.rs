pub mod config;
mod dedup;
mod error;
mod orchestrator;
mod progress;
mod relay;
pub mod run_log;
mod selection;
pub mod session;
mod transfer;
mod types;

pub const APP_NAME: &str = "VimoUpload";

pub use dedup::{Partition, partition};
pub use error::{Error, Result};
pub use orchestrator::{OrchestratorOptions, Submission, UploadOrchestrator};
pub use progress::{PercentTracker, ProgressSink};
pub use relay::{ProgressRelay, RelaySubscription, UploadEvent};
pub use selection::{FileSelector, PathSelector, VIDEO_EXTENSIONS, is_video_path};
pub use transfer::{
    DEFAULT_UPLOAD_TIMEOUT, HttpTransfer, HttpTransferConfig, InMemoryTransfer, Transfer,
    TransferReceipt,
};
pub use types::{
    DuplicateNotice, FileCandidate, ProgressEvent, TaskState, UploadTask, UploadedVideo,
    new_upload_id,
};
