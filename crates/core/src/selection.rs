use std::path::{Path, PathBuf};

use tracing::warn;

use crate::types::FileCandidate;
use crate::{Error, Result};

pub const VIDEO_EXTENSIONS: &[&str] = &[
    "mp4", "avi", "mov", "wmv", "flv", "webm", "mkv", "3gp", "mpg", "mpeg",
];

/// Source of upload candidates, usually a native file chooser.
pub trait FileSelector {
    fn select_video_files(&self) -> Result<Vec<FileCandidate>>;
}

/// Builds candidates from paths that were chosen elsewhere.
#[derive(Debug, Clone, Default)]
pub struct PathSelector {
    paths: Vec<PathBuf>,
    video_only: bool,
}

impl PathSelector {
    pub fn new(paths: impl IntoIterator<Item = PathBuf>) -> Self {
        Self {
            paths: paths.into_iter().collect(),
            video_only: false,
        }
    }

    pub fn video_only(mut self, enabled: bool) -> Self {
        self.video_only = enabled;
        self
    }
}

impl FileSelector for PathSelector {
    fn select_video_files(&self) -> Result<Vec<FileCandidate>> {
        let mut files = Vec::with_capacity(self.paths.len());

        for path in &self.paths {
            if self.video_only && !is_video_path(path) {
                warn!(
                    event = "selection.skip",
                    path = %path.display(),
                    reason = "not a video",
                    "selection.skip"
                );
                continue;
            }
            let metadata = match std::fs::metadata(path) {
                Ok(m) => m,
                Err(e) => {
                    warn!(
                        event = "selection.skip",
                        path = %path.display(),
                        error = %e,
                        "selection.skip"
                    );
                    continue;
                }
            };
            if !metadata.is_file() {
                warn!(
                    event = "selection.skip",
                    path = %path.display(),
                    reason = "not a file",
                    "selection.skip"
                );
                continue;
            }
            let Some(path_str) = path.to_str() else {
                warn!(
                    event = "selection.skip",
                    path = %path.display(),
                    reason = "non-utf8 path",
                    "selection.skip"
                );
                continue;
            };

            files.push(FileCandidate {
                name: file_name(path),
                path: path_str.to_string(),
                size: metadata.len(),
            });
        }

        if files.is_empty() {
            return Err(Error::Selection {
                message: "no files selected".to_string(),
            });
        }
        Ok(files)
    }
}

pub fn is_video_path(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|ext| {
            VIDEO_EXTENSIONS
                .iter()
                .any(|v| v.eq_ignore_ascii_case(ext))
        })
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("unknown")
        .to_string()
}
