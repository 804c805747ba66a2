use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::types::UploadedVideo;
use crate::{Error, Result};

pub const SESSION_SCHEMA_VERSION: u32 = 1;

pub fn now_unix_ms() -> u64 {
    static LAST_UNIX_MS: AtomicU64 = AtomicU64::new(0);

    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64;

    let mut prev = LAST_UNIX_MS.load(Ordering::Relaxed);
    loop {
        let next = now.max(prev);
        match LAST_UNIX_MS.compare_exchange_weak(prev, next, Ordering::Relaxed, Ordering::Relaxed) {
            Ok(_) => return next,
            Err(current) => prev = current,
        }
    }
}

pub fn session_json_path(data_dir: &Path) -> PathBuf {
    data_dir.join("session").join("uploads.json")
}

/// The known-uploads set as persisted between runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub schema_version: u32,
    pub saved_at: u64,
    #[serde(default)]
    pub videos: Vec<UploadedVideo>,
}

impl SessionSnapshot {
    pub fn new(videos: Vec<UploadedVideo>) -> Self {
        Self {
            schema_version: SESSION_SCHEMA_VERSION,
            saved_at: now_unix_ms(),
            videos,
        }
    }
}

impl Default for SessionSnapshot {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

pub fn load_session(path: &Path) -> Result<SessionSnapshot> {
    if !path.exists() {
        return Ok(SessionSnapshot::default());
    }
    let bytes = std::fs::read(path)?;
    let snap: SessionSnapshot = serde_json::from_slice(&bytes).map_err(|e| Error::InvalidConfig {
        message: format!("session file invalid: {e}"),
    })?;
    if snap.schema_version != SESSION_SCHEMA_VERSION {
        return Err(Error::InvalidConfig {
            message: format!(
                "unsupported session schema version: {} (expected {SESSION_SCHEMA_VERSION})",
                snap.schema_version
            ),
        });
    }
    Ok(snap)
}

pub fn save_session(path: &Path, videos: &[UploadedVideo]) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let snapshot = SessionSnapshot::new(videos.to_vec());
    let data = serde_json::to_vec_pretty(&snapshot)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;

    let tmp = path.with_extension(format!("json.tmp.{}", std::process::id()));
    let mut f = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(&tmp)?;
    f.write_all(&data)?;
    f.sync_all()?;
    drop(f);

    std::fs::rename(&tmp, path)?;

    if let Some(parent) = path.parent()
        && let Ok(dir) = File::open(parent)
    {
        let _ = dir.sync_all();
    }
    Ok(())
}
