//! NDJSON run logs.
//!
//! A single global subscriber writes JSON lines into the file of the active
//! run. Outside of a run the layer writes nowhere.

use std::fs::OpenOptions;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, OnceLock};

use chrono::Utc;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

const RUN_KINDS: &[&str] = &["upload", "remove"];

static RUN_LOG: OnceLock<RunLog> = OnceLock::new();
static TRACING_INIT: OnceLock<()> = OnceLock::new();

#[derive(Debug, Default)]
struct RunLog {
    writer: Mutex<Option<BufWriter<std::fs::File>>>,
}

impl RunLog {
    fn lock(&self) -> MutexGuard<'_, Option<BufWriter<std::fs::File>>> {
        self.writer.lock().expect("run log mutex poisoned")
    }

    fn open(&self, path: &Path) -> std::io::Result<()> {
        let mut guard = self.lock();
        if guard.is_some() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::AlreadyExists,
                "run log already active",
            ));
        }
        let file = OpenOptions::new().create_new(true).write(true).open(path)?;
        *guard = Some(BufWriter::new(file));
        Ok(())
    }

    fn close(&self) -> std::io::Result<()> {
        let Some(mut writer) = self.lock().take() else {
            return Ok(());
        };
        writer.flush()?;
        writer.get_ref().sync_all()
    }
}

pub struct RunLogWriter<'a> {
    guard: Option<MutexGuard<'a, Option<BufWriter<std::fs::File>>>>,
}

impl Write for RunLogWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self.guard.as_mut().and_then(|g| g.as_mut()) {
            Some(writer) => writer.write(buf),
            None => Ok(buf.len()),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self.guard.as_mut().and_then(|g| g.as_mut()) {
            Some(writer) => writer.flush(),
            None => Ok(()),
        }
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for RunLog {
    type Writer = RunLogWriter<'a>;

    fn make_writer(&'a self) -> Self::Writer {
        let guard = self.lock();
        RunLogWriter {
            guard: guard.is_some().then_some(guard),
        }
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for &RunLog {
    type Writer = RunLogWriter<'a>;

    fn make_writer(&'a self) -> Self::Writer {
        (**self).make_writer()
    }
}

fn build_env_filter_from(app_log: Option<&str>, rust_log: Option<&str>) -> EnvFilter {
    let default = || EnvFilter::new("info");

    app_log
        .or(rust_log)
        .map(|v| EnvFilter::try_new(v).unwrap_or_else(|_| default()))
        .unwrap_or_else(default)
}

pub fn init_run_logging() {
    TRACING_INIT.get_or_init(|| {
        let log = RUN_LOG.get_or_init(RunLog::default);
        let env_filter = build_env_filter_from(
            std::env::var("VIMOUPLOAD_LOG").ok().as_deref(),
            std::env::var("RUST_LOG").ok().as_deref(),
        );

        let layer = tracing_subscriber::fmt::layer()
            .json()
            .with_timer(tracing_subscriber::fmt::time::UtcTime::rfc_3339())
            .with_writer(log);

        let _ = tracing_subscriber::registry()
            .with(env_filter)
            .with(layer)
            .try_init();
    });
}

/// Closes the run log file when dropped.
pub struct RunLogGuard {
    path: PathBuf,
}

impl RunLogGuard {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for RunLogGuard {
    fn drop(&mut self) {
        if let Some(log) = RUN_LOG.get() {
            let _ = log.close();
        }
    }
}

pub fn start_run_log(kind: &str, run_id: &str, data_dir: &Path) -> std::io::Result<RunLogGuard> {
    init_run_logging();

    if !RUN_KINDS.contains(&kind) {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("unsupported kind: {kind}"),
        ));
    }

    let log_dir = std::env::var("VIMOUPLOAD_LOG_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| data_dir.join("logs"));
    std::fs::create_dir_all(&log_dir)?;

    let file_name = format!(
        "upload-{}-{}-{}.ndjson",
        sanitize_filename_component(kind),
        Utc::now().format("%Y%m%dT%H%M%SZ"),
        sanitize_filename_component(run_id)
    );
    let path = log_dir.join(file_name);

    RUN_LOG.get_or_init(RunLog::default).open(&path)?;
    Ok(RunLogGuard { path })
}

fn sanitize_filename_component(s: &str) -> String {
    s.chars()
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '.' | '_' | '-' => c,
            _ => '_',
        })
        .collect()
}
