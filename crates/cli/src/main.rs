use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::info;
use vimo_upload_core::config::{Settings, config_path, load_settings, save_settings};
use vimo_upload_core::run_log::start_run_log;
use vimo_upload_core::session::{load_session, save_session, session_json_path};
use vimo_upload_core::{
    APP_NAME, HttpTransfer, InMemoryTransfer, OrchestratorOptions, PathSelector,
    RelaySubscription, TaskState, Transfer, UploadEvent, UploadOrchestrator, UploadTask,
};

#[derive(Parser)]
#[command(name = "vimoupload")]
#[command(about = "Upload local videos to a VideoRAG processing server", long_about = None)]
struct Cli {
    #[arg(long)]
    json: bool,

    #[arg(long)]
    events: bool,

    #[arg(long)]
    config_dir: Option<PathBuf>,

    #[arg(long)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand)]
enum Command {
    Upload {
        #[arg(required = true)]
        paths: Vec<PathBuf>,
        #[arg(long)]
        video_only: bool,
        /// Run the whole flow against an in-process transfer.
        #[arg(long)]
        dry_run: bool,
    },
    List,
    Remove {
        id: String,
    },
    Settings {
        #[command(subcommand)]
        cmd: SettingsCmd,
    },
}

#[derive(Subcommand)]
enum SettingsCmd {
    Get,
    Init,
}

#[derive(Debug, Serialize)]
struct CliError {
    code: &'static str,
    message: String,
    details: serde_json::Value,
    retryable: bool,
}

impl CliError {
    fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: serde_json::json!({}),
            retryable: false,
        }
    }

    fn retryable(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: serde_json::json!({}),
            retryable: true,
        }
    }
}

/// Exit code when the run finished but some uploads failed.
const EXIT_PARTIAL_FAILURE: i32 = 2;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let code = match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            emit_error(&e);
            1
        }
    };
    std::process::exit(code);
}

async fn run(cli: Cli) -> Result<i32, CliError> {
    let config_dir = cli
        .config_dir
        .or_else(|| {
            std::env::var("VIMOUPLOAD_CONFIG_DIR")
                .ok()
                .map(PathBuf::from)
        })
        .unwrap_or_else(default_config_dir);
    let data_dir = cli
        .data_dir
        .or_else(|| std::env::var("VIMOUPLOAD_DATA_DIR").ok().map(PathBuf::from))
        .unwrap_or_else(default_data_dir);

    match cli.cmd {
        Command::Upload {
            paths,
            video_only,
            dry_run,
        } => {
            upload_run(
                &config_dir,
                &data_dir,
                paths,
                UploadFlags {
                    video_only,
                    dry_run,
                    json: cli.json,
                    events: cli.events,
                },
            )
            .await
        }
        Command::List => list_run(&data_dir, cli.json).map(|_| 0),
        Command::Remove { id } => remove_run(&data_dir, &id, cli.json).map(|_| 0),
        Command::Settings { cmd } => match cmd {
            SettingsCmd::Get => settings_get(&config_dir, cli.json).map(|_| 0),
            SettingsCmd::Init => settings_init(&config_dir, cli.json).map(|_| 0),
        },
    }
}

struct UploadFlags {
    video_only: bool,
    dry_run: bool,
    json: bool,
    events: bool,
}

async fn upload_run(
    config_dir: &Path,
    data_dir: &Path,
    paths: Vec<PathBuf>,
    flags: UploadFlags,
) -> Result<i32, CliError> {
    let settings = load_settings(config_dir).map_err(map_core_err)?;
    let session_path = session_json_path(data_dir);
    let session = load_session(&session_path).map_err(map_core_err)?;

    let run_id = format!("run_{}", uuid::Uuid::new_v4());
    let _log = start_run_log("upload", &run_id, data_dir)
        .map_err(|e| CliError::new("log.unavailable", e.to_string()))?;
    info!(event = "run.start", kind = "upload", run_id = %run_id, "run.start");

    let transfer: Arc<dyn Transfer> = if flags.dry_run {
        Arc::new(InMemoryTransfer::new())
    } else {
        Arc::new(HttpTransfer::new(settings.http_transfer_config()))
    };
    let orch = UploadOrchestrator::new(
        transfer,
        OrchestratorOptions {
            max_concurrent_uploads: settings.upload.max_concurrent_uploads,
        },
    )
    .with_known_uploads(session.videos);

    let selector =
        PathSelector::new(paths).video_only(flags.video_only || settings.selection.video_only);
    let mut submission = orch.select_and_submit(&selector).map_err(map_core_err)?;

    let mut printers = Vec::new();
    if flags.events {
        for task in &submission.accepted {
            println!(
                "{}",
                serde_json::json!({
                    "type": "upload.state",
                    "uploadId": task.upload_id,
                    "name": task.candidate.name,
                    "state": task.state.as_str(),
                })
            );
        }
        if !submission.duplicates.is_empty() {
            println!(
                "{}",
                serde_json::json!({
                    "type": "upload.duplicates",
                    "names": submission.duplicates.names(),
                    "message": submission.duplicates.message(),
                })
            );
        }
        for sub in submission.take_all_events() {
            printers.push(tokio::spawn(print_events(sub)));
        }
    }

    let duplicates = submission.duplicates.clone();
    let tasks = submission.join().await;
    for printer in printers {
        let _ = printer.await;
    }

    let known = orch.known_uploads();
    save_session(&session_path, &known).map_err(map_core_err)?;

    let failed = tasks
        .iter()
        .filter(|t| t.state == TaskState::Failed)
        .count();
    info!(
        event = "run.finish",
        kind = "upload",
        run_id = %run_id,
        accepted = tasks.len(),
        failed,
        duplicates = duplicates.files.len(),
        "run.finish"
    );

    if flags.events {
        // Everything was already streamed.
    } else if flags.json {
        println!(
            "{}",
            serde_json::json!({
                "tasks": tasks,
                "duplicates": duplicates.names(),
                "known": known,
            })
        );
    } else {
        for task in &tasks {
            print_task_line(task, &known);
        }
        if !duplicates.is_empty() {
            println!("{}", duplicates.message());
        }
    }

    Ok(if failed > 0 { EXIT_PARTIAL_FAILURE } else { 0 })
}

async fn print_events(mut sub: RelaySubscription) {
    while let Some(event) = sub.recv().await {
        let line = match &event {
            UploadEvent::Progress(p) => serde_json::json!({
                "type": "upload.progress",
                "uploadId": p.upload_id,
                "progress": p.progress,
            }),
            UploadEvent::Succeeded { upload_id, video } => serde_json::json!({
                "type": "upload.state",
                "uploadId": upload_id,
                "state": "succeeded",
                "video": video,
            }),
            UploadEvent::Failed { upload_id, reason } => serde_json::json!({
                "type": "upload.state",
                "uploadId": upload_id,
                "state": "failed",
                "error": reason,
            }),
        };
        println!("{line}");
        if event.is_terminal() {
            break;
        }
    }
}

fn print_task_line(task: &UploadTask, known: &[vimo_upload_core::UploadedVideo]) {
    match task.state {
        TaskState::Succeeded => {
            let server_path = known
                .iter()
                .find(|v| v.local_path == task.candidate.path)
                .map(|v| v.server_path.as_str())
                .unwrap_or("?");
            println!("succeeded {} -> {server_path}", task.candidate.name);
        }
        _ => println!(
            "failed {}: {}",
            task.candidate.name,
            task.error_reason.as_deref().unwrap_or("unknown error")
        ),
    }
}

fn list_run(data_dir: &Path, json: bool) -> Result<(), CliError> {
    let session = load_session(&session_json_path(data_dir)).map_err(map_core_err)?;
    if json {
        println!(
            "{}",
            serde_json::to_string(&session.videos)
                .map_err(|e| CliError::new("session.invalid", e.to_string()))?
        );
        return Ok(());
    }
    for v in &session.videos {
        println!(
            "{} {} {} -> {} ({} bytes)",
            v.id, v.name, v.local_path, v.server_path, v.size
        );
    }
    Ok(())
}

/// Local-only: never reads settings or contacts the server.
fn remove_run(data_dir: &Path, id: &str, json: bool) -> Result<(), CliError> {
    let session_path = session_json_path(data_dir);
    let session = load_session(&session_path).map_err(map_core_err)?;

    let run_id = format!("run_{}", uuid::Uuid::new_v4());
    let _log = start_run_log("remove", &run_id, data_dir)
        .map_err(|e| CliError::new("log.unavailable", e.to_string()))?;

    let orch = UploadOrchestrator::new(
        Arc::new(InMemoryTransfer::new()),
        OrchestratorOptions::default(),
    )
    .with_known_uploads(session.videos);
    let removed = orch.remove(id);
    if removed {
        save_session(&session_path, &orch.known_uploads()).map_err(map_core_err)?;
    }

    if json {
        println!("{}", serde_json::json!({ "id": id, "removed": removed }));
    } else if removed {
        println!("removed {id}");
    } else {
        println!("not found {id}");
    }
    Ok(())
}

fn settings_get(config_dir: &Path, json: bool) -> Result<(), CliError> {
    let settings = load_settings(config_dir).map_err(map_core_err)?;
    if json {
        println!(
            "{}",
            serde_json::json!({
                "settings": settings,
                "uploadUrl": settings.upload_url(),
            })
        );
    } else {
        let text = toml::to_string(&settings)
            .map_err(|e| CliError::new("config.invalid", e.to_string()))?;
        print!("{text}");
    }
    Ok(())
}

fn settings_init(config_dir: &Path, json: bool) -> Result<(), CliError> {
    let path = config_path(config_dir);
    let created = !path.exists();
    if created {
        save_settings(config_dir, &Settings::default()).map_err(map_core_err)?;
    }
    if json {
        println!(
            "{}",
            serde_json::json!({ "path": path.display().to_string(), "created": created })
        );
    } else {
        println!("{}{}", path.display(), if created { "" } else { " (exists)" });
    }
    Ok(())
}

fn default_config_dir() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    PathBuf::from(home).join(".config").join(APP_NAME)
}

fn default_data_dir() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    PathBuf::from(home)
        .join(".local")
        .join("share")
        .join(APP_NAME)
}

fn map_core_err(e: vimo_upload_core::Error) -> CliError {
    match e {
        vimo_upload_core::Error::InvalidConfig { message } => {
            CliError::new("config.invalid", message)
        }
        vimo_upload_core::Error::Selection { message } => {
            CliError::new("selection.empty", message)
        }
        e @ vimo_upload_core::Error::Read { .. } => {
            CliError::new("upload.read_failed", e.to_string())
        }
        vimo_upload_core::Error::Transfer { message } => {
            CliError::retryable("upload.failed", message)
        }
        other => CliError::new("unknown", other.to_string()),
    }
}

fn emit_error(e: &CliError) {
    let json = serde_json::to_string(e).unwrap_or_else(|_| {
        serde_json::json!({
            "code": "unknown",
            "message": "json encode failed",
            "details": {},
            "retryable": false,
        })
        .to_string()
    });
    let _ = writeln!(std::io::stderr(), "{json}");
}
