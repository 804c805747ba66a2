use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use vimo_upload_core::{
    Error, FileCandidate, FileSelector, InMemoryTransfer, OrchestratorOptions, ProgressEvent,
    ProgressSink, Result, TaskState, Transfer, TransferReceipt, UploadEvent, UploadOrchestrator,
};

fn candidate(name: &str, size: u64) -> FileCandidate {
    FileCandidate {
        name: name.to_string(),
        path: format!("/v/{name}"),
        size,
    }
}

fn orchestrator(transfer: Arc<dyn Transfer>) -> UploadOrchestrator {
    UploadOrchestrator::new(transfer, OrchestratorOptions::default())
}

fn progress_values(events: &[UploadEvent]) -> Vec<u8> {
    events
        .iter()
        .filter_map(|e| match e {
            UploadEvent::Progress(p) => Some(p.progress),
            _ => None,
        })
        .collect()
}

struct CountingTransfer {
    delay: Duration,
    concurrent: AtomicUsize,
    max_concurrent: AtomicUsize,
}

impl CountingTransfer {
    fn new(delay: Duration) -> Self {
        Self {
            delay,
            concurrent: AtomicUsize::new(0),
            max_concurrent: AtomicUsize::new(0),
        }
    }

    fn max_concurrent(&self) -> usize {
        self.max_concurrent.load(Ordering::Relaxed)
    }
}

impl Transfer for CountingTransfer {
    fn endpoint(&self) -> &str {
        "test.counting"
    }

    fn transfer<'a>(
        &'a self,
        candidate: &'a FileCandidate,
        _upload_id: &'a str,
        _progress: Arc<dyn ProgressSink>,
    ) -> Pin<Box<dyn Future<Output = Result<TransferReceipt>> + Send + 'a>> {
        Box::pin(async move {
            let current = self.concurrent.fetch_add(1, Ordering::Relaxed) + 1;
            self.max_concurrent.fetch_max(current, Ordering::Relaxed);
            tokio::time::sleep(self.delay).await;
            self.concurrent.fetch_sub(1, Ordering::Relaxed);
            Ok(TransferReceipt {
                server_path: format!("/srv/{}", candidate.name),
            })
        })
    }
}

/// Reports some progress for `/v/boom.mp4`, then panics. Other paths succeed.
struct PanickingTransfer;

impl Transfer for PanickingTransfer {
    fn endpoint(&self) -> &str {
        "test.panicking"
    }

    fn transfer<'a>(
        &'a self,
        candidate: &'a FileCandidate,
        upload_id: &'a str,
        progress: Arc<dyn ProgressSink>,
    ) -> Pin<Box<dyn Future<Output = Result<TransferReceipt>> + Send + 'a>> {
        Box::pin(async move {
            progress.on_progress(ProgressEvent {
                upload_id: upload_id.to_string(),
                progress: 30,
            });
            tokio::task::yield_now().await;
            if candidate.path == "/v/boom.mp4" {
                panic!("transport exploded");
            }
            Ok(TransferReceipt {
                server_path: format!("/srv/{}", candidate.name),
            })
        })
    }
}

struct FailingSelector;

impl FileSelector for FailingSelector {
    fn select_video_files(&self) -> Result<Vec<FileCandidate>> {
        Err(Error::Selection {
            message: "no files selected".to_string(),
        })
    }
}

#[tokio::test]
async fn successful_upload_lands_in_known_set() {
    let transfer = Arc::new(InMemoryTransfer::new());
    let orch = orchestrator(transfer.clone());

    let submission = orch.submit(vec![candidate("a.mp4", 1000)]);
    assert_eq!(submission.accepted.len(), 1);
    assert!(submission.duplicates.is_empty());

    let tasks = submission.join().await;
    assert_eq!(tasks[0].state, TaskState::Succeeded);
    assert_eq!(tasks[0].progress, 100);

    let known = orch.known_uploads();
    assert_eq!(known.len(), 1);
    assert_eq!(known[0].name, "a.mp4");
    assert_eq!(known[0].local_path, "/v/a.mp4");
    assert_eq!(known[0].server_path, "/srv/a.mp4");
    assert_eq!(known[0].size, 1000);
    assert!(orch.take_duplicate_notices().is_empty());
    assert_eq!(transfer.object_count().await, 1);
}

#[tokio::test]
async fn resubmitting_a_known_path_is_a_duplicate() {
    let orch = orchestrator(Arc::new(InMemoryTransfer::new()));
    orch.submit(vec![candidate("a.mp4", 1000)]).join().await;

    let second = orch.submit(vec![candidate("a.mp4", 1000)]);
    assert!(second.accepted.is_empty());
    assert_eq!(second.duplicates.names(), vec!["a.mp4"]);
    assert!(second.join().await.is_empty());

    assert_eq!(orch.known_uploads().len(), 1);
    let notices = orch.take_duplicate_notices();
    assert_eq!(notices.len(), 1);
    assert!(notices[0].message().contains("a.mp4"));
    assert!(orch.take_duplicate_notices().is_empty());
}

#[tokio::test]
async fn same_path_twice_in_one_batch_admits_the_first() {
    let orch = orchestrator(Arc::new(InMemoryTransfer::new()));
    let mut first = candidate("a.mp4", 1000);
    first.name = "first.mp4".to_string();
    let mut second = candidate("a.mp4", 1000);
    second.name = "second.mp4".to_string();

    let submission = orch.submit(vec![first, second]);
    assert_eq!(submission.accepted.len(), 1);
    assert_eq!(submission.accepted[0].candidate.name, "first.mp4");
    assert_eq!(submission.duplicates.names(), vec!["second.mp4"]);

    submission.join().await;
    assert_eq!(orch.known_uploads().len(), 1);
    assert_eq!(orch.known_uploads()[0].name, "first.mp4");
}

#[tokio::test]
async fn failed_upload_keeps_known_set_and_reports_reason() {
    let transfer = Arc::new(InMemoryTransfer::new());
    transfer.fail_path("/v/b.mp4", "network error").await;
    let orch = orchestrator(transfer);

    let mut submission = orch.submit(vec![candidate("b.mp4", 500)]);
    let id = submission.accepted[0].upload_id.clone();
    let events = submission.take_events(&id).unwrap();

    let tasks = submission.join().await;
    assert_eq!(tasks[0].state, TaskState::Failed);
    assert_eq!(tasks[0].error_reason.as_deref(), Some("network error"));
    assert!(orch.known_uploads().is_empty());

    let events = events.collect().await;
    assert_eq!(
        events.last(),
        Some(&UploadEvent::Failed {
            upload_id: id,
            reason: "network error".to_string(),
        })
    );
}

#[tokio::test]
async fn one_failure_does_not_stop_siblings() {
    let transfer = Arc::new(InMemoryTransfer::new());
    transfer.fail_path("/v/2.mp4", "server rejected file").await;
    let orch = orchestrator(transfer);

    let tasks = orch
        .submit(vec![
            candidate("1.mp4", 10),
            candidate("2.mp4", 20),
            candidate("3.mp4", 30),
        ])
        .join()
        .await;

    let states: Vec<TaskState> = tasks.iter().map(|t| t.state).collect();
    assert_eq!(
        states,
        vec![TaskState::Succeeded, TaskState::Failed, TaskState::Succeeded]
    );

    let mut paths: Vec<String> = orch
        .known_uploads()
        .into_iter()
        .map(|v| v.local_path)
        .collect();
    paths.sort();
    assert_eq!(paths, vec!["/v/1.mp4", "/v/3.mp4"]);
}

#[tokio::test]
async fn progress_is_monotonic_and_ends_at_100() {
    let orch = orchestrator(Arc::new(InMemoryTransfer::new()));
    let mut submission = orch.submit(vec![candidate("a.mp4", 1000), candidate("b.mp4", 2000)]);
    let subscriptions = submission.take_all_events();
    assert_eq!(subscriptions.len(), 2);
    submission.join().await;

    for sub in subscriptions {
        let id = sub.upload_id().to_string();
        let events = sub.collect().await;
        assert!(events.iter().all(|e| e.upload_id() == id));

        let values = progress_values(&events);
        assert!(values.windows(2).all(|w| w[0] <= w[1]), "{values:?}");
        assert_eq!(values.last(), Some(&100));
        assert!(matches!(events.last(), Some(UploadEvent::Succeeded { .. })));
    }
}

#[tokio::test]
async fn silent_transport_still_reports_completion() {
    let orch = orchestrator(Arc::new(CountingTransfer::new(Duration::from_millis(1))));
    let mut submission = orch.submit(vec![candidate("quiet.mp4", 5)]);
    let id = submission.accepted[0].upload_id.clone();
    let events = submission.take_events(&id).unwrap();
    submission.join().await;

    let events = events.collect().await;
    assert_eq!(progress_values(&events), vec![100]);
    match events.last() {
        Some(UploadEvent::Succeeded { video, .. }) => {
            assert_eq!(video.server_path, "/srv/quiet.mp4");
        }
        other => panic!("unexpected terminal event: {other:?}"),
    }
}

#[tokio::test]
async fn overlapping_batches_keep_one_record_per_path() {
    let orch = orchestrator(Arc::new(InMemoryTransfer::with_delay(
        Duration::from_millis(20),
    )));

    let first = orch.submit(vec![candidate("a.mp4", 1000)]);
    let mut second = orch.submit(vec![candidate("a.mp4", 1000)]);
    assert_eq!(second.accepted.len(), 1, "nothing known yet, so both are admitted");
    let second_id = second.accepted[0].upload_id.clone();
    let second_events = second.take_events(&second_id).unwrap();

    let a = first.join().await;
    let b = second.join().await;
    assert_eq!(a[0].state, TaskState::Succeeded);
    assert_eq!(b[0].state, TaskState::Succeeded);

    let known = orch.known_uploads();
    assert_eq!(known.len(), 1);

    match second_events.collect().await.last() {
        Some(UploadEvent::Succeeded { video, .. }) => assert_eq!(video.id, known[0].id),
        other => panic!("unexpected terminal event: {other:?}"),
    }
}

#[tokio::test]
async fn remove_is_idempotent_and_frees_the_path() {
    let orch = orchestrator(Arc::new(InMemoryTransfer::new()));
    orch.submit(vec![candidate("a.mp4", 1000)]).join().await;
    let id = orch.known_uploads()[0].id.clone();

    assert!(orch.remove(&id));
    assert!(!orch.remove(&id));
    assert!(orch.known_uploads().is_empty());

    let again = orch.submit(vec![candidate("a.mp4", 1000)]);
    assert_eq!(again.accepted.len(), 1);
    again.join().await;

    let known = orch.known_uploads();
    assert_eq!(known.len(), 1);
    assert_ne!(known[0].id, id);
}

#[tokio::test]
async fn seeded_session_counts_as_known() {
    let orch = orchestrator(Arc::new(InMemoryTransfer::new()));
    orch.submit(vec![candidate("a.mp4", 1000)]).join().await;
    let saved = orch.known_uploads();

    let mut doubled = saved.clone();
    doubled.extend(saved.clone());
    let restored =
        orchestrator(Arc::new(InMemoryTransfer::new())).with_known_uploads(doubled);
    assert_eq!(restored.known_uploads(), saved);

    let submission = restored.submit(vec![candidate("a.mp4", 1000)]);
    assert!(submission.accepted.is_empty());
    assert_eq!(submission.duplicates.files.len(), 1);
}

#[tokio::test]
async fn in_flight_tracks_tasks_until_terminal() {
    let orch = orchestrator(Arc::new(InMemoryTransfer::with_delay(
        Duration::from_millis(20),
    )));
    let submission = orch.submit(vec![candidate("a.mp4", 1), candidate("b.mp4", 2)]);

    let in_flight = orch.in_flight();
    assert_eq!(in_flight.len(), 2);
    assert!(in_flight.iter().all(|t| !t.state.is_terminal()));

    submission.join().await;
    assert!(orch.in_flight().is_empty());
}

#[tokio::test]
async fn unbounded_by_default() {
    let transfer = Arc::new(CountingTransfer::new(Duration::from_millis(30)));
    let orch = orchestrator(transfer.clone());

    let batch = (0..6).map(|i| candidate(&format!("{i}.mp4"), 1)).collect();
    orch.submit(batch).join().await;

    assert_eq!(transfer.max_concurrent(), 6);
}

#[tokio::test]
async fn concurrency_cap_is_respected() {
    let transfer = Arc::new(CountingTransfer::new(Duration::from_millis(30)));
    let orch = UploadOrchestrator::new(
        transfer.clone(),
        OrchestratorOptions {
            max_concurrent_uploads: Some(2),
        },
    );

    let batch = (0..6).map(|i| candidate(&format!("{i}.mp4"), 1)).collect();
    let tasks = orch.submit(batch).join().await;

    assert!(tasks.iter().all(|t| t.state == TaskState::Succeeded));
    assert_eq!(transfer.max_concurrent(), 2);
    assert_eq!(orch.known_uploads().len(), 6);
}

#[tokio::test]
async fn selection_failure_changes_nothing() {
    let orch = orchestrator(Arc::new(InMemoryTransfer::new()));
    let err = orch.select_and_submit(&FailingSelector).err().unwrap();
    assert!(matches!(err, Error::Selection { .. }));
    assert!(orch.known_uploads().is_empty());
    assert!(orch.in_flight().is_empty());
}

#[tokio::test]
async fn panicking_worker_fails_its_task_and_delivers_terminal_event() {
    let orch = orchestrator(Arc::new(PanickingTransfer));
    let mut submission = orch.submit(vec![candidate("boom.mp4", 10), candidate("ok.mp4", 20)]);
    let boom_id = submission.accepted[0].upload_id.clone();
    let events = submission.take_events(&boom_id).unwrap();

    let tasks = submission.join().await;
    assert_eq!(tasks[0].state, TaskState::Failed);
    assert_eq!(tasks[0].progress, 30);
    assert_eq!(
        tasks[0].error_reason.as_deref(),
        Some("upload worker panicked: transport exploded")
    );
    assert_eq!(tasks[1].state, TaskState::Succeeded);

    let events = events.collect().await;
    assert_eq!(progress_values(&events), vec![30]);
    assert_eq!(
        events.last(),
        Some(&UploadEvent::Failed {
            upload_id: boom_id,
            reason: "upload worker panicked: transport exploded".to_string(),
        })
    );

    assert!(orch.in_flight().is_empty());
    let known = orch.known_uploads();
    assert_eq!(known.len(), 1);
    assert_eq!(known[0].local_path, "/v/ok.mp4");
}

#[tokio::test]
async fn panicking_worker_is_settled_without_join() {
    let orch = orchestrator(Arc::new(PanickingTransfer));
    let mut submission = orch.submit(vec![candidate("boom.mp4", 10)]);
    let id = submission.accepted[0].upload_id.clone();
    let events = submission.take_events(&id).unwrap();
    drop(submission);

    let events = events.collect().await;
    assert!(matches!(events.last(), Some(UploadEvent::Failed { .. })));
    assert!(orch.in_flight().is_empty());
}
