//! Stop requests observed at unit boundaries, and forced termination

#![allow(clippy::unwrap_used, clippy::expect_used)]

mod common;

use archsync::commands::run::{execute, CommandOutcome, RunArgs};
use archsync::convert::{ConversionStats, Converter, ParquetConverter};
use archsync::error::Result;
use archsync::shutdown::ShutdownController;
use archsync::state::{StateStore, UnitStatus};
use archsync::storage::MemoryStore;
use archsync::RunOutcome;
use common::Fixture;
use std::path::Path;
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};

/// Blocks conversion of the first unit until released
struct GatedConverter {
    inner: ParquetConverter,
    gate: String,
    started: UnboundedSender<()>,
    release: Mutex<mpsc::Receiver<()>>,
}

impl Converter for GatedConverter {
    fn convert(&self, raw: &Path, artifact: &Path) -> Result<ConversionStats> {
        let name = raw.file_name().unwrap().to_string_lossy().to_string();
        if name.contains(&self.gate) {
            let _ = self.started.send(());
            let _ = self.release.lock().unwrap().recv_timeout(Duration::from_secs(30));
        }
        self.inner.convert(raw, artifact)
    }
}

fn gated() -> (Arc<GatedConverter>, UnboundedReceiver<()>, mpsc::Sender<()>) {
    let (started_tx, started_rx) = unbounded_channel();
    let (release_tx, release_rx) = mpsc::channel();
    let converter = Arc::new(GatedConverter {
        inner: ParquetConverter::new(),
        gate: "20250101".to_string(),
        started: started_tx,
        release: Mutex::new(release_rx),
    });
    (converter, started_rx, release_tx)
}

fn spawn_run(
    fx: &Fixture,
    store: Arc<MemoryStore>,
    converter: Arc<GatedConverter>,
    shutdown: ShutdownController,
) -> tokio::task::JoinHandle<archsync::Result<CommandOutcome>> {
    let config = fx.config.clone();
    let args = RunArgs {
        archive: fx.archive.clone(),
        ..RunArgs::default()
    };
    tokio::spawn(async move { execute(&config, &args, store, converter, shutdown).await })
}

fn unit_status(fx: &Fixture, date: &str) -> Option<UnitStatus> {
    StateStore::read(&fx.state_file())
        .unwrap()
        .and_then(|s| s.status_of(date))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_stop_lets_current_unit_finish_and_starts_no_more() {
    let fx = Fixture::new(&[]);
    let store = Arc::new(MemoryStore::new("test-bucket"));
    let shutdown = ShutdownController::new();
    let (converter, mut started, release) = gated();

    let handle = spawn_run(&fx, store.clone(), converter, shutdown.clone());

    tokio::time::timeout(Duration::from_secs(30), started.recv())
        .await
        .unwrap()
        .unwrap();
    shutdown.request();
    release.send(()).unwrap();

    let outcome = tokio::time::timeout(Duration::from_secs(30), handle)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(outcome.exit_code(), 3);
    let CommandOutcome::Run(report) = outcome else {
        panic!("expected a run");
    };
    assert_eq!(report.outcome, RunOutcome::StoppedByRequest);
    assert_eq!(report.processed, vec!["2025-01-01"]);
    assert_eq!(report.remaining, vec!["2025-01-02", "2025-01-03"]);

    assert_eq!(unit_status(&fx, "2025-01-01"), Some(UnitStatus::Done));
    assert_eq!(unit_status(&fx, "2025-01-02"), Some(UnitStatus::Pending));
    assert!(store.object(&fx.key("2025-01-02")).is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_second_stop_terminates_without_waiting() {
    let fx = Fixture::new(&[]);
    let store = Arc::new(MemoryStore::new("test-bucket"));
    let shutdown = ShutdownController::new();
    let (converter, mut started, release) = gated();

    let handle = spawn_run(&fx, store.clone(), converter, shutdown.clone());

    tokio::time::timeout(Duration::from_secs(30), started.recv())
        .await
        .unwrap()
        .unwrap();
    shutdown.request();
    shutdown.request();

    // returns while the first unit is still blocked in conversion
    let outcome = tokio::time::timeout(Duration::from_secs(10), handle)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    release.send(()).unwrap();

    assert_eq!(outcome.exit_code(), 130);
    let CommandOutcome::Run(report) = outcome else {
        panic!("expected a run");
    };
    assert_eq!(report.outcome, RunOutcome::Terminated);
    assert_eq!(report.interrupted.as_deref(), Some("2025-01-01"));
    assert!(report.processed.is_empty());

    // left for the next run to retry
    assert_eq!(unit_status(&fx, "2025-01-01"), Some(UnitStatus::InProgress));
    assert!(store.keys().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_in_progress_unit_is_retried_on_next_run() {
    let fx = Fixture::new(&[]);
    let store = Arc::new(MemoryStore::new("test-bucket"));
    let shutdown = ShutdownController::new();
    let (converter, mut started, release) = gated();

    let handle = spawn_run(&fx, store.clone(), converter, shutdown.clone());
    started.recv().await.unwrap();
    shutdown.request();
    shutdown.request();
    handle.await.unwrap().unwrap();
    release.send(()).unwrap();

    let args = RunArgs {
        archive: fx.archive.clone(),
        ..RunArgs::default()
    };
    let outcome = execute(
        &fx.config,
        &args,
        store.clone(),
        Arc::new(ParquetConverter::new()),
        ShutdownController::new(),
    )
    .await
    .unwrap();
    assert_eq!(outcome.exit_code(), 0);
    assert_eq!(unit_status(&fx, "2025-01-01"), Some(UnitStatus::Done));
    assert_eq!(store.keys().len(), 3);
}
