//! End-to-end conversion runs against the simulated datalad/git/validator.
//!
//! Every run uses the native copy engine, a lock file and log directory
//! inside the test's temp dir, and a fail-closed decider.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bids2datalad::adapters::SimulatedRunner;
use bids2datalad::config::AppConfig;
use bids2datalad::context::RunContext;
use bids2datalad::core::controller::{ConversionRequest, ConversionSummary, PipelineController};
use bids2datalad::core::decide::FixedDecider;
use bids2datalad::core::lock::RunLock;
use bids2datalad::core::transfer_engine::TransferEngineType;
use bids2datalad::error::{PipelineError, Result};
use bids2datalad::logging::{self, LogSink};
use tempfile::{TempDir, tempdir};
use tracing_subscriber::layer::SubscriberExt;

struct Harness {
    temp: TempDir,
    source: PathBuf,
    out: PathBuf,
    runner: SimulatedRunner,
    sink: LogSink,
}

impl Harness {
    fn new() -> Self {
        let temp = tempdir().unwrap();
        let source = temp.path().join("src/study");
        write_bids(&source, &["sub-01", "sub-02"]);
        let out = temp.path().join("out");
        fs::create_dir_all(&out).unwrap();

        Self {
            temp,
            source,
            out,
            runner: SimulatedRunner::new(),
            sink: LogSink::buffered(),
        }
    }

    fn config(&self) -> AppConfig {
        AppConfig {
            transfer_engine: TransferEngineType::Native,
            non_interactive: true,
            lock_path: self.temp.path().join("run.lock"),
            log_dir: Some(self.temp.path().join("logs")),
            retry_attempts: 2,
            retry_backoff_ms: 0,
            low_space_threshold_gb: 0,
            ..AppConfig::default()
        }
    }

    fn dataset(&self) -> PathBuf {
        self.out.join("study")
    }

    async fn run(&self, config: AppConfig) -> Result<ConversionSummary> {
        let ctx = RunContext::new(
            config,
            Arc::new(self.runner.clone()),
            Arc::new(FixedDecider::fail_closed()),
            self.sink.clone(),
        );
        PipelineController::new(
            ctx,
            ConversionRequest {
                source: self.source.clone(),
                destination_root: self.out.clone(),
            },
        )
        .run()
        .await
    }

    fn log(&self) -> String {
        self.sink.contents().unwrap()
    }

    fn calls_matching(&self, needle: &str) -> Vec<String> {
        self.runner
            .calls()
            .into_iter()
            .filter(|c| c.contains(needle))
            .collect()
    }
}

/// Route this thread's events into `sink`, as `logging::init` does for the binary.
fn capture(sink: &LogSink) -> tracing::subscriber::DefaultGuard {
    tracing::subscriber::set_default(
        tracing_subscriber::registry().with(logging::file_layer(sink.clone())),
    )
}

fn write(path: &Path, content: &[u8]) {
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, content).unwrap();
}

fn write_bids(root: &Path, subjects: &[&str]) {
    write(
        &root.join("dataset_description.json"),
        br#"{"Name": "Pipeline study", "BIDSVersion": "1.9.0"}"#,
    );
    write(&root.join("participants.tsv"), b"participant_id\tage\nsub-01\t31\nsub-02\t27\n");
    write(&root.join("README"), b"Two subject test study\n");
    for subject in subjects {
        write(
            &root.join(format!("{subject}/anat/{subject}_T1w.nii.gz")),
            format!("T1 volume of {subject}").repeat(64).as_bytes(),
        );
        write(
            &root.join(format!("{subject}/anat/{subject}_T1w.json")),
            br#"{"RepetitionTime": 2.3}"#,
        );
        write(
            &root.join(format!("{subject}/func/{subject}_task-rest_bold.nii.gz")),
            format!("BOLD series of {subject}").repeat(256).as_bytes(),
        );
    }
}

/// Whether a recorded command line changes a dataset.
fn mutates(call: &str) -> bool {
    ["datalad create", "datalad save", "datalad remove", "datalad drop", " commit", " annex add", " gc"]
        .iter()
        .any(|op| call.contains(op))
}

/// Relative path to content for every file under `root`.
fn snapshot(root: &Path) -> BTreeMap<PathBuf, Vec<u8>> {
    fn walk(root: &Path, dir: &Path, out: &mut BTreeMap<PathBuf, Vec<u8>>) {
        for entry in fs::read_dir(dir).unwrap() {
            let path = entry.unwrap().path();
            if path.is_dir() {
                walk(root, &path, out);
            } else {
                out.insert(
                    path.strip_prefix(root).unwrap().to_path_buf(),
                    fs::read(&path).unwrap(),
                );
            }
        }
    }
    let mut out = BTreeMap::new();
    walk(root, root, &mut out);
    out
}

#[tokio::test]
async fn two_subject_study_converts_and_verifies() {
    let h = Harness::new();
    let _guard = capture(&h.sink);
    let before = snapshot(&h.source);
    let report_path = h.temp.path().join("report.json");

    let summary = h
        .run(AppConfig {
            report: Some(report_path.clone()),
            ..h.config()
        })
        .await
        .unwrap();

    let dataset = h.dataset();
    assert_eq!(summary.dataset, dataset);
    assert_eq!(summary.subjects, 2);
    assert_eq!(summary.sub_units.created, vec!["sub-01", "sub-02"]);
    assert!(summary.sub_units.skipped.is_empty());

    assert!(dataset.join(".datalad").is_dir());
    assert!(dataset.join("sub-01/.datalad").is_dir());
    assert!(dataset.join("sub-02/.datalad").is_dir());
    assert!(dataset.join("sub-02/func/sub-02_task-rest_bold.nii.gz").is_file());
    let attributes = fs::read_to_string(dataset.join(".gitattributes")).unwrap();
    assert!(attributes.contains("annex.largefiles=(largerthan=1mb)"));

    let audit = summary.audit.expect("audit runs outside dry-run");
    assert!(audit.passed());
    assert_eq!(audit.verified(), 8);

    let commits = fs::read_to_string(dataset.join(".git/simulated-commits")).unwrap();
    assert_eq!(commits.lines().next(), Some("Configure storage policy"));
    assert!(commits.contains("(2 subjects)"));

    let log_path = summary.log_path.expect("log persisted");
    assert_eq!(log_path.parent(), Some(dataset.as_path()));
    assert!(log_path.file_name().unwrap().to_string_lossy().starts_with("conversion_"));
    let log = h.log();
    assert!(log.contains("Subjects processed: 2"), "{log}");
    assert!(log.contains("Integrity check passed: 8 files verified"), "{log}");

    let report: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(&report_path).unwrap()).unwrap();
    assert_eq!(report["passed"], true);
    assert_eq!(report["subjects"], 2);

    assert_eq!(snapshot(&h.source), before, "source must never change");
}

#[tokio::test]
async fn dry_run_touches_nothing() {
    let h = Harness::new();
    let _guard = capture(&h.sink);
    let before = snapshot(&h.source);

    let summary = h
        .run(AppConfig {
            dry_run: true,
            ..h.config()
        })
        .await
        .unwrap();

    assert!(summary.dry_run);
    assert!(summary.audit.is_none());
    assert!(summary.copy.is_none());
    assert!(!h.dataset().exists());
    assert!(h.calls_matching("datalad create").is_empty());
    assert!(h.calls_matching("datalad save").is_empty());
    assert_eq!(snapshot(&h.source), before);

    let log_path = summary.log_path.expect("dry-run log goes to the log dir");
    assert!(log_path.starts_with(h.temp.path().join("logs")));
    assert!(h.log().contains("[dry-run] would copy 9 files"));
}

#[tokio::test]
async fn dry_run_with_backup_leaves_existing_destination_alone() {
    let h = Harness::new();
    let _guard = capture(&h.sink);
    write(&h.dataset().join("notes.txt"), b"keep me");
    write(&h.dataset().join("derivatives/qc.tsv"), b"subject\tok\n");
    let before = snapshot(&h.out);
    let config = AppConfig {
        dry_run: true,
        backup: true,
        ..h.config()
    };
    let lock_path = config.lock_path.clone();

    let summary = h.run(config).await.unwrap();

    assert!(summary.dry_run);
    assert_eq!(snapshot(&h.out), before, "destination tree is untouched");
    let siblings: Vec<String> = fs::read_dir(&h.out)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    assert_eq!(siblings, vec!["study"], "no backup sibling is created");
    assert!(!lock_path.exists());
    assert!(h.runner.calls().iter().all(|c| !mutates(c)), "{:?}", h.runner.calls());
    assert!(h.log().contains("[dry-run] would back up and clear"));
    let log_path = summary.log_path.unwrap();
    assert!(!log_path.starts_with(&h.out));
}

#[tokio::test]
async fn dry_run_update_leaves_existing_dataset_alone() {
    let h = Harness::new();
    h.run(h.config()).await.unwrap();
    let before = snapshot(&h.out);
    let calls_before = h.runner.calls().len();

    let summary = h
        .run(AppConfig {
            dry_run: true,
            update: true,
            ..h.config()
        })
        .await
        .unwrap();

    assert!(summary.dry_run);
    assert_eq!(snapshot(&h.out), before);
    let new_calls = &h.runner.calls()[calls_before..];
    assert!(new_calls.iter().all(|c| !mutates(c)), "{new_calls:?}");
}

#[tokio::test]
async fn non_empty_destination_is_refused() {
    let h = Harness::new();
    write(&h.dataset().join("notes.txt"), b"keep me");

    let err = h.run(h.config()).await.unwrap_err();

    assert!(matches!(err, PipelineError::UnsafeDestination { .. }), "{err}");
    assert!(err.to_string().contains("--backup"));
    assert_eq!(fs::read(h.dataset().join("notes.txt")).unwrap(), b"keep me");
    assert!(h.calls_matching("datalad create").is_empty());
}

#[tokio::test]
async fn force_empty_refuses_even_with_backup() {
    let h = Harness::new();
    write(&h.dataset().join("notes.txt"), b"keep me");

    let err = h
        .run(AppConfig {
            force_empty: true,
            backup: true,
            ..h.config()
        })
        .await
        .unwrap_err();

    assert!(matches!(err, PipelineError::UnsafeDestination { .. }));
    assert!(h.dataset().join("notes.txt").exists());
}

#[tokio::test]
async fn backup_moves_existing_content_aside() {
    let h = Harness::new();
    write(&h.dataset().join("notes.txt"), b"keep me");

    let summary = h
        .run(AppConfig {
            backup: true,
            ..h.config()
        })
        .await
        .unwrap();

    assert!(summary.audit.unwrap().passed());
    assert!(!h.dataset().join("notes.txt").exists());
    let backups: Vec<PathBuf> = fs::read_dir(&h.out)
        .unwrap()
        .map(|e| e.unwrap().path())
        .filter(|p| p.file_name().unwrap().to_string_lossy().starts_with("study_backup_"))
        .collect();
    assert_eq!(backups.len(), 1);
    assert_eq!(fs::read(backups[0].join("notes.txt")).unwrap(), b"keep me");
}

#[tokio::test]
async fn failed_sub_dataset_skips_only_that_subject() {
    let h = Harness::new();
    let _guard = capture(&h.sink);
    h.runner.fail_matching("study/sub-02");

    let summary = h.run(h.config()).await.unwrap();

    assert_eq!(summary.sub_units.created, vec!["sub-01"]);
    assert_eq!(summary.sub_units.skipped.len(), 1);
    assert_eq!(summary.sub_units.skipped[0].0, "sub-02");
    assert!(summary.warnings.iter().any(|w| w.contains("sub-02")));
    assert!(h.dataset().join("sub-02/anat/sub-02_T1w.nii.gz").is_file());
    assert!(summary.audit.unwrap().passed());
    assert!(h.log().contains("Skipped subjects: sub-02"));
}

#[tokio::test]
async fn unsaveable_sub_dataset_does_not_abort_commit() {
    let h = Harness::new();
    let _guard = capture(&h.sink);
    let sub = h.dataset().join("sub-02");
    h.runner.fail_matching(&format!("save -d {}", sub.display()));
    h.runner.fail_matching(&format!("{} commit", sub.display()));

    let summary = h.run(h.config()).await.unwrap();

    assert_eq!(summary.sub_units.created, vec!["sub-01", "sub-02"]);
    assert!(
        summary
            .warnings
            .iter()
            .any(|w| w.contains("Could not save sub-02") && w.contains("datalad save -d")),
        "{:?}",
        summary.warnings
    );
    assert!(h.dataset().join(".datalad").is_dir(), "dataset is kept");
    let commits = fs::read_to_string(h.dataset().join(".git/simulated-commits")).unwrap();
    assert!(commits.contains("(2 subjects)"));
    assert!(summary.audit.unwrap().passed());
}

#[tokio::test]
async fn commit_failure_rolls_back_created_dataset() {
    let h = Harness::new();
    let _guard = capture(&h.sink);
    h.runner.fail_matching("(2 subjects)");

    let err = h.run(h.config()).await.unwrap_err();

    assert!(matches!(err, PipelineError::Tool { attempts: 2, .. }), "{err}");
    assert!(!h.dataset().exists(), "created dataset is rolled back");
    let log_path = h.sink.location().expect("log persisted after failure");
    assert!(log_path.starts_with(h.temp.path().join("logs")));
    assert!(h.log().contains("Rolling back"));
}

#[tokio::test]
async fn held_lock_blocks_second_run() {
    let h = Harness::new();
    let config = h.config();
    let _held = RunLock::acquire(&config.lock_path).unwrap();

    let err = h.run(config).await.unwrap_err();

    assert!(matches!(err, PipelineError::LockHeld { .. }), "{err}");
    assert!(!h.dataset().exists());
    assert!(h.runner.calls().is_empty());
}

#[tokio::test]
async fn lock_is_released_after_run() {
    let h = Harness::new();
    let config = h.config();

    h.run(config.clone()).await.unwrap();

    let relock = RunLock::acquire(&config.lock_path);
    assert!(relock.is_ok(), "lock should be free after the run");
}

#[tokio::test]
async fn update_reuses_existing_dataset() {
    let h = Harness::new();
    h.run(h.config()).await.unwrap();

    let summary = h
        .run(AppConfig {
            update: true,
            ..h.config()
        })
        .await
        .unwrap();

    assert_eq!(summary.sub_units.reused, vec!["sub-01", "sub-02"]);
    assert!(summary.sub_units.created.is_empty());
    let copy = summary.copy.unwrap();
    assert_eq!(copy.result.files_copied, 0);
    assert_eq!(copy.result.files_unchanged, 9);
    assert!(summary.audit.unwrap().passed());
}

#[tokio::test]
async fn rerun_without_update_is_refused_and_kept() {
    let h = Harness::new();
    h.run(h.config()).await.unwrap();

    let err = h.run(h.config()).await.unwrap_err();

    assert!(matches!(err, PipelineError::UnsafeDestination { .. }));
    assert!(err.to_string().contains("--update"));
    assert!(h.dataset().join(".datalad").is_dir());
}

#[tokio::test]
async fn invalid_descriptor_stops_before_destination() {
    let h = Harness::new();
    fs::write(h.source.join("dataset_description.json"), b"{ not json").unwrap();

    let err = h.run(h.config()).await.unwrap_err();

    assert!(matches!(err, PipelineError::Validation(_)), "{err}");
    assert!(!h.dataset().exists());
}

#[tokio::test]
async fn missing_subjects_fail_without_a_prompt() {
    let h = Harness::new();
    fs::remove_dir_all(h.source.join("sub-01")).unwrap();
    fs::remove_dir_all(h.source.join("sub-02")).unwrap();

    let err = h.run(h.config()).await.unwrap_err();

    assert!(matches!(err, PipelineError::Validation(_)), "{err}");
    assert!(err.to_string().contains("non-interactive"));
}

#[tokio::test]
async fn missing_tools_are_reported_together() {
    let h = Harness::new();
    h.runner.mark_missing("datalad");
    h.runner.mark_missing("git-annex");

    let err = h.run(h.config()).await.unwrap_err();

    match err {
        PipelineError::MissingDependencies(missing) => {
            assert_eq!(missing.len(), 2, "{missing:?}");
        }
        other => panic!("expected missing dependencies, got {other}"),
    }
    assert!(!h.dataset().exists());
}

#[tokio::test]
async fn fast_track_run_matches_standard_run() {
    let standard = Harness::new();
    let fast = Harness::new();

    let a = standard.run(standard.config()).await.unwrap();
    let b = fast
        .run(AppConfig {
            fast_track: true,
            ..fast.config()
        })
        .await
        .unwrap();

    let digests = |s: &ConversionSummary| {
        s.audit
            .as_ref()
            .unwrap()
            .records
            .iter()
            .map(|r| (r.relative_path.clone(), r.destination_digest.clone()))
            .collect::<Vec<_>>()
    };
    assert_eq!(digests(&a), digests(&b));
}
