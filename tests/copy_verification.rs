//! Integration tests for the copy engines and the post-copy audit.
//!
//! - Native: hashes each file while copying, then re-hashes the destination
//! - Rsync: relies on `--checksum` in standard mode
//!
//! The [`IntegrityAuditor`] is run afterwards to confirm the trees match.

use bids2datalad::core::auditor::IntegrityAuditor;
use bids2datalad::core::hashing::HashVerifier;
use bids2datalad::core::transfer_engine::{
    CopyEngine, ExclusionRules, IntegrityMode, TransferEngineType, TransferRequest, TransferResult,
    TransferStatus, create_engine,
};
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use tempfile::tempdir;
use tokio::sync::mpsc;

fn create_file(path: &Path, content: &[u8]) {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(path, content).unwrap();
}

fn create_file_with_mode(path: &Path, content: &[u8], mode: u32) {
    create_file(path, content);
    let mut perms = std::fs::metadata(path).unwrap().permissions();
    perms.set_mode(mode);
    std::fs::set_permissions(path, perms).unwrap();
}

/// A small BIDS-shaped tree with two subjects.
fn bids_tree(root: &Path) {
    create_file(
        &root.join("dataset_description.json"),
        br#"{"Name": "copy test", "BIDSVersion": "1.9.0"}"#,
    );
    create_file(&root.join("participants.tsv"), b"participant_id\nsub-01\nsub-02\n");
    for subject in ["sub-01", "sub-02"] {
        create_file(
            &root.join(format!("{subject}/anat/{subject}_T1w.nii.gz")),
            format!("volume for {subject}").as_bytes(),
        );
        create_file(
            &root.join(format!("{subject}/anat/{subject}_T1w.json")),
            b"{\"RepetitionTime\": 2.0}",
        );
    }
}

fn has_rsync() -> bool {
    std::process::Command::new("rsync")
        .arg("--version")
        .output()
        .is_ok_and(|o| o.status.success())
}

async fn run_transfer(
    engine_type: TransferEngineType,
    source: &Path,
    destination: &Path,
    mode: IntegrityMode,
) -> (bids2datalad::error::Result<TransferResult>, Vec<TransferStatus>) {
    let engine = create_engine(engine_type);
    let (tx, mut rx) = mpsc::channel(100);

    let req = TransferRequest {
        source: source.to_path_buf(),
        destination: destination.to_path_buf(),
        mode,
        exclusions: ExclusionRules::default(),
    };

    let handle = tokio::spawn(async move { engine.transfer(&req, tx).await });

    let mut updates = Vec::new();
    while let Some(status) = rx.recv().await {
        updates.push(status);
    }

    (handle.await.unwrap(), updates)
}

async fn audit(source: &Path, dest: &Path, subjects: usize) -> bids2datalad::core::AuditReport {
    IntegrityAuditor::new(HashVerifier::default(), false, 4)
        .audit(source, dest, subjects)
        .await
        .unwrap()
}

#[tokio::test]
async fn test_native_copy_then_audit_passes() {
    let temp = tempdir().unwrap();
    let source = temp.path().join("source");
    let dest = temp.path().join("dest");
    bids_tree(&source);

    let (result, updates) =
        run_transfer(TransferEngineType::Native, &source, &dest, IntegrityMode::Standard).await;
    let result = result.unwrap();

    assert_eq!(result.files_copied, 6);
    assert_eq!(result.file_hashes.as_ref().map(Vec::len), Some(6));
    assert!(matches!(updates.last(), Some(TransferStatus::Complete)));

    let report = audit(&source, &dest, 2).await;
    assert!(report.passed(), "audit should pass: {:?}", report.count);
    assert_eq!(report.verified(), 6);
}

#[tokio::test]
async fn test_audit_detects_corruption_after_copy() {
    let temp = tempdir().unwrap();
    let source = temp.path().join("source");
    let dest = temp.path().join("dest");
    bids_tree(&source);

    let (result, _) =
        run_transfer(TransferEngineType::Native, &source, &dest, IntegrityMode::Standard).await;
    result.unwrap();

    std::fs::write(dest.join("sub-02/anat/sub-02_T1w.nii.gz"), b"bit rot").unwrap();
    std::fs::remove_file(dest.join("sub-01/anat/sub-01_T1w.json")).unwrap();

    let report = audit(&source, &dest, 2).await;
    assert!(!report.passed());
    assert!(!report.count.passed());
    let err = report.ensure_passed().unwrap_err().to_string();
    assert!(err.contains("sub-01/anat/sub-01_T1w.json"), "{err}");
}

#[tokio::test]
async fn test_rsync_transfer_with_checksum() {
    if !has_rsync() {
        return;
    }
    let temp = tempdir().unwrap();
    let source = temp.path().join("source");
    let dest = temp.path().join("dest");
    bids_tree(&source);
    create_file(&source.join(".DS_Store"), b"finder");

    let (result, updates) =
        run_transfer(TransferEngineType::Rsync, &source, &dest, IntegrityMode::Standard).await;
    result.unwrap();

    assert!(matches!(updates.first(), Some(TransferStatus::Ready)));
    assert!(!dest.join(".DS_Store").exists(), "platform artifacts are excluded");
    assert!(audit(&source, &dest, 2).await.passed());
}

#[tokio::test]
async fn test_native_copy_empty_directory() {
    let temp = tempdir().unwrap();
    let source = temp.path().join("source");
    let dest = temp.path().join("dest");
    std::fs::create_dir_all(&source).unwrap();

    let (result, _) =
        run_transfer(TransferEngineType::Native, &source, &dest, IntegrityMode::Standard).await;
    let result = result.unwrap();

    assert_eq!(result.files_copied, 0);
    assert_eq!(result.total_bytes, 0);
}

#[tokio::test]
async fn test_native_copy_preserves_permissions() {
    let temp = tempdir().unwrap();
    let source = temp.path().join("source");
    let dest = temp.path().join("dest");

    create_file_with_mode(&source.join("sub-01/func/events.tsv"), b"onset\n", 0o640);
    create_file_with_mode(&source.join("code/convert.sh"), b"#!/bin/sh\n", 0o755);

    let (result, _) =
        run_transfer(TransferEngineType::Native, &source, &dest, IntegrityMode::Standard).await;
    result.unwrap();

    let mode = |p: &Path| std::fs::metadata(p).unwrap().permissions().mode() & 0o777;
    assert_eq!(mode(&dest.join("sub-01/func/events.tsv")), 0o640);
    assert_eq!(mode(&dest.join("code/convert.sh")), 0o755);
}

fn set_mode(path: &Path, mode: u32) {
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode)).unwrap();
}

#[tokio::test]
async fn test_native_copy_read_only_source_directory() {
    let temp = tempdir().unwrap();
    let source = temp.path().join("source");
    let dest = temp.path().join("dest");
    bids_tree(&source);
    let anat = source.join("sub-01/anat");
    set_mode(&anat, 0o555);

    let (first, _) =
        run_transfer(TransferEngineType::Native, &source, &dest, IntegrityMode::Standard).await;
    let copied_mode = std::fs::metadata(dest.join("sub-01/anat")).map(|m| m.permissions().mode() & 0o777);

    std::fs::write(anat.join("sub-01_T1w.json"), b"{\"RepetitionTime\": 2.5}").unwrap();
    let (second, _) =
        run_transfer(TransferEngineType::Native, &source, &dest, IntegrityMode::Standard).await;
    let report = audit(&source, &dest, 2).await;

    set_mode(&anat, 0o755);
    if dest.join("sub-01/anat").exists() {
        set_mode(&dest.join("sub-01/anat"), 0o755);
    }

    assert_eq!(first.unwrap().files_copied, 6);
    assert_eq!(copied_mode.unwrap(), 0o555);
    assert_eq!(second.unwrap().files_copied, 1, "a read-only copy from an earlier run is updated");
    assert!(report.passed());
}

#[tokio::test]
async fn test_symlinked_source_file_is_copied_and_audited() {
    let temp = tempdir().unwrap();
    let source = temp.path().join("source");
    let dest = temp.path().join("dest");
    bids_tree(&source);
    let shared = temp.path().join("shared/sub-02_T2w.nii.gz");
    create_file(&shared, b"T2 volume");
    std::os::unix::fs::symlink(&shared, source.join("sub-02/anat/sub-02_T2w.nii.gz")).unwrap();

    let (result, _) =
        run_transfer(TransferEngineType::Native, &source, &dest, IntegrityMode::Standard).await;
    assert_eq!(result.unwrap().files_copied, 7);

    let copied = dest.join("sub-02/anat/sub-02_T2w.nii.gz");
    assert!(!std::fs::symlink_metadata(&copied).unwrap().is_symlink());
    assert_eq!(std::fs::read(&copied).unwrap(), b"T2 volume");

    let report = audit(&source, &dest, 2).await;
    assert!(report.passed(), "{:?}", report.count);
    assert_eq!(report.verified(), 7);
}

#[tokio::test]
async fn test_fast_track_and_standard_produce_identical_content() {
    let temp = tempdir().unwrap();
    let source = temp.path().join("source");
    let standard = temp.path().join("standard");
    let fast = temp.path().join("fast");
    bids_tree(&source);

    let engine = || CopyEngine::new(create_engine(TransferEngineType::Native), 0);
    engine()
        .run(&source, &standard, IntegrityMode::Standard)
        .await
        .unwrap();
    engine()
        .run(&source, &fast, IntegrityMode::FastTrack)
        .await
        .unwrap();

    let a = audit(&source, &standard, 2).await;
    let b = audit(&source, &fast, 2).await;
    assert!(a.passed() && b.passed());
    let digests = |r: &bids2datalad::core::AuditReport| {
        r.records
            .iter()
            .map(|rec| (rec.relative_path.clone(), rec.destination_digest.clone()))
            .collect::<Vec<_>>()
    };
    assert_eq!(digests(&a), digests(&b));
}

#[tokio::test]
async fn test_second_run_leaves_unchanged_files_alone() {
    let temp = tempdir().unwrap();
    let source = temp.path().join("source");
    let dest = temp.path().join("dest");
    bids_tree(&source);

    let engine = CopyEngine::new(create_engine(TransferEngineType::Native), 0);
    engine.run(&source, &dest, IntegrityMode::Standard).await.unwrap();
    let again = engine.run(&source, &dest, IntegrityMode::Standard).await.unwrap();

    assert_eq!(again.result.files_copied, 0);
    assert_eq!(again.result.files_unchanged, 6);
    assert_eq!(again.eligible_files, 6);
}
