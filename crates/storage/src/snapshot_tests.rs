// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use crate::state::Op;
use dk_core::test_support;

fn tables_with_job(id: &str) -> Tables {
    let mut tables = Tables::default();
    tables.apply(&Op::PutJob(test_support::job(id, "test")));
    tables
}

#[test]
fn save_and_load_roundtrip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("snapshot.bin");

    let snapshot = Snapshot::new(42, tables_with_job("job_1"));
    let size = snapshot.save(&path).unwrap();
    assert!(size > 0);

    let loaded = Snapshot::load(&path).unwrap().unwrap();
    assert_eq!(loaded.seq, 42);
    assert!(loaded.state.jobs.contains_key("job_1"));
}

#[test]
fn load_missing_returns_none() {
    let dir = tempfile::tempdir().unwrap();
    assert!(Snapshot::load(&dir.path().join("absent.bin"))
        .unwrap()
        .is_none());
}

#[test]
fn corrupt_snapshot_is_rotated_to_bak() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("snapshot.bin");
    std::fs::write(&path, b"definitely not zstd").unwrap();

    assert!(Snapshot::load(&path).unwrap().is_none());
    assert!(!path.exists());
    assert!(path.with_extension("bak").exists());
}

#[test]
fn save_overwrites_atomically() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("snapshot.bin");

    Snapshot::new(1, tables_with_job("job_old"))
        .save(&path)
        .unwrap();
    Snapshot::new(2, tables_with_job("job_new"))
        .save(&path)
        .unwrap();

    let loaded = Snapshot::load(&path).unwrap().unwrap();
    assert_eq!(loaded.seq, 2);
    assert!(loaded.state.jobs.contains_key("job_new"));
    assert!(!path.with_extension("tmp").exists());
}

#[test]
fn bak_rotation_keeps_three_generations() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("snapshot.bin");

    for generation in 0..4 {
        std::fs::write(&path, format!("garbage {generation}")).unwrap();
        assert!(Snapshot::load(&path).unwrap().is_none());
    }

    assert!(path.with_extension("bak").exists());
    assert!(path.with_extension("bak.2").exists());
    assert!(path.with_extension("bak.3").exists());
    assert!(!path.with_extension("bak.4").exists());

    // Newest garbage ends up in .bak
    let newest = std::fs::read_to_string(path.with_extension("bak")).unwrap();
    assert_eq!(newest, "garbage 3");
}
