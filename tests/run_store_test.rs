//! Run store behavior over the on-disk backend.

use chrono::{TimeZone, Utc};
use fog_daq::data::run::{adev, drift, noise, Run};
use fog_daq::data::storage::{
    attr, AttrValue, Attributes, DirectoryStore, RunStore, StoredArray, WriteMode, WriteOutcome,
};
use fog_daq::error::DaqError;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

fn white_noise(n: usize, seed: u64) -> Vec<f64> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..n).map(|_| rng.gen_range(-1.0..1.0)).collect()
}

fn open(dir: &tempfile::TempDir) -> RunStore<DirectoryStore> {
    RunStore::open(dir.path()).expect("Failed to open store")
}

#[test]
fn test_first_write_wins_without_overwrite() {
    let dir = tempfile::tempdir().expect("Failed to create temp dir");
    let store = open(&dir);
    let run = Run::new(white_noise(900, 1), 1.0).expect("valid run");
    let run2 = Run::new(white_noise(900, 2), 1.0).expect("valid run");

    assert_eq!(
        store.set("run1", &run, WriteMode::Create).expect("write failed"),
        WriteOutcome::Written
    );
    assert_eq!(
        store.set("run1", &run2, WriteMode::Create).expect("write failed"),
        WriteOutcome::Skipped
    );
    assert_eq!(store.get("run1").expect("read failed"), run);
}

#[test]
fn test_rotation_series_statistics_survive_storage() {
    let dir = tempfile::tempdir().expect("Failed to create temp dir");
    let store = open(&dir);
    let start = Utc.with_ymd_and_hms(2024, 5, 17, 22, 30, 0).unwrap();
    let run = Run::new(white_noise(9_000, 3), 10.0)
        .expect("valid run")
        .with_start(start);
    store.set("rate_only", &run, WriteMode::Create).expect("write failed");

    let back = store.get("rate_only").expect("read failed");
    assert_eq!(back.scale_factor(), None);
    assert_eq!(back.start(), Some(start));
    assert_eq!(adev(&back), adev(&run));
    assert_eq!(noise(&back), noise(&run));
    assert_eq!(drift(&back), drift(&run));

    // Longest window spans at most a ninth of the run
    let curve = adev(&back);
    let last = curve.points().last().expect("empty curve");
    assert!(last.tau <= 9_000.0 / 9.0 / 10.0 + 1e-9);

    let attributes = store.attributes("rate_only").expect("attributes");
    assert_eq!(attributes.get(attr::SCALE_FACTOR), Some(&AttrValue::Missing));
    assert_eq!(attributes.get(attr::RATE), Some(&AttrValue::Float(10.0)));
}

#[test]
fn test_raw_entries_must_describe_runs() {
    let dir = tempfile::tempdir().expect("Failed to create temp dir");
    let store = open(&dir);

    let mut attributes = Attributes::new();
    attributes.insert(attr::RATE.into(), AttrValue::Text("fast".into()));
    let entry = StoredArray {
        samples: vec![0.0; 10],
        attributes,
    };
    let err = store
        .set_entry("bad", entry, WriteMode::Create)
        .expect_err("non-numeric rate must be rejected");
    assert!(matches!(err, DaqError::StorageType(_)));
    assert!(store.is_empty().expect("listing failed"));

    let mut attributes = Attributes::new();
    attributes.insert(attr::RATE.into(), AttrValue::Integer(4));
    attributes.insert(attr::START.into(), AttrValue::Missing);
    let entry = StoredArray {
        samples: vec![1.0, 2.0],
        attributes,
    };
    store
        .set_entry("good", entry, WriteMode::Create)
        .expect("valid entry rejected");
    assert_eq!(store.get("good").expect("read failed").rate(), 4.0);
}

#[test]
fn test_delete_and_clear() {
    let dir = tempfile::tempdir().expect("Failed to create temp dir");
    let store = open(&dir);
    let run = Run::new(vec![1.0, 2.0, 3.0], 1.0).expect("valid run");
    for key in ["a", "b", "c"] {
        store.set(key, &run, WriteMode::Create).expect("write failed");
    }

    store.delete("b").expect("delete failed");
    assert!(matches!(store.get("b"), Err(DaqError::StorageNotFound(_))));
    assert_eq!(store.keys().expect("keys"), vec!["a", "c"]);

    assert_eq!(store.clear().expect("clear failed"), 2);
    assert!(store.keys().expect("keys").is_empty());
    assert!(open(&dir).is_empty().expect("listing failed"));
}
