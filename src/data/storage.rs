//! Keyed, metadata-tagged storage for gyroscope runs.
//!
//! The persisted layout is deliberately simple: a container of named 1-D
//! sample arrays, each carrying scalar attributes (`rate`, `start`,
//! `scale_factor`, and for full acquisition sessions the provenance of the
//! bench). [`ArrayStore`] is that container; [`RunStore`] layers the run
//! model, write modes and locking on top of it.
//!
//! # Backends
//!
//! - [`MemoryStore`] - process-local, for tests and scratch analysis
//! - [`DirectoryStore`] - one file per key under a directory. Each write is
//!   staged in its own temporary file and moved into place, so an entry never
//!   exists without its attributes. Create-mode writes refuse to replace an
//!   existing file, which keeps the first writer of a key even across
//!   processes sharing the directory.
//!
//! # Example
//!
//! ```
//! use fog_daq::data::run::Run;
//! use fog_daq::data::storage::{RunStore, WriteMode, WriteOutcome};
//!
//! let store = RunStore::in_memory();
//! let run = Run::new(vec![0.1, 0.2, 0.3], 10.0)?.with_scale_factor(1.5e5);
//! assert_eq!(store.set("night1", &run, WriteMode::Create)?, WriteOutcome::Written);
//! assert_eq!(store.get("night1")?, run);
//! # Ok::<(), fog_daq::error::DaqError>(())
//! ```

use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use chrono::{TimeZone, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

use crate::acquisition::AcquisitionSession;
use crate::config::EnvironmentSettings;
use crate::data::run::Run;
use crate::error::{AppResult, DaqError};

/// Attribute names written alongside each sample array.
pub mod attr {
    /// Sample rate in Hz
    pub const RATE: &str = "rate";
    /// Acquisition start, integer nanoseconds since the Unix epoch
    pub const START: &str = "start";
    /// Scale factor in deg/hr per V
    pub const SCALE_FACTOR: &str = "scale_factor";
    /// Modulation frequency in Hz
    pub const MODULATION_FREQUENCY: &str = "modulation_frequency";
    /// Modulation amplitude in V
    pub const MODULATION_VOLTAGE: &str = "modulation_voltage";
    /// Modulation waveform name
    pub const MODULATION_WAVEFORM: &str = "modulation_waveform";
    /// Requested acquisition length in seconds
    pub const DURATION: &str = "duration";
    /// Lock-in full-scale sensitivity in V
    pub const SENSITIVITY: &str = "sensitivity";
    /// Lock-in time constant in seconds
    pub const TIME_CONSTANT: &str = "time_constant";
    /// Light source temperature in degrees C
    pub const SOURCE_TEMPERATURE: &str = "source_temperature";
    /// Light source drive current in mA
    pub const SOURCE_CURRENT: &str = "source_current";
}

/// A scalar attribute value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AttrValue {
    /// Real number
    Float(f64),
    /// Whole number, used for nanosecond timestamps
    Integer(i64),
    /// Free text
    Text(String),
    /// Explicitly recorded as absent (e.g. a run without a scale factor)
    Missing,
}

impl AttrValue {
    /// Numeric value, widening integers.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            AttrValue::Float(v) => Some(*v),
            AttrValue::Integer(v) => Some(*v as f64),
            _ => None,
        }
    }

    /// Text value, if this is one.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            AttrValue::Text(s) => Some(s),
            _ => None,
        }
    }
}

impl From<f64> for AttrValue {
    fn from(value: f64) -> Self {
        AttrValue::Float(value)
    }
}

impl From<Option<f64>> for AttrValue {
    fn from(value: Option<f64>) -> Self {
        value.map_or(AttrValue::Missing, AttrValue::Float)
    }
}

impl From<&str> for AttrValue {
    fn from(value: &str) -> Self {
        AttrValue::Text(value.to_string())
    }
}

/// Attributes keyed by name, see [`attr`].
pub type Attributes = BTreeMap<String, AttrValue>;

/// One named array with its attributes, as held by an [`ArrayStore`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredArray {
    /// Raw samples
    pub samples: Vec<f64>,
    /// Scalar metadata
    pub attributes: Attributes,
}

/// An opaque keyed container of attribute-tagged sample arrays.
///
/// Writes must replace the whole entry (samples and attributes) at once.
/// Backends shared outside the process must make [`create`](Self::create)
/// atomic against every other writer, not just this handle.
pub trait ArrayStore: Send + Sync {
    /// Store `entry` under `key`, replacing any existing entry.
    fn write(&mut self, key: &str, entry: &StoredArray) -> AppResult<()>;
    /// Store `entry` only if `key` is absent, returning whether it was stored.
    fn create(&mut self, key: &str, entry: &StoredArray) -> AppResult<bool>;
    /// The entry under `key`, if any.
    fn read(&self, key: &str) -> AppResult<Option<StoredArray>>;
    /// Remove `key`, returning whether it existed.
    fn remove(&mut self, key: &str) -> AppResult<bool>;
    /// All keys, sorted.
    fn keys(&self) -> AppResult<Vec<String>>;

    /// Whether `key` holds an entry.
    fn contains(&self, key: &str) -> AppResult<bool> {
        Ok(self.keys()?.iter().any(|k| k == key))
    }
}

// =============================================================================
// MemoryStore
// =============================================================================

/// In-process backend.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: BTreeMap<String, StoredArray>,
}

impl ArrayStore for MemoryStore {
    fn write(&mut self, key: &str, entry: &StoredArray) -> AppResult<()> {
        self.entries.insert(key.to_string(), entry.clone());
        Ok(())
    }

    fn create(&mut self, key: &str, entry: &StoredArray) -> AppResult<bool> {
        match self.entries.entry(key.to_string()) {
            Entry::Occupied(_) => Ok(false),
            Entry::Vacant(slot) => {
                slot.insert(entry.clone());
                Ok(true)
            }
        }
    }

    fn read(&self, key: &str) -> AppResult<Option<StoredArray>> {
        Ok(self.entries.get(key).cloned())
    }

    fn remove(&mut self, key: &str) -> AppResult<bool> {
        Ok(self.entries.remove(key).is_some())
    }

    fn keys(&self) -> AppResult<Vec<String>> {
        Ok(self.entries.keys().cloned().collect())
    }

    fn contains(&self, key: &str) -> AppResult<bool> {
        Ok(self.entries.contains_key(key))
    }
}

// =============================================================================
// DirectoryStore
// =============================================================================

const ENTRY_EXTENSION: &str = "fogrun";

/// On-disk backend: one bincode-encoded entry per file.
#[derive(Debug)]
pub struct DirectoryStore {
    root: PathBuf,
}

impl DirectoryStore {
    /// Open (creating if needed) a store rooted at `root`.
    pub fn open(root: impl AsRef<Path>) -> AppResult<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;
        debug!(path = %root.display(), "Opened run directory");
        Ok(Self { root })
    }

    /// Directory holding the entry files.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn entry_path(&self, key: &str) -> AppResult<PathBuf> {
        validate_key(key)?;
        Ok(self.root.join(format!("{}.{}", key, ENTRY_EXTENSION)))
    }

    /// Encode `entry` into a uniquely named file in the store directory.
    ///
    /// The staging name has no entry extension, so it never shows up in
    /// [`keys`](ArrayStore::keys), and is removed if it is never persisted.
    fn stage(&self, entry: &StoredArray) -> AppResult<NamedTempFile> {
        let bytes = bincode::serialize(entry)?;
        let mut staged = NamedTempFile::new_in(&self.root)?;
        staged.write_all(&bytes)?;
        staged.as_file().sync_all()?;
        Ok(staged)
    }
}

/// Keys become file names, so restrict them to a portable alphabet.
fn validate_key(key: &str) -> AppResult<()> {
    let valid = !key.is_empty()
        && !key.starts_with('.')
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'));
    if valid {
        Ok(())
    } else {
        Err(DaqError::Configuration(format!(
            "invalid run key '{}': use letters, digits, '_', '-' or '.'",
            key
        )))
    }
}

impl ArrayStore for DirectoryStore {
    fn write(&mut self, key: &str, entry: &StoredArray) -> AppResult<()> {
        let path = self.entry_path(key)?;
        self.stage(entry)?
            .persist(&path)
            .map_err(|err| DaqError::from(err.error))?;
        Ok(())
    }

    fn create(&mut self, key: &str, entry: &StoredArray) -> AppResult<bool> {
        let path = self.entry_path(key)?;
        match self.stage(entry)?.persist_noclobber(&path) {
            Ok(_) => Ok(true),
            Err(err) if err.error.kind() == ErrorKind::AlreadyExists => Ok(false),
            Err(err) => Err(err.error.into()),
        }
    }

    fn read(&self, key: &str) -> AppResult<Option<StoredArray>> {
        let path = self.entry_path(key)?;
        match fs::read(&path) {
            Ok(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    fn remove(&mut self, key: &str) -> AppResult<bool> {
        let path = self.entry_path(key)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    fn keys(&self) -> AppResult<Vec<String>> {
        let mut keys = Vec::new();
        for dir_entry in fs::read_dir(&self.root)? {
            let path = dir_entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(ENTRY_EXTENSION) {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                if !stem.starts_with('.') {
                    keys.push(stem.to_string());
                }
            }
        }
        keys.sort();
        Ok(keys)
    }

    fn contains(&self, key: &str) -> AppResult<bool> {
        // A key that cannot name a file cannot be stored either
        match self.entry_path(key) {
            Ok(path) => Ok(path.is_file()),
            Err(_) => Ok(false),
        }
    }
}

/// Sink for finished acquisition sessions.
pub trait SessionStore: Send + Sync {
    /// Persist `session` with its bench provenance under `key`.
    fn save_session(
        &self,
        key: &str,
        session: &AcquisitionSession,
        environment: &EnvironmentSettings,
        mode: WriteMode,
    ) -> AppResult<WriteOutcome>;
}

// =============================================================================
// RunStore
// =============================================================================

/// Behavior when the key being written already exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WriteMode {
    /// Keep the existing entry and skip the write
    #[default]
    Create,
    /// Replace the existing entry
    Overwrite,
}

impl WriteMode {
    /// Map a CLI/config `overwrite` flag to a mode.
    pub fn from_overwrite_flag(overwrite: bool) -> Self {
        if overwrite {
            WriteMode::Overwrite
        } else {
            WriteMode::Create
        }
    }
}

/// What a write actually did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// The key was new
    Written,
    /// An existing entry was replaced
    Overwritten,
    /// The key existed and the write was in [`WriteMode::Create`]
    Skipped,
}

/// Run-level view over an [`ArrayStore`].
///
/// Reads share the lock and writes are serialized within one handle. In
/// create mode the first writer of a key wins, including writers holding
/// other handles on the same directory. In overwrite mode the last one does.
pub struct RunStore<S: ArrayStore> {
    backend: RwLock<S>,
}

impl RunStore<MemoryStore> {
    /// An empty process-local store.
    pub fn in_memory() -> Self {
        Self::new(MemoryStore::default())
    }
}

impl RunStore<DirectoryStore> {
    /// Open (creating if needed) a run directory.
    pub fn open(root: impl AsRef<Path>) -> AppResult<Self> {
        Ok(Self::new(DirectoryStore::open(root)?))
    }
}

impl<S: ArrayStore> RunStore<S> {
    /// Wrap an existing backend.
    pub fn new(backend: S) -> Self {
        Self {
            backend: RwLock::new(backend),
        }
    }

    /// Store `run` under `key`.
    ///
    /// In [`WriteMode::Create`] an existing key is left untouched: the
    /// conflict is logged and reported as [`WriteOutcome::Skipped`] rather
    /// than raised.
    pub fn set(&self, key: &str, run: &Run, mode: WriteMode) -> AppResult<WriteOutcome> {
        self.write_entry(key, &run_entry(run), mode)
    }

    /// Store `run` under a key that must not exist yet.
    pub fn try_insert(&self, key: &str, run: &Run) -> AppResult<()> {
        match self.set(key, run, WriteMode::Create)? {
            WriteOutcome::Skipped => Err(DaqError::StorageKeyConflict(key.to_string())),
            _ => Ok(()),
        }
    }

    /// Store a raw entry after checking it describes a run.
    ///
    /// # Errors
    ///
    /// [`DaqError::StorageType`] when the attributes cannot be read back as a
    /// run (missing or non-numeric `rate`, malformed `start` or
    /// `scale_factor`).
    pub fn set_entry(&self, key: &str, entry: StoredArray, mode: WriteMode) -> AppResult<WriteOutcome> {
        run_from_entry(key, &entry)?;
        self.write_entry(key, &entry, mode)
    }

    fn write_entry(&self, key: &str, entry: &StoredArray, mode: WriteMode) -> AppResult<WriteOutcome> {
        let mut backend = self.backend.write();
        if mode == WriteMode::Create {
            if !backend.create(key, entry)? {
                warn!(key, "{}; not overwriting", DaqError::StorageKeyConflict(key.to_string()));
                return Ok(WriteOutcome::Skipped);
            }
            info!(key, samples = entry.samples.len(), "Stored run");
            return Ok(WriteOutcome::Written);
        }
        let exists = backend.contains(key)?;
        backend.write(key, entry)?;
        if exists {
            info!(key, samples = entry.samples.len(), "Overwrote run");
            Ok(WriteOutcome::Overwritten)
        } else {
            info!(key, samples = entry.samples.len(), "Stored run");
            Ok(WriteOutcome::Written)
        }
    }

    /// The run stored under `key`.
    ///
    /// # Errors
    ///
    /// [`DaqError::StorageNotFound`] for an unknown key and
    /// [`DaqError::StorageType`] for an entry that is not a run.
    pub fn get(&self, key: &str) -> AppResult<Run> {
        let entry = self.read_entry(key)?;
        run_from_entry(key, &entry)
    }

    /// All attributes recorded for `key`.
    pub fn attributes(&self, key: &str) -> AppResult<Attributes> {
        Ok(self.read_entry(key)?.attributes)
    }

    fn read_entry(&self, key: &str) -> AppResult<StoredArray> {
        self.backend
            .read()
            .read(key)?
            .ok_or_else(|| DaqError::StorageNotFound(key.to_string()))
    }

    /// Remove `key`, failing with [`DaqError::StorageNotFound`] if absent.
    pub fn delete(&self, key: &str) -> AppResult<()> {
        if self.backend.write().remove(key)? {
            info!(key, "Deleted run");
            Ok(())
        } else {
            Err(DaqError::StorageNotFound(key.to_string()))
        }
    }

    /// Delete every entry, returning how many were removed.
    pub fn clear(&self) -> AppResult<usize> {
        let mut backend = self.backend.write();
        let keys = backend.keys()?;
        for key in &keys {
            backend.remove(key)?;
        }
        Ok(keys.len())
    }

    /// All keys, sorted.
    pub fn keys(&self) -> AppResult<Vec<String>> {
        self.backend.read().keys()
    }

    /// All runs, in key order.
    pub fn values(&self) -> AppResult<Vec<Run>> {
        Ok(self.items()?.into_iter().map(|(_, run)| run).collect())
    }

    /// All `(key, run)` pairs, in key order.
    pub fn items(&self) -> AppResult<Vec<(String, Run)>> {
        let backend = self.backend.read();
        backend
            .keys()?
            .into_iter()
            .filter_map(|key| match backend.read(&key) {
                // Removed between listing and reading
                Ok(None) => None,
                Ok(Some(entry)) => Some(run_from_entry(&key, &entry).map(|run| (key, run))),
                Err(err) => Some(Err(err)),
            })
            .collect()
    }

    /// Whether `key` holds a run. Keys the backend cannot store are absent.
    pub fn contains(&self, key: &str) -> AppResult<bool> {
        self.backend.read().contains(key)
    }

    /// Number of stored runs.
    pub fn len(&self) -> AppResult<usize> {
        Ok(self.keys()?.len())
    }

    /// Whether the store holds no runs.
    pub fn is_empty(&self) -> AppResult<bool> {
        Ok(self.len()? == 0)
    }
}

impl<S: ArrayStore> SessionStore for RunStore<S> {
    /// Persist a full acquisition session with its provenance attributes.
    fn save_session(
        &self,
        key: &str,
        session: &AcquisitionSession,
        environment: &EnvironmentSettings,
        mode: WriteMode,
    ) -> AppResult<WriteOutcome> {
        self.write_entry(key, &session_entry(session, environment)?, mode)
    }
}

fn start_attr(run: &Run) -> AttrValue {
    run.start()
        .and_then(|start| start.timestamp_nanos_opt())
        .map_or(AttrValue::Missing, AttrValue::Integer)
}

fn run_entry(run: &Run) -> StoredArray {
    let mut attributes = Attributes::new();
    attributes.insert(attr::RATE.into(), run.rate().into());
    attributes.insert(attr::START.into(), start_attr(run));
    attributes.insert(attr::SCALE_FACTOR.into(), run.scale_factor().into());
    StoredArray {
        samples: run.samples().to_vec(),
        attributes,
    }
}

fn session_entry(
    session: &AcquisitionSession,
    environment: &EnvironmentSettings,
) -> AppResult<StoredArray> {
    let mut entry = run_entry(&session.to_run()?);
    let modulation = session.modulation();
    let attributes = &mut entry.attributes;
    attributes.insert(attr::MODULATION_FREQUENCY.into(), modulation.frequency.into());
    attributes.insert(attr::MODULATION_VOLTAGE.into(), modulation.voltage.into());
    attributes.insert(attr::MODULATION_WAVEFORM.into(), modulation.waveform.as_str().into());
    attributes.insert(attr::DURATION.into(), session.duration().into());
    attributes.insert(attr::SENSITIVITY.into(), session.sensitivity().into());
    attributes.insert(attr::TIME_CONSTANT.into(), session.time_constant().into());
    attributes.insert(
        attr::SOURCE_TEMPERATURE.into(),
        environment.source_temperature_c.into(),
    );
    attributes.insert(attr::SOURCE_CURRENT.into(), environment.source_current_ma.into());
    Ok(entry)
}

fn run_from_entry(key: &str, entry: &StoredArray) -> AppResult<Run> {
    let type_error = |what: &str| DaqError::StorageType(format!("entry '{}': {}", key, what));

    let rate = entry
        .attributes
        .get(attr::RATE)
        .and_then(AttrValue::as_f64)
        .ok_or_else(|| type_error("missing numeric 'rate' attribute"))?;
    let mut run = Run::new(entry.samples.clone(), rate)
        .map_err(|err| type_error(&err.to_string()))?;

    match entry.attributes.get(attr::START) {
        None | Some(AttrValue::Missing) => {}
        Some(AttrValue::Integer(nanos)) => run = run.with_start(Utc.timestamp_nanos(*nanos)),
        Some(_) => return Err(type_error("'start' must be integer nanoseconds")),
    }

    match entry.attributes.get(attr::SCALE_FACTOR) {
        None | Some(AttrValue::Missing) => {}
        Some(value) => {
            let scale = value
                .as_f64()
                .ok_or_else(|| type_error("'scale_factor' must be numeric"))?;
            run = run.with_scale_factor(scale);
        }
    }

    Ok(run)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::run::{adev, drift, noise};
    use chrono::TimeZone;
    use std::sync::Arc;

    fn sample_run(offset: f64) -> Run {
        let samples = (0..1_000)
            .map(|i| offset + ((i * 131) % 97) as f64 * 1e-5)
            .collect();
        Run::new(samples, 100.0)
            .unwrap()
            .with_start(Utc.timestamp_nanos(1_700_000_000_123_456_789))
            .with_scale_factor(180_000.0)
    }

    #[test]
    fn round_trip_preserves_run_and_statistics() {
        let dir = tempfile::tempdir().unwrap();
        let store = RunStore::open(dir.path()).unwrap();
        let run = sample_run(0.0);
        store.set("run1", &run, WriteMode::Create).unwrap();

        let back = store.get("run1").unwrap();
        assert_eq!(back, run);
        assert_eq!(adev(&back), adev(&run));
        assert_eq!(noise(&back), noise(&run));
        assert_eq!(drift(&back), drift(&run));
    }

    #[test]
    fn create_mode_keeps_first_write() {
        let store = RunStore::in_memory();
        let run = sample_run(0.0);
        let run2 = sample_run(1.0);
        assert_eq!(store.set("run1", &run, WriteMode::Create).unwrap(), WriteOutcome::Written);
        assert_eq!(store.set("run1", &run2, WriteMode::Create).unwrap(), WriteOutcome::Skipped);
        assert_eq!(store.get("run1").unwrap(), run);

        assert!(matches!(
            store.try_insert("run1", &run2),
            Err(DaqError::StorageKeyConflict(k)) if k == "run1"
        ));
    }

    #[test]
    fn overwrite_mode_replaces() {
        let store = RunStore::in_memory();
        store.set("run1", &sample_run(0.0), WriteMode::Create).unwrap();
        let outcome = store
            .set("run1", &sample_run(1.0), WriteMode::Overwrite)
            .unwrap();
        assert_eq!(outcome, WriteOutcome::Overwritten);
        assert_eq!(store.get("run1").unwrap(), sample_run(1.0));
    }

    #[test]
    fn missing_key_is_not_found() {
        let store = RunStore::in_memory();
        assert!(matches!(store.get("nope"), Err(DaqError::StorageNotFound(_))));
        assert!(matches!(store.delete("nope"), Err(DaqError::StorageNotFound(_))));
    }

    #[test]
    fn run_without_optional_metadata() {
        let store = RunStore::in_memory();
        let run = Run::new(vec![1.0, 2.0, 3.0], 2.5).unwrap();
        store.set("bare", &run, WriteMode::Create).unwrap();
        let back = store.get("bare").unwrap();
        assert_eq!(back.start(), None);
        assert_eq!(back.scale_factor(), None);
        assert_eq!(back, run);
    }

    #[test]
    fn set_entry_rejects_non_run_shapes() {
        let store = RunStore::in_memory();
        let no_rate = StoredArray {
            samples: vec![1.0],
            attributes: Attributes::new(),
        };
        assert!(matches!(
            store.set_entry("x", no_rate, WriteMode::Create),
            Err(DaqError::StorageType(_))
        ));

        let mut attributes = Attributes::new();
        attributes.insert(attr::RATE.into(), AttrValue::Float(10.0));
        attributes.insert(attr::SCALE_FACTOR.into(), AttrValue::Text("big".into()));
        let bad_scale = StoredArray {
            samples: vec![1.0],
            attributes,
        };
        assert!(store.set_entry("x", bad_scale, WriteMode::Create).is_err());
        assert!(!store.contains("x").unwrap());
    }

    #[test]
    fn key_listing_and_clear() {
        let dir = tempfile::tempdir().unwrap();
        let store = RunStore::open(dir.path()).unwrap();
        for key in ["b", "a", "c"] {
            store.set(key, &sample_run(0.0), WriteMode::Create).unwrap();
        }
        assert_eq!(store.keys().unwrap(), vec!["a", "b", "c"]);
        assert_eq!(store.len().unwrap(), 3);
        assert!(store.contains("b").unwrap());
        assert_eq!(store.items().unwrap()[0].0, "a");
        assert_eq!(store.values().unwrap().len(), 3);

        store.delete("b").unwrap();
        assert!(!store.contains("b").unwrap());
        assert_eq!(store.clear().unwrap(), 2);
        assert!(store.is_empty().unwrap());
    }

    #[test]
    fn directory_store_rejects_path_like_keys() {
        let dir = tempfile::tempdir().unwrap();
        let store = RunStore::open(dir.path()).unwrap();
        let run = sample_run(0.0);
        assert!(store.set("../escape", &run, WriteMode::Create).is_err());
        assert!(store.set("", &run, WriteMode::Create).is_err());
        assert!(store.set(".hidden", &run, WriteMode::Create).is_err());
    }

    #[test]
    fn unstorable_keys_are_absent() {
        let dir = tempfile::tempdir().unwrap();
        let store = RunStore::open(dir.path()).unwrap();
        assert!(!store.contains("../escape").unwrap());
        assert!(!store.contains("").unwrap());
        assert!(!RunStore::in_memory().contains("../escape").unwrap());
    }

    #[test]
    fn separate_handles_keep_first_write() {
        let dir = tempfile::tempdir().unwrap();
        let first = RunStore::open(dir.path()).unwrap();
        let second = RunStore::open(dir.path()).unwrap();

        assert_eq!(
            first.set("run1", &sample_run(0.0), WriteMode::Create).unwrap(),
            WriteOutcome::Written
        );
        assert_eq!(
            second.set("run1", &sample_run(1.0), WriteMode::Create).unwrap(),
            WriteOutcome::Skipped
        );
        assert_eq!(second.get("run1").unwrap(), sample_run(0.0));
        assert_eq!(
            second.set("run1", &sample_run(1.0), WriteMode::Overwrite).unwrap(),
            WriteOutcome::Overwritten
        );
        assert_eq!(first.get("run1").unwrap(), sample_run(1.0));
    }

    #[test]
    fn racing_handles_have_one_winner() {
        let dir = tempfile::tempdir().unwrap();
        for round in 0..50 {
            let key = format!("race{}", round);
            let handles: Vec<_> = (0..2)
                .map(|i| {
                    let root = dir.path().to_path_buf();
                    let key = key.clone();
                    std::thread::spawn(move || {
                        let store = RunStore::open(&root).unwrap();
                        store
                            .set(&key, &sample_run(i as f64), WriteMode::Create)
                            .unwrap()
                    })
                })
                .collect();
            let outcomes: Vec<WriteOutcome> =
                handles.into_iter().map(|h| h.join().unwrap()).collect();
            let written = outcomes.iter().filter(|o| **o == WriteOutcome::Written).count();
            assert_eq!(written, 1, "round {}: {:?}", round, outcomes);

            let store = RunStore::open(dir.path()).unwrap();
            let winner = store.get(&key).unwrap();
            assert!(winner == sample_run(0.0) || winner == sample_run(1.0));
        }

        // Staging files are cleaned up and never listed
        let store = RunStore::open(dir.path()).unwrap();
        assert_eq!(store.len().unwrap(), 50);
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 50);
    }

    #[test]
    fn entries_survive_reopening() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = RunStore::open(dir.path()).unwrap();
            store.set("persisted", &sample_run(0.5), WriteMode::Create).unwrap();
        }
        let reopened = RunStore::open(dir.path()).unwrap();
        assert_eq!(reopened.get("persisted").unwrap(), sample_run(0.5));
    }

    #[test]
    fn concurrent_creates_have_one_winner() {
        let store = Arc::new(RunStore::in_memory());
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let store = store.clone();
                std::thread::spawn(move || {
                    store
                        .set("shared", &sample_run(i as f64), WriteMode::Create)
                        .unwrap()
                })
            })
            .collect();
        let outcomes: Vec<WriteOutcome> =
            handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(
            outcomes.iter().filter(|o| **o == WriteOutcome::Written).count(),
            1
        );
        assert_eq!(
            outcomes.iter().filter(|o| **o == WriteOutcome::Skipped).count(),
            7
        );
    }
}
