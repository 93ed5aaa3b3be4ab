//! Persistence repositories for the three independently evolving tables.
//!
//! The engine writes to three narrow interfaces, none transactionally
//! coupled to the others; each table has its own conservative fallback when
//! stale or missing (uncalibrated stratum, `λ·I` model, zero FNR history).
//!
//! Calibration is stored as an append-only outcome log plus periodic pool
//! checkpoints. A checkpoint remembers how many log records it covers, so a
//! restore loads the checkpoint and replays only the log tail after it.
//!
//! Two implementations ship here:
//! - `Memory*` stores for tests and ephemeral deployments;
//! - `Json*` stores writing one JSON document per record under a state
//!   directory:
//!
//! ```text
//! <state>/model.json                     latest BanditModel snapshot
//! <state>/calibration/<hex(stratum)>.json
//! <state>/fnr/<hex(stratum)>.json
//! <state>/conformity.jsonl               append-only ConformityRecord log
//! ```

use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use serde::de::DeserializeOwned;

use crate::conformal::ConformityRecord;
use crate::error::Result;

// ---------------------------------------------------------------------------
// Record layouts
// ---------------------------------------------------------------------------

/// Persisted bandit state. Vectors are variable-length on the wire and are
/// dimension-checked by [`crate::bandit::BanditModel::from_snapshot`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelSnapshot {
    pub theta: Vec<f64>,
    pub phi: Vec<f64>,
    #[serde(rename = "A")]
    pub a: Vec<Vec<f64>>,
    #[serde(rename = "B")]
    pub b: Vec<Vec<f64>>,
    pub beta: f64,
    pub gamma: f64,
    pub lambda: f64,
    pub observation_count: u64,
    pub version: u64,
    /// Unix epoch milliseconds.
    pub updated_at: u64,
}

/// Persisted conformity pool for one stratum.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CalibrationRecord {
    pub stratum: String,
    pub conformity_scores: Vec<f64>,
    pub sample_count: usize,
    /// Length of the outcome log when this checkpoint was taken.
    #[serde(default)]
    pub log_offset: u64,
}

/// Persisted FNR counters for one stratum.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FnrRecord {
    pub stratum: String,
    pub total_automated: u64,
    pub false_negatives: u64,
}

// ---------------------------------------------------------------------------
// Interfaces
// ---------------------------------------------------------------------------

pub trait CalibrationStore: Send + Sync {
    /// Append one labelled outcome to the audit log.
    fn append(&self, record: &ConformityRecord) -> Result<()>;

    /// Replace the stored pool checkpoint for `record.stratum`.
    fn save(&self, record: &CalibrationRecord) -> Result<()>;

    fn load_all(&self) -> Result<Vec<CalibrationRecord>>;

    /// Every appended record, oldest first.
    fn load_log(&self) -> Result<Vec<ConformityRecord>>;
}

pub trait ModelStore: Send + Sync {
    /// Replace the stored snapshot.
    fn save(&self, snapshot: &ModelSnapshot) -> Result<()>;

    fn load_latest(&self) -> Result<Option<ModelSnapshot>>;
}

pub trait FnrStore: Send + Sync {
    /// Replace the stored counters for `record.stratum`.
    fn save(&self, record: &FnrRecord) -> Result<()>;

    fn load_all(&self) -> Result<Vec<FnrRecord>>;
}

/// The three repositories an engine writes to.
#[derive(Clone)]
pub struct EngineStores {
    pub calibration: Arc<dyn CalibrationStore>,
    pub model: Arc<dyn ModelStore>,
    pub fnr: Arc<dyn FnrStore>,
}

impl EngineStores {
    pub fn memory() -> Self {
        Self {
            calibration: Arc::new(MemoryCalibrationStore::default()),
            model: Arc::new(MemoryModelStore::default()),
            fnr: Arc::new(MemoryFnrStore::default()),
        }
    }

    /// JSON stores rooted at `dir`, created if absent.
    pub fn json_dir(dir: &Path) -> Result<Self> {
        Ok(Self {
            calibration: Arc::new(JsonCalibrationStore::open(dir)?),
            model: Arc::new(JsonModelStore::open(dir)?),
            fnr: Arc::new(JsonFnrStore::open(dir)?),
        })
    }
}

// ---------------------------------------------------------------------------
// In-memory
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct MemoryCalibrationStore {
    pools: Mutex<HashMap<String, CalibrationRecord>>,
    log: Mutex<Vec<ConformityRecord>>,
}

impl MemoryCalibrationStore {
    pub fn appended(&self) -> Vec<ConformityRecord> {
        self.log.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

impl CalibrationStore for MemoryCalibrationStore {
    fn append(&self, record: &ConformityRecord) -> Result<()> {
        self.log
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(record.clone());
        Ok(())
    }

    fn save(&self, record: &CalibrationRecord) -> Result<()> {
        self.pools
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(record.stratum.clone(), record.clone());
        Ok(())
    }

    fn load_all(&self) -> Result<Vec<CalibrationRecord>> {
        let pools = self.pools.lock().unwrap_or_else(PoisonError::into_inner);
        let mut out: Vec<_> = pools.values().cloned().collect();
        out.sort_by(|a, b| a.stratum.cmp(&b.stratum));
        Ok(out)
    }

    fn load_log(&self) -> Result<Vec<ConformityRecord>> {
        Ok(self.appended())
    }
}

#[derive(Default)]
pub struct MemoryModelStore {
    latest: Mutex<Option<ModelSnapshot>>,
}

impl ModelStore for MemoryModelStore {
    fn save(&self, snapshot: &ModelSnapshot) -> Result<()> {
        *self.latest.lock().unwrap_or_else(PoisonError::into_inner) = Some(snapshot.clone());
        Ok(())
    }

    fn load_latest(&self) -> Result<Option<ModelSnapshot>> {
        Ok(self
            .latest
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone())
    }
}

#[derive(Default)]
pub struct MemoryFnrStore {
    strata: Mutex<HashMap<String, FnrRecord>>,
}

impl FnrStore for MemoryFnrStore {
    fn save(&self, record: &FnrRecord) -> Result<()> {
        self.strata
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(record.stratum.clone(), record.clone());
        Ok(())
    }

    fn load_all(&self) -> Result<Vec<FnrRecord>> {
        let strata = self.strata.lock().unwrap_or_else(PoisonError::into_inner);
        let mut out: Vec<_> = strata.values().cloned().collect();
        out.sort_by(|a, b| a.stratum.cmp(&b.stratum));
        Ok(out)
    }
}

// ---------------------------------------------------------------------------
// JSON files
// ---------------------------------------------------------------------------

/// Hex-encode a stratum key into a filesystem-safe file stem.
fn hex_encode(bytes: &[u8]) -> String {
    use std::fmt::Write;
    let mut s = String::with_capacity(bytes.len() * 2);
    for &b in bytes {
        let _ = write!(s, "{b:02x}");
    }
    s
}

/// Write via a temporary sibling and rename, so readers never see a torn file.
fn write_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value)?;
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, json)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let json = fs::read_to_string(path)?;
    Ok(serde_json::from_str(&json)?)
}

fn read_dir_records<T: DeserializeOwned>(dir: &Path) -> Result<Vec<T>> {
    let mut paths: Vec<PathBuf> = fs::read_dir(dir)?
        .filter_map(|e| e.ok().map(|e| e.path()))
        .filter(|p| p.extension().is_some_and(|ext| ext == "json"))
        .collect();
    paths.sort();
    paths.iter().map(|p| read_json(p)).collect()
}

pub struct JsonCalibrationStore {
    dir: PathBuf,
    log_path: PathBuf,
    log_lock: Mutex<()>,
}

impl JsonCalibrationStore {
    pub fn open(root: &Path) -> Result<Self> {
        let dir = root.join("calibration");
        fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            log_path: root.join("conformity.jsonl"),
            log_lock: Mutex::new(()),
        })
    }

    fn path_for(&self, stratum: &str) -> PathBuf {
        self.dir.join(format!("{}.json", hex_encode(stratum.as_bytes())))
    }
}

impl CalibrationStore for JsonCalibrationStore {
    fn append(&self, record: &ConformityRecord) -> Result<()> {
        let line = serde_json::to_string(record)?;
        let _guard = self.log_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut f = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_path)?;
        writeln!(f, "{line}")?;
        Ok(())
    }

    fn save(&self, record: &CalibrationRecord) -> Result<()> {
        write_atomic(&self.path_for(&record.stratum), record)
    }

    fn load_all(&self) -> Result<Vec<CalibrationRecord>> {
        read_dir_records(&self.dir)
    }

    /// Malformed lines (e.g. a torn final write) are skipped with a warning.
    fn load_log(&self) -> Result<Vec<ConformityRecord>> {
        let _guard = self.log_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let text = match fs::read_to_string(&self.log_path) {
            Ok(t) => t,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut records = Vec::new();
        for (i, line) in text.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str(line) {
                Ok(r) => records.push(r),
                Err(e) => log::warn!(
                    "{}:{}: skipping malformed record: {e}",
                    self.log_path.display(),
                    i + 1
                ),
            }
        }
        Ok(records)
    }
}

pub struct JsonModelStore {
    path: PathBuf,
}

impl JsonModelStore {
    pub fn open(root: &Path) -> Result<Self> {
        fs::create_dir_all(root)?;
        Ok(Self {
            path: root.join("model.json"),
        })
    }
}

impl ModelStore for JsonModelStore {
    fn save(&self, snapshot: &ModelSnapshot) -> Result<()> {
        write_atomic(&self.path, snapshot)
    }

    fn load_latest(&self) -> Result<Option<ModelSnapshot>> {
        if !self.path.exists() {
            return Ok(None);
        }
        read_json(&self.path).map(Some)
    }
}

pub struct JsonFnrStore {
    dir: PathBuf,
}

impl JsonFnrStore {
    pub fn open(root: &Path) -> Result<Self> {
        let dir = root.join("fnr");
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }
}

impl FnrStore for JsonFnrStore {
    fn save(&self, record: &FnrRecord) -> Result<()> {
        let path = self
            .dir
            .join(format!("{}.json", hex_encode(record.stratum.as_bytes())));
        write_atomic(&path, record)
    }

    fn load_all(&self) -> Result<Vec<FnrRecord>> {
        read_dir_records(&self.dir)
    }
}
