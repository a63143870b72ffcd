//! Persisted ops ledger
//!
//! Credited keys and the totals they produced are written together to one
//! JSON file, atomically (write `.json.tmp`, then rename). The key history
//! is bounded: cycle ids only grow, so keys older than the retained window
//! cannot come back.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::ops::{DedupStore, OpsState};

/// Current ledger file format version
const STATE_VERSION: u32 = 1;

/// Default number of credited keys kept
pub const DEFAULT_KEY_HISTORY: usize = 4096;

/// On-disk layout
#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SavedLedger {
    /// Format version for future migration
    pub version: u32,
    /// ISO 8601 timestamp when the file was written
    pub saved_at: String,
    /// Credited keys, oldest first
    pub keys: Vec<String>,
    pub state: OpsState,
}

/// Save the ledger atomically (write to .tmp, then rename)
pub fn save_ledger(path: &Path, ledger: &SavedLedger) -> Result<()> {
    let json = serde_json::to_string_pretty(ledger)?;
    let tmp_path = path.with_extension("json.tmp");
    std::fs::write(&tmp_path, &json).with_context(|| format!("Failed to write {}", tmp_path.display()))?;
    std::fs::rename(&tmp_path, path).with_context(|| format!("Failed to replace {}", path.display()))?;
    debug!("Ops ledger saved to {}", path.display());
    Ok(())
}

/// Load the ledger. `Ok(None)` if the file does not exist.
///
/// A file that exists but cannot be parsed is an error: silently starting
/// over would credit past cycles again.
pub fn load_ledger(path: &Path) -> Result<Option<SavedLedger>> {
    if !path.exists() {
        return Ok(None);
    }
    let data = std::fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))?;
    let ledger: SavedLedger =
        serde_json::from_str(&data).with_context(|| format!("Failed to parse {}", path.display()))?;
    if ledger.version != STATE_VERSION {
        bail!(
            "Ops ledger {} has version {}, expected {}",
            path.display(),
            ledger.version,
            STATE_VERSION
        );
    }
    info!(
        "Loaded ops ledger from {} (saved at {}, {} keys, {} airdrops)",
        path.display(),
        ledger.saved_at,
        ledger.keys.len(),
        ledger.state.totals.airdrops
    );
    Ok(Some(ledger))
}

/// Bounded, ordered set of credited keys
#[derive(Debug, Default, Clone)]
struct KeyHistory {
    order: VecDeque<String>,
    set: HashSet<String>,
    max: usize,
}

impl KeyHistory {
    fn new(keys: Vec<String>, max: usize) -> Self {
        let mut history = Self {
            max: max.max(1),
            ..Default::default()
        };
        for key in keys {
            history.insert(key);
        }
        history
    }

    fn contains(&self, key: &str) -> bool {
        self.set.contains(key)
    }

    fn insert(&mut self, key: String) {
        if !self.set.insert(key.clone()) {
            return;
        }
        self.order.push_back(key);
        while self.order.len() > self.max {
            if let Some(oldest) = self.order.pop_front() {
                self.set.remove(&oldest);
            }
        }
    }

    fn to_vec(&self) -> Vec<String> {
        self.order.iter().cloned().collect()
    }
}

/// `DedupStore` persisted to a JSON file
pub struct FileDedupStore {
    path: PathBuf,
    keys: KeyHistory,
    state: OpsState,
}

impl FileDedupStore {
    pub fn open(path: impl Into<PathBuf>, max_keys: usize) -> Result<Self> {
        let path = path.into();
        let (keys, state) = match load_ledger(&path)? {
            Some(saved) => (saved.keys, saved.state),
            None => {
                info!("No ops ledger at {}, starting empty", path.display());
                (Vec::new(), OpsState::default())
            }
        };
        Ok(Self {
            path,
            keys: KeyHistory::new(keys, max_keys),
            state,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write(&self, keys: &KeyHistory, state: &OpsState) -> Result<()> {
        let ledger = SavedLedger {
            version: STATE_VERSION,
            saved_at: chrono::Utc::now().to_rfc3339(),
            keys: keys.to_vec(),
            state: state.clone(),
        };
        save_ledger(&self.path, &ledger)
    }
}

impl DedupStore for FileDedupStore {
    fn contains(&self, key: &str) -> bool {
        self.keys.contains(key)
    }

    fn commit(&mut self, key: &str, state: &OpsState) -> Result<()> {
        let mut keys = self.keys.clone();
        keys.insert(key.to_string());
        // memory follows disk, never leads it
        self.write(&keys, state)?;
        self.keys = keys;
        self.state = state.clone();
        Ok(())
    }

    fn save(&mut self, state: &OpsState) -> Result<()> {
        self.write(&self.keys, state)?;
        self.state = state.clone();
        Ok(())
    }

    fn load(&self) -> OpsState {
        self.state.clone()
    }
}

/// Non-persistent `DedupStore`
#[derive(Debug, Default)]
pub struct MemoryDedupStore {
    keys: HashSet<String>,
    state: OpsState,
}

impl DedupStore for MemoryDedupStore {
    fn contains(&self, key: &str) -> bool {
        self.keys.contains(key)
    }

    fn commit(&mut self, key: &str, state: &OpsState) -> Result<()> {
        self.keys.insert(key.to_string());
        self.state = state.clone();
        Ok(())
    }

    fn save(&mut self, state: &OpsState) -> Result<()> {
        self.state = state.clone();
        Ok(())
    }

    fn load(&self) -> OpsState {
        self.state.clone()
    }
}
