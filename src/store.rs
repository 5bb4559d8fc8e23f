//! Durable key-value storage for agenda state.
//!
//! One JSON file per key under the data directory. Everything is loaded
//! once at startup and rewritten whole on every change (temp file + rename).
//! Records that fail to parse are moved to `quarantine.jsonl` instead of
//! being carried into the live state.

use std::collections::HashSet;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::Local;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::model::{Task, ThemeColor, Transaction};

pub const TASKS_KEY: &str = "tasks";
pub const TRANSACTIONS_KEY: &str = "transactions";
pub const NOTIFIED_KEY: &str = "notified";
pub const THEME_KEY: &str = "theme";

const QUARANTINE_FILE: &str = "quarantine.jsonl";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Everything the store holds, as read at startup.
#[derive(Debug, Default, Clone)]
pub struct Snapshot {
    pub tasks: Vec<Task>,
    pub transactions: Vec<Transaction>,
    pub notified: Vec<String>,
    pub theme: ThemeColor,
}

trait Keyed {
    fn key_id(&self) -> &str;
}

impl Keyed for Task {
    fn key_id(&self) -> &str {
        &self.id
    }
}

impl Keyed for Transaction {
    fn key_id(&self) -> &str {
        &self.id
    }
}

impl Keyed for String {
    fn key_id(&self) -> &str {
        self
    }
}

#[derive(Debug, Clone)]
pub struct Store {
    dir: PathBuf,
}

impl Store {
    pub fn open(dir: &Path) -> Result<Self, StoreError> {
        fs::create_dir_all(dir).map_err(|source| StoreError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
        info!("Store at {}", dir.display());
        Ok(Self {
            dir: dir.to_path_buf(),
        })
    }

    fn json_path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}.json"))
    }

    /// Load every key. Never fails: unreadable data degrades to empty.
    pub fn load(&self) -> Snapshot {
        let snapshot = Snapshot {
            tasks: self.load_records(TASKS_KEY),
            transactions: self.load_records(TRANSACTIONS_KEY),
            notified: self.load_records(NOTIFIED_KEY),
            theme: self.load_theme(),
        };
        info!(
            "Loaded {} tasks, {} transactions, {} notified ids (theme: {})",
            snapshot.tasks.len(),
            snapshot.transactions.len(),
            snapshot.notified.len(),
            snapshot.theme
        );
        snapshot
    }

    fn load_records<T: DeserializeOwned + Keyed>(&self, key: &str) -> Vec<T> {
        let path = self.json_path(key);
        let contents = match fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Vec::new(),
            Err(e) => {
                warn!("Failed to read {}: {e}", path.display());
                return Vec::new();
            }
        };

        let entries = match serde_json::from_str::<Value>(&contents) {
            Ok(Value::Array(entries)) => entries,
            Ok(_) => {
                warn!("{} is not a JSON array, setting it aside", path.display());
                self.set_aside(&path);
                return Vec::new();
            }
            Err(e) => {
                warn!("{} is not valid JSON ({e}), setting it aside", path.display());
                self.set_aside(&path);
                return Vec::new();
            }
        };

        let mut seen = HashSet::new();
        let mut records = Vec::with_capacity(entries.len());
        for entry in entries {
            match serde_json::from_value::<T>(entry.clone()) {
                Ok(record) => {
                    if seen.insert(record.key_id().to_string()) {
                        records.push(record);
                    } else {
                        debug!("Dropping duplicate id '{}' in {key}", record.key_id());
                    }
                }
                Err(e) => {
                    warn!("Quarantining malformed {key} record: {e}");
                    self.quarantine(key, &entry, &e.to_string());
                }
            }
        }
        records
    }

    fn load_theme(&self) -> ThemeColor {
        let path = self.dir.join(THEME_KEY);
        match fs::read_to_string(&path) {
            Ok(raw) => raw.parse().unwrap_or_else(|e| {
                warn!("{e}, using default theme");
                ThemeColor::default()
            }),
            Err(_) => ThemeColor::default(),
        }
    }

    fn set_aside(&self, path: &Path) {
        let stamp = Local::now().format("%Y%m%d%H%M%S");
        let target = path.with_extension(format!("json.corrupt-{stamp}"));
        if let Err(e) = fs::rename(path, &target) {
            warn!("Failed to move {} aside: {e}", path.display());
        }
    }

    fn quarantine(&self, key: &str, record: &Value, error: &str) {
        let path = self.dir.join(QUARANTINE_FILE);
        let line = json!({
            "timestamp": Local::now().to_rfc3339(),
            "key": key,
            "error": error,
            "record": record,
        });
        let result = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .and_then(|mut file| writeln!(file, "{line}"));
        if let Err(e) = result {
            warn!("Failed to write quarantine record: {e}");
        }
    }

    pub fn save_tasks(&self, tasks: &[Task]) -> Result<(), StoreError> {
        self.write_json(TASKS_KEY, tasks)
    }

    pub fn save_transactions(&self, transactions: &[Transaction]) -> Result<(), StoreError> {
        self.write_json(TRANSACTIONS_KEY, transactions)
    }

    pub fn save_notified(&self, notified: &[String]) -> Result<(), StoreError> {
        self.write_json(NOTIFIED_KEY, notified)
    }

    pub fn save_theme(&self, theme: ThemeColor) -> Result<(), StoreError> {
        self.write_atomic(&self.dir.join(THEME_KEY), theme.as_str().as_bytes())
    }

    fn write_json<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec(value)?;
        self.write_atomic(&self.json_path(key), &bytes)
    }

    fn write_atomic(&self, path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
        let tmp = path.with_extension("tmp");
        let io_err = |source| StoreError::Io {
            path: path.to_path_buf(),
            source,
        };
        fs::write(&tmp, bytes).map_err(io_err)?;
        fs::rename(&tmp, path).map_err(io_err)?;
        Ok(())
    }
}
