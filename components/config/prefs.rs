/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

use std::fmt;
use std::fs;
use std::path::Path;
use std::sync::{LazyLock, RwLock, RwLockReadGuard};

use log::warn;
use serde::{Deserialize, Serialize};

static PREFERENCES: LazyLock<RwLock<Preferences>> = LazyLock::new(Default::default);

/// Reads a single preference by field name, e.g. `pref!(dom_indexeddb_backend)`.
#[macro_export]
macro_rules! pref {
    ($name: ident) => {
        $crate::prefs::get().$name.clone()
    };
}

pub fn get() -> RwLockReadGuard<'static, Preferences> {
    PREFERENCES
        .read()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub fn set(preferences: Preferences) {
    let mut current = PREFERENCES
        .write()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    *current = preferences;
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(default)]
pub struct Preferences {
    /// Either "sqlite" or "memory".
    pub dom_indexeddb_backend: String,
    pub dom_indexeddb_sqlite_synchronous: String,
    /// In bytes.
    pub dom_indexeddb_sqlite_journal_size_limit: i64,
    /// In bytes.
    pub dom_indexeddb_sqlite_mmap_size: i64,
    /// In pages.
    pub dom_indexeddb_sqlite_cache_size: i64,
}

impl Default for Preferences {
    fn default() -> Self {
        Preferences {
            dom_indexeddb_backend: String::from("sqlite"),
            dom_indexeddb_sqlite_synchronous: String::from("NORMAL"),
            dom_indexeddb_sqlite_journal_size_limit: 64 * 1024 * 1024,
            dom_indexeddb_sqlite_mmap_size: 64 * 1024 * 1024,
            dom_indexeddb_sqlite_cache_size: 2000,
        }
    }
}

impl Preferences {
    /// Parses preferences from JSON. Missing fields keep their defaults.
    pub fn from_json(json: &str) -> Result<Self, PrefError> {
        serde_json::from_str(json).map_err(PrefError::Parse)
    }

    pub fn from_file(path: &Path) -> Result<Self, PrefError> {
        let contents = fs::read_to_string(path).map_err(PrefError::Io)?;
        Self::from_json(&contents).inspect_err(|error| {
            warn!("Ignoring preferences file {}: {error}", path.display());
        })
    }
}

#[derive(Debug)]
pub enum PrefError {
    Io(std::io::Error),
    Parse(serde_json::Error),
}

impl fmt::Display for PrefError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PrefError::Io(error) => write!(f, "failed to read preferences: {error}"),
            PrefError::Parse(error) => write!(f, "failed to parse preferences: {error}"),
        }
    }
}

impl std::error::Error for PrefError {}
