/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
pub enum IndexedDBTxnMode {
    Readonly,
    Readwrite,
    Versionchange,
}

impl IndexedDBTxnMode {
    pub fn is_write(&self) -> bool {
        !matches!(self, IndexedDBTxnMode::Readonly)
    }
}

/// <https://w3c.github.io/IndexedDB/#key-path-construct>
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum KeyPath {
    String(String),
    Sequence(Vec<String>),
}

impl From<&str> for KeyPath {
    fn from(path: &str) -> Self {
        KeyPath::String(path.to_owned())
    }
}

impl From<Vec<&str>> for KeyPath {
    fn from(paths: Vec<&str>) -> Self {
        KeyPath::Sequence(paths.into_iter().map(str::to_owned).collect())
    }
}

/// <https://w3c.github.io/IndexedDB/#key-construct>
#[derive(Clone, Debug, Deserialize, Serialize)]
pub enum IndexedDBKeyType {
    Number(f64),
    String(String),
    Binary(Vec<u8>),
    /// Milliseconds since the epoch.
    Date(f64),
    Array(Vec<IndexedDBKeyType>),
}

impl IndexedDBKeyType {
    /// Position of the key's type in the cross-type ordering.
    fn type_rank(&self) -> u8 {
        match self {
            IndexedDBKeyType::Number(_) => 0,
            IndexedDBKeyType::Date(_) => 1,
            IndexedDBKeyType::String(_) => 2,
            IndexedDBKeyType::Binary(_) => 3,
            IndexedDBKeyType::Array(_) => 4,
        }
    }

    /// <https://w3c.github.io/IndexedDB/#compare-two-keys>
    pub fn compare(&self, other: &Self) -> Ordering {
        match (self, other) {
            (IndexedDBKeyType::Number(a), IndexedDBKeyType::Number(b)) |
            (IndexedDBKeyType::Date(a), IndexedDBKeyType::Date(b)) => {
                a.partial_cmp(b).unwrap_or(Ordering::Equal)
            },
            // Strings compare by UTF-16 code unit.
            (IndexedDBKeyType::String(a), IndexedDBKeyType::String(b)) => {
                a.encode_utf16().cmp(b.encode_utf16())
            },
            (IndexedDBKeyType::Binary(a), IndexedDBKeyType::Binary(b)) => a.cmp(b),
            (IndexedDBKeyType::Array(a), IndexedDBKeyType::Array(b)) => {
                for (left, right) in a.iter().zip(b.iter()) {
                    let ordering = left.compare(right);
                    if ordering != Ordering::Equal {
                        return ordering;
                    }
                }
                a.len().cmp(&b.len())
            },
            _ => self.type_rank().cmp(&other.type_rank()),
        }
    }
}

impl PartialEq for IndexedDBKeyType {
    fn eq(&self, other: &Self) -> bool {
        self.compare(other) == Ordering::Equal
    }
}

impl Eq for IndexedDBKeyType {}

impl PartialOrd for IndexedDBKeyType {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for IndexedDBKeyType {
    fn cmp(&self, other: &Self) -> Ordering {
        self.compare(other)
    }
}

impl From<f64> for IndexedDBKeyType {
    fn from(number: f64) -> Self {
        IndexedDBKeyType::Number(number)
    }
}

impl From<&str> for IndexedDBKeyType {
    fn from(string: &str) -> Self {
        IndexedDBKeyType::String(string.to_owned())
    }
}

/// <https://w3c.github.io/IndexedDB/#range-construct>
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct IndexedDBKeyRange {
    pub lower: Option<IndexedDBKeyType>,
    pub upper: Option<IndexedDBKeyType>,
    pub lower_open: bool,
    pub upper_open: bool,
}

impl From<IndexedDBKeyType> for IndexedDBKeyRange {
    fn from(key: IndexedDBKeyType) -> Self {
        IndexedDBKeyRange::only(key)
    }
}

impl IndexedDBKeyRange {
    pub fn only(key: IndexedDBKeyType) -> Self {
        Self::new(Some(key.clone()), Some(key), false, false)
    }

    pub fn new(
        lower: Option<IndexedDBKeyType>,
        upper: Option<IndexedDBKeyType>,
        lower_open: bool,
        upper_open: bool,
    ) -> Self {
        IndexedDBKeyRange {
            lower,
            upper,
            lower_open,
            upper_open,
        }
    }

    pub fn lower_bound(key: IndexedDBKeyType, open: bool) -> Self {
        Self::new(Some(key), None, open, true)
    }

    pub fn upper_bound(key: IndexedDBKeyType, open: bool) -> Self {
        Self::new(None, Some(key), true, open)
    }

    /// A range matching every key.
    pub fn unbounded() -> Self {
        Self::new(None, None, true, true)
    }

    /// <https://w3c.github.io/IndexedDB/#in>
    pub fn contains(&self, key: &IndexedDBKeyType) -> bool {
        let lower_ok = match &self.lower {
            Some(lower) if self.lower_open => key > lower,
            Some(lower) => key >= lower,
            None => true,
        };
        let upper_ok = match &self.upper {
            Some(upper) if self.upper_open => key < upper,
            Some(upper) => key <= upper,
            None => true,
        };
        lower_ok && upper_ok
    }

    pub fn is_singleton(&self) -> bool {
        self.as_singleton().is_some()
    }

    pub fn as_singleton(&self) -> Option<&IndexedDBKeyType> {
        match (&self.lower, &self.upper) {
            (Some(lower), Some(upper))
                if !self.lower_open && !self.upper_open && lower == upper =>
            {
                Some(lower)
            },
            _ => None,
        }
    }
}

/// <https://w3c.github.io/IndexedDB/#index-construct>
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct IndexedDBIndex {
    pub name: String,
    pub key_path: KeyPath,
    pub unique: bool,
    pub multi_entry: bool,
}

/// <https://w3c.github.io/IndexedDB/#object-store-construct>
///
/// The key generator's current number is owned by the backend, since it changes
/// on every write rather than only in versionchange transactions.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct IndexedDBObjectStore {
    pub name: String,
    pub key_path: Option<KeyPath>,
    pub has_key_generator: bool,
    pub indexes: BTreeMap<String, IndexedDBIndex>,
}

impl IndexedDBObjectStore {
    pub fn index(&self, name: &str) -> Option<&IndexedDBIndex> {
        self.indexes.get(name)
    }

    pub fn index_names(&self) -> Vec<String> {
        self.indexes.keys().cloned().collect()
    }
}

/// The schema of one database, as last written by a versionchange transaction.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct DatabaseMeta {
    pub name: String,
    pub object_stores: BTreeMap<String, IndexedDBObjectStore>,
}

impl DatabaseMeta {
    pub fn new(name: &str) -> Self {
        DatabaseMeta {
            name: name.to_owned(),
            object_stores: BTreeMap::new(),
        }
    }

    pub fn object_store(&self, name: &str) -> Option<&IndexedDBObjectStore> {
        self.object_stores.get(name)
    }

    /// Sorted, as required for `objectStoreNames`.
    pub fn object_store_names(&self) -> Vec<String> {
        self.object_stores.keys().cloned().collect()
    }
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct DatabaseInfo {
    pub name: String,
    pub version: u64,
}

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum CreateObjectResult {
    Created,
    AlreadyExists,
}

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum PutItemResult {
    Success,
    CannotOverwrite,
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum BackendError {
    DbNotFound,
    StoreNotFound,
    IndexNotFound,
    /// A unique index or schema name already holds the given value.
    Constraint(String),
    QuotaExceeded,
    DbErr(String),
}

impl fmt::Display for BackendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendError::DbNotFound => write!(f, "database not found"),
            BackendError::StoreNotFound => write!(f, "object store not found"),
            BackendError::IndexNotFound => write!(f, "index not found"),
            BackendError::Constraint(reason) => write!(f, "constraint violated: {reason}"),
            BackendError::QuotaExceeded => write!(f, "quota exceeded"),
            BackendError::DbErr(reason) => write!(f, "backend failure: {reason}"),
        }
    }
}

impl std::error::Error for BackendError {}

pub type BackendResult<T> = Result<T, BackendError>;
