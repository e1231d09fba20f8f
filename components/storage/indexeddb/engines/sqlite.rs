/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! A durable backend keeping each database in its own SQLite file.
//!
//! All transactions of a database share one connection. Readwrite and
//! versionchange transactions run one at a time, each inside its own SQLite
//! transaction, so a commit is durable before `complete` fires and an abort
//! is a rollback.

use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::fs;
use std::ops::Bound;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use log::{error, info, warn};
use rusqlite::{Connection, ErrorCode, OptionalExtension, params};
use rustc_hash::FxHashMap;
use sea_query::{
    Condition, Expr, ExprTrait, IntoColumnRef, Order, Query, SelectStatement, SqliteQueryBuilder,
};
use sea_query_rusqlite::RusqliteBinder;
use shovel_config::pref;
use storage_traits::indexeddb::{
    BackendError, BackendResult, CreateObjectResult, DatabaseInfo, DatabaseMeta, IndexedDBIndex,
    IndexedDBObjectStore, IndexedDBTxnMode, KeyPath, PutItemResult,
};
use uuid::Uuid;

use super::{
    IndexRecord, IndexedDBBackend, KvsEngine, KvsTransaction, PutRecord, RecordSource,
    SeekDirection, SeekPosition, StoredRecord, updated_key_generator,
};
use crate::indexed_db::MAX_KEY_GENERATOR_VALUE;
use crate::indexeddb::key_codec::{EncodedKey, EncodedKeyRange};

mod create;
mod index_data_model;
mod object_data_model;
mod object_store_index_model;
mod object_store_model;

const DB_FILE_NAME: &str = "db.sqlite";

// These pragmas need to be set once
const DB_INIT_PRAGMAS: [&str; 2] = ["PRAGMA journal_mode = WAL;", "PRAGMA encoding = 'UTF-16';"];

/// Pragmas run on every new connection, from the current preferences.
fn connection_pragmas() -> Vec<String> {
    vec![
        format!(
            "PRAGMA synchronous = {};",
            pref!(dom_indexeddb_sqlite_synchronous)
        ),
        format!(
            "PRAGMA journal_size_limit = {};",
            pref!(dom_indexeddb_sqlite_journal_size_limit)
        ),
        format!("PRAGMA mmap_size = {};", pref!(dom_indexeddb_sqlite_mmap_size)),
        format!("PRAGMA cache_size = {};", pref!(dom_indexeddb_sqlite_cache_size)),
    ]
}

/// Runs a pragma whether or not it reports a value.
fn run_pragma(connection: &Connection, pragma: &str) {
    if let Err(e) = connection.query_row(pragma, [], |_| Ok(())).optional() {
        warn!("Failed to run {pragma}: {e}");
    }
}

fn backend_error(error: rusqlite::Error) -> BackendError {
    match &error {
        rusqlite::Error::SqliteFailure(failure, _) if failure.code == ErrorCode::DiskFull => {
            BackendError::QuotaExceeded
        },
        rusqlite::Error::SqliteFailure(failure, _)
            if failure.code == ErrorCode::ConstraintViolation =>
        {
            BackendError::Constraint(error.to_string())
        },
        _ => BackendError::DbErr(error.to_string()),
    }
}

/// A version or key generator value read back from the database.
fn stored_u64(value: i64) -> BackendResult<u64> {
    u64::try_from(value).map_err(|_| BackendError::DbErr(format!("invalid stored value {value}")))
}

fn key_path_to_json(key_path: &KeyPath) -> BackendResult<Vec<u8>> {
    serde_json::to_vec(key_path).map_err(|e| BackendError::DbErr(e.to_string()))
}

fn key_path_from_json(json: &[u8]) -> BackendResult<KeyPath> {
    serde_json::from_slice(json).map_err(|e| BackendError::DbErr(e.to_string()))
}

fn bytes(key: &EncodedKey) -> Vec<u8> {
    key.as_bytes().to_vec()
}

/// The rows of `column` inside `range`.
fn range_condition<C>(column: C, range: &EncodedKeyRange) -> Condition
where
    C: IntoColumnRef + Copy,
{
    let condition = Condition::all();
    let condition = match &range.lower {
        Bound::Included(lower) => condition.add(Expr::col(column).gte(bytes(lower))),
        Bound::Excluded(lower) => condition.add(Expr::col(column).gt(bytes(lower))),
        Bound::Unbounded => condition,
    };
    match &range.upper {
        Bound::Included(upper) => condition.add(Expr::col(column).lte(bytes(upper))),
        Bound::Excluded(upper) => condition.add(Expr::col(column).lt(bytes(upper))),
        Bound::Unbounded => condition,
    }
}

fn beyond<C>(column: C, value: Vec<u8>, direction: SeekDirection, inclusive: bool) -> Expr
where
    C: IntoColumnRef,
{
    match (direction, inclusive) {
        (SeekDirection::Forward, true) => Expr::col(column).gte(value),
        (SeekDirection::Forward, false) => Expr::col(column).gt(value),
        (SeekDirection::Backward, true) => Expr::col(column).lte(value),
        (SeekDirection::Backward, false) => Expr::col(column).lt(value),
    }
}

/// The rows on the far side of `position`, ordered by `(key, primary key)`.
fn position_condition<K, P>(
    key_column: K,
    primary_key_column: P,
    direction: SeekDirection,
    position: &SeekPosition,
) -> Condition
where
    K: IntoColumnRef + Copy,
    P: IntoColumnRef,
{
    match &position.primary_key {
        None => Condition::all().add(beyond(
            key_column,
            bytes(&position.key),
            direction,
            position.inclusive,
        )),
        Some(primary_key) => Condition::any()
            .add(beyond(key_column, bytes(&position.key), direction, false))
            .add(
                Condition::all()
                    .add(Expr::col(key_column).eq(bytes(&position.key)))
                    .add(beyond(
                        primary_key_column,
                        bytes(primary_key),
                        direction,
                        position.inclusive,
                    )),
            ),
    }
}

fn order(direction: SeekDirection) -> Order {
    match direction {
        SeekDirection::Forward => Order::Asc,
        SeekDirection::Backward => Order::Desc,
    }
}

pub struct SqliteBackend {
    base_dir: PathBuf,
    engines: RefCell<FxHashMap<String, Rc<SqliteEngine>>>,
}

impl SqliteBackend {
    pub fn new(base_dir: &Path) -> Self {
        SqliteBackend {
            base_dir: base_dir.to_owned(),
            engines: Default::default(),
        }
    }

    fn database_dir(&self, name: &str) -> PathBuf {
        let id = Uuid::new_v5(&Uuid::NAMESPACE_URL, name.as_bytes());
        self.base_dir.join(id.to_string())
    }

    /// Name and version recorded in a database file that is not open.
    fn read_info(path: &Path) -> BackendResult<DatabaseInfo> {
        let connection = Connection::open(path).map_err(backend_error)?;
        let (name, version) = connection
            .query_row("SELECT name, version FROM database", [], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
            })
            .map_err(backend_error)?;
        Ok(DatabaseInfo {
            name,
            version: stored_u64(version)?,
        })
    }
}

impl IndexedDBBackend for SqliteBackend {
    fn open(&self, name: &str) -> BackendResult<Rc<dyn KvsEngine>> {
        if let Some(engine) = self.engines.borrow().get(name) {
            return Ok(engine.clone());
        }
        let engine = Rc::new(SqliteEngine::new(&self.database_dir(name), name)?);
        self.engines
            .borrow_mut()
            .insert(name.to_owned(), engine.clone());
        Ok(engine)
    }

    fn delete_database(&self, name: &str) -> BackendResult<u64> {
        let dir = self.database_dir(name);
        let version = match self.engines.borrow_mut().remove(name) {
            Some(engine) => engine.version()?,
            None if dir.join(DB_FILE_NAME).exists() => {
                Self::read_info(&dir.join(DB_FILE_NAME))?.version
            },
            None => return Ok(0),
        };
        if dir.exists() {
            if let Err(e) = fs::remove_dir_all(&dir) {
                error!("Failed to delete database: {:?}", e);
                return Err(BackendError::DbErr(e.to_string()));
            }
        }
        Ok(version)
    }

    fn databases(&self) -> BackendResult<Vec<DatabaseInfo>> {
        let Ok(entries) = fs::read_dir(&self.base_dir) else {
            return Ok(Vec::new());
        };
        let engines = self.engines.borrow();
        let mut databases = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path().join(DB_FILE_NAME);
            if !path.exists() {
                continue;
            }
            let info = match Self::read_info(&path) {
                Ok(info) => info,
                Err(e) => {
                    warn!("Skipping unreadable database at {}: {e}", path.display());
                    continue;
                },
            };
            let version = match engines.get(&info.name) {
                Some(engine) => engine.version()?,
                None => info.version,
            };
            if version > 0 {
                databases.push(DatabaseInfo {
                    name: info.name,
                    version,
                });
            }
        }
        databases.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(databases)
    }
}

struct SqliteShared {
    name: String,
    connection: Connection,
    pending_version: Cell<Option<u64>>,
}

impl SqliteShared {
    fn begin_write(&self) -> BackendResult<()> {
        if !self.connection.is_autocommit() {
            return Err(BackendError::DbErr(format!(
                "a write transaction is already running on {}",
                self.name
            )));
        }
        self.connection
            .execute_batch("BEGIN IMMEDIATE")
            .map_err(backend_error)
    }

    fn end_write(&self, statement: &str) -> BackendResult<()> {
        self.connection
            .execute_batch(statement)
            .map_err(backend_error)
    }

    fn store(&self, name: &str) -> BackendResult<object_store_model::Model> {
        self.connection
            .query_row(
                &format!("{} WHERE name = ?", object_store_model::SELECT),
                params![name],
                |row| object_store_model::Model::try_from(row),
            )
            .optional()
            .map_err(backend_error)?
            .ok_or(BackendError::StoreNotFound)
    }

    fn index(&self, store_id: i64, name: &str) -> BackendResult<object_store_index_model::Model> {
        self.connection
            .query_row(
                &format!(
                    "{} WHERE object_store_id = ? AND name = ?",
                    object_store_index_model::SELECT
                ),
                params![store_id, name],
                |row| object_store_index_model::Model::try_from(row),
            )
            .optional()
            .map_err(backend_error)?
            .ok_or(BackendError::IndexNotFound)
    }

    fn record_value(&self, store_id: i64, key: &[u8]) -> BackendResult<Option<Vec<u8>>> {
        self.connection
            .query_row(
                "SELECT data FROM object_data WHERE object_store_id = ? AND key = ?",
                params![store_id, key],
                |row| row.get(0),
            )
            .optional()
            .map_err(backend_error)
    }

    fn select_records(&self, select: &SelectStatement) -> BackendResult<Vec<object_data_model::Model>> {
        let (sql, values) = select.build_rusqlite(SqliteQueryBuilder);
        let mut stmt = self.connection.prepare(&sql).map_err(backend_error)?;
        let rows = stmt
            .query_map(&*values.as_params(), |row| object_data_model::Model::try_from(row))
            .map_err(backend_error)?;
        rows.collect::<Result<_, _>>().map_err(backend_error)
    }

    fn select_index_entries(
        &self,
        select: &SelectStatement,
    ) -> BackendResult<Vec<index_data_model::Model>> {
        let (sql, values) = select.build_rusqlite(SqliteQueryBuilder);
        let mut stmt = self.connection.prepare(&sql).map_err(backend_error)?;
        let rows = stmt
            .query_map(&*values.as_params(), |row| index_data_model::Model::try_from(row))
            .map_err(backend_error)?;
        rows.collect::<Result<_, _>>().map_err(backend_error)
    }

    fn count(&self, select: &SelectStatement) -> BackendResult<u64> {
        let (sql, values) = select.build_rusqlite(SqliteQueryBuilder);
        self.connection
            .query_row(&sql, &*values.as_params(), |row| row.get::<_, i64>(0))
            .map(|count| count as u64)
            .map_err(backend_error)
    }

    fn load_metadata(&self) -> BackendResult<DatabaseMeta> {
        let mut meta = DatabaseMeta::new(&self.name);
        let mut names_by_id = FxHashMap::default();

        let mut stmt = self
            .connection
            .prepare(object_store_model::SELECT)
            .map_err(backend_error)?;
        let stores = stmt
            .query_map([], |row| object_store_model::Model::try_from(row))
            .map_err(backend_error)?;
        for store in stores {
            let store = store.map_err(backend_error)?;
            let key_path = store
                .key_path
                .as_deref()
                .map(key_path_from_json)
                .transpose()?;
            names_by_id.insert(store.id, store.name.clone());
            meta.object_stores.insert(
                store.name.clone(),
                IndexedDBObjectStore {
                    name: store.name,
                    key_path,
                    has_key_generator: store.auto_increment,
                    indexes: BTreeMap::new(),
                },
            );
        }

        let mut stmt = self
            .connection
            .prepare(object_store_index_model::SELECT)
            .map_err(backend_error)?;
        let indexes = stmt
            .query_map([], |row| object_store_index_model::Model::try_from(row))
            .map_err(backend_error)?;
        for index in indexes {
            let index = index.map_err(backend_error)?;
            let Some(store) = names_by_id
                .get(&index.object_store_id)
                .and_then(|name| meta.object_stores.get_mut(name))
            else {
                warn!("Index {} refers to a missing object store", index.name);
                continue;
            };
            store.indexes.insert(
                index.name.clone(),
                IndexedDBIndex {
                    name: index.name,
                    key_path: key_path_from_json(&index.key_path)?,
                    unique: index.unique_index,
                    multi_entry: index.multi_entry_index,
                },
            );
        }
        Ok(meta)
    }
}

pub(super) struct SqliteEngine {
    shared: Rc<SqliteShared>,
}

impl SqliteEngine {
    fn new(dir: &Path, name: &str) -> BackendResult<Self> {
        fs::create_dir_all(dir).map_err(|e| BackendError::DbErr(e.to_string()))?;
        let path = dir.join(DB_FILE_NAME);
        let connection = Self::init_db(&path, name).map_err(backend_error)?;
        for pragma in connection_pragmas() {
            run_pragma(&connection, &pragma);
        }
        Ok(SqliteEngine {
            shared: Rc::new(SqliteShared {
                name: name.to_owned(),
                connection,
                pending_version: Cell::new(None),
            }),
        })
    }

    fn init_db(path: &Path, name: &str) -> Result<Connection, rusqlite::Error> {
        let connection = Connection::open(path)?;
        if connection.table_exists(None, "database")? {
            // Database already exists, no need to initialize
            return Ok(connection);
        }
        info!("Initializing indexeddb database at {:?}", path);
        for pragma in DB_INIT_PRAGMAS {
            run_pragma(&connection, pragma);
        }
        create::create_tables(&connection)?;
        connection.execute(
            "INSERT INTO database (name, version) VALUES (?, ?)",
            params![name, 0_i64],
        )?;
        Ok(connection)
    }
}

impl KvsEngine for SqliteEngine {
    fn name(&self) -> &str {
        &self.shared.name
    }

    fn version(&self) -> BackendResult<u64> {
        self.shared
            .connection
            .query_row("SELECT version FROM database", [], |row| row.get::<_, i64>(0))
            .map_err(backend_error)
            .and_then(stored_u64)
    }

    fn metadata(&self) -> BackendResult<DatabaseMeta> {
        self.shared.load_metadata()
    }

    fn begin_transaction(
        &self,
        _scope: &[String],
        mode: IndexedDBTxnMode,
    ) -> BackendResult<Box<dyn KvsTransaction>> {
        if mode != IndexedDBTxnMode::Readonly {
            self.shared.begin_write()?;
        }
        Ok(Box::new(SqliteTransaction {
            shared: self.shared.clone(),
            mode,
        }))
    }

    fn allows_concurrent_writers(&self) -> bool {
        false
    }

    fn set_version(&self, version: u64) -> BackendResult<()> {
        self.shared.pending_version.set(Some(version));
        Ok(())
    }

    fn commit_version(&self) -> BackendResult<()> {
        let Some(version) = self.shared.pending_version.take() else {
            return Ok(());
        };
        self.shared
            .connection
            .execute("UPDATE database SET version = ?", params![version as i64])
            .map_err(backend_error)?;
        Ok(())
    }
}

struct SqliteTransaction {
    shared: Rc<SqliteShared>,
    mode: IndexedDBTxnMode,
}

impl SqliteTransaction {
    fn connection(&self) -> &Connection {
        &self.shared.connection
    }

    fn check_versionchange(&self) -> BackendResult<()> {
        match self.mode {
            IndexedDBTxnMode::Versionchange => Ok(()),
            _ => Err(BackendError::DbErr(
                "schema changes need a versionchange transaction".to_owned(),
            )),
        }
    }

    fn writable_store(&self, name: &str) -> BackendResult<object_store_model::Model> {
        if self.mode == IndexedDBTxnMode::Readonly {
            return Err(BackendError::DbErr(
                "write in a readonly transaction".to_owned(),
            ));
        }
        self.shared.store(name)
    }

    fn keys_in_range(&self, store_id: i64, range: &EncodedKeyRange) -> BackendResult<Vec<Vec<u8>>> {
        let select = Query::select()
            .columns([object_data_model::Column::Key, object_data_model::Column::Data])
            .from(object_data_model::Column::Table)
            .cond_where(
                range_condition(object_data_model::Column::Key, range)
                    .add(Expr::col(object_data_model::Column::ObjectStoreId).eq(store_id)),
            )
            .to_owned();
        Ok(self
            .shared
            .select_records(&select)?
            .into_iter()
            .map(|record| record.key)
            .collect())
    }

    fn remove_index_entries(&self, store_id: i64, key: &[u8]) -> BackendResult<()> {
        self.connection()
            .execute(
                "DELETE FROM index_data WHERE object_store_id = ? AND object_data_key = ?",
                params![store_id, key],
            )
            .map_err(backend_error)?;
        Ok(())
    }

    fn check_unique(
        &self,
        store_id: i64,
        index: &object_store_index_model::Model,
        primary_key: &[u8],
        keys: &[EncodedKey],
    ) -> BackendResult<()> {
        if !index.unique_index {
            return Ok(());
        }
        let mut stmt = self
            .connection()
            .prepare(
                "SELECT 1 FROM index_data WHERE index_id = ? AND value = ? \
                 AND object_data_key != ? AND object_store_id = ?",
            )
            .map_err(backend_error)?;
        for key in keys {
            let taken = stmt
                .exists(params![index.id, key.as_bytes(), primary_key, store_id])
                .map_err(backend_error)?;
            if taken {
                return Err(BackendError::Constraint(format!(
                    "index {} already contains the key",
                    index.name
                )));
            }
        }
        Ok(())
    }

    fn insert_index_entries(
        &self,
        store_id: i64,
        index_id: i64,
        primary_key: &[u8],
        keys: &[EncodedKey],
    ) -> BackendResult<()> {
        let mut stmt = self
            .connection()
            .prepare(
                "INSERT OR IGNORE INTO index_data (index_id, value, object_data_key, object_store_id) \
                 VALUES (?, ?, ?, ?)",
            )
            .map_err(backend_error)?;
        for key in keys {
            stmt.execute(params![index_id, key.as_bytes(), primary_key, store_id])
                .map_err(backend_error)?;
        }
        Ok(())
    }

    fn store_seek(
        &self,
        store: &object_store_model::Model,
        range: &EncodedKeyRange,
        direction: SeekDirection,
        position: Option<&SeekPosition>,
    ) -> BackendResult<Option<object_data_model::Model>> {
        use object_data_model::Column;

        let mut condition =
            range_condition(Column::Key, range).add(Expr::col(Column::ObjectStoreId).eq(store.id));
        if let Some(position) = position {
            condition = condition.add(position_condition(
                Column::Key,
                Column::Key,
                direction,
                position,
            ));
        }
        let select = Query::select()
            .columns([Column::Key, Column::Data])
            .from(Column::Table)
            .cond_where(condition)
            .order_by(Column::Key, order(direction))
            .limit(1)
            .to_owned();
        Ok(self.shared.select_records(&select)?.pop())
    }

    fn index_seek(
        &self,
        index: &object_store_index_model::Model,
        range: &EncodedKeyRange,
        direction: SeekDirection,
        position: Option<&SeekPosition>,
    ) -> BackendResult<Option<index_data_model::Model>> {
        use index_data_model::Column;

        let mut condition =
            range_condition(Column::Value, range).add(Expr::col(Column::IndexId).eq(index.id));
        if let Some(position) = position {
            condition = condition.add(position_condition(
                Column::Value,
                Column::ObjectDataKey,
                direction,
                position,
            ));
        }
        let select = Query::select()
            .columns([Column::Value, Column::ObjectDataKey])
            .from(Column::Table)
            .cond_where(condition)
            .order_by(Column::Value, order(direction))
            .order_by(Column::ObjectDataKey, order(direction))
            .limit(1)
            .to_owned();
        Ok(self.shared.select_index_entries(&select)?.pop())
    }

    fn update_key_generator(&self, store_id: i64, current: u64) -> BackendResult<()> {
        self.connection()
            .execute(
                "UPDATE object_store SET key_generator_current = ? WHERE id = ?",
                params![current as i64, store_id],
            )
            .map_err(backend_error)?;
        Ok(())
    }
}

impl KvsTransaction for SqliteTransaction {
    fn mode(&self) -> IndexedDBTxnMode {
        self.mode
    }

    fn create_object_store(&mut self, store: IndexedDBObjectStore) -> BackendResult<CreateObjectResult> {
        self.check_versionchange()?;
        let mut stmt = self
            .connection()
            .prepare("SELECT 1 FROM object_store WHERE name = ?")
            .map_err(backend_error)?;
        if stmt.exists(params![store.name]).map_err(backend_error)? {
            // Store already exists
            return Ok(CreateObjectResult::AlreadyExists);
        }
        drop(stmt);
        let key_path = store.key_path.as_ref().map(key_path_to_json).transpose()?;
        self.connection()
            .execute(
                "INSERT INTO object_store (name, key_path, auto_increment) VALUES (?, ?, ?)",
                params![store.name, key_path, store.has_key_generator],
            )
            .map_err(backend_error)?;
        for index in store.indexes.into_values() {
            self.create_index(&store.name, index)?;
        }
        Ok(CreateObjectResult::Created)
    }

    fn delete_object_store(&mut self, name: &str) -> BackendResult<()> {
        self.check_versionchange()?;
        let store = self.shared.store(name)?;
        for statement in [
            "DELETE FROM index_data WHERE object_store_id = ?",
            "DELETE FROM object_store_index WHERE object_store_id = ?",
            "DELETE FROM object_data WHERE object_store_id = ?",
            "DELETE FROM object_store WHERE id = ?",
        ] {
            self.connection()
                .execute(statement, params![store.id])
                .map_err(backend_error)?;
        }
        Ok(())
    }

    fn rename_object_store(&mut self, name: &str, new_name: &str) -> BackendResult<()> {
        self.check_versionchange()?;
        if self.shared.store(new_name).is_ok() {
            return Err(BackendError::Constraint(format!("object store {new_name} exists")));
        }
        let store = self.shared.store(name)?;
        self.connection()
            .execute(
                "UPDATE object_store SET name = ? WHERE id = ?",
                params![new_name, store.id],
            )
            .map_err(backend_error)?;
        Ok(())
    }

    fn create_index(&mut self, store: &str, index: IndexedDBIndex) -> BackendResult<CreateObjectResult> {
        self.check_versionchange()?;
        let store = self.shared.store(store)?;
        if self.shared.index(store.id, &index.name).is_ok() {
            return Ok(CreateObjectResult::AlreadyExists);
        }
        self.connection()
            .execute(
                "INSERT INTO object_store_index \
                 (object_store_id, name, key_path, unique_index, multi_entry_index) \
                 VALUES (?, ?, ?, ?, ?)",
                params![
                    store.id,
                    index.name,
                    key_path_to_json(&index.key_path)?,
                    index.unique,
                    index.multi_entry
                ],
            )
            .map_err(backend_error)?;
        Ok(CreateObjectResult::Created)
    }

    fn delete_index(&mut self, store: &str, name: &str) -> BackendResult<()> {
        self.check_versionchange()?;
        let store = self.shared.store(store)?;
        let index = self.shared.index(store.id, name)?;
        self.connection()
            .execute("DELETE FROM index_data WHERE index_id = ?", params![index.id])
            .map_err(backend_error)?;
        self.connection()
            .execute("DELETE FROM object_store_index WHERE id = ?", params![index.id])
            .map_err(backend_error)?;
        Ok(())
    }

    fn rename_index(&mut self, store: &str, name: &str, new_name: &str) -> BackendResult<()> {
        self.check_versionchange()?;
        let store = self.shared.store(store)?;
        if self.shared.index(store.id, new_name).is_ok() {
            return Err(BackendError::Constraint(format!("index {new_name} exists")));
        }
        let index = self.shared.index(store.id, name)?;
        self.connection()
            .execute(
                "UPDATE object_store_index SET name = ? WHERE id = ?",
                params![new_name, index.id],
            )
            .map_err(backend_error)?;
        Ok(())
    }

    fn add_index_entries(
        &mut self,
        store: &str,
        index: &str,
        primary_key: &EncodedKey,
        keys: &[EncodedKey],
    ) -> BackendResult<()> {
        let store = self.writable_store(store)?;
        let index = self.shared.index(store.id, index)?;
        self.check_unique(store.id, &index, primary_key.as_bytes(), keys)?;
        self.insert_index_entries(store.id, index.id, primary_key.as_bytes(), keys)
    }

    fn get(&self, store: &str, range: &EncodedKeyRange) -> BackendResult<Option<StoredRecord>> {
        let store = self.shared.store(store)?;
        Ok(self
            .store_seek(&store, range, SeekDirection::Forward, None)?
            .map(|record| StoredRecord {
                key: EncodedKey::from_bytes(record.key),
                value: record.data,
            }))
    }

    fn get_all(
        &self,
        store: &str,
        range: &EncodedKeyRange,
        count: Option<u32>,
    ) -> BackendResult<Vec<StoredRecord>> {
        use object_data_model::Column;

        let store = self.shared.store(store)?;
        let mut select = Query::select()
            .columns([Column::Key, Column::Data])
            .from(Column::Table)
            .cond_where(
                range_condition(Column::Key, range)
                    .add(Expr::col(Column::ObjectStoreId).eq(store.id)),
            )
            .order_by(Column::Key, Order::Asc)
            .to_owned();
        if let Some(count) = count {
            select.limit(count as u64);
        }
        Ok(self
            .shared
            .select_records(&select)?
            .into_iter()
            .map(|record| StoredRecord {
                key: EncodedKey::from_bytes(record.key),
                value: record.data,
            })
            .collect())
    }

    fn count(&self, store: &str, range: &EncodedKeyRange) -> BackendResult<u64> {
        use object_data_model::Column;

        let store = self.shared.store(store)?;
        let count = Query::select()
            .expr(Expr::col(Column::Key).count())
            .from(Column::Table)
            .cond_where(
                range_condition(Column::Key, range)
                    .add(Expr::col(Column::ObjectStoreId).eq(store.id)),
            )
            .to_owned();
        self.shared.count(&count)
    }

    fn put(&mut self, store: &str, record: PutRecord, overwrite: bool) -> BackendResult<PutItemResult> {
        let store = self.writable_store(store)?;
        let key = record.key.as_bytes();
        let exists = self.shared.record_value(store.id, key)?.is_some();
        if exists && !overwrite {
            return Ok(PutItemResult::CannotOverwrite);
        }

        let mut indexes = Vec::with_capacity(record.index_entries.len());
        for entry in &record.index_entries {
            let index = self.shared.index(store.id, &entry.index_name)?;
            self.check_unique(store.id, &index, key, &entry.keys)?;
            indexes.push(index);
        }

        if exists {
            self.remove_index_entries(store.id, key)?;
        }
        self.connection()
            .execute(
                "INSERT OR REPLACE INTO object_data (object_store_id, key, data) VALUES (?, ?, ?)",
                params![store.id, key, record.value],
            )
            .map_err(backend_error)?;
        for (index, entry) in indexes.iter().zip(&record.index_entries) {
            self.insert_index_entries(store.id, index.id, key, &entry.keys)?;
        }
        Ok(PutItemResult::Success)
    }

    fn delete(&mut self, store: &str, range: &EncodedKeyRange) -> BackendResult<()> {
        let store = self.writable_store(store)?;
        for key in self.keys_in_range(store.id, range)? {
            self.remove_index_entries(store.id, &key)?;
        }
        let (sql, values) = Query::delete()
            .from_table(object_data_model::Column::Table)
            .cond_where(
                range_condition(object_data_model::Column::Key, range)
                    .add(Expr::col(object_data_model::Column::ObjectStoreId).eq(store.id)),
            )
            .build_rusqlite(SqliteQueryBuilder);
        self.connection()
            .execute(&sql, &*values.as_params())
            .map_err(backend_error)?;
        Ok(())
    }

    fn clear(&mut self, store: &str) -> BackendResult<()> {
        let store = self.writable_store(store)?;
        self.connection()
            .execute(
                "DELETE FROM index_data WHERE object_store_id = ?",
                params![store.id],
            )
            .map_err(backend_error)?;
        self.connection()
            .execute(
                "DELETE FROM object_data WHERE object_store_id = ?",
                params![store.id],
            )
            .map_err(backend_error)?;
        Ok(())
    }

    fn index_get_all(
        &self,
        store: &str,
        index: &str,
        range: &EncodedKeyRange,
        count: Option<u32>,
        with_value: bool,
    ) -> BackendResult<Vec<IndexRecord>> {
        use index_data_model::Column;

        let store = self.shared.store(store)?;
        let index = self.shared.index(store.id, index)?;
        let mut select = Query::select()
            .columns([Column::Value, Column::ObjectDataKey])
            .from(Column::Table)
            .cond_where(
                range_condition(Column::Value, range).add(Expr::col(Column::IndexId).eq(index.id)),
            )
            .order_by(Column::Value, Order::Asc)
            .order_by(Column::ObjectDataKey, Order::Asc)
            .to_owned();
        if let Some(count) = count {
            select.limit(count as u64);
        }
        self.shared
            .select_index_entries(&select)?
            .into_iter()
            .map(|entry| {
                let value = if with_value {
                    self.shared.record_value(store.id, &entry.object_data_key)?
                } else {
                    None
                };
                Ok(IndexRecord {
                    key: EncodedKey::from_bytes(entry.value),
                    primary_key: EncodedKey::from_bytes(entry.object_data_key),
                    value,
                })
            })
            .collect()
    }

    fn index_count(&self, store: &str, index: &str, range: &EncodedKeyRange) -> BackendResult<u64> {
        use index_data_model::Column;

        let store = self.shared.store(store)?;
        let index = self.shared.index(store.id, index)?;
        let count = Query::select()
            .expr(Expr::col(Column::Value).count())
            .from(Column::Table)
            .cond_where(
                range_condition(Column::Value, range).add(Expr::col(Column::IndexId).eq(index.id)),
            )
            .to_owned();
        self.shared.count(&count)
    }

    fn seek(
        &self,
        source: RecordSource<'_>,
        range: &EncodedKeyRange,
        direction: SeekDirection,
        position: Option<&SeekPosition>,
        with_value: bool,
    ) -> BackendResult<Option<IndexRecord>> {
        match source {
            RecordSource::ObjectStore(store) => {
                let store = self.shared.store(store)?;
                Ok(self
                    .store_seek(&store, range, direction, position)?
                    .map(|record| IndexRecord {
                        key: EncodedKey::from_bytes(record.key.clone()),
                        primary_key: EncodedKey::from_bytes(record.key),
                        value: with_value.then_some(record.data),
                    }))
            },
            RecordSource::Index { store, index } => {
                let store = self.shared.store(store)?;
                let index = self.shared.index(store.id, index)?;
                let Some(entry) = self.index_seek(&index, range, direction, position)? else {
                    return Ok(None);
                };
                let value = if with_value {
                    self.shared.record_value(store.id, &entry.object_data_key)?
                } else {
                    None
                };
                Ok(Some(IndexRecord {
                    key: EncodedKey::from_bytes(entry.value),
                    primary_key: EncodedKey::from_bytes(entry.object_data_key),
                    value,
                }))
            },
        }
    }

    fn next_auto_increment_key(&mut self, store: &str) -> BackendResult<Option<u64>> {
        let store = self.writable_store(store)?;
        let current = stored_u64(store.key_generator_current)?;
        if current > MAX_KEY_GENERATOR_VALUE {
            return Ok(None);
        }
        self.update_key_generator(store.id, current + 1)?;
        Ok(Some(current))
    }

    fn maybe_update_key_generator(&mut self, store: &str, key: f64) -> BackendResult<()> {
        let store = self.writable_store(store)?;
        if let Some(current) = updated_key_generator(stored_u64(store.key_generator_current)?, key) {
            self.update_key_generator(store.id, current)?;
        }
        Ok(())
    }

    fn get_auto_increment_current(&self, store: &str) -> BackendResult<u64> {
        stored_u64(self.shared.store(store)?.key_generator_current)
    }

    fn set_auto_increment_current(&mut self, store: &str, current: u64) -> BackendResult<()> {
        let store = self.writable_store(store)?;
        self.update_key_generator(store.id, current)
    }

    fn commit(self: Box<Self>) -> BackendResult<()> {
        match self.mode {
            IndexedDBTxnMode::Readonly => Ok(()),
            IndexedDBTxnMode::Readwrite | IndexedDBTxnMode::Versionchange => {
                let committed = self.shared.end_write("COMMIT");
                if let Err(e) = &committed {
                    error!("Failed to commit a transaction on {}: {e}", self.shared.name);
                    // A failed COMMIT can leave the SQLite transaction open.
                    if !self.shared.connection.is_autocommit() {
                        if let Err(e) = self.shared.end_write("ROLLBACK") {
                            error!("Failed to roll back on {}: {e}", self.shared.name);
                        }
                    }
                }
                committed
            },
        }
    }

    fn abort(self: Box<Self>) -> BackendResult<()> {
        match self.mode {
            IndexedDBTxnMode::Readonly => Ok(()),
            IndexedDBTxnMode::Readwrite | IndexedDBTxnMode::Versionchange => {
                self.shared.pending_version.set(None);
                self.shared.end_write("ROLLBACK")
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use storage_traits::indexeddb::IndexedDBKeyType;

    use super::*;
    use crate::indexeddb::engines::IndexEntries;
    use crate::indexeddb::key_codec::encode;

    fn key(n: f64) -> EncodedKey {
        encode(&IndexedDBKeyType::Number(n))
    }

    fn setup(backend: &SqliteBackend) -> Rc<dyn KvsEngine> {
        let engine = backend.open("db").unwrap();
        let mut transaction = engine
            .begin_transaction(&[], IndexedDBTxnMode::Versionchange)
            .unwrap();
        engine.set_version(1).unwrap();
        let mut store = IndexedDBObjectStore {
            name: "store".to_owned(),
            key_path: None,
            has_key_generator: true,
            indexes: BTreeMap::new(),
        };
        store.indexes.insert(
            "by_value".to_owned(),
            IndexedDBIndex {
                name: "by_value".to_owned(),
                key_path: KeyPath::from("v"),
                unique: true,
                multi_entry: false,
            },
        );
        transaction.create_object_store(store).unwrap();
        engine.commit_version().unwrap();
        transaction.commit().unwrap();
        engine
    }

    fn put(transaction: &mut dyn KvsTransaction, n: f64, index_key: f64) -> BackendResult<PutItemResult> {
        transaction.put(
            "store",
            PutRecord {
                key: key(n),
                value: vec![n as u8],
                index_entries: vec![IndexEntries {
                    index_name: "by_value".to_owned(),
                    keys: vec![key(index_key)],
                }],
            },
            true,
        )
    }

    #[test]
    fn schema_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let backend = SqliteBackend::new(dir.path());
            setup(&backend);
        }
        let backend = SqliteBackend::new(dir.path());
        let engine = backend.open("db").unwrap();
        assert_eq!(engine.version().unwrap(), 1);
        let meta = engine.metadata().unwrap();
        let store = meta.object_store("store").unwrap();
        assert!(store.has_key_generator);
        assert!(store.index("by_value").unwrap().unique);
        assert_eq!(
            backend.databases().unwrap(),
            vec![DatabaseInfo {
                name: "db".to_owned(),
                version: 1
            }]
        );
    }

    #[test]
    fn aborted_writer_rolls_back_its_changes() {
        let dir = tempfile::tempdir().unwrap();
        let backend = SqliteBackend::new(dir.path());
        let engine = setup(&backend);
        let scope = vec!["store".to_owned()];

        let mut first = engine
            .begin_transaction(&scope, IndexedDBTxnMode::Readwrite)
            .unwrap();
        put(first.as_mut(), 1.0, 10.0).unwrap();
        first.commit().unwrap();

        let mut second = engine
            .begin_transaction(&scope, IndexedDBTxnMode::Readwrite)
            .unwrap();
        put(second.as_mut(), 1.0, 11.0).unwrap();
        put(second.as_mut(), 2.0, 12.0).unwrap();
        second.maybe_update_key_generator("store", 2.0).unwrap();
        assert_eq!(second.next_auto_increment_key("store").unwrap(), Some(3));
        second.abort().unwrap();

        let reader = engine
            .begin_transaction(&scope, IndexedDBTxnMode::Readonly)
            .unwrap();
        let all = reader
            .get_all("store", &EncodedKeyRange::unbounded(), None)
            .unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].value, vec![1]);
        let entries = reader
            .index_get_all("store", "by_value", &EncodedKeyRange::unbounded(), None, false)
            .unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].key, key(10.0));
        assert_eq!(reader.get_auto_increment_current("store").unwrap(), 1);
    }

    #[test]
    fn writers_run_one_at_a_time() {
        let dir = tempfile::tempdir().unwrap();
        let backend = SqliteBackend::new(dir.path());
        let engine = setup(&backend);
        assert!(!engine.allows_concurrent_writers());

        let writer = engine
            .begin_transaction(&["store".to_owned()], IndexedDBTxnMode::Readwrite)
            .unwrap();
        assert!(engine
            .begin_transaction(&["store".to_owned()], IndexedDBTxnMode::Readwrite)
            .is_err());
        assert!(engine
            .begin_transaction(&[], IndexedDBTxnMode::Versionchange)
            .is_err());
        engine
            .begin_transaction(&["store".to_owned()], IndexedDBTxnMode::Readonly)
            .unwrap();
        writer.commit().unwrap();

        engine
            .begin_transaction(&["store".to_owned()], IndexedDBTxnMode::Readwrite)
            .unwrap()
            .abort()
            .unwrap();
    }

    #[test]
    fn committed_writes_are_visible_to_other_connections() {
        let dir = tempfile::tempdir().unwrap();
        let backend = SqliteBackend::new(dir.path());
        let engine = setup(&backend);
        let path = backend.database_dir("db").join(DB_FILE_NAME);
        let stored_records = || {
            Connection::open(&path)
                .unwrap()
                .query_row("SELECT COUNT(*) FROM object_data", [], |row| row.get::<_, i64>(0))
                .unwrap()
        };

        let mut writer = engine
            .begin_transaction(&["store".to_owned()], IndexedDBTxnMode::Readwrite)
            .unwrap();
        put(writer.as_mut(), 1.0, 10.0).unwrap();
        assert_eq!(stored_records(), 0);
        writer.commit().unwrap();
        assert_eq!(stored_records(), 1);
    }

    #[test]
    fn negative_stored_versions_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let backend = SqliteBackend::new(dir.path());
        drop(setup(&backend));
        let path = backend.database_dir("db").join(DB_FILE_NAME);
        Connection::open(&path)
            .unwrap()
            .execute("UPDATE database SET version = -1", [])
            .unwrap();
        assert!(matches!(
            SqliteBackend::read_info(&path),
            Err(BackendError::DbErr(_))
        ));
        let engine = backend.open("db").unwrap();
        assert!(matches!(engine.version(), Err(BackendError::DbErr(_))));
    }

    #[test]
    fn unique_index_rejects_duplicates() {
        let dir = tempfile::tempdir().unwrap();
        let backend = SqliteBackend::new(dir.path());
        let engine = setup(&backend);
        let mut transaction = engine
            .begin_transaction(&["store".to_owned()], IndexedDBTxnMode::Readwrite)
            .unwrap();
        put(transaction.as_mut(), 1.0, 5.0).unwrap();
        assert!(matches!(
            put(transaction.as_mut(), 2.0, 5.0),
            Err(BackendError::Constraint(_))
        ));
        // Rewriting the same record with the same index key is fine.
        put(transaction.as_mut(), 1.0, 5.0).unwrap();
        transaction.commit().unwrap();
    }

    #[test]
    fn aborted_upgrade_restores_schema() {
        let dir = tempfile::tempdir().unwrap();
        let backend = SqliteBackend::new(dir.path());
        let engine = setup(&backend);
        let mut transaction = engine
            .begin_transaction(&[], IndexedDBTxnMode::Versionchange)
            .unwrap();
        engine.set_version(2).unwrap();
        transaction.delete_object_store("store").unwrap();
        assert!(engine.metadata().unwrap().object_stores.is_empty());
        transaction.abort().unwrap();
        assert_eq!(engine.version().unwrap(), 1);
        assert!(engine.metadata().unwrap().object_store("store").is_some());
    }

    #[test]
    fn delete_database_removes_files() {
        let dir = tempfile::tempdir().unwrap();
        let backend = SqliteBackend::new(dir.path());
        drop(setup(&backend));
        assert_eq!(backend.delete_database("db").unwrap(), 1);
        assert!(backend.databases().unwrap().is_empty());
        assert_eq!(backend.delete_database("db").unwrap(), 0);
    }
}
