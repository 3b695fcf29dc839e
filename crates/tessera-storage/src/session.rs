//! Sessions
//!
//! A session is the unit of work handed to callers. It owns a partition
//! lease, a live [`Transaction`] and the named locks it has taken for record
//! level exclusion. Schema-write sessions hold the partition exclusively;
//! ordinary sessions share it and serialize on named locks instead.
//!
//! `commit` and `rollback` end the current transaction and start a fresh one.
//! `close` (also run on drop) rolls back uncommitted work, then releases the
//! named locks, then the partition.

use crate::engine::EngineInner;
use crate::journal::Transaction;
use crate::named_lock::NamedLockGuard;
use crate::partition::PartitionLease;
use crate::records::{
    CONTRACT_TOMBSTONES_FILE, CONTRACTS_FILE, ContractCatalog, ContractDef, ContractTombstones,
    STRUCT_TOMBSTONES_FILE, STRUCTS_FILE, StructCatalog, StructDef, StructTombstones, decode,
    encode, object_path, table_dir,
};
use bytes::Bytes;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::sync::Arc;
use tessera_common::{Error, PartitionName, RelPath, Result};
use tracing::{debug, warn};
use uuid::Uuid;

/// Record kinds this session has mutated in its current transaction
#[derive(Debug, Default, Clone, Copy)]
struct Touched {
    structs: bool,
    contracts: bool,
}

/// A named lock as stored in the registry plus a readable label
struct LockName {
    key: String,
    label: String,
}

pub struct Session {
    engine: Arc<EngineInner>,
    lease: Option<PartitionLease>,
    txn: Transaction,
    locks: HashMap<String, NamedLockGuard>,
    schema_write: bool,
    touched: Touched,
}

impl Session {
    pub(crate) fn new(engine: Arc<EngineInner>, lease: PartitionLease, schema_write: bool) -> Self {
        let txn = Transaction::begin(lease.dir(), engine.files.clone());
        debug!(
            "Opened {} session on partition {}",
            if schema_write { "schema-write" } else { "data" },
            lease.name()
        );
        Self {
            engine,
            lease: Some(lease),
            txn,
            locks: HashMap::new(),
            schema_write,
            touched: Touched::default(),
        }
    }

    fn lease(&self) -> Result<&PartitionLease> {
        self.lease.as_ref().ok_or(Error::SessionClosed)
    }

    fn require_schema_write(&self) -> Result<()> {
        self.lease()?;
        if !self.schema_write {
            return Err(Error::ReadOnlySession);
        }
        Ok(())
    }

    pub fn partition(&self) -> Result<&PartitionName> {
        Ok(self.lease()?.name())
    }

    pub fn is_schema_write(&self) -> bool {
        self.schema_write
    }

    pub fn is_closed(&self) -> bool {
        self.lease.is_none()
    }

    /// Identifier of the current transaction
    pub fn transaction_id(&self) -> Uuid {
        self.txn.id()
    }

    /// Apply everything done since the last commit or rollback
    ///
    /// A failure after the commit decision is escalated by the engine.
    pub fn commit(&mut self) -> Result<()> {
        self.lease()?;
        let result = self.txn.commit();
        self.restart();
        result.map_err(|e| self.engine.escalate(e))
    }

    /// Discard everything done since the last commit or rollback
    pub fn rollback(&mut self) -> Result<()> {
        self.lease()?;
        let result = self.txn.rollback();
        self.restart();
        result
    }

    /// Roll back, release named locks, release the partition
    pub fn close(&mut self) -> Result<()> {
        let Some(lease) = self.lease.take() else {
            return Ok(());
        };

        let result = match self.txn.rollback() {
            Err(Error::TransactionTerminated(_)) => Ok(()),
            other => other,
        };
        self.invalidate_touched(&lease.dir_name());
        self.locks.clear();
        debug!("Closed session on partition {}", lease.name());
        drop(lease);
        result
    }

    fn restart(&mut self) {
        if let Some(lease) = &self.lease {
            let partition = lease.dir_name();
            let txn = Transaction::begin(lease.dir(), self.engine.files.clone());
            self.invalidate_touched(&partition);
            self.txn = txn;
        }
    }

    fn invalidate_touched(&mut self, partition: &str) {
        if self.touched.structs {
            self.engine.records.structs.delete(partition);
        }
        if self.touched.contracts {
            self.engine.records.contracts.delete(partition);
        }
        self.touched = Touched::default();
    }

    // Named locks

    fn object_locks(&self, struct_name: &str, keys: &[&str]) -> Result<Vec<LockName>> {
        let partition = self.lease()?.dir_name();
        Ok(keys
            .iter()
            .map(|key| LockName {
                key: format!("{partition}\0o\0{struct_name}\0{key}"),
                label: format!("{struct_name}/{key}"),
            })
            .collect())
    }

    fn struct_locks(&self, names: &[&str]) -> Result<Vec<LockName>> {
        let partition = self.lease()?.dir_name();
        Ok(names
            .iter()
            .map(|name| LockName {
                key: format!("{partition}\0s\0{name}"),
                label: (*name).to_string(),
            })
            .collect())
    }

    /// Take locks in key order so sessions never wait on each other in a cycle
    fn acquire(&mut self, mut names: Vec<LockName>, exclusive: bool) {
        names.sort_by(|a, b| a.key.cmp(&b.key));
        names.dedup_by(|a, b| a.key == b.key);

        for name in names {
            match self.locks.get(&name.key) {
                Some(held) if held.is_write() || !exclusive => continue,
                // Upgrading drops the shared hold first
                Some(_) => {
                    self.locks.remove(&name.key);
                }
                None => {}
            }
            let guard = if exclusive {
                self.engine.named_locks.write(&name.key)
            } else {
                self.engine.named_locks.read(&name.key)
            };
            self.locks.insert(name.key, guard);
        }
    }

    fn release(&mut self, names: Vec<LockName>, exclusive: bool) -> Result<()> {
        for name in &names {
            match self.locks.get(&name.key) {
                Some(held) if held.is_write() == exclusive => {}
                _ => return Err(Error::LockNotHeld(name.label.clone())),
            }
        }
        for name in names {
            self.locks.remove(&name.key);
        }
        Ok(())
    }

    pub fn acquire_struct_object_write_lock(&mut self, struct_name: &str, keys: &[&str]) -> Result<()> {
        let names = self.object_locks(struct_name, keys)?;
        self.acquire(names, true);
        Ok(())
    }

    pub fn acquire_struct_object_read_lock(&mut self, struct_name: &str, keys: &[&str]) -> Result<()> {
        let names = self.object_locks(struct_name, keys)?;
        self.acquire(names, false);
        Ok(())
    }

    pub fn release_struct_object_write_lock(&mut self, struct_name: &str, keys: &[&str]) -> Result<()> {
        let names = self.object_locks(struct_name, keys)?;
        self.release(names, true)
    }

    pub fn release_struct_object_read_lock(&mut self, struct_name: &str, keys: &[&str]) -> Result<()> {
        let names = self.object_locks(struct_name, keys)?;
        self.release(names, false)
    }

    pub fn acquire_struct_write_lock(&mut self, names: &[&str]) -> Result<()> {
        let names = self.struct_locks(names)?;
        self.acquire(names, true);
        Ok(())
    }

    pub fn acquire_struct_read_lock(&mut self, names: &[&str]) -> Result<()> {
        let names = self.struct_locks(names)?;
        self.acquire(names, false);
        Ok(())
    }

    pub fn release_struct_write_lock(&mut self, names: &[&str]) -> Result<()> {
        let names = self.struct_locks(names)?;
        self.release(names, true)
    }

    pub fn release_struct_read_lock(&mut self, names: &[&str]) -> Result<()> {
        let names = self.struct_locks(names)?;
        self.release(names, false)
    }

    /// Number of named locks currently held
    pub fn held_locks(&self) -> usize {
        self.locks.len()
    }

    /// Fail unless the object, or its whole struct, is locked in a usable mode
    fn require_lock(&self, struct_name: &str, key: &str, exclusive: bool) -> Result<()> {
        let candidates = self
            .object_locks(struct_name, &[key])?
            .into_iter()
            .chain(self.struct_locks(&[struct_name])?);
        for name in candidates {
            if let Some(held) = self.locks.get(&name.key) {
                if held.is_write() || !exclusive {
                    return Ok(());
                }
            }
        }
        Err(Error::LockNotHeld(format!("{struct_name}/{key}")))
    }

    // Data objects

    fn object_rel(struct_name: &str, key: &str) -> Result<RelPath> {
        RelPath::new(object_path(struct_name, key.as_bytes()))
    }

    fn object_not_found(struct_name: &str, key: &str) -> Error {
        Error::RecordNotFound {
            kind: "object",
            key: format!("{struct_name}/{key}"),
        }
    }

    /// Stage a row; needs the object or struct write lock
    pub fn write_object(&mut self, struct_name: &str, key: &str, data: &[u8]) -> Result<()> {
        self.require_lock(struct_name, key, true)?;
        let rel = Self::object_rel(struct_name, key)?;
        self.txn.write_file(&rel, data)
    }

    /// Read a row; needs any lock on the object or its struct
    pub fn read_object(&self, struct_name: &str, key: &str) -> Result<Bytes> {
        self.require_lock(struct_name, key, false)?;
        let rel = Self::object_rel(struct_name, key)?;
        self.txn.read_file(&rel).map_err(|e| {
            if e.is_not_found() {
                Self::object_not_found(struct_name, key)
            } else {
                e
            }
        })
    }

    pub fn delete_object(&mut self, struct_name: &str, key: &str) -> Result<()> {
        self.require_lock(struct_name, key, true)?;
        let rel = Self::object_rel(struct_name, key)?;
        if !self.txn.exists(&rel)? {
            return Err(Self::object_not_found(struct_name, key));
        }
        self.txn.delete(&rel)
    }

    // Records

    fn read_record<T: DeserializeOwned + Default>(&self, file: &str) -> Result<T> {
        match self.txn.read_file(&RelPath::new(file)?) {
            Ok(data) => decode(&data),
            Err(e) if e.is_not_found() => Ok(T::default()),
            Err(e) => Err(e),
        }
    }

    fn write_record<T: Serialize>(&mut self, file: &str, value: &T) -> Result<()> {
        self.txn.write_file(&RelPath::new(file)?, &encode(value)?)
    }

    /// Decoded struct catalog; shared with other sessions until this one
    /// mutates it
    fn struct_catalog(&self) -> Result<Arc<StructCatalog>> {
        let partition = self.lease()?.dir_name();
        let shared = !self.touched.structs;
        if shared {
            if let Some(catalog) = self.engine.records.structs.get(&partition) {
                return Ok(catalog);
            }
        }

        let catalog = Arc::new(self.read_record::<StructCatalog>(STRUCTS_FILE)?);
        if shared {
            self.engine
                .records
                .structs
                .set(partition, Arc::clone(&catalog));
        }
        Ok(catalog)
    }

    fn contract_catalog(&self) -> Result<Arc<ContractCatalog>> {
        let partition = self.lease()?.dir_name();
        let shared = !self.touched.contracts;
        if shared {
            if let Some(catalog) = self.engine.records.contracts.get(&partition) {
                return Ok(catalog);
            }
        }

        let catalog = Arc::new(self.read_record::<ContractCatalog>(CONTRACTS_FILE)?);
        if shared {
            self.engine
                .records
                .contracts
                .set(partition, Arc::clone(&catalog));
        }
        Ok(catalog)
    }

    /// History of a struct (oldest first), following renames
    pub fn get_struct(&self, key: &str) -> Result<Vec<StructDef>> {
        self.struct_catalog()?
            .get(key)
            .map(<[StructDef]>::to_vec)
            .ok_or_else(|| Error::RecordNotFound {
                kind: "struct",
                key: key.to_string(),
            })
    }

    /// Latest definition of every live struct
    pub fn structs(&self) -> Result<Vec<StructDef>> {
        Ok(self.struct_catalog()?.latest())
    }

    pub fn write_struct(&mut self, def: StructDef, renamed_from: Option<&str>) -> Result<()> {
        self.require_schema_write()?;
        let mut catalog = (*self.struct_catalog()?).clone();
        let moved_from = renamed_from
            .and_then(|old| catalog.live_name(old))
            .filter(|live| *live != def.name)
            .map(str::to_string);
        let name = def.name.clone();

        catalog.write(def, renamed_from)?;
        self.write_record(STRUCTS_FILE, &catalog)?;

        // Rows follow the struct to its new name
        if let Some(old) = moved_from {
            let target = RelPath::new(table_dir(&name))?;
            self.txn.delete_all(&target)?;
            self.txn.rename(&RelPath::new(table_dir(&old))?, &target)?;
        }
        self.touched.structs = true;
        Ok(())
    }

    /// Move a struct to the tombstones and drop its rows
    pub fn delete_struct(&mut self, key: &str) -> Result<()> {
        self.require_schema_write()?;
        let mut catalog = (*self.struct_catalog()?).clone();
        let (name, history, aliases) =
            catalog
                .remove(key)
                .ok_or_else(|| Error::RecordNotFound {
                    kind: "struct",
                    key: key.to_string(),
                })?;

        let mut tombstones: StructTombstones = self.read_record(STRUCT_TOMBSTONES_FILE)?;
        let table = RelPath::new(table_dir(&name))?;
        tombstones.bury(name, history, aliases);

        self.write_record(STRUCTS_FILE, &catalog)?;
        self.write_record(STRUCT_TOMBSTONES_FILE, &tombstones)?;
        self.txn.delete_all(&table)?;
        self.touched.structs = true;
        Ok(())
    }

    pub fn struct_tombstones(&self) -> Result<StructTombstones> {
        self.lease()?;
        self.read_record(STRUCT_TOMBSTONES_FILE)
    }

    pub fn get_contract(&self, name: &str) -> Result<ContractDef> {
        self.contract_catalog()?
            .get(name)
            .cloned()
            .ok_or_else(|| Error::RecordNotFound {
                kind: "contract",
                key: name.to_string(),
            })
    }

    pub fn contracts(&self) -> Result<Vec<ContractDef>> {
        Ok(self.contract_catalog()?.values().cloned().collect())
    }

    /// Create or replace a contract, reviving it from the tombstones if needed
    pub fn write_contract(&mut self, def: ContractDef) -> Result<()> {
        self.require_schema_write()?;
        let mut catalog = (*self.contract_catalog()?).clone();
        let mut tombstones: ContractTombstones = self.read_record(CONTRACT_TOMBSTONES_FILE)?;

        let revived = tombstones.remove(&def.name).is_some();
        catalog.insert(def.name.clone(), def);

        self.write_record(CONTRACTS_FILE, &catalog)?;
        if revived {
            self.write_record(CONTRACT_TOMBSTONES_FILE, &tombstones)?;
        }
        self.touched.contracts = true;
        Ok(())
    }

    pub fn delete_contract(&mut self, name: &str) -> Result<()> {
        self.require_schema_write()?;
        let mut catalog = (*self.contract_catalog()?).clone();
        let def = catalog.remove(name).ok_or_else(|| Error::RecordNotFound {
            kind: "contract",
            key: name.to_string(),
        })?;

        let mut tombstones: ContractTombstones = self.read_record(CONTRACT_TOMBSTONES_FILE)?;
        tombstones.insert(def.name.clone(), def);

        self.write_record(CONTRACTS_FILE, &catalog)?;
        self.write_record(CONTRACT_TOMBSTONES_FILE, &tombstones)?;
        self.touched.contracts = true;
        Ok(())
    }

    pub fn contract_tombstones(&self) -> Result<Vec<ContractDef>> {
        self.lease()?;
        let tombstones: ContractTombstones = self.read_record(CONTRACT_TOMBSTONES_FILE)?;
        Ok(tombstones.into_values().collect())
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!("Failed to close session cleanly: {}", e);
        }
    }
}
