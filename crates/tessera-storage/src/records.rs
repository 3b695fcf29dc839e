//! Schema and contract records
//!
//! Struct definitions keep their full history and survive renames through
//! forwarding entries. Deleting a struct or contract moves it into a tombstone
//! file instead of erasing it. All four record files are plain bincode maps
//! stored at the partition root and written through the session transaction.

use crate::tlru::TlruCache;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tessera_common::{Error, Result, encode_component};

pub const STRUCTS_FILE: &str = "structs";
pub const STRUCT_TOMBSTONES_FILE: &str = "struct_tombstones";
pub const CONTRACTS_FILE: &str = "contracts";
pub const CONTRACT_TOMBSTONES_FILE: &str = "contract_tombstones";

/// Directory holding the rows of all structs
pub const TABLES_DIR: &str = "tables";

/// Partition-relative directory of a struct's rows
///
/// Components carry a one-letter prefix so an empty name or key still maps
/// to its own path component.
pub fn table_dir(struct_name: &str) -> String {
    format!("{TABLES_DIR}/s{}", encode_component(struct_name.as_bytes()))
}

/// Partition-relative path of one row
pub fn object_path(struct_name: &str, key: &[u8]) -> String {
    format!("{}/k{}", table_dir(struct_name), encode_component(key))
}

pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    bincode::serialize(value).map_err(|e| Error::Serialization(e.to_string()))
}

pub fn decode<T: DeserializeOwned>(data: &[u8]) -> Result<T> {
    bincode::deserialize(data).map_err(|e| Error::Deserialization(e.to_string()))
}

/// One version of a struct definition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StructDef {
    pub name: String,
    /// Opaque compiled definition
    pub body: Vec<u8>,
}

impl StructDef {
    pub fn new(name: impl Into<String>, body: impl Into<Vec<u8>>) -> Self {
        Self {
            name: name.into(),
            body: body.into(),
        }
    }
}

/// A contract (executable logic) definition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContractDef {
    pub name: String,
    /// Opaque compiled logic
    pub body: Vec<u8>,
}

impl ContractDef {
    pub fn new(name: impl Into<String>, body: impl Into<Vec<u8>>) -> Self {
        Self {
            name: name.into(),
            body: body.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
enum StructEntry {
    /// History of a live struct, oldest first
    Current(Vec<StructDef>),
    /// Forwarding entry left behind by a rename
    Renamed(String),
}

/// Live struct definitions keyed by name
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StructCatalog {
    entries: BTreeMap<String, StructEntry>,
}

impl StructCatalog {
    /// Follow rename forwarding from `key` to the live name
    fn resolve<'a>(&'a self, key: &'a str) -> Option<&'a str> {
        let mut name = key;
        // A chain can never be longer than the catalog
        for _ in 0..=self.entries.len() {
            match self.entries.get(name)? {
                StructEntry::Current(_) => return Some(name),
                StructEntry::Renamed(to) => name = to.as_str(),
            }
        }
        None
    }

    /// Live name reached from `key` by following renames
    pub fn live_name(&self, key: &str) -> Option<&str> {
        let name = self.resolve(key)?;
        self.entries.get_key_value(name).map(|(name, _)| name.as_str())
    }

    /// History of the struct reachable from `key`, oldest first
    pub fn get(&self, key: &str) -> Option<&[StructDef]> {
        let name = self.resolve(key)?;
        match self.entries.get(name)? {
            StructEntry::Current(history) => Some(history),
            StructEntry::Renamed(_) => None,
        }
    }

    /// Record a new version of `def`, optionally renamed from `renamed_from`
    ///
    /// A rename carries the old history over and leaves a forwarding entry
    /// for the old name.
    pub fn write(&mut self, def: StructDef, renamed_from: Option<&str>) -> Result<()> {
        let source = match renamed_from {
            Some(old) => {
                let live = self.resolve(old).ok_or_else(|| Error::RecordNotFound {
                    kind: "struct",
                    key: old.to_string(),
                })?;
                (live != def.name).then(|| live.to_string())
            }
            None => None,
        };

        let mut history = match &source {
            Some(old) => match self.entries.remove(old) {
                Some(StructEntry::Current(history)) => history,
                _ => Vec::new(),
            },
            None => match self.entries.remove(&def.name) {
                Some(StructEntry::Current(history)) => history,
                _ => Vec::new(),
            },
        };

        let name = def.name.clone();
        history.push(def);
        self.entries
            .insert(name.clone(), StructEntry::Current(history));
        if let Some(old) = source {
            self.entries.insert(old, StructEntry::Renamed(name));
        }
        Ok(())
    }

    /// Remove the live struct named `key`
    ///
    /// Former names are not accepted. Returns the name, its history and
    /// every name that forwarded to it.
    pub fn remove(&mut self, key: &str) -> Option<(String, Vec<StructDef>, Vec<String>)> {
        if !matches!(self.entries.get(key)?, StructEntry::Current(_)) {
            return None;
        }
        let name = key.to_string();
        let Some(StructEntry::Current(history)) = self.entries.remove(&name) else {
            return None;
        };

        let aliases: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, entry)| matches!(entry, StructEntry::Renamed(_)))
            .map(|(alias, _)| alias.clone())
            .filter(|alias| self.resolve_removed(alias, &name))
            .collect();
        for alias in &aliases {
            self.entries.remove(alias);
        }
        Some((name, history, aliases))
    }

    /// Whether forwarding from `alias` ends at the removed `name`
    fn resolve_removed(&self, alias: &str, name: &str) -> bool {
        let mut current = alias;
        for _ in 0..=self.entries.len() {
            match self.entries.get(current) {
                Some(StructEntry::Renamed(to)) if to == name => return true,
                Some(StructEntry::Renamed(to)) => current = to.as_str(),
                _ => return false,
            }
        }
        false
    }

    /// Latest version of every live struct
    pub fn latest(&self) -> Vec<StructDef> {
        self.entries
            .values()
            .filter_map(|entry| match entry {
                StructEntry::Current(history) => history.last().cloned(),
                StructEntry::Renamed(_) => None,
            })
            .collect()
    }
}

/// Deleted structs
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StructTombstones {
    /// Former names mapped to the name the struct had when deleted
    pub renames: BTreeMap<String, String>,
    /// History of each deleted struct, keyed by final name
    pub structs: BTreeMap<String, Vec<StructDef>>,
}

impl StructTombstones {
    pub fn bury(&mut self, name: String, history: Vec<StructDef>, aliases: Vec<String>) {
        for alias in aliases {
            self.renames.insert(alias, name.clone());
        }
        self.structs.insert(name, history);
    }

    /// Latest version of every deleted struct
    pub fn latest(&self) -> Vec<StructDef> {
        self.structs
            .values()
            .filter_map(|history| history.last().cloned())
            .collect()
    }
}

/// Live contracts keyed by name
pub type ContractCatalog = BTreeMap<String, ContractDef>;

/// Deleted contracts keyed by name
pub type ContractTombstones = BTreeMap<String, ContractDef>;

/// Decoded record maps cached per partition directory name
pub struct RecordCache {
    pub structs: TlruCache<String, Arc<StructCatalog>>,
    pub contracts: TlruCache<String, Arc<ContractCatalog>>,
}

impl RecordCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            structs: TlruCache::new(ttl),
            contracts: TlruCache::new(ttl),
        }
    }

    pub fn invalidate(&self, partition: &str) {
        self.structs.delete(partition);
        self.contracts.delete(partition);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn def(name: &str, body: &str) -> StructDef {
        StructDef::new(name, body.as_bytes())
    }

    #[test]
    fn test_write_appends_history() {
        let mut catalog = StructCatalog::default();
        catalog.write(def("user", "v1"), None).unwrap();
        catalog.write(def("user", "v2"), None).unwrap();

        let history = catalog.get("user").unwrap();
        assert_eq!(history, &[def("user", "v1"), def("user", "v2")]);
        assert_eq!(catalog.latest(), vec![def("user", "v2")]);
    }

    #[test]
    fn test_rename_forwards() {
        let mut catalog = StructCatalog::default();
        catalog.write(def("user", "v1"), None).unwrap();
        catalog.write(def("account", "v2"), Some("user")).unwrap();
        catalog.write(def("member", "v3"), Some("user")).unwrap();

        let history = catalog.get("user").unwrap();
        assert_eq!(history.len(), 3);
        assert_eq!(history[2].name, "member");
        assert_eq!(catalog.get("account").unwrap().len(), 3);
        assert_eq!(catalog.latest(), vec![def("member", "v3")]);
    }

    #[test]
    fn test_rename_from_unknown() {
        let mut catalog = StructCatalog::default();
        let err = catalog.write(def("b", "v"), Some("a")).unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_reuse_forwarded_name() {
        let mut catalog = StructCatalog::default();
        catalog.write(def("a", "v1"), None).unwrap();
        catalog.write(def("b", "v2"), Some("a")).unwrap();
        // "a" becomes an independent struct again
        catalog.write(def("a", "fresh"), None).unwrap();

        assert_eq!(catalog.get("a").unwrap(), &[def("a", "fresh")]);
        assert_eq!(catalog.get("b").unwrap().len(), 2);
    }

    #[test]
    fn test_remove_collects_aliases() {
        let mut catalog = StructCatalog::default();
        catalog.write(def("a", "1"), None).unwrap();
        catalog.write(def("b", "2"), Some("a")).unwrap();
        catalog.write(def("c", "3"), Some("b")).unwrap();
        catalog.write(def("other", "x"), None).unwrap();

        // A former name does not address the struct
        assert!(catalog.remove("a").is_none());
        assert_eq!(catalog.get("a").unwrap().len(), 3);

        let (name, history, mut aliases) = catalog.remove("c").unwrap();
        aliases.sort();
        assert_eq!(name, "c");
        assert_eq!(history.len(), 3);
        assert_eq!(aliases, vec!["a", "b"]);
        assert!(catalog.get("a").is_none());
        assert_eq!(catalog.latest(), vec![def("other", "x")]);

        let mut tombstones = StructTombstones::default();
        tombstones.bury(name, history, aliases);
        assert_eq!(tombstones.renames.get("a").map(String::as_str), Some("c"));
        assert_eq!(tombstones.latest(), vec![def("c", "3")]);
    }

    #[test]
    fn test_codec() {
        let mut catalog = StructCatalog::default();
        catalog.write(def("a", "1"), None).unwrap();
        let decoded: StructCatalog = decode(&encode(&catalog).unwrap()).unwrap();
        assert_eq!(decoded, catalog);
        assert!(decode::<StructCatalog>(b"\xff\xff").is_err());
    }

    #[test]
    fn test_object_paths_are_single_components() {
        let path = object_path("a/b", b"../key");
        let parts: Vec<&str> = path.split('/').collect();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0], TABLES_DIR);
        assert!(tessera_common::RelPath::new(&path).is_ok());
    }

    #[test]
    fn test_empty_names_keep_their_own_component() {
        let table = tessera_common::RelPath::new(table_dir("")).unwrap();
        assert_ne!(table.as_str(), TABLES_DIR);
        assert_eq!(table.as_str().split('/').count(), 2);

        let row = tessera_common::RelPath::new(object_path("s", b"")).unwrap();
        assert_ne!(row.as_str(), table_dir("s"));
        assert_eq!(row.as_str().split('/').count(), 3);
        assert!(row.starts_with(&tessera_common::RelPath::new(table_dir("s")).unwrap()));
    }
}
