//! Transaction journal over a partition directory
//!
//! Every mutation is recorded as one action file and, for creates, one staged
//! blob, before anything touches the partition tree. Commit writes a decision
//! marker and then redoes the actions in sequence order, deleting each action
//! file once its effect is on disk. A crash at any point leaves either no
//! marker (discard on recovery) or a marker plus the actions still to apply.
//!
//! Layout:
//! ```text
//! <partition>/transactions/<uuid>/
//!     0.J, 1.J, ...     journal actions
//!     staging/<seq>     content of the create action <seq>
//!     C                 commit decision marker
//! ```
//!
//! Action record format:
//! ```text
//! +--------+--------+-----------------+--------+
//! | Magic  | Length | Action (bincode)| CRC32C |
//! | 4B     | 4B     | var             | 4B     |
//! +--------+--------+-----------------+--------+
//! ```

use crate::middleware::FileStore;
use crate::safe_io::{remove_all, remove_file_if_exists, sync_dir, write_file};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tessera_common::{Error, RelPath, Result, TRANSACTIONS_DIR};
use tracing::debug;
use uuid::Uuid;

/// Commit decision marker file name
pub const COMMIT_MARKER: &str = "C";

/// Journal action record magic number
const ACTION_MAGIC: u32 = 0x544A524E; // "TJRN"

/// Magic + length
const ACTION_HEADER_SIZE: usize = 8;

const ACTION_EXT: &str = ".J";
const STAGING_DIR: &str = "staging";

fn read_u32(data: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([data[at], data[at + 1], data[at + 2], data[at + 3]])
}

/// Kind of filesystem mutation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActionKind {
    /// Move the staged blob to `path`
    Create,
    /// Remove a file or empty directory
    Delete,
    /// Remove a whole subtree
    DeleteAll,
    /// Rename `path` to `target`
    Rename,
    Mkdir,
    MkdirAll,
}

/// One durably recorded mutation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JournalAction {
    pub seq: u64,
    pub kind: ActionKind,
    pub path: RelPath,
    /// Rename destination
    pub target: Option<RelPath>,
}

impl JournalAction {
    /// Serialize into a framed, checksummed record
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let payload = bincode::serialize(self).map_err(|e| Error::Serialization(e.to_string()))?;

        let mut buf = Vec::with_capacity(ACTION_HEADER_SIZE + payload.len() + 4);
        buf.extend_from_slice(&ACTION_MAGIC.to_le_bytes());
        buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        buf.extend_from_slice(&payload);
        let crc = crc32c::crc32c(&buf);
        buf.extend_from_slice(&crc.to_le_bytes());
        Ok(buf)
    }

    /// Parse and verify a framed record
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < ACTION_HEADER_SIZE + 4 {
            return Err(Error::corruption("journal action too small"));
        }
        if read_u32(data, 0) != ACTION_MAGIC {
            return Err(Error::corruption("invalid journal action magic"));
        }

        let len = read_u32(data, 4) as usize;
        let end = ACTION_HEADER_SIZE + len;
        if data.len() != end + 4 {
            return Err(Error::corruption("journal action truncated"));
        }

        let computed = crc32c::crc32c(&data[..end]);
        if computed != read_u32(data, end) {
            return Err(Error::corruption("journal action CRC mismatch"));
        }

        bincode::deserialize(&data[ACTION_HEADER_SIZE..end])
            .map_err(|e| Error::corruption(format!("journal action payload: {e}")))
    }
}

/// How benign a missing staged blob is during replay
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReplayMode {
    /// Every blob must still be staged
    FirstCommit,
    /// A missing blob means its create was applied before the crash
    Recovery,
}

fn tolerate(result: io::Result<()>, benign: &[io::ErrorKind]) -> io::Result<()> {
    match result {
        Err(e) if benign.contains(&e.kind()) => {
            debug!("Ignoring replay race: {}", e);
            Ok(())
        }
        other => other,
    }
}

/// Remove a file or an empty directory
fn remove_entry(path: &Path) -> io::Result<()> {
    if fs::symlink_metadata(path)?.is_dir() {
        fs::remove_dir(path)
    } else {
        fs::remove_file(path)
    }
}

/// A unit of durable work against one partition directory
pub struct Transaction {
    id: Uuid,
    /// Partition directory name, used as the cache partition key
    partition: String,
    /// Partition directory
    root: PathBuf,
    /// Transaction folder, created on first mutation
    dir: PathBuf,
    actions: Vec<JournalAction>,
    next_seq: u64,
    created: bool,
    terminal: bool,
    files: FileStore,
}

impl Transaction {
    /// Start a new transaction on the partition at `root`
    pub fn begin(root: &Path, files: FileStore) -> Self {
        Self::with_id(Uuid::new_v4(), root, files)
    }

    fn with_id(id: Uuid, root: &Path, files: FileStore) -> Self {
        let partition = root
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        Self {
            id,
            partition,
            root: root.to_path_buf(),
            dir: root.join(TRANSACTIONS_DIR).join(id.to_string()),
            actions: Vec::new(),
            next_seq: 0,
            created: false,
            terminal: false,
            files,
        }
    }

    /// Reconstruct a transaction from its folder
    pub(crate) fn load(dir: &Path, root: &Path, files: FileStore) -> Result<Self> {
        let name = dir
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| Error::corruption(format!("bad transaction folder {dir:?}")))?;
        let id = Uuid::parse_str(name)
            .map_err(|e| Error::corruption(format!("bad transaction folder {name}: {e}")))?;

        let mut txn = Self::with_id(id, root, files);
        txn.created = true;

        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let file_name = entry.file_name();
            let Some(seq) = file_name
                .to_str()
                .and_then(|n| n.strip_suffix(ACTION_EXT))
                .and_then(|n| n.parse::<u64>().ok())
            else {
                continue;
            };

            let action = JournalAction::from_bytes(&fs::read(entry.path())?)?;
            if action.seq != seq {
                return Err(Error::corruption(format!(
                    "journal action {} stored as {:?}",
                    action.seq, file_name
                )));
            }
            txn.actions.push(action);
        }

        txn.actions.sort_by_key(|a| a.seq);
        txn.next_seq = txn.actions.last().map_or(0, |a| a.seq + 1);
        Ok(txn)
    }

    /// Whether the folder at `dir` carries a commit decision
    pub fn is_committed(dir: &Path) -> bool {
        dir.join(COMMIT_MARKER).exists()
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn is_terminal(&self) -> bool {
        self.terminal
    }

    /// Pending actions in sequence order
    pub fn actions(&self) -> &[JournalAction] {
        &self.actions
    }

    /// Transaction folder (may not exist yet)
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn ensure_live(&self) -> Result<()> {
        if self.terminal {
            return Err(Error::TransactionTerminated(self.id.to_string()));
        }
        Ok(())
    }

    fn ensure_dir(&mut self) -> Result<()> {
        if !self.created {
            fs::create_dir_all(self.dir.join(STAGING_DIR))?;
            sync_dir(&self.root.join(TRANSACTIONS_DIR), self.files.sync())?;
            self.created = true;
        }
        Ok(())
    }

    fn action_path(&self, seq: u64) -> PathBuf {
        self.dir.join(format!("{seq}{ACTION_EXT}"))
    }

    fn blob_path(&self, seq: u64) -> PathBuf {
        self.dir.join(STAGING_DIR).join(seq.to_string())
    }

    fn append(&mut self, kind: ActionKind, path: &RelPath, target: Option<&RelPath>) -> Result<()> {
        self.ensure_live()?;
        self.ensure_dir()?;

        let action = JournalAction {
            seq: self.next_seq,
            kind,
            path: path.clone(),
            target: target.cloned(),
        };
        write_file(
            &self.action_path(action.seq),
            &action.to_bytes()?,
            self.files.sync(),
        )?;

        self.next_seq += 1;
        self.actions.push(action);
        Ok(())
    }

    /// Stage `data` as the new content of `rel`
    pub fn write_file(&mut self, rel: &RelPath, data: &[u8]) -> Result<()> {
        self.ensure_live()?;
        self.ensure_dir()?;
        write_file(&self.blob_path(self.next_seq), data, self.files.sync())?;
        self.append(ActionKind::Create, rel, None)
    }

    pub fn delete(&mut self, rel: &RelPath) -> Result<()> {
        self.append(ActionKind::Delete, rel, None)
    }

    pub fn delete_all(&mut self, rel: &RelPath) -> Result<()> {
        self.append(ActionKind::DeleteAll, rel, None)
    }

    pub fn rename(&mut self, old: &RelPath, new: &RelPath) -> Result<()> {
        self.append(ActionKind::Rename, old, Some(new))
    }

    pub fn mkdir(&mut self, rel: &RelPath) -> Result<()> {
        self.append(ActionKind::Mkdir, rel, None)
    }

    pub fn mkdir_all(&mut self, rel: &RelPath) -> Result<()> {
        self.append(ActionKind::MkdirAll, rel, None)
    }

    /// Read `rel` as this transaction sees it
    ///
    /// Pending actions are resolved newest first; paths untouched by the
    /// transaction are read from the partition through the file middleware.
    pub fn read_file(&self, rel: &RelPath) -> Result<Bytes> {
        self.ensure_live()?;
        let not_found = || Error::NotFound(rel.to_string());

        let mut target = rel.clone();
        for action in self.actions.iter().rev() {
            match action.kind {
                ActionKind::Create if action.path == target => {
                    return fs::read(self.blob_path(action.seq))
                        .map(Bytes::from)
                        .map_err(Error::from);
                }
                ActionKind::Delete | ActionKind::DeleteAll if target.starts_with(&action.path) => {
                    return Err(not_found());
                }
                ActionKind::Rename => {
                    let Some(to) = &action.target else { continue };
                    if let Some(source) = target.rebase(to, &action.path) {
                        target = source;
                    } else if target.starts_with(&action.path) {
                        return Err(not_found());
                    }
                }
                _ => {}
            }
        }

        self.files
            .read(&self.partition, target.as_str(), &target.to_path(&self.root))
            .map_err(|e| if e.is_not_found() { not_found() } else { e })
    }

    /// Whether `rel` exists as this transaction sees it
    pub fn exists(&self, rel: &RelPath) -> Result<bool> {
        match self.read_file(rel) {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Durably apply every action to the partition
    ///
    /// An error returned after the decision marker is written is a
    /// [`Error::JournalReplay`]; the partition is then only consistent again
    /// after recovery.
    pub fn commit(&mut self) -> Result<()> {
        self.ensure_live()?;
        if self.actions.is_empty() {
            self.terminal = true;
            return self.discard();
        }

        self.write_marker()?;
        self.replay(ReplayMode::FirstCommit, usize::MAX)?;
        self.finish()
    }

    /// Discard all staged work
    pub fn rollback(&mut self) -> Result<()> {
        self.ensure_live()?;
        self.terminal = true;
        self.discard()?;
        debug!("Rolled back transaction {}", self.id);
        Ok(())
    }

    /// Finish a decided transaction found by recovery
    pub(crate) fn resume(&mut self) -> Result<()> {
        self.ensure_live()?;
        self.replay(ReplayMode::Recovery, usize::MAX)?;
        self.finish()
    }

    /// Decide, then apply only the first `applied` actions and stop as if the
    /// process died
    #[cfg(test)]
    pub(crate) fn commit_interrupted(&mut self, applied: usize) -> Result<()> {
        self.ensure_live()?;
        self.write_marker()?;
        self.replay(ReplayMode::FirstCommit, applied)
    }

    fn discard(&mut self) -> Result<()> {
        if self.created {
            remove_all(&self.dir)?;
        }
        self.actions.clear();
        Ok(())
    }

    fn write_marker(&self) -> Result<()> {
        let sync = self.files.sync();
        // Staged blobs and action files must be durable before the decision
        sync_dir(&self.dir.join(STAGING_DIR), sync)?;
        write_file(&self.dir.join(COMMIT_MARKER), &[], sync)?;
        sync_dir(&self.dir, sync)?;
        Ok(())
    }

    fn replay(&mut self, mode: ReplayMode, limit: usize) -> Result<()> {
        // Once decided the transaction is never usable again
        self.terminal = true;

        for action in self.actions.iter().take(limit) {
            self.apply(action, mode)
                .and_then(|()| Ok(remove_file_if_exists(&self.action_path(action.seq))?))
                .map_err(|e| Error::replay(self.id.to_string(), e))?;
        }
        Ok(())
    }

    fn apply(&self, action: &JournalAction, mode: ReplayMode) -> Result<()> {
        let sync = self.files.sync();
        let path = action.path.to_path(&self.root);

        match action.kind {
            ActionKind::Create => {
                if let Some(parent) = path.parent() {
                    fs::create_dir_all(parent)?;
                }
                let benign: &[io::ErrorKind] = match mode {
                    ReplayMode::FirstCommit => &[],
                    ReplayMode::Recovery => &[io::ErrorKind::NotFound],
                };
                tolerate(fs::rename(self.blob_path(action.seq), &path), benign)?;
                self.files.forget(&self.partition, action.path.as_str());
            }
            ActionKind::Delete => {
                tolerate(remove_entry(&path), &[io::ErrorKind::NotFound])?;
                self.files.forget(&self.partition, action.path.as_str());
            }
            ActionKind::DeleteAll => {
                remove_all(&path)?;
                self.files.forget_partition(&self.partition);
            }
            ActionKind::Rename => {
                let target = action.target.as_ref().ok_or_else(|| {
                    Error::corruption(format!("rename action {} has no target", action.seq))
                })?;
                let to = target.to_path(&self.root);
                if let Some(parent) = to.parent() {
                    fs::create_dir_all(parent)?;
                    sync_dir(parent, sync)?;
                }
                tolerate(
                    fs::rename(&path, &to),
                    &[io::ErrorKind::NotFound, io::ErrorKind::AlreadyExists],
                )?;
                if to.is_file() {
                    self.files
                        .forget_renamed(&self.partition, action.path.as_str(), target.as_str());
                } else {
                    self.files.forget_partition(&self.partition);
                }
            }
            ActionKind::Mkdir => {
                tolerate(fs::create_dir(&path), &[io::ErrorKind::AlreadyExists])?;
            }
            ActionKind::MkdirAll => {
                fs::create_dir_all(&path)?;
            }
        }

        if let Some(parent) = path.parent() {
            sync_dir(parent, sync)?;
        }
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        let id = self.id.to_string();
        remove_file_if_exists(&self.dir.join(COMMIT_MARKER)).map_err(|e| Error::replay(&id, e))?;
        remove_all(&self.dir).map_err(|e| Error::replay(&id, e))?;

        self.actions.clear();
        self.terminal = true;
        debug!("Committed transaction {}", id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use tempfile::tempdir;
    use tessera_common::SyncMode;

    fn rel(p: &str) -> RelPath {
        RelPath::new(p).unwrap()
    }

    fn store() -> FileStore {
        FileStore::uncached(SyncMode::Always)
    }

    /// Partition contents, excluding in-flight transactions
    fn snapshot(root: &Path) -> BTreeMap<String, Option<Vec<u8>>> {
        fn walk(root: &Path, dir: &Path, out: &mut BTreeMap<String, Option<Vec<u8>>>) {
            for entry in fs::read_dir(dir).unwrap() {
                let path = entry.unwrap().path();
                let name = path.strip_prefix(root).unwrap().to_string_lossy().into_owned();
                if name == TRANSACTIONS_DIR {
                    continue;
                }
                if path.is_dir() {
                    out.insert(name, None);
                    walk(root, &path, out);
                } else {
                    out.insert(name, Some(fs::read(&path).unwrap()));
                }
            }
        }
        let mut out = BTreeMap::new();
        walk(root, root, &mut out);
        out
    }

    fn seed(root: &Path) {
        fs::create_dir_all(root.join("tables")).unwrap();
        fs::write(root.join("old"), b"stale").unwrap();
    }

    fn scripted(root: &Path) -> Transaction {
        let mut txn = Transaction::begin(root, store());
        txn.write_file(&rel("structs"), b"b1").unwrap();
        txn.mkdir_all(&rel("tables/x")).unwrap();
        txn.write_file(&rel("tables/x/1"), b"row").unwrap();
        txn.write_file(&rel("tables/y/1"), b"row2").unwrap();
        txn.rename(&rel("tables/y"), &rel("tables/z")).unwrap();
        txn.delete_all(&rel("tables/x")).unwrap();
        txn.delete(&rel("old")).unwrap();
        txn.write_file(&rel("structs"), b"b2").unwrap();
        txn.mkdir(&rel("logs")).unwrap();
        txn
    }

    #[test]
    fn test_action_record_framing() {
        let action = JournalAction {
            seq: 7,
            kind: ActionKind::Rename,
            path: rel("a/b"),
            target: Some(rel("c")),
        };
        let bytes = action.to_bytes().unwrap();
        assert_eq!(JournalAction::from_bytes(&bytes).unwrap(), action);

        let mut flipped = bytes.clone();
        flipped[ACTION_HEADER_SIZE] ^= 0xff;
        let err = JournalAction::from_bytes(&flipped).unwrap_err();
        assert!(matches!(err, Error::Corruption(ref m) if m.contains("CRC")));

        assert!(JournalAction::from_bytes(&bytes[..bytes.len() - 1]).is_err());
        assert!(JournalAction::from_bytes(&[0u8; 16]).is_err());
    }

    #[test]
    fn test_reads_own_writes() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("committed"), b"disk").unwrap();

        let mut txn = Transaction::begin(dir.path(), store());
        assert_eq!(&txn.read_file(&rel("committed")).unwrap()[..], b"disk");
        assert!(txn.read_file(&rel("missing")).unwrap_err().is_not_found());

        txn.write_file(&rel("committed"), b"staged").unwrap();
        assert_eq!(&txn.read_file(&rel("committed")).unwrap()[..], b"staged");

        // Nothing reached the partition yet
        assert_eq!(fs::read(dir.path().join("committed")).unwrap(), b"disk");
    }

    #[test]
    fn test_read_resolves_rename_and_delete() {
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join("a")).unwrap();
        fs::write(dir.path().join("a/x"), b"x").unwrap();

        let mut txn = Transaction::begin(dir.path(), store());
        txn.rename(&rel("a"), &rel("b")).unwrap();
        assert_eq!(&txn.read_file(&rel("b/x")).unwrap()[..], b"x");
        assert!(!txn.exists(&rel("a/x")).unwrap());

        txn.write_file(&rel("b/y"), b"y").unwrap();
        assert_eq!(&txn.read_file(&rel("b/y")).unwrap()[..], b"y");

        txn.delete_all(&rel("b")).unwrap();
        assert!(!txn.exists(&rel("b/x")).unwrap());
        assert!(!txn.exists(&rel("b/y")).unwrap());

        txn.write_file(&rel("b/x"), b"again").unwrap();
        assert_eq!(&txn.read_file(&rel("b/x")).unwrap()[..], b"again");
    }

    #[test]
    fn test_commit_applies_and_cleans_up() {
        let dir = tempdir().unwrap();
        seed(dir.path());

        let mut txn = scripted(dir.path());
        let txn_dir = txn.dir().to_path_buf();
        assert!(txn_dir.join("0.J").exists());
        txn.commit().unwrap();

        assert!(!txn_dir.exists());
        assert!(txn.is_terminal());
        assert_eq!(fs::read(dir.path().join("structs")).unwrap(), b"b2");
        assert!(!dir.path().join("tables/x").exists());
        assert_eq!(fs::read(dir.path().join("tables/z/1")).unwrap(), b"row2");
        assert!(!dir.path().join("tables/y").exists());
        assert!(!dir.path().join("old").exists());
        assert!(dir.path().join("logs").is_dir());
    }

    #[test]
    fn test_rollback_leaves_partition_untouched() {
        let dir = tempdir().unwrap();
        seed(dir.path());
        let before = snapshot(dir.path());

        let mut txn = scripted(dir.path());
        let txn_dir = txn.dir().to_path_buf();
        txn.rollback().unwrap();

        assert!(!txn_dir.exists());
        assert_eq!(snapshot(dir.path()), before);
    }

    #[test]
    fn test_empty_transaction_never_touches_disk() {
        let dir = tempdir().unwrap();
        let mut txn = Transaction::begin(dir.path(), store());
        txn.rollback().unwrap();
        assert!(!dir.path().join(TRANSACTIONS_DIR).exists());

        let mut txn = Transaction::begin(dir.path(), store());
        txn.commit().unwrap();
        assert!(!dir.path().join(TRANSACTIONS_DIR).exists());
    }

    #[test]
    fn test_terminal_transaction_rejects_calls() {
        let dir = tempdir().unwrap();
        let mut txn = Transaction::begin(dir.path(), store());
        txn.write_file(&rel("a"), b"1").unwrap();
        txn.commit().unwrap();

        for err in [
            txn.write_file(&rel("a"), b"2").unwrap_err(),
            txn.commit().unwrap_err(),
            txn.rollback().unwrap_err(),
            txn.read_file(&rel("a")).unwrap_err(),
        ] {
            assert!(matches!(err, Error::TransactionTerminated(_)));
        }
    }

    #[test]
    fn test_first_commit_missing_blob_fails() {
        let dir = tempdir().unwrap();
        let mut txn = Transaction::begin(dir.path(), store());
        txn.write_file(&rel("a"), b"1").unwrap();
        fs::remove_file(txn.dir().join(STAGING_DIR).join("0")).unwrap();

        let err = txn.commit().unwrap_err();
        assert!(matches!(err, Error::JournalReplay { .. }));
        assert!(err.is_fatal());
        assert!(Transaction::is_committed(txn.dir()));
    }

    #[test]
    fn test_interrupted_commit_redo_matches_clean_commit() {
        let clean = tempdir().unwrap();
        seed(clean.path());
        scripted(clean.path()).commit().unwrap();
        let expected = snapshot(clean.path());

        let total = scripted(tempdir().unwrap().path()).actions().len();
        for applied in 0..=total {
            let dir = tempdir().unwrap();
            seed(dir.path());

            let mut txn = scripted(dir.path());
            let txn_dir = txn.dir().to_path_buf();
            txn.commit_interrupted(applied).unwrap();
            assert!(Transaction::is_committed(&txn_dir));

            let mut recovered = Transaction::load(&txn_dir, dir.path(), store()).unwrap();
            assert_eq!(recovered.actions().len(), total - applied);
            recovered.resume().unwrap();

            assert!(!txn_dir.exists());
            assert_eq!(snapshot(dir.path()), expected, "interrupted after {applied}");
        }
    }

    #[test]
    fn test_redo_after_applied_action_kept_its_record() {
        let clean = tempdir().unwrap();
        seed(clean.path());
        scripted(clean.path()).commit().unwrap();
        let expected = snapshot(clean.path());

        let total = scripted(tempdir().unwrap().path()).actions().len();
        for applied in 1..=total {
            let dir = tempdir().unwrap();
            seed(dir.path());

            let mut txn = scripted(dir.path());
            let txn_dir = txn.dir().to_path_buf();
            let last = format!("{}{ACTION_EXT}", applied - 1);
            let record = fs::read(txn_dir.join(&last)).unwrap();

            // The last applied action reached the partition but its record
            // was not removed yet
            txn.commit_interrupted(applied).unwrap();
            fs::write(txn_dir.join(&last), record).unwrap();

            let mut recovered = Transaction::load(&txn_dir, dir.path(), store()).unwrap();
            assert_eq!(recovered.actions()[0].seq as usize, applied - 1);
            recovered.resume().unwrap();
            assert_eq!(snapshot(dir.path()), expected, "re-applied action {}", applied - 1);
        }
    }

    #[test]
    fn test_load_restores_sequence() {
        let dir = tempdir().unwrap();
        let mut txn = Transaction::begin(dir.path(), store());
        for i in 0..12 {
            txn.write_file(&rel(&format!("f{i}")), b"v").unwrap();
        }
        let loaded = Transaction::load(txn.dir(), dir.path(), store()).unwrap();
        let seqs: Vec<u64> = loaded.actions().iter().map(|a| a.seq).collect();
        assert_eq!(seqs, (0..12).collect::<Vec<_>>());
        assert_eq!(loaded.next_seq, 12);
    }

    #[test]
    fn test_load_rejects_corrupt_record() {
        let dir = tempdir().unwrap();
        let mut txn = Transaction::begin(dir.path(), store());
        txn.write_file(&rel("a"), b"v").unwrap();
        fs::write(txn.dir().join("0.J"), b"garbage").unwrap();

        let err = Transaction::load(txn.dir(), dir.path(), store()).err().unwrap();
        assert!(matches!(err, Error::Corruption(_)));
    }
}
