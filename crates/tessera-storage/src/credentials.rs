//! Per-partition credentials
//!
//! Users, their API keys and their permissions live in a single `credentials`
//! file at the partition root, replaced with [`write_safely`] on every change.
//! Decoded contents are cached per partition.

use crate::middleware::FileStore;
use crate::partition::PartitionLease;
use crate::records::{decode, encode};
use crate::safe_io::write_safely;
use crate::tlru::TlruCache;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use tessera_common::{Error, Result};
use tracing::debug;

pub const CREDENTIALS_FILE: &str = "credentials";

pub type Permissions = BTreeSet<String>;

fn user_not_found(username: &str) -> Error {
    Error::RecordNotFound {
        kind: "user",
        key: username.to_string(),
    }
}

fn key_not_found(api_key: &str) -> Error {
    Error::RecordNotFound {
        kind: "api key",
        key: api_key.to_string(),
    }
}

/// Decoded credentials file
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    user_to_keys: BTreeMap<String, BTreeSet<String>>,
    key_to_user: BTreeMap<String, String>,
    user_to_permissions: BTreeMap<String, Permissions>,
}

impl Credentials {
    pub fn usernames(&self) -> Vec<String> {
        self.user_to_permissions.keys().cloned().collect()
    }

    pub fn permissions_by_username(&self, username: &str) -> Result<Permissions> {
        self.user_to_permissions
            .get(username)
            .cloned()
            .ok_or_else(|| user_not_found(username))
    }

    /// Owner and permissions of an API key
    pub fn permissions_by_api_key(&self, api_key: &str) -> Result<(String, Permissions)> {
        let username = self
            .key_to_user
            .get(api_key)
            .ok_or_else(|| key_not_found(api_key))?;
        Ok((username.clone(), self.permissions_by_username(username)?))
    }

    /// Keys issued to a user
    pub fn api_keys(&self, username: &str) -> Result<Vec<String>> {
        if !self.user_to_permissions.contains_key(username) {
            return Err(user_not_found(username));
        }
        Ok(self
            .user_to_keys
            .get(username)
            .map(|keys| keys.iter().cloned().collect())
            .unwrap_or_default())
    }

    /// Set a user's permissions, creating the user if needed
    pub fn set_permissions(&mut self, username: &str, permissions: Permissions) {
        self.user_to_permissions
            .insert(username.to_string(), permissions);
    }

    /// Bind `api_key` to an existing user, moving it if already bound
    pub fn create_api_key(&mut self, username: &str, api_key: &str) -> Result<()> {
        if !self.user_to_permissions.contains_key(username) {
            return Err(user_not_found(username));
        }
        if let Some(previous) = self.key_to_user.get(api_key).cloned() {
            self.unbind(&previous, api_key);
        }
        self.key_to_user
            .insert(api_key.to_string(), username.to_string());
        self.user_to_keys
            .entry(username.to_string())
            .or_default()
            .insert(api_key.to_string());
        Ok(())
    }

    pub fn delete_api_key(&mut self, api_key: &str) -> Result<()> {
        let username = self
            .key_to_user
            .remove(api_key)
            .ok_or_else(|| key_not_found(api_key))?;
        self.unbind(&username, api_key);
        Ok(())
    }

    /// Remove a user together with all of their keys
    pub fn delete_username(&mut self, username: &str) -> Result<()> {
        self.user_to_permissions
            .remove(username)
            .ok_or_else(|| user_not_found(username))?;
        for key in self.user_to_keys.remove(username).unwrap_or_default() {
            self.key_to_user.remove(&key);
        }
        Ok(())
    }

    fn unbind(&mut self, username: &str, api_key: &str) {
        if let Some(keys) = self.user_to_keys.get_mut(username) {
            keys.remove(api_key);
            if keys.is_empty() {
                self.user_to_keys.remove(username);
            }
        }
    }
}

/// Loads and stores [`Credentials`] under a partition lease
pub struct CredentialStore {
    files: FileStore,
    cache: TlruCache<String, Arc<Credentials>>,
}

impl CredentialStore {
    pub fn new(files: FileStore, ttl: Duration) -> Self {
        Self {
            files,
            cache: TlruCache::new(ttl),
        }
    }

    /// Current credentials of the leased partition; absent file means empty
    pub fn load(&self, lease: &PartitionLease) -> Result<Arc<Credentials>> {
        let partition = lease.dir_name();
        if let Some(credentials) = self.cache.get(&partition) {
            return Ok(credentials);
        }

        let path = lease.dir().join(CREDENTIALS_FILE);
        let credentials = match self.files.read(&partition, CREDENTIALS_FILE, &path) {
            Ok(data) => decode(&data)?,
            Err(e) if e.is_not_found() => Credentials::default(),
            Err(e) => return Err(e),
        };

        let credentials = Arc::new(credentials);
        self.cache.set(partition, Arc::clone(&credentials));
        Ok(credentials)
    }

    /// Replace the credentials file; the lease must be exclusive
    pub fn store(&self, lease: &PartitionLease, credentials: Credentials) -> Result<()> {
        if !lease.is_exclusive() {
            return Err(Error::internal("credentials written without an exclusive lease"));
        }

        let partition = lease.dir_name();
        let path = lease.dir().join(CREDENTIALS_FILE);
        let data = Bytes::from(encode(&credentials)?);
        let sync = self.files.sync();

        self.cache.delete(&partition);
        self.files.write(&partition, CREDENTIALS_FILE, data, &mut |bytes| {
            write_safely(&path, bytes, sync)
        })?;
        self.cache.set(partition.clone(), Arc::new(credentials));
        debug!("Stored credentials for partition {}", lease.name());
        Ok(())
    }

    /// Drop the decoded credentials of a partition
    pub fn invalidate(&self, partition: &str) {
        self.cache.delete(partition);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn perms(items: &[&str]) -> Permissions {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_user_and_key_lifecycle() {
        let mut creds = Credentials::default();
        creds.set_permissions("alice", perms(&["read"]));
        creds.create_api_key("alice", "k1").unwrap();
        creds.create_api_key("alice", "k2").unwrap();

        let (user, p) = creds.permissions_by_api_key("k1").unwrap();
        assert_eq!(user, "alice");
        assert_eq!(p, perms(&["read"]));
        assert_eq!(creds.api_keys("alice").unwrap(), vec!["k1", "k2"]);

        creds.delete_api_key("k1").unwrap();
        assert!(creds.permissions_by_api_key("k1").unwrap_err().is_not_found());
        assert!(creds.delete_api_key("k1").unwrap_err().is_not_found());

        creds.delete_username("alice").unwrap();
        assert!(creds.permissions_by_api_key("k2").is_err());
        assert!(creds.usernames().is_empty());
    }

    #[test]
    fn test_key_requires_user() {
        let mut creds = Credentials::default();
        let err = creds.create_api_key("nobody", "k").unwrap_err();
        assert!(matches!(err, Error::RecordNotFound { kind: "user", .. }));
    }

    #[test]
    fn test_key_moves_between_users() {
        let mut creds = Credentials::default();
        creds.set_permissions("a", perms(&["x"]));
        creds.set_permissions("b", perms(&["y"]));
        creds.create_api_key("a", "k").unwrap();
        creds.create_api_key("b", "k").unwrap();

        assert_eq!(creds.permissions_by_api_key("k").unwrap().0, "b");
        assert!(creds.api_keys("a").unwrap().is_empty());
    }
}
