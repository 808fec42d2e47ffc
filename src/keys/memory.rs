use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;

use super::PublicKeyStore;
use crate::error::KeyStoreError;
use crate::ssh_key::SshKey;

/// 进程内的公钥存储，重启后丢失。
///
/// 总是报告过期，以内存表为准。
#[derive(Default)]
pub struct MemoryKeyStore {
    keys: RwLock<HashMap<String, Vec<SshKey>>>,
}

impl MemoryKeyStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PublicKeyStore for MemoryKeyStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn is_stale(&self, _username: &str) -> bool {
        true
    }

    async fn load_keys(&self, username: &str) -> Result<Vec<SshKey>, KeyStoreError> {
        let keys = self.keys.read().unwrap_or_else(|e| e.into_inner());
        Ok(keys.get(username).cloned().unwrap_or_default())
    }

    async fn add_key(&self, username: &str, key: &SshKey) -> Result<bool, KeyStoreError> {
        let mut keys = self.keys.write().unwrap_or_else(|e| e.into_inner());
        let list = keys.entry(username.to_string()).or_default();
        match list.iter_mut().find(|k| *k == key) {
            Some(existing) => *existing = key.clone(),
            None => list.push(key.clone()),
        }
        Ok(true)
    }

    async fn remove_key(&self, username: &str, key: &SshKey) -> Result<bool, KeyStoreError> {
        let mut keys = self.keys.write().unwrap_or_else(|e| e.into_inner());
        let Some(list) = keys.get_mut(username) else {
            return Ok(false);
        };
        let before = list.len();
        list.retain(|k| k != key);
        let removed = list.len() != before;
        if list.is_empty() {
            keys.remove(username);
        }
        Ok(removed)
    }

    async fn remove_all_keys(&self, username: &str) -> Result<bool, KeyStoreError> {
        let mut keys = self.keys.write().unwrap_or_else(|e| e.into_inner());
        Ok(keys.remove(username).is_some())
    }
}
