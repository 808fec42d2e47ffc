use async_trait::async_trait;

use super::PublicKeyStore;
use crate::error::KeyStoreError;
use crate::ssh_key::SshKey;

/// 禁用公钥认证时使用：没有人有公钥，也不能注册公钥
#[derive(Debug, Default)]
pub struct NullKeyStore;

#[async_trait]
impl PublicKeyStore for NullKeyStore {
    fn name(&self) -> &'static str {
        "none"
    }

    async fn is_stale(&self, _username: &str) -> bool {
        true
    }

    async fn load_keys(&self, _username: &str) -> Result<Vec<SshKey>, KeyStoreError> {
        Ok(Vec::new())
    }

    async fn add_key(&self, _username: &str, _key: &SshKey) -> Result<bool, KeyStoreError> {
        Err(KeyStoreError::Unsupported(self.name()))
    }

    async fn remove_key(&self, _username: &str, _key: &SshKey) -> Result<bool, KeyStoreError> {
        Err(KeyStoreError::Unsupported(self.name()))
    }

    async fn remove_all_keys(&self, _username: &str) -> Result<bool, KeyStoreError> {
        Err(KeyStoreError::Unsupported(self.name()))
    }

    fn supports_writing_keys(&self) -> bool {
        false
    }

    fn supports_comment_changes(&self) -> bool {
        false
    }

    fn supports_permission_changes(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssh_key::tests::ALICE_ED25519;

    #[tokio::test]
    async fn rejects_everything() {
        let store = NullKeyStore;
        let key = SshKey::from_raw(ALICE_ED25519).unwrap();
        assert!(store.load_keys("alice").await.unwrap().is_empty());
        assert!(store.add_key("alice", &key).await.is_err());
        assert!(store.remove_key("alice", &key).await.is_err());
        assert!(store.remove_all_keys("alice").await.is_err());
    }
}
