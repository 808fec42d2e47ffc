//! 公钥存储抽象和带缓存的公钥管理器

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info};
use moka::future::Cache;

use crate::error::KeyStoreError;
use crate::ssh_key::SshKey;

pub mod file;
pub mod ldap;
pub mod memory;
pub mod null;

pub use file::FileKeyStore;
pub use ldap::{DirectoryLookup, LdapDirectory, LdapKeyStore};
pub use memory::MemoryKeyStore;
pub use null::NullKeyStore;

/// 缓存条目存活时间
pub const KEY_CACHE_TTL: Duration = Duration::from_secs(15 * 60);
/// 缓存的用户数上限
pub const KEY_CACHE_CAPACITY: u64 = 100;

/// 用户已注册公钥的权威来源。
///
/// 没有公钥的用户 `load_keys` 返回空列表，不用错误表示不存在。
#[async_trait]
pub trait PublicKeyStore: Send + Sync {
    /// 日志和错误信息中使用的简称
    fn name(&self) -> &'static str;

    /// `username` 的缓存公钥列表使用前是否需要重新加载
    async fn is_stale(&self, username: &str) -> bool;

    async fn load_keys(&self, username: &str) -> Result<Vec<SshKey>, KeyStoreError>;

    /// 添加公钥，已注册的相同公钥会被替换
    async fn add_key(&self, username: &str, key: &SshKey) -> Result<bool, KeyStoreError>;

    async fn remove_key(&self, username: &str, key: &SshKey) -> Result<bool, KeyStoreError>;

    async fn remove_all_keys(&self, username: &str) -> Result<bool, KeyStoreError>;

    fn supports_writing_keys(&self) -> bool {
        true
    }

    fn supports_comment_changes(&self) -> bool {
        true
    }

    fn supports_permission_changes(&self) -> bool {
        true
    }
}

/// [`PublicKeyStore`] 的缓存层。
///
/// 条目在 [`KEY_CACHE_TTL`] 后过期，最多保存 [`KEY_CACHE_CAPACITY`] 个用户；
/// 存储报告过期或用户公钥被修改时丢弃条目。同一用户的并发未命中只读取一次存储，
/// 读取失败不缓存。
pub struct KeyManager {
    store: Arc<dyn PublicKeyStore>,
    cache: Cache<String, Arc<Vec<SshKey>>>,
}

impl KeyManager {
    pub fn new(store: Arc<dyn PublicKeyStore>) -> Self {
        Self::with_policy(store, KEY_CACHE_TTL, KEY_CACHE_CAPACITY)
    }

    pub fn with_policy(store: Arc<dyn PublicKeyStore>, ttl: Duration, capacity: u64) -> Self {
        info!("公钥管理器使用 {} 存储", store.name());
        let cache = Cache::builder().time_to_live(ttl).max_capacity(capacity).build();
        Self { store, cache }
    }

    pub fn store_name(&self) -> &'static str {
        self.store.name()
    }

    pub async fn get_keys(&self, username: &str) -> Result<Arc<Vec<SshKey>>, KeyStoreError> {
        if self.store.is_stale(username).await {
            debug!("{} 的公钥缓存已过期，重新加载", username);
            self.cache.invalidate(username).await;
        }

        let store = self.store.clone();
        let user = username.to_string();
        self.cache
            .try_get_with(username.to_string(), async move {
                store.load_keys(&user).await.map(Arc::new)
            })
            .await
            .map_err(KeyStoreError::Shared)
    }

    pub async fn add_key(&self, username: &str, key: &SshKey) -> Result<bool, KeyStoreError> {
        let added = self.store.add_key(username, key).await;
        self.cache.invalidate(username).await;
        added
    }

    pub async fn remove_key(&self, username: &str, key: &SshKey) -> Result<bool, KeyStoreError> {
        let removed = self.store.remove_key(username, key).await;
        self.cache.invalidate(username).await;
        removed
    }

    pub async fn remove_all_keys(&self, username: &str) -> Result<bool, KeyStoreError> {
        let removed = self.store.remove_all_keys(username).await;
        self.cache.invalidate(username).await;
        removed
    }

    /// 把 `old` 的所有公钥移到 `new` 并清空 `old`
    pub async fn rename_user(&self, old: &str, new: &str) -> Result<bool, KeyStoreError> {
        let keys = self.store.load_keys(old).await?;
        let mut copied = true;
        for key in &keys {
            copied &= self.store.add_key(new, key).await?;
        }
        self.cache.invalidate(new).await;
        if !copied {
            return Ok(false);
        }
        let removed = self.store.remove_all_keys(old).await;
        self.cache.invalidate(old).await;
        removed.map(|_| true)
    }

    pub fn supports_writing_keys(&self) -> bool {
        self.store.supports_writing_keys()
    }

    pub fn supports_comment_changes(&self) -> bool {
        self.store.supports_comment_changes()
    }

    pub fn supports_permission_changes(&self) -> bool {
        self.store.supports_permission_changes()
    }
}
