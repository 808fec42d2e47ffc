use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use russh::keys::ssh_key::PublicKey;
use tracing::debug;

use super::PublicKeyAuthenticator;
use crate::session::SshDaemonClient;
use crate::ssh_key::SshKey;

type Verdicts = Arc<tokio::sync::Mutex<HashMap<SshKey, bool>>>;

/// 记住同一连接上每个公钥的认证结果，客户端轮流尝试多个公钥时
/// 不会反复查询公钥存储。
///
/// 连接关闭时清除结果。
pub struct CachingPublicKeyAuthenticator {
    inner: Arc<dyn PublicKeyAuthenticator>,
    sessions: Mutex<HashMap<usize, Verdicts>>,
}

impl CachingPublicKeyAuthenticator {
    pub fn new(inner: Arc<dyn PublicKeyAuthenticator>) -> Self {
        Self {
            inner,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    fn verdicts(&self, client: &SshDaemonClient) -> Verdicts {
        let mut sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        sessions.entry(client.id()).or_default().clone()
    }

    pub fn cached_sessions(&self) -> usize {
        self.sessions.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

#[async_trait]
impl PublicKeyAuthenticator for CachingPublicKeyAuthenticator {
    async fn authenticate(&self, username: &str, key: &PublicKey, client: &SshDaemonClient) -> bool {
        let verdicts = self.verdicts(client);
        // 持有会话自己的锁，同一会话的认证请求串行执行
        let mut verdicts = verdicts.lock().await;
        let offered = SshKey::from_public_key(key.clone());
        if let Some(&verdict) = verdicts.get(&offered) {
            debug!(session_id = client.id(), username, verdict, "使用缓存的公钥认证结果");
            return verdict;
        }
        let verdict = self.inner.authenticate(username, key, client).await;
        verdicts.insert(offered, verdict);
        verdict
    }

    fn session_closed(&self, client: &SshDaemonClient) {
        let mut sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        sessions.remove(&client.id());
        drop(sessions);
        self.inner.session_closed(client);
    }
}
