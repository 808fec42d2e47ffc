use std::sync::Arc;

use async_trait::async_trait;
use russh::keys::ssh_key::PublicKey;
use tracing::{error, info, warn};

use super::AuthenticationManager;
use crate::keys::KeyManager;
use crate::session::SshDaemonClient;
use crate::ssh_key::SshKey;

/// 验证 SSH 用户认证阶段提供的公钥
#[async_trait]
pub trait PublicKeyAuthenticator: Send + Sync {
    async fn authenticate(&self, username: &str, key: &PublicKey, client: &SshDaemonClient) -> bool;

    /// 释放已关闭连接的缓存状态
    fn session_closed(&self, _client: &SshDaemonClient) {}
}

/// 将提供的公钥与用户已注册的公钥比较，匹配后交给认证管理器确认身份
pub struct PublicKeyVerifier {
    keys: Arc<KeyManager>,
    manager: Arc<dyn AuthenticationManager>,
}

impl PublicKeyVerifier {
    pub fn new(keys: Arc<KeyManager>, manager: Arc<dyn AuthenticationManager>) -> Self {
        Self { keys, manager }
    }
}

#[async_trait]
impl PublicKeyAuthenticator for PublicKeyVerifier {
    async fn authenticate(&self, username: &str, key: &PublicKey, client: &SshDaemonClient) -> bool {
        let registered = match self.keys.get_keys(username).await {
            Ok(keys) => keys,
            Err(e) => {
                error!(session_id = client.id(), username, error = %e, "读取公钥失败");
                return false;
            }
        };

        let Some(matched) = registered.iter().find(|k| k.matches(key)) else {
            warn!(session_id = client.id(), username, "公钥认证失败");
            return false;
        };

        let Some(user) = self.manager.authenticate_public_key(username, matched).await else {
            warn!(session_id = client.id(), username, "公钥认证失败");
            return false;
        };

        if !client.bind(user, Some(matched.clone())) {
            warn!(session_id = client.id(), username, "会话已绑定其他用户，拒绝公钥认证");
            return false;
        }
        info!(
            session_id = client.id(),
            username,
            fingerprint = %SshKey::from_public_key(key.clone()).fingerprint(),
            "公钥认证成功"
        );
        true
    }
}
