use std::sync::Arc;

use tracing::{info, warn};

use super::AuthenticationManager;
use crate::session::SshDaemonClient;

/// 一次性口令验证，不缓存结果
pub struct PasswordAuthenticator {
    manager: Arc<dyn AuthenticationManager>,
}

impl PasswordAuthenticator {
    pub fn new(manager: Arc<dyn AuthenticationManager>) -> Self {
        Self { manager }
    }

    pub async fn authenticate(&self, username: &str, password: &str, client: &SshDaemonClient) -> bool {
        let Some(user) = self.manager.authenticate_password(username, password).await else {
            warn!(session_id = client.id(), username, "密码认证失败");
            return false;
        };
        if !client.bind(user, None) {
            warn!(session_id = client.id(), username, "会话已绑定其他用户，拒绝密码认证");
            return false;
        }
        info!(session_id = client.id(), username, "密码认证成功");
        true
    }
}
