use std::sync::Arc;

use tracing::{info, warn};

use super::AuthenticationManager;
use crate::session::SshDaemonClient;

/// 接受 Kerberos/GSSAPI 建立的身份。
///
/// 去掉 principal 的 realm 后必须与登录名一致，
/// 最终由认证管理器确认用户。
pub struct KerberosAuthenticator {
    manager: Arc<dyn AuthenticationManager>,
    strip_domain: bool,
}

impl KerberosAuthenticator {
    pub fn new(manager: Arc<dyn AuthenticationManager>, strip_domain: bool) -> Self {
        Self { manager, strip_domain }
    }

    fn principal_name<'a>(&self, principal: &'a str) -> &'a str {
        let name = principal.split('@').next().unwrap_or(principal);
        if self.strip_domain {
            name.rsplit('\\').next().unwrap_or(name)
        } else {
            name
        }
    }

    pub async fn authenticate(&self, username: &str, principal: &str, client: &SshDaemonClient) -> bool {
        let login = if self.strip_domain {
            username.rsplit('\\').next().unwrap_or(username)
        } else {
            username
        };
        if !self.principal_name(principal).eq_ignore_ascii_case(login) {
            warn!(session_id = client.id(), username, "Kerberos 认证失败");
            return false;
        }
        let Some(user) = self.manager.find_user(login).await else {
            warn!(session_id = client.id(), username, "Kerberos 认证失败");
            return false;
        };
        if !client.bind(user, None) {
            return false;
        }
        info!(session_id = client.id(), username, "Kerberos 认证成功");
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::tests::test_users;

    #[tokio::test]
    async fn principal_must_match_login() {
        let auth = KerberosAuthenticator::new(Arc::new(test_users()), false);
        let client = SshDaemonClient::new(1, None);
        assert!(!auth.authenticate("alice", "bob@EXAMPLE.COM", &client).await);
        assert!(auth.authenticate("alice", "alice@EXAMPLE.COM", &client).await);
        assert_eq!(client.username(), Some("alice"));
    }

    #[tokio::test]
    async fn strips_windows_domain() {
        let auth = KerberosAuthenticator::new(Arc::new(test_users()), true);
        let client = SshDaemonClient::new(1, None);
        assert!(auth.authenticate("CORP\\alice", "alice@CORP.EXAMPLE.COM", &client).await);

        let strict = KerberosAuthenticator::new(Arc::new(test_users()), false);
        let other = SshDaemonClient::new(2, None);
        assert!(!strict.authenticate("CORP\\alice", "alice@CORP.EXAMPLE.COM", &other).await);
    }

    #[tokio::test]
    async fn unknown_or_disabled_users_fail() {
        let auth = KerberosAuthenticator::new(Arc::new(test_users()), false);
        let client = SshDaemonClient::new(1, None);
        assert!(!auth.authenticate("mallory", "mallory@EXAMPLE.COM", &client).await);
        assert!(!auth.authenticate("zed", "zed@EXAMPLE.COM", &client).await);
    }
}
