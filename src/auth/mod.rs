//! 用户模型、外部认证管理器接口和 SSH 认证器

use std::collections::HashMap;

use async_trait::async_trait;
use serde::Deserialize;
use sha2::{Digest, Sha256};

use crate::ssh_key::SshKey;

pub mod caching;
pub mod kerberos;
pub mod password;
pub mod publickey;

pub use caching::CachingPublicKeyAuthenticator;
pub use kerberos::KerberosAuthenticator;
pub use password::PasswordAuthenticator;
pub use publickey::{PublicKeyAuthenticator, PublicKeyVerifier};

/// 服务器已知的账户
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct UserModel {
    pub username: String,
    /// 明文或 `SHA256:<hex>`
    pub password: Option<String>,
    pub display_name: Option<String>,
    pub admin: bool,
    pub disabled: bool,
    /// 可访问的仓库；`*` 表示全部
    pub repositories: Vec<String>,
}

impl UserModel {
    pub fn new(username: &str) -> Self {
        Self {
            username: username.to_string(),
            ..Default::default()
        }
    }

    pub fn display_name(&self) -> &str {
        match self.display_name.as_deref() {
            Some(name) if !name.is_empty() => name,
            _ => &self.username,
        }
    }

    pub fn can_access(&self, repository: &str) -> bool {
        self.admin
            || self
                .repositories
                .iter()
                .any(|r| r == "*" || r.eq_ignore_ascii_case(repository))
    }

    fn password_matches(&self, offered: &str) -> bool {
        match self.password.as_deref() {
            Some(stored) => match stored.strip_prefix("SHA256:") {
                Some(hex) => format!("{:x}", Sha256::digest(offered.as_bytes())).eq_ignore_ascii_case(hex),
                None => stored == offered,
            },
            None => false,
        }
    }
}

/// 外部认证管理器，对身份做最终确认
#[async_trait]
pub trait AuthenticationManager: Send + Sync {
    async fn authenticate_password(&self, username: &str, password: &str) -> Option<UserModel>;

    /// 公钥与用户已注册的某个公钥匹配后调用
    async fn authenticate_public_key(&self, username: &str, key: &SshKey) -> Option<UserModel>;

    /// 确认由 Kerberos 等外部机制担保的身份
    async fn find_user(&self, username: &str) -> Option<UserModel>;
}

/// 配置文件中声明的用户
pub struct ConfigUserManager {
    users: HashMap<String, UserModel>,
}

impl ConfigUserManager {
    pub fn new(users: impl IntoIterator<Item = UserModel>) -> Self {
        let users = users
            .into_iter()
            .map(|u| (u.username.to_lowercase(), u))
            .collect();
        Self { users }
    }

    fn active(&self, username: &str) -> Option<&UserModel> {
        self.users
            .get(&username.to_lowercase())
            .filter(|u| !u.disabled)
    }
}

#[async_trait]
impl AuthenticationManager for ConfigUserManager {
    async fn authenticate_password(&self, username: &str, password: &str) -> Option<UserModel> {
        self.active(username)
            .filter(|u| u.password_matches(password))
            .cloned()
    }

    async fn authenticate_public_key(&self, username: &str, _key: &SshKey) -> Option<UserModel> {
        self.active(username).cloned()
    }

    async fn find_user(&self, username: &str) -> Option<UserModel> {
        self.active(username).cloned()
    }
}
