//! 每个 SSH 连接的客户端上下文

use std::net::SocketAddr;
use std::sync::{Mutex, OnceLock};

use crate::auth::UserModel;
use crate::ssh_key::SshKey;

/// 连接状态，由传输层处理器和该连接上运行的命令共享。
///
/// 身份最多绑定一次，之后绑定其他用户会失败。
#[derive(Debug)]
pub struct SshDaemonClient {
    id: usize,
    remote_addr: Option<SocketAddr>,
    user: OnceLock<UserModel>,
    key: OnceLock<SshKey>,
    repository_name: Mutex<Option<String>>,
    git_protocol: Mutex<Option<String>>,
}

impl SshDaemonClient {
    pub fn new(id: usize, remote_addr: Option<SocketAddr>) -> Self {
        Self {
            id,
            remote_addr,
            user: OnceLock::new(),
            key: OnceLock::new(),
            repository_name: Mutex::new(None),
            git_protocol: Mutex::new(None),
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn remote_address(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    pub fn user(&self) -> Option<&UserModel> {
        self.user.get()
    }

    pub fn username(&self) -> Option<&str> {
        self.user.get().map(|u| u.username.as_str())
    }

    pub fn is_admin(&self) -> bool {
        self.user.get().map(|u| u.admin).unwrap_or(false)
    }

    /// 认证使用的公钥；口令或 Kerberos 会话为 `None`
    pub fn key(&self) -> Option<&SshKey> {
        self.key.get()
    }

    /// 绑定认证后的身份。
    ///
    /// 已绑定其他用户时返回 `false`；重复绑定同一用户成功，并保留第一个公钥。
    pub fn bind(&self, user: UserModel, key: Option<SshKey>) -> bool {
        let bound = self.user.get_or_init(|| user.clone());
        if !bound.username.eq_ignore_ascii_case(&user.username) {
            return false;
        }
        if let Some(key) = key {
            let _ = self.key.set(key);
        }
        true
    }

    pub fn set_repository_name(&self, name: &str) {
        let mut repo = self.repository_name.lock().unwrap_or_else(|e| e.into_inner());
        *repo = Some(name.to_string());
    }

    pub fn repository_name(&self) -> Option<String> {
        self.repository_name.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn set_git_protocol(&self, value: &str) {
        let mut proto = self.git_protocol.lock().unwrap_or_else(|e| e.into_inner());
        *proto = Some(value.to_string());
    }

    pub fn git_protocol(&self) -> Option<String> {
        self.git_protocol.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}
