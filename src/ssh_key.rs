//! 公钥记录：原始 authorized_keys 文本、解码后的公钥、注释、指纹和访问权限

use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;
use std::sync::OnceLock;

use russh::keys::ssh_key::{HashAlg, PublicKey};

use crate::error::KeyError;

/// 通过某个公钥认证的会话所获得的权限。
///
/// SSH 公钥只允许这三种权限，更高的权限通过用户的仓库权限授予。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
pub enum KeyPermission {
    /// `V`：只能克隆，与 `R` 行为相同；没有只读浏览、禁止克隆的级别
    View,
    /// `R`：克隆
    #[default]
    Clone,
    /// `RW`：克隆和推送
    Push,
}

impl KeyPermission {
    pub const ALL: [KeyPermission; 3] = [KeyPermission::View, KeyPermission::Clone, KeyPermission::Push];

    pub fn code(&self) -> &'static str {
        match self {
            KeyPermission::View => "V",
            KeyPermission::Clone => "R",
            KeyPermission::Push => "RW",
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            KeyPermission::View => "VIEW",
            KeyPermission::Clone => "CLONE",
            KeyPermission::Push => "PUSH",
        }
    }

    /// 按代码解析，大小写不敏感
    pub fn from_code(code: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|p| p.code().eq_ignore_ascii_case(code))
    }

    /// 接受权限代码（`RW`）或名称（`PUSH`）
    pub fn from_code_or_name(value: &str) -> Option<Self> {
        Self::from_code(value).or_else(|| Self::ALL.into_iter().find(|p| p.name().eq_ignore_ascii_case(value)))
    }

    /// 三种权限都允许克隆
    pub fn can_clone(&self) -> bool {
        true
    }

    pub fn can_push(&self) -> bool {
        matches!(self, KeyPermission::Push)
    }

    /// 用法说明中使用的逗号分隔列表
    pub fn valid_codes() -> String {
        Self::ALL.iter().map(|p| p.code()).collect::<Vec<_>>().join(", ")
    }
}

impl fmt::Display for KeyPermission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

impl FromStr for KeyPermission {
    type Err = KeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_code_or_name(s.trim()).ok_or_else(|| KeyError::Permission(s.trim().to_string()))
    }
}

/// 已注册的 SSH 公钥。
///
/// 相等和哈希只比较公钥本身，注释或权限不同的两条记录相等。
#[derive(Debug, Clone)]
pub struct SshKey {
    key: PublicKey,
    raw: OnceLock<String>,
    fingerprint: OnceLock<String>,
    permission: KeyPermission,
}

impl SshKey {
    /// 解析 authorized-key 格式：`key-type base64-data [comment]`
    pub fn from_raw(raw: &str) -> Result<Self, KeyError> {
        // 去掉换行，LDAP 和粘贴的公钥经常被折行
        let raw: String = raw.chars().filter(|c| *c != '\r' && *c != '\n').collect();
        let mut parts = raw.trim().splitn(3, char::is_whitespace);
        let (key_type, data) = match (parts.next(), parts.next()) {
            (Some(t), Some(d)) if !t.is_empty() && !d.is_empty() => (t, d.trim()),
            _ => return Err(KeyError::Parse("expected '<key-type> <base64-data> [comment]'".into())),
        };
        let comment = parts.next().map(str::trim).unwrap_or_default();

        let mut key = PublicKey::from_openssh(&format!("{} {}", key_type, data))
            .map_err(|e| KeyError::Parse(e.to_string()))?;
        key.set_comment(comment);

        Ok(Self::from_public_key(key))
    }

    /// 包装已解码的公钥，例如认证时提供的公钥
    pub fn from_public_key(key: PublicKey) -> Self {
        Self {
            key,
            raw: OnceLock::new(),
            fingerprint: OnceLock::new(),
            permission: KeyPermission::default(),
        }
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.key
    }

    /// authorized-key 格式文本，修改注释后重新生成
    pub fn raw_data(&self) -> &str {
        self.raw.get_or_init(|| self.key.to_openssh().unwrap_or_default())
    }

    pub fn comment(&self) -> &str {
        self.key.comment()
    }

    pub fn set_comment(&mut self, comment: &str) {
        self.key.set_comment(comment.trim());
        self.raw = OnceLock::new();
    }

    /// `SHA256:` 指纹，与 `ssh-keygen -l` 输出一致
    pub fn fingerprint(&self) -> &str {
        self.fingerprint
            .get_or_init(|| self.key.fingerprint(HashAlg::Sha256).to_string())
    }

    pub fn algorithm(&self) -> String {
        self.key.algorithm().as_str().to_string()
    }

    pub fn permission(&self) -> KeyPermission {
        self.permission
    }

    pub fn set_permission(&mut self, permission: KeyPermission) {
        self.permission = permission;
    }

    pub fn with_permission(mut self, permission: KeyPermission) -> Self {
        self.permission = permission;
        self
    }

    /// 与提供的公钥逐字节比较
    pub fn matches(&self, offered: &PublicKey) -> bool {
        self.key.key_data() == offered.key_data()
    }
}

impl PartialEq for SshKey {
    fn eq(&self, other: &Self) -> bool {
        self.key.key_data() == other.key.key_data()
    }
}

impl Eq for SshKey {}

impl Hash for SshKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        // 指纹只由密钥数据决定，与注释无关
        self.fingerprint().hash(state);
    }
}

impl fmt::Display for SshKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} ({})", self.fingerprint(), self.comment(), self.algorithm())
    }
}
