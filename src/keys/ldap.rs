//! 从 LDAP 目录读取公钥的只读存储

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use lazy_static::lazy_static;
use ldap3::{LdapConnAsync, Scope, SearchEntry};
use log::{debug, info, warn};
use regex::Regex;

use super::PublicKeyStore;
use crate::config::LdapSettings;
use crate::error::{KeyError, KeyStoreError};
use crate::ssh_key::{KeyPermission, SshKey};

lazy_static! {
    /// `prefix:` 前缀，用于区分多值属性中的条目（如 AD 的 altSecurityIdentities）
    static ref PREFIX_PATTERN: Regex = Regex::new(r#"^([^":]+):"#).unwrap();

    /// environment 选项中的 `gbPerm=<code>`
    static ref GB_PERM_PATTERN: Regex =
        Regex::new(r#"(?i:gbPerm)\s*=\s*(?:\\"|")?\s*([A-Za-z+-]+)"#).unwrap();

    /// 行首的登录选项或密钥类型：双引号内可以有空白和转义的引号
    static ref LEADIN_PATTERN: Regex =
        Regex::new(r#"^((?:[^\s"]*|(?:"(?:[^"\\]|\\"|\\)*"))*\s+)(.+)"#).unwrap();

    /// 逗号分隔的选项，引号内的逗号不分隔
    static ref OPTION_PATTERN: Regex =
        Regex::new(r#"([^",]+|(?:"(?:[^"\\]|\\"|\\)*"))+"#).unwrap();
}

/// 读取用户条目上某个属性的值
#[async_trait]
pub trait DirectoryLookup: Send + Sync {
    /// 目录中没有唯一条目时返回 `Ok(None)`
    async fn lookup(&self, username: &str, attribute: &str) -> Result<Option<Vec<String>>, KeyStoreError>;
}

/// 基于 LDAP 服务器的 [`DirectoryLookup`]
pub struct LdapDirectory {
    settings: LdapSettings,
}

impl LdapDirectory {
    pub fn new(settings: LdapSettings) -> Self {
        Self { settings }
    }

    fn user_filter(&self, username: &str) -> String {
        self.settings
            .user_filter
            .replace("${username}", &ldap3::ldap_escape(username))
    }
}

fn directory_error(e: ldap3::LdapError) -> KeyStoreError {
    KeyStoreError::Directory(e.to_string())
}

#[async_trait]
impl DirectoryLookup for LdapDirectory {
    async fn lookup(&self, username: &str, attribute: &str) -> Result<Option<Vec<String>>, KeyStoreError> {
        let (conn, mut ldap) = LdapConnAsync::new(&self.settings.url).await.map_err(directory_error)?;
        ldap3::drive!(conn);

        if let Some(bind_dn) = &self.settings.bind_dn {
            let password = self.settings.bind_password.as_deref().unwrap_or_default();
            ldap.simple_bind(bind_dn, password)
                .await
                .map_err(directory_error)?
                .success()
                .map_err(directory_error)?;
        }

        let filter = self.user_filter(username);
        let (entries, _) = ldap
            .search(&self.settings.base_dn, Scope::Subtree, &filter, vec![attribute])
            .await
            .map_err(directory_error)?
            .success()
            .map_err(directory_error)?;
        let _ = ldap.unbind().await;

        if entries.len() != 1 {
            info!("LDAP 中找到 {} 个 {} 的条目，无法读取公钥", entries.len(), username);
            return Ok(None);
        }
        let entry = entries.into_iter().next().map(SearchEntry::construct);
        Ok(entry.and_then(|e| {
            e.attrs
                .into_iter()
                .find(|(name, _)| name.eq_ignore_ascii_case(attribute))
                .map(|(_, values)| values)
        }))
    }
}

/// 一行 authorized-key 及其登录选项
#[derive(Debug)]
struct AuthorizedKeyEntry {
    key: SshKey,
    // 选项名小写；同名选项可以出现多次
    options: HashMap<String, Vec<String>>,
}

fn looks_like_key_type(token: &str) -> bool {
    ["ssh-", "ecdsa-sha2-", "sk-ssh-", "sk-ecdsa-"]
        .iter()
        .any(|prefix| token.starts_with(prefix))
}

fn strip_quotes(value: &str) -> &str {
    value
        .strip_prefix('"')
        .and_then(|v| v.strip_suffix('"'))
        .unwrap_or(value)
}

fn parse_login_options(options: &str) -> HashMap<String, Vec<String>> {
    let mut map: HashMap<String, Vec<String>> = HashMap::new();
    for m in OPTION_PATTERN.find_iter(options) {
        let option = m.as_str().trim();
        if option.is_empty() {
            continue;
        }
        let (name, value) = match option.split_once('=') {
            Some((name, value)) => (name.trim(), strip_quotes(value.trim()).to_string()),
            None => (option, "true".to_string()),
        };
        map.entry(name.to_lowercase()).or_default().push(value);
    }
    map
}

fn parse_authorized_key_entry(line: &str) -> Result<AuthorizedKeyEntry, KeyError> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return Err(KeyError::Parse("empty entry".into()));
    }
    let caps = LEADIN_PATTERN
        .captures(line)
        .ok_or_else(|| KeyError::Parse(format!("no key data delimiter: {}", line)))?;
    let lead = caps.get(1).map(|m| m.as_str().trim()).unwrap_or_default();
    let rest = caps.get(2).map(|m| m.as_str()).unwrap_or_default();

    if looks_like_key_type(lead) {
        return Ok(AuthorizedKeyEntry {
            key: SshKey::from_raw(line)?,
            options: HashMap::new(),
        });
    }

    let mut entry = parse_authorized_key_entry(rest)?;
    entry.options = parse_login_options(lead);
    Ok(entry)
}

/// 从 `environment="gbPerm=<code>"` 读取权限，以最后一个为准
fn permission_from_options(entry: &AuthorizedKeyEntry) -> Option<KeyPermission> {
    let mut permission = None;
    for env in entry.options.get("environment").into_iter().flatten() {
        let Some(caps) = GB_PERM_PATTERN.captures(env) else {
            continue;
        };
        let code = caps.get(1).map(|m| m.as_str().trim()).unwrap_or_default();
        match KeyPermission::from_code_or_name(code) {
            Some(p) => permission = Some(p),
            None => warn!("SSH 公钥条目 {} 的权限 ({}) 无效", env, code),
        }
    }
    permission
}

/// 去掉 `DOMAIN\` 前缀
fn simple_username(username: &str) -> &str {
    username.rsplit('\\').next().unwrap_or(username)
}

/// 基于目录属性的只读存储。
///
/// 属性可以写成 `attribute:prefix`，此时多值属性中只使用以 `prefix:` 开头的值。
/// 没有 `gbPerm` 选项的公钥允许推送。存储总是过期，每次访问都查询目录。
pub struct LdapKeyStore {
    directory: Arc<dyn DirectoryLookup>,
    attribute: String,
    prefix: Option<String>,
}

impl LdapKeyStore {
    pub fn new(directory: Arc<dyn DirectoryLookup>, attribute_setting: &str) -> Self {
        let (attribute, prefix) = match attribute_setting.split_once(':') {
            Some((attr, prefix)) if !attr.is_empty() => (attr.to_string(), Some(prefix.to_string())),
            _ => (attribute_setting.to_string(), None),
        };
        Self {
            directory,
            attribute,
            prefix,
        }
    }

    /// 按前缀规则筛选，返回可用值中的公钥文本
    fn select_value<'a>(&self, value: &'a str) -> Option<&'a str> {
        match (PREFIX_PATTERN.captures(value), &self.prefix) {
            (Some(caps), Some(prefix)) => {
                let found = caps.get(1)?.as_str().trim();
                if found.eq_ignore_ascii_case(prefix) {
                    Some(&value[caps.get(0)?.end()..])
                } else {
                    None
                }
            }
            (Some(_), None) | (None, Some(_)) => None,
            (None, None) => Some(value),
        }
    }
}

#[async_trait]
impl PublicKeyStore for LdapKeyStore {
    fn name(&self) -> &'static str {
        "ldap"
    }

    async fn is_stale(&self, _username: &str) -> bool {
        true
    }

    async fn load_keys(&self, username: &str) -> Result<Vec<SshKey>, KeyStoreError> {
        let user = simple_username(username);
        debug!("从 LDAP 目录读取 {} 的公钥", user);
        let Some(values) = self.directory.lookup(user, &self.attribute).await? else {
            return Ok(Vec::new());
        };

        let mut keys = Vec::with_capacity(values.len());
        for value in values {
            let value: String = value.replace("\r\n", "\n").split('\n').collect();
            let Some(text) = self.select_value(&value) else {
                continue;
            };
            match parse_authorized_key_entry(text) {
                Ok(entry) => {
                    // 目录中的公钥没有 gbPerm 时允许推送
                    let permission = permission_from_options(&entry).unwrap_or(KeyPermission::Push);
                    let mut key = entry.key;
                    key.set_permission(permission);
                    keys.push(key);
                }
                Err(e) => info!("无法解析 {} 的公钥条目 {}: {}", username, value, e),
            }
        }
        Ok(keys)
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
    use crate::ssh_key::tests::{ALICE_ED25519, ALICE_RSA, BOB_ED25519};
    use std::sync::Mutex;

    /// 内存中的目录，记录查询过的用户名
    #[derive(Default)]
    struct FakeDirectory {
        entries: HashMap<String, Vec<String>>,
        queries: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl DirectoryLookup for FakeDirectory {
        async fn lookup(&self, username: &str, attribute: &str) -> Result<Option<Vec<String>>, KeyStoreError> {
            assert_eq!(attribute, "sshPublicKey");
            self.queries.lock().unwrap().push(username.to_string());
            Ok(self.entries.get(username).cloned())
        }
    }

    fn store(values: Vec<String>, setting: &str) -> (LdapKeyStore, Arc<FakeDirectory>) {
        let mut dir = FakeDirectory::default();
        dir.entries.insert("alice".into(), values);
        let dir = Arc::new(dir);
        (LdapKeyStore::new(dir.clone(), setting), dir)
    }

    #[tokio::test]
    async fn reads_plain_keys() {
        let (store, _) = store(vec![ALICE_ED25519.into(), ALICE_RSA.into()], "sshPublicKey");
        let keys = store.load_keys("alice").await.unwrap();
        assert_eq!(keys.len(), 2);
        assert_eq!(keys[0].comment(), "alice@laptop");
        assert_eq!(keys[0].permission(), KeyPermission::Push);
        assert_eq!(keys[1].permission(), KeyPermission::Push);
        assert!(store.load_keys("carol").await.unwrap().is_empty());
        assert!(store.is_stale("alice").await);
    }

    #[tokio::test]
    async fn strips_domain_prefix() {
        let (store, dir) = store(vec![ALICE_ED25519.into()], "sshPublicKey");
        assert_eq!(store.load_keys("CORP\\alice").await.unwrap().len(), 1);
        assert_eq!(dir.queries.lock().unwrap().as_slice(), &["alice".to_string()]);
    }

    #[tokio::test]
    async fn prefix_selects_entries() {
        let values = vec![
            format!("SSHKey: {}", ALICE_ED25519),
            format!("X509:{}", BOB_ED25519),
            ALICE_RSA.to_string(),
        ];
        let (prefixed, _) = store(values.clone(), "sshPublicKey:sshkey");
        let keys = prefixed.load_keys("alice").await.unwrap();
        assert_eq!(keys.len(), 1);
        assert_eq!(keys[0], SshKey::from_raw(ALICE_ED25519).unwrap());

        // 未配置前缀时跳过带前缀的条目
        let (plain, _) = store(values, "sshPublicKey");
        let keys = plain.load_keys("alice").await.unwrap();
        assert_eq!(keys.len(), 1);
        assert_eq!(keys[0].algorithm(), "ssh-rsa");
    }

    #[tokio::test]
    async fn permission_from_environment_option() {
        let values = vec![
            format!(r#"environment="gbPerm=V" {}"#, ALICE_ED25519),
            format!(
                r#"from="10.0.0.0/8,host.example.com",environment="LANG=C",environment="gbPerm=RW" {}"#,
                BOB_ED25519
            ),
            format!(r#"no-pty,environment="gbperm = clone" {}"#, ALICE_RSA),
        ];
        let (store, _) = store(values, "sshPublicKey");
        let keys = store.load_keys("alice").await.unwrap();
        assert_eq!(keys.len(), 3);
        assert_eq!(keys[0].permission(), KeyPermission::View);
        assert_eq!(keys[1].permission(), KeyPermission::Push);
        assert_eq!(keys[1].comment(), "bob@desktop");
        assert_eq!(keys[2].permission(), KeyPermission::Clone);
    }

    #[tokio::test]
    async fn invalid_permission_keeps_default() {
        let values = vec![format!(r#"environment="gbPerm=RW+" {}"#, ALICE_ED25519)];
        let (store, _) = store(values, "sshPublicKey");
        let keys = store.load_keys("alice").await.unwrap();
        assert_eq!(keys[0].permission(), KeyPermission::Push);
    }

    #[tokio::test]
    async fn entries_without_gb_perm_can_push() {
        let values = vec![
            ALICE_ED25519.to_string(),
            format!(r#"no-pty,environment="LANG=C" {}"#, BOB_ED25519),
        ];
        let (store, _) = store(values, "sshPublicKey");
        let keys = store.load_keys("alice").await.unwrap();
        assert_eq!(keys.len(), 2);
        assert!(keys.iter().all(|k| k.permission() == KeyPermission::Push));
        assert!(keys[1].permission().can_push());
    }

    #[tokio::test]
    async fn unparsable_entries_are_skipped() {
        let values = vec!["garbage".to_string(), ALICE_ED25519.to_string()];
        let (store, _) = store(values, "sshPublicKey");
        assert_eq!(store.load_keys("alice").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn rejects_mutations() {
        let (store, _) = store(vec![], "sshPublicKey");
        let key = SshKey::from_raw(ALICE_ED25519).unwrap();
        assert!(matches!(
            store.add_key("alice", &key).await,
            Err(KeyStoreError::Unsupported("ldap"))
        ));
        assert!(store.remove_all_keys("alice").await.is_err());
        assert!(!store.supports_writing_keys());
    }

    #[test]
    fn login_options_keep_quoted_commas() {
        let opts = parse_login_options(r#"from="a,b",no-pty,environment="X=1",environment="Y=2""#);
        assert_eq!(opts["from"], vec!["a,b".to_string()]);
        assert_eq!(opts["no-pty"], vec!["true".to_string()]);
        assert_eq!(opts["environment"], vec!["X=1".to_string(), "Y=2".to_string()]);
    }
}
