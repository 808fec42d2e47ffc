//! 守护进程配置：TOML 文件 + 默认值，命令行参数在 main 中覆盖

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::auth::UserModel;
use crate::error::ConfigError;

/// 向 SSH 客户端提供的认证方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AuthMethod {
    #[serde(rename = "publickey")]
    PublicKey,
    Password,
    KeyboardInteractive,
    GssapiWithMic,
}

/// SSH 公钥的存储后端
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum KeyStoreKind {
    Memory,
    #[default]
    File,
    Ldap,
    /// 禁用公钥认证
    None,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LdapSettings {
    pub url: String,
    pub bind_dn: Option<String>,
    pub bind_password: Option<String>,
    pub base_dn: String,
    /// `${username}` 替换为转义后的登录名
    pub user_filter: String,
    /// `attribute` 或 `attribute:prefix`
    pub ssh_public_key: String,
}

impl Default for LdapSettings {
    fn default() -> Self {
        Self {
            url: "ldap://localhost:389".into(),
            bind_dn: None,
            bind_password: None,
            base_dn: String::new(),
            user_filter: "(&(objectClass=person)(uid=${username}))".into(),
            ssh_public_key: "sshPublicKey".into(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct KerberosSettings {
    /// 去掉 `DOMAIN\` 前缀再比较用户名
    pub strip_domain: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PluginSettings {
    /// 可安装插件的 TOML 注册表
    pub registry_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    pub listen_addr: String,
    pub port: u16,
    /// 不存在的主机密钥文件会自动生成 Ed25519 密钥
    pub host_key_paths: Vec<PathBuf>,
    pub auth_methods: Vec<AuthMethod>,
    pub command_start_threads: usize,
    pub command_worker_threads: usize,
    pub inactivity_timeout_secs: u64,
    pub auth_rejection_time_secs: u64,
    /// 克隆地址中显示的主机名，默认为 `listen_addr`
    pub advertised_host: Option<String>,
    pub advertised_port: Option<u16>,
    pub repositories_folder: PathBuf,
    pub git_binary: PathBuf,
    pub upload_pack_enabled: bool,
    pub receive_pack_enabled: bool,
    pub key_store: KeyStoreKind,
    pub ssh_keys_folder: PathBuf,
    pub ldap: LdapSettings,
    pub kerberos: KerberosSettings,
    pub plugins: PluginSettings,
    pub users: Vec<UserModel>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0".into(),
            port: 29418,
            host_key_paths: vec![PathBuf::from("ssh-ed25519.key")],
            auth_methods: vec![AuthMethod::PublicKey, AuthMethod::Password, AuthMethod::KeyboardInteractive],
            command_start_threads: 2,
            command_worker_threads: 4,
            inactivity_timeout_secs: 3600,
            auth_rejection_time_secs: 3,
            advertised_host: None,
            advertised_port: None,
            repositories_folder: PathBuf::from("git"),
            git_binary: PathBuf::from("git"),
            upload_pack_enabled: true,
            receive_pack_enabled: true,
            key_store: KeyStoreKind::default(),
            ssh_keys_folder: PathBuf::from("ssh"),
            ldap: LdapSettings::default(),
            kerberos: KerberosSettings::default(),
            plugins: PluginSettings::default(),
            users: Vec::new(),
        }
    }
}

impl DaemonConfig {
    pub fn from_toml(content: &str, path: &Path) -> Result<Self, ConfigError> {
        let config: DaemonConfig = toml::from_str(content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&content, path)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.command_start_threads == 0 || self.command_worker_threads == 0 {
            return Err(ConfigError::Invalid("command thread pools need at least one thread".into()));
        }
        if self.auth_methods.is_empty() {
            return Err(ConfigError::Invalid("no SSH authentication methods enabled".into()));
        }
        if self.key_store == KeyStoreKind::Ldap && self.ldap.base_dn.is_empty() {
            return Err(ConfigError::Invalid("ldap.base_dn is required for the ldap key store".into()));
        }
        Ok(())
    }

    pub fn method_enabled(&self, method: AuthMethod) -> bool {
        self.auth_methods.contains(&method)
    }

    pub fn display_host(&self) -> &str {
        self.advertised_host.as_deref().unwrap_or(&self.listen_addr)
    }

    pub fn display_port(&self) -> u16 {
        self.advertised_port.unwrap_or(self.port)
    }

    /// 显示给用户的克隆地址，标准端口使用简短形式
    pub fn format_url(&self, username: &str, repository: &str) -> String {
        let port = self.display_port();
        if port == 22 {
            format!("{}@{}/{}", username, self.display_host(), repository)
        } else {
            format!("ssh://{}@{}:{}/{}", username, self.display_host(), port, repository)
        }
    }
}
