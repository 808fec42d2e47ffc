//! 各层共享的错误类型

use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;

/// 解析公钥时的错误
#[derive(Debug, Error)]
pub enum KeyError {
    #[error("invalid public key: {0}")]
    Parse(String),

    #[error("'{0}' is not a valid SSH key permission (valid: V, R, RW)")]
    Permission(String),
}

/// 公钥存储的错误
#[derive(Debug, Error)]
pub enum KeyStoreError {
    #[error("key store I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{path}:{line}: {source}")]
    Corrupt {
        path: PathBuf,
        line: usize,
        #[source]
        source: KeyError,
    },

    #[error(transparent)]
    Key(#[from] KeyError),

    #[error("invalid username '{0}'")]
    InvalidUser(String),

    #[error("directory lookup failed: {0}")]
    Directory(String),

    #[error("the {0} key store does not support this operation")]
    Unsupported(&'static str),

    /// 缓存加载失败时共享给所有等待者的错误
    #[error(transparent)]
    Shared(Arc<KeyStoreError>),
}

/// 加载配置的错误
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// 仓库无法为 pack 服务打开的原因
#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("invalid repository path '{0}'")]
    InvalidPath(String),

    #[error("repository '{0}' not found")]
    NotFound(String),

    #[error("{user} is not authorized to {action} {repository}")]
    NotAuthorized {
        user: String,
        action: &'static str,
        repository: String,
    },

    #[error("{0} is not enabled on this server")]
    ServiceDisabled(&'static str),

    #[error("repository I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// 插件管理错误
#[derive(Debug, Error)]
pub enum PluginError {
    #[error("plugin '{0}' is not installed")]
    NotInstalled(String),

    #[error("plugin '{0}' is already installed")]
    AlreadyInstalled(String),

    #[error("plugin '{0}' is not available in the registry")]
    NotAvailable(String),

    #[error("version {version} of plugin '{id}' is not available")]
    VersionNotAvailable { id: String, version: String },

    #[error("plugin '{0}' is disabled")]
    Disabled(String),

    #[error("invalid plugin index {0}")]
    InvalidIndex(usize),

    #[error(transparent)]
    Registry(#[from] ConfigError),
}
