//! 插件注册表：静态链接的命令扩展 + TOML 插件目录

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use serde::Deserialize;
use tracing::{info, warn};

use crate::commands::dispatch::CommandNode;
use crate::error::{ConfigError, PluginError};

/// 提供合并到根调度器的命令子树。
///
/// 提供者编译进程序，启动时交给守护进程；插件启动后其命令才可用。
pub trait CommandProvider: Send + Sync {
    fn plugin_id(&self) -> &str;

    fn version(&self) -> &str;

    fn description(&self) -> &str {
        ""
    }

    fn commands(&self) -> Vec<CommandNode>;
}

#[derive(Debug, Clone, Deserialize)]
pub struct PluginRelease {
    pub version: String,
    #[serde(default)]
    pub date: Option<String>,
    #[serde(default)]
    pub requires: Option<String>,
}

/// 注册表中的插件
#[derive(Debug, Clone, Deserialize)]
pub struct PluginRegistration {
    pub id: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub provider: Option<String>,
    #[serde(default)]
    pub homepage: Option<String>,
    /// 最后一个为最新版本
    #[serde(default)]
    pub releases: Vec<PluginRelease>,
}

impl PluginRegistration {
    pub fn latest(&self) -> Option<&PluginRelease> {
        self.releases.last()
    }

    pub fn release(&self, version: &str) -> Option<&PluginRelease> {
        self.releases.iter().find(|r| r.version == version)
    }
}

#[derive(Debug, Default, Deserialize)]
struct RegistryFile {
    #[serde(default, rename = "plugin")]
    plugins: Vec<PluginRegistration>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PluginState {
    Started,
    Stopped,
    Disabled,
}

impl fmt::Display for PluginState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PluginState::Started => "STARTED",
            PluginState::Stopped => "STOPPED",
            PluginState::Disabled => "DISABLED",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone)]
pub struct InstalledPlugin {
    pub id: String,
    pub version: String,
    pub description: String,
    pub state: PluginState,
}

/// 插件注册表，启动时构建一次
pub struct PluginManager {
    registry_file: Option<PathBuf>,
    registry: RwLock<Vec<PluginRegistration>>,
    installed: RwLock<BTreeMap<String, InstalledPlugin>>,
    providers: Vec<Arc<dyn CommandProvider>>,
}

impl PluginManager {
    /// 编译进来的插件初始为已安装、已启动
    pub fn new(registry_file: Option<PathBuf>, providers: Vec<Arc<dyn CommandProvider>>) -> Self {
        let installed = providers
            .iter()
            .map(|p| {
                let plugin = InstalledPlugin {
                    id: p.plugin_id().to_string(),
                    version: p.version().to_string(),
                    description: p.description().to_string(),
                    state: PluginState::Started,
                };
                (plugin.id.clone(), plugin)
            })
            .collect();
        Self {
            registry_file,
            registry: RwLock::new(Vec::new()),
            installed: RwLock::new(installed),
            providers,
        }
    }

    /// 重新读取注册表文件，返回注册的插件数
    pub async fn refresh(&self) -> Result<usize, PluginError> {
        let registrations = match &self.registry_file {
            Some(path) => read_registry(path).await?,
            None => Vec::new(),
        };
        let count = registrations.len();
        *self.registry.write().unwrap_or_else(|e| e.into_inner()) = registrations;
        info!(count, "插件注册表已刷新");
        Ok(count)
    }

    pub fn available(&self) -> Vec<PluginRegistration> {
        self.registry.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// 按 id 排序的已安装插件
    pub fn installed(&self) -> Vec<InstalledPlugin> {
        self.installed
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect()
    }

    pub fn registration(&self, id: &str) -> Option<PluginRegistration> {
        self.available().into_iter().find(|r| r.id == id)
    }

    /// 按 id 或从 1 开始的序号查找已安装插件
    pub fn lookup(&self, id_or_index: &str) -> Result<InstalledPlugin, PluginError> {
        let installed = self.installed();
        if let Ok(index) = id_or_index.parse::<usize>() {
            return index
                .checked_sub(1)
                .and_then(|i| installed.get(i))
                .cloned()
                .ok_or(PluginError::InvalidIndex(index));
        }
        installed
            .into_iter()
            .find(|p| p.id == id_or_index)
            .ok_or_else(|| PluginError::NotInstalled(id_or_index.to_string()))
    }

    pub fn is_started(&self, id: &str) -> bool {
        self.installed
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
            .is_some_and(|p| p.state == PluginState::Started)
    }

    fn update<T>(&self, id: &str, f: impl FnOnce(&mut InstalledPlugin) -> Result<T, PluginError>) -> Result<T, PluginError> {
        let mut installed = self.installed.write().unwrap_or_else(|e| e.into_inner());
        let plugin = installed
            .get_mut(id)
            .ok_or_else(|| PluginError::NotInstalled(id.to_string()))?;
        f(plugin)
    }

    /// 插件已经启动时返回 `false`
    pub fn start(&self, id: &str) -> Result<bool, PluginError> {
        self.update(id, |p| match p.state {
            PluginState::Disabled => Err(PluginError::Disabled(p.id.clone())),
            PluginState::Started => Ok(false),
            PluginState::Stopped => {
                p.state = PluginState::Started;
                info!(plugin = %p.id, "插件已启动");
                Ok(true)
            }
        })
    }

    /// 插件未运行时返回 `false`
    pub fn stop(&self, id: &str) -> Result<bool, PluginError> {
        self.update(id, |p| match p.state {
            PluginState::Started => {
                p.state = PluginState::Stopped;
                info!(plugin = %p.id, "插件已停止");
                Ok(true)
            }
            _ => Ok(false),
        })
    }

    pub fn enable(&self, id: &str) -> Result<bool, PluginError> {
        self.update(id, |p| {
            if p.state != PluginState::Disabled {
                return Ok(false);
            }
            p.state = PluginState::Stopped;
            Ok(true)
        })
    }

    pub fn disable(&self, id: &str) -> Result<bool, PluginError> {
        self.update(id, |p| {
            if p.state == PluginState::Disabled {
                return Ok(false);
            }
            p.state = PluginState::Disabled;
            Ok(true)
        })
    }

    /// 安装并启动注册表中或编译进来的插件
    pub fn install(&self, id: &str, version: Option<&str>) -> Result<InstalledPlugin, PluginError> {
        if self.installed.read().unwrap_or_else(|e| e.into_inner()).contains_key(id) {
            return Err(PluginError::AlreadyInstalled(id.to_string()));
        }
        let provider = self.providers.iter().find(|p| p.plugin_id() == id);
        let (version, description) = match (self.registration(id), provider) {
            (Some(registration), _) => {
                let release = match version {
                    Some(v) => registration.release(v).ok_or_else(|| PluginError::VersionNotAvailable {
                        id: id.to_string(),
                        version: v.to_string(),
                    })?,
                    None => registration
                        .latest()
                        .ok_or_else(|| PluginError::NotAvailable(id.to_string()))?,
                };
                (release.version.clone(), registration.description.clone())
            }
            (None, Some(provider)) => (provider.version().to_string(), provider.description().to_string()),
            (None, None) => return Err(PluginError::NotAvailable(id.to_string())),
        };
        if provider.is_none() {
            warn!(plugin = id, "插件未链接到当前程序，不提供命令");
        }
        let plugin = InstalledPlugin {
            id: id.to_string(),
            version,
            description,
            state: PluginState::Started,
        };
        self.installed
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(plugin.id.clone(), plugin.clone());
        info!(plugin = id, version = %plugin.version, "插件已安装");
        Ok(plugin)
    }

    pub fn uninstall(&self, id: &str) -> Result<InstalledPlugin, PluginError> {
        let removed = self
            .installed
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(id)
            .ok_or_else(|| PluginError::NotInstalled(id.to_string()))?;
        info!(plugin = id, "插件已卸载");
        Ok(removed)
    }

    /// 所有插件提供的命令子树，标记所属插件
    pub fn extension_commands(&self) -> Vec<CommandNode> {
        self.providers
            .iter()
            .flat_map(|p| {
                let id = p.plugin_id().to_string();
                p.commands().into_iter().map(move |node| node.plugin(&id))
            })
            .collect()
    }
}

async fn read_registry(path: &Path) -> Result<Vec<PluginRegistration>, ConfigError> {
    let content = tokio::fs::read_to_string(path).await.map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let registry: RegistryFile = toml::from_str(&content).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(registry.plugins)
}
