use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tracing::{info, warn, Level};

use gitblit_ssh::auth::ConfigUserManager;
use gitblit_ssh::commands::Services;
use gitblit_ssh::config::{DaemonConfig, KeyStoreKind};
use gitblit_ssh::keys::{
    FileKeyStore, KeyManager, LdapDirectory, LdapKeyStore, MemoryKeyStore, NullKeyStore, PublicKeyStore,
};
use gitblit_ssh::pack::GitProcess;
use gitblit_ssh::plugins::PluginManager;
use gitblit_ssh::repository::RepositoryManager;
use gitblit_ssh::{setup_logging, try_log, SshDaemon};

const DEFAULT_CONFIG: &str = "gitblit.toml";

#[derive(Parser, Debug)]
#[clap(author, version, about = "Gitblit SSH 守护进程：git 传输和管理命令", long_about = None)]
struct Args {
    /// 配置文件路径，默认读取当前目录下的 gitblit.toml（如果存在）
    #[clap(short, long)]
    config: Option<PathBuf>,

    /// 监听地址
    #[clap(short = 'L', long)]
    listen: Option<IpAddr>,

    /// 监听端口
    #[clap(short, long)]
    port: Option<u16>,

    /// 仓库根目录
    #[clap(short, long)]
    repositories: Option<PathBuf>,

    /// 主机密钥文件，可重复指定
    #[clap(short = 'k', long = "host-key")]
    host_keys: Vec<PathBuf>,

    /// 公钥存储
    #[clap(long, value_enum)]
    key_store: Option<KeyStoreKind>,
}

impl Args {
    fn load_config(&self) -> Result<DaemonConfig> {
        let mut config = match &self.config {
            Some(path) => try_log!(DaemonConfig::load(path), "加载配置文件失败")?,
            None if std::path::Path::new(DEFAULT_CONFIG).exists() => {
                try_log!(DaemonConfig::load(std::path::Path::new(DEFAULT_CONFIG)), "加载配置文件失败")?
            }
            None => {
                warn!("未找到配置文件，使用默认配置");
                DaemonConfig::default()
            }
        };

        if let Some(listen) = self.listen {
            config.listen_addr = listen.to_string();
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(repositories) = &self.repositories {
            config.repositories_folder = repositories.clone();
        }
        if !self.host_keys.is_empty() {
            config.host_key_paths = self.host_keys.clone();
        }
        if let Some(kind) = self.key_store {
            config.key_store = kind;
        }
        config.validate()?;
        Ok(config)
    }
}

fn key_store(config: &DaemonConfig) -> Arc<dyn PublicKeyStore> {
    match config.key_store {
        KeyStoreKind::Memory => Arc::new(MemoryKeyStore::new()),
        KeyStoreKind::File => Arc::new(FileKeyStore::new(config.ssh_keys_folder.clone())),
        KeyStoreKind::Ldap => Arc::new(LdapKeyStore::new(
            Arc::new(LdapDirectory::new(config.ldap.clone())),
            &config.ldap.ssh_public_key,
        )),
        KeyStoreKind::None => Arc::new(NullKeyStore),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_logging(Level::INFO, "GITBLIT_SSH");
    let args = Args::parse();
    let config = Arc::new(args.load_config()?);

    let keys = Arc::new(KeyManager::new(key_store(&config)));
    info!(store = keys.store_name(), "公钥存储已就绪");

    let plugins = Arc::new(PluginManager::new(config.plugins.registry_file.clone(), Vec::new()));
    if let Err(e) = plugins.refresh().await {
        warn!("读取插件注册表失败: {}", e);
    }

    let services = Arc::new(Services {
        config: config.clone(),
        keys,
        repositories: Arc::new(RepositoryManager::new(
            config.repositories_folder.clone(),
            config.upload_pack_enabled,
            config.receive_pack_enabled,
        )),
        pack: Arc::new(GitProcess::new(config.git_binary.clone())),
        plugins,
    });
    let users = Arc::new(ConfigUserManager::new(config.users.clone()));
    let daemon = SshDaemon::new(services, users)?;

    let stopper = daemon.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("正在关闭 SSH 守护进程...");
            stopper.stop();
        }
    });

    daemon.run().await
}
