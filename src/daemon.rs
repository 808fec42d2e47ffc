//! SSH 守护进程：主机密钥、russh 服务器配置和每个连接的会话处理器

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use russh::keys::ssh_key::{LineEnding, PublicKey};
use russh::keys::{Algorithm, PrivateKey};
use russh::server::{Auth, Msg, Server, Session};
use russh::{Channel, ChannelId, MethodKind, MethodSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn};

use crate::auth::{
    AuthenticationManager, CachingPublicKeyAuthenticator, KerberosAuthenticator, PasswordAuthenticator,
    PublicKeyAuthenticator, PublicKeyVerifier,
};
use crate::channel::{channel_io, ChannelExit, SshChannelCommunicator};
use crate::commands::{Services, SshCommandFactory};
use crate::config::{AuthMethod, DaemonConfig};
use crate::session::SshDaemonClient;
use crate::welcome;

/// 加载主机密钥，文件不存在时生成 Ed25519 密钥
pub fn load_host_keys(paths: &[PathBuf]) -> Result<Vec<PrivateKey>> {
    let mut keys = Vec::with_capacity(paths.len());
    for path in paths {
        if path.exists() {
            info!(path = %path.display(), "加载主机密钥");
            keys.push(e!(russh::keys::load_secret_key(path, None), "读取主机密钥 {} 失败", path.display())?);
        } else {
            keys.push(generate_host_key(path)?);
        }
    }
    if keys.is_empty() {
        anyhow::bail!("没有配置主机密钥");
    }
    Ok(keys)
}

fn generate_host_key(path: &Path) -> Result<PrivateKey> {
    info!(path = %path.display(), "主机密钥不存在，生成新的 Ed25519 密钥");
    let key = PrivateKey::random(&mut rand::thread_rng(), Algorithm::Ed25519).context("生成主机密钥失败")?;
    let encoded = key.to_openssh(LineEnding::LF).context("编码主机密钥失败")?;

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        e!(std::fs::create_dir_all(parent), "创建目录 {} 失败", parent.display())?;
    }
    e!(std::fs::write(path, encoded.as_bytes()), "写入主机密钥 {} 失败", path.display())?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        e!(
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)),
            "设置主机密钥 {} 权限失败",
            path.display()
        )?;
    }
    Ok(key)
}

/// 提供给客户端的认证方式；russh 不支持 gssapi-with-mic
fn method_kinds(config: &DaemonConfig) -> Vec<MethodKind> {
    config
        .auth_methods
        .iter()
        .filter_map(|m| match m {
            AuthMethod::PublicKey => Some(MethodKind::PublicKey),
            AuthMethod::Password => Some(MethodKind::Password),
            AuthMethod::KeyboardInteractive => Some(MethodKind::KeyboardInteractive),
            AuthMethod::GssapiWithMic => None,
        })
        .collect()
}

/// SSH 守护进程：接受连接，并为每个连接创建 [`SshSession`]
#[derive(Clone)]
pub struct SshDaemon {
    config: Arc<DaemonConfig>,
    factory: SshCommandFactory,
    public_key: Arc<dyn PublicKeyAuthenticator>,
    password: Arc<PasswordAuthenticator>,
    kerberos: Arc<KerberosAuthenticator>,
    next_id: Arc<AtomicUsize>,
    shutdown: CancellationToken,
}

impl SshDaemon {
    pub fn new(services: Arc<Services>, manager: Arc<dyn AuthenticationManager>) -> Result<Self> {
        let config = services.config.clone();
        let factory = SshCommandFactory::new(
            services.clone(),
            config.command_start_threads,
            config.command_worker_threads,
        )
        .context("组装命令树失败")?;
        let verifier = Arc::new(PublicKeyVerifier::new(services.keys.clone(), manager.clone()));

        if config.method_enabled(AuthMethod::GssapiWithMic) {
            warn!("SSH 传输层不支持 gssapi-with-mic，Kerberos 认证不可用");
        }

        Ok(Self {
            public_key: Arc::new(CachingPublicKeyAuthenticator::new(verifier)),
            password: Arc::new(PasswordAuthenticator::new(manager.clone())),
            kerberos: Arc::new(KerberosAuthenticator::new(manager, config.kerberos.strip_domain)),
            config,
            factory,
            next_id: Arc::new(AtomicUsize::new(1)),
            shutdown: CancellationToken::new(),
        })
    }

    pub fn config(&self) -> &DaemonConfig {
        &self.config
    }

    pub fn factory(&self) -> &SshCommandFactory {
        &self.factory
    }

    fn russh_config(&self, keys: Vec<PrivateKey>) -> russh::server::Config {
        russh::server::Config {
            inactivity_timeout: Some(Duration::from_secs(self.config.inactivity_timeout_secs)),
            auth_rejection_time: Duration::from_secs(self.config.auth_rejection_time_secs),
            auth_rejection_time_initial: Some(Duration::from_secs(0)),
            methods: MethodSet::from(&method_kinds(&self.config)[..]),
            keys,
            ..Default::default()
        }
    }

    /// 持续服务，直到调用 [`SshDaemon::stop`]
    pub async fn run(&self) -> Result<()> {
        let keys = load_host_keys(&self.config.host_key_paths)?;
        let config = Arc::new(self.russh_config(keys));
        let addr = (self.config.listen_addr.as_str(), self.config.port);
        info!("在 {}:{} 上启动 SSH 守护进程", addr.0, addr.1);

        let mut server = self.clone();
        tokio::select! {
            r = server.run_on_address(config, addr) => {
                r.with_context(|| format!("监听 {}:{} 失败", addr.0, addr.1))?;
            }
            _ = self.shutdown.cancelled() => {
                info!("SSH 守护进程已停止");
            }
        }
        Ok(())
    }

    /// 停止接受连接并取消正在运行的命令
    pub fn stop(&self) {
        self.shutdown.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}

impl Server for SshDaemon {
    type Handler = SshSession;

    fn new_client(&mut self, addr: Option<SocketAddr>) -> SshSession {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        info!(session_id = id, remote = ?addr, "新客户端连接");
        SshSession {
            client: Arc::new(SshDaemonClient::new(id, addr)),
            config: self.config.clone(),
            factory: self.factory.clone(),
            public_key: self.public_key.clone(),
            password: self.password.clone(),
            kerberos: self.kerberos.clone(),
            channels: HashMap::new(),
            cancel: self.shutdown.child_token(),
        }
    }

    fn handle_session_error(&mut self, error: <Self::Handler as russh::server::Handler>::Error) {
        error!("会话错误: {:#}", error);
    }
}

/// 每个连接的处理器
pub struct SshSession {
    client: Arc<SshDaemonClient>,
    config: Arc<DaemonConfig>,
    factory: SshCommandFactory,
    public_key: Arc<dyn PublicKeyAuthenticator>,
    password: Arc<PasswordAuthenticator>,
    kerberos: Arc<KerberosAuthenticator>,
    channels: HashMap<ChannelId, Channel<Msg>>,
    cancel: CancellationToken,
}

impl SshSession {
    pub fn client(&self) -> &Arc<SshDaemonClient> {
        &self.client
    }

    fn verdict(accepted: bool) -> Auth {
        if accepted {
            Auth::Accept
        } else {
            Auth::reject()
        }
    }

    /// 接受传输层通过 Kerberos 建立的身份
    pub async fn authenticate_principal(&self, user: &str, principal: &str) -> Auth {
        if !self.config.method_enabled(AuthMethod::GssapiWithMic) {
            return Auth::reject();
        }
        Self::verdict(self.kerberos.authenticate(user, principal, &self.client).await)
    }

    /// 连接上启动的命令通过这个令牌取消
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }
}

impl russh::server::Handler for SshSession {
    type Error = anyhow::Error;

    async fn auth_none(&mut self, user: &str) -> Result<Auth, Self::Error> {
        debug!(session_id = self.client.id(), username = %user, "拒绝无认证登录");
        Ok(Auth::reject())
    }

    async fn auth_password(&mut self, user: &str, password: &str) -> Result<Auth, Self::Error> {
        if !self.config.method_enabled(AuthMethod::Password) {
            return Ok(Auth::reject());
        }
        Ok(Self::verdict(self.password.authenticate(user, password, &self.client).await))
    }

    async fn auth_publickey(&mut self, user: &str, public_key: &PublicKey) -> Result<Auth, Self::Error> {
        if !self.config.method_enabled(AuthMethod::PublicKey) {
            return Ok(Auth::reject());
        }
        Ok(Self::verdict(
            self.public_key.authenticate(user, public_key, &self.client).await,
        ))
    }

    async fn auth_keyboard_interactive(
        &mut self,
        user: &str,
        _submethods: &str,
        response: Option<russh::server::Response<'_>>,
    ) -> Result<Auth, Self::Error> {
        if !self.config.method_enabled(AuthMethod::KeyboardInteractive) {
            return Ok(Auth::reject());
        }
        match response {
            None => Ok(Auth::Partial {
                name: "Password authentication".into(),
                instructions: "".into(),
                prompts: vec![("Password: ".into(), false)].into(),
            }),
            Some(response) => {
                let answers: Vec<String> = response
                    .into_iter()
                    .map(|r| String::from_utf8_lossy(&r).to_string())
                    .collect();
                let Some(password) = answers.first() else {
                    return Ok(Auth::reject());
                };
                Ok(Self::verdict(self.password.authenticate(user, password, &self.client).await))
            }
        }
    }

    async fn auth_succeeded(&mut self, _session: &mut Session) -> Result<(), Self::Error> {
        info!(
            session_id = self.client.id(),
            username = self.client.username().unwrap_or_default(),
            "用户已登录"
        );
        Ok(())
    }

    async fn channel_open_session(&mut self, channel: Channel<Msg>, _session: &mut Session) -> Result<bool, Self::Error> {
        let _span = info_span!("ssh_session", session_id = self.client.id(), channel_id = ?channel.id()).entered();
        debug!("会话通道已打开");
        self.channels.insert(channel.id(), channel);
        Ok(true)
    }

    async fn channel_open_direct_tcpip(
        &mut self,
        _channel: Channel<Msg>,
        host_to_connect: &str,
        port_to_connect: u32,
        _originator_address: &str,
        _originator_port: u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        warn!(
            session_id = self.client.id(),
            target = %format!("{}:{}", host_to_connect, port_to_connect),
            "拒绝 direct-tcpip 通道"
        );
        Ok(false)
    }

    async fn tcpip_forward(&mut self, address: &str, port: &mut u32, _session: &mut Session) -> Result<bool, Self::Error> {
        warn!(session_id = self.client.id(), address = %address, port = %port, "拒绝端口转发请求");
        Ok(false)
    }

    async fn env_request(
        &mut self,
        _channel: ChannelId,
        variable_name: &str,
        variable_value: &str,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        // git 客户端通过 GIT_PROTOCOL 协商协议 v2
        if variable_name == "GIT_PROTOCOL" {
            debug!(session_id = self.client.id(), value = %variable_value, "记录 GIT_PROTOCOL");
            self.client.set_git_protocol(variable_value);
        }
        Ok(())
    }

    async fn exec_request(&mut self, channel_id: ChannelId, data: &[u8], session: &mut Session) -> Result<(), Self::Error> {
        let line = String::from_utf8_lossy(data).to_string();
        info!(
            session_id = self.client.id(),
            username = self.client.username().unwrap_or_default(),
            command = %line,
            "收到执行命令请求"
        );
        let Some(channel) = self.channels.remove(&channel_id) else {
            warn!(session_id = self.client.id(), channel_id = ?channel_id, "找不到对应的通道");
            session.channel_failure(channel_id)?;
            return Ok(());
        };
        session.channel_success(channel_id)?;

        let communicator = Arc::new(SshChannelCommunicator::new(session.handle(), channel_id));
        let exit = Arc::new(ChannelExit::new(communicator));
        self.factory.start(
            self.client.clone(),
            line,
            channel_io(channel),
            exit,
            self.cancel.child_token(),
        );
        Ok(())
    }

    async fn shell_request(&mut self, channel_id: ChannelId, session: &mut Session) -> Result<(), Self::Error> {
        info!(session_id = self.client.id(), "收到 shell 请求，发送欢迎信息");
        self.channels.remove(&channel_id);
        session.channel_success(channel_id)?;

        let usage = self.factory.usage(self.client.clone());
        let message = welcome::message(&self.config, &self.client, &usage);
        let communicator = Arc::new(SshChannelCommunicator::new(session.handle(), channel_id));
        tokio::spawn(async move { welcome::greet(communicator, &message).await });
        Ok(())
    }

    async fn subsystem_request(&mut self, channel_id: ChannelId, name: &str, session: &mut Session) -> Result<(), Self::Error> {
        warn!(session_id = self.client.id(), subsystem = %name, "不支持的子系统请求");
        session.channel_failure(channel_id)?;
        Ok(())
    }

    async fn channel_eof(&mut self, channel: ChannelId, _session: &mut Session) -> Result<(), Self::Error> {
        debug!(session_id = self.client.id(), channel_id = ?channel, "通道收到EOF");
        Ok(())
    }

    async fn channel_close(&mut self, channel: ChannelId, _session: &mut Session) -> Result<(), Self::Error> {
        debug!(session_id = self.client.id(), channel_id = ?channel, "客户端关闭通道");
        self.channels.remove(&channel);
        Ok(())
    }
}

impl Drop for SshSession {
    fn drop(&mut self) {
        // 连接断开：取消可取消的命令，清除认证缓存
        self.cancel.cancel();
        self.public_key.session_closed(&self.client);
        info!(
            session_id = self.client.id(),
            username = self.client.username().unwrap_or_default(),
            "会话已关闭"
        );
    }
}
