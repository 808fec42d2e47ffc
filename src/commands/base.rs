//! 命令执行引擎：I/O 绑定、参数解析失败处理、退出码转换

use std::any::Any;
use std::io;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use async_trait::async_trait;
use futures::FutureExt;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use super::work_queue::WorkQueue;
use crate::auth::UserModel;
use crate::config::DaemonConfig;
use crate::error::KeyStoreError;
use crate::keys::KeyManager;
use crate::pack::PackProtocol;
use crate::plugins::PluginManager;
use crate::repository::RepositoryResolver;
use crate::session::SshDaemonClient;

/// 命令被取消
pub const STATUS_CANCEL: u32 = 15;
/// 客户端断开，或命令不存在
pub const STATUS_NOT_FOUND: u32 = 127;
/// 未预期的内部错误
pub const STATUS_INTERNAL: u32 = 128;

const INTERNAL_ERROR_MESSAGE: &str = "fatal: internal server error";

/// 预期内的失败：消息写到客户端的错误输出，命令以 `exit_code` 退出。
/// 服务端不记录日志。
#[derive(Debug, Error)]
#[error("{message}")]
pub struct Failure {
    exit_code: u8,
    message: String,
}

impl Failure {
    pub fn new(exit_code: u8, message: impl Into<String>) -> Self {
        Self {
            exit_code,
            message: message.into(),
        }
    }

    pub fn exit_code(&self) -> u32 {
        self.exit_code as u32
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

#[derive(Debug, Error)]
pub enum CommandError {
    #[error(transparent)]
    Failure(#[from] Failure),

    /// 不带消息退出，命令已自行输出
    #[error("exit status {0}")]
    Exit(u8),

    #[error("command canceled")]
    Canceled,

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl From<KeyStoreError> for CommandError {
    fn from(e: KeyStoreError) -> Self {
        CommandError::Internal(anyhow::Error::new(e))
    }
}

impl CommandError {
    pub fn failure(exit_code: u8, message: impl Into<String>) -> Self {
        CommandError::Failure(Failure::new(exit_code, message))
    }

    /// 客户端在命令执行中断开
    pub fn is_teardown(&self) -> bool {
        match self {
            CommandError::Io(e) => is_teardown_io(e),
            CommandError::Internal(e) => e
                .chain()
                .any(|cause| cause.downcast_ref::<io::Error>().is_some_and(is_teardown_io)),
            _ => false,
        }
    }
}

fn is_teardown_io(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::NotConnected
            | io::ErrorKind::Interrupted
            | io::ErrorKind::UnexpectedEof
    )
}

/// 把 clap 解析错误转换为发给客户端的用法提示
pub fn usage_failure(err: clap::Error) -> CommandError {
    use clap::error::ErrorKind;

    let text = err.render().to_string();
    match err.kind() {
        ErrorKind::DisplayHelp | ErrorKind::DisplayHelpOnMissingArgumentOrSubcommand | ErrorKind::DisplayVersion => {
            CommandError::failure(1, text.trim_end())
        }
        _ => {
            let text = text.trim();
            let text = text.strip_prefix("error: ").unwrap_or(text);
            CommandError::failure(1, format!("fatal: {}", text))
        }
    }
}

/// 把命令结果映射为退出码和可选的错误输出
pub fn translate(command: &str, result: Result<(), CommandError>) -> (u32, Option<String>) {
    match result {
        Ok(()) => (0, None),
        Err(CommandError::Failure(f)) => (f.exit_code(), Some(f.message)),
        Err(CommandError::Exit(code)) => (code as u32, None),
        Err(CommandError::Canceled) => {
            debug!(command, "命令已取消");
            (STATUS_CANCEL, None)
        }
        Err(e) if e.is_teardown() => {
            debug!(command, error = %e, "客户端已断开");
            (STATUS_NOT_FOUND, None)
        }
        Err(e) => {
            error!(command, error = ?e, "命令执行出现内部错误");
            (STATUS_INTERNAL, Some(INTERNAL_ERROR_MESSAGE.to_string()))
        }
    }
}

pub type BoxedReader = Pin<Box<dyn AsyncRead + Send>>;
pub type BoxedWriter = Pin<Box<dyn AsyncWrite + Send>>;

/// 命令绑定的字节流
pub struct CommandIo {
    pub stdin: BoxedReader,
    pub stdout: BoxedWriter,
    pub stderr: BoxedWriter,
}

impl CommandIo {
    pub fn new(
        stdin: impl AsyncRead + Send + 'static,
        stdout: impl AsyncWrite + Send + 'static,
        stderr: impl AsyncWrite + Send + 'static,
    ) -> Self {
        Self {
            stdin: Box::pin(stdin),
            stdout: Box::pin(stdout),
            stderr: Box::pin(stderr),
        }
    }

    /// 内存中的流，输出收集到返回的缓冲区
    pub fn capture(stdin: impl AsyncRead + Send + 'static) -> (Self, Captured) {
        let captured = Captured::default();
        let io = Self::new(stdin, captured.stdout.clone(), captured.stderr.clone());
        (io, captured)
    }

    pub async fn println(&mut self, line: &str) -> io::Result<()> {
        self.stdout.write_all(line.as_bytes()).await?;
        self.stdout.write_all(b"\n").await
    }

    pub async fn eprintln(&mut self, line: &str) -> io::Result<()> {
        self.stderr.write_all(line.as_bytes()).await?;
        if !line.ends_with('\n') {
            self.stderr.write_all(b"\n").await?;
        }
        Ok(())
    }

    pub async fn read_stdin(&mut self) -> io::Result<String> {
        let mut buf = String::new();
        self.stdin.read_to_string(&mut buf).await?;
        Ok(buf)
    }

    pub async fn flush(&mut self) -> io::Result<()> {
        self.stdout.flush().await?;
        self.stderr.flush().await
    }
}

/// 可克隆的内存输出
#[derive(Clone, Default)]
pub struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

impl SharedBuffer {
    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap_or_else(|e| e.into_inner())).into_owned()
    }

    pub fn bytes(&self) -> Vec<u8> {
        self.0.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl AsyncWrite for SharedBuffer {
    fn poll_write(self: Pin<&mut Self>, _cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        self.0.lock().unwrap_or_else(|e| e.into_inner()).extend_from_slice(buf);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

#[derive(Clone, Default)]
pub struct Captured {
    pub stdout: SharedBuffer,
    pub stderr: SharedBuffer,
}

/// 所有命令共享的服务
pub struct Services {
    pub config: Arc<DaemonConfig>,
    pub keys: Arc<KeyManager>,
    pub repositories: Arc<dyn RepositoryResolver>,
    pub pack: Arc<dyn PackProtocol>,
    pub plugins: Arc<PluginManager>,
}

/// 单次命令调用的上下文
pub struct CommandContext {
    /// 完整命令名，例如 `gitblit keys add`
    pub name: String,
    pub client: Arc<SshDaemonClient>,
    pub services: Arc<Services>,
    pub cancel: CancellationToken,
}

impl CommandContext {
    pub fn user(&self) -> Result<&UserModel, CommandError> {
        self.client
            .user()
            .ok_or_else(|| CommandError::failure(1, "fatal: not authenticated"))
    }

    pub fn username(&self) -> Result<&str, CommandError> {
        self.user().map(|u| u.username.as_str())
    }
}

/// 可执行的叶子命令
#[async_trait]
pub trait SshCommand: Send {
    /// 可取消的命令在连接断开时被中断
    fn cancelable(&self) -> bool {
        false
    }

    async fn run(&mut self, ctx: &CommandContext, io: &mut CommandIo) -> Result<(), CommandError>;
}

/// 接收命令的退出码
#[async_trait]
pub trait ExitCallback: Send + Sync {
    async fn on_exit(&self, rc: u32);
}

/// 保证回调最多触发一次
pub struct ExitOnce {
    fired: AtomicBool,
    callback: Arc<dyn ExitCallback>,
}

impl ExitOnce {
    pub fn new(callback: Arc<dyn ExitCallback>) -> Self {
        Self {
            fired: AtomicBool::new(false),
            callback,
        }
    }

    /// 已经触发过时返回 `false`
    pub async fn fire(&self, rc: u32) -> bool {
        if self.fired.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.callback.on_exit(rc).await;
        true
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// 在工作池中执行已解析的命令并返回退出码。
///
/// 包括 panic 在内的所有结果都转换为退出码，
/// 失败信息在返回前写入错误输出。
pub async fn execute(
    queue: &WorkQueue,
    ctx: &CommandContext,
    mut command: Box<dyn SshCommand>,
    io: &mut CommandIo,
) -> u32 {
    let cancelable = command.cancelable();
    let work = async {
        if cancelable {
            tokio::select! {
                r = command.run(ctx, io) => r,
                _ = ctx.cancel.cancelled() => Err(CommandError::Canceled),
            }
        } else {
            command.run(ctx, io).await
        }
    };
    let result = queue
        .run(&ctx.name, AssertUnwindSafe(work).catch_unwind())
        .await
        .unwrap_or_else(|panic| {
            Err(CommandError::Internal(anyhow::anyhow!(
                "command panicked: {}",
                panic_message(panic.as_ref())
            )))
        });
    finish(&ctx.name, result, io).await
}

/// 转换命令结果并写入错误输出
pub async fn finish(command: &str, result: Result<(), CommandError>, io: &mut CommandIo) -> u32 {
    let (rc, message) = translate(command, result);
    if let Some(message) = message {
        if let Err(e) = io.eprintln(&message).await {
            debug!(command, error = %e, "无法写入错误输出");
        }
    }
    if let Err(e) = io.flush().await {
        debug!(command, error = %e, "无法刷新命令输出");
    }
    rc
}
