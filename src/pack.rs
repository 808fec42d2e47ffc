//! git pack 协议桥接：SSH 通道 <-> `git upload-pack` / `git receive-pack`

use std::path::PathBuf;
use std::process::Stdio;

use anyhow::Context;
use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info};

use crate::commands::base::{CommandError, CommandIo, STATUS_INTERNAL};
use crate::repository::{PackService, Repository};

/// 把 `message` 封装成 pkt-line `ERR` 包，git 客户端显示为
/// `fatal: remote error: <message>`
pub fn err_packet(message: &str) -> Bytes {
    let payload = format!("ERR {}\n", message);
    let mut packet = BytesMut::with_capacity(payload.len() + 4);
    packet.put_slice(format!("{:04x}", payload.len() + 4).as_bytes());
    packet.put_slice(payload.as_bytes());
    packet.freeze()
}

/// 在命令的字节流上为已打开的仓库传输 pack 协议，返回服务的退出码
#[async_trait]
pub trait PackProtocol: Send + Sync {
    async fn serve(
        &self,
        service: PackService,
        repository: &Repository,
        git_protocol: Option<&str>,
        io: &mut CommandIo,
    ) -> Result<u32, CommandError>;
}

/// 通过 `git` 可执行文件提供 pack 服务
pub struct GitProcess {
    git: PathBuf,
}

impl GitProcess {
    pub fn new(git: impl Into<PathBuf>) -> Self {
        Self { git: git.into() }
    }
}

#[async_trait]
impl PackProtocol for GitProcess {
    async fn serve(
        &self,
        service: PackService,
        repository: &Repository,
        git_protocol: Option<&str>,
        io: &mut CommandIo,
    ) -> Result<u32, CommandError> {
        let mut command = Command::new(&self.git);
        command.arg(service.subcommand());
        if service == PackService::UploadPack {
            command.arg("--strict");
        }
        command
            .arg(repository.path())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(protocol) = git_protocol {
            command.env("GIT_PROTOCOL", protocol);
        }

        let mut child = command
            .spawn()
            .with_context(|| format!("failed to start {} {}", self.git.display(), service.subcommand()))?;
        let mut child_in = child.stdin.take().context("git stdin not captured")?;
        let mut child_out = child.stdout.take().context("git stdout not captured")?;
        let mut child_err = child.stderr.take().context("git stderr not captured")?;
        info!(repository = %repository.name(), service = service.name(), "开始传输");

        let CommandIo { stdin, stdout, stderr } = io;
        let pump_in = async move {
            let copied = tokio::io::copy(stdin, &mut child_in).await;
            // 关闭子进程的标准输入，通知 git 客户端已结束
            let _ = child_in.shutdown().await;
            copied
        };
        let pump_out = async move {
            let (out, err) = tokio::join!(
                tokio::io::copy(&mut child_out, stdout),
                tokio::io::copy(&mut child_err, stderr)
            );
            out?;
            err?;
            std::io::Result::Ok(())
        };
        tokio::pin!(pump_in, pump_out);

        let mut input_open = true;
        loop {
            tokio::select! {
                copied = &mut pump_in, if input_open => {
                    input_open = false;
                    match copied {
                        Ok(n) => debug!(bytes = n, "客户端输入结束"),
                        // git 在读完请求前退出时会关闭管道
                        Err(e) => debug!(error = %e, "客户端输入转发中断"),
                    }
                }
                done = &mut pump_out => {
                    done?;
                    break;
                }
            }
        }

        let status = child.wait().await?;
        let rc = status.code().map(|c| c as u32).unwrap_or(STATUS_INTERNAL);
        info!(repository = %repository.name(), service = service.name(), rc, "传输结束");
        Ok(rc)
    }
}
