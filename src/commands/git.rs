//! git 传输命令：`git-upload-pack` / `git-receive-pack`

use async_trait::async_trait;
use clap::Parser;
use tokio::io::AsyncWriteExt;
use tracing::warn;

use super::base::{CommandContext, CommandError, CommandIo, SshCommand};
use super::dispatch::{command, CommandNode, Dispatcher, RegistryError};
use crate::pack::err_packet;
use crate::repository::{open_blocking, PackService};

/// Sends a pack to the client for clone and fetch.
#[derive(Parser)]
#[command(about = "Sends packs to a client for clone and fetch")]
pub struct UploadPack {
    /// repository path
    repository: String,
}

/// Receives a pack pushed by the client.
#[derive(Parser)]
#[command(about = "Receives pushes from a client")]
pub struct ReceivePack {
    /// repository path
    repository: String,
}

#[async_trait]
impl SshCommand for UploadPack {
    fn cancelable(&self) -> bool {
        true
    }

    async fn run(&mut self, ctx: &CommandContext, io: &mut CommandIo) -> Result<(), CommandError> {
        serve(PackService::UploadPack, &self.repository, ctx, io).await
    }
}

#[async_trait]
impl SshCommand for ReceivePack {
    fn cancelable(&self) -> bool {
        true
    }

    async fn run(&mut self, ctx: &CommandContext, io: &mut CommandIo) -> Result<(), CommandError> {
        serve(PackService::ReceivePack, &self.repository, ctx, io).await
    }
}

async fn serve(service: PackService, path: &str, ctx: &CommandContext, io: &mut CommandIo) -> Result<(), CommandError> {
    let opened = open_blocking(ctx.services.repositories.clone(), ctx.client.clone(), path, service).await;
    let repository = match opened {
        Ok(repository) => repository,
        Err(e) => {
            warn!(
                session_id = ctx.client.id(),
                username = ctx.client.username().unwrap_or_default(),
                repository = path,
                service = service.name(),
                error = %e,
                "拒绝仓库访问"
            );
            // 用 pack 协议自己的 ERR 帧报告，git 客户端才能正确显示
            io.stdout.write_all(&err_packet(&e.to_string())).await?;
            io.stdout.flush().await?;
            return Err(CommandError::Exit(1));
        }
    };
    ctx.client.set_repository_name(repository.name());

    let git_protocol = ctx.client.git_protocol();
    let rc = ctx
        .services
        .pack
        .serve(service, &repository, git_protocol.as_deref(), io)
        .await?;
    match rc {
        0 => Ok(()),
        rc => Err(CommandError::Exit(u8::try_from(rc).unwrap_or(u8::MAX))),
    }
}

/// 隐藏的 `git` 调度器，处理 `git-*` 命令行
pub fn git_dispatcher() -> Result<Dispatcher, RegistryError> {
    Dispatcher::new("git", "Git transport commands")
        .with(CommandNode::leaf(
            PackService::UploadPack.name(),
            "Sends packs to a client for clone and fetch",
            command::<UploadPack>(),
        ))?
        .with(CommandNode::leaf(
            PackService::ReceivePack.name(),
            "Receives pushes from a client",
            command::<ReceivePack>(),
        ))
}
