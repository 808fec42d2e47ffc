//! 命令工厂：命令树组装、命令行拆分和命令启动

use std::sync::Arc;

use async_trait::async_trait;
use clap::Parser;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::base::{execute, finish, CommandContext, CommandError, CommandIo, ExitCallback, ExitOnce, Services, SshCommand};
use super::dispatch::{command, CommandNode, Dispatcher, RegistryError, Resolved};
use super::git::git_dispatcher;
use super::keys::keys_dispatcher;
use super::plugin::plugin_dispatcher;
use super::repos::repos_dispatcher;
use super::work_queue::WorkQueue;
use crate::session::SshDaemonClient;

/// 把命令行拆分成单词。
///
/// 单双引号内的空白保留，两种引号互相嵌套时按字面处理；
/// 单引号外的反斜杠转义下一个字符。
pub fn split(line: &str) -> Vec<String> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut in_word = false;
    let (mut single, mut double) = (false, false);
    let mut chars = line.chars();
    while let Some(c) = chars.next() {
        match c {
            '\'' if !double => {
                single = !single;
                in_word = true;
            }
            '"' if !single => {
                double = !double;
                in_word = true;
            }
            '\\' if !single => {
                current.push(chars.next().unwrap_or('\\'));
                in_word = true;
            }
            c if c.is_whitespace() && !single && !double => {
                if in_word {
                    words.push(std::mem::take(&mut current));
                    in_word = false;
                }
            }
            c => {
                current.push(c);
                in_word = true;
            }
        }
    }
    if in_word {
        words.push(current);
    }
    words
}

#[derive(Parser)]
#[command(about = "Display the server version")]
pub struct Version;

#[async_trait]
impl SshCommand for Version {
    async fn run(&mut self, _ctx: &CommandContext, io: &mut CommandIo) -> Result<(), CommandError> {
        io.println(&format!("{} v{}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION")))
            .await?;
        Ok(())
    }
}

/// 组装命令树，插件扩展合并到根节点
pub fn root_dispatcher(services: &Services) -> Result<Dispatcher, RegistryError> {
    let gitblit = Dispatcher::new("gitblit", "Gitblit server commands")
        .with(CommandNode::leaf("version", "Display the server version", command::<Version>()))?
        .with(CommandNode::dispatcher(repos_dispatcher()?))?
        .with(CommandNode::dispatcher(keys_dispatcher(&services.keys)?))?
        .with(CommandNode::dispatcher(plugin_dispatcher()?).admin())?;

    let mut root = Dispatcher::new("", "")
        .with(CommandNode::dispatcher(git_dispatcher()?).hidden())?
        .with(CommandNode::dispatcher(gitblit))?
        .with(CommandNode::dispatcher(keys_dispatcher(&services.keys)?))?
        .with(CommandNode::dispatcher(plugin_dispatcher()?).admin())?;
    root.merge(services.plugins.extension_commands());
    Ok(root)
}

/// 在命令树上解析命令行并执行
#[derive(Clone)]
pub struct SshCommandFactory {
    root: Arc<Dispatcher>,
    queue: WorkQueue,
    services: Arc<Services>,
}

impl SshCommandFactory {
    pub fn new(services: Arc<Services>, start_threads: usize, worker_threads: usize) -> Result<Self, RegistryError> {
        let root = root_dispatcher(&services)?;
        Ok(Self {
            root: Arc::new(root),
            queue: WorkQueue::new(start_threads, worker_threads),
            services,
        })
    }

    pub fn services(&self) -> &Arc<Services> {
        &self.services
    }

    fn context(&self, client: Arc<SshDaemonClient>, line: &str, cancel: CancellationToken) -> CommandContext {
        CommandContext {
            name: line.to_string(),
            client,
            services: self.services.clone(),
            cancel,
        }
    }

    /// `client` 看到的根命令用法
    pub fn usage(&self, client: Arc<SshDaemonClient>) -> String {
        let ctx = self.context(client, "", CancellationToken::new());
        self.root.usage(&ctx, "")
    }

    pub fn resolve(&self, ctx: &CommandContext, line: &str) -> Result<Resolved, CommandError> {
        let mut args = split(line);
        // git 客户端发送的 `git-upload-pack` 等命令归入隐藏的 git 分发器
        if args.first().is_some_and(|a| a.starts_with("git-")) {
            args.insert(0, "git".to_string());
        }
        self.root.resolve(ctx, "", args)
    }

    /// 执行 `line` 直到结束，并把退出码报告给 `exit`
    pub async fn run(
        &self,
        client: Arc<SshDaemonClient>,
        line: &str,
        mut io: CommandIo,
        exit: Arc<dyn ExitCallback>,
        cancel: CancellationToken,
    ) -> u32 {
        let exit = ExitOnce::new(exit);
        let mut ctx = self.context(client, line, cancel);
        let resolved = self.queue.start(async { self.resolve(&ctx, line) }).await;
        let rc = match resolved {
            Ok(resolved) => {
                ctx.name = resolved.name;
                execute(&self.queue, &ctx, resolved.command, &mut io).await
            }
            Err(e) => finish(line, Err(e), &mut io).await,
        };
        info!(
            session_id = ctx.client.id(),
            username = ctx.client.username().unwrap_or_default(),
            "onExecute: {} exits with: {}",
            line,
            rc
        );
        exit.fire(rc).await;
        // 退出状态发送之后再释放通道流
        drop(io);
        rc
    }

    /// 在独立任务中启动 `line`
    pub fn start(
        &self,
        client: Arc<SshDaemonClient>,
        line: String,
        io: CommandIo,
        exit: Arc<dyn ExitCallback>,
        cancel: CancellationToken,
    ) -> JoinHandle<u32> {
        let factory = self.clone();
        tokio::spawn(async move { factory.run(client, &line, io, exit, cancel).await })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::tests::context;

    #[test]
    fn splits_like_a_shell() {
        assert_eq!(split("git-upload-pack '/demo.git'"), vec!["git-upload-pack", "/demo.git"]);
        assert_eq!(split("  a   b\tc "), vec!["a", "b", "c"]);
        assert_eq!(split(r#"say "hello world" 'it''s'"#), vec!["say", "hello world", "its"]);
        assert_eq!(split(r#"a "it's" 'say "hi"'"#), vec!["a", "it's", "say \"hi\""]);
        assert_eq!(split(r"a\ b 'c\d' e\"), vec!["a b", "c\\d", "e\\"]);
        assert_eq!(split("x ''"), vec!["x", ""]);
        assert!(split("").is_empty());
    }

    #[tokio::test]
    async fn builds_the_command_tree() {
        let ctx = context("admin").await;
        let factory = SshCommandFactory::new(ctx.services.clone(), 1, 1).unwrap();

        let resolved = factory.resolve(&ctx, "gitblit plugin list").ok().unwrap();
        assert_eq!(resolved.name, "gitblit plugin list");
        let resolved = factory.resolve(&ctx, "git-upload-pack '/demo.git'").ok().unwrap();
        assert_eq!(resolved.name, "git git-upload-pack");
        assert!(factory.resolve(&ctx, "keys ls").is_ok());
        assert!(factory.resolve(&ctx, "gitblit repos ls -v demo").is_ok());

        let alice = context("alice").await;
        assert!(factory.resolve(&alice, "plugin list").is_err());
        let usage = factory.usage(alice.client.clone());
        assert!(usage.contains("gitblit"));
        assert!(!usage.contains("plugin"));
        assert!(!usage.contains("git-upload-pack"));
    }
}
