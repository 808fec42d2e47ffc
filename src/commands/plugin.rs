//! 插件管理命令（仅管理员）

use async_trait::async_trait;
use clap::Parser;
use tokio::io::AsyncWriteExt;

use super::base::{CommandContext, CommandError, CommandIo, SshCommand};
use super::dispatch::{command, CommandNode, Dispatcher, RegistryError};
use super::render_table;
use crate::error::PluginError;
use crate::plugins::{InstalledPlugin, PluginManager};

impl From<PluginError> for CommandError {
    fn from(e: PluginError) -> Self {
        match e {
            PluginError::Registry(e) => CommandError::Internal(e.into()),
            other => CommandError::failure(1, format!("fatal: {}", other)),
        }
    }
}

fn plugins(ctx: &CommandContext) -> &PluginManager {
    &ctx.services.plugins
}

fn is_all(id: &str) -> bool {
    id.eq_ignore_ascii_case("ALL")
}

/// 对一个插件执行 `action`；`ALL` 表示所有已安装插件
async fn for_each<F>(ctx: &CommandContext, io: &mut CommandIo, id: &str, verb: &str, action: F) -> Result<(), CommandError>
where
    F: Fn(&PluginManager, &str) -> Result<bool, PluginError> + Send,
{
    let targets: Vec<InstalledPlugin> = if is_all(id) {
        plugins(ctx).installed()
    } else {
        vec![plugins(ctx).lookup(id)?]
    };
    for plugin in targets {
        if action(plugins(ctx), &plugin.id)? {
            io.println(&format!("{} {}", verb, plugin.id)).await?;
        } else {
            io.println(&format!("{} is already {}", plugin.id, verb.to_lowercase())).await?;
        }
    }
    Ok(())
}

#[derive(Parser)]
#[command(about = "List the installed plugins")]
pub struct ListPlugins;

#[async_trait]
impl SshCommand for ListPlugins {
    async fn run(&mut self, ctx: &CommandContext, io: &mut CommandIo) -> Result<(), CommandError> {
        let installed = plugins(ctx).installed();
        if installed.is_empty() {
            io.println("There are no installed plugins.").await?;
            return Ok(());
        }
        let rows: Vec<Vec<String>> = installed
            .iter()
            .enumerate()
            .map(|(i, p)| {
                vec![
                    (i + 1).to_string(),
                    p.id.clone(),
                    p.description.clone(),
                    p.version.clone(),
                    p.state.to_string(),
                ]
            })
            .collect();
        let table = render_table(&["#", "Id", "Description", "Version", "State"], &rows);
        io.stdout.write_all(table.as_bytes()).await?;
        Ok(())
    }
}

#[derive(Parser)]
#[command(about = "Show the details of a plugin")]
pub struct ShowPlugin {
    /// plugin id or index
    id: String,
}

#[async_trait]
impl SshCommand for ShowPlugin {
    async fn run(&mut self, ctx: &CommandContext, io: &mut CommandIo) -> Result<(), CommandError> {
        let plugin = plugins(ctx).lookup(&self.id)?;
        let mut details = vec![
            format!("Id:          {}", plugin.id),
            format!("Version:     {}", plugin.version),
            format!("State:       {}", plugin.state),
        ];
        if !plugin.description.is_empty() {
            details.push(format!("Description: {}", plugin.description));
        }
        if let Some(registration) = plugins(ctx).registration(&plugin.id) {
            if let Some(provider) = &registration.provider {
                details.push(format!("Provider:    {}", provider));
            }
            if let Some(homepage) = &registration.homepage {
                details.push(format!("Homepage:    {}", homepage));
            }
            if let Some(latest) = registration.latest().filter(|r| r.version != plugin.version) {
                details.push(format!("Update:      {} is available", latest.version));
            }
        }
        for line in details {
            io.println(&line).await?;
        }
        Ok(())
    }
}

#[derive(Parser)]
#[command(about = "Start a plugin")]
pub struct StartPlugin {
    /// plugin id, index or ALL
    id: String,
}

#[async_trait]
impl SshCommand for StartPlugin {
    async fn run(&mut self, ctx: &CommandContext, io: &mut CommandIo) -> Result<(), CommandError> {
        for_each(ctx, io, &self.id, "Started", |m, id| m.start(id)).await
    }
}

#[derive(Parser)]
#[command(about = "Stop a plugin")]
pub struct StopPlugin {
    /// plugin id, index or ALL
    id: String,
}

#[async_trait]
impl SshCommand for StopPlugin {
    async fn run(&mut self, ctx: &CommandContext, io: &mut CommandIo) -> Result<(), CommandError> {
        for_each(ctx, io, &self.id, "Stopped", |m, id| m.stop(id)).await
    }
}

#[derive(Parser)]
#[command(about = "Enable a plugin")]
pub struct EnablePlugin {
    /// plugin id or index
    id: String,
}

#[async_trait]
impl SshCommand for EnablePlugin {
    async fn run(&mut self, ctx: &CommandContext, io: &mut CommandIo) -> Result<(), CommandError> {
        for_each(ctx, io, &self.id, "Enabled", |m, id| m.enable(id)).await
    }
}

#[derive(Parser)]
#[command(about = "Disable a plugin")]
pub struct DisablePlugin {
    /// plugin id or index
    id: String,
}

#[async_trait]
impl SshCommand for DisablePlugin {
    async fn run(&mut self, ctx: &CommandContext, io: &mut CommandIo) -> Result<(), CommandError> {
        for_each(ctx, io, &self.id, "Disabled", |m, id| m.disable(id)).await
    }
}

#[derive(Parser)]
#[command(about = "Install a plugin from the registry")]
pub struct InstallPlugin {
    /// plugin id
    id: String,

    /// release to install, defaults to the latest
    #[arg(long)]
    version: Option<String>,
}

#[async_trait]
impl SshCommand for InstallPlugin {
    async fn run(&mut self, ctx: &CommandContext, io: &mut CommandIo) -> Result<(), CommandError> {
        let plugin = plugins(ctx).install(&self.id, self.version.as_deref())?;
        io.println(&format!("Installed {} {}", plugin.id, plugin.version)).await?;
        Ok(())
    }
}

#[derive(Parser)]
#[command(about = "Uninstall a plugin")]
pub struct UninstallPlugin {
    /// plugin id or index
    id: String,
}

#[async_trait]
impl SshCommand for UninstallPlugin {
    async fn run(&mut self, ctx: &CommandContext, io: &mut CommandIo) -> Result<(), CommandError> {
        let plugin = plugins(ctx).lookup(&self.id)?;
        plugins(ctx).uninstall(&plugin.id)?;
        io.println(&format!("Uninstalled {}", plugin.id)).await?;
        Ok(())
    }
}

#[derive(Parser)]
#[command(about = "Refresh the plugin registry")]
pub struct RefreshRegistry;

#[async_trait]
impl SshCommand for RefreshRegistry {
    async fn run(&mut self, ctx: &CommandContext, io: &mut CommandIo) -> Result<(), CommandError> {
        let count = plugins(ctx).refresh().await?;
        io.println(&format!("Registry refreshed, {} plugins available.", count)).await?;
        Ok(())
    }
}

#[derive(Parser)]
#[command(about = "List the plugins available in the registry")]
pub struct AvailablePlugins;

#[async_trait]
impl SshCommand for AvailablePlugins {
    async fn run(&mut self, ctx: &CommandContext, io: &mut CommandIo) -> Result<(), CommandError> {
        let available = plugins(ctx).available();
        if available.is_empty() {
            io.println("There are no available plugins.").await?;
            return Ok(());
        }
        let installed = plugins(ctx).installed();
        let rows: Vec<Vec<String>> = available
            .iter()
            .map(|r| {
                let current = installed
                    .iter()
                    .find(|p| p.id == r.id)
                    .map(|p| p.version.clone())
                    .unwrap_or_default();
                vec![
                    r.id.clone(),
                    r.description.clone(),
                    r.latest().map(|l| l.version.clone()).unwrap_or_default(),
                    current,
                ]
            })
            .collect();
        let table = render_table(&["Id", "Description", "Latest", "Installed"], &rows);
        io.stdout.write_all(table.as_bytes()).await?;
        Ok(())
    }
}

/// 管理员的 `plugin` 调度器
pub fn plugin_dispatcher() -> Result<Dispatcher, RegistryError> {
    Dispatcher::new("plugin", "Plugin management commands")
        .with(CommandNode::leaf("list", "List the installed plugins", command::<ListPlugins>()).alias("ls"))?
        .with(CommandNode::leaf("show", "Show the details of a plugin", command::<ShowPlugin>()))?
        .with(CommandNode::leaf("start", "Start a plugin", command::<StartPlugin>()))?
        .with(CommandNode::leaf("stop", "Stop a plugin", command::<StopPlugin>()))?
        .with(CommandNode::leaf("enable", "Enable a plugin", command::<EnablePlugin>()))?
        .with(CommandNode::leaf("disable", "Disable a plugin", command::<DisablePlugin>()))?
        .with(CommandNode::leaf(
            "install",
            "Install a plugin from the registry",
            command::<InstallPlugin>(),
        ))?
        .with(
            CommandNode::leaf("uninstall", "Uninstall a plugin", command::<UninstallPlugin>())
                .alias("rm")
                .alias("del"),
        )?
        .with(CommandNode::leaf("refresh", "Refresh the plugin registry", command::<RefreshRegistry>()))?
        .with(CommandNode::leaf(
            "available",
            "List the plugins available in the registry",
            command::<AvailablePlugins>(),
        ))
}
