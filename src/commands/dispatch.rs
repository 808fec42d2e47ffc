//! 命令树：分发节点、别名、权限可见性和用法文本

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use clap::Parser;
use thiserror::Error;
use tracing::warn;

use super::base::{usage_failure, CommandContext, CommandError, SshCommand};

/// 根据完整命令名和剩余参数构造命令
pub type CommandFactory =
    Arc<dyn Fn(&str, Vec<String>) -> Result<Box<dyn SshCommand>, CommandError> + Send + Sync>;

/// clap derive 命令的工厂，完整命令名作为用法和错误信息中的程序名
pub fn command<T>() -> CommandFactory
where
    T: Parser + SshCommand + 'static,
{
    Arc::new(|name: &str, args: Vec<String>| {
        let argv = std::iter::once(name.to_string()).chain(args);
        T::try_parse_from(argv)
            .map(|c| Box::new(c) as Box<dyn SshCommand>)
            .map_err(usage_failure)
    })
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("{dispatcher} already contains the \"{name}\" command")]
    Duplicate { dispatcher: String, name: String },
}

#[derive(Clone)]
pub enum NodeKind {
    Leaf(CommandFactory),
    Dispatcher(Arc<Dispatcher>),
}

/// 调度器中的一个命名条目
#[derive(Clone)]
pub struct CommandNode {
    name: String,
    aliases: Vec<String>,
    description: String,
    admin: bool,
    hidden: bool,
    plugin: Option<String>,
    kind: NodeKind,
}

impl CommandNode {
    pub fn leaf(name: &str, description: &str, factory: CommandFactory) -> Self {
        Self::new(name, description, NodeKind::Leaf(factory))
    }

    pub fn dispatcher(dispatcher: Dispatcher) -> Self {
        let name = dispatcher.name.clone();
        let description = dispatcher.description.clone();
        Self::new(&name, &description, NodeKind::Dispatcher(Arc::new(dispatcher)))
    }

    fn new(name: &str, description: &str, kind: NodeKind) -> Self {
        Self {
            name: name.to_string(),
            aliases: Vec::new(),
            description: description.to_string(),
            admin: false,
            hidden: false,
            plugin: None,
            kind,
        }
    }

    pub fn alias(mut self, alias: &str) -> Self {
        self.aliases.push(alias.to_string());
        self
    }

    /// 仅管理员可见、可执行
    pub fn admin(mut self) -> Self {
        self.admin = true;
        self
    }

    /// 可以解析，但不出现在用法列表中
    pub fn hidden(mut self) -> Self {
        self.hidden = true;
        self
    }

    /// 由插件提供，插件启动时才可用
    pub fn plugin(mut self, plugin_id: &str) -> Self {
        self.plugin = Some(plugin_id.to_string());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> &NodeKind {
        &self.kind
    }

    fn visible(&self, ctx: &CommandContext) -> bool {
        if self.admin && !ctx.client.is_admin() {
            return false;
        }
        match &self.plugin {
            Some(id) => ctx.services.plugins.is_started(id),
            None => true,
        }
    }

    fn display(&self) -> String {
        let mut display = self.name.clone();
        if self.admin {
            display.push('*');
        }
        if !self.aliases.is_empty() {
            display.push_str(&format!(" ({})", self.aliases.join(",")));
        }
        display
    }
}

/// 解析到叶子的命令
pub struct Resolved {
    pub name: String,
    pub command: Box<dyn SshCommand>,
}

/// 命令和子调度器的命名空间
pub struct Dispatcher {
    name: String,
    description: String,
    nodes: BTreeMap<String, CommandNode>,
    aliases: HashMap<String, String>,
}

impl Dispatcher {
    pub fn new(name: &str, description: &str) -> Self {
        Self {
            name: name.to_string(),
            description: description.to_string(),
            nodes: BTreeMap::new(),
            aliases: HashMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// 已注册的命令名，已排序
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.nodes.keys().map(String::as_str)
    }

    fn taken(&self, name: &str) -> bool {
        self.nodes.contains_key(name) || self.aliases.contains_key(name)
    }

    pub fn register(&mut self, node: CommandNode) -> Result<(), RegistryError> {
        if self.taken(&node.name) {
            return Err(RegistryError::Duplicate {
                dispatcher: self.name.clone(),
                name: node.name.clone(),
            });
        }
        let mut aliases = Vec::with_capacity(node.aliases.len());
        for alias in &node.aliases {
            if self.taken(alias) || alias == &node.name {
                warn!(dispatcher = %self.name, alias = %alias, "别名冲突，已忽略");
                continue;
            }
            self.aliases.insert(alias.clone(), node.name.clone());
            aliases.push(alias.clone());
        }
        let node = CommandNode { aliases, ..node };
        self.nodes.insert(node.name.clone(), node);
        Ok(())
    }

    /// [`Dispatcher::register`] 的构建器形式
    pub fn with(mut self, node: CommandNode) -> Result<Self, RegistryError> {
        self.register(node)?;
        Ok(self)
    }

    /// 注册扩展节点，跳过重名的节点
    pub fn merge(&mut self, nodes: impl IntoIterator<Item = CommandNode>) {
        for node in nodes {
            if let Err(e) = self.register(node) {
                warn!("无法注册扩展命令: {}", e);
            }
        }
    }

    fn lookup(&self, name: &str) -> Option<&CommandNode> {
        let name = self.aliases.get(name).map(String::as_str).unwrap_or(name);
        self.nodes.get(name)
    }

    fn has_visible_commands(&self, ctx: &CommandContext) -> bool {
        self.nodes.values().any(|n| !n.hidden && n.visible(ctx))
    }

    /// 沿命令树解析 `args` 到叶子并构造命令
    pub fn resolve(&self, ctx: &CommandContext, path: &str, mut args: Vec<String>) -> Result<Resolved, CommandError> {
        if args.first().map_or(true, |a| a == "-h" || a == "--help") {
            return Err(CommandError::failure(1, self.usage(ctx, path)));
        }
        let requested = args.remove(0);
        let node = match self.lookup(&requested) {
            Some(node) if node.visible(ctx) => node,
            _ => {
                let label = if path.is_empty() { "Gitblit" } else { path };
                return Err(CommandError::failure(1, format!("{}: {}: not found", label, requested)));
            }
        };
        let child_path = if path.is_empty() {
            node.name.clone()
        } else {
            format!("{} {}", path, node.name)
        };
        match &node.kind {
            NodeKind::Leaf(factory) => Ok(Resolved {
                command: factory(&child_path, args)?,
                name: child_path,
            }),
            NodeKind::Dispatcher(d) => d.resolve(ctx, &child_path, args),
        }
    }

    /// 列出 `ctx` 可执行命令的用法，按名称排序
    pub fn usage(&self, ctx: &CommandContext, path: &str) -> String {
        let mut commands = Vec::new();
        let mut dispatchers = Vec::new();
        for node in self.nodes.values() {
            if node.hidden || !node.visible(ctx) {
                continue;
            }
            match &node.kind {
                NodeKind::Dispatcher(d) if d.has_visible_commands(ctx) => dispatchers.push(node),
                NodeKind::Dispatcher(_) => {}
                NodeKind::Leaf(_) => commands.push(node),
            }
        }
        let width = commands
            .iter()
            .chain(dispatchers.iter())
            .map(|n| n.display().len())
            .max()
            .unwrap_or(0);

        let mut usage = String::new();
        if !path.is_empty() {
            let title = format!("{}: {}", path.to_uppercase(), self.description);
            let banner = "═".repeat(title.chars().count() + 2);
            usage.push_str(&format!("\n{}\n {}\n{}\n\n", banner, title, banner));
        }
        let scope = if path.is_empty() {
            String::new()
        } else {
            format!(" of {}", path)
        };
        for (heading, nodes) in [("commands", &commands), ("command dispatchers", &dispatchers)] {
            if nodes.is_empty() {
                continue;
            }
            usage.push_str(&format!("Available {}{} are:\n\n", heading, scope));
            for node in nodes.iter() {
                usage.push_str(&format!("   {:<width$}   {}\n", node.display(), node.description, width = width));
            }
            usage.push('\n');
        }
        let prefix = if path.is_empty() {
            String::new()
        } else {
            format!("{} ", path)
        };
        usage.push_str(&format!("See '{}COMMAND --help' for more information.\n\n", prefix));
        usage
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::base::CommandIo;
    use crate::commands::tests::context;
    use async_trait::async_trait;

    #[derive(Parser)]
    struct Echo {
        #[arg(long)]
        loud: bool,
        words: Vec<String>,
    }

    #[async_trait]
    impl SshCommand for Echo {
        async fn run(&mut self, _ctx: &CommandContext, io: &mut CommandIo) -> Result<(), CommandError> {
            let text = self.words.join(" ");
            io.println(&if self.loud { text.to_uppercase() } else { text }).await?;
            Ok(())
        }
    }

    fn tree() -> Dispatcher {
        let tools = Dispatcher::new("tools", "helpful tools")
            .with(CommandNode::leaf("echo", "print the arguments", command::<Echo>()).alias("say"))
            .unwrap()
            .with(CommandNode::leaf("zap", "administrator echo", command::<Echo>()).admin())
            .unwrap();
        Dispatcher::new("", "")
            .with(CommandNode::dispatcher(tools))
            .unwrap()
            .with(CommandNode::leaf("secret", "not listed", command::<Echo>()).hidden())
            .unwrap()
    }

    fn message(err: CommandError) -> (u32, String) {
        match err {
            CommandError::Failure(f) => (f.exit_code(), f.message().to_string()),
            other => panic!("unexpected error {:?}", other),
        }
    }

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn resolves_through_aliases() {
        let ctx = context("alice").await;
        let resolved = tree().resolve(&ctx, "", args(&["tools", "say", "hi"])).ok().unwrap();
        assert_eq!(resolved.name, "tools echo");
        assert!(tree().resolve(&ctx, "", args(&["secret"])).is_ok());
    }

    #[tokio::test]
    async fn unknown_and_admin_commands_are_not_found() {
        let ctx = context("alice").await;
        let (rc, msg) = message(tree().resolve(&ctx, "", args(&["nope"])).err().unwrap());
        assert_eq!(rc, 1);
        assert_eq!(msg, "Gitblit: nope: not found");

        let (_, msg) = message(tree().resolve(&ctx, "", args(&["tools", "zap"])).err().unwrap());
        assert_eq!(msg, "tools: zap: not found");

        let admin = context("admin").await;
        assert!(tree().resolve(&admin, "", args(&["tools", "zap"])).is_ok());
    }

    #[tokio::test]
    async fn usage_lists_visible_commands() {
        let ctx = context("alice").await;
        let (rc, usage) = message(tree().resolve(&ctx, "", args(&["tools"])).err().unwrap());
        assert_eq!(rc, 1);
        assert!(usage.contains(" TOOLS: helpful tools\n"));
        assert!(usage.contains("Available commands of tools are:\n\n   echo (say)   print the arguments\n"));
        assert!(!usage.contains("zap"));
        assert!(usage.ends_with("See 'tools COMMAND --help' for more information.\n\n"));

        let (_, root) = message(tree().resolve(&ctx, "", Vec::new()).err().unwrap());
        assert!(root.contains("Available command dispatchers are:"));
        assert!(!root.contains("secret"));

        let admin = context("admin").await;
        let usage = tree().resolve(&admin, "", args(&["tools", "--help"])).err().map(message).unwrap().1;
        assert!(usage.contains("zap*"));
    }

    #[tokio::test]
    async fn parse_errors_become_fatal_usage() {
        let ctx = context("alice").await;
        let (rc, msg) = message(tree().resolve(&ctx, "", args(&["tools", "echo", "--bogus"])).err().unwrap());
        assert_eq!(rc, 1);
        assert!(msg.starts_with("fatal: unexpected argument '--bogus'"), "{}", msg);
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let mut d = Dispatcher::new("d", "");
        d.register(CommandNode::leaf("a", "", command::<Echo>())).unwrap();
        assert!(d.register(CommandNode::leaf("a", "", command::<Echo>())).is_err());
        // 冲突的别名被忽略，命令本身仍然注册
        d.register(CommandNode::leaf("b", "", command::<Echo>()).alias("a")).unwrap();
        assert_eq!(d.lookup("a").unwrap().name(), "a");
    }
}
