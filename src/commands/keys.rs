//! 用户自己的 SSH 公钥管理命令

use async_trait::async_trait;
use clap::Parser;
use tokio::io::AsyncWriteExt;
use tracing::info;

use super::base::{CommandContext, CommandError, CommandIo, SshCommand};
use super::dispatch::{command, CommandNode, Dispatcher, RegistryError};
use super::render_table;
use crate::error::KeyError;
use crate::keys::KeyManager;
use crate::ssh_key::{KeyPermission, SshKey};

const NO_KEYS: &str = "There are no registered keys!";

/// 参数中的公钥；没有参数或参数为 `-` 时从 stdin 读取
async fn read_keys(args: &[String], io: &mut CommandIo) -> Result<Vec<String>, CommandError> {
    let mut lines = Vec::new();
    if args.is_empty() || args.iter().any(|a| a == "-") {
        let input = io.read_stdin().await?;
        lines.extend(
            input
                .lines()
                .map(str::trim)
                .filter(|l| !l.is_empty() && !l.starts_with('#'))
                .map(String::from),
        );
    }
    // 命令行上的公钥被空白拆成了多个参数
    let inline: Vec<&str> = args.iter().filter(|a| *a != "-").map(String::as_str).collect();
    if !inline.is_empty() {
        lines.push(inline.join(" "));
    }
    Ok(lines)
}

fn parse_key(line: &str) -> Result<SshKey, CommandError> {
    SshKey::from_raw(line)
        .map_err(|_| CommandError::failure(1, "The data read from STDIN can not be parsed as an SSH public key!"))
}

fn parse_permission(value: &str) -> Result<KeyPermission, CommandError> {
    value
        .parse()
        .map_err(|e: KeyError| CommandError::failure(1, e.to_string()))
}

fn invalid_index(count: usize) -> CommandError {
    let message = if count == 1 {
        "Invalid index specified. There is only 1 registered key.".to_string()
    } else {
        format!("Invalid index specified. There are {} registered keys.", count)
    };
    CommandError::failure(1, message)
}

fn key_row(key: &SshKey) -> Vec<String> {
    vec![
        key.fingerprint().to_string(),
        key.comment().to_string(),
        key.permission().name().to_string(),
        key.algorithm(),
    ]
}

#[derive(Parser)]
#[command(about = "Add an SSH public key to your account")]
pub struct AddKey {
    /// restrict the key to an access permission
    #[arg(long, short = 'p', value_name = "V|R|RW")]
    permission: Option<String>,

    /// the key to add; `-` reads keys from STDIN
    #[arg(value_name = "-|KEY")]
    keys: Vec<String>,
}

#[async_trait]
impl SshCommand for AddKey {
    async fn run(&mut self, ctx: &CommandContext, io: &mut CommandIo) -> Result<(), CommandError> {
        let username = ctx.username()?;
        let permission = match &self.permission {
            Some(p) => parse_permission(p)?,
            None => KeyPermission::Push,
        };
        let lines = read_keys(&self.keys, io).await?;
        if lines.is_empty() {
            return Err(CommandError::failure(1, "No public keys were read from STDIN!"));
        }
        for line in lines {
            let key = parse_key(&line)?.with_permission(permission);
            ctx.services.keys.add_key(username, &key).await?;
            info!(username, fingerprint = %key.fingerprint(), "添加公钥");
            io.println(&format!("Added {}", key.fingerprint())).await?;
        }
        Ok(())
    }
}

#[derive(Parser)]
#[command(about = "Remove an SSH public key from your account")]
pub struct RemoveKey {
    /// key index from `keys list`, `ALL`, or `-` to read keys from STDIN
    #[arg(required = true, value_name = "-|INDEX|ALL")]
    keys: Vec<String>,
}

#[async_trait]
impl SshCommand for RemoveKey {
    async fn run(&mut self, ctx: &CommandContext, io: &mut CommandIo) -> Result<(), CommandError> {
        let username = ctx.username()?;
        let keys = &ctx.services.keys;
        if self.keys.iter().any(|k| k.eq_ignore_ascii_case("ALL")) {
            keys.remove_all_keys(username).await?;
            info!(username, "删除全部公钥");
            io.println("Removed all keys.").await?;
            return Ok(());
        }

        let registered = keys.get_keys(username).await?;
        if registered.is_empty() {
            return Err(CommandError::failure(1, NO_KEYS));
        }
        let mut targets = Vec::new();
        if self.keys.iter().any(|k| k == "-") {
            for line in read_keys(&["-".to_string()], io).await? {
                targets.push(parse_key(&line)?);
            }
        }
        for arg in self.keys.iter().filter(|k| *k != "-") {
            let index = arg.parse::<usize>().map_err(|_| invalid_index(registered.len()))?;
            let key = index
                .checked_sub(1)
                .and_then(|i| registered.get(i))
                .ok_or_else(|| invalid_index(registered.len()))?;
            targets.push(key.clone());
        }

        for key in targets {
            if keys.remove_key(username, &key).await? {
                info!(username, fingerprint = %key.fingerprint(), "删除公钥");
                io.println(&format!("Removed {}", key.fingerprint())).await?;
            } else {
                io.eprintln(&format!("failed to remove key {}", key.fingerprint())).await?;
            }
        }
        Ok(())
    }
}

#[derive(Parser)]
#[command(about = "List your registered SSH public keys")]
pub struct ListKeys {
    /// list the raw keys
    #[arg(short = 'L')]
    raw: bool,
}

#[async_trait]
impl SshCommand for ListKeys {
    async fn run(&mut self, ctx: &CommandContext, io: &mut CommandIo) -> Result<(), CommandError> {
        let keys = ctx.services.keys.get_keys(ctx.username()?).await?;
        if keys.is_empty() {
            io.println(NO_KEYS).await?;
            return Ok(());
        }
        if self.raw {
            for key in keys.iter() {
                io.println(key.raw_data()).await?;
            }
            return Ok(());
        }
        let rows: Vec<Vec<String>> = keys
            .iter()
            .enumerate()
            .map(|(i, key)| {
                let mut row = vec![(i + 1).to_string()];
                row.extend(key_row(key));
                row
            })
            .collect();
        let table = render_table(&["#", "Fingerprint", "Comment", "Permission", "Type"], &rows);
        io.stdout.write_all(table.as_bytes()).await?;
        Ok(())
    }
}

#[derive(Parser)]
#[command(about = "Show the SSH public key used to authenticate this session")]
pub struct WhichKey {
    /// show the raw key
    #[arg(short = 'L')]
    raw: bool,
}

#[async_trait]
impl SshCommand for WhichKey {
    async fn run(&mut self, ctx: &CommandContext, io: &mut CommandIo) -> Result<(), CommandError> {
        let Some(key) = ctx.client.key() else {
            return Err(CommandError::failure(1, "You have not authenticated with an SSH public key."));
        };
        if self.raw {
            io.println(key.raw_data()).await?;
        } else {
            let table = render_table(&["Fingerprint", "Comment", "Permission", "Type"], &[key_row(key)]);
            io.stdout.write_all(table.as_bytes()).await?;
        }
        Ok(())
    }
}

#[derive(Parser)]
#[command(about = "Set the comment of one of your SSH public keys")]
pub struct CommentKey {
    /// key index from `keys list`
    index: usize,

    /// the new comment
    #[arg(required = true)]
    comment: Vec<String>,
}

#[async_trait]
impl SshCommand for CommentKey {
    async fn run(&mut self, ctx: &CommandContext, io: &mut CommandIo) -> Result<(), CommandError> {
        let username = ctx.username()?;
        let mut key = indexed_key(ctx, username, self.index).await?;
        key.set_comment(&self.comment.join(" "));
        ctx.services.keys.add_key(username, &key).await?;
        io.println(&format!("Updated the comment for key #{}.", self.index)).await?;
        Ok(())
    }
}

#[derive(Parser)]
#[command(about = "Set the access permission of one of your SSH public keys")]
pub struct PermissionKey {
    /// key index from `keys list`
    index: usize,

    #[arg(value_name = "V|R|RW")]
    permission: String,
}

#[async_trait]
impl SshCommand for PermissionKey {
    async fn run(&mut self, ctx: &CommandContext, io: &mut CommandIo) -> Result<(), CommandError> {
        let username = ctx.username()?;
        let permission = parse_permission(&self.permission)?;
        let mut key = indexed_key(ctx, username, self.index).await?;
        key.set_permission(permission);
        ctx.services.keys.add_key(username, &key).await?;
        info!(username, fingerprint = %key.fingerprint(), %permission, "修改公钥权限");
        io.println(&format!("Updated the permission for key #{}.", self.index)).await?;
        Ok(())
    }
}

async fn indexed_key(ctx: &CommandContext, username: &str, index: usize) -> Result<SshKey, CommandError> {
    let keys = ctx.services.keys.get_keys(username).await?;
    index
        .checked_sub(1)
        .and_then(|i| keys.get(i))
        .cloned()
        .ok_or_else(|| CommandError::failure(1, "Invalid key index!"))
}

/// `keys` 调度器，只读存储不注册修改类命令
pub fn keys_dispatcher(keys: &KeyManager) -> Result<Dispatcher, RegistryError> {
    let mut dispatcher = Dispatcher::new("keys", "SSH public key management commands");
    if keys.supports_writing_keys() {
        dispatcher.register(CommandNode::leaf(
            "add",
            "Add an SSH public key to your account",
            command::<AddKey>(),
        ))?;
        dispatcher.register(
            CommandNode::leaf("remove", "Remove an SSH public key from your account", command::<RemoveKey>())
                .alias("rm"),
        )?;
    }
    dispatcher.register(
        CommandNode::leaf("list", "List your registered SSH public keys", command::<ListKeys>()).alias("ls"),
    )?;
    dispatcher.register(CommandNode::leaf(
        "which",
        "Show the SSH public key used to authenticate this session",
        command::<WhichKey>(),
    ))?;
    if keys.supports_comment_changes() {
        dispatcher.register(CommandNode::leaf(
            "comment",
            "Set the comment of one of your SSH public keys",
            command::<CommentKey>(),
        ))?;
    }
    if keys.supports_permission_changes() {
        dispatcher.register(CommandNode::leaf(
            "permission",
            "Set the access permission of one of your SSH public keys",
            command::<PermissionKey>(),
        ))?;
    }
    Ok(dispatcher)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::base::translate;
    use crate::commands::tests::context;
    use crate::ssh_key::tests::{ALICE_ED25519, ALICE_RSA, BOB_ED25519};
    use std::io::Cursor;

    async fn exec<T: Parser + SshCommand>(ctx: &CommandContext, args: &[&str], stdin: &str) -> (u32, String, String) {
        let argv = std::iter::once("cmd").chain(args.iter().copied());
        let mut cmd = T::try_parse_from(argv).unwrap();
        let (mut io, captured) = CommandIo::capture(Cursor::new(stdin.as_bytes().to_vec()));
        let (rc, message) = translate("cmd", cmd.run(ctx, &mut io).await);
        let mut err = captured.stderr.contents();
        err.push_str(&message.unwrap_or_default());
        (rc, captured.stdout.contents(), err)
    }

    #[tokio::test]
    async fn add_list_and_remove() {
        let ctx = context("alice").await;
        let stdin = format!("# my keys\n{}\n\n{}\n", ALICE_ED25519, ALICE_RSA);
        let (rc, out, _) = exec::<AddKey>(&ctx, &[], &stdin).await;
        assert_eq!(rc, 0);
        assert_eq!(out.lines().count(), 2);

        let keys = ctx.services.keys.get_keys("alice").await.unwrap();
        assert_eq!(keys.len(), 2);
        assert!(keys.iter().all(|k| k.permission() == KeyPermission::Push));

        let (_, out, _) = exec::<ListKeys>(&ctx, &[], "").await;
        assert!(out.starts_with("#  Fingerprint"));
        assert!(out.contains("alice@laptop"));
        let (_, raw, _) = exec::<ListKeys>(&ctx, &["-L"], "").await;
        assert_eq!(raw.lines().next(), Some(ALICE_ED25519));

        let (rc, _, err) = exec::<RemoveKey>(&ctx, &["3"], "").await;
        assert_eq!(rc, 1);
        assert_eq!(err, "Invalid index specified. There are 2 registered keys.");

        let (rc, out, _) = exec::<RemoveKey>(&ctx, &["1"], "").await;
        assert_eq!(rc, 0);
        assert!(out.starts_with("Removed SHA256:"));
        assert_eq!(ctx.services.keys.get_keys("alice").await.unwrap().len(), 1);

        let (_, out, _) = exec::<RemoveKey>(&ctx, &["ALL"], "").await;
        assert_eq!(out, "Removed all keys.\n");
        let (_, out, _) = exec::<ListKeys>(&ctx, &[], "").await;
        assert_eq!(out, "There are no registered keys!\n");
        let (rc, _, err) = exec::<RemoveKey>(&ctx, &["1"], "").await;
        assert_eq!((rc, err.as_str()), (1, NO_KEYS));
    }

    #[tokio::test]
    async fn add_rejects_bad_input() {
        let ctx = context("alice").await;
        let (rc, _, err) = exec::<AddKey>(&ctx, &[], "\n# nothing\n").await;
        assert_eq!((rc, err.as_str()), (1, "No public keys were read from STDIN!"));

        let (rc, _, err) = exec::<AddKey>(&ctx, &["-"], "not a key\n").await;
        assert_eq!(rc, 1);
        assert!(err.contains("can not be parsed"));

        let (rc, _, err) = exec::<AddKey>(&ctx, &["-p", "ADMIN", "-"], BOB_ED25519).await;
        assert_eq!(rc, 1);
        assert!(err.contains("not a valid SSH key permission"));

        // 命令行上直接给出公钥
        let parts: Vec<&str> = BOB_ED25519.split(' ').collect();
        let mut args = vec!["-p", "V"];
        args.extend(parts);
        let (rc, _, _) = exec::<AddKey>(&ctx, &args, "").await;
        assert_eq!(rc, 0);
        let keys = ctx.services.keys.get_keys("alice").await.unwrap();
        assert_eq!(keys[0].permission(), KeyPermission::View);
    }

    #[tokio::test]
    async fn comment_and_permission() {
        let ctx = context("alice").await;
        exec::<AddKey>(&ctx, &["-"], ALICE_ED25519).await;

        let (rc, out, _) = exec::<CommentKey>(&ctx, &["1", "work", "laptop"], "").await;
        assert_eq!(rc, 0);
        assert_eq!(out, "Updated the comment for key #1.\n");
        let (rc, out, _) = exec::<PermissionKey>(&ctx, &["1", "V"], "").await;
        assert_eq!(rc, 0);
        assert_eq!(out, "Updated the permission for key #1.\n");

        let keys = ctx.services.keys.get_keys("alice").await.unwrap();
        assert_eq!(keys.len(), 1);
        assert_eq!(keys[0].comment(), "work laptop");
        assert_eq!(keys[0].permission(), KeyPermission::View);

        let (rc, _, err) = exec::<CommentKey>(&ctx, &["2", "x"], "").await;
        assert_eq!((rc, err.as_str()), (1, "Invalid key index!"));
    }

    #[tokio::test]
    async fn which_requires_key_session() {
        let ctx = context("alice").await;
        let (rc, _, err) = exec::<WhichKey>(&ctx, &[], "").await;
        assert_eq!((rc, err.as_str()), (1, "You have not authenticated with an SSH public key."));
    }

    #[test]
    fn read_only_stores_hide_mutations() {
        let keys = KeyManager::new(std::sync::Arc::new(crate::keys::NullKeyStore));
        let dispatcher = keys_dispatcher(&keys).unwrap();
        assert_eq!(dispatcher.name(), "keys");
        assert!(dispatcher.names().eq(["list", "which"]));
    }
}
