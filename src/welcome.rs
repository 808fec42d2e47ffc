//! 交互式 shell 请求的欢迎信息

use std::sync::Arc;

use tracing::debug;

use crate::channel::{ChannelCommunicator, ChannelExit, STDERR};
use crate::commands::base::{ExitCallback, STATUS_NOT_FOUND};
use crate::config::DaemonConfig;
use crate::session::SshDaemonClient;

const WIDTH: usize = 72;

/// 代替交互式 shell 显示的欢迎信息。
///
/// `usage` 是当前用户看到的根命令用法。客户端通常为 shell 分配终端，
/// 所以每行以 `\r\n` 结尾。
pub fn message(config: &DaemonConfig, client: &SshDaemonClient, usage: &str) -> String {
    let banner = "═".repeat(WIDTH);
    let rule = "─".repeat(WIDTH);
    let username = client.username().unwrap_or_default();
    let display_name = client.user().map(|u| u.display_name()).unwrap_or(username);

    let mut lines = vec![
        banner.clone(),
        format!(" {} v{}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION")),
        banner.clone(),
        format!(" Hi {}, you have successfully connected over SSH.", display_name),
        String::new(),
        " Interactive shells are not available.".to_string(),
        String::new(),
    ];
    if let Some(addr) = client.remote_address() {
        lines.push(format!("   client:   {}", addr));
    }
    if let Some(key) = client.key() {
        lines.push(format!("   key:      {}", key.fingerprint()));
    }
    lines.push(String::new());

    lines.push(rule.clone());
    lines.push(" You may clone a repository with the following Git syntax:".to_string());
    lines.push(String::new());
    lines.push(format!("   git clone {}", config.format_url(username, "REPOSITORY.git")));
    lines.push(String::new());

    // 口令登录的用户提示如何上传公钥
    if client.key().is_none() {
        lines.push(rule.clone());
        lines.push(" You may upload an SSH public key with the following syntax:".to_string());
        lines.push(String::new());
        lines.push(format!(
            "   cat ~/.ssh/id_rsa.pub | ssh -l {} -p {} {} keys add",
            username,
            config.display_port(),
            config.display_host()
        ));
        lines.push(String::new());
    }

    lines.push(rule);
    lines.extend(usage.lines().map(str::to_string));
    lines.push(banner);

    let mut text = lines.join("\r\n");
    text.push_str("\r\n");
    text
}

/// 把欢迎信息写到错误输出，并以 127 结束通道
pub async fn greet(communicator: Arc<dyn ChannelCommunicator>, message: &str) {
    if let Err(e) = communicator.send_extended_data(STDERR, message.as_bytes()).await {
        debug!(error = %e, "发送欢迎信息失败");
    }
    ChannelExit::new(communicator).on_exit(STATUS_NOT_FOUND).await;
}
