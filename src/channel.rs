//! SSH 通道通信：命令 I/O 绑定和退出状态发送

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use russh::server::{Handle, Msg};
use russh::{Channel, ChannelId, CryptoVec};
use tracing::debug;

use crate::commands::base::{CommandIo, ExitCallback};

/// 扩展数据类型 1：stderr
pub const STDERR: u32 = 1;

/// 通道通信接口，负责在命令任务中与一个 SSH 通道通信
#[async_trait]
pub trait ChannelCommunicator: Send + Sync {
    /// 发送扩展数据到通道（通常用于stderr）
    async fn send_extended_data(&self, ext: u32, data: &[u8]) -> Result<()>;

    async fn send_exit_status(&self, exit_status: u32) -> Result<()>;

    async fn send_eof(&self) -> Result<()>;

    async fn close_channel(&self) -> Result<()>;
}

/// 基于会话句柄的通道通信器
pub struct SshChannelCommunicator {
    handle: Handle,
    channel_id: ChannelId,
}

impl SshChannelCommunicator {
    pub fn new(handle: Handle, channel_id: ChannelId) -> Self {
        Self { handle, channel_id }
    }
}

#[async_trait]
impl ChannelCommunicator for SshChannelCommunicator {
    async fn send_extended_data(&self, ext: u32, data: &[u8]) -> Result<()> {
        self.handle
            .extended_data(self.channel_id, ext, CryptoVec::from_slice(data))
            .await
            .map_err(|e| anyhow::anyhow!("发送扩展数据失败: {:?}", e))
    }

    async fn send_exit_status(&self, exit_status: u32) -> Result<()> {
        self.handle
            .exit_status_request(self.channel_id, exit_status)
            .await
            .map_err(|_| anyhow::anyhow!("发送退出状态失败"))
    }

    async fn send_eof(&self) -> Result<()> {
        self.handle
            .eof(self.channel_id)
            .await
            .map_err(|_| anyhow::anyhow!("发送EOF失败"))
    }

    async fn close_channel(&self) -> Result<()> {
        self.handle
            .close(self.channel_id)
            .await
            .map_err(|_| anyhow::anyhow!("关闭通道失败"))
    }
}

/// 把命令的输入输出绑定到会话通道：stdin/stdout 对应通道数据，
/// stderr 对应扩展数据类型 1
pub fn channel_io(channel: Channel<Msg>) -> CommandIo {
    let stderr = channel.make_writer_ext(Some(STDERR));
    let (stdin, stdout) = tokio::io::split(channel.into_stream());
    CommandIo::new(stdin, stdout, stderr)
}

/// 报告命令结束：依次发送退出码、EOF、关闭通道
pub struct ChannelExit {
    communicator: Arc<dyn ChannelCommunicator>,
}

impl ChannelExit {
    pub fn new(communicator: Arc<dyn ChannelCommunicator>) -> Self {
        Self { communicator }
    }
}

#[async_trait]
impl ExitCallback for ChannelExit {
    async fn on_exit(&self, rc: u32) {
        // 客户端可能已经断开，这里的失败只记录调试日志
        if let Err(e) = self.communicator.send_exit_status(rc).await {
            debug!(error = %e, "发送退出状态失败");
        }
        if let Err(e) = self.communicator.send_eof().await {
            debug!(error = %e, "发送EOF失败");
        }
        if let Err(e) = self.communicator.close_channel().await {
            debug!(error = %e, "关闭通道失败");
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::Mutex;

    /// 只记录通道事件，不真正发送
    #[derive(Default)]
    pub struct RecordingCommunicator {
        pub events: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl ChannelCommunicator for RecordingCommunicator {
        async fn send_extended_data(&self, ext: u32, data: &[u8]) -> Result<()> {
            self.events
                .lock()
                .unwrap()
                .push(format!("ext{}:{}", ext, String::from_utf8_lossy(data)));
            Ok(())
        }

        async fn send_exit_status(&self, exit_status: u32) -> Result<()> {
            self.events.lock().unwrap().push(format!("exit:{}", exit_status));
            Ok(())
        }

        async fn send_eof(&self) -> Result<()> {
            self.events.lock().unwrap().push("eof".into());
            Ok(())
        }

        async fn close_channel(&self) -> Result<()> {
            self.events.lock().unwrap().push("close".into());
            Ok(())
        }
    }

    #[tokio::test]
    async fn exit_is_reported_in_order() {
        let recorder = Arc::new(RecordingCommunicator::default());
        let exit = ChannelExit::new(recorder.clone());
        exit.on_exit(127).await;
        assert_eq!(*recorder.events.lock().unwrap(), vec!["exit:127", "eof", "close"]);
    }
}
