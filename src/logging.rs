//! 日志系统模块，提供统一的日志初始化

use std::sync::Once;

use tracing::Level;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

// 确保日志系统只初始化一次
static INIT: Once = Once::new();

/// 默认指令：本 crate 使用指定级别，russh 握手细节降到 warn
fn default_directive(level: Level) -> String {
    let level = level.as_str().to_lowercase();
    format!("{level},gitblit_ssh={level},russh=warn")
}

/// 日志系统初始化函数
///
/// # 参数
/// * `default_level` - 默认日志级别
/// * `app_name` - 应用名称, 用于环境变量前缀
///
/// `<APP>_LOG` 覆盖过滤规则，设置 `<APP>_JSON` 时输出 JSON 格式。
///
/// # 示例
/// ```
/// use gitblit_ssh::setup_logging;
///
/// // 默认使用 INFO 级别，可通过 GITBLIT_SSH_LOG 环境变量覆盖
/// setup_logging(tracing::Level::INFO, "GITBLIT_SSH");
/// ```
pub fn setup_logging(default_level: Level, app_name: &str) {
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_env(format!("{}_LOG", app_name))
            .unwrap_or_else(|_| EnvFilter::new(default_directive(default_level)));

        // 必须先初始化LogTracer，密钥存储层的 log 消息才能进入 tracing
        if tracing_log::LogTracer::init().is_err() {
            return;
        }

        if std::env::var(format!("{}_JSON", app_name)).is_ok() {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().json())
                .try_init()
                .ok(); // 测试中可能已经初始化
        } else {
            let fmt_layer = fmt::layer()
                .with_target(true)
                .with_thread_ids(true)
                .with_line_number(true);
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt_layer)
                .try_init()
                .ok();
        }

        tracing::info!("日志系统初始化完成 [{} {}]", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));
    });
}
