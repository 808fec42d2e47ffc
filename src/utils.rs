/// 🚀 简洁的错误处理宏：记录错误日志并转换为 anyhow 错误
///
/// 用法: `e!(expr, "错误信息")?`
///
/// # 示例
/// ```
/// # use anyhow::Result;
/// # use gitblit_ssh::e;
/// # fn example() -> Result<()> {
/// let result = e!(std::fs::read_to_string("non-existent.txt"), "读取文件失败")?;
/// # Ok(())
/// # }
/// ```
#[macro_export]
macro_rules! e {
    ($e:expr, $msg:expr) => {
        $e.map_err(|e| {
            ::tracing::error!("{}: {}", $msg, e);
            ::anyhow::anyhow!("{}: {}", $msg, e)
        })
    };

    ($e:expr, $fmt:expr, $($arg:tt)*) => {
        $e.map_err(|e| {
            let msg = format!($fmt, $($arg)*);
            ::tracing::error!("{}: {}", msg, e);
            ::anyhow::anyhow!("{}: {}", msg, e)
        })
    };
}

/// 灵活的错误处理宏 - 支持不同日志级别
///
/// # 示例
/// ```
/// # use anyhow::Result;
/// # use gitblit_ssh::try_log;
/// # fn example() -> Result<()> {
/// // 默认error级别
/// let content = try_log!(std::fs::read_to_string("file.txt"), "读取文件失败")?;
///
/// // 指定warn级别并格式化
/// let path = "gitblit.toml";
/// let config = try_log!(std::fs::read_to_string(path), warn, "无法读取配置文件 {}", path)?;
/// # Ok(())
/// # }
/// ```
#[macro_export]
macro_rules! try_log {
    ($e:expr, $msg:expr) => {
        $crate::try_log!($e, error, "{}", $msg)
    };

    ($e:expr, $level:ident, $fmt:expr $(, $arg:expr)* $(,)?) => {
        match $e {
            Ok(v) => Ok(v),
            Err(e) => {
                let msg = format!($fmt $(, $arg)*);
                ::tracing::$level!("{}: {}", msg, e);
                Err(::anyhow::anyhow!("{}: {}", msg, e))
            }
        }
    };
}
