//! SSH 命令：执行引擎、命令树和各个命令

pub mod base;
pub mod dispatch;
pub mod factory;
pub mod git;
pub mod keys;
pub mod plugin;
pub mod repos;
pub mod work_queue;

pub use base::{CommandContext, CommandError, CommandIo, ExitCallback, Failure, Services, SshCommand};
pub use dispatch::{command, CommandNode, Dispatcher, RegistryError};
pub use factory::{split, SshCommandFactory};
pub use work_queue::WorkQueue;

/// 左对齐的表格，表头下有分隔线
pub(crate) fn render_table(headers: &[&str], rows: &[Vec<String>]) -> String {
    let mut widths: Vec<usize> = headers.iter().map(|h| h.chars().count()).collect();
    for row in rows {
        for (i, cell) in row.iter().enumerate().take(widths.len()) {
            widths[i] = widths[i].max(cell.chars().count());
        }
    }

    let mut table = table_line(&widths, headers.iter().copied());
    let rule: Vec<String> = widths.iter().map(|w| "─".repeat(*w)).collect();
    table.push_str(&table_line(&widths, rule.iter().map(String::as_str)));
    for row in rows {
        table.push_str(&table_line(&widths, row.iter().map(String::as_str)));
    }
    table
}

fn table_line<'a>(widths: &[usize], cells: impl Iterator<Item = &'a str>) -> String {
    let mut out = String::new();
    for (i, cell) in cells.enumerate().take(widths.len()) {
        if i > 0 {
            out.push_str("  ");
        }
        out.push_str(cell);
        let pad = widths[i].saturating_sub(cell.chars().count());
        out.extend(std::iter::repeat(' ').take(pad));
    }
    out.truncate(out.trim_end().len());
    out.push('\n');
    out
}

/// 制表符分隔，便于脚本处理
pub(crate) fn render_tabbed(rows: &[Vec<String>]) -> String {
    rows.iter().map(|r| format!("{}\n", r.join("\t"))).collect()
}
