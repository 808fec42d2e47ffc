use async_trait::async_trait;
use clap::Parser;
use regex::RegexBuilder;
use tokio::io::AsyncWriteExt;

use super::base::{CommandContext, CommandError, CommandIo, SshCommand};
use super::dispatch::{command, CommandNode, Dispatcher, RegistryError};
use super::{render_table, render_tabbed};
use crate::error::ResolveError;
use crate::repository::list_blocking;

#[derive(Parser)]
#[command(about = "List repositories")]
pub struct ListRepositories {
    /// verbose output
    #[arg(long, short = 'v')]
    verbose: bool,

    /// tab separated output
    #[arg(long, short = 't')]
    tabbed: bool,

    /// case-insensitive regular expression matched against repository names
    filter: Option<String>,
}

#[async_trait]
impl SshCommand for ListRepositories {
    async fn run(&mut self, ctx: &CommandContext, io: &mut CommandIo) -> Result<(), CommandError> {
        let user = ctx.user()?;
        let filter = match &self.filter {
            Some(pattern) => Some(
                RegexBuilder::new(pattern)
                    .case_insensitive(true)
                    .build()
                    .map_err(|e| CommandError::failure(1, format!("fatal: invalid filter: {}", e)))?,
            ),
            None => None,
        };
        let repositories = list_blocking(ctx.services.repositories.clone(), user).await.map_err(|e| match e {
            ResolveError::Io(io) => CommandError::Io(io),
            other => CommandError::Internal(other.into()),
        })?;

        let rows: Vec<Vec<String>> = repositories
            .iter()
            .filter(|r| filter.as_ref().map_or(true, |f| f.is_match(&r.name)))
            .map(|r| {
                if self.verbose {
                    vec![
                        r.name.clone(),
                        r.description.clone().unwrap_or_default(),
                        r.last_change(),
                    ]
                } else {
                    vec![r.name.clone()]
                }
            })
            .collect();

        let output = if self.tabbed {
            render_tabbed(&rows)
        } else if self.verbose {
            render_table(&["Name", "Description", "Last Change"], &rows)
        } else {
            rows.iter().map(|r| format!("{}\n", r[0])).collect()
        };
        io.stdout.write_all(output.as_bytes()).await?;
        Ok(())
    }
}

pub fn repos_dispatcher() -> Result<Dispatcher, RegistryError> {
    Dispatcher::new("repos", "Repository commands").with(
        CommandNode::leaf("list", "List repositories", command::<ListRepositories>()).alias("ls"),
    )
}
