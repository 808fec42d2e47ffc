//! 仓库定位、访问控制和打开句柄

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

use time::format_description;
use time::OffsetDateTime;
use tracing::debug;

use crate::auth::UserModel;
use crate::error::ResolveError;
use crate::session::SshDaemonClient;

const MAX_LIST_DEPTH: usize = 4;
const DEFAULT_DESCRIPTION: &str = "Unnamed repository;";

/// 通过 SSH 提供的 git pack 服务
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PackService {
    UploadPack,
    ReceivePack,
}

impl PackService {
    pub fn name(&self) -> &'static str {
        match self {
            PackService::UploadPack => "git-upload-pack",
            PackService::ReceivePack => "git-receive-pack",
        }
    }

    /// 实现该服务的 `git` 子命令
    pub fn subcommand(&self) -> &'static str {
        match self {
            PackService::UploadPack => "upload-pack",
            PackService::ReceivePack => "receive-pack",
        }
    }

    fn action(&self) -> &'static str {
        match self {
            PackService::UploadPack => "clone",
            PackService::ReceivePack => "push",
        }
    }
}

/// 已打开的仓库，释放时打开计数减一
#[derive(Debug)]
pub struct Repository {
    name: String,
    path: PathBuf,
    open: Arc<AtomicUsize>,
}

impl Repository {
    fn new(name: String, path: PathBuf, open: Arc<AtomicUsize>) -> Self {
        open.fetch_add(1, Ordering::SeqCst);
        Self { name, path, open }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for Repository {
    fn drop(&mut self) {
        self.open.fetch_sub(1, Ordering::SeqCst);
        debug!(repository = %self.name, "仓库句柄已释放");
    }
}

#[derive(Debug, Clone)]
pub struct RepositoryInfo {
    pub name: String,
    pub description: Option<String>,
    pub last_modified: Option<SystemTime>,
}

impl RepositoryInfo {
    pub fn last_change(&self) -> String {
        let Some(modified) = self.last_modified else {
            return String::new();
        };
        let when = OffsetDateTime::from(modified);
        format_description::parse("[year]-[month]-[day] [hour]:[minute]")
            .ok()
            .and_then(|f| when.format(&f).ok())
            .unwrap_or_default()
    }
}

/// 定位仓库并判断客户端能否使用
pub trait RepositoryResolver: Send + Sync {
    fn open(&self, client: &SshDaemonClient, path: &str, service: PackService) -> Result<Repository, ResolveError>;

    /// `user` 可见的仓库，按名称排序
    fn list(&self, user: &UserModel) -> Result<Vec<RepositoryInfo>, ResolveError>;

    fn open_handles(&self) -> usize;
}

fn join_error(e: tokio::task::JoinError) -> ResolveError {
    ResolveError::Io(std::io::Error::other(e))
}

/// 在阻塞线程池上打开仓库，文件系统访问不占用驱动 SSH 会话的运行时线程
pub async fn open_blocking(
    resolver: Arc<dyn RepositoryResolver>,
    client: Arc<SshDaemonClient>,
    path: &str,
    service: PackService,
) -> Result<Repository, ResolveError> {
    let path = path.to_string();
    tokio::task::spawn_blocking(move || resolver.open(&client, &path, service))
        .await
        .map_err(join_error)?
}

/// 在阻塞线程池上遍历仓库目录
pub async fn list_blocking(
    resolver: Arc<dyn RepositoryResolver>,
    user: &UserModel,
) -> Result<Vec<RepositoryInfo>, ResolveError> {
    let user = user.clone();
    tokio::task::spawn_blocking(move || resolver.list(&user))
        .await
        .map_err(join_error)?
}

/// 把客户端提供的路径转换为相对仓库根目录的名称
pub fn normalize_path(raw: &str) -> Result<String, ResolveError> {
    let trimmed = raw.trim().trim_start_matches('/').trim_end_matches('/');
    let invalid = || ResolveError::InvalidPath(raw.to_string());
    if trimmed.is_empty() || trimmed.contains('\\') || trimmed.contains('\0') {
        return Err(invalid());
    }
    if trimmed.split('/').any(|c| c.is_empty() || c == "." || c == "..") {
        return Err(invalid());
    }
    Ok(trimmed.to_string())
}

fn is_bare_repository(path: &Path) -> bool {
    path.join("HEAD").is_file() && path.join("objects").is_dir()
}

/// 同一根目录下的裸仓库
pub struct RepositoryManager {
    root: PathBuf,
    upload_pack: bool,
    receive_pack: bool,
    open: Arc<AtomicUsize>,
}

impl RepositoryManager {
    pub fn new(root: impl Into<PathBuf>, upload_pack: bool, receive_pack: bool) -> Self {
        Self {
            root: root.into(),
            upload_pack,
            receive_pack,
            open: Arc::new(AtomicUsize::new(0)),
        }
    }

    fn enabled(&self, service: PackService) -> bool {
        match service {
            PackService::UploadPack => self.upload_pack,
            PackService::ReceivePack => self.receive_pack,
        }
    }

    fn locate(&self, name: &str) -> Option<(String, PathBuf)> {
        let mut candidates = vec![name.to_string()];
        if !name.ends_with(".git") {
            candidates.push(format!("{}.git", name));
        }
        candidates.into_iter().find_map(|candidate| {
            let path = self.root.join(&candidate);
            is_bare_repository(&path).then_some((candidate, path))
        })
    }

    fn walk(&self, dir: &Path, depth: usize, found: &mut Vec<RepositoryInfo>) -> Result<(), ResolveError> {
        for entry in fs::read_dir(dir)? {
            let path = entry?.path();
            if !path.is_dir() {
                continue;
            }
            if is_bare_repository(&path) {
                let Ok(relative) = path.strip_prefix(&self.root) else {
                    continue;
                };
                let name = relative
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy())
                    .collect::<Vec<_>>()
                    .join("/");
                let description = fs::read_to_string(path.join("description"))
                    .ok()
                    .map(|d| d.trim().to_string())
                    .filter(|d| !d.is_empty() && !d.starts_with(DEFAULT_DESCRIPTION));
                let last_modified = fs::metadata(path.join("refs"))
                    .or_else(|_| fs::metadata(&path))
                    .and_then(|m| m.modified())
                    .ok();
                found.push(RepositoryInfo {
                    name,
                    description,
                    last_modified,
                });
            } else if depth < MAX_LIST_DEPTH {
                self.walk(&path, depth + 1, found)?;
            }
        }
        Ok(())
    }
}

impl RepositoryResolver for RepositoryManager {
    fn open(&self, client: &SshDaemonClient, path: &str, service: PackService) -> Result<Repository, ResolveError> {
        let name = normalize_path(path)?;
        if !self.enabled(service) {
            return Err(ResolveError::ServiceDisabled(service.name()));
        }
        let not_found = || ResolveError::NotFound(name.clone());
        let (name, location) = self.locate(&name).ok_or_else(not_found)?;

        // 解析符号链接后仍必须位于仓库根目录内
        let root = self.root.canonicalize()?;
        let location = location.canonicalize()?;
        if !location.starts_with(&root) {
            return Err(ResolveError::InvalidPath(path.to_string()));
        }

        let user = client.user().ok_or_else(|| ResolveError::NotFound(name.clone()))?;
        if !user.can_access(&name) {
            // 不向无权访问的用户透露仓库是否存在
            return Err(ResolveError::NotFound(name));
        }
        if let Some(key) = client.key() {
            let allowed = match service {
                PackService::UploadPack => key.permission().can_clone(),
                PackService::ReceivePack => key.permission().can_push(),
            };
            if !allowed {
                return Err(ResolveError::NotAuthorized {
                    user: user.username.clone(),
                    action: service.action(),
                    repository: name,
                });
            }
        }
        Ok(Repository::new(name, location, self.open.clone()))
    }

    fn list(&self, user: &UserModel) -> Result<Vec<RepositoryInfo>, ResolveError> {
        let mut found = Vec::new();
        if self.root.is_dir() {
            self.walk(&self.root, 0, &mut found)?;
        }
        found.retain(|r| user.can_access(&r.name));
        found.sort_by(|a, b| a.name.to_lowercase().cmp(&b.name.to_lowercase()));
        Ok(found)
    }

    fn open_handles(&self) -> usize {
        self.open.load(Ordering::SeqCst)
    }
}
