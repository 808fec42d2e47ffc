//! 每个用户一个 `<用户名>.keys` 文件的公钥存储

use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use async_trait::async_trait;
use log::{debug, info, warn};
use tokio::fs;

use super::PublicKeyStore;
use crate::error::{KeyError, KeyStoreError};
use crate::ssh_key::{KeyPermission, SshKey};

/// 解析一行公钥：`[PERMISSION] key-type base64-data [comment]`。
///
/// 没有权限标记时只允许克隆。
pub fn parse_entry(line: &str) -> Result<SshKey, KeyError> {
    let line = line.trim();
    if let Some((first, rest)) = line.split_once(char::is_whitespace) {
        if let Some(permission) = KeyPermission::from_code(first) {
            return Ok(SshKey::from_raw(rest)?.with_permission(permission));
        }
    }
    SshKey::from_raw(line)
}

/// 写回公钥文件的格式
pub fn format_entry(key: &SshKey) -> String {
    format!("{} {}", key.permission().code(), key.raw_data())
}

fn is_key_line(line: &str) -> bool {
    let line = line.trim();
    !line.is_empty() && !line.starts_with('#')
}

/// 基于 `<folder>/<username>.keys` 的公钥存储。
///
/// 重写时保留空行和 `#` 注释行，并原子替换文件。
/// 文件修改时间与上次读取时不同即视为过期；文件不存在表示没有公钥。
/// 同一用户文件的修改串行执行。
pub struct FileKeyStore {
    folder: PathBuf,
    loaded: Mutex<HashMap<String, Option<SystemTime>>>,
    writers: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    tmp_counter: AtomicU64,
}

impl FileKeyStore {
    pub fn new(folder: impl Into<PathBuf>) -> Self {
        let folder = folder.into();
        info!("SSH 公钥目录: {}", folder.display());
        Self {
            folder,
            loaded: Mutex::new(HashMap::new()),
            writers: Mutex::new(HashMap::new()),
            tmp_counter: AtomicU64::new(0),
        }
    }

    /// 同一用户的读-改-写必须串行，否则并发添加会丢失公钥
    async fn lock_user(&self, username: &str) -> tokio::sync::OwnedMutexGuard<()> {
        let lock = {
            let mut writers = self.writers.lock().unwrap_or_else(|e| e.into_inner());
            writers.entry(username.to_lowercase()).or_default().clone()
        };
        lock.lock_owned().await
    }

    pub fn keys_file(&self, username: &str) -> Result<PathBuf, KeyStoreError> {
        if username.is_empty()
            || username.starts_with('.')
            || username.contains(['/', '\\'])
            || username.contains('\0')
        {
            return Err(KeyStoreError::InvalidUser(username.to_string()));
        }
        Ok(self.folder.join(format!("{}.keys", username.to_lowercase())))
    }

    async fn modified(path: &Path) -> Option<SystemTime> {
        fs::metadata(path).await.ok().and_then(|m| m.modified().ok())
    }

    async fn read_lines(path: &Path) -> Result<Vec<String>, KeyStoreError> {
        match fs::read_to_string(path).await {
            Ok(content) => Ok(content.lines().map(str::to_string).collect()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    /// 写入临时文件后重命名，读者不会看到写了一半的文件
    async fn write_lines(&self, path: &Path, lines: &[String]) -> Result<(), KeyStoreError> {
        fs::create_dir_all(&self.folder).await?;
        let file_name = path.file_name().and_then(|n| n.to_str()).unwrap_or("keys");
        let seq = self.tmp_counter.fetch_add(1, Ordering::Relaxed);
        let tmp = self
            .folder
            .join(format!(".{}.{}.{}.tmp", file_name, std::process::id(), seq));
        let mut content = lines.join("\n");
        content.push('\n');
        fs::write(&tmp, content).await?;
        if let Err(e) = fs::rename(&tmp, path).await {
            let _ = fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        Ok(())
    }

    /// 去掉包含 `key` 的行，返回去掉的行数
    fn without_key(lines: Vec<String>, key: &SshKey) -> (Vec<String>, usize) {
        let mut dropped = 0;
        let kept = lines
            .into_iter()
            .filter(|line| {
                let same = is_key_line(line) && parse_entry(line).map(|k| &k == key).unwrap_or(false);
                if same {
                    dropped += 1;
                }
                !same
            })
            .collect();
        (kept, dropped)
    }

    fn forget(&self, username: &str) {
        let mut loaded = self.loaded.lock().unwrap_or_else(|e| e.into_inner());
        loaded.remove(username);
    }
}

#[async_trait]
impl PublicKeyStore for FileKeyStore {
    fn name(&self) -> &'static str {
        "file"
    }

    async fn is_stale(&self, username: &str) -> bool {
        let Ok(path) = self.keys_file(username) else {
            return true;
        };
        let current = Self::modified(&path).await;
        let loaded = self.loaded.lock().unwrap_or_else(|e| e.into_inner());
        match loaded.get(username) {
            Some(seen) => *seen != current,
            None => true,
        }
    }

    async fn load_keys(&self, username: &str) -> Result<Vec<SshKey>, KeyStoreError> {
        let path = self.keys_file(username)?;
        let modified = Self::modified(&path).await;
        let lines = Self::read_lines(&path).await?;

        let mut keys = Vec::new();
        for (idx, line) in lines.iter().enumerate() {
            if !is_key_line(line) {
                continue;
            }
            let key = parse_entry(line).map_err(|source| KeyStoreError::Corrupt {
                path: path.clone(),
                line: idx + 1,
                source,
            })?;
            keys.push(key);
        }
        debug!("从 {} 读取了 {} 个公钥", path.display(), keys.len());

        let mut loaded = self.loaded.lock().unwrap_or_else(|e| e.into_inner());
        loaded.insert(username.to_string(), modified);
        Ok(keys)
    }

    async fn add_key(&self, username: &str, key: &SshKey) -> Result<bool, KeyStoreError> {
        let path = self.keys_file(username)?;
        let _guard = self.lock_user(username).await;
        let lines = Self::read_lines(&path).await?;

        // 同一个密钥只保留一行，替换到原来的位置
        let entry = format_entry(key);
        let mut replaced = false;
        let mut out = Vec::with_capacity(lines.len() + 1);
        for line in lines {
            let same = is_key_line(&line) && parse_entry(&line).map(|k| &k == key).unwrap_or(false);
            if !same {
                out.push(line);
            } else if !replaced {
                out.push(entry.clone());
                replaced = true;
            }
        }
        if !replaced {
            out.push(entry);
        }

        self.write_lines(&path, &out).await?;
        self.forget(username);
        info!("为 {} 保存公钥 {}", username, key.fingerprint());
        Ok(true)
    }

    async fn remove_key(&self, username: &str, key: &SshKey) -> Result<bool, KeyStoreError> {
        let path = self.keys_file(username)?;
        let _guard = self.lock_user(username).await;
        let lines = Self::read_lines(&path).await?;
        let (kept, dropped) = Self::without_key(lines, key);
        if dropped == 0 {
            return Ok(false);
        }

        if kept.iter().any(|l| is_key_line(l)) {
            self.write_lines(&path, &kept).await?;
        } else if let Err(e) = fs::remove_file(&path).await {
            if e.kind() != ErrorKind::NotFound {
                return Err(e.into());
            }
        }
        self.forget(username);
        info!("删除 {} 的公钥 {}", username, key.fingerprint());
        Ok(true)
    }

    async fn remove_all_keys(&self, username: &str) -> Result<bool, KeyStoreError> {
        let path = self.keys_file(username)?;
        let _guard = self.lock_user(username).await;
        self.forget(username);
        match fs::remove_file(&path).await {
            Ok(()) => {
                info!("删除 {} 的全部公钥", username);
                Ok(true)
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => {
                warn!("无法删除 {}: {}", path.display(), e);
                Err(e.into())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssh_key::tests::{ALICE_ED25519, ALICE_RSA, BOB_ED25519};

    #[test]
    fn parse_entry_with_and_without_permission() {
        let view = parse_entry(&format!("V {}", ALICE_RSA)).unwrap();
        assert_eq!(view.permission(), KeyPermission::View);
        assert!(!view.permission().can_push());
        assert_eq!(view.comment(), "alice@laptop");

        let plain = parse_entry(ALICE_ED25519).unwrap();
        assert_eq!(plain.permission(), KeyPermission::Clone);

        let push = parse_entry(&format!("RW {}", BOB_ED25519)).unwrap();
        assert_eq!(push.permission(), KeyPermission::Push);
        assert_eq!(format_entry(&push), format!("RW {}", BOB_ED25519));
    }

    #[tokio::test]
    async fn missing_file_means_no_keys() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileKeyStore::new(dir.path());
        assert!(store.load_keys("alice").await.unwrap().is_empty());
        assert!(!store.remove_all_keys("alice").await.unwrap());
    }

    #[tokio::test]
    async fn rewrite_preserves_comments_and_blank_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("alice.keys");
        std::fs::write(&path, format!("# alice's keys\n\nV {}\n", ALICE_RSA)).unwrap();

        let store = FileKeyStore::new(dir.path());
        let bob = SshKey::from_raw(BOB_ED25519).unwrap();
        assert!(store.add_key("alice", &bob).await.unwrap());

        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(
            content,
            format!("# alice's keys\n\nV {}\nR {}\n", ALICE_RSA, BOB_ED25519)
        );

        assert!(store.remove_key("alice", &bob).await.unwrap());
        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content, format!("# alice's keys\n\nV {}\n", ALICE_RSA));
    }

    #[tokio::test]
    async fn add_then_remove_restores_empty_state() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileKeyStore::new(dir.path());
        let key = SshKey::from_raw(ALICE_ED25519).unwrap();

        assert!(store.add_key("alice", &key).await.unwrap());
        assert_eq!(store.load_keys("alice").await.unwrap(), vec![key.clone()]);
        assert!(store.remove_key("alice", &key).await.unwrap());
        assert!(store.load_keys("alice").await.unwrap().is_empty());
        assert!(!dir.path().join("alice.keys").exists());

        // 再次添加不受之前删除的影响
        assert!(store.add_key("alice", &key).await.unwrap());
        assert_eq!(store.load_keys("alice").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn staleness_follows_modification_time() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileKeyStore::new(dir.path());
        assert!(store.is_stale("alice").await);

        store.load_keys("alice").await.unwrap();
        assert!(!store.is_stale("alice").await);

        std::fs::write(dir.path().join("alice.keys"), format!("{}\n", ALICE_ED25519)).unwrap();
        assert!(store.is_stale("alice").await);
        assert_eq!(store.load_keys("alice").await.unwrap().len(), 1);
        assert!(!store.is_stale("alice").await);
    }

    #[tokio::test]
    async fn corrupt_line_aborts_load() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("alice.keys"), "ssh-ed25519 !!!\n").unwrap();
        let store = FileKeyStore::new(dir.path());
        let err = store.load_keys("alice").await.unwrap_err();
        assert!(matches!(err, KeyStoreError::Corrupt { line: 1, .. }));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_adds_keep_every_key() {
        use russh::keys::{Algorithm, PrivateKey};

        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(FileKeyStore::new(dir.path()));
        let mut tasks = Vec::new();
        for _ in 0..16 {
            let store = store.clone();
            let key = PrivateKey::random(&mut rand::thread_rng(), Algorithm::Ed25519).unwrap();
            let key = SshKey::from_public_key(key.public_key().clone());
            tasks.push(tokio::spawn(async move { store.add_key("alice", &key).await }));
        }
        for task in tasks {
            assert!(task.await.unwrap().unwrap());
        }

        assert_eq!(store.load_keys("alice").await.unwrap().len(), 16);
        // 没有残留的临时文件
        let leftovers = std::fs::read_dir(dir.path())
            .unwrap()
            .filter(|e| e.as_ref().unwrap().file_name().to_string_lossy().ends_with(".tmp"))
            .count();
        assert_eq!(leftovers, 0);
    }

    #[test]
    fn rejects_path_like_usernames() {
        let store = FileKeyStore::new("/tmp/keys");
        assert!(store.keys_file("../etc").is_err());
        assert!(store.keys_file("a/b").is_err());
        assert!(store.keys_file("").is_err());
        assert!(store.keys_file("Alice").unwrap().ends_with("alice.keys"));
    }
}
