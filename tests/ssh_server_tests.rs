use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use clap::Parser;
use russh::keys::{Algorithm, PrivateKey};
use russh::server::{Auth, Handler, Server};
use tokio_util::sync::CancellationToken;

use gitblit_ssh::auth::{AuthenticationManager, ConfigUserManager, UserModel};
use gitblit_ssh::commands::base::{Captured, STATUS_CANCEL};
use gitblit_ssh::commands::{
    command, split, CommandContext, CommandError, CommandIo, CommandNode, ExitCallback, Services, SshCommand,
    SshCommandFactory,
};
use gitblit_ssh::keys::{KeyManager, MemoryKeyStore};
use gitblit_ssh::pack::{GitProcess, PackProtocol};
use gitblit_ssh::plugins::{CommandProvider, PluginManager};
use gitblit_ssh::repository::{PackService, Repository, RepositoryManager};
use gitblit_ssh::ssh_key::SshKey;
use gitblit_ssh::config::AuthMethod;
use gitblit_ssh::{DaemonConfig, SshDaemon, SshDaemonClient};

fn users() -> Vec<UserModel> {
    vec![
        UserModel {
            username: "alice".into(),
            password: Some("wonderland".into()),
            repositories: vec!["demo.git".into()],
            ..Default::default()
        },
        UserModel {
            username: "admin".into(),
            password: Some("admin".into()),
            admin: true,
            ..Default::default()
        },
    ]
}

/// Reports which repository would have been served.
struct RecordingPack;

#[async_trait]
impl PackProtocol for RecordingPack {
    async fn serve(
        &self,
        service: PackService,
        repository: &Repository,
        _git_protocol: Option<&str>,
        io: &mut CommandIo,
    ) -> Result<u32, CommandError> {
        io.println(&format!("{} {}", service.subcommand(), repository.name())).await?;
        Ok(0)
    }
}

#[derive(Parser)]
struct Explode;

#[async_trait]
impl SshCommand for Explode {
    async fn run(&mut self, _ctx: &CommandContext, _io: &mut CommandIo) -> Result<(), CommandError> {
        Err(anyhow::anyhow!("database exploded at /srv/secret/path").into())
    }
}

/// Waits until its connection goes away.
#[derive(Parser)]
struct Hang;

#[async_trait]
impl SshCommand for Hang {
    fn cancelable(&self) -> bool {
        true
    }

    async fn run(&mut self, _ctx: &CommandContext, _io: &mut CommandIo) -> Result<(), CommandError> {
        std::future::pending::<()>().await;
        Ok(())
    }
}

/// Plugin contributing a command that always fails unexpectedly.
struct FaultyPlugin;

impl CommandProvider for FaultyPlugin {
    fn plugin_id(&self) -> &str {
        "faulty"
    }

    fn version(&self) -> &str {
        "1.0.0"
    }

    fn commands(&self) -> Vec<CommandNode> {
        vec![
            CommandNode::leaf("explode", "always fails", command::<Explode>()),
            CommandNode::leaf("hang", "waits until canceled", command::<Hang>()),
        ]
    }
}

fn bare_repo(root: &Path, name: &str) {
    let dir = root.join(name);
    std::fs::create_dir_all(dir.join("objects")).unwrap();
    std::fs::create_dir_all(dir.join("refs")).unwrap();
    std::fs::write(dir.join("HEAD"), "ref: refs/heads/master\n").unwrap();
}

fn services(repositories: &Path, pack: Arc<dyn PackProtocol>) -> Arc<Services> {
    services_with(
        DaemonConfig {
            users: users(),
            ..Default::default()
        },
        repositories,
        pack,
    )
}

fn services_with(config: DaemonConfig, repositories: &Path, pack: Arc<dyn PackProtocol>) -> Arc<Services> {
    Arc::new(Services {
        config: Arc::new(config),
        keys: Arc::new(KeyManager::new(Arc::new(MemoryKeyStore::new()))),
        repositories: Arc::new(RepositoryManager::new(repositories, true, true)),
        pack,
        plugins: Arc::new(PluginManager::new(None, vec![Arc::new(FaultyPlugin)])),
    })
}

async fn client(username: &str) -> Arc<SshDaemonClient> {
    let client = SshDaemonClient::new(42, None);
    let manager = ConfigUserManager::new(users());
    let user = manager.find_user(username).await.unwrap();
    assert!(client.bind(user, None));
    Arc::new(client)
}

#[derive(Default)]
struct ExitRecorder(Mutex<Vec<u32>>);

#[async_trait]
impl ExitCallback for ExitRecorder {
    async fn on_exit(&self, rc: u32) {
        self.0.lock().unwrap().push(rc);
    }
}

async fn run(factory: &SshCommandFactory, username: &str, line: &str, stdin: &'static [u8]) -> (u32, Captured, Vec<u32>) {
    let (io, captured) = CommandIo::capture(stdin);
    let exits = Arc::new(ExitRecorder::default());
    let handle = factory.start(
        client(username).await,
        line.to_string(),
        io,
        exits.clone(),
        CancellationToken::new(),
    );
    let rc = handle.await.unwrap();
    let recorded = exits.0.lock().unwrap().clone();
    (rc, captured, recorded)
}

#[tokio::test]
async fn test_command_lines_are_routed() {
    let dir = tempfile::tempdir().unwrap();
    bare_repo(dir.path(), "demo.git");
    let factory = SshCommandFactory::new(services(dir.path(), Arc::new(RecordingPack)), 1, 2).unwrap();

    assert_eq!(split("git-upload-pack '/demo.git'"), vec!["git-upload-pack", "/demo.git"]);
    let (rc, out, exits) = run(&factory, "alice", "git-upload-pack '/demo.git'", b"").await;
    assert_eq!(rc, 0);
    assert_eq!(out.stdout.contents(), "upload-pack demo.git\n");
    assert_eq!(exits, vec![0]);

    let (rc, out, exits) = run(&factory, "alice", "gitblit bogus", b"").await;
    assert_eq!(rc, 1);
    assert_eq!(out.stderr.contents(), "gitblit: bogus: not found\n");
    assert_eq!(exits, vec![1]);

    let (rc, out, _) = run(&factory, "admin", "gitblit plugin list", b"").await;
    assert_eq!(rc, 0);
    assert!(out.stdout.contents().contains("faulty"));

    let (rc, out, _) = run(&factory, "alice", "gitblit version", b"").await;
    assert_eq!(rc, 0);
    assert!(out.stdout.contents().starts_with("gitblit-ssh v"));
}

#[tokio::test]
async fn test_unexpected_errors_stay_on_the_server() {
    let dir = tempfile::tempdir().unwrap();
    let factory = SshCommandFactory::new(services(dir.path(), Arc::new(RecordingPack)), 1, 1).unwrap();

    let (rc, out, exits) = run(&factory, "alice", "explode", b"").await;
    assert_eq!(rc, 128);
    assert_eq!(out.stderr.contents(), "fatal: internal server error\n");
    assert!(!out.stderr.contents().contains("secret"));
    assert_eq!(exits, vec![128]);
}

#[tokio::test]
async fn test_stopped_plugins_hide_their_commands() {
    let dir = tempfile::tempdir().unwrap();
    let services = services(dir.path(), Arc::new(RecordingPack));
    let factory = SshCommandFactory::new(services.clone(), 1, 1).unwrap();

    let (rc, out, _) = run(&factory, "admin", "plugin stop faulty", b"").await;
    assert_eq!(rc, 0);
    assert_eq!(out.stdout.contents(), "Stopped faulty\n");

    let (rc, out, _) = run(&factory, "alice", "explode", b"").await;
    assert_eq!(rc, 1);
    assert_eq!(out.stderr.contents(), "Gitblit: explode: not found\n");
}

#[tokio::test]
async fn test_keys_round_trip_over_commands() {
    let dir = tempfile::tempdir().unwrap();
    let services = services(dir.path(), Arc::new(RecordingPack));
    let factory = SshCommandFactory::new(services.clone(), 1, 1).unwrap();

    let key = PrivateKey::random(&mut rand::thread_rng(), Algorithm::Ed25519).unwrap();
    let line = format!("{} laptop\n", key.public_key().to_openssh().unwrap());
    let stdin: &'static [u8] = Box::leak(line.into_bytes().into_boxed_slice());

    let (rc, out, _) = run(&factory, "alice", "keys add", stdin).await;
    assert_eq!(rc, 0, "{}", out.stderr.contents());
    assert!(out.stdout.contents().starts_with("Added SHA256:"));
    assert_eq!(services.keys.get_keys("alice").await.unwrap().len(), 1);

    let (rc, _, _) = run(&factory, "alice", "keys rm ALL", b"").await;
    assert_eq!(rc, 0);
    assert!(services.keys.get_keys("alice").await.unwrap().is_empty());
}

#[tokio::test]
async fn test_session_authentication() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let services = services(dir.path(), Arc::new(RecordingPack));
    let key = PrivateKey::random(&mut rand::thread_rng(), Algorithm::Ed25519)?;
    services
        .keys
        .add_key("alice", &SshKey::from_public_key(key.public_key().clone()))
        .await?;

    let mut daemon = SshDaemon::new(services.clone(), Arc::new(ConfigUserManager::new(users())))?;

    let mut session = daemon.new_client(None);
    assert!(matches!(session.auth_none("alice").await?, Auth::Reject { .. }));
    assert!(matches!(session.auth_password("alice", "nope").await?, Auth::Reject { .. }));
    assert!(matches!(session.auth_password("alice", "wonderland").await?, Auth::Accept));
    assert_eq!(session.client().username(), Some("alice"));
    assert!(session.client().key().is_none());

    let mut session = daemon.new_client(None);
    assert!(matches!(session.auth_publickey("alice", key.public_key()).await?, Auth::Accept));
    assert!(session.client().key().is_some());

    let other = PrivateKey::random(&mut rand::thread_rng(), Algorithm::Ed25519)?;
    let mut session = daemon.new_client(None);
    assert!(matches!(session.auth_publickey("alice", other.public_key()).await?, Auth::Reject { .. }));
    assert!(matches!(session.auth_publickey("bob", key.public_key()).await?, Auth::Reject { .. }));
    assert!(session.client().user().is_none());

    let mut session = daemon.new_client(None);
    assert!(matches!(
        session.auth_keyboard_interactive("alice", "", None).await?,
        Auth::Partial { .. }
    ));
    Ok(())
}

#[tokio::test]
async fn test_closing_session_cancels_running_commands() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let services = services(dir.path(), Arc::new(RecordingPack));
    let mut daemon = SshDaemon::new(services, Arc::new(ConfigUserManager::new(users())))?;
    let mut session = daemon.new_client(None);
    assert!(matches!(session.auth_password("alice", "wonderland").await?, Auth::Accept));

    // 与 exec 请求相同：命令使用会话令牌的子令牌
    let (io, captured) = CommandIo::capture(tokio::io::empty());
    let exits = Arc::new(ExitRecorder::default());
    let handle = daemon.factory().start(
        session.client().clone(),
        "hang".to_string(),
        io,
        exits.clone(),
        session.cancel_token().child_token(),
    );
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!handle.is_finished());

    drop(session);
    let rc = tokio::time::timeout(Duration::from_secs(5), handle).await??;
    assert_eq!(rc, STATUS_CANCEL);
    assert_eq!(*exits.0.lock().unwrap(), vec![STATUS_CANCEL]);
    assert_eq!(captured.stderr.contents(), "");
    Ok(())
}

#[tokio::test]
async fn test_kerberos_principal_binds_session() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let config = DaemonConfig {
        users: users(),
        auth_methods: vec![AuthMethod::PublicKey, AuthMethod::GssapiWithMic],
        ..Default::default()
    };
    let kerberos_services = services_with(config, dir.path(), Arc::new(RecordingPack));
    let mut daemon = SshDaemon::new(kerberos_services, Arc::new(ConfigUserManager::new(users())))?;

    let session = daemon.new_client(None);
    assert!(matches!(
        session.authenticate_principal("alice", "bob@EXAMPLE.COM").await,
        Auth::Reject { .. }
    ));
    assert!(session.client().user().is_none());
    assert!(matches!(
        session.authenticate_principal("alice", "alice@EXAMPLE.COM").await,
        Auth::Accept
    ));
    assert_eq!(session.client().username(), Some("alice"));
    assert!(session.client().key().is_none());

    // 未启用 gssapi-with-mic 时一律拒绝
    let dir = tempfile::tempdir()?;
    let mut daemon = SshDaemon::new(
        services(dir.path(), Arc::new(RecordingPack)),
        Arc::new(ConfigUserManager::new(users())),
    )?;
    let session = daemon.new_client(None);
    assert!(matches!(
        session.authenticate_principal("alice", "alice@EXAMPLE.COM").await,
        Auth::Reject { .. }
    ));
    assert!(session.client().user().is_none());
    Ok(())
}

#[tokio::test]
async fn test_git_upload_pack_advertises_refs() {
    let git_available = std::process::Command::new("git")
        .arg("--version")
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false);
    if !git_available {
        eprintln!("git 不可用，跳过");
        return;
    }

    let dir = tempfile::tempdir().unwrap();
    let status = std::process::Command::new("git")
        .args(["init", "--bare", "-q"])
        .arg(dir.path().join("demo.git"))
        .status()
        .unwrap();
    assert!(status.success());

    let factory = SshCommandFactory::new(services(dir.path(), Arc::new(GitProcess::new("git"))), 1, 1).unwrap();
    // 客户端只发送 flush-pkt，upload-pack 广播引用后退出
    let (rc, out, exits) = run(&factory, "alice", "git-upload-pack '/demo.git'", b"0000").await;
    assert_eq!(rc, 0, "{}", out.stderr.contents());
    let advertised = out.stdout.contents();
    assert!(advertised.ends_with("0000"), "{}", advertised);
    assert_eq!(exits, vec![0]);

    let (rc, out, _) = run(&factory, "alice", "git-upload-pack '/missing.git'", b"").await;
    assert_eq!(rc, 1);
    assert!(out.stdout.contents().contains("ERR repository 'missing.git' not found"));
}
