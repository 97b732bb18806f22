pub(crate) mod logger;

use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;

use anyhow::Context as _;
use camino::Utf8Path;
use model_proxy_task::ChildTask;
use tokio::process::Command;
use tokio::sync::watch;

pub use self::logger::RuntimeLogs;
use crate::config::Conf;

/// Environment variable telling the runtime where the rendezvous socket is.
pub const ENV_IPC_PATH: &str = "ABEJA_IPC_PATH";
/// Environment variable telling the runtime where to put training artifacts.
pub const ENV_TRAINING_RESULT_DIR: &str = "ABEJA_TRAINING_RESULT_DIR";
const ENV_PLATFORM_USER_ID: &str = "ABEJA_PLATFORM_USER_ID";

const BOOT_POLL_INTERVAL: Duration = Duration::from_secs(1);
const STOP_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Lifecycle of the runtime process. Terminal states are sticky.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RuntimeState {
    Preparing = 0,
    Running = 1,
    ExitedSuccess = 2,
    ExitedFailure = 3,
}

impl RuntimeState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => RuntimeState::Preparing,
            1 => RuntimeState::Running,
            2 => RuntimeState::ExitedSuccess,
            _ => RuntimeState::ExitedFailure,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, RuntimeState::ExitedSuccess | RuntimeState::ExitedFailure)
    }
}

/// What to execute and under which contract.
#[derive(Debug)]
pub struct RuntimeSpec {
    pub argv: Vec<String>,
    pub envs: Vec<(String, String)>,
    /// Non-zero exit codes the runtime uses for a clean shutdown.
    pub allowed_exit_codes: &'static [i32],
}

/// Resolves the configured runtime-language key to the service/batch
/// executable discovered via `PATH`.
fn resolve_service_command(runtime_key: &str) -> anyhow::Result<(Vec<String>, &'static [i32])> {
    match runtime_key {
        "python36" => Ok((vec!["abeja-runtime-python".to_owned()], &[120])),
        other => anyhow::bail!("unsupported runtime language: {other}"),
    }
}

/// Interpreter used to run the training bootstrap.
fn resolve_train_command(runtime_key: &str) -> anyhow::Result<(&'static str, &'static [i32])> {
    match runtime_key {
        "python36" => Ok(("python3", &[120])),
        other => anyhow::bail!("unsupported runtime language: {other}"),
    }
}

pub fn service_spec(conf: &Conf, socket_path: &Utf8Path, training_result_dir: &Utf8Path) -> anyhow::Result<RuntimeSpec> {
    let (argv, allowed_exit_codes) = resolve_service_command(&conf.runtime)?;
    Ok(RuntimeSpec {
        argv,
        envs: vec![
            (ENV_IPC_PATH.to_owned(), socket_path.to_string()),
            (ENV_TRAINING_RESULT_DIR.to_owned(), training_result_dir.to_string()),
        ],
        allowed_exit_codes,
    })
}

pub fn oneshot_spec(conf: &Conf, socket_path: &Utf8Path, training_result_dir: &Utf8Path) -> anyhow::Result<RuntimeSpec> {
    service_spec(conf, socket_path, training_result_dir)
}

pub fn train_spec(conf: &Conf, bootstrap_path: &Utf8Path, training_result_dir: &Utf8Path) -> anyhow::Result<RuntimeSpec> {
    let (interpreter, allowed_exit_codes) = resolve_train_command(&conf.runtime)?;
    Ok(RuntimeSpec {
        argv: vec![interpreter.to_owned(), bootstrap_path.to_string()],
        envs: vec![
            (ENV_TRAINING_RESULT_DIR.to_owned(), training_result_dir.to_string()),
            (ENV_PLATFORM_USER_ID.to_owned(), conf.auth_info().user_id),
        ],
        allowed_exit_codes,
    })
}

/// Creates the private directory holding the rendezvous socket and
/// returns `(directory, socket path)`. The caller removes the directory
/// after the child exits.
pub fn make_rendezvous_path() -> anyhow::Result<(camino::Utf8PathBuf, camino::Utf8PathBuf)> {
    let tmp = camino::Utf8PathBuf::from_path_buf(std::env::temp_dir())
        .map_err(|path| anyhow::anyhow!("non UTF-8 temp dir: {path:?}"))?;
    let dir = tmp.join(format!("model-proxy-ipc-{}", uuid::Uuid::new_v4()));
    std::fs::create_dir_all(&dir).with_context(|| format!("failed to create socket directory {dir}"))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt as _;
        std::fs::set_permissions(&dir, std::fs::Permissions::from_mode(0o700))
            .context("failed to restrict socket directory permissions")?;
    }
    let socket_path = dir.join("runtime.sock");
    Ok((dir, socket_path))
}

struct Shared {
    state: AtomicU8,
    exit_tx: watch::Sender<bool>,
}

/// Cheap, read-only view over the runtime state, handed to the HTTP front
/// door and the shutdown controller. Only the supervisor writes.
#[derive(Clone)]
pub struct RuntimeHandle(Arc<Shared>);

impl RuntimeHandle {
    pub(crate) fn new() -> Self {
        let (exit_tx, _) = watch::channel(false);
        RuntimeHandle(Arc::new(Shared {
            state: AtomicU8::new(RuntimeState::Preparing as u8),
            exit_tx,
        }))
    }

    pub fn state(&self) -> RuntimeState {
        RuntimeState::from_u8(self.0.state.load(Ordering::Acquire))
    }

    pub fn is_ready(&self) -> bool {
        self.state() == RuntimeState::Running
    }

    pub fn is_exited(&self) -> bool {
        self.state().is_terminal()
    }

    pub(crate) fn mark_running(&self) {
        let _ = self.0.state.compare_exchange(
            RuntimeState::Preparing as u8,
            RuntimeState::Running as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    pub(crate) fn record_exit(&self, exit_code: Option<i32>, allowed: &[i32]) {
        let success = matches!(exit_code, Some(code) if code == 0 || allowed.contains(&code));
        loop {
            let current = RuntimeState::from_u8(self.0.state.load(Ordering::Acquire));
            let next = match current {
                // exited before the rendezvous socket appeared
                RuntimeState::Preparing => RuntimeState::ExitedFailure,
                RuntimeState::Running => {
                    if success {
                        RuntimeState::ExitedSuccess
                    } else {
                        RuntimeState::ExitedFailure
                    }
                }
                _ => break,
            };
            if self
                .0
                .state
                .compare_exchange(current as u8, next as u8, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                break;
            }
        }
        info!(exit_code = ?exit_code, "runtime finished");
        let _ = self.0.exit_tx.send(true);
    }

    /// Resolves once the runtime process has exited.
    pub async fn exited(&self) {
        let mut rx = self.0.exit_tx.subscribe();
        while !*rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

/// The supervisor side of the runtime process. Exclusive owner: nothing
/// else may signal the child.
pub struct Runtime {
    pid: i32,
    allowed_exit_codes: &'static [i32],
    handle: RuntimeHandle,
    _waiter: ChildTask<()>,
}

impl Runtime {
    /// Spawns the runtime with piped stdio and starts the log tails and
    /// the exit watcher. The parent environment is inherited.
    pub fn spawn(spec: RuntimeSpec) -> anyhow::Result<(Runtime, RuntimeLogs)> {
        let (program, args) = spec
            .argv
            .split_first()
            .context("runtime command must not be empty")?;

        let mut command = Command::new(program);
        command.args(args).stdout(Stdio::piped()).stderr(Stdio::piped());
        for (key, value) in &spec.envs {
            command.env(key, value);
        }

        let mut child = command
            .spawn()
            .with_context(|| format!("failed to spawn runtime [{program}]"))?;
        let pid = child.id().context("runtime pid unavailable")?;
        let pid = i32::try_from(pid).context("runtime pid out of range")?;
        info!(pid, command = %program, "runtime spawned");

        let logs = RuntimeLogs::start(&mut child);

        let handle = RuntimeHandle::new();
        let waiter = {
            let handle = handle.clone();
            let allowed = spec.allowed_exit_codes;
            ChildTask::spawn(async move {
                match child.wait().await {
                    Ok(status) => handle.record_exit(status.code(), allowed),
                    Err(error) => {
                        warn!(%error, "failed to wait on runtime");
                        handle.record_exit(None, allowed);
                    }
                }
            })
        };

        Ok((
            Runtime {
                pid,
                allowed_exit_codes: spec.allowed_exit_codes,
                handle,
                _waiter: waiter,
            },
            logs,
        ))
    }

    pub fn handle(&self) -> RuntimeHandle {
        self.handle.clone()
    }

    pub fn state(&self) -> RuntimeState {
        self.handle.state()
    }

    pub fn is_exited(&self) -> bool {
        self.handle.is_exited()
    }

    pub fn allowed_exit_codes(&self) -> &'static [i32] {
        self.allowed_exit_codes
    }

    /// Asks the runtime to stop (SIGINT), without waiting.
    pub fn stop(&self) {
        self.signal(nix::sys::signal::Signal::SIGINT);
    }

    fn kill(&self) {
        self.signal(nix::sys::signal::Signal::SIGKILL);
    }

    fn signal(&self, signal: nix::sys::signal::Signal) {
        if let Err(error) = nix::sys::signal::kill(nix::unistd::Pid::from_raw(self.pid), signal) {
            warn!(%error, pid = self.pid, %signal, "error when sending signal to runtime");
        }
    }

    /// Polls for the rendezvous socket until the runtime is reachable.
    ///
    /// There is no upper time bound; a caller racing this against the
    /// shutdown signal (or an orchestrator timeout) terminates the wait.
    pub async fn wait_until_started(&self, socket_path: &Utf8Path) -> anyhow::Result<()> {
        loop {
            if tokio::fs::metadata(socket_path).await.is_ok() {
                self.handle.mark_running();
                debug!("runtime started");
                return Ok(());
            }
            if self.is_exited() {
                warn!("runtime stopped unexpectedly");
                anyhow::bail!("runtime stopped unexpectedly before opening the rendezvous socket");
            }
            debug!("runtime bootstrapping yet...");
            tokio::time::sleep(BOOT_POLL_INTERVAL).await;
        }
    }

    /// Graceful stop: SIGINT, then SIGKILL once `timeout` elapses.
    /// Idempotent; a second call on an exited runtime returns immediately.
    pub async fn shutdown(&self, timeout: Duration) {
        if self.is_exited() {
            debug!("runtime already exited");
            return;
        }
        self.stop();
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.is_exited() {
                debug!("runtime stopped");
                return;
            }
            if tokio::time::Instant::now() >= deadline {
                debug!("runtime didn't stop in time, killing it");
                self.kill();
                return;
            }
            tokio::time::sleep(STOP_POLL_INTERVAL).await;
        }
    }
}
