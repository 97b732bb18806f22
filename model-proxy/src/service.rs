use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use camino::Utf8Path;
use futures::future::select_all;
use model_proxy_task::{ShutdownHandle, spawn_task};
use tokio::signal::unix::{Signal, SignalKind, signal};
use tokio::sync::mpsc;

use crate::config::Conf;
use crate::listener::{HTTP_SHUTDOWN_TIMEOUT, HealthListener, ServiceListener};
use crate::runtime::{self, Runtime, RuntimeState};
use crate::transport::IpcTransportTask;
use crate::{ProxyState, REQUEST_QUEUE_CAPACITY, preprocess};

pub(crate) const RUNTIME_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(25);
pub(crate) const LOG_FLUSH_TIMEOUT: Duration = Duration::from_secs(3);
const CONTROLLER_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// SIGINT/SIGTERM, whichever comes first.
pub(crate) struct Signals {
    sigint: Signal,
    sigterm: Signal,
}

impl Signals {
    pub(crate) fn new() -> anyhow::Result<Self> {
        Ok(Signals {
            sigint: signal(SignalKind::interrupt()).context("failed to register SIGINT handler")?,
            sigterm: signal(SignalKind::terminate()).context("failed to register SIGTERM handler")?,
        })
    }

    pub(crate) async fn recv(&mut self) -> &'static str {
        tokio::select! {
            _ = self.sigint.recv() => "SIGINT",
            _ = self.sigterm.recv() => "SIGTERM",
        }
    }
}

/// Service mode: download (optionally), boot the runtime, serve inference
/// until a signal or a failure, then drain in order.
pub async fn run(conf: Conf, exec_download: bool) -> anyhow::Result<()> {
    let conf = Arc::new(conf);

    let working_dir = conf.working_dir().context("failed to get working directory path")?;
    std::env::set_current_dir(working_dir.as_std_path())
        .with_context(|| format!("failed to move to working directory {working_dir}"))?;

    let (socket_dir, socket_path) = runtime::make_rendezvous_path()
        .context("failed to build path to socket file for communication to runtime")?;

    let status = run_inner(&conf, exec_download, &socket_path).await;

    remove_dir_logged(&socket_dir).await;
    remove_dir_logged(&conf.requested_data_dir).await;

    match status {
        Ok(0) => Ok(()),
        Ok(_) => anyhow::bail!("failed to finalize"),
        Err(error) => Err(error),
    }
}

async fn run_inner(conf: &Arc<Conf>, exec_download: bool, socket_path: &Utf8Path) -> anyhow::Result<i32> {
    let mut signals = Signals::new()?;

    // model/code download must finish before the health endpoint goes live
    if exec_download {
        preprocess::prepare(conf).await?;
    }

    let training_result_dir = conf.training_result_dir_path().context("failed to get path for training-result")?;
    let spec = runtime::service_spec(conf, socket_path, &training_result_dir)?;
    let (runtime, logs) = Runtime::spawn(spec).context("failed to start runtime")?;

    let status = supervise(conf, &runtime, socket_path, &mut signals).await;

    logs.flush(LOG_FLUSH_TIMEOUT).await;
    Ok(status)
}

/// The shutdown controller. Returns the process exit status.
async fn supervise(conf: &Arc<Conf>, runtime: &Runtime, socket_path: &Utf8Path, signals: &mut Signals) -> i32 {
    // boot wait: the rendezvous socket appears, or the child dies first
    tokio::select! {
        result = runtime.wait_until_started(socket_path) => {
            if let Err(error) = result {
                error!(error = format!("{error:#}"), "failed to boot runtime");
                // the child is already gone; nothing to stop
                return 1;
            }
        }
        sig = signals.recv() => {
            info!(signal = sig, "signal received during boot");
            runtime.shutdown(RUNTIME_SHUTDOWN_TIMEOUT).await;
            return 1;
        }
    }

    let (request_tx, request_rx) = mpsc::channel(REQUEST_QUEUE_CAPACITY);
    let state = ProxyState {
        conf: Arc::clone(conf),
        runtime: runtime.handle(),
        requests: request_tx.clone(),
    };

    let listeners = ServiceListener::init_and_bind(conf.listen_addr(), state.clone())
        .and_then(|service| HealthListener::init_and_bind(conf.health_check_addr(), state).map(|health| (service, health)));
    let (service_listener, health_listener) = match listeners {
        Ok(listeners) => listeners,
        Err(error) => {
            error!(error = format!("{error:#}"), "failed to bootstrap");
            runtime.shutdown(RUNTIME_SHUTDOWN_TIMEOUT).await;
            return 1;
        }
    };

    let (shutdown_handle, shutdown_signal) = ShutdownHandle::new();
    let handles = vec![
        spawn_task(health_listener, shutdown_signal.clone()),
        spawn_task(service_listener, shutdown_signal.clone()),
        spawn_task(
            IpcTransportTask {
                socket_path: socket_path.to_owned(),
                requests: request_rx,
                conf: Arc::clone(conf),
            },
            shutdown_signal,
        ),
    ];

    let mut remaining = Some(select_all(handles.into_iter().map(|handle| Box::pin(handle.join()))));
    let mut tick = tokio::time::interval(CONTROLLER_POLL_INTERVAL);

    enum Step<F> {
        Signal(&'static str),
        TaskDone {
            result: Result<anyhow::Result<()>, tokio::task::JoinError>,
            rest: Vec<F>,
        },
        Tick,
    }

    let mut status = 0;
    let mut skip_runtime_stop = false;
    loop {
        let step = {
            let Some(join_all) = remaining.as_mut() else {
                // nothing left serving without a shutdown request
                warn!("all tasks terminated unexpectedly");
                status = 1;
                break;
            };
            tokio::select! {
                sig = signals.recv() => Step::Signal(sig),
                (result, _index, rest) = join_all => Step::TaskDone { result, rest },
                _ = tick.tick() => Step::Tick,
            }
        };

        match step {
            Step::Signal(sig) => {
                info!(signal = sig, "signal received");
                break;
            }
            Step::TaskDone { result, rest } => {
                remaining = if rest.is_empty() { None } else { Some(select_all(rest)) };
                match result {
                    Ok(Ok(())) => trace!("a task terminated gracefully"),
                    Ok(Err(error)) => {
                        error!(error = format!("{error:#}"), "a task failed");
                        status = 1;
                        break;
                    }
                    Err(error) => {
                        error!(%error, "something went very wrong with a task");
                        status = 1;
                        break;
                    }
                }
            }
            Step::Tick => {
                if runtime.is_exited() {
                    debug!("runtime exited on its own");
                    skip_runtime_stop = true;
                    break;
                }
            }
        }
    }

    // Graceful sequence: stop accepting and drain the HTTP side while the
    // child winds down, then wait for the transport loop to finish. Its
    // completion is the acknowledgement that nothing is in flight anymore.
    shutdown_handle.signal();
    drop(request_tx);

    let drain = async {
        let Some(mut join_all) = remaining.take() else {
            return;
        };
        loop {
            let (result, _index, rest) = join_all.await;
            match result {
                Ok(Ok(())) => trace!("a task drained"),
                Ok(Err(error)) => warn!(error = format!("{error:#}"), "a task failed while draining"),
                Err(error) => warn!(%error, "a task panicked while draining"),
            }
            if rest.is_empty() {
                break;
            }
            join_all = select_all(rest);
        }
    };
    let stop_runtime = async {
        if !skip_runtime_stop {
            runtime.shutdown(RUNTIME_SHUTDOWN_TIMEOUT).await;
        }
    };
    let (drained, ()) = tokio::join!(tokio::time::timeout(HTTP_SHUTDOWN_TIMEOUT, drain), stop_runtime);
    if drained.is_err() {
        warn!("tasks did not drain within the shutdown grace period");
    }

    // give the exit watcher a beat to record the status after a SIGKILL
    let _ = tokio::time::timeout(Duration::from_secs(2), runtime.handle().exited()).await;

    debug!("runtime finished");
    if status == 0 && runtime.state() != RuntimeState::ExitedSuccess {
        status = 1;
    }
    status
}

pub(crate) async fn remove_dir_logged(dir: &Utf8Path) {
    match tokio::fs::remove_dir_all(dir).await {
        Ok(()) => {}
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => {}
        Err(error) => warn!(%error, %dir, "failed to remove directory"),
    }
}
