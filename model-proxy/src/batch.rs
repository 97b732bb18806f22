use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use camino::Utf8Path;
use model_proxy_task::{ChildTask, ShutdownHandle};

use crate::config::Conf;
use crate::runtime::{self, Runtime, RuntimeState};
use crate::service::{LOG_FLUSH_TIMEOUT, RUNTIME_SHUTDOWN_TIMEOUT, Signals, remove_dir_logged};
use crate::{oneshot, preprocess};

/// Batch mode: boot the runtime, run exactly one request through it, and
/// exit with the outcome.
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
        Ok(_) => anyhow::bail!("failed to batch-process"),
        Err(error) => Err(error),
    }
}

async fn run_inner(conf: &Arc<Conf>, exec_download: bool, socket_path: &Utf8Path) -> anyhow::Result<i32> {
    let mut signals = Signals::new()?;

    if exec_download {
        preprocess::prepare(conf).await?;
    }

    let training_result_dir = conf.training_result_dir_path().context("failed to get path for training-result")?;
    let spec = runtime::oneshot_spec(conf, socket_path, &training_result_dir)?;
    let (runtime, logs) = Runtime::spawn(spec).context("failed to start runtime")?;

    let status = supervise(conf, &runtime, socket_path, &mut signals).await;

    logs.flush(LOG_FLUSH_TIMEOUT).await;
    Ok(status)
}

async fn supervise(conf: &Arc<Conf>, runtime: &Runtime, socket_path: &Utf8Path, signals: &mut Signals) -> i32 {
    tokio::select! {
        result = runtime.wait_until_started(socket_path) => {
            if let Err(error) = result {
                error!(error = format!("{error:#}"), "failed to boot runtime");
                return 1;
            }
        }
        sig = signals.recv() => {
            info!(signal = sig, "signal received during boot");
            runtime.shutdown(RUNTIME_SHUTDOWN_TIMEOUT).await;
            return 1;
        }
    }

    let (shutdown_handle, shutdown_signal) = ShutdownHandle::new();
    let driver = ChildTask::spawn(oneshot::drive(
        Arc::clone(conf),
        socket_path.to_owned(),
        shutdown_signal,
    ));
    let mut driver_join = Box::pin(driver.join());

    let mut status = tokio::select! {
        sig = signals.recv() => {
            info!(signal = sig, "signal received");
            shutdown_handle.signal();
            // the driver observes the signal and abandons its wait
            let _ = (&mut driver_join).await;
            1
        }
        result = &mut driver_join => match result {
            Ok(Ok(status)) => status,
            Ok(Err(error)) => {
                error!(error = format!("{error:#}"), "batch run failed");
                1
            }
            Err(error) => {
                error!(%error, "driver task failed");
                1
            }
        }
    };

    runtime.shutdown(RUNTIME_SHUTDOWN_TIMEOUT).await;
    let _ = tokio::time::timeout(Duration::from_secs(2), runtime.handle().exited()).await;

    debug!("runtime finished");
    if status == 0 && runtime.state() != RuntimeState::ExitedSuccess {
        status = 1;
    }
    status
}
