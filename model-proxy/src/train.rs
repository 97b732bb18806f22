use anyhow::Context as _;
use camino::Utf8PathBuf;

use crate::config::Conf;
use crate::convert::fileio;
use crate::platform::Downloader;
use crate::preprocess::{self, SourceArchive};
use crate::runtime::{self, Runtime, RuntimeState};
use crate::service::{LOG_FLUSH_TIMEOUT, RUNTIME_SHUTDOWN_TIMEOUT, Signals};

/// The bootstrap driving a user's training entry point; shipped inside
/// the proxy binary and materialized to disk at launch.
const PY36_BOOTSTRAP: &str = include_str!("../assets/py36.py");

fn bootstrap_for(runtime_key: &str) -> anyhow::Result<(&'static str, &'static str)> {
    match runtime_key {
        "python36" => Ok(("py36.py", PY36_BOOTSTRAP)),
        other => anyhow::bail!("unsupported runtime language: {other}"),
    }
}

/// Training mode: run the user's training code to completion, artifacts
/// land in the training-result directory. No IPC round trip.
pub async fn run(conf: Conf) -> anyhow::Result<()> {
    let (bootstrap_name, bootstrap_source) = bootstrap_for(&conf.runtime)?;

    let working_dir = conf.working_dir().context("failed to get working directory path")?;
    std::env::set_current_dir(working_dir.as_std_path())
        .with_context(|| format!("failed to move to working directory {working_dir}"))?;

    let bootstrap_path = write_bootstrap(bootstrap_name, bootstrap_source).await?;

    let training_result_dir = conf.training_result_dir_path().context("failed to get path for training-result")?;
    tokio::fs::create_dir_all(training_result_dir.as_std_path())
        .await
        .context("failed to create directory for training-result")?;

    let status = run_training(&conf, &bootstrap_path, &training_result_dir).await;

    fileio::remove_file_logged(&bootstrap_path).await;

    match status {
        Ok(0) => Ok(()),
        Ok(_) => anyhow::bail!("failed to training-process"),
        Err(error) => Err(error),
    }
}

async fn run_training(
    conf: &Conf,
    bootstrap_path: &Utf8PathBuf,
    training_result_dir: &Utf8PathBuf,
) -> anyhow::Result<i32> {
    let mut signals = Signals::new()?;

    let spec = runtime::train_spec(conf, bootstrap_path, training_result_dir)?;
    let (runtime, logs) = Runtime::spawn(spec).context("failed to start runtime")?;
    // training has no rendezvous; the process counts as live once spawned
    runtime.handle().mark_running();

    let status = tokio::select! {
        sig = signals.recv() => {
            info!(signal = sig, "signal received");
            runtime.shutdown(RUNTIME_SHUTDOWN_TIMEOUT).await;
            warn!("training-process finished with signal");
            1
        }
        _ = runtime.handle().exited() => {
            if runtime.state() == RuntimeState::ExitedSuccess { 0 } else { 1 }
        }
    };

    logs.flush(LOG_FLUSH_TIMEOUT).await;
    Ok(status)
}

async fn write_bootstrap(name: &str, source: &str) -> anyhow::Result<Utf8PathBuf> {
    let tmp = Utf8PathBuf::from_path_buf(std::env::temp_dir())
        .map_err(|path| anyhow::anyhow!("non UTF-8 temp dir: {path:?}"))?;
    let path = tmp.join(format!("{}-{name}", uuid::Uuid::new_v4()));
    tokio::fs::write(path.as_std_path(), source)
        .await
        .context("failed to write runtime base")?;
    Ok(path)
}

/// `train download`: fetch the training code for the configured
/// definition version into the working directory.
pub async fn download(conf: Conf) -> anyhow::Result<()> {
    let downloader = Downloader::new(&conf.api_url, conf.auth_info()).context("failed to make downloader")?;
    let req_path = format!(
        "organizations/{}/training/definitions/{}/versions/{}/source",
        conf.organization_id, conf.training_job_definition_name, conf.training_job_definition_version
    );
    let working_dir = conf.working_dir()?;
    preprocess::fetch_and_unarchive::<SourceArchive>(&downloader, &req_path, &working_dir)
        .await
        .context("failed to download training-code")
}
