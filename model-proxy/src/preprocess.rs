use anyhow::Context as _;
use camino::Utf8Path;
use serde::Deserialize;

use crate::archive;
use crate::config::Conf;
use crate::convert::fileio;
use crate::platform::{DownloadDescriptor, Downloader};

/// `source` endpoints answer with a pre-signed `download_uri`.
#[derive(Debug, Deserialize)]
pub(crate) struct SourceArchive {
    download_uri: String,
}

impl DownloadDescriptor for SourceArchive {
    fn download_url(&self) -> &str {
        &self.download_uri
    }
}

/// Training-job `result` endpoints nest the archive URL under
/// `artifacts.complete.uri`.
#[derive(Debug, Deserialize)]
pub(crate) struct TrainingJobArtifact {
    artifacts: Artifacts,
}

#[derive(Debug, Deserialize)]
struct Artifacts {
    complete: CompleteArtifact,
}

#[derive(Debug, Deserialize)]
struct CompleteArtifact {
    uri: String,
}

impl DownloadDescriptor for TrainingJobArtifact {
    fn download_url(&self) -> &str {
        &self.artifacts.complete.uri
    }
}

/// Fetches the user code (and, when configured, the trained model) before
/// the runtime boots. The health endpoint must not go live earlier.
pub async fn prepare(conf: &Conf) -> anyhow::Result<()> {
    check_required_params(conf)?;

    let downloader = Downloader::new(&conf.api_url, conf.auth_info()).context("failed to make downloader")?;
    let working_dir = conf.working_dir()?;
    let training_result_dir = conf.training_result_dir_path()?;

    if conf.deployment_code_download.is_empty() {
        let req_path = format!(
            "organizations/{}/models/{}/versions/{}/source",
            conf.organization_id, conf.model_id, conf.model_version_id
        );
        fetch_and_unarchive::<SourceArchive>(&downloader, &req_path, &working_dir)
            .await
            .context("failed to prepare model source")?;
    } else {
        fetch_and_unarchive::<SourceArchive>(&downloader, &conf.deployment_code_download, &working_dir)
            .await
            .context("failed to prepare deployment code")?;
    }

    let has_job_name = !conf.training_job_definition_name.is_empty();
    let has_job_id = !conf.training_job_id.is_empty();
    if has_job_name != has_job_id {
        warn!("TRAINING_JOB_ID and TRAINING_JOB_DEFINITION_NAME must be set.");
    }

    if !conf.training_model_download.is_empty() {
        fetch_and_unarchive::<SourceArchive>(&downloader, &conf.training_model_download, &training_result_dir)
            .await
            .context("failed to prepare trained model")?;
    } else if has_job_name && has_job_id {
        let req_path = format!(
            "organizations/{}/training/definitions/{}/jobs/{}/result",
            conf.organization_id, conf.training_job_definition_name, conf.training_job_id
        );
        fetch_and_unarchive::<TrainingJobArtifact>(&downloader, &req_path, &training_result_dir)
            .await
            .context("failed to prepare training job result")?;
    }

    Ok(())
}

fn check_required_params(conf: &Conf) -> anyhow::Result<()> {
    let auth = conf.auth_info();
    let required = [
        ("ABEJA_API_URL", conf.api_url.as_str()),
        ("ABEJA_ORGANIZATION_ID", conf.organization_id.as_str()),
        ("ABEJA_MODEL_ID", conf.model_id.as_str()),
        ("ABEJA_MODEL_VERSION_ID", conf.model_version_id.as_str()),
        ("PLATFORM_AUTH_TOKEN", auth.auth_token.as_str()),
    ];
    let missing: Vec<&str> = required
        .iter()
        .filter(|(_, value)| value.is_empty())
        .map(|(key, _)| *key)
        .collect();
    if !missing.is_empty() {
        anyhow::bail!("required parameter(s) missing: {}", missing.join(", "));
    }
    Ok(())
}

/// Downloads the archive behind `req_path` and unpacks it into `dest`.
pub(crate) async fn fetch_and_unarchive<T: DownloadDescriptor>(
    downloader: &Downloader,
    req_path: &str,
    dest: &Utf8Path,
) -> anyhow::Result<()> {
    let scratch = archive::scratch_file("model")?;
    let result = async {
        downloader
            .download::<T>(req_path, &scratch)
            .await
            .context("failed to download model")?;

        if tokio::fs::metadata(dest).await.is_err() {
            tokio::fs::create_dir_all(dest)
                .await
                .with_context(|| format!("failed to make directory {dest}"))?;
        }

        archive::unarchive(&scratch, dest).await
    }
    .await;

    fileio::remove_file_logged(&scratch).await;
    result
}
