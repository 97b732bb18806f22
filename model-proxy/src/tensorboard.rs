use std::time::Duration;

use anyhow::Context as _;
use backoff::ExponentialBackoff;
use backoff::backoff::Backoff as _;
use camino::Utf8PathBuf;

use crate::archive;
use crate::config::Conf;
use crate::convert::fileio;
use crate::platform::Downloader;
use crate::preprocess::TrainingJobArtifact;

const RETRY_COUNT: u32 = 5;

/// Tensorboard mode: pull each training job's result archive into the
/// shared mount so tensorboard can index it.
pub async fn run(conf: Conf) -> anyhow::Result<()> {
    let downloader = Downloader::new(&conf.api_url, conf.auth_info()).context("failed to make downloader")?;

    for job_id in dedup(&conf.training_job_ids) {
        fetch_job_with_retry(&conf, &downloader, &job_id).await?;
    }
    info!(training_job_ids = %conf.training_job_ids, "succeeded to ready for training jobs");
    Ok(())
}

async fn fetch_job_with_retry(conf: &Conf, downloader: &Downloader, job_id: &str) -> anyhow::Result<()> {
    let mut backoff = ExponentialBackoff::default();
    let mut attempt = 0;
    loop {
        match fetch_job(conf, downloader, job_id).await {
            Ok(()) => return Ok(()),
            Err(error) if attempt < RETRY_COUNT => {
                attempt += 1;
                warn!(error = format!("{error:#}"), attempt, "retrying due to error");
                tokio::time::sleep(backoff.next_backoff().unwrap_or(Duration::from_secs(60))).await;
            }
            Err(error) => return Err(error),
        }
    }
}

async fn fetch_job(conf: &Conf, downloader: &Downloader, job_id: &str) -> anyhow::Result<()> {
    info!(job_id, "start download and unarchive training job result");

    let archive_path = archive::scratch_file("tensorboard")?;
    let req_path = format!(
        "organizations/{}/training/definitions/{}/jobs/{}/result",
        conf.organization_id, conf.training_job_definition_name, job_id
    );

    let result = async {
        downloader
            .download::<TrainingJobArtifact>(&req_path, &archive_path)
            .await
            .context("failed to download archive")?;

        let dest = Utf8PathBuf::from(&conf.mount_target_dir)
            .join("tensorboards")
            .join(&conf.tensorboard_id)
            .join("training_jobs")
            .join(job_id);

        // wipe any previous copy; it may be defective
        if tokio::fs::metadata(&dest).await.is_ok() {
            tokio::fs::remove_dir_all(&dest)
                .await
                .with_context(|| format!("failed to delete existing directory for training-result: {dest}"))?;
        }
        tokio::fs::create_dir_all(&dest)
            .await
            .with_context(|| format!("failed to make directory for training-result: {dest}"))?;

        archive::unarchive(&archive_path, &dest)
            .await
            .context("failed to unarchive training job result")
    }
    .await;

    fileio::remove_file_logged(&archive_path).await;
    if result.is_ok() {
        info!(job_id, "succeeded to download and unarchive training job result");
    }
    result
}

/// Order-preserving dedup of the comma-separated job id list.
fn dedup(ids: &str) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    let mut out = Vec::new();
    for id in ids.split(',') {
        let id = id.trim();
        if !id.is_empty() && seen.insert(id) {
            out.push(id.to_owned());
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dedup_preserves_first_occurrence_order() {
        let ids = dedup("job-2,job-1,job-2,job-3,job-1");
        assert_eq!(ids, ["job-2", "job-1", "job-3"]);
    }

    #[test]
    fn dedup_drops_empty_entries() {
        let ids = dedup(",job-1,,");
        assert_eq!(ids, ["job-1"]);
    }
}
