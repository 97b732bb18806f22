use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use camino::Utf8PathBuf;
use model_proxy_task::ShutdownSignal;
use runtime_ipc::{Content, RequestManifest, ResponseManifest};
use serde::Deserialize;
use tokio_util::io::ReaderStream;

use crate::config::Conf;
use crate::convert::{self, HttpReply, fileio, media_type};
use crate::platform::{DownloadDescriptor, Downloader, RetryClient, RetryDelay};
use crate::transport;

const UPLOAD_TIMEOUT: Duration = Duration::from_secs(30);
const UPLOAD_ATTEMPTS: u32 = 3;
const UPLOAD_DELAY: Duration = Duration::from_secs(3);

/// The key batch inputs/outputs use to point at a datalake location.
const DATALAKE_KEY: &str = "$datalake:1";

/// File-info response for a datalake channel entry.
#[derive(Debug, Deserialize)]
pub(crate) struct DatalakeFile {
    download_url: String,
    #[serde(default)]
    content_type: String,
    #[serde(default)]
    metadata: Option<HashMap<String, serde_json::Value>>,
}

impl DownloadDescriptor for DatalakeFile {
    fn download_url(&self) -> &str {
        &self.download_url
    }

    fn content_type(&self) -> Option<&str> {
        Some(&self.content_type)
    }
}

/// The one-shot driver: materialize INPUT, one IPC round trip, upload the
/// result, report the exit status (0 ok, 1 failed).
pub fn drive(
    conf: Arc<Conf>,
    socket_path: Utf8PathBuf,
    mut shutdown_signal: ShutdownSignal,
) -> std::pin::Pin<Box<dyn std::future::Future<Output = anyhow::Result<i32>> + Send>> {
    Box::pin(async move {
        let manifest = from_input(&conf).await?;
        if manifest.contents.is_empty() {
            info!("input resource not specified");
        }
        let output_channel = from_output(&conf)?;
        if output_channel.is_none() {
            info!("output datalake channel not specified");
        }

        let content_paths: Vec<Utf8PathBuf> = manifest
            .contents
            .iter()
            .filter_map(|content| content.path.clone())
            .collect();

        let result = transport::oneshot_round_trip(&socket_path, &manifest, &conf, &mut shutdown_signal).await;
        for path in &content_paths {
            fileio::remove_file_logged(path).await;
        }

        let response = match result? {
            Some(response) => response,
            // cancelled by a signal; not an error, but not a success either
            None => return Ok(1),
        };

        Ok(handle_result(&conf, &response, output_channel.as_deref()).await)
    })
}

/// Builds the request manifest from the `INPUT` option.
pub async fn from_input(conf: &Conf) -> anyhow::Result<RequestManifest> {
    if conf.input.is_empty() {
        return Ok(RequestManifest::default());
    }

    let value: serde_json::Value = serde_json::from_str(&conf.input).context("failed to parse INPUT")?;
    let datalake_path = value
        .as_object()
        .and_then(|object| object.get(DATALAKE_KEY))
        .and_then(|value| value.as_str());

    match datalake_path {
        Some(path) => datalake_contents(conf, path).await,
        None => json_contents(conf).await,
    }
}

async fn json_contents(conf: &Conf) -> anyhow::Result<RequestManifest> {
    let ext = media_type::ext_for(Some("application/json"));
    let path = fileio::to_file_from_bytes(conf.input.as_bytes(), ext, &conf.requested_data_dir)
        .await
        .context("failed to create temporary json file")?;

    Ok(RequestManifest {
        method: "POST".to_owned(),
        content_type: "application/json".to_owned(),
        contents: vec![Content::from_path(path)],
        ..Default::default()
    })
}

async fn datalake_contents(conf: &Conf, datalake_path: &str) -> anyhow::Result<RequestManifest> {
    fileio::ensure_private_dir(&conf.requested_data_dir)
        .await
        .context("failed to create requested-data directory")?;
    let dest = conf.requested_data_dir.join("uploaded_file");

    let downloader = Downloader::new(&conf.api_url, conf.auth_info()).context("failed to make downloader")?;
    let descriptor: DatalakeFile = downloader
        .download(&format!("channels/{datalake_path}"), &dest)
        .await
        .context("failed to download file from datalake")?;

    let content_type = match descriptor.content_type() {
        Some(content_type) if !content_type.is_empty() => content_type.to_owned(),
        _ => "application/octet-stream".to_owned(),
    };

    Ok(RequestManifest {
        method: "POST".to_owned(),
        content_type,
        contents: vec![Content {
            content_type: None,
            path: Some(dest),
            file_name: None,
            form_name: None,
            metadata: descriptor.metadata,
        }],
        ..Default::default()
    })
}

/// Extracts the destination channel id from the `OUTPUT` option.
pub fn from_output(conf: &Conf) -> anyhow::Result<Option<String>> {
    if conf.output.is_empty() {
        return Ok(None);
    }
    let value: serde_json::Value = serde_json::from_str(&conf.output).context("failed to parse OUTPUT")?;
    Ok(value
        .as_object()
        .and_then(|object| object.get(DATALAKE_KEY))
        .and_then(|value| value.as_str())
        .map(str::to_owned))
}

async fn handle_result(conf: &Conf, response: &ResponseManifest, channel: Option<&str>) -> i32 {
    let reply = match convert::from_response(response, conf).await {
        Ok(reply) => reply,
        Err(error) => {
            warn!(%error, "failed to convert runtime response");
            return 1;
        }
    };

    if let Some(channel) = channel {
        if response.path.is_none() {
            // OUTPUT is configured but there is nothing to upload
            warn!("runtime didn't return body.");
        } else if let Err(error) = upload_result(conf, channel, &reply, response.content_type.as_deref()).await {
            error!(error = format!("{error:#}"), "failed to upload result");
            fileio::remove_file_logged(&reply.body_path).await;
            return 1;
        }
    }

    fileio::remove_file_logged(&reply.body_path).await;

    if reply.status > 299 {
        warn!(status = reply.status, "runtime returned error status");
        return 1;
    }
    0
}

async fn upload_result(
    conf: &Conf,
    channel: &str,
    reply: &HttpReply,
    content_type: Option<&str>,
) -> anyhow::Result<()> {
    let client = RetryClient::new(
        &conf.api_url,
        UPLOAD_TIMEOUT,
        UPLOAD_ATTEMPTS,
        RetryDelay::Fixed(UPLOAD_DELAY),
        conf.auth_info(),
    )?;
    let url = client.build_url(
        &format!("channels/{channel}/upload"),
        &[("conflict_target", "filename")],
    );
    let file_name = build_file_name(&conf.run_id, content_type);

    let response = client
        .execute_with(async || {
            let file = tokio::fs::File::open(&reply.body_path)
                .await
                .context("failed to open result body file")?;
            let mut builder = client
                .request(reqwest::Method::POST, url.clone())
                .body(reqwest::Body::wrap_stream(ReaderStream::new(file)));

            for (key, value) in &reply.headers {
                let lower = key.to_ascii_lowercase();
                if lower == "content-type" || lower.starts_with("x-abeja-meta-") {
                    builder = builder.header(key.as_str(), value.as_str());
                }
            }
            builder = builder.header("x-abeja-meta-filename", file_name.as_str());
            Ok(builder)
        })
        .await?;

    let status = response.status();
    if status.as_u16() >= 400 {
        let body = response.text().await.unwrap_or_default();
        anyhow::bail!("response from Datalake was error with StatusCode: {status}, body: {body}");
    }
    Ok(())
}

fn build_file_name(run_id: &str, content_type: Option<&str>) -> String {
    let ext = match content_type {
        Some(content_type) if !content_type.is_empty() => media_type::ext_for(Some(content_type)),
        _ => "",
    };
    format!("{run_id}_0{ext}")
}
