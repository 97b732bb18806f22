use std::sync::Arc;

use anyhow::Context as _;
use async_trait::async_trait;
use camino::{Utf8Path, Utf8PathBuf};
use model_proxy_task::{ShutdownSignal, Task};
use percent_encoding::{AsciiSet, CONTROLS, utf8_percent_encode};
use runtime_ipc::{RequestManifest, ResponseManifest, read_message, write_message};
use tokio::net::UnixStream;
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{mpsc, oneshot};
use tracing::Instrument as _;

use crate::callback::ArmsCallback;
use crate::config::Conf;
use crate::convert::fileio;

/// One inference request on its way to the runtime.
///
/// Synchronous requests carry a reply slot; async requests carry their
/// callback identity inside the manifest instead.
pub struct InvokeMessage {
    pub manifest: RequestManifest,
    pub request_id: Option<String>,
    pub requester_id: Option<String>,
    pub reply: Option<oneshot::Sender<ResponseManifest>>,
}

/// Exclusive owner of the rendezvous-socket connection.
///
/// Strictly one IPC call is in flight at a time: request i's response is
/// read before request i+1 is written. The runtime is never restarted; a
/// broken connection fails the whole proxy process.
pub struct IpcTransportTask {
    pub socket_path: Utf8PathBuf,
    pub requests: mpsc::Receiver<InvokeMessage>,
    pub conf: Arc<Conf>,
}

#[async_trait]
impl Task for IpcTransportTask {
    type Output = anyhow::Result<()>;

    const NAME: &'static str = "ipc transport";

    async fn run(mut self, mut shutdown_signal: ShutdownSignal) -> Self::Output {
        let stream = UnixStream::connect(self.socket_path.as_std_path())
            .await
            .with_context(|| format!("failed to dial runtime socket at {}", self.socket_path))?;
        let (mut reader, mut writer) = stream.into_split();
        debug!(socket = %self.socket_path, "connected to runtime");

        enum Next {
            Msg(Option<InvokeMessage>),
            ShuttingDown,
        }

        loop {
            let next = tokio::select! {
                msg = self.requests.recv() => Next::Msg(msg),
                _ = shutdown_signal.wait() => Next::ShuttingDown,
            };

            let msg = match next {
                Next::Msg(Some(msg)) => msg,
                Next::Msg(None) => {
                    debug!("request channel closed");
                    break;
                }
                Next::ShuttingDown => {
                    debug!("shutdown requested while idle");
                    break;
                }
            };

            let span = info_span!(
                "invoke",
                request_id = msg.request_id.as_deref().unwrap_or(""),
                requester_id = msg.requester_id.as_deref().unwrap_or(""),
            );
            let async_content_paths: Vec<Utf8PathBuf> = if msg.manifest.is_async() {
                msg.manifest
                    .contents
                    .iter()
                    .filter_map(|content| content.path.clone())
                    .collect()
            } else {
                Vec::new()
            };

            let flow = round_trip(&self.conf, msg, &mut reader, &mut writer, &mut shutdown_signal)
                .instrument(span)
                .await;

            // sync requests are cleaned up by the HTTP handler that owns them
            for path in &async_content_paths {
                fileio::remove_file_logged(path).await;
            }

            if matches!(flow, Flow::Shutdown) {
                break;
            }
        }

        debug!("finish transporting");
        Ok(())
    }
}

enum Flow {
    Continue,
    Shutdown,
}

async fn round_trip(
    conf: &Conf,
    msg: InvokeMessage,
    reader: &mut OwnedReadHalf,
    writer: &mut OwnedWriteHalf,
    shutdown_signal: &mut ShutdownSignal,
) -> Flow {
    let InvokeMessage { manifest, reply, .. } = msg;

    let body = match serde_json::to_vec(&manifest) {
        Ok(body) => body,
        Err(error) => {
            error!(%error, "json encode error");
            respond_internal_error(conf, &manifest, reply, "encoding from request").await;
            return Flow::Continue;
        }
    };

    if let Err(error) = write_message(writer, &body).await {
        error!(%error, "write IPC request error");
        respond_internal_error(conf, &manifest, reply, "communication with runtime").await;
        return Flow::Continue;
    }

    enum ReadOutcome {
        Read(Result<Vec<u8>, runtime_ipc::IpcError>),
        ShuttingDown,
    }

    let outcome = tokio::select! {
        result = read_message(reader) => ReadOutcome::Read(result),
        _ = shutdown_signal.wait() => ReadOutcome::ShuttingDown,
    };

    let raw = match outcome {
        ReadOutcome::Read(Ok(raw)) => raw,
        ReadOutcome::Read(Err(error)) => {
            error!(%error, "read IPC response error");
            respond_internal_error(conf, &manifest, reply, "communication with runtime").await;
            return Flow::Continue;
        }
        ReadOutcome::ShuttingDown => {
            respond_internal_error(conf, &manifest, reply, "received signal").await;
            return Flow::Shutdown;
        }
    };

    match response_from_wire(&raw, conf) {
        Ok(response) => deliver(conf, &manifest, reply, response).await,
        Err(error) => {
            error!(%error, "read IPC response body error");
            respond_internal_error(conf, &manifest, reply, "communication with runtime").await;
        }
    }
    Flow::Continue
}

async fn deliver(
    conf: &Conf,
    manifest: &RequestManifest,
    reply: Option<oneshot::Sender<ResponseManifest>>,
    response: ResponseManifest,
) {
    if let (Some(request_id), Some(token)) = (&manifest.async_request_id, &manifest.async_token) {
        debug!("send async response to GW...");
        match ArmsCallback::new(conf, request_id, token) {
            Ok(callback) => callback.deliver(&response, conf).await,
            Err(error) => error!(%error, "unexpected error occurred in sending async response"),
        }
    } else {
        debug!("send sync response to client...");
        if let Some(tx) = reply
            && tx.send(response).is_err()
        {
            debug!("sync requester went away before the response was ready");
        }
    }
}

async fn respond_internal_error(
    conf: &Conf,
    manifest: &RequestManifest,
    reply: Option<oneshot::Sender<ResponseManifest>>,
    reason: &str,
) {
    if let (Some(request_id), Some(token)) = (&manifest.async_request_id, &manifest.async_token) {
        match ArmsCallback::new(conf, request_id, token) {
            Ok(callback) => callback.send_error(reason).await,
            Err(error) => error!(%error, "unexpected error occurred in sending error async response"),
        }
    } else if let Some(tx) = reply {
        let _ = tx.send(internal_error_manifest(reason));
    }
}

pub(crate) fn internal_error_manifest(reason: &str) -> ResponseManifest {
    ResponseManifest {
        content_type: Some("application/json".to_owned()),
        error_message: Some(format!("Internal Server Error: unexpected error of {reason}")),
        status_code: Some(500),
        ..Default::default()
    }
}

/// Decodes the runtime's reply and stamps the configured platform
/// identity headers into its metadata.
pub(crate) fn response_from_wire(raw: &[u8], conf: &Conf) -> anyhow::Result<ResponseManifest> {
    let mut response: ResponseManifest = serde_json::from_slice(raw).context("read IPC response body error")?;

    let metadata = response.metadata.get_or_insert_with(Default::default);
    if !conf.model_id.is_empty() {
        metadata.insert("X-Abeja-Model-Id".to_owned(), conf.model_id.clone());
    }
    if !conf.model_version.is_empty() {
        metadata.insert("X-Abeja-Model-Version".to_owned(), path_escape(&conf.model_version));
    }
    if !conf.deployment_id.is_empty() {
        metadata.insert("X-Abeja-Deployment-Id".to_owned(), conf.deployment_id.clone());
    }
    if !conf.service_id.is_empty() {
        metadata.insert("X-Abeja-Service-Id".to_owned(), conf.service_id.clone());
    }
    Ok(response)
}

/// Escaping for a value embedded as a single URL path segment.
const PATH_SEGMENT: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'<')
    .add(b'>')
    .add(b'?')
    .add(b'`')
    .add(b'{')
    .add(b'}')
    .add(b'/')
    .add(b'%')
    .add(b'\\');

fn path_escape(value: &str) -> String {
    utf8_percent_encode(value, PATH_SEGMENT).to_string()
}

/// The one-shot shape: exactly one request and one response over a fresh
/// connection. Returns `None` when a signal cancels the wait.
pub async fn oneshot_round_trip(
    socket_path: &Utf8Path,
    manifest: &RequestManifest,
    conf: &Conf,
    shutdown_signal: &mut ShutdownSignal,
) -> anyhow::Result<Option<ResponseManifest>> {
    let stream = UnixStream::connect(socket_path.as_std_path())
        .await
        .with_context(|| format!("failed to dial runtime socket at {socket_path}"))?;
    let (mut reader, mut writer) = stream.into_split();

    let body = serde_json::to_vec(manifest).context("json encode error")?;
    write_message(&mut writer, &body).await.context("write IPC request error")?;

    enum Outcome {
        Read(Result<Vec<u8>, runtime_ipc::IpcError>),
        ShuttingDown,
    }

    let outcome = tokio::select! {
        result = read_message(&mut reader) => Outcome::Read(result),
        _ = shutdown_signal.wait() => Outcome::ShuttingDown,
    };

    let raw = match outcome {
        Outcome::Read(result) => result.context("read IPC response error")?,
        Outcome::ShuttingDown => {
            debug!("signal received");
            return Ok(None);
        }
    };

    Ok(Some(response_from_wire(&raw, conf)?))
}
