use std::time::Instant;

use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse as _, Response};
use camino::Utf8PathBuf;
use tokio::sync::oneshot;
use tokio_util::io::ReaderStream;
use tracing::Instrument as _;

use super::status_response;
use crate::convert::{self, HttpReply, fileio};
use crate::transport::InvokeMessage;
use crate::{ProxyState, log};

const HEADER_REQUEST_ID: &str = "x-abeja-request-id";
const HEADER_REQUESTER_ID: &str = "x-abeja-requester-id";
const HEADER_ASYNC_REQUEST_ID: &str = "x-abeja-arms-async-request-id";
const HEADER_ASYNC_REQUEST_TOKEN: &str = "x-abeja-arms-async-request-token";

/// The inference handler behind every non-health path.
pub(super) async fn invoke(State(state): State<ProxyState>, req: Request) -> Response {
    let started = Instant::now();
    let method = req.method().clone();
    let path = req.uri().path().to_owned();

    let request_id = header_string(req.headers(), HEADER_REQUEST_ID);
    let requester_id = header_string(req.headers(), HEADER_REQUESTER_ID);
    let span = info_span!(
        "request",
        request_id = request_id.as_deref().unwrap_or(""),
        requester_id = requester_id.as_deref().unwrap_or(""),
    );

    let response = handle(state, req, request_id, requester_id).instrument(span.clone()).await;

    let _entered = span.enter();
    log::access_log(&method, &path, response.status().as_u16(), started);
    response
}

async fn handle(
    state: ProxyState,
    req: Request,
    request_id: Option<String>,
    requester_id: Option<String>,
) -> Response {
    if !state.runtime.is_ready() {
        return status_response(503, "service unavailable");
    }

    let async_request_id = header_string(req.headers(), HEADER_ASYNC_REQUEST_ID);
    let async_token = header_string(req.headers(), HEADER_ASYNC_REQUEST_TOKEN);

    let mut manifest = match convert::to_contents(req, &state.conf).await {
        Ok(manifest) => manifest,
        Err(error) => return status_response(error.status, &error.message),
    };

    if let Some(id) = async_request_id {
        // async request: accept now, deliver the result to the platform later
        manifest.async_request_id = Some(id);
        manifest.async_token = Some(async_token.unwrap_or_default());

        let msg = InvokeMessage {
            manifest,
            request_id,
            requester_id,
            reply: None,
        };
        if state.requests.send(msg).await.is_err() {
            return status_response(503, "service unavailable");
        }

        return (
            StatusCode::ACCEPTED,
            [
                (header::CONTENT_TYPE, "application/json"),
                // keep-alive would stall the next caller behind the
                // admission gate
                (header::CONNECTION, "close"),
            ],
            Body::empty(),
        )
            .into_response();
    }

    let content_paths: Vec<Utf8PathBuf> = manifest
        .contents
        .iter()
        .filter_map(|content| content.path.clone())
        .collect();

    let (reply_tx, reply_rx) = oneshot::channel();
    let msg = InvokeMessage {
        manifest,
        request_id,
        requester_id,
        reply: Some(reply_tx),
    };
    if state.requests.send(msg).await.is_err() {
        remove_files(&content_paths).await;
        return status_response(503, "service unavailable");
    }

    let res = match reply_rx.await {
        Ok(res) => res,
        Err(_) => {
            // the transport dropped us while shutting down
            remove_files(&content_paths).await;
            return status_response(500, "Internal Server Error: unexpected error of received signal");
        }
    };

    let reply = convert::from_response(&res, &state.conf).await;
    remove_files(&content_paths).await;

    match reply {
        Ok(reply) => stream_reply(reply).await,
        Err(error) => {
            if let Some(path) = &res.path {
                fileio::remove_file_logged(path).await;
            }
            status_response(error.status, &error.message)
        }
    }
}

/// Streams the body file out. The file is unlinked up front so nothing is
/// left behind once the stream completes, whatever the outcome.
async fn stream_reply(reply: HttpReply) -> Response {
    let file = match tokio::fs::File::open(&reply.body_path).await {
        Ok(file) => file,
        Err(error) => {
            warn!(%error, path = %reply.body_path, "failed to open response body file");
            return status_response(503, "unexpected error");
        }
    };
    fileio::remove_file_logged(&reply.body_path).await;

    let status = StatusCode::from_u16(reply.status).unwrap_or_else(|_| {
        warn!(status = reply.status, "invalid status code from runtime, degrading to 500");
        StatusCode::INTERNAL_SERVER_ERROR
    });

    let mut builder = Response::builder().status(status);
    for (key, value) in &reply.headers {
        builder = builder.header(key.as_str(), value.as_str());
    }
    match builder.body(Body::from_stream(ReaderStream::new(file))) {
        Ok(response) => response,
        Err(error) => {
            warn!(%error, "failed to build response");
            status_response(500, "unexpected error")
        }
    }
}

fn header_string(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.is_empty())
        .map(str::to_owned)
}

async fn remove_files(paths: &[Utf8PathBuf]) {
    for path in paths {
        fileio::remove_file_logged(path).await;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use http_body_util::BodyExt as _;
    use model_proxy_task::ChildTask;
    use runtime_ipc::ResponseManifest;
    use tokio::sync::mpsc;
    use tower::ServiceExt as _;

    use super::*;
    use crate::config::Conf;
    use crate::runtime::RuntimeHandle;

    struct TestBed {
        router: axum::Router,
        conf: Arc<Conf>,
        _data_dir: tempfile::TempDir,
    }

    /// A front door wired to a scripted in-process "transport" that
    /// answers every request with `reply`.
    fn testbed(reply: ResponseManifest) -> (TestBed, mpsc::Receiver<InvokeMessage>) {
        let data_dir = tempfile::tempdir().expect("tempdir");
        let conf = Arc::new(Conf {
            requested_data_dir: Utf8PathBuf::from_path_buf(data_dir.path().to_owned()).expect("utf-8 tempdir"),
            ..Conf::default()
        });

        let runtime = RuntimeHandle::new();
        runtime.mark_running();

        let (requests, mut rx) = mpsc::channel::<InvokeMessage>(16);
        let (forward_tx, forward_rx) = mpsc::channel::<InvokeMessage>(16);
        ChildTask::spawn(async move {
            while let Some(msg) = rx.recv().await {
                if let Some(tx) = msg.reply {
                    let _ = tx.send(reply.clone());
                } else {
                    let _ = forward_tx.send(msg).await;
                }
            }
        })
        .detach();

        let state = ProxyState {
            conf: Arc::clone(&conf),
            runtime,
            requests,
        };
        (
            TestBed {
                router: crate::api::make_service_router(state),
                conf,
                _data_dir: data_dir,
            },
            forward_rx,
        )
    }

    fn not_ready_router() -> axum::Router {
        let (requests, _rx) = mpsc::channel(1);
        let state = ProxyState {
            conf: Arc::new(Conf::default()),
            runtime: RuntimeHandle::new(),
            requests,
        };
        crate::api::make_service_router(state)
    }

    #[tokio::test]
    async fn rejects_requests_while_the_runtime_is_not_ready() {
        let response = not_ready_router()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/")
                    .header("content-type", "application/json")
                    .body(Body::from("{}"))
                    .expect("request"),
            )
            .await
            .expect("router");
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn unsupported_method_is_501() {
        let reply = ResponseManifest::default();
        let (bed, _forward) = testbed(reply);
        let response = bed
            .router
            .oneshot(Request::builder().method("DELETE").uri("/").body(Body::empty()).expect("request"))
            .await
            .expect("router");
        assert_eq!(response.status(), StatusCode::NOT_IMPLEMENTED);
    }

    #[tokio::test]
    async fn sync_json_request_round_trips() {
        // the child's reply points at a file holding {"baz":"qux"}
        let data_dir = tempfile::tempdir().expect("tempdir");
        let body_path = Utf8PathBuf::from_path_buf(data_dir.path().join("reply.json")).expect("utf-8 path");
        std::fs::write(&body_path, br#"{"baz":"qux"}"#).expect("reply file");

        let reply = ResponseManifest {
            status_code: Some(200),
            content_type: Some("application/json".to_owned()),
            path: Some(body_path.clone()),
            ..Default::default()
        };
        let (bed, _forward) = testbed(reply);

        let response = bed
            .router
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"foo":"bar"}"#))
                    .expect("request"),
            )
            .await
            .expect("router");

        assert_eq!(response.status(), StatusCode::OK);
        let headers = response.headers();
        assert_eq!(headers["content-type"], "application/json");
        assert_eq!(headers["content-length"], "13");
        assert_eq!(headers["connection"], "close");
        assert_eq!(headers["x-abeja-sys-meta-proxy-version"], crate::PROXY_VERSION);

        let body = response.into_body().collect().await.expect("body").to_bytes();
        assert_eq!(body.as_ref(), br#"{"baz":"qux"}"#);

        // both the materialized request and the reply body are gone
        assert!(!body_path.as_std_path().exists());
        let leftovers: Vec<_> = std::fs::read_dir(&bed.conf.requested_data_dir)
            .map(|dir| dir.collect())
            .unwrap_or_default();
        assert!(leftovers.is_empty(), "requested-data dir should be empty: {leftovers:?}");
    }

    #[tokio::test]
    async fn child_error_surfaces_as_status_body() {
        let reply = ResponseManifest {
            error_message: Some("boom".to_owned()),
            status_code: Some(500),
            ..Default::default()
        };
        let (bed, _forward) = testbed(reply);

        let response = bed
            .router
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/")
                    .header("content-type", "application/json")
                    .body(Body::from("{}"))
                    .expect("request"),
            )
            .await
            .expect("router");

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = response.into_body().collect().await.expect("body").to_bytes();
        assert_eq!(body.as_ref(), br#"{"status":"boom"}"#);
    }

    #[tokio::test]
    async fn async_request_is_accepted_immediately() {
        let (bed, mut forward) = testbed(ResponseManifest::default());

        let response = bed
            .router
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/")
                    .header("content-type", "application/json")
                    .header(HEADER_ASYNC_REQUEST_ID, "req-1")
                    .header(HEADER_ASYNC_REQUEST_TOKEN, "tok-1")
                    .body(Body::from("{}"))
                    .expect("request"),
            )
            .await
            .expect("router");

        assert_eq!(response.status(), StatusCode::ACCEPTED);
        assert_eq!(response.headers()["connection"], "close");
        let body = response.into_body().collect().await.expect("body").to_bytes();
        assert!(body.is_empty());

        let msg = forward.recv().await.expect("message reached the transport");
        assert_eq!(msg.manifest.async_request_id.as_deref(), Some("req-1"));
        assert_eq!(msg.manifest.async_token.as_deref(), Some("tok-1"));
    }

    #[tokio::test]
    async fn correlation_headers_do_not_leak_into_the_response() {
        let (bed, _forward) = testbed(ResponseManifest::default());
        let response = bed
            .router
            .oneshot(
                Request::builder()
                    .method("GET")
                    .uri("/?a=1")
                    .header(HEADER_REQUEST_ID, "r-1")
                    .header(HEADER_REQUESTER_ID, "u-1")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("router");
        assert_eq!(response.status(), StatusCode::OK);
        assert!(!response.headers().contains_key(HEADER_REQUEST_ID));
    }
}
