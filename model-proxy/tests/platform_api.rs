//! Behavior of the platform HTTP client against a local stub API: retry
//! classification, auth header shapes, and the two-step signed-URL
//! download.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use axum::Router;
use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::IntoResponse;
use axum::routing::get;
use camino::Utf8PathBuf;
use hyper_util::rt::{TokioIo, TokioTimer};
use hyper_util::service::TowerToHyperService;
use model_proxy::config::AuthInfo;
use model_proxy::platform::{DownloadDescriptor, Downloader, RetryClient, RetryDelay};
use model_proxy_task::ChildTask;
use parking_lot::Mutex;

async fn serve_stub(router: Router) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind(("127.0.0.1", 0)).await.expect("bind stub");
    let addr = listener.local_addr().expect("stub addr");
    ChildTask::spawn(async move {
        loop {
            let (stream, _) = listener.accept().await.expect("stub accept");
            let service = TowerToHyperService::new(router.clone());
            ChildTask::spawn(async move {
                let _ = hyper::server::conn::http1::Builder::new()
                    .timer(TokioTimer::new())
                    .serve_connection(TokioIo::new(stream), service)
                    .await;
            })
            .detach();
        }
    })
    .detach();
    addr
}

fn retry_client(addr: SocketAddr, auth: AuthInfo) -> RetryClient {
    RetryClient::new(
        &format!("http://{addr}"),
        Duration::from_secs(5),
        3,
        RetryDelay::Fixed(Duration::from_millis(10)),
        auth,
    )
    .expect("client")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn server_errors_are_retried_until_success() {
    let hits = Arc::new(AtomicU32::new(0));
    let router = Router::new()
        .route(
            "/flaky",
            get(|State(hits): State<Arc<AtomicU32>>| async move {
                if hits.fetch_add(1, Ordering::SeqCst) == 0 {
                    (axum::http::StatusCode::INTERNAL_SERVER_ERROR, "try again")
                } else {
                    (axum::http::StatusCode::OK, r#"{"value":42}"#)
                }
            }),
        )
        .with_state(Arc::clone(&hits));
    let addr = serve_stub(router).await;

    let client = retry_client(addr, AuthInfo::default());
    let value: serde_json::Value = client.get_json("/flaky", &[]).await.expect("eventual success");
    assert_eq!(value["value"], 42);
    assert_eq!(hits.load(Ordering::SeqCst), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn client_errors_are_terminal() {
    let hits = Arc::new(AtomicU32::new(0));
    let router = Router::new()
        .route(
            "/missing",
            get(|State(hits): State<Arc<AtomicU32>>| async move {
                hits.fetch_add(1, Ordering::SeqCst);
                (axum::http::StatusCode::NOT_FOUND, "nope")
            }),
        )
        .with_state(Arc::clone(&hits));
    let addr = serve_stub(router).await;

    let client = retry_client(addr, AuthInfo::default());
    let error = client
        .get_json::<serde_json::Value>("/missing", &[])
        .await
        .expect_err("404 is terminal");
    assert!(error.to_string().contains("404"));
    assert_eq!(hits.load(Ordering::SeqCst), 1, "4xx must not be retried");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn bearer_token_wins_over_basic_credentials() {
    let seen = Arc::new(Mutex::new(Vec::<String>::new()));
    let router = Router::new()
        .route(
            "/whoami",
            get(|State(seen): State<Arc<Mutex<Vec<String>>>>, headers: HeaderMap| async move {
                let auth = headers
                    .get("authorization")
                    .and_then(|value| value.to_str().ok())
                    .unwrap_or("")
                    .to_owned();
                seen.lock().push(auth);
                "{}"
            }),
        )
        .with_state(Arc::clone(&seen));
    let addr = serve_stub(router).await;

    let bearer = retry_client(
        addr,
        AuthInfo {
            auth_token: "tok-1".to_owned(),
            user_id: "user-1".to_owned(),
            personal_token: "pat-1".to_owned(),
        },
    );
    let _: serde_json::Value = bearer.get_json("/whoami", &[]).await.expect("bearer request");

    let basic = retry_client(
        addr,
        AuthInfo {
            auth_token: String::new(),
            user_id: "user-1".to_owned(),
            personal_token: "pat-1".to_owned(),
        },
    );
    let _: serde_json::Value = basic.get_json("/whoami", &[]).await.expect("basic request");

    let seen = seen.lock();
    assert_eq!(seen[0], "Bearer tok-1");
    assert!(seen[1].starts_with("Basic "));
}

#[derive(Clone)]
struct BlobState {
    meta_auth: Arc<Mutex<Option<String>>>,
    blob_auth: Arc<Mutex<Option<String>>>,
    blob_url: Arc<Mutex<String>>,
}

#[derive(serde::Deserialize)]
struct StubDescriptor {
    download_uri: String,
}

impl DownloadDescriptor for StubDescriptor {
    fn download_url(&self) -> &str {
        &self.download_uri
    }
}

async fn meta_handler(State(state): State<BlobState>, headers: HeaderMap) -> impl IntoResponse {
    *state.meta_auth.lock() = auth_header(&headers);
    let body = serde_json::json!({ "download_uri": *state.blob_url.lock() });
    ([("content-type", "application/json")], body.to_string())
}

async fn blob_handler(State(state): State<BlobState>, headers: HeaderMap) -> impl IntoResponse {
    *state.blob_auth.lock() = auth_header(&headers);
    "signed blob bytes"
}

fn auth_header(headers: &HeaderMap) -> Option<String> {
    headers
        .get("authorization")
        .and_then(|value| value.to_str().ok())
        .map(str::to_owned)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn download_follows_the_signed_url_without_credentials() {
    let state = BlobState {
        meta_auth: Arc::new(Mutex::new(None)),
        blob_auth: Arc::new(Mutex::new(Some("sentinel".to_owned()))),
        blob_url: Arc::new(Mutex::new(String::new())),
    };
    let router = Router::new()
        .route("/organizations/o1/models/m1/versions/v1/source", get(meta_handler))
        .route("/signed/blob", get(blob_handler))
        .with_state(state.clone());
    let addr = serve_stub(router).await;
    *state.blob_url.lock() = format!("http://{addr}/signed/blob");

    let dir = tempfile::tempdir().expect("tempdir");
    let dest = Utf8PathBuf::from_path_buf(dir.path().join("source.tgz")).expect("utf-8 path");

    let downloader = Downloader::new(
        &format!("http://{addr}"),
        AuthInfo {
            auth_token: "tok-1".to_owned(),
            ..Default::default()
        },
    )
    .expect("downloader");

    let descriptor: StubDescriptor = downloader
        .download("organizations/o1/models/m1/versions/v1/source", &dest)
        .await
        .expect("download");

    assert!(descriptor.download_url().ends_with("/signed/blob"));
    assert_eq!(std::fs::read(&dest).expect("downloaded file"), b"signed blob bytes");

    // the platform API call is authenticated, the pre-signed URL is not
    assert_eq!(state.meta_auth.lock().as_deref(), Some("Bearer tok-1"));
    assert_eq!(state.blob_auth.lock().as_deref(), None);
}
