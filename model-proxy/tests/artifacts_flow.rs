//! Artifact plumbing end to end: pre-boot code download (preprocess) and
//! the tensorboard fetcher, both against a stub platform API serving a
//! real tar.gz archive through the signed-URL indirection.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use axum::routing::get;
use camino::Utf8Path;
use hyper_util::rt::{TokioIo, TokioTimer};
use hyper_util::service::TowerToHyperService;
use model_proxy::config::Conf;
use model_proxy::{preprocess, tensorboard};
use model_proxy_task::ChildTask;
use parking_lot::Mutex;

fn tar_gz_with(entries: &[(&str, &[u8])]) -> Vec<u8> {
    let encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
    let mut builder = tar::Builder::new(encoder);
    for (name, data) in entries {
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, name, *data).expect("append entry");
    }
    builder
        .into_inner()
        .expect("finish tar")
        .finish()
        .expect("finish gzip")
}

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

/// Stub platform: a descriptor endpoint pointing at a blob endpoint.
async fn archive_api(descriptor_path: &str, descriptor_key: DescriptorShape, archive: Vec<u8>) -> SocketAddr {
    let blob_url = Arc::new(Mutex::new(String::new()));
    let blob_url_for_meta = Arc::clone(&blob_url);

    let meta = move || {
        let blob_url = Arc::clone(&blob_url_for_meta);
        async move {
            let url = blob_url.lock().clone();
            let body = match descriptor_key {
                DescriptorShape::DownloadUri => serde_json::json!({ "download_uri": url }),
                DescriptorShape::Artifacts => serde_json::json!({
                    "artifacts": { "complete": { "uri": url } }
                }),
            };
            ([("content-type", "application/json")], body.to_string())
        }
    };

    let router = Router::new()
        .route(descriptor_path, get(meta))
        .route("/signed/archive", get(move || {
            let archive = archive.clone();
            async move { archive }
        }));
    let addr = serve_stub(router).await;
    *blob_url.lock() = format!("http://{addr}/signed/archive");
    addr
}

#[derive(Clone, Copy)]
enum DescriptorShape {
    DownloadUri,
    Artifacts,
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn preprocess_unpacks_model_source_into_the_working_dir() {
    let archive = tar_gz_with(&[("main.py", b"def handler(req, ctx):\n    pass\n")]);
    let addr = archive_api(
        "/organizations/o1/models/m1/versions/v1/source",
        DescriptorShape::DownloadUri,
        archive,
    )
    .await;

    let working = tempfile::tempdir().expect("working dir");
    let conf = Conf {
        api_url: format!("http://{addr}"),
        organization_id: "o1".to_owned(),
        model_id: "m1".to_owned(),
        model_version_id: "v1".to_owned(),
        platform_auth_token: "tok".to_owned(),
        user_model_root: working.path().to_str().expect("utf-8 working dir").to_owned(),
        ..Conf::default()
    };

    preprocess::prepare(&conf).await.expect("prepare");

    let unpacked = working.path().join("main.py");
    assert_eq!(
        std::fs::read(&unpacked).expect("unpacked entry"),
        b"def handler(req, ctx):\n    pass\n"
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn preprocess_rejects_missing_credentials() {
    let conf = Conf {
        organization_id: "o1".to_owned(),
        model_id: "m1".to_owned(),
        model_version_id: "v1".to_owned(),
        ..Conf::default()
    };
    let error = preprocess::prepare(&conf).await.expect_err("no token");
    assert!(error.to_string().contains("PLATFORM_AUTH_TOKEN"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn tensorboard_places_job_results_under_the_mount() {
    let archive = tar_gz_with(&[("events.out.tfevents.1", b"tb-data")]);
    let addr = archive_api(
        "/organizations/o1/training/definitions/def-1/jobs/job-1/result",
        DescriptorShape::Artifacts,
        archive,
    )
    .await;

    let mount = tempfile::tempdir().expect("mount dir");
    let conf = Conf {
        api_url: format!("http://{addr}"),
        organization_id: "o1".to_owned(),
        training_job_definition_name: "def-1".to_owned(),
        training_job_ids: "job-1,job-1".to_owned(), // duplicates collapse
        tensorboard_id: "tb-1".to_owned(),
        platform_auth_token: "tok".to_owned(),
        mount_target_dir: mount.path().to_str().expect("utf-8 mount dir").to_owned(),
        ..Conf::default()
    };

    tensorboard::run(conf).await.expect("tensorboard run");

    let dest = Utf8Path::from_path(mount.path())
        .expect("utf-8 mount dir")
        .join("tensorboards/tb-1/training_jobs/job-1/events.out.tfevents.1");
    assert_eq!(std::fs::read(dest.as_std_path()).expect("tb file"), b"tb-data");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn tensorboard_replaces_a_previous_copy() {
    let archive = tar_gz_with(&[("fresh.txt", b"new")]);
    let addr = archive_api(
        "/organizations/o1/training/definitions/def-1/jobs/job-1/result",
        DescriptorShape::Artifacts,
        archive,
    )
    .await;

    let mount = tempfile::tempdir().expect("mount dir");
    let stale_dir = mount.path().join("tensorboards/tb-1/training_jobs/job-1");
    std::fs::create_dir_all(&stale_dir).expect("stale dir");
    std::fs::write(stale_dir.join("stale.txt"), b"old").expect("stale file");

    let conf = Conf {
        api_url: format!("http://{addr}"),
        organization_id: "o1".to_owned(),
        training_job_definition_name: "def-1".to_owned(),
        training_job_ids: "job-1".to_owned(),
        tensorboard_id: "tb-1".to_owned(),
        platform_auth_token: "tok".to_owned(),
        mount_target_dir: mount.path().to_str().expect("utf-8 mount dir").to_owned(),
        ..Conf::default()
    };

    tensorboard::run(conf).await.expect("tensorboard run");

    assert!(!stale_dir.join("stale.txt").exists());
    assert_eq!(std::fs::read(stale_dir.join("fresh.txt")).expect("fresh file"), b"new");
}
