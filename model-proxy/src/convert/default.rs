use std::collections::HashMap;

use axum::extract::Request;
use axum::http::Method;
use runtime_ipc::{Content, RequestManifest, ResponseManifest};

use super::{ConvertError, HttpReply, KEY_CONNECTION, KEY_CONTENT_LENGTH, KEY_CONTENT_TYPE, KEY_PROXY_VERSION};
use crate::config::Conf;
use crate::convert::{fileio, media_type};
use crate::PROXY_VERSION;

/// Non-multipart materialization: the whole body (for GET, the raw query
/// string) lands in a single file.
pub(super) async fn to_content(req: Request, conf: &Conf) -> Result<RequestManifest, ConvertError> {
    if *req.method() == Method::GET {
        let query = req.uri().query().unwrap_or("").to_owned();
        let path = fileio::to_file_from_bytes(query.as_bytes(), fileio::DEFAULT_EXT, &conf.requested_data_dir)
            .await
            .map_err(|error| ConvertError::unavailable(format!("failed to store request body: {error}")))?;

        return Ok(RequestManifest {
            method: req.method().to_string(),
            // consider the query string as x-www-form-urlencoded
            content_type: "application/x-www-form-urlencoded".to_owned(),
            contents: vec![Content::from_path(path)],
            ..Default::default()
        });
    }

    let method = req.method().to_string();
    let content_type = req
        .headers()
        .get(axum::http::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_owned();

    let body = axum::body::to_bytes(req.into_body(), usize::MAX)
        .await
        .map_err(|error| ConvertError::unavailable(format!("failed to read request body: {error}")))?;

    let ext = media_type::ext_for(Some(&content_type));
    let path = fileio::to_file_from_bytes(&body, ext, &conf.requested_data_dir)
        .await
        .map_err(|error| ConvertError::unavailable(format!("failed to store request body: {error}")))?;

    Ok(RequestManifest {
        method,
        content_type,
        contents: vec![Content::from_path(path)],
        ..Default::default()
    })
}

/// Dematerialization shared by the front door and the one-shot driver.
pub(super) async fn from_response(res: &ResponseManifest, conf: &Conf) -> Result<HttpReply, ConvertError> {
    let mut headers = HashMap::new();
    headers.insert(KEY_CONTENT_TYPE.to_owned(), "application/json".to_owned());
    headers.insert(KEY_PROXY_VERSION.to_owned(), PROXY_VERSION.to_owned());
    headers.insert(KEY_CONTENT_LENGTH.to_owned(), "0".to_owned());
    // The admission gate serves one connection at a time; keep-alive would
    // make the next caller wait for an idle connection to close.
    headers.insert(KEY_CONNECTION.to_owned(), "close".to_owned());

    let status = match res.status_code {
        Some(status) => {
            if !(100..=599).contains(&status) {
                warn!(status, "runtime returned a status code outside 100-599");
            }
            status
        }
        None => {
            debug!("no status_code in runtime response, defaulting to 200");
            200
        }
    };

    if let Some(message) = &res.error_message {
        return Err(ConvertError::new(res.status_code.unwrap_or(500), message.clone()));
    }

    if let Some(content_type) = &res.content_type {
        headers.insert(KEY_CONTENT_TYPE.to_owned(), content_type.clone());
    } else {
        debug!("no content-type in runtime response, using application/json");
    }

    if let Some(metadata) = &res.metadata {
        for (key, value) in metadata {
            headers.insert(key.clone(), value.clone());
        }
    }

    let Some(path) = &res.path else {
        debug!("no path in runtime response");
        let body_path = fileio::empty_body_file(&conf.requested_data_dir)
            .await
            .map_err(|error| ConvertError::unavailable(format!("failed to create empty body file: {error}")))?;
        return Ok(HttpReply {
            status,
            headers,
            body_path,
        });
    };

    let metadata = tokio::fs::metadata(path).await.map_err(|error| {
        warn!(%error, %path, "file specified in runtime response is not readable");
        ConvertError::unavailable("unexpected error")
    })?;
    headers.insert(KEY_CONTENT_LENGTH.to_owned(), metadata.len().to_string());

    Ok(HttpReply {
        status,
        headers,
        body_path: path.clone(),
    })
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use camino::Utf8Path;

    use super::*;

    fn conf_with_data_dir(dir: &Utf8Path) -> Conf {
        Conf {
            requested_data_dir: dir.to_owned(),
            ..Conf::default()
        }
    }

    fn temp_data_dir() -> (tempfile::TempDir, Conf) {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = Utf8Path::from_path(dir.path()).expect("utf-8 tempdir").to_owned();
        let conf = conf_with_data_dir(&path);
        (dir, conf)
    }

    #[tokio::test]
    async fn get_query_string_becomes_a_form_urlencoded_file() {
        let (_dir, conf) = temp_data_dir();
        let req = Request::builder()
            .method(Method::GET)
            .uri("/?foo=bar&baz=qux")
            .body(Body::empty())
            .expect("request");

        let manifest = to_content(req, &conf).await.expect("materialize");
        assert_eq!(manifest.method, "GET");
        assert_eq!(manifest.content_type, "application/x-www-form-urlencoded");
        assert_eq!(manifest.contents.len(), 1);

        let path = manifest.contents[0].path.as_ref().expect("path");
        assert_eq!(tokio::fs::read(path).await.expect("read"), b"foo=bar&baz=qux");
        assert!(path.as_str().ends_with(".txt"));
    }

    #[tokio::test]
    async fn post_json_body_lands_in_a_json_file() {
        let (_dir, conf) = temp_data_dir();
        let req = Request::builder()
            .method(Method::POST)
            .uri("/")
            .header("content-type", "application/json")
            .body(Body::from(r#"{"foo":"bar"}"#))
            .expect("request");

        let manifest = to_content(req, &conf).await.expect("materialize");
        assert_eq!(manifest.method, "POST");
        assert_eq!(manifest.content_type, "application/json");

        let path = manifest.contents[0].path.as_ref().expect("path");
        assert!(path.as_str().ends_with(".json"));
        assert_eq!(tokio::fs::read(path).await.expect("read"), br#"{"foo":"bar"}"#);
    }

    #[tokio::test]
    async fn response_defaults_to_200_json_with_connection_close() {
        let (_dir, conf) = temp_data_dir();
        let reply = from_response(&ResponseManifest::default(), &conf)
            .await
            .expect("dematerialize");

        assert_eq!(reply.status, 200);
        assert_eq!(reply.headers[KEY_CONTENT_TYPE], "application/json");
        assert_eq!(reply.headers[KEY_CONTENT_LENGTH], "0");
        assert_eq!(reply.headers[KEY_CONNECTION], "close");
        assert_eq!(reply.headers[KEY_PROXY_VERSION], PROXY_VERSION);
        assert_eq!(
            tokio::fs::metadata(&reply.body_path).await.expect("empty body").len(),
            0
        );
    }

    #[tokio::test]
    async fn child_body_file_drives_content_length_and_type() {
        let (_dir, conf) = temp_data_dir();
        let body = conf.requested_data_dir.join("out.json");
        fileio::ensure_private_dir(&conf.requested_data_dir).await.expect("dir");
        tokio::fs::write(&body, br#"{"baz":"qux"}"#).await.expect("body file");

        let res = ResponseManifest {
            status_code: Some(200),
            content_type: Some("application/json".to_owned()),
            path: Some(body.clone()),
            ..Default::default()
        };
        let reply = from_response(&res, &conf).await.expect("dematerialize");

        assert_eq!(reply.status, 200);
        assert_eq!(reply.headers[KEY_CONTENT_LENGTH], "13");
        assert_eq!(reply.body_path, body);
    }

    #[tokio::test]
    async fn child_error_message_surfaces_with_child_status() {
        let (_dir, conf) = temp_data_dir();
        let res = ResponseManifest {
            error_message: Some("boom".to_owned()),
            status_code: Some(500),
            ..Default::default()
        };
        let err = from_response(&res, &conf).await.expect_err("child error");
        assert_eq!(err.status, 500);
        assert_eq!(err.message, "boom");
    }

    #[tokio::test]
    async fn child_error_without_status_defaults_to_500() {
        let (_dir, conf) = temp_data_dir();
        let res = ResponseManifest {
            error_message: Some("boom".to_owned()),
            ..Default::default()
        };
        let err = from_response(&res, &conf).await.expect_err("child error");
        assert_eq!(err.status, 500);
    }

    #[tokio::test]
    async fn missing_body_file_is_service_unavailable() {
        let (_dir, conf) = temp_data_dir();
        let res = ResponseManifest {
            path: Some(conf.requested_data_dir.join("does-not-exist.bin")),
            ..Default::default()
        };
        let err = from_response(&res, &conf).await.expect_err("missing file");
        assert_eq!(err.status, 503);
    }

    #[tokio::test]
    async fn metadata_is_merged_into_headers() {
        let (_dir, conf) = temp_data_dir();
        let res = ResponseManifest {
            metadata: Some(
                [("X-Custom".to_owned(), "42".to_owned())]
                    .into_iter()
                    .collect(),
            ),
            ..Default::default()
        };
        let reply = from_response(&res, &conf).await.expect("dematerialize");
        assert_eq!(reply.headers["X-Custom"], "42");
    }
}
