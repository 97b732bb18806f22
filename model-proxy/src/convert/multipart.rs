use axum::extract::{FromRequest as _, Multipart, Request};
use runtime_ipc::{Content, RequestManifest};

use super::ConvertError;
use crate::config::Conf;
use crate::convert::{fileio, media_type};

/// Multipart materialization: one manifest content per part, in wire
/// order. The container `Content-Type` (with its boundary parameter) is
/// kept verbatim so the runtime can regenerate the wire format.
pub(super) async fn to_content(req: Request, conf: &Conf) -> Result<RequestManifest, ConvertError> {
    let method = req.method().to_string();
    let base_content_type = req
        .headers()
        .get(axum::http::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_owned();

    let mut multipart = Multipart::from_request(req, &())
        .await
        .map_err(|error| ConvertError::unavailable(format!("failed to read multipart request: {error}")))?;

    let mut contents = Vec::new();
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|error| ConvertError::unavailable(format!("failed to read multipart part: {error}")))?
    {
        let content_type = field.content_type().map(str::to_owned);
        let form_name = field.name().map(str::to_owned);
        let file_name = field.file_name().map(str::to_owned);
        debug!(
            content_type = content_type.as_deref().unwrap_or(""),
            form_name = form_name.as_deref().unwrap_or(""),
            file_name = file_name.as_deref().unwrap_or(""),
            "reading multipart part",
        );

        let data = field
            .bytes()
            .await
            .map_err(|error| ConvertError::unavailable(format!("failed to read multipart part: {error}")))?;

        let ext = media_type::ext_for(content_type.as_deref());
        let path = fileio::to_file_from_bytes(&data, ext, &conf.requested_data_dir)
            .await
            .map_err(|error| ConvertError::unavailable(format!("failed to store multipart part: {error}")))?;

        contents.push(Content {
            content_type,
            path: Some(path),
            file_name,
            form_name,
            metadata: None,
        });
    }

    Ok(RequestManifest {
        method,
        content_type: base_content_type,
        contents,
        ..Default::default()
    })
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::Method;
    use camino::Utf8Path;

    use super::*;

    const BOUNDARY: &str = "test-boundary";

    fn multipart_body() -> String {
        [
            format!("--{BOUNDARY}"),
            "Content-Disposition: form-data; name=\"file1\"; filename=\"cat.jpg\"".to_owned(),
            "Content-Type: image/jpeg".to_owned(),
            String::new(),
            "fake-jpeg-bytes".to_owned(),
            format!("--{BOUNDARY}"),
            "Content-Disposition: form-data; name=\"foo\"".to_owned(),
            String::new(),
            "bar".to_owned(),
            format!("--{BOUNDARY}"),
            "Content-Disposition: form-data; name=\"baz\"".to_owned(),
            String::new(),
            "qux".to_owned(),
            format!("--{BOUNDARY}--"),
            String::new(),
        ]
        .join("\r\n")
    }

    #[tokio::test]
    async fn parts_become_contents_in_order() {
        let dir = tempfile::tempdir().expect("tempdir");
        let conf = Conf {
            requested_data_dir: Utf8Path::from_path(dir.path()).expect("utf-8 tempdir").to_owned(),
            ..Conf::default()
        };

        let content_type = format!("multipart/form-data; boundary={BOUNDARY}");
        let req = Request::builder()
            .method(Method::POST)
            .uri("/")
            .header("content-type", &content_type)
            .body(Body::from(multipart_body()))
            .expect("request");

        let manifest = to_content(req, &conf).await.expect("materialize");
        assert_eq!(manifest.content_type, content_type);
        assert_eq!(manifest.contents.len(), 3);

        let first = &manifest.contents[0];
        assert_eq!(first.content_type.as_deref(), Some("image/jpeg"));
        assert_eq!(first.file_name.as_deref(), Some("cat.jpg"));
        assert_eq!(first.form_name.as_deref(), Some("file1"));
        let first_path = first.path.as_ref().expect("path");
        assert!(first_path.as_str().ends_with(".jpg"));
        assert_eq!(
            tokio::fs::read(first_path).await.expect("read part"),
            b"fake-jpeg-bytes"
        );

        assert_eq!(manifest.contents[1].form_name.as_deref(), Some("foo"));
        assert_eq!(manifest.contents[2].form_name.as_deref(), Some("baz"));
        for field in &manifest.contents[1..] {
            let path = field.path.as_ref().expect("path");
            assert!(path.as_str().ends_with(".txt"));
        }
    }
}
