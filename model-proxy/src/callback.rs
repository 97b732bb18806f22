use std::time::Duration;

use anyhow::Context as _;
use reqwest::multipart::{Form, Part};
use runtime_ipc::ResponseManifest;
use tokio_util::io::ReaderStream;

use crate::config::{AuthInfo, Conf};
use crate::convert::{self, HttpReply, KEY_CONTENT_LENGTH};
use crate::platform::{RetryClient, RetryDelay};

const CALLBACK_TIMEOUT: Duration = Duration::from_secs(30);
const CALLBACK_ATTEMPTS: u32 = 3;
const CALLBACK_DELAY: Duration = Duration::from_secs(3);

/// Delivery of one async request's result to the platform's result-ingest
/// endpoint, authenticated with the request's own token.
///
/// Built once per request; the success and error paths share the client.
pub(crate) struct ArmsCallback {
    client: RetryClient,
    path: String,
}

impl ArmsCallback {
    pub(crate) fn new(conf: &Conf, async_request_id: &str, token: &str) -> anyhow::Result<Self> {
        let auth = AuthInfo {
            auth_token: token.to_owned(),
            ..Default::default()
        };
        let client = RetryClient::new(
            &conf.api_url,
            CALLBACK_TIMEOUT,
            CALLBACK_ATTEMPTS,
            RetryDelay::Fixed(CALLBACK_DELAY),
            auth,
        )
        .context("failed to build callback http client")?;

        let path = format!(
            "/organizations/{}/deployments/{}/results/{}",
            conf.organization_id, conf.deployment_id, async_request_id
        );
        debug!(endpoint = %path, "ARMS endpoint");

        Ok(ArmsCallback { client, path })
    }

    /// Dematerializes the runtime's response and PUTs it as
    /// `multipart/form-data` (`status`, `headers`, `body`, in that order).
    /// Any failure downgrades to an error callback.
    pub(crate) async fn deliver(&self, res: &ResponseManifest, conf: &Conf) {
        let reply = match convert::from_response(res, conf).await {
            Ok(reply) => reply,
            Err(error) => {
                error!(%error, "unexpected error occurred in sending async response");
                self.send_error("response from runtime").await;
                return;
            }
        };

        if let Err(error) = self.put_result(&reply, res.content_type.as_deref()).await {
            error!(%error, "unexpected error occurred in sending async response");
            self.send_error("build response of runtime").await;
        }

        convert::fileio::remove_file_logged(&reply.body_path).await;
    }

    async fn put_result(&self, reply: &HttpReply, body_content_type: Option<&str>) -> anyhow::Result<()> {
        let url = self.client.build_url(&self.path, &[]);

        let response = self
            .client
            .execute_with(async || {
                // Content-Length is recomputed by the platform.
                let mut headers = reply.headers.clone();
                headers.remove(KEY_CONTENT_LENGTH);

                let status_part = Part::text(reply.status.to_string()).mime_str("text/plain")?;
                let headers_part =
                    Part::text(serde_json::to_string(&headers).context("failed to marshal headers part")?)
                        .mime_str("application/json")?;

                let body_file = tokio::fs::File::open(&reply.body_path)
                    .await
                    .context("failed to open response body file")?;
                let body_part = Part::stream(reqwest::Body::wrap_stream(ReaderStream::new(body_file)))
                    .mime_str(body_content_type.unwrap_or("text/plain"))?;

                let form = Form::new()
                    .part("status", status_part)
                    .part("headers", headers_part)
                    .part("body", body_part);

                Ok(self.client.request(reqwest::Method::PUT, url.clone()).multipart(form))
            })
            .await?;

        let status = response.status();
        if status.as_u16() >= 400 {
            error!(status = status.as_u16(), "response from GW was error");
        }
        Ok(())
    }

    /// The error-only callback: a fixed JSON payload naming the failure.
    pub(crate) async fn send_error(&self, reason: &str) {
        let payload = serde_json::json!({
            "status": 502,
            "headers": {
                "content-type": "application/json"
            },
            "body": {
                "error": "internal_server_error",
                "error_description": format!("Internal Server Error: unexpected error of {reason}"),
            }
        });
        let url = self.client.build_url(&self.path, &[]);

        let result = self
            .client
            .execute_with(async || {
                Ok(self
                    .client
                    .request(reqwest::Method::PUT, url.clone())
                    .header(reqwest::header::CONTENT_TYPE, "application/json")
                    .body(payload.to_string()))
            })
            .await;

        match result {
            Err(error) => error!(%error, "unexpected error occurred in sending error async response"),
            Ok(response) if response.status().as_u16() >= 400 => {
                warn!(status = response.status().as_u16(), "response error from GW");
            }
            Ok(_) => {}
        }
    }
}
