pub(crate) mod default;
pub(crate) mod fileio;
pub(crate) mod media_type;
pub(crate) mod multipart;

use std::collections::{BTreeMap, HashMap};

use axum::extract::Request;
use axum::http::{HeaderMap, Method};
use camino::Utf8PathBuf;
use runtime_ipc::{HeaderEntry, RequestManifest, ResponseManifest};

use crate::config::Conf;

pub const KEY_CONTENT_TYPE: &str = "Content-Type";
pub const KEY_CONTENT_LENGTH: &str = "Content-Length";
pub const KEY_CONNECTION: &str = "Connection";
pub const KEY_PROXY_VERSION: &str = "X-Abeja-Sys-Meta-Proxy-Version";

/// Error raised while materializing a request or dematerializing a
/// response; `status` is what the HTTP client (or the one-shot driver)
/// sees.
#[derive(Debug, thiserror::Error)]
#[error("{message}")]
pub struct ConvertError {
    pub message: String,
    pub status: u16,
}

impl ConvertError {
    pub fn new(status: u16, message: impl Into<String>) -> Self {
        ConvertError {
            message: message.into(),
            status,
        }
    }

    pub(crate) fn unavailable(message: impl Into<String>) -> Self {
        ConvertError::new(503, message)
    }

    pub(crate) fn not_implemented(message: impl Into<String>) -> Self {
        ConvertError::new(501, message)
    }
}

/// How a request body is turned into manifest contents, decided once per
/// request from the method and `Content-Type`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Converter {
    Default,
    Multipart,
}

pub fn select_converter(method: &Method, content_type: Option<&str>) -> Result<Converter, ConvertError> {
    if *method == Method::GET {
        // Content-Type is ignored for GET
        return Ok(Converter::Default);
    }
    if *method != Method::POST && *method != Method::PUT {
        return Err(ConvertError::not_implemented(format!(
            "Method: [{method}] is not supported"
        )));
    }

    let raw = content_type.unwrap_or("");
    match raw.parse::<mime::Mime>() {
        Ok(mime) if mime.type_() == mime::MULTIPART && mime.subtype() == mime::FORM_DATA => Ok(Converter::Multipart),
        Ok(_) => Ok(Converter::Default),
        Err(_) => Err(ConvertError::not_implemented(format!(
            "Content-Type: [{raw}] is not supported"
        ))),
    }
}

/// Persists the request to disk and builds the manifest the runtime reads.
pub async fn to_contents(req: Request, conf: &Conf) -> Result<RequestManifest, ConvertError> {
    let content_type = req
        .headers()
        .get(axum::http::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned);
    let converter = select_converter(req.method(), content_type.as_deref())?;
    let headers = collect_headers(req.headers());

    let mut manifest = match converter {
        Converter::Default => default::to_content(req, conf).await?,
        Converter::Multipart => multipart::to_content(req, conf).await?,
    };
    manifest.headers = headers;
    Ok(manifest)
}

/// Every request header, key lowercased, values kept in wire order, the
/// whole list stably sorted by key.
pub fn collect_headers(headers: &HeaderMap) -> Vec<HeaderEntry> {
    let mut by_key: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for (key, value) in headers {
        by_key
            .entry(key.as_str().to_ascii_lowercase())
            .or_default()
            .push(String::from_utf8_lossy(value.as_bytes()).into_owned());
    }
    by_key
        .into_iter()
        .map(|(key, values)| HeaderEntry { key, values })
        .collect()
}

/// Turns the runtime's response manifest into HTTP response material:
/// status, headers, and the file to stream as the body.
pub async fn from_response(res: &ResponseManifest, conf: &Conf) -> Result<HttpReply, ConvertError> {
    if let Some(content_type) = res.content_type.as_deref()
        && let Ok(mime) = content_type.parse::<mime::Mime>()
        && mime.type_() == mime::MULTIPART
    {
        return Err(ConvertError::not_implemented("not implemented error"));
    }
    default::from_response(res, conf).await
}

/// Response material produced by [`from_response`]. `body_path` always
/// exists, possibly as an empty file.
#[derive(Debug)]
pub struct HttpReply {
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub body_path: Utf8PathBuf,
}
