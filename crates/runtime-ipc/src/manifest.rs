use std::collections::HashMap;

use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};

/// One body part of a materialized request.
///
/// `path` points at a file inside the requested-data directory holding the
/// raw bytes; the runtime reads it instead of receiving the bytes inline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Content {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<Utf8PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub form_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<HashMap<String, serde_json::Value>>,
}

impl Content {
    pub fn from_path(path: Utf8PathBuf) -> Self {
        Content {
            content_type: None,
            path: Some(path),
            file_name: None,
            form_name: None,
            metadata: None,
        }
    }
}

/// One request header; `values` keeps the on-the-wire order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeaderEntry {
    pub key: String,
    pub values: Vec<String>,
}

/// The request manifest written to the runtime.
///
/// `async_request_id` and `async_token` travel with the request inside the
/// proxy but are never serialized to the runtime.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestManifest {
    #[serde(default)]
    pub method: String,
    #[serde(default)]
    pub content_type: String,
    #[serde(default)]
    pub headers: Vec<HeaderEntry>,
    #[serde(default)]
    pub contents: Vec<Content>,
    #[serde(skip)]
    pub async_request_id: Option<String>,
    #[serde(skip)]
    pub async_token: Option<String>,
}

impl RequestManifest {
    pub fn is_async(&self) -> bool {
        self.async_request_id.is_some()
    }
}

/// The response manifest read back from the runtime.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseManifest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<HashMap<String, String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<Utf8PathBuf>,
    #[serde(rename = "error_message", skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
}
