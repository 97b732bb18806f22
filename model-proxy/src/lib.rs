#[macro_use]
extern crate tracing;

pub mod api;
pub mod archive;
pub mod batch;
pub mod callback;
pub mod config;
pub mod convert;
pub mod listener;
pub mod log;
pub mod oneshot;
pub mod platform;
pub mod preprocess;
pub mod runtime;
pub mod service;
pub mod tensorboard;
pub mod train;
pub mod transport;

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::config::Conf;
use crate::runtime::RuntimeHandle;
use crate::transport::InvokeMessage;

pub const PROXY_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Capacity of the request queue feeding the IPC transport loop.
///
/// Large enough that bursts of async acceptances never block the HTTP
/// handlers, while still bounding memory if the runtime stalls.
pub const REQUEST_QUEUE_CAPACITY: usize = 10_000;

/// Shared state handed to the HTTP front door.
#[derive(Clone)]
pub struct ProxyState {
    pub conf: Arc<Conf>,
    pub runtime: RuntimeHandle,
    pub requests: mpsc::Sender<InvokeMessage>,
}
