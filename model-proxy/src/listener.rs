use std::net::SocketAddr;
use std::time::Duration;

use anyhow::Context as _;
use async_trait::async_trait;
use axum::Router;
use hyper_util::rt::{TokioIo, TokioTimer};
use hyper_util::service::TowerToHyperService;
use model_proxy_task::{ChildTask, ShutdownSignal, Task};
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tracing::Instrument as _;

use crate::{ProxyState, api};

/// Socket read/write cap per connection. Keep-alive is disabled, so this
/// covers exactly one request/response exchange.
const HTTP_IO_TIMEOUT: Duration = Duration::from_secs(30);

/// How long an in-flight connection may continue once shutdown started.
pub(crate) const HTTP_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(28);

const MAX_HEADER_BYTES: usize = 1024 * 1024;

fn bind(addr: SocketAddr) -> anyhow::Result<TcpListener> {
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4().context("failed to create IPv4 TCP socket")?
    } else {
        TcpSocket::new_v6().context("failed to create IPv6 TCP socket")?
    };
    socket.bind(addr).context("failed to bind TCP socket")?;
    socket.listen(64).context("failed to listen on the bound TCP socket")
}

/// The inference listener.
///
/// Its accept loop is the admission gate: one connection is accepted and
/// served to completion before the next accept. Deep-learning runtimes
/// are rarely reentrant, so at most one request makes progress at a time.
pub struct ServiceListener {
    addr: SocketAddr,
    listener: TcpListener,
    router: Router,
}

impl ServiceListener {
    pub fn init_and_bind(addr: SocketAddr, state: ProxyState) -> anyhow::Result<Self> {
        let listener = bind(addr).with_context(|| format!("failed to initialize service listener on {addr}"))?;
        let addr = listener.local_addr().context("failed to read local address")?;
        info!(%addr, "service listener started");
        Ok(ServiceListener {
            addr,
            listener,
            router: api::make_service_router(state),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }
}

#[async_trait]
impl Task for ServiceListener {
    type Output = anyhow::Result<()>;

    const NAME: &'static str = "service listener";

    async fn run(self, mut shutdown_signal: ShutdownSignal) -> Self::Output {
        let mut drain_signal = shutdown_signal.clone();
        loop {
            let (stream, peer_addr) = tokio::select! {
                result = self.listener.accept() => match result {
                    Ok(conn) => conn,
                    Err(error) => {
                        error!(%error, "failed to accept connection");
                        continue;
                    }
                },
                _ = shutdown_signal.wait() => break,
            };

            let serve = serve_connection(stream, self.router.clone()).instrument(info_span!("http", client = %peer_addr));
            tokio::select! {
                // this await IS the admission gate: no concurrent accept
                _ = serve => {}
                _ = drain_expired(&mut drain_signal) => {
                    warn!("shutdown grace period expired with a connection still open");
                    break;
                }
            }
        }
        debug!("service listener stopped");
        Ok(())
    }
}

async fn drain_expired(shutdown_signal: &mut ShutdownSignal) {
    shutdown_signal.wait().await;
    tokio::time::sleep(HTTP_SHUTDOWN_TIMEOUT).await;
}

/// The dedicated health listener. No admission gate: probes must never
/// queue behind an inference call.
pub struct HealthListener {
    addr: SocketAddr,
    listener: TcpListener,
    router: Router,
}

impl HealthListener {
    pub fn init_and_bind(addr: SocketAddr, state: ProxyState) -> anyhow::Result<Self> {
        let listener = bind(addr).with_context(|| format!("failed to initialize health listener on {addr}"))?;
        let addr = listener.local_addr().context("failed to read local address")?;
        info!(%addr, "health listener started");
        Ok(HealthListener {
            addr,
            listener,
            router: api::make_health_router(state),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }
}

#[async_trait]
impl Task for HealthListener {
    type Output = anyhow::Result<()>;

    const NAME: &'static str = "health listener";

    async fn run(self, mut shutdown_signal: ShutdownSignal) -> Self::Output {
        loop {
            let (stream, peer_addr) = tokio::select! {
                result = self.listener.accept() => match result {
                    Ok(conn) => conn,
                    Err(error) => {
                        error!(%error, "failed to accept connection");
                        continue;
                    }
                },
                _ = shutdown_signal.wait() => break,
            };

            let router = self.router.clone();
            ChildTask::spawn(
                serve_connection(stream, router).instrument(info_span!("health", client = %peer_addr)),
            )
            .detach();
        }
        debug!("health listener stopped");
        Ok(())
    }
}

async fn serve_connection(stream: TcpStream, router: Router) {
    if let Err(error) = stream.set_nodelay(true) {
        debug!(%error, "set_nodelay failed");
    }

    let service = TowerToHyperService::new(router);
    let conn = hyper::server::conn::http1::Builder::new()
        .timer(TokioTimer::new())
        .keep_alive(false)
        .max_buf_size(MAX_HEADER_BYTES)
        .serve_connection(TokioIo::new(stream), service);

    match tokio::time::timeout(HTTP_IO_TIMEOUT, conn).await {
        Ok(Ok(())) => {}
        Ok(Err(error)) => debug!(%error, "connection ended with an error"),
        Err(_) => warn!("request timed out"),
    }
}
