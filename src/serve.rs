//! Purpose: Expose the in-memory tunnel service over HTTP.
//! Exports: `ServeConfig`, `ServeHandle`, `serve`, `spawn`, `init_tracing`.
//! Role: Axum frontend translating HTTP requests into `TunnelStub::handle` calls.
//! Invariants: Loopback-only unless explicitly allowed.
//! Invariants: The stub runs on blocking threads; response bodies stream in chunks.
#![allow(clippy::result_large_err)]

use std::future::IntoFuture;
use std::io::Read;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::thread::JoinHandle;

use axum::Router;
use axum::body::Body;
use axum::extract::{DefaultBodyLimit, State};
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method as HttpMethod, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Duration;
use tokio_stream::wrappers::ReceiverStream;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::api::stub::TunnelStub;
use crate::api::transport::{Method, RequestBody, TransportRequest, TransportResponse};
use crate::core::error::{Error, ErrorKind};

type ServeResult<T> = Result<T, Error>;

pub const DEFAULT_MAX_BODY_BYTES: usize = 256 * 1024 * 1024;
const BODY_CHUNK: usize = 64 * 1024;
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

#[derive(Clone, Debug)]
pub struct ServeConfig {
    pub bind: SocketAddr,
    pub allow_non_loopback: bool,
    pub max_body_bytes: usize,
}

impl ServeConfig {
    pub fn loopback() -> Self {
        Self {
            bind: SocketAddr::from(([127, 0, 0, 1], 0)),
            allow_non_loopback: false,
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
        }
    }
}

pub fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .try_init();
}

/// Serves until ctrl-c or SIGTERM.
pub async fn serve(stub: Arc<TunnelStub>, config: ServeConfig) -> ServeResult<()> {
    validate_config(&config)?;
    let listener = tokio::net::TcpListener::bind(config.bind)
        .await
        .map_err(|err| {
            Error::new(ErrorKind::Transport)
                .with_message("failed to bind server")
                .with_source(err)
        })?;
    if let Ok(addr) = listener.local_addr() {
        info!(%addr, "tunnel service listening");
    }

    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let server = axum::serve(listener, router(stub, &config))
        .with_graceful_shutdown(async {
            let _ = shutdown_rx.await;
        })
        .into_future();
    tokio::pin!(server);

    tokio::select! {
        result = &mut server => {
            result.map_err(server_failed)?;
        }
        _ = shutdown_signal() => {
            let _ = shutdown_tx.send(());
            match tokio::time::timeout(SHUTDOWN_GRACE, &mut server).await {
                Ok(result) => result.map_err(server_failed)?,
                Err(_) => {
                    return Err(Error::new(ErrorKind::Internal)
                        .with_message("server shutdown timed out"));
                }
            }
        }
    };
    Ok(())
}

/// A server running on its own runtime thread; dropping the handle stops it.
pub struct ServeHandle {
    addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl ServeHandle {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn endpoint(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for ServeHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Binds synchronously, then serves on a background thread. Used by tests.
pub fn spawn(stub: Arc<TunnelStub>, config: ServeConfig) -> ServeResult<ServeHandle> {
    validate_config(&config)?;
    let listener = std::net::TcpListener::bind(config.bind).map_err(|err| {
        Error::new(ErrorKind::Transport)
            .with_message("failed to bind server")
            .with_source(err)
    })?;
    let addr = listener.local_addr().map_err(|err| {
        Error::new(ErrorKind::Transport)
            .with_message("failed to read bound address")
            .with_source(err)
    })?;
    listener.set_nonblocking(true).map_err(|err| {
        Error::new(ErrorKind::Transport)
            .with_message("failed to configure listener")
            .with_source(err)
    })?;
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()
        .map_err(|err| {
            Error::new(ErrorKind::Internal)
                .with_message("failed to start server runtime")
                .with_source(err)
        })?;

    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let app = router(stub, &config);
    let thread = std::thread::Builder::new()
        .name("tunnel-serve".to_string())
        .spawn(move || {
            runtime.block_on(async move {
                let listener = match tokio::net::TcpListener::from_std(listener) {
                    Ok(listener) => listener,
                    Err(err) => {
                        warn!(error = %err, "failed to adopt listener");
                        return;
                    }
                };
                let result = axum::serve(listener, app)
                    .with_graceful_shutdown(async {
                        let _ = shutdown_rx.await;
                    })
                    .await;
                if let Err(err) = result {
                    warn!(error = %err, "tunnel service stopped with an error");
                }
            });
            runtime.shutdown_timeout(SHUTDOWN_GRACE);
        })
        .map_err(|err| {
            Error::new(ErrorKind::Internal)
                .with_message("failed to spawn server thread")
                .with_source(err)
        })?;
    info!(%addr, "tunnel service spawned");
    Ok(ServeHandle {
        addr,
        shutdown: Some(shutdown_tx),
        thread: Some(thread),
    })
}

fn router(stub: Arc<TunnelStub>, config: &ServeConfig) -> Router {
    Router::new()
        .fallback(dispatch)
        .layer(DefaultBodyLimit::max(config.max_body_bytes))
        .layer(TraceLayer::new_for_http())
        .with_state(stub)
}

fn is_loopback(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(addr) => addr.is_loopback(),
        IpAddr::V6(addr) => addr.is_loopback(),
    }
}

fn validate_config(config: &ServeConfig) -> ServeResult<()> {
    if !is_loopback(config.bind.ip()) && !config.allow_non_loopback {
        return Err(Error::new(ErrorKind::Usage)
            .with_message("non-loopback bind requires explicit opt-in"));
    }
    if config.max_body_bytes == 0 {
        return Err(Error::new(ErrorKind::Usage)
            .with_message("max body size must be greater than zero"));
    }
    Ok(())
}

fn server_failed(err: std::io::Error) -> Error {
    Error::new(ErrorKind::Internal)
        .with_message("server failed")
        .with_source(err)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };
    #[cfg(unix)]
    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    #[cfg(not(unix))]
    ctrl_c.await;
}

async fn dispatch(
    State(stub): State<Arc<TunnelStub>>,
    method: HttpMethod,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let Some(request) = transport_request(&method, &uri, &headers, body) else {
        return (StatusCode::METHOD_NOT_ALLOWED, "unsupported method").into_response();
    };
    match tokio::task::spawn_blocking(move || stub.handle(request)).await {
        Ok(response) => http_response(response),
        Err(err) => {
            warn!(error = %err, "tunnel handler panicked");
            (StatusCode::INTERNAL_SERVER_ERROR, "handler failed").into_response()
        }
    }
}

fn transport_request(
    method: &HttpMethod,
    uri: &Uri,
    headers: &HeaderMap,
    body: Bytes,
) -> Option<TransportRequest> {
    let method = match *method {
        HttpMethod::GET => Method::Get,
        HttpMethod::POST => Method::Post,
        HttpMethod::PUT => Method::Put,
        _ => return None,
    };
    let mut request = TransportRequest::new(method, uri.path().trim_start_matches('/'));
    if let Some(query) = uri.query() {
        request.query = url::form_urlencoded::parse(query.as_bytes())
            .into_owned()
            .collect();
    }
    request.headers = headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|value| (name.as_str().to_string(), value.to_string()))
        })
        .collect();
    if !body.is_empty() {
        request.body = RequestBody::Bytes(body.to_vec());
    }
    Some(request)
}

fn http_response(response: TransportResponse) -> Response {
    let TransportResponse {
        status,
        headers,
        body,
    } = response;
    let (tx, rx) = mpsc::channel::<Result<Bytes, std::io::Error>>(4);
    tokio::task::spawn_blocking(move || pump_body(body, tx));
    let mut out = Response::new(Body::from_stream(ReceiverStream::new(rx)));
    *out.status_mut() = StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    for (name, value) in headers {
        let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(&value),
        ) else {
            continue;
        };
        out.headers_mut().insert(name, value);
    }
    out
}

// An error ends the chunked body early; the client sees a broken response.
fn pump_body(mut body: Box<dyn Read + Send>, tx: mpsc::Sender<Result<Bytes, std::io::Error>>) {
    let mut buf = vec![0u8; BODY_CHUNK];
    loop {
        match body.read(&mut buf) {
            Ok(0) => return,
            Ok(read) => {
                if tx.blocking_send(Ok(Bytes::copy_from_slice(&buf[..read]))).is_err() {
                    return;
                }
            }
            Err(err) => {
                let _ = tx.blocking_send(Err(err));
                return;
            }
        }
    }
}
