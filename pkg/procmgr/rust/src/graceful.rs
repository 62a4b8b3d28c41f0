// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

//! HTTP server whose listening socket survives a process image swap.
//!
//! The listener comes from, in order: a pre-bound listener handed in by the
//! caller, a descriptor inherited from the previous image, or a fresh bind.
//! `shutdown` stops accepting and lets in-flight requests finish within the
//! configured timeout; whatever is still running after that is dropped.

use bytes::Bytes;
use futures::future::BoxFuture;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::{TokioIo, TokioTimer};
use log::{debug, error, info, warn};
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use std::convert::Infallible;
use std::fmt;
use std::future::Future;
use std::net::{SocketAddr, TcpListener};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;

use crate::config::ServerConfig;
use crate::error::{Error, Result};
use crate::runtime::Runtime;

/// hyper refuses read buffers smaller than this.
const MIN_BUF_SIZE: usize = 8192;
const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

pub type Handler =
    Arc<dyn Fn(Request<Incoming>) -> BoxFuture<'static, Response<Full<Bytes>>> + Send + Sync>;

/// Wrap an async closure as a `Handler`.
pub fn handler_fn<F, Fut>(f: F) -> Handler
where
    F: Fn(Request<Incoming>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Response<Full<Bytes>>> + Send + 'static,
{
    Arc::new(move |req| Box::pin(f(req)))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerStatus {
    Stopped,
    Running,
}

/// `"8080"` and `":8080"` listen on every interface.
pub fn normalize_address(address: &str) -> Result<String> {
    let trimmed = address.trim();
    let normalized = if trimmed.is_empty() {
        "0.0.0.0:0".to_string()
    } else if trimmed.bytes().all(|b| b.is_ascii_digit()) {
        format!("0.0.0.0:{trimmed}")
    } else if let Some(port) = trimmed.strip_prefix(':') {
        format!("0.0.0.0:{port}")
    } else {
        trimmed.to_string()
    };

    let invalid = |reason: String| Error::InvalidAddress {
        address: address.to_string(),
        reason,
    };
    let (host, port) = normalized
        .rsplit_once(':')
        .ok_or_else(|| invalid("missing port".to_string()))?;
    if host.is_empty() {
        return Err(invalid("missing host".to_string()));
    }
    port.parse::<u16>().map_err(|e| invalid(e.to_string()))?;
    Ok(normalized)
}

struct Bound {
    listener: TcpListener,
    inherited: bool,
}

pub struct GracefulServer {
    runtime: Runtime,
    config: ServerConfig,
    address: String,
    handler: Handler,
    prebound: Mutex<Vec<TcpListener>>,
    inherited_fd: Option<i32>,
    listener: Mutex<Option<Bound>>,
    tls: Mutex<Option<TlsAcceptor>>,
    status: watch::Sender<ServerStatus>,
    stop: CancellationToken,
    close: CancellationToken,
}

impl fmt::Debug for GracefulServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GracefulServer")
            .field("address", &self.address)
            .field("status", &self.status())
            .field("tls", &self.is_tls())
            .finish_non_exhaustive()
    }
}

impl GracefulServer {
    pub fn new(runtime: &Runtime, config: ServerConfig, handler: Handler) -> Result<Self> {
        let address = normalize_address(&config.address)?;
        Ok(Self {
            runtime: runtime.clone(),
            config,
            address,
            handler,
            prebound: Mutex::new(Vec::new()),
            inherited_fd: None,
            listener: Mutex::new(None),
            tls: Mutex::new(None),
            status: watch::Sender::new(ServerStatus::Stopped),
            stop: CancellationToken::new(),
            close: CancellationToken::new(),
        })
    }

    /// Already bound listeners; the one on the configured port is used.
    pub fn with_listeners(self, listeners: Vec<TcpListener>) -> Self {
        *lock(&self.prebound) = listeners;
        self
    }

    /// Listener descriptor inherited from the previous process image.
    pub fn with_inherited_fd(mut self, fd: i32) -> Self {
        self.inherited_fd = Some(fd);
        self
    }

    /// Configured address, normalized.
    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn listened_address(&self) -> Option<SocketAddr> {
        lock(&self.listener)
            .as_ref()
            .and_then(|bound| bound.listener.local_addr().ok())
    }

    pub fn listened_port(&self) -> Option<u16> {
        self.listened_address().map(|addr| addr.port())
    }

    /// Raw listening descriptor, for handing to a successor process.
    pub fn fd(&self) -> Option<i32> {
        let bound = lock(&self.listener);
        bound
            .as_ref()
            .and_then(|bound| self.runtime.platform().listener_fd(&bound.listener))
    }

    pub fn status(&self) -> ServerStatus {
        *self.status.borrow()
    }

    pub fn is_tls(&self) -> bool {
        lock(&self.tls).is_some()
    }

    pub fn create_listener(&self) -> Result<()> {
        let mut slot = lock(&self.listener);
        if slot.is_some() {
            return Ok(());
        }

        let bound = if let Some(listener) = self.take_prebound()? {
            debug!("using pre-bound listener for [{}]", self.address);
            Bound {
                listener,
                inherited: false,
            }
        } else if let Some(fd) = self.inherited_fd {
            let listener = self.runtime.platform().listener_from_fd(fd)?;
            debug!("adopted inherited listener fd {fd} for [{}]", self.address);
            Bound {
                listener,
                inherited: true,
            }
        } else {
            Bound {
                listener: TcpListener::bind(self.address.as_str())?,
                inherited: false,
            }
        };
        bound.listener.set_nonblocking(true)?;
        *slot = Some(bound);
        Ok(())
    }

    /// Load a PEM certificate chain and key, then create the listener.
    pub fn create_listener_tls(&self, cert: &Path, key: &Path) -> Result<()> {
        let acceptor = tls_acceptor(cert, key)?;
        *lock(&self.tls) = Some(acceptor);
        self.create_listener()
    }

    /// Accept and serve connections until `shutdown` or `close`.
    pub async fn serve(&self) -> Result<()> {
        let (listener, inherited) = {
            let slot = lock(&self.listener);
            let bound = slot
                .as_ref()
                .ok_or(Error::InvalidOperation("serve called before create_listener"))?;
            (bound.listener.try_clone()?, bound.inherited)
        };
        let listener = tokio::net::TcpListener::from_std(listener)?;
        let addr = listener.local_addr()?;
        let tls = lock(&self.tls).clone();
        let proto = if tls.is_some() { "https" } else { "http" };

        self.status.send_replace(ServerStatus::Running);
        info!(
            "pid[{}]: {proto} server {} listening on [{addr}]",
            self.runtime.pid(),
            if inherited { "reloaded" } else { "started" }
        );

        self.accept_loop(listener, tls).await;

        self.status.send_replace(ServerStatus::Stopped);
        info!("pid[{}]: {proto} server on [{addr}] stopped", self.runtime.pid());
        Ok(())
    }

    /// Stop accepting, then wait up to the configured timeout for in-flight
    /// requests before dropping them.
    pub async fn shutdown(&self) {
        if self.status() == ServerStatus::Stopped {
            debug!("shutdown: server on [{}] is not running", self.address);
            return;
        }
        let timeout = self.config.graceful_shutdown_timeout();
        info!("shutting down server on [{}], timeout {timeout:?}", self.address);
        self.stop.cancel();

        let mut status = self.status.subscribe();
        let drained = tokio::time::timeout(timeout, wait_stopped(&mut status))
            .await
            .is_ok();
        if !drained {
            warn!(
                "server on [{}] did not drain within {timeout:?}, closing remaining connections",
                self.address
            );
            self.close.cancel();
            wait_stopped(&mut status).await;
        }
    }

    /// Stop immediately, dropping in-flight requests.
    pub async fn close(&self) {
        if self.status() == ServerStatus::Stopped {
            debug!("close: server on [{}] is not running", self.address);
            return;
        }
        info!("closing server on [{}]", self.address);
        self.stop.cancel();
        self.close.cancel();
        wait_stopped(&mut self.status.subscribe()).await;
    }

    /// Stop the server on any shutdown signal delivered through the runtime.
    pub fn register_shutdown_handler(self: &Arc<Self>) {
        let server = Arc::clone(self);
        self.runtime.signals().add_shutdown_handler(move |sig| {
            let server = Arc::clone(&server);
            async move {
                info!("{sig} received, stopping server on [{}]", server.address);
                server.shutdown().await;
            }
        });
    }

    async fn accept_loop(&self, listener: tokio::net::TcpListener, tls: Option<TlsAcceptor>) {
        let builder = self.http_builder();
        let mut connections = JoinSet::new();

        loop {
            let event = tokio::select! {
                _ = self.stop.cancelled() => None,
                accepted = listener.accept() => Some(accepted),
                Some(_) = connections.join_next() => continue,
            };
            let Some(accepted) = event else { break };
            match accepted {
                Ok((stream, peer)) => {
                    debug!("accepted connection from {peer}");
                    let ctx = ConnContext {
                        builder: builder.clone(),
                        handler: Arc::clone(&self.handler),
                        stop: self.stop.clone(),
                    };
                    match tls.clone() {
                        Some(acceptor) => {
                            connections.spawn(async move {
                                match acceptor.accept(stream).await {
                                    Ok(stream) => ctx.serve(stream).await,
                                    Err(e) => debug!("tls handshake with {peer} failed: {e}"),
                                }
                            });
                        }
                        None => {
                            connections.spawn(ctx.serve(stream));
                        }
                    }
                }
                Err(e) => {
                    error!("accept on [{}] failed: {e}", self.address);
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
            }
        }

        // New connections are refused from here on.
        drop(listener);
        lock(&self.listener).take();

        let forced = loop {
            tokio::select! {
                joined = connections.join_next() => {
                    if joined.is_none() {
                        break false;
                    }
                }
                _ = self.close.cancelled() => break true,
            }
        };
        if forced {
            debug!("dropping {} open connection(s)", connections.len());
            connections.shutdown().await;
        }
    }

    fn http_builder(&self) -> http1::Builder {
        let mut builder = http1::Builder::new();
        builder
            .timer(TokioTimer::new())
            .keep_alive(self.config.keep_alive)
            .max_buf_size(self.config.max_header_bytes.max(MIN_BUF_SIZE));
        if let Some(ms) = self.config.read_header_timeout_ms {
            builder.header_read_timeout(Duration::from_millis(ms));
        }
        builder
    }

    fn take_prebound(&self) -> Result<Option<TcpListener>> {
        let mut prebound = lock(&self.prebound);
        if prebound.is_empty() {
            return Ok(None);
        }
        let port = self
            .address
            .rsplit_once(':')
            .and_then(|(_, port)| port.parse::<u16>().ok())
            .unwrap_or(0);
        for i in 0..prebound.len() {
            let matches = port == 0 || prebound[i].local_addr()?.port() == port;
            if matches {
                return Ok(Some(prebound.swap_remove(i)));
            }
        }
        Ok(None)
    }
}

struct ConnContext {
    builder: http1::Builder,
    handler: Handler,
    stop: CancellationToken,
}

impl ConnContext {
    async fn serve<I>(self, io: I)
    where
        I: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let handler = self.handler;
        let service = service_fn(move |req| {
            let handler = Arc::clone(&handler);
            async move { Ok::<_, Infallible>(handler(req).await) }
        });
        let conn = self.builder.serve_connection(TokioIo::new(io), service);
        tokio::pin!(conn);

        let result = tokio::select! {
            result = conn.as_mut() => result,
            _ = self.stop.cancelled() => {
                conn.as_mut().graceful_shutdown();
                conn.as_mut().await
            }
        };
        if let Err(e) = result {
            debug!("connection ended with error: {e}");
        }
    }
}

async fn wait_stopped(status: &mut watch::Receiver<ServerStatus>) {
    // The sender lives in the server, which outlives this borrow.
    let _ = status.wait_for(|s| *s == ServerStatus::Stopped).await;
}

fn tls_acceptor(cert: &Path, key: &Path) -> Result<TlsAcceptor> {
    let certs: Vec<CertificateDer<'static>> = CertificateDer::pem_file_iter(cert)
        .and_then(|certs| certs.collect())
        .map_err(|e| Error::Tls(format!("reading certificates from {}: {e}", cert.display())))?;
    if certs.is_empty() {
        return Err(Error::Tls(format!("no certificate found in {}", cert.display())));
    }
    let key = PrivateKeyDer::from_pem_file(key)
        .map_err(|e| Error::Tls(format!("reading private key from {}: {e}", key.display())))?;

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let config = rustls::ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| Error::Tls(e.to_string()))?
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| Error::Tls(e.to_string()))?;
    Ok(TlsAcceptor::from(Arc::new(config)))
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
