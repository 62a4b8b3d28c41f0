// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

//! pid-addressed messaging over localhost TCP.
//!
//! Each process runs at most one listener, started by the first `receive`,
//! `subscribe` or `listen` call, and records its port in the discovery store.
//! Senders resolve the port by pid, write one request frame and wait for the
//! matching response frame. Delivery is one-way; the response only says
//! whether the message was queued.

use futures::{SinkExt, StreamExt};
use log::{debug, info, warn};
use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::OnceCell;
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::config::TransportConfig;
use crate::discovery::DiscoveryStore;
use crate::error::{Error, Result};
use crate::message::{self, MessageRequest, MessageResponse};
use crate::queue::{GroupQueue, GroupRegistry};

/// Pause after a failed accept before trying again.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

#[derive(Debug, Clone)]
pub struct Transport {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    pid: u32,
    discovery: Arc<DiscoveryStore>,
    config: TransportConfig,
    groups: GroupRegistry,
    port: OnceCell<u16>,
    cancel: CancellationToken,
    tracker: TaskTracker,
}

/// A consumer bound to one group's queue.
#[derive(Debug, Clone)]
pub struct Subscription {
    group: String,
    queue: GroupQueue,
}

impl Subscription {
    pub fn group(&self) -> &str {
        &self.group
    }

    /// Next message of this group, waiting as long as it takes.
    pub async fn recv(&self) -> Result<MessageRequest> {
        self.queue
            .pop()
            .await
            .ok_or(Error::InvalidOperation("message queue closed"))
    }

    /// Messages waiting to be consumed.
    pub fn pending(&self) -> usize {
        self.queue.len()
    }
}

impl Transport {
    /// Transport for the process identified by `pid`.
    pub fn new(pid: u32, discovery: Arc<DiscoveryStore>, config: TransportConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                pid,
                discovery,
                groups: GroupRegistry::new(config.queue_capacity),
                config,
                port: OnceCell::new(),
                cancel: CancellationToken::new(),
                tracker: TaskTracker::new(),
            }),
        }
    }

    pub fn pid(&self) -> u32 {
        self.inner.pid
    }

    /// Listener port, once `listen` has succeeded.
    pub fn port(&self) -> Option<u16> {
        self.inner.port.get().copied()
    }

    /// Groups that have a queue on this side.
    pub fn groups(&self) -> Vec<String> {
        self.inner.groups.names()
    }

    /// Start this process's listener if it is not running yet and return its
    /// port. Concurrent callers all get the port of the single winner. A
    /// failed start leaves the gate open for the next caller.
    pub async fn listen(&self) -> Result<u16> {
        let inner = &self.inner;
        inner
            .port
            .get_or_try_init(|| Arc::clone(inner).start_listener())
            .await
            .copied()
    }

    /// Make sure `group` has a queue and the listener is up, then hand back a
    /// consumer for it.
    pub async fn subscribe(&self, group: &str) -> Result<Subscription> {
        self.listen().await?;
        Ok(Subscription {
            group: group.to_string(),
            queue: self.inner.groups.get_or_create(group),
        })
    }

    /// Block until a message for `group` arrives.
    pub async fn receive(&self, group: &str) -> Result<MessageRequest> {
        self.subscribe(group).await?.recv().await
    }

    /// Deliver `data` to `group` of process `pid`.
    pub async fn send(&self, pid: u32, data: &[u8], group: &str) -> Result<()> {
        let port = self
            .inner
            .discovery
            .lookup_port(pid)?
            .ok_or(Error::RecipientNotFound(pid))?;

        let request = MessageRequest {
            send_pid: self.inner.pid,
            recv_pid: pid,
            group: group.to_string(),
            data: data.to_vec(),
        };
        let frame = message::encode(&request)?;

        let mut conn = self.connect(port).await?;
        conn.send(frame).await?;

        match conn.next().await {
            Some(Ok(frame)) => {
                let response: MessageResponse = message::decode(&frame)?;
                if response.is_ok() {
                    Ok(())
                } else {
                    Err(Error::Rejected {
                        pid,
                        message: response.message,
                    })
                }
            }
            Some(Err(e)) => Err(e.into()),
            None => {
                // A responder that dies before acking also lands here.
                debug!("pid {pid} closed the connection without a response, assuming delivered");
                Ok(())
            }
        }
    }

    /// Stop the listener and every connection it is serving. The transport
    /// does not listen again afterwards.
    pub async fn shutdown(&self) {
        self.inner.cancel.cancel();
        self.inner.tracker.close();
        self.inner.tracker.wait().await;
        debug!("message transport of pid {} shut down", self.inner.pid);
    }

    async fn connect(&self, port: u16) -> Result<Framed<TcpStream, LengthDelimitedCodec>> {
        let config = &self.inner.config;
        let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
        let mut retries_left = config.send_retries;
        loop {
            let connecting = TcpStream::connect(addr);
            let attempt = match tokio::time::timeout(config.connect_timeout(), connecting).await {
                Ok(result) => result.map_err(Error::from),
                Err(_) => Err(Error::Io(io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("connecting to {addr} timed out"),
                ))),
            };
            match attempt {
                Ok(stream) => {
                    return Ok(Framed::new(stream, message::frame_codec(config.max_frame_len)));
                }
                Err(e) if e.is_transient() && retries_left > 0 => {
                    retries_left -= 1;
                    debug!("connecting to {addr} failed: {e}, {retries_left} retries left");
                    tokio::time::sleep(config.retry_interval()).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

impl Inner {
    async fn start_listener(self: Arc<Self>) -> Result<u16> {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await?;
        let port = listener.local_addr()?.port();
        self.discovery.record_port(self.pid, port)?;
        info!("message listener for pid {} on 127.0.0.1:{port}", self.pid);

        let tracker = self.tracker.clone();
        tracker.spawn(self.accept_loop(listener));
        Ok(port)
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        loop {
            let accepted = tokio::select! {
                _ = self.cancel.cancelled() => break,
                accepted = listener.accept() => accepted,
            };
            match accepted {
                Ok((stream, peer)) => {
                    debug!("message connection from {peer}");
                    self.tracker.spawn(Arc::clone(&self).serve_connection(stream));
                }
                Err(e) => {
                    warn!("accepting message connection failed: {e}");
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
            }
        }
        debug!("message listener for pid {} stopped", self.pid);
    }

    async fn serve_connection(self: Arc<Self>, stream: TcpStream) {
        let mut conn = Framed::new(stream, message::frame_codec(self.config.max_frame_len));
        loop {
            let frame = tokio::select! {
                _ = self.cancel.cancelled() => return,
                frame = conn.next() => frame,
            };
            let frame = match frame {
                Some(Ok(frame)) => frame,
                Some(Err(e)) => {
                    debug!("closing message connection: {e}");
                    return;
                }
                None => return,
            };

            let Some((response, keep_open)) = self.handle_frame(&frame).await else {
                debug!("dropping message connection, transport shutting down");
                return;
            };
            let encoded = match message::encode(&response) {
                Ok(encoded) => encoded,
                Err(e) => {
                    warn!("encoding message response failed: {e}");
                    return;
                }
            };
            if let Err(e) = conn.send(encoded).await {
                debug!("writing message response failed: {e}");
                return;
            }
            if !keep_open {
                return;
            }
        }
    }

    /// Response for one request frame, and whether the connection stays open.
    /// `None` when shutdown interrupted a push into a full queue.
    async fn handle_frame(&self, frame: &[u8]) -> Option<(MessageResponse, bool)> {
        if frame.is_empty() {
            return Some((MessageResponse::error("empty package"), true));
        }
        let request: MessageRequest = match message::decode(frame) {
            Ok(request) => request,
            Err(e) => {
                debug!("dropping undecodable message: {e}");
                return Some((MessageResponse::error(e.to_string()), false));
            }
        };
        if request.recv_pid != self.pid {
            return Some((
                MessageResponse::error(format!(
                    "receiver pid not match, target: {}, current: {}",
                    request.recv_pid, self.pid
                )),
                true,
            ));
        }
        let Some(queue) = self.groups.get(&request.group) else {
            return Some((
                MessageResponse::error(format!("group [{}] does not exist", request.group)),
                true,
            ));
        };
        tokio::select! {
            _ = self.cancel.cancelled() => None,
            _ = queue.push(request) => Some((MessageResponse::ok(), true)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DiscoveryConfig;
    use bytes::Bytes;
    use std::collections::HashSet;

    fn pair(dir: &std::path::Path) -> (Transport, Transport) {
        let discovery = Arc::new(DiscoveryStore::new(&DiscoveryConfig::in_dir(dir)));
        let config = TransportConfig {
            retry_interval_ms: 10,
            ..TransportConfig::default()
        };
        (
            Transport::new(1001, Arc::clone(&discovery), config.clone()),
            Transport::new(1002, discovery, config),
        )
    }

    #[tokio::test]
    async fn test_send_and_receive() {
        let tmp = tempfile::tempdir().unwrap();
        let (sender, receiver) = pair(tmp.path());

        let sub = receiver.subscribe("g1").await.unwrap();
        sender.send(1002, b"hello", "g1").await.unwrap();

        let msg = sub.recv().await.unwrap();
        assert_eq!(msg.data, b"hello");
        assert_eq!(msg.send_pid, 1001);
        assert_eq!(msg.recv_pid, 1002);
        assert_eq!(msg.group, "g1");
    }

    #[tokio::test]
    async fn test_receive_blocks_until_message() {
        let tmp = tempfile::tempdir().unwrap();
        let (sender, receiver) = pair(tmp.path());

        let rx = receiver.clone();
        let waiting = tokio::spawn(async move { rx.receive("").await });
        // Wait for the listener to come up.
        while receiver.groups().is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(!waiting.is_finished());

        sender.send(1002, b"ping", "").await.unwrap();
        let msg = waiting.await.unwrap().unwrap();
        assert_eq!(msg.data, b"ping");
    }

    #[tokio::test]
    async fn test_send_to_unknown_pid() {
        let tmp = tempfile::tempdir().unwrap();
        let (sender, _) = pair(tmp.path());

        let err = sender.send(999_999, b"x", "").await.unwrap_err();
        assert!(matches!(err, Error::RecipientNotFound(999_999)));
    }

    #[tokio::test]
    async fn test_send_to_dead_port_gives_up() {
        let tmp = tempfile::tempdir().unwrap();
        let (sender, _) = pair(tmp.path());

        // Grab a free port, then release it so nothing listens there.
        let port = {
            let l = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            l.local_addr().unwrap().port()
        };
        sender.inner.discovery.record_port(4242, port).unwrap();

        let started = std::time::Instant::now();
        let err = sender.send(4242, b"x", "").await.unwrap_err();
        assert!(err.is_transient(), "unexpected error: {err}");
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_unknown_group_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let (sender, receiver) = pair(tmp.path());
        receiver.subscribe("known").await.unwrap();

        let err = sender.send(1002, b"x", "missing").await.unwrap_err();
        match err {
            Error::Rejected { pid, message } => {
                assert_eq!(pid, 1002);
                assert_eq!(message, "group [missing] does not exist");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_pid_mismatch_rejected_connection_stays_open() {
        let tmp = tempfile::tempdir().unwrap();
        let (_, receiver) = pair(tmp.path());
        let sub = receiver.subscribe("g").await.unwrap();
        let port = receiver.port().unwrap();

        let stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        let mut conn = Framed::new(stream, message::frame_codec(1024 * 1024));

        let wrong = MessageRequest {
            send_pid: 1,
            recv_pid: 777,
            group: "g".to_string(),
            data: Vec::new(),
        };
        conn.send(message::encode(&wrong).unwrap()).await.unwrap();
        let resp: MessageResponse = message::decode(&conn.next().await.unwrap().unwrap()).unwrap();
        assert!(!resp.is_ok());
        assert_eq!(resp.message, "receiver pid not match, target: 777, current: 1002");

        let right = MessageRequest {
            recv_pid: 1002,
            ..wrong
        };
        conn.send(message::encode(&right).unwrap()).await.unwrap();
        let resp: MessageResponse = message::decode(&conn.next().await.unwrap().unwrap()).unwrap();
        assert!(resp.is_ok());
        assert_eq!(sub.recv().await.unwrap().send_pid, 1);
    }

    #[tokio::test]
    async fn test_empty_and_garbage_frames() {
        let tmp = tempfile::tempdir().unwrap();
        let (_, receiver) = pair(tmp.path());
        let port = receiver.listen().await.unwrap();

        let stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        let mut conn = Framed::new(stream, message::frame_codec(1024 * 1024));

        conn.send(Bytes::new()).await.unwrap();
        let resp: MessageResponse = message::decode(&conn.next().await.unwrap().unwrap()).unwrap();
        assert_eq!(resp.message, "empty package");

        conn.send(Bytes::from_static(b"{not json")).await.unwrap();
        let resp: MessageResponse = message::decode(&conn.next().await.unwrap().unwrap()).unwrap();
        assert!(!resp.is_ok());
        assert!(conn.next().await.is_none(), "connection should close after a decode failure");
    }

    #[tokio::test]
    async fn test_concurrent_sends_no_loss_no_duplication() {
        let tmp = tempfile::tempdir().unwrap();
        let (sender, receiver) = pair(tmp.path());
        let sub = receiver.subscribe("bulk").await.unwrap();

        let mut sends = tokio::task::JoinSet::new();
        for n in 0u32..50 {
            let sender = sender.clone();
            sends.spawn(async move { sender.send(1002, &n.to_be_bytes(), "bulk").await });
        }
        while let Some(result) = sends.join_next().await {
            result.unwrap().unwrap();
        }

        let mut seen = HashSet::new();
        for _ in 0..50 {
            let msg = sub.recv().await.unwrap();
            assert_eq!(msg.group, "bulk");
            assert!(seen.insert(msg.data), "duplicate delivery");
        }
        assert_eq!(sub.pending(), 0);
    }

    #[tokio::test]
    async fn test_groups_are_isolated() {
        let tmp = tempfile::tempdir().unwrap();
        let (sender, receiver) = pair(tmp.path());
        let a = receiver.subscribe("a").await.unwrap();
        let b = receiver.subscribe("b").await.unwrap();

        sender.send(1002, b"for-b", "b").await.unwrap();
        sender.send(1002, b"for-a", "a").await.unwrap();

        assert_eq!(a.recv().await.unwrap().data, b"for-a");
        assert_eq!(b.recv().await.unwrap().data, b"for-b");
    }

    #[tokio::test]
    async fn test_listen_single_winner() {
        let tmp = tempfile::tempdir().unwrap();
        let (_, receiver) = pair(tmp.path());

        let mut starts = tokio::task::JoinSet::new();
        for _ in 0..8 {
            let receiver = receiver.clone();
            starts.spawn(async move { receiver.listen().await.unwrap() });
        }
        let mut ports = HashSet::new();
        while let Some(port) = starts.join_next().await {
            ports.insert(port.unwrap());
        }
        assert_eq!(ports.len(), 1);
        assert_eq!(receiver.port(), ports.into_iter().next());
    }

    #[tokio::test]
    async fn test_listen_failure_leaves_gate_open() {
        let tmp = tempfile::tempdir().unwrap();
        let blocked = tmp.path().join("blocked");
        std::fs::write(&blocked, b"").unwrap();
        let discovery = Arc::new(DiscoveryStore::new(&DiscoveryConfig::in_dir(
            blocked.join("ports"),
        )));
        let transport = Transport::new(5, discovery, TransportConfig::default());

        assert!(matches!(
            transport.listen().await.unwrap_err(),
            Error::DiscoveryUnavailable { .. }
        ));
        assert!(transport.port().is_none());
    }

    #[tokio::test]
    async fn test_shutdown_stops_listener() {
        let tmp = tempfile::tempdir().unwrap();
        let (sender, receiver) = pair(tmp.path());
        receiver.subscribe("").await.unwrap();
        receiver.shutdown().await;

        assert!(sender.send(1002, b"late", "").await.is_err());
    }

    #[tokio::test]
    async fn test_shutdown_with_push_blocked_on_full_queue() {
        let tmp = tempfile::tempdir().unwrap();
        let discovery = Arc::new(DiscoveryStore::new(&DiscoveryConfig::in_dir(tmp.path())));
        let config = TransportConfig {
            queue_capacity: 1,
            ..TransportConfig::default()
        };
        let sender = Transport::new(1001, Arc::clone(&discovery), config.clone());
        let receiver = Transport::new(1002, discovery, config);

        let sub = receiver.subscribe("full").await.unwrap();
        sender.send(1002, b"first", "full").await.unwrap();
        assert_eq!(sub.pending(), 1);

        let blocked = tokio::spawn({
            let sender = sender.clone();
            async move { sender.send(1002, b"second", "full").await }
        });
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!blocked.is_finished());

        tokio::time::timeout(Duration::from_secs(3), receiver.shutdown())
            .await
            .expect("shutdown should not wait on a blocked push");
        // The sender sees the connection drop; only completion matters here.
        let _ = tokio::time::timeout(Duration::from_secs(3), blocked)
            .await
            .expect("blocked sender should finish once the receiver shuts down");
        assert_eq!(sub.pending(), 1);
    }
}
