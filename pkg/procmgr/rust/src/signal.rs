// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

//! Process-wide signal to handler registry.
//!
//! Handlers are grouped per signal and run as one concurrent batch each time
//! that signal arrives. The batch is a barrier: the next signal is only taken
//! once every handler of the current one has returned. A shutdown signal ends
//! `listen` once its batch is done.

use async_trait::async_trait;
use futures::future::BoxFuture;
use log::{debug, error, info};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::JoinSet;

use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Signal {
    Interrupt,
    Quit,
    Kill,
    Terminate,
    Abort,
    Hangup,
    User1,
    User2,
}

impl Signal {
    /// Signals that end `SignalDispatcher::listen`.
    pub const SHUTDOWN: [Signal; 5] = [
        Signal::Interrupt,
        Signal::Quit,
        Signal::Kill,
        Signal::Terminate,
        Signal::Abort,
    ];

    pub fn is_shutdown(self) -> bool {
        Self::SHUTDOWN.contains(&self)
    }

    /// SIGKILL can be sent but never observed by the receiving process.
    pub fn is_catchable(self) -> bool {
        self != Signal::Kill
    }
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Signal::Interrupt => "SIGINT",
            Signal::Quit => "SIGQUIT",
            Signal::Kill => "SIGKILL",
            Signal::Terminate => "SIGTERM",
            Signal::Abort => "SIGABRT",
            Signal::Hangup => "SIGHUP",
            Signal::User1 => "SIGUSR1",
            Signal::User2 => "SIGUSR2",
        };
        f.write_str(name)
    }
}

/// Something that delivers signals to the dispatcher: the OS, or a test channel.
#[async_trait]
pub trait SignalSource: Send {
    /// Start delivery for `signals`. Called once, before the first `recv`.
    fn subscribe(&mut self, signals: &[Signal]) -> Result<()>;

    /// Next delivered signal, `None` once the source is closed.
    async fn recv(&mut self) -> Option<Signal>;
}

/// A source fed by hand through an mpsc channel.
pub struct ChannelSource {
    rx: mpsc::Receiver<Signal>,
}

impl ChannelSource {
    pub fn new(buffer: usize) -> (mpsc::Sender<Signal>, Self) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        (tx, Self { rx })
    }
}

#[async_trait]
impl SignalSource for ChannelSource {
    fn subscribe(&mut self, _signals: &[Signal]) -> Result<()> {
        Ok(())
    }

    async fn recv(&mut self) -> Option<Signal> {
        self.rx.recv().await
    }
}

#[async_trait]
impl SignalSource for Box<dyn SignalSource> {
    fn subscribe(&mut self, signals: &[Signal]) -> Result<()> {
        (**self).subscribe(signals)
    }

    async fn recv(&mut self) -> Option<Signal> {
        (**self).recv().await
    }
}

pub trait SignalHandler: Send + Sync + 'static {
    fn handle(&self, sig: Signal) -> BoxFuture<'static, ()>;
}

impl<F, Fut> SignalHandler for F
where
    F: Fn(Signal) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    fn handle(&self, sig: Signal) -> BoxFuture<'static, ()> {
        Box::pin((self)(sig))
    }
}

#[derive(Clone, Default)]
pub struct SignalDispatcher {
    handlers: Arc<Mutex<HashMap<Signal, Vec<Arc<dyn SignalHandler>>>>>,
}

impl SignalDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `handler` to each of `signals`. Handlers are never removed.
    pub fn add_handler<H: SignalHandler>(&self, handler: H, signals: &[Signal]) {
        let handler: Arc<dyn SignalHandler> = Arc::new(handler);
        let mut map = self.lock();
        for sig in signals {
            map.entry(*sig).or_default().push(Arc::clone(&handler));
        }
    }

    /// Register `handler` for every shutdown signal.
    pub fn add_shutdown_handler<H: SignalHandler>(&self, handler: H) {
        self.add_handler(handler, &Signal::SHUTDOWN);
    }

    pub fn handler_count(&self, sig: Signal) -> usize {
        self.lock().get(&sig).map_or(0, Vec::len)
    }

    /// Signals that currently have at least one handler.
    pub fn registered_signals(&self) -> Vec<Signal> {
        let map = self.lock();
        let mut signals: Vec<Signal> = map
            .iter()
            .filter(|(_, handlers)| !handlers.is_empty())
            .map(|(sig, _)| *sig)
            .collect();
        signals.sort_by_key(|s| s.to_string());
        signals
    }

    /// Block on `source`, running each received signal's handlers as one batch.
    /// Returns after the first shutdown signal's batch, or when the source closes.
    pub async fn listen<S: SignalSource>(&self, mut source: S) -> Result<()> {
        let signals = self.registered_signals();
        source.subscribe(&signals)?;
        debug!("listening for signals: {signals:?}");

        while let Some(sig) = source.recv().await {
            let handlers = self.lock().get(&sig).cloned().unwrap_or_default();
            let shutdown = sig.is_shutdown();
            info!(
                "signal received: {sig}, handler count: {}, shutdown signal: {shutdown}",
                handlers.len()
            );

            run_batch(sig, handlers).await;

            if shutdown {
                debug!("shutdown signal {sig} handled, stop listening");
                return Ok(());
            }
        }
        debug!("signal source closed, stop listening");
        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<Signal, Vec<Arc<dyn SignalHandler>>>> {
        self.handlers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

async fn run_batch(sig: Signal, handlers: Vec<Arc<dyn SignalHandler>>) {
    let mut batch = JoinSet::new();
    for handler in handlers {
        batch.spawn(handler.handle(sig));
    }
    while let Some(joined) = batch.join_next().await {
        if let Err(e) = joined {
            error!("handler for {sig} failed: {e}");
        }
    }
}
