// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

//! The per-process context every component hangs off.
//!
//! One `Runtime` is built at startup and cloned into whatever needs it. It
//! owns the platform strategy, the discovery store, the message transport and
//! the signal dispatcher. Tests build one per case with their own discovery
//! directory.

use log::info;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant, SystemTime};

use crate::config::RuntimeConfig;
use crate::discovery::DiscoveryStore;
use crate::env;
use crate::error::Result;
use crate::message::MessageRequest;
use crate::platform::{self, Platform};
use crate::signal::SignalDispatcher;
use crate::transport::Transport;

#[derive(Clone)]
pub struct Runtime {
    inner: Arc<Inner>,
}

struct Inner {
    pid: u32,
    config: RuntimeConfig,
    platform: Arc<dyn Platform>,
    discovery: Arc<DiscoveryStore>,
    transport: Transport,
    signals: SignalDispatcher,
    /// `set_ppid` override; `Some(0)` clears the logical parent.
    ppid_override: Mutex<Option<u32>>,
    start_time: SystemTime,
    started: Instant,
}

impl fmt::Debug for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("pid", &self.inner.pid)
            .field("platform", &self.inner.platform.name())
            .field("transport", &self.inner.transport)
            .finish_non_exhaustive()
    }
}

impl Runtime {
    pub fn new(config: RuntimeConfig) -> Self {
        Self::with_platform(config, platform::current())
    }

    pub fn with_platform(config: RuntimeConfig, platform: Arc<dyn Platform>) -> Self {
        let pid = std::process::id();
        let discovery = Arc::new(DiscoveryStore::new(&config.discovery));
        let transport = Transport::new(pid, Arc::clone(&discovery), config.transport.clone());
        Self {
            inner: Arc::new(Inner {
                pid,
                config,
                platform,
                discovery,
                transport,
                signals: SignalDispatcher::new(),
                ppid_override: Mutex::new(None),
                start_time: SystemTime::now(),
                started: Instant::now(),
            }),
        }
    }

    /// Runtime configured from `DD_PROCSUP_CONFIG` and env overrides.
    pub fn from_env() -> anyhow::Result<Self> {
        Ok(Self::new(RuntimeConfig::from_env()?))
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.inner.config
    }

    pub fn platform(&self) -> &Arc<dyn Platform> {
        &self.inner.platform
    }

    pub fn discovery(&self) -> &DiscoveryStore {
        &self.inner.discovery
    }

    pub fn transport(&self) -> &Transport {
        &self.inner.transport
    }

    pub fn signals(&self) -> &SignalDispatcher {
        &self.inner.signals
    }

    pub fn pid(&self) -> u32 {
        self.inner.pid
    }

    /// Logical parent: the supervisor that started this process lineage,
    /// falling back to the OS parent.
    pub fn ppid(&self) -> u32 {
        self.logical_ppid().unwrap_or_else(|| self.ppid_os())
    }

    pub fn ppid_os(&self) -> u32 {
        self.inner.platform.parent_pid()
    }

    /// Whether this process was started by a supervisor.
    pub fn is_child(&self) -> bool {
        self.logical_ppid().is_some()
    }

    /// Override (`pid > 0`) or clear (`pid == 0`) the logical parent. The
    /// process environment is left untouched.
    pub fn set_ppid(&self, pid: u32) {
        *self.lock_ppid_override() = Some(pid);
    }

    pub fn start_time(&self) -> SystemTime {
        self.inner.start_time
    }

    pub fn uptime(&self) -> Duration {
        self.inner.started.elapsed()
    }

    pub async fn send(&self, pid: u32, data: &[u8], group: &str) -> Result<()> {
        self.inner.transport.send(pid, data, group).await
    }

    pub async fn receive(&self, group: &str) -> Result<MessageRequest> {
        self.inner.transport.receive(group).await
    }

    /// Run the signal dispatcher against OS signal delivery.
    pub async fn listen_signals(&self) -> Result<()> {
        let source = self.inner.platform.signal_source();
        self.inner.signals.listen(source).await
    }

    /// Tear down background work. Discovery records stay on disk.
    pub async fn shutdown(&self) {
        self.inner.transport.shutdown().await;
        info!(
            "runtime of pid {} shut down after {:?}",
            self.inner.pid,
            self.uptime()
        );
    }

    fn logical_ppid(&self) -> Option<u32> {
        match *self.lock_ppid_override() {
            Some(0) => None,
            Some(pid) => Some(pid),
            None => env::logical_ppid(),
        }
    }

    fn lock_ppid_override(&self) -> MutexGuard<'_, Option<u32>> {
        self.inner
            .ppid_override
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
