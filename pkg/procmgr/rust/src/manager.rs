// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

//! pid -> process registry with bulk operations.
//!
//! Bulk operations work on a snapshot taken when they start: processes added
//! or removed while one runs are not seen by it, and no lock is held while
//! the per-process work happens.

use log::{debug, info, warn};
use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::error::Result;
use crate::message::DEFAULT_GROUP;
use crate::process::Process;
use crate::runtime::Runtime;
use crate::signal::Signal;

#[derive(Debug, Clone)]
pub struct ProcessManager {
    runtime: Runtime,
    shared: Arc<ManagerShared>,
}

#[derive(Debug, Default)]
pub(crate) struct ManagerShared {
    processes: RwLock<HashMap<u32, Process>>,
}

impl ManagerShared {
    pub(crate) fn insert(&self, pid: u32, process: Process) {
        let mut processes = self.write();
        if let Some(previous) = processes.get(&pid)
            && !previous.same_as(&process)
        {
            debug!("pid {pid} re-registered, replacing the previous handle");
        }
        processes.insert(pid, process);
    }

    /// Drop the entry for `pid` if it still belongs to `process`.
    pub(crate) fn remove_if_same(&self, pid: u32, process: &Process) {
        let mut processes = self.write();
        if processes.get(&pid).is_some_and(|p| p.same_as(process)) {
            processes.remove(&pid);
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<u32, Process>> {
        self.processes
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<u32, Process>> {
        self.processes
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl ProcessManager {
    pub fn new(runtime: &Runtime) -> Self {
        Self {
            runtime: runtime.clone(),
            shared: Arc::new(ManagerShared::default()),
        }
    }

    pub fn runtime(&self) -> &Runtime {
        &self.runtime
    }

    /// A new process owned by this manager. It is registered once started.
    pub fn new_process<A, S>(
        &self,
        path: impl Into<String>,
        args: A,
        env: &[(String, String)],
    ) -> Process
    where
        A: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let process = Process::new(&self.runtime, path, args, env);
        process.attach(Arc::downgrade(&self.shared));
        process
    }

    /// Take ownership of an existing handle. Started handles are registered
    /// right away, others when they start.
    pub fn add_process(&self, process: &Process) {
        process.attach(Arc::downgrade(&self.shared));
        if let Some(pid) = process.pid() {
            self.shared.insert(pid, process.clone());
        }
    }

    pub fn get_process(&self, pid: u32) -> Option<Process> {
        self.shared.read().get(&pid).cloned()
    }

    /// Forget `pid`. The process itself keeps running.
    pub fn remove_process(&self, pid: u32) -> Option<Process> {
        self.shared.write().remove(&pid)
    }

    pub fn processes(&self) -> Vec<Process> {
        self.shared.read().values().cloned().collect()
    }

    pub fn pids(&self) -> Vec<u32> {
        let mut pids: Vec<u32> = self.shared.read().keys().copied().collect();
        pids.sort_unstable();
        pids
    }

    pub fn size(&self) -> usize {
        self.shared.read().len()
    }

    /// Forget every process without touching them.
    pub fn clear(&self) {
        self.shared.write().clear();
    }

    /// Wait for every registered process to exit.
    pub async fn wait_all(&self) {
        for process in self.processes() {
            if let Err(e) = process.wait().await {
                debug!("[{}] wait: {e}", process.path());
            }
        }
    }

    /// Kill every registered process. All are attempted; the first error is returned.
    pub fn kill_all(&self) -> Result<()> {
        let snapshot = self.processes();
        info!("killing {} managed process(es)", snapshot.len());
        first_error(snapshot.iter().map(Process::kill))
    }

    /// Send `sig` to every registered process. All are attempted; the first
    /// error is returned.
    pub fn signal_all(&self, sig: Signal) -> Result<()> {
        let snapshot = self.processes();
        debug!("sending {sig} to {} managed process(es)", snapshot.len());
        first_error(snapshot.iter().map(|p| p.signal(sig)))
    }

    /// Send `data` to every registered process. Failures are logged, not returned.
    pub async fn send(&self, data: &[u8]) {
        for process in self.processes() {
            if let Err(e) = process.send(data).await {
                warn!("[{}] message delivery failed: {e}", process.path());
            }
        }
    }

    /// Send `data` to any process by pid, managed or not.
    pub async fn send_to(&self, pid: u32, data: &[u8]) -> Result<()> {
        self.runtime.send(pid, data, DEFAULT_GROUP).await
    }
}

fn first_error(results: impl Iterator<Item = Result<()>>) -> Result<()> {
    let mut first = Ok(());
    for result in results {
        if let Err(e) = result {
            warn!("bulk operation: {e}");
            if first.is_ok() {
                first = Err(e);
            }
        }
    }
    first
}
