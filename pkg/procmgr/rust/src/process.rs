// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use log::{debug, info, warn};
use std::fmt;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tokio::process::{Child, ChildStderr, ChildStdout, Command};

use crate::env::{self, PPID_ENV};
use crate::error::{Error, Result};
use crate::manager::ManagerShared;
use crate::message::DEFAULT_GROUP;
use crate::runtime::Runtime;
use crate::signal::Signal;
use crate::state::ProcessState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StdioMode {
    #[default]
    Inherit,
    Null,
    Piped,
}

impl StdioMode {
    fn to_stdio(self) -> Stdio {
        match self {
            StdioMode::Inherit => Stdio::inherit(),
            StdioMode::Null => Stdio::null(),
            StdioMode::Piped => Stdio::piped(),
        }
    }
}

/// Handle to one child OS process. Clones share the same process.
#[derive(Clone)]
pub struct Process {
    inner: Arc<Inner>,
}

struct Inner {
    runtime: Runtime,
    path: String,
    args: Vec<String>,
    launch: Mutex<Launch>,
    status: Mutex<Status>,
    child: tokio::sync::Mutex<Option<Child>>,
    manager: Mutex<Option<Weak<ManagerShared>>>,
}

#[derive(Debug, Clone)]
struct Launch {
    env: Vec<(String, String)>,
    current_dir: Option<PathBuf>,
    stdin: StdioMode,
    stdout: StdioMode,
    stderr: StdioMode,
    extra_fds: Vec<i32>,
    ppid: u32,
}

struct Status {
    state: ProcessState,
    pid: Option<u32>,
    exit: Option<ExitStatus>,
    stdout: Option<ChildStdout>,
    stderr: Option<ChildStderr>,
}

impl fmt::Debug for Process {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let status = self.lock_status();
        f.debug_struct("Process")
            .field("path", &self.inner.path)
            .field("args", &self.inner.args)
            .field("pid", &status.pid)
            .field("state", &status.state)
            .finish_non_exhaustive()
    }
}

impl Process {
    /// A not yet started process running `path` with `args`, in a copy of
    /// the current environment plus `env`. A leading `args[0]` equal to
    /// `path` is dropped.
    pub fn new<A, S>(
        runtime: &Runtime,
        path: impl Into<String>,
        args: A,
        env: &[(String, String)],
    ) -> Self
    where
        A: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let path = path.into();
        let mut args: Vec<String> = args.into_iter().map(Into::into).collect();
        if args.first() == Some(&path) {
            args.remove(0);
        }
        Self {
            inner: Arc::new(Inner {
                path,
                args,
                launch: Mutex::new(Launch {
                    env: env::inherited_environment(env),
                    current_dir: None,
                    stdin: StdioMode::Inherit,
                    stdout: StdioMode::Inherit,
                    stderr: StdioMode::Inherit,
                    extra_fds: Vec::new(),
                    ppid: runtime.pid(),
                }),
                status: Mutex::new(Status {
                    state: ProcessState::NotStarted,
                    pid: None,
                    exit: None,
                    stdout: None,
                    stderr: None,
                }),
                child: tokio::sync::Mutex::new(None),
                manager: Mutex::new(None),
                runtime: runtime.clone(),
            }),
        }
    }

    pub fn path(&self) -> &str {
        &self.inner.path
    }

    pub fn args(&self) -> &[String] {
        &self.inner.args
    }

    /// Environment the child gets, minus the logical parent variable added at start.
    pub fn environment(&self) -> Vec<(String, String)> {
        self.lock_launch().env.clone()
    }

    // Launch settings below only affect a process that has not started yet.

    pub fn env(&self, key: impl Into<String>, value: impl Into<String>) -> &Self {
        let (key, value) = (key.into(), value.into());
        let mut launch = self.lock_launch();
        launch.env.retain(|(k, _)| *k != key);
        launch.env.push((key, value));
        self
    }

    pub fn current_dir(&self, dir: impl Into<PathBuf>) -> &Self {
        self.lock_launch().current_dir = Some(dir.into());
        self
    }

    pub fn stdin(&self, mode: StdioMode) -> &Self {
        self.lock_launch().stdin = mode;
        self
    }

    pub fn stdout(&self, mode: StdioMode) -> &Self {
        self.lock_launch().stdout = mode;
        self
    }

    pub fn stderr(&self, mode: StdioMode) -> &Self {
        self.lock_launch().stderr = mode;
        self
    }

    /// Pass `fd` to the child. The n-th inherited fd shows up as fd `3 + n`.
    pub fn inherit_fd(&self, fd: i32) -> &Self {
        self.lock_launch().extra_fds.push(fd);
        self
    }

    /// Logical parent pid the child will see. Defaults to the current pid.
    pub fn set_ppid(&self, ppid: u32) -> &Self {
        self.lock_launch().ppid = ppid;
        self
    }

    pub fn ppid(&self) -> u32 {
        self.lock_launch().ppid
    }

    /// OS pid, once started.
    pub fn pid(&self) -> Option<u32> {
        self.lock_status().pid
    }

    pub fn state(&self) -> ProcessState {
        self.lock_status().state
    }

    /// Spawn the child. Starting again returns the pid of the first start.
    pub fn start(&self) -> Result<u32> {
        let mut status = self.lock_status();
        if let Some(pid) = status.pid {
            debug!("[{}] already started (pid={pid})", self.inner.path);
            return Ok(pid);
        }
        let mut slot = self
            .inner
            .child
            .try_lock()
            .map_err(|_| Error::InvalidOperation("process is being waited on"))?;

        let launch = self.lock_launch().clone();
        let mut cmd = Command::new(&self.inner.path);
        cmd.args(&self.inner.args)
            .env_clear()
            .envs(launch.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .env(PPID_ENV, launch.ppid.to_string())
            .stdin(launch.stdin.to_stdio())
            .stdout(launch.stdout.to_stdio())
            .stderr(launch.stderr.to_stdio());
        if let Some(ref dir) = launch.current_dir {
            cmd.current_dir(dir);
        }

        let spawn_error = |source| Error::Spawn {
            path: self.inner.path.clone(),
            source,
        };
        self.inner
            .runtime
            .platform()
            .inherit_fds(&mut cmd, &launch.extra_fds)
            .map_err(spawn_error)?;
        let mut child = cmd.spawn().map_err(spawn_error)?;
        let pid = child.id().ok_or_else(|| {
            spawn_error(std::io::Error::other("child exited before its pid was read"))
        })?;

        status.stdout = child.stdout.take();
        status.stderr = child.stderr.take();
        *slot = Some(child);
        drop(slot);
        self.transition(&mut status, ProcessState::Running);
        status.pid = Some(pid);
        drop(status);

        info!(
            "[{}] spawned (pid={pid}, ppid={}, args={:?})",
            self.inner.path, launch.ppid, self.inner.args
        );
        if let Some(manager) = self.manager() {
            manager.insert(pid, self.clone());
        }
        Ok(pid)
    }

    /// Wait for the child to exit. A non-zero exit is reported as `Error::Exited`.
    pub async fn wait(&self) -> Result<ExitStatus> {
        let pid = self.pid().ok_or(Error::NotStarted)?;
        let mut slot = self.inner.child.lock().await;
        let recorded = self.lock_status().exit;
        let status = match recorded {
            Some(status) => status,
            None => {
                let child = slot.as_mut().ok_or(Error::NotStarted)?;
                let status = child.wait().await?;
                self.record_exit(status);
                status
            }
        };
        drop(slot);

        if status.success() {
            Ok(status)
        } else {
            Err(Error::Exited { pid, status })
        }
    }

    /// Start and wait.
    pub async fn run(&self) -> Result<ExitStatus> {
        self.start()?;
        self.wait().await
    }

    pub fn signal(&self, sig: Signal) -> Result<()> {
        let pid = {
            let status = self.lock_status();
            match (status.pid, status.state) {
                (None, _) => return Err(Error::NotStarted),
                (Some(_), ProcessState::Exited) => {
                    return Err(Error::InvalidOperation("process already exited"));
                }
                (Some(pid), _) => pid,
            }
        };
        self.inner
            .runtime
            .platform()
            .send_signal(pid, sig)
            .map_err(|source| Error::Signal {
                pid,
                signal: sig,
                source,
            })?;
        debug!("[{}] sent {sig} (pid={pid})", self.inner.path);
        Ok(())
    }

    /// Kill the child, reap it if it is already gone, and drop it from its
    /// manager. Only the kill itself can fail.
    pub fn kill(&self) -> Result<()> {
        let (pid, already_exited) = {
            let status = self.lock_status();
            let pid = status.pid.ok_or(Error::NotStarted)?;
            (pid, status.state == ProcessState::Exited)
        };

        if !already_exited {
            self.inner
                .runtime
                .platform()
                .send_signal(pid, Signal::Kill)
                .map_err(|source| Error::Signal {
                    pid,
                    signal: Signal::Kill,
                    source,
                })?;
            info!("[{}] killed (pid={pid})", self.inner.path);

            match self.inner.child.try_lock() {
                Ok(mut slot) => {
                    if let Some(child) = slot.as_mut() {
                        match child.try_wait() {
                            Ok(Some(status)) => self.record_exit(status),
                            Ok(None) => debug!("[{}] not reaped yet (pid={pid})", self.inner.path),
                            Err(e) => warn!("[{}] reaping pid {pid} failed: {e}", self.inner.path),
                        }
                    }
                }
                Err(_) => debug!("[{}] a waiter will reap pid {pid}", self.inner.path),
            }
            let mut status = self.lock_status();
            self.transition(&mut status, ProcessState::Exited);
        }

        if let Some(manager) = self.manager() {
            manager.remove_if_same(pid, self);
        }
        Ok(())
    }

    /// Send `data` to this process's default message group.
    pub async fn send(&self, data: &[u8]) -> Result<()> {
        self.send_to_group(data, DEFAULT_GROUP).await
    }

    pub async fn send_to_group(&self, data: &[u8], group: &str) -> Result<()> {
        let pid = self.pid().ok_or(Error::NotStarted)?;
        self.inner.runtime.send(pid, data, group).await
    }

    /// The child's stdout, when started with `StdioMode::Piped`. Only the
    /// first call gets it.
    pub fn take_stdout(&self) -> Option<ChildStdout> {
        self.lock_status().stdout.take()
    }

    pub fn take_stderr(&self) -> Option<ChildStderr> {
        self.lock_status().stderr.take()
    }

    pub(crate) fn attach(&self, manager: Weak<ManagerShared>) {
        *self
            .inner
            .manager
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(manager);
    }

    pub(crate) fn same_as(&self, other: &Process) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    fn manager(&self) -> Option<Arc<ManagerShared>> {
        self.inner
            .manager
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .as_ref()
            .and_then(Weak::upgrade)
    }

    fn record_exit(&self, exit: ExitStatus) {
        let mut status = self.lock_status();
        status.exit = Some(exit);
        self.transition(&mut status, ProcessState::Exited);
        info!("[{}] exited with {exit}", self.inner.path);
    }

    fn transition(&self, status: &mut Status, next: ProcessState) {
        if status.state.can_transition_to(next) {
            status.state = next;
        }
    }

    fn lock_launch(&self) -> MutexGuard<'_, Launch> {
        self.inner
            .launch
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_status(&self) -> MutexGuard<'_, Status> {
        self.inner
            .status
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
