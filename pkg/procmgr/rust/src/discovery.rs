// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

//! pid -> port records shared by every process on the host.
//!
//! One file per pid, named after the pid, holding the decimal port of that
//! process's message listener. Files are never removed: a reused pid resolves
//! to the old port until its new owner records its own.

use log::{debug, info, warn};
use std::collections::HashMap;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock};
use std::time::{Duration, Instant};

use crate::config::DiscoveryConfig;
use crate::error::{Error, Result};

#[derive(Debug)]
pub struct DiscoveryStore {
    candidates: Vec<PathBuf>,
    cache_ttl: Duration,
    dir: OnceLock<Option<PathBuf>>,
    cache: Mutex<HashMap<u32, (u16, Instant)>>,
}

impl DiscoveryStore {
    pub fn new(config: &DiscoveryConfig) -> Self {
        Self {
            candidates: config.candidates(),
            cache_ttl: config.cache_ttl(),
            dir: OnceLock::new(),
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// The directory records live in. Resolved on first use and fixed afterwards.
    pub fn dir(&self) -> Result<&Path> {
        self.dir
            .get_or_init(|| resolve_dir(&self.candidates))
            .as_deref()
            .ok_or_else(|| Error::DiscoveryUnavailable {
                candidates: self.candidates.clone(),
            })
    }

    pub fn record_port(&self, pid: u32, port: u16) -> Result<()> {
        let dir = self.dir()?;
        let path = dir.join(pid.to_string());
        let tmp = dir.join(format!(".{pid}.tmp-{}", std::process::id()));

        let mut file = fs::File::create(&tmp)?;
        file.write_all(port.to_string().as_bytes())?;
        file.sync_all()?;
        drop(file);
        if let Err(e) = fs::rename(&tmp, &path) {
            let _ = fs::remove_file(&tmp);
            return Err(e.into());
        }

        self.lock_cache().remove(&pid);
        debug!("recorded port {port} for pid {pid} in {}", path.display());
        Ok(())
    }

    /// Port recorded for `pid`, `None` when nothing usable is on disk.
    pub fn lookup_port(&self, pid: u32) -> Result<Option<u16>> {
        if let Some(&(port, at)) = self.lock_cache().get(&pid)
            && at.elapsed() < self.cache_ttl
        {
            return Ok(Some(port));
        }

        let path = self.dir()?.join(pid.to_string());
        let contents = match fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        match contents.trim().parse::<u16>() {
            Ok(port) if port > 0 => {
                self.lock_cache().insert(pid, (port, Instant::now()));
                Ok(Some(port))
            }
            _ => {
                warn!(
                    "ignoring malformed discovery record {}: {contents:?}",
                    path.display()
                );
                Ok(None)
            }
        }
    }

    fn lock_cache(&self) -> std::sync::MutexGuard<'_, HashMap<u32, (u16, Instant)>> {
        self.cache
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn resolve_dir(candidates: &[PathBuf]) -> Option<PathBuf> {
    for dir in candidates {
        match check_writable(dir) {
            Ok(()) => {
                info!("discovery directory: {}", dir.display());
                return Some(dir.clone());
            }
            Err(e) => debug!("discovery candidate {} unusable: {e}", dir.display()),
        }
    }
    warn!("no usable discovery directory among {candidates:?}");
    None
}

fn check_writable(dir: &Path) -> io::Result<()> {
    fs::create_dir_all(dir)?;
    let marker = dir.join(format!(".writable-{}", std::process::id()));
    fs::write(&marker, b"")?;
    fs::remove_file(&marker)
}
