// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

//! Logical parent tracking through the process environment.
//!
//! A supervisor stamps `DD_PROCSUP_PPID` on every child it starts. The value
//! survives graceful reloads, so a reloaded process still reports the original
//! supervisor as its parent even though the OS parent is the previous image.

/// Env var carrying the logical parent pid.
pub const PPID_ENV: &str = "DD_PROCSUP_PPID";

/// Parse a logical parent pid value. Empty, zero and garbage all mean "unset".
pub fn parse_ppid(value: &str) -> Option<u32> {
    match value.trim().parse::<u32>() {
        Ok(0) | Err(_) => None,
        Ok(pid) => Some(pid),
    }
}

/// Logical parent pid of the current process, if one was injected.
pub fn logical_ppid() -> Option<u32> {
    std::env::var(PPID_ENV).ok().as_deref().and_then(parse_ppid)
}

/// Snapshot of the current environment with `extra` appended, later entries
/// overriding earlier ones when keys repeat.
pub fn inherited_environment(extra: &[(String, String)]) -> Vec<(String, String)> {
    let mut env: Vec<(String, String)> = std::env::vars().collect();
    for (key, value) in extra {
        env.retain(|(k, _)| k != key);
        env.push((key.clone(), value.clone()));
    }
    env
}
