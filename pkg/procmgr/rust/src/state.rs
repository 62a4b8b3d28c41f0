// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use std::fmt;

/// Lifecycle of one process handle. There is no way back: a new OS process
/// needs a new handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    /// Handle built, `start` not called yet.
    NotStarted,
    /// Child process is alive.
    Running,
    /// Death observed through `wait` or `kill`.
    Exited,
}

impl ProcessState {
    pub fn is_alive(self) -> bool {
        self == ProcessState::Running
    }

    pub(crate) fn can_transition_to(self, next: ProcessState) -> bool {
        use ProcessState::*;
        matches!((self, next), (NotStarted, Running) | (Running, Exited))
    }
}

impl fmt::Display for ProcessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProcessState::NotStarted => write!(f, "not-started"),
            ProcessState::Running => write!(f, "running"),
            ProcessState::Exited => write!(f, "exited"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forward_transitions_only() {
        use ProcessState::*;
        assert!(NotStarted.can_transition_to(Running));
        assert!(Running.can_transition_to(Exited));

        assert!(!Running.can_transition_to(NotStarted));
        assert!(!Exited.can_transition_to(Running));
        assert!(!Exited.can_transition_to(NotStarted));
        assert!(!NotStarted.can_transition_to(Exited));
    }

    #[test]
    fn test_is_alive() {
        assert!(ProcessState::Running.is_alive());
        assert!(!ProcessState::NotStarted.is_alive());
        assert!(!ProcessState::Exited.is_alive());
    }

    #[test]
    fn test_display() {
        assert_eq!(ProcessState::NotStarted.to_string(), "not-started");
        assert_eq!(ProcessState::Running.to_string(), "running");
        assert_eq!(ProcessState::Exited.to_string(), "exited");
    }
}
