// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tokio::sync::{Mutex, mpsc};

use crate::message::MessageRequest;

/// Bounded FIFO for one group. Clones share the same queue; concurrent
/// consumers compete for messages.
#[derive(Debug, Clone)]
pub struct GroupQueue {
    tx: mpsc::Sender<MessageRequest>,
    rx: Arc<Mutex<mpsc::Receiver<MessageRequest>>>,
}

impl GroupQueue {
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        Self {
            tx,
            rx: Arc::new(Mutex::new(rx)),
        }
    }

    /// Waits while the queue is full.
    pub async fn push(&self, msg: MessageRequest) {
        // The receiver lives as long as any clone of self, so this cannot fail.
        let _ = self.tx.send(msg).await;
    }

    /// Waits until a message is available.
    pub async fn pop(&self) -> Option<MessageRequest> {
        self.rx.lock().await.recv().await
    }

    pub fn len(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// group name -> queue. Queues are created once and never dropped.
#[derive(Debug)]
pub(crate) struct GroupRegistry {
    capacity: usize,
    groups: RwLock<HashMap<String, GroupQueue>>,
}

impl GroupRegistry {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            capacity,
            groups: RwLock::new(HashMap::new()),
        }
    }

    pub(crate) fn get(&self, group: &str) -> Option<GroupQueue> {
        self.groups
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(group)
            .cloned()
    }

    pub(crate) fn get_or_create(&self, group: &str) -> GroupQueue {
        if let Some(queue) = self.get(group) {
            return queue;
        }
        let mut groups = self
            .groups
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        groups
            .entry(group.to_string())
            .or_insert_with(|| GroupQueue::new(self.capacity))
            .clone()
    }

    pub(crate) fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .groups
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }
}
