// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-memory element store.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::element::{Element, ElementStatus};
use crate::error::{QueueError, Result};

use super::{Change, ElementFilter, QueueBackend, QueueDb};

#[derive(Default)]
struct State {
    inbox: HashMap<String, Element>,
    queue: HashMap<String, Element>,
    next_sequence: u64,
    last_change: u64,
    changes: Vec<(DateTime<Utc>, Change)>,
}

impl State {
    fn collection(&mut self, db: QueueDb) -> &mut HashMap<String, Element> {
        match db {
            QueueDb::Inbox => &mut self.inbox,
            QueueDb::Queue => &mut self.queue,
        }
    }

    fn record(&mut self, db: QueueDb, element_id: &str, status: Option<ElementStatus>) {
        self.last_change += 1;
        let change = Change {
            seq: self.last_change,
            db,
            element_id: element_id.to_string(),
            status,
        };
        self.changes.push((Utc::now(), change));
    }
}

/// Element store held in process memory. Cloning shares the store.
#[derive(Clone, Default)]
pub struct MemoryBackend {
    state: Arc<Mutex<State>>,
}

impl MemoryBackend {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl QueueBackend for MemoryBackend {
    async fn insert_elements(&self, db: QueueDb, elements: Vec<Element>) -> Result<Vec<String>> {
        let mut state = self.state.lock().await;
        let mut inserted = Vec::new();
        for mut element in elements {
            if state.collection(db).contains_key(&element.id) {
                continue;
            }
            state.next_sequence += 1;
            element.sequence = state.next_sequence;
            element.revision = 1;
            state.record(db, &element.id, Some(element.status));
            inserted.push(element.id.clone());
            state.collection(db).insert(element.id.clone(), element);
        }
        Ok(inserted)
    }

    async fn get_element(&self, db: QueueDb, id: &str) -> Result<Option<Element>> {
        let mut state = self.state.lock().await;
        Ok(state.collection(db).get(id).cloned())
    }

    async fn list_elements(&self, db: QueueDb, filter: &ElementFilter) -> Result<Vec<Element>> {
        let mut state = self.state.lock().await;
        let mut elements: Vec<Element> = state
            .collection(db)
            .values()
            .filter(|e| filter.matches(e))
            .cloned()
            .collect();
        elements.sort_by_key(|e| e.sequence);
        Ok(elements)
    }

    async fn update_element(&self, db: QueueDb, element: &Element) -> Result<bool> {
        let mut state = self.state.lock().await;
        let Some(stored) = state.collection(db).get_mut(&element.id) else {
            return Err(QueueError::ElementNotFound {
                element_id: element.id.clone(),
            });
        };
        if stored.revision != element.revision {
            return Ok(false);
        }
        let mut updated = element.clone();
        updated.sequence = stored.sequence;
        updated.revision = stored.revision + 1;
        *stored = updated.clone();
        state.record(db, &updated.id, Some(updated.status));
        Ok(true)
    }

    async fn delete_elements(&self, db: QueueDb, ids: &[String]) -> Result<u64> {
        let mut state = self.state.lock().await;
        let mut deleted = 0;
        for id in ids {
            if state.collection(db).remove(id).is_some() {
                deleted += 1;
                state.record(db, id, None);
            }
        }
        Ok(deleted)
    }

    async fn poll_changes(&self, since: u64, limit: u32) -> Result<(Vec<Change>, u64)> {
        let state = self.state.lock().await;
        let changes: Vec<Change> = state
            .changes
            .iter()
            .map(|(_, change)| change)
            .filter(|change| change.seq > since)
            .take(limit as usize)
            .cloned()
            .collect();
        let next = changes.last().map(|c| c.seq).unwrap_or(since);
        Ok((changes, next))
    }

    async fn prune_changes(&self, before: DateTime<Utc>) -> Result<u64> {
        let mut state = self.state.lock().await;
        let count = state.changes.len();
        state.changes.retain(|(at, _)| *at >= before);
        Ok((count - state.changes.len()) as u64)
    }

    async fn health_check(&self) -> Result<()> {
        Ok(())
    }
}
