// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Persistence interfaces and backends for the element store.
//!
//! Every backend offers insert-if-absent, revision-checked updates (the
//! compare-and-swap used for claims), filtered queries and a change feed.

pub mod memory;
pub mod sqlite;

pub use self::memory::MemoryBackend;
pub use self::sqlite::SqliteBackend;

use std::collections::BTreeSet;
use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::element::{Element, ElementStatus};
use crate::error::Result;

/// The two element collections of a queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum QueueDb {
    /// Elements received: whole requests, or elements pulled from a parent queue.
    Inbox,
    /// Elements split from inbox elements, offered to downstream consumers.
    Queue,
}

impl QueueDb {
    /// Collection name as stored.
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueDb::Inbox => "inbox",
            QueueDb::Queue => "queue",
        }
    }
}

impl fmt::Display for QueueDb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Element query. Empty fields do not restrict.
#[derive(Debug, Clone, Default)]
pub struct ElementFilter {
    /// Only elements of this request.
    pub request_name: Option<String>,
    /// Only elements in one of these statuses.
    pub statuses: BTreeSet<ElementStatus>,
    /// Only children of this element.
    pub parent_queue_id: Option<String>,
    /// Only elements held by this downstream queue.
    pub child_queue_url: Option<String>,
    /// Only elements last updated before this time.
    pub updated_before: Option<DateTime<Utc>>,
    /// Include quarantined and archived elements.
    pub include_inactive: bool,
}

impl ElementFilter {
    /// Filter on one request.
    pub fn request(request_name: &str) -> Self {
        Self {
            request_name: Some(request_name.to_string()),
            ..Default::default()
        }
    }

    /// Filter on a set of statuses.
    pub fn statuses(statuses: impl IntoIterator<Item = ElementStatus>) -> Self {
        Self {
            statuses: statuses.into_iter().collect(),
            ..Default::default()
        }
    }

    /// Filter on the children of an element.
    pub fn children_of(parent_id: &str) -> Self {
        Self {
            parent_queue_id: Some(parent_id.to_string()),
            ..Default::default()
        }
    }

    /// Restrict to a child queue.
    pub fn held_by(mut self, child_queue_url: &str) -> Self {
        self.child_queue_url = Some(child_queue_url.to_string());
        self
    }

    /// Also return quarantined and archived elements.
    pub fn with_inactive(mut self) -> Self {
        self.include_inactive = true;
        self
    }

    /// Whether `element` passes the filter.
    pub fn matches(&self, element: &Element) -> bool {
        if !self.include_inactive && !element.is_active() {
            return false;
        }
        if let Some(request) = &self.request_name
            && &element.request_name != request
        {
            return false;
        }
        if !self.statuses.is_empty() && !self.statuses.contains(&element.status) {
            return false;
        }
        if let Some(parent) = &self.parent_queue_id
            && element.parent_queue_id.as_ref() != Some(parent)
        {
            return false;
        }
        if let Some(child) = &self.child_queue_url
            && element.child_queue_url.as_ref() != Some(child)
        {
            return false;
        }
        if let Some(before) = self.updated_before
            && element.updated_at >= before
        {
            return false;
        }
        true
    }
}

/// One entry of the change feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Change {
    /// Feed position; strictly increasing.
    pub seq: u64,
    /// Collection the element lives in.
    pub db: QueueDb,
    /// Changed element.
    pub element_id: String,
    /// Status after the change; `None` when the element was deleted.
    pub status: Option<ElementStatus>,
}

/// Element store used by a queue.
#[async_trait]
pub trait QueueBackend: Send + Sync {
    /// Insert elements whose IDs are not present yet; existing ones are left
    /// untouched. Assigns `sequence` and `revision`. Returns the inserted IDs.
    async fn insert_elements(&self, db: QueueDb, elements: Vec<Element>) -> Result<Vec<String>>;

    /// Fetch one element.
    async fn get_element(&self, db: QueueDb, id: &str) -> Result<Option<Element>>;

    /// Elements matching `filter`, in insertion order.
    async fn list_elements(&self, db: QueueDb, filter: &ElementFilter) -> Result<Vec<Element>>;

    /// Replace an element if its stored revision still equals
    /// `element.revision`, bumping the revision.
    ///
    /// Returns `false` when another writer got there first.
    async fn update_element(&self, db: QueueDb, element: &Element) -> Result<bool>;

    /// Delete elements by ID. Returns how many existed.
    async fn delete_elements(&self, db: QueueDb, ids: &[String]) -> Result<u64>;

    /// Changes after position `since`, at most `limit`, with the position to
    /// resume from.
    async fn poll_changes(&self, since: u64, limit: u32) -> Result<(Vec<Change>, u64)>;

    /// Drop change feed entries recorded before `before`. Positions are never
    /// reused, so pollers resume past pruned entries. Returns how many went.
    async fn prune_changes(&self, before: DateTime<Utc>) -> Result<u64>;

    /// Check the store is reachable.
    async fn health_check(&self) -> Result<()>;
}
