// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The queue engine over the SQLite store.

mod common;

use common::*;
use workqueue_core::element::{Element, ElementStatus, InputRef, Progress};
use workqueue_core::persistence::{ElementFilter, QueueBackend, QueueDb, SqliteBackend};
use workqueue_core::policy::StartPolicyArgs;
use workqueue_core::queue::WorkOffer;

#[tokio::test]
async fn test_request_lifecycle_on_sqlite() {
    let ctx = TestContext::sqlite("global").await;
    ctx.queue.health_check().await.unwrap();
    ctx.locate(&[(1, &[FNAL]), (2, &[CERN])]).await;
    let spec = data_spec("req", vec![block(1, 10), block(2, 30)]);

    let outcome = ctx
        .queue
        .queue_work(&spec, "Block", StartPolicyArgs::default())
        .await
        .unwrap();
    assert_eq!(outcome.inserted.len(), 2);
    let again = ctx
        .queue
        .queue_work(&spec, "Block", StartPolicyArgs::default())
        .await
        .unwrap();
    assert!(again.inserted.is_empty());

    let claimed = ctx
        .queue
        .get_work(&WorkOffer::new("local-a", [(FNAL, 10), (CERN, 10)]))
        .await
        .unwrap();
    assert_eq!(claimed.len(), 2);

    for element in &claimed {
        ctx.queue
            .update_element(&element.id, &Progress::status(ElementStatus::Running))
            .await
            .unwrap();
        ctx.queue
            .update_element(&element.id, &Progress::status(ElementStatus::Done))
            .await
            .unwrap();
    }

    let summary = ctx.queue.request_summary("req").await.unwrap();
    assert_eq!(summary.status, Some(ElementStatus::Done));
    assert_eq!(summary.total_jobs, 4);

    let inbox = ctx
        .queue
        .get_inbox_element(&outcome.request_element_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(inbox.status, ElementStatus::Done);
    assert_eq!(inbox.percent_success, 100.0);
}

#[tokio::test]
async fn test_stale_revision_loses_on_sqlite() {
    let ctx = TestContext::sqlite("global").await;
    ctx.locate(&[(1, &[FNAL])]).await;
    let spec = data_spec("req", vec![block(1, 10)]);
    ctx.queue
        .queue_work(&spec, "Block", StartPolicyArgs::default())
        .await
        .unwrap();

    let mut first = ctx
        .queue
        .status(&ElementFilter::default())
        .await
        .unwrap()
        .remove(0);
    let mut second = first.clone();

    first.transition(ElementStatus::Negotiating).unwrap();
    first.child_queue_url = Some("local-a".to_string());
    assert!(ctx.backend.update_element(QueueDb::Queue, &first).await.unwrap());

    second.transition(ElementStatus::Negotiating).unwrap();
    second.child_queue_url = Some("local-b".to_string());
    assert!(!ctx.backend.update_element(QueueDb::Queue, &second).await.unwrap());

    let stored = ctx.queue.get_element(&first.id).await.unwrap().unwrap();
    assert_eq!(stored.child_queue_url.as_deref(), Some("local-a"));
    assert_eq!(stored.revision, first.revision + 1);
}

#[tokio::test]
async fn test_changes_survive_reopening_the_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("queue.db");

    let id = {
        let backend = SqliteBackend::from_path(&path).await.unwrap();
        let element = Element::new("req", "/req/Production", "slice-0", "", InputRef::Generated);
        let inserted = backend
            .insert_elements(QueueDb::Queue, vec![element])
            .await
            .unwrap();
        assert_eq!(inserted.len(), 1);
        backend.pool().close().await;
        inserted[0].clone()
    };

    let backend = SqliteBackend::from_path(&path).await.unwrap();
    let stored = backend.get_element(QueueDb::Queue, &id).await.unwrap().unwrap();
    assert_eq!(stored.status, ElementStatus::Available);

    let (changes, next) = backend.poll_changes(0, 100).await.unwrap();
    assert!(changes.iter().any(|c| c.element_id == id));
    assert!(next > 0);
    let (changes, _) = backend.poll_changes(next, 100).await.unwrap();
    assert!(changes.is_empty());
}
