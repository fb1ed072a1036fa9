// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Tests for optimistic lock reclamation: FIFO fairness, conflict
//! resolution against bound handles, and timeout-cancels-reclaim.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::*;
use uuid::Uuid;

#[tokio::test]
async fn test_unchallenged_reclaim_resolves_immediately() {
    let ctx = TestContext::new();
    let (_creator, owner) = ctx.create_owner().await;
    let instance_id = Uuid::new_v4();

    let handle = ctx.store.create_instance_handle_with_owner(&owner);
    ctx.store
        .execute(
            &handle,
            Arc::new(ReclaimLockCommand::new(instance_id, 4)),
            TIMEOUT,
        )
        .await
        .expect("an uncontested reclaim resolves at once");

    assert!(handle.is_valid());
    assert_eq!(handle.instance_version(), 4);
}

#[tokio::test]
async fn test_reclaims_resolve_in_enqueue_order() {
    let ctx = TestContext::new();
    let (_creator, owner) = ctx.create_owner().await;
    let instance_id = Uuid::new_v4();

    // 1. First reclaim resolves, then parks before its commit.
    let (first_cmd, first_entered, first_release) = ReclaimLockCommand::gated(instance_id, 5);
    let first = ctx.store.create_instance_handle_with_owner(&owner);
    let store = ctx.store.clone();
    let first_handle = first.clone();
    let first_task = tokio::spawn(async move {
        store
            .execute(&first_handle, Arc::new(first_cmd), TIMEOUT)
            .await
    });
    first_entered.await.expect("first reclaim should resolve");

    // 2. A later reclaim must wait behind the first, even at a higher
    //    version.
    let (second_cmd, second_entered, second_release) = ReclaimLockCommand::gated(instance_id, 6);
    let second = ctx.store.create_instance_handle_with_owner(&owner);
    let store = ctx.store.clone();
    let second_handle = second.clone();
    let second_task = tokio::spawn(async move {
        store
            .execute(&second_handle, Arc::new(second_cmd), TIMEOUT)
            .await
    });

    tokio::time::sleep(Duration::from_millis(100)).await;
    let mut second_entered = second_entered;
    assert!(
        second_entered.try_recv().is_err(),
        "a later-enqueued reclaim must not resolve before an earlier one still pending"
    );

    // 3. Completing the first unblocks the second in order.
    first_release.send(()).unwrap();
    first_task.await.unwrap().expect("first reclaim commits");

    second_entered
        .await
        .expect("second reclaim resolves after the first commits");
    second_release.send(()).unwrap();
    second_task.await.unwrap().expect("second reclaim commits");

    // 4. The second bind (version 6) evicted the first (version 5).
    assert_eq!(second.instance_version(), 6);
    assert!(!first.is_valid());
    assert!(Arc::ptr_eq(&first.conflicting_handle().unwrap(), &second));
}

#[tokio::test]
async fn test_reclaim_loses_to_equal_or_higher_bound_version() {
    let ctx = TestContext::new();
    let (_creator, owner) = ctx.create_owner().await;
    let instance_id = Uuid::new_v4();

    let (holder, result) = ctx.lock_instance(&owner, instance_id, 8).await;
    result.unwrap();

    let reclaimer = ctx.store.create_instance_handle_with_owner(&owner);
    let err = ctx
        .store
        .execute(
            &reclaimer,
            Arc::new(ReclaimLockCommand::new(instance_id, 5)),
            TIMEOUT,
        )
        .await
        .unwrap_err();
    assert_eq!(err.error_code(), "HANDLE_CONFLICT");
    assert!(Arc::ptr_eq(&reclaimer.conflicting_handle().unwrap(), &holder));
    assert!(holder.is_valid());
}

#[tokio::test]
async fn test_reclaim_beats_lower_bound_version() {
    let ctx = TestContext::new();
    let (_creator, owner) = ctx.create_owner().await;
    let instance_id = Uuid::new_v4();

    let (old, result) = ctx.lock_instance(&owner, instance_id, 2).await;
    result.unwrap();

    let reclaimer = ctx.store.create_instance_handle_with_owner(&owner);
    ctx.store
        .execute(
            &reclaimer,
            Arc::new(ReclaimLockCommand::new(instance_id, 3)),
            TIMEOUT,
        )
        .await
        .expect("a higher-version reclaim wins");
    assert!(!old.is_valid());
    assert_eq!(reclaimer.instance_version(), 3);
}

#[tokio::test]
async fn test_reclaim_timeout_releases_queue_slot() {
    let ctx = TestContext::new();
    let (_creator, owner) = ctx.create_owner().await;
    let instance_id = Uuid::new_v4();

    // 1. Hold the queue with an unresolved in-progress bind.
    let (gate_cmd, gate_entered, gate_release) = ReclaimLockCommand::gated(instance_id, 5);
    let gate = ctx.store.create_instance_handle_with_owner(&owner);
    let store = ctx.store.clone();
    let gate_handle = gate.clone();
    let gate_task =
        tokio::spawn(
            async move { store.execute(&gate_handle, Arc::new(gate_cmd), TIMEOUT).await },
        );
    gate_entered.await.unwrap();

    // 2. A reclaim behind it times out and cancels, freeing its handle.
    let mut hurried = ReclaimLockCommand::new(instance_id, 7);
    hurried.resolution_timeout = Duration::from_millis(50);
    let impatient = ctx.store.create_instance_handle_with_owner(&owner);
    let err = ctx
        .store
        .execute(&impatient, Arc::new(hurried), TIMEOUT)
        .await
        .unwrap_err();
    assert_eq!(err.error_code(), "TIMEOUT");
    assert!(!impatient.is_valid());

    // 3. The canceled reclaim left no stuck queue slot: the gate commits
    //    and a fresh reclaim succeeds.
    gate_release.send(()).unwrap();
    gate_task.await.unwrap().expect("gate reclaim commits");

    let late = ctx.store.create_instance_handle_with_owner(&owner);
    ctx.store
        .execute(
            &late,
            Arc::new(ReclaimLockCommand::new(instance_id, 9)),
            TIMEOUT,
        )
        .await
        .expect("the queue is not wedged after a canceled reclaim");
    assert_eq!(late.instance_version(), 9);
}
