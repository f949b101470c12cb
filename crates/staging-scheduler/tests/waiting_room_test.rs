// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Tests for the waiting room dispatch loop.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};

use staging_scheduler::waiting_room::{
    Deferred, TaskSink, WaitingRoom, WaitingRoomConfig, WaitingRoomError,
};

struct Job {
    id: u32,
    wake_at: DateTime<Utc>,
}

impl Deferred for Job {
    fn wake_at(&self) -> DateTime<Utc> {
        self.wake_at
    }
}

#[derive(Default)]
struct CollectingSink {
    received: Mutex<Vec<u32>>,
}

impl CollectingSink {
    fn received(&self) -> Vec<u32> {
        self.received.lock().unwrap().clone()
    }
}

#[async_trait]
impl TaskSink<Job> for CollectingSink {
    async fn submit(&self, task: Job) {
        self.received.lock().unwrap().push(task.id);
    }
}

fn fast_room() -> Arc<WaitingRoom<Job>> {
    Arc::new(WaitingRoom::new(WaitingRoomConfig {
        tick: Duration::from_millis(10),
    }))
}

async fn wait_for(sink: &CollectingSink, count: usize) {
    for _ in 0..200 {
        if sink.received().len() >= count {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn test_attach_twice_is_rejected() {
    let room = fast_room();
    let sink = Arc::new(CollectingSink::default());

    let handle = room.attach(sink.clone()).unwrap();
    assert!(room.is_attached());
    assert!(matches!(
        room.attach(sink),
        Err(WaitingRoomError::AlreadyAttached)
    ));

    room.shutdown();
    handle.await.unwrap();
}

#[tokio::test]
async fn test_due_tasks_reach_the_sink() {
    let room = fast_room();
    let sink = Arc::new(CollectingSink::default());
    let now = Utc::now();
    room.add(Job {
        id: 1,
        wake_at: now - TimeDelta::seconds(1),
    });
    room.add(Job {
        id: 2,
        wake_at: now + TimeDelta::hours(1),
    });

    let handle = room.attach(sink.clone()).unwrap();
    wait_for(&sink, 1).await;

    assert_eq!(sink.received(), vec![1]);
    assert_eq!(room.len(), 1);

    room.shutdown();
    handle.await.unwrap();
}

#[tokio::test]
async fn test_tasks_added_after_attach_are_dispatched() {
    let room = fast_room();
    let sink = Arc::new(CollectingSink::default());
    let handle = room.attach(sink.clone()).unwrap();

    room.add(Job {
        id: 7,
        wake_at: Utc::now(),
    });
    wait_for(&sink, 1).await;

    assert_eq!(sink.received(), vec![7]);
    assert!(room.is_empty());

    room.shutdown();
    handle.await.unwrap();
}

#[tokio::test]
async fn test_shutdown_keeps_parked_tasks() {
    let room = fast_room();
    let sink = Arc::new(CollectingSink::default());
    let handle = room.attach(sink.clone()).unwrap();

    room.shutdown();
    handle.await.unwrap();

    room.add(Job {
        id: 3,
        wake_at: Utc::now() - TimeDelta::seconds(1),
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert!(sink.received().is_empty());
    assert_eq!(room.len(), 1);
}
