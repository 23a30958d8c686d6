//! Redis backend tests.
//!
//! Run against a live server: `TASKGATE_REDIS_URL=redis://127.0.0.1:6379 cargo test`.
//! Without the variable every test returns immediately.

use std::sync::Arc;
use std::time::Duration;

use futures::{StreamExt, stream};
use taskgate_core::impls::{RedisSignalChannel, RedisStateStore};
use taskgate_core::ports::{SignalChannel, StateStore};
use taskgate_core::{BoxError, CoordinatorBuilder, InterruptCoordinator, TaskState};
use tokio::time::{sleep, timeout};
use ulid::Ulid;

const TTL: Duration = Duration::from_secs(30);

fn redis_url() -> Option<String> {
    std::env::var("TASKGATE_REDIS_URL").ok()
}

/// Keys unique to one test run so parallel tests never collide.
fn unique(prefix: &str) -> String {
    format!("test:{prefix}:{}", Ulid::new())
}

async fn coordinator(url: &str) -> InterruptCoordinator {
    CoordinatorBuilder::new()
        .store(Arc::new(RedisStateStore::connect(url).await.unwrap()))
        .channel(Arc::new(RedisSignalChannel::connect(url).await.unwrap()))
        .build()
        .unwrap()
}

#[tokio::test]
async fn cas_gate_admits_one_runner() {
    let Some(url) = redis_url() else { return };
    let store = RedisStateStore::connect(&url).await.unwrap();
    let key = unique("cas");

    assert_eq!(store.get_task_state(&key).await.unwrap(), None);
    assert!(
        store
            .compare_and_set_state(&key, TaskState::Running, TaskState::Running, true, TTL)
            .await
            .unwrap()
    );
    assert!(
        !store
            .compare_and_set_state(&key, TaskState::Running, TaskState::Running, true, TTL)
            .await
            .unwrap()
    );
    assert!(
        store
            .compare_and_set_state(&key, TaskState::Finished, TaskState::Running, false, TTL)
            .await
            .unwrap()
    );
    assert_eq!(
        store.get_task_state(&key).await.unwrap(),
        Some(TaskState::Finished)
    );

    store.delete_task_state(&key).await.unwrap();
    assert_eq!(store.get_task_state(&key).await.unwrap(), None);
    store.close().await.unwrap();
    store.close().await.unwrap();
}

#[tokio::test]
async fn concurrent_cas_across_connections() {
    let Some(url) = redis_url() else { return };
    let key = unique("race");

    let mut joins = Vec::new();
    for _ in 0..8 {
        let url = url.clone();
        let key = key.clone();
        joins.push(tokio::spawn(async move {
            let store = RedisStateStore::connect(&url).await.unwrap();
            store
                .set_if_not_equal(&key, TaskState::Running, TaskState::Running, TTL)
                .await
                .unwrap()
        }));
    }
    let mut winners = 0;
    for join in joins {
        if join.await.unwrap() {
            winners += 1;
        }
    }
    assert_eq!(winners, 1);
}

#[tokio::test]
async fn running_record_expires() {
    let Some(url) = redis_url() else { return };
    let store = RedisStateStore::connect(&url).await.unwrap();
    let key = unique("ttl");

    store
        .set_if_not_equal(&key, TaskState::Running, TaskState::Running, Duration::from_secs(1))
        .await
        .unwrap();
    assert_eq!(
        store.get_task_state(&key).await.unwrap(),
        Some(TaskState::Running)
    );

    sleep(Duration::from_millis(1500)).await;
    assert_eq!(store.get_task_state(&key).await.unwrap(), None);
    assert!(
        store
            .set_if_not_equal(&key, TaskState::Running, TaskState::Running, TTL)
            .await
            .unwrap()
    );
}

#[tokio::test]
async fn pubsub_delivers_to_live_subscribers_only() {
    let Some(url) = redis_url() else { return };
    let channel = RedisSignalChannel::connect(&url).await.unwrap();
    let name = unique("chan");

    channel.publish(&name, "early").await.unwrap();
    let mut sub = channel.subscribe(&name).await.unwrap();
    channel.publish(&name, "STOP").await.unwrap();

    let received = timeout(Duration::from_secs(2), sub.next()).await.unwrap();
    assert_eq!(received.as_deref(), Some("STOP"));

    channel.close().await.unwrap();
    let ended = timeout(Duration::from_secs(2), sub.next()).await.unwrap();
    assert_eq!(ended, None);
}

#[tokio::test]
async fn stop_reaches_a_run_in_another_coordinator() {
    let Some(url) = redis_url() else { return };
    let worker = coordinator(&url).await;
    let api = coordinator(&url).await;
    let session = Ulid::new().to_string();

    let mut stream = worker
        .run_and_stream("it", &session, || {
            stream::unfold(0u32, |n| async move {
                sleep(Duration::from_millis(10)).await;
                Some((Ok::<_, BoxError>(n), n + 1))
            })
        })
        .await
        .unwrap();
    stream.next().await.unwrap().unwrap();

    let err = api
        .run_and_stream("it", &session, || stream::iter(vec![Ok::<u32, BoxError>(0)]))
        .await
        .unwrap_err();
    assert!(err.is_contention());

    api.stop("it", &session).await.unwrap();
    timeout(Duration::from_secs(5), async { while stream.next().await.is_some() {} })
        .await
        .unwrap();
    assert_eq!(
        api.state("it", &session).await.unwrap(),
        Some(TaskState::Stopped)
    );

    api.reset("it", &session).await.unwrap();
    worker.close().await.unwrap();
    api.close().await.unwrap();
}
