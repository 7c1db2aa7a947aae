// Copyright 2024 Quarry project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use super::{AsyncMap, Context, Failure};

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future;
use task_executor::Executor;

fn test_context() -> Context {
    Context::with_quantum(Executor::new(), Duration::from_millis(50))
}

#[tokio::test]
async fn produces_and_memoizes() {
    let context = test_context();
    let map: AsyncMap<String, usize> = AsyncMap::new("lengths");
    let runs = Arc::new(AtomicUsize::new(0));

    let producer = |runs: Arc<AtomicUsize>| {
        move |_context: Context| async move {
            runs.fetch_add(1, Ordering::SeqCst);
            Ok("roland".len())
        }
    };

    let value = map
        .get(&context, "roland".to_string(), producer(runs.clone()))
        .await
        .unwrap();
    assert_eq!(value, 6);
    let value = map
        .get(&context, "roland".to_string(), producer(runs.clone()))
        .await
        .unwrap();
    assert_eq!(value, 6);
    assert_eq!(runs.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn concurrent_requests_run_the_producer_once() {
    let context = test_context();
    let map: AsyncMap<String, usize> = AsyncMap::new("slow");
    let runs = Arc::new(AtomicUsize::new(0));

    let gets = (0..32).map(|_| {
        let runs = runs.clone();
        map.get(&context, "key".to_string(), move |_context| async move {
            runs.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(10)).await;
            Ok(42)
        })
    });
    let values = future::try_join_all(gets).await.unwrap();
    assert_eq!(values, vec![42; 32]);
    assert_eq!(runs.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn errors_are_sticky() {
    let context = test_context();
    let map: AsyncMap<String, usize> = AsyncMap::new("failing");
    let runs = Arc::new(AtomicUsize::new(0));

    let producer = |runs: Arc<AtomicUsize>| {
        move |_context: Context| async move {
            runs.fetch_add(1, Ordering::SeqCst);
            Err(Failure::fatal("boom"))
        }
    };

    let failure = map
        .get(&context, "key".to_string(), producer(runs.clone()))
        .await
        .unwrap_err();
    assert_eq!(failure.message, "boom");
    assert!(failure.fatal);

    // No retry: the second request observes the same failure without re-running.
    let failure = map
        .get(&context, "key".to_string(), producer(runs.clone()))
        .await
        .unwrap_err();
    assert_eq!(failure.message, "boom");
    assert_eq!(runs.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn peek_only_sees_completed_values() {
    let context = test_context();
    let map: AsyncMap<String, usize> = AsyncMap::new("peeked");
    assert_eq!(map.peek(&"key".to_string()), None);
    map.get(&context, "key".to_string(), |_context| async { Ok(7) })
        .await
        .unwrap();
    assert_eq!(map.peek(&"key".to_string()), Some(Ok(7)));
}

fn cyclic(
    map: AsyncMap<String, usize>,
    key: String,
    next: String,
) -> impl FnOnce(Context) -> futures::future::BoxFuture<'static, super::Result<usize>> {
    use futures::FutureExt;
    move |context: Context| {
        async move {
            let map2 = map.clone();
            let next2 = next.clone();
            map.get(&context, next, move |context| {
                async move { cyclic(map2, next2, key)(context).await }.boxed()
            })
            .await
        }
        .boxed()
    }
}

#[tokio::test]
async fn cycles_are_detected_and_terminated() {
    let context = test_context();
    let map: AsyncMap<String, usize> = AsyncMap::new("cyclic");

    let failure = map
        .get(
            &context,
            "a".to_string(),
            cyclic(map.clone(), "a".to_string(), "b".to_string()),
        )
        .await
        .unwrap_err();
    assert!(failure.fatal);
    assert!(
        failure.message.contains("cycle detected"),
        "{}",
        failure.message
    );
    assert!(failure.message.contains("cyclic[a]"), "{}", failure.message);
    assert!(failure.message.contains("cyclic[b]"), "{}", failure.message);
}

#[tokio::test]
async fn self_cycles_are_detected() {
    let context = test_context();
    let map: AsyncMap<String, usize> = AsyncMap::new("selfish");

    let inner = map.clone();
    let failure = map
        .get(&context, "a".to_string(), move |context| async move {
            // The producer for a key runs at most once, so this inner producer is never
            // invoked; the request only registers the self edge.
            inner
                .get(&context, "a".to_string(), |_context| async {
                    Err(Failure::fatal("second producer run for the same key"))
                })
                .await
        })
        .await
        .unwrap_err();
    assert!(
        failure.message.contains("cycle detected"),
        "{}",
        failure.message
    );
}

#[tokio::test]
async fn unrelated_slow_work_is_not_terminated() {
    let context = test_context();
    let map: AsyncMap<String, usize> = AsyncMap::new("slowpoke");

    // A producer that takes several quanta but participates in no cycle must complete.
    let value = map
        .get(&context, "key".to_string(), |_context| async {
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok(11)
        })
        .await
        .unwrap();
    assert_eq!(value, 11);
}

#[tokio::test]
async fn failure_decoration_preserves_fatality() {
    let failure = Failure::new("inner", true).decorate("While analysing target t");
    assert!(failure.fatal);
    assert_eq!(failure.message, "While analysing target t:\ninner");
}
