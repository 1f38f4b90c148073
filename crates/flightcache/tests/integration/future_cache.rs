use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::time;

use flightcache::FlightError;
use flightcache::config::FlightCacheConfig;
use flightcache::future::FlightCache;
use flightcache_test::{CountingWork, TestError, setup};

fn cache(work: &CountingWork) -> FlightCache<String, usize, TestError> {
    let work = work.clone();
    FlightCache::builder()
        .name("future-test")
        .build(move |key: String| work.clone().run_async(key))
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_gets_coalesce() {
    setup();
    let work = CountingWork::new().with_delay(Duration::from_millis(100));
    let cache = cache(&work);

    let values = join_all((0..50).map(|_| cache.get("key".into()))).await;

    assert_eq!(work.calls(), 1);
    let first = values[0].clone().unwrap();
    for value in values {
        assert!(Arc::ptr_eq(&first, &value.unwrap()));
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_tasks_coalesce() {
    setup();
    let work = CountingWork::new().with_delay(Duration::from_millis(100));
    let cache = cache(&work);

    let handles: Vec<_> = (0..50)
        .map(|_| {
            let cache = cache.clone();
            tokio::spawn(async move { cache.get("key".into()).await })
        })
        .collect();

    let mut values = Vec::new();
    for handle in handles {
        values.push(handle.await.unwrap().unwrap());
    }

    assert_eq!(work.calls(), 1);
    for value in &values {
        assert!(Arc::ptr_eq(value, &values[0]));
    }
}

#[tokio::test]
async fn test_cache_hit() {
    setup();
    let work = CountingWork::new();
    let cache = cache(&work);

    let first = cache.get("key".into()).await.unwrap();
    let second = cache.get("key".into()).await.unwrap();

    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(work.calls(), 1);
}

#[tokio::test]
async fn test_expire() {
    setup();
    let work = CountingWork::new();
    let cache = FlightCache::builder()
        .config(&FlightCacheConfig {
            weak_capacity: 0,
            ..Default::default()
        })
        .build({
            let work = work.clone();
            move |key: String| work.clone().run_async(key)
        });

    let held = cache.get("key".into()).await.unwrap();
    cache.expire(&"key".into());
    let loaded = cache.get("key".into()).await.unwrap();
    assert!(Arc::ptr_eq(&held, &loaded));

    drop((held, loaded));
    assert_eq!(*cache.get("key".into()).await.unwrap(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_force_while_in_flight() {
    setup();
    let work = CountingWork::new().with_delay(Duration::from_millis(100));
    let cache = cache(&work);

    let (first, forced, joined) = tokio::join!(
        cache.get("key".into()),
        async {
            time::sleep(Duration::from_millis(10)).await;
            cache.force("key".into()).await
        },
        async {
            // the previous value is still served while the refresh runs
            time::sleep(Duration::from_millis(150)).await;
            cache.get("key".into()).await
        },
    );

    assert_eq!(*first.unwrap(), 1);
    assert_eq!(*forced.unwrap(), 2);
    assert_eq!(*joined.unwrap(), 1);
    assert_eq!(work.calls(), 2);
    assert_eq!(*cache.get("key".into()).await.unwrap(), 2);
}

#[tokio::test]
async fn test_set_and_delete() {
    setup();
    let work = CountingWork::new();
    let cache = cache(&work);

    cache.set("key".into(), 42);
    assert_eq!(*cache.get("key".into()).await.unwrap(), 42);

    cache.delete(&"key".into());
    assert_eq!(*cache.get("key".into()).await.unwrap(), 1);
    assert_eq!(cache.work("key".into()).await, Ok(2));
    assert_eq!(*cache.get("key".into()).await.unwrap(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_errors_are_shared_but_not_cached() {
    setup();
    let work = CountingWork::new()
        .with_delay(Duration::from_millis(100))
        .failing_on(&[1]);
    let cache = cache(&work);

    let results = join_all((0..10).map(|_| cache.get("key".into()))).await;
    for result in results {
        assert_eq!(result, Err(FlightError::Work(TestError::Scripted(1))));
    }
    assert_eq!(work.calls(), 1);

    assert_eq!(*cache.get("key".into()).await.unwrap(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_reset_while_in_flight() {
    setup();
    let work = CountingWork::new().with_delay(Duration::from_millis(100));
    let cache = cache(&work);
    cache.get("old".into()).await.unwrap();

    let (value, ()) = tokio::join!(cache.get("new".into()), async {
        time::sleep(Duration::from_millis(10)).await;
        cache.reset();
    });

    assert_eq!(*value.unwrap(), 2);
    assert_eq!(cache.entry_count(), 1);
    assert_eq!(*cache.get("new".into()).await.unwrap(), 2);
    assert_eq!(*cache.get("old".into()).await.unwrap(), 3);
}

#[test]
fn test_abandoned_on_runtime_shutdown() {
    setup();
    let work = CountingWork::new().with_delay(Duration::from_secs(60));
    let cache = cache(&work);

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
        .unwrap();
    runtime.block_on(async {
        tokio::spawn({
            let cache = cache.clone();
            async move { cache.get("key".into()).await }
        });
        while work.calls() == 0 {
            tokio::task::yield_now().await;
        }
    });
    assert_eq!(cache.in_flight_count(), 1);

    // shutting down drops the computation before it completes
    drop(runtime);
    assert_eq!(cache.in_flight_count(), 0);
    assert_eq!(cache.entry_count(), 0);
}
