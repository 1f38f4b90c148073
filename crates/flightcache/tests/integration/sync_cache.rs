use std::sync::{Arc, Barrier};
use std::thread;
use std::time::{Duration, Instant};

use flightcache::FlightError;
use flightcache::sync::FlightCache;
use flightcache_test::{CountingWork, TestError, setup};

fn cache(work: &CountingWork) -> FlightCache<String, usize, TestError> {
    cache_with_weak_capacity(work, 100)
}

fn cache_with_weak_capacity(
    work: &CountingWork,
    weak_capacity: u64,
) -> FlightCache<String, usize, TestError> {
    let work = work.clone();
    FlightCache::builder()
        .name("sync-test")
        .weak_capacity(weak_capacity)
        .build(move |key: &String| work.run(key))
}

#[test]
fn test_concurrent_gets_coalesce() {
    setup();
    let work = CountingWork::new().with_delay(Duration::from_millis(100));
    let cache = cache(&work);
    let barrier = Arc::new(Barrier::new(50));

    let handles: Vec<_> = (0..50)
        .map(|_| {
            let cache = cache.clone();
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                cache.get("key".into())
            })
        })
        .collect();

    let values: Vec<_> = handles
        .into_iter()
        .map(|handle| handle.join().unwrap().unwrap())
        .collect();

    assert_eq!(work.calls(), 1);
    for value in &values {
        assert!(Arc::ptr_eq(value, &values[0]));
    }
    assert_eq!(*values[0], 1);
    assert_eq!(cache.in_flight_count(), 0);
}

#[test]
fn test_distinct_keys_compute_independently() {
    setup();
    let work = CountingWork::new().with_delay(Duration::from_millis(200));
    let cache = cache(&work);
    cache.get("cached".into()).unwrap();

    let start = Instant::now();
    let handles: Vec<_> = ["a", "b", "c"]
        .into_iter()
        .map(|key| {
            let cache = cache.clone();
            thread::spawn(move || cache.get(key.into()))
        })
        .collect();
    while work.calls() < 4 {
        thread::yield_now();
    }

    // a cached key does not wait for unrelated computations
    let hit = Instant::now();
    assert_eq!(*cache.get("cached".into()).unwrap(), 1);
    assert!(hit.elapsed() < Duration::from_millis(100));
    assert_eq!(cache.in_flight_count(), 3);

    for handle in handles {
        handle.join().unwrap().unwrap();
    }
    // the three computations ran side by side
    assert!(start.elapsed() < Duration::from_millis(500));
    assert_eq!(work.calls(), 4);
    assert_eq!(cache.entry_count(), 4);
}

#[test]
fn test_cache_hit() {
    setup();
    let work = CountingWork::new();
    let cache = cache(&work);

    let first = cache.get("key".into()).unwrap();
    let second = cache.get("key".into()).unwrap();

    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(work.calls(), 1);
}

#[test]
fn test_expired_value_served_from_weak_tier() {
    setup();
    let work = CountingWork::new();
    let cache = cache(&work);

    assert_eq!(*cache.get("key".into()).unwrap(), 1);
    cache.expire(&"key".into());

    assert_eq!(*cache.get("key".into()).unwrap(), 1);
    assert_eq!(work.calls(), 1);
}

#[test]
fn test_expired_value_served_while_referenced() {
    setup();
    let work = CountingWork::new();
    let cache = cache_with_weak_capacity(&work, 0);

    let held = cache.get("key".into()).unwrap();
    cache.expire(&"key".into());

    let loaded = cache.get("key".into()).unwrap();
    assert!(Arc::ptr_eq(&held, &loaded));
    assert_eq!(work.calls(), 1);
}

#[test]
fn test_recompute_after_reclaim() {
    setup();
    let work = CountingWork::new();
    let cache = cache_with_weak_capacity(&work, 0);

    drop(cache.get("key".into()).unwrap());
    cache.expire(&"key".into());

    assert_eq!(*cache.get("key".into()).unwrap(), 2);
    assert_eq!(work.calls(), 2);
}

#[test]
fn test_strong_ttl_elapses() {
    setup();
    let work = CountingWork::new();
    let cache = FlightCache::builder()
        .strong_ttl(Duration::from_millis(50))
        .weak_capacity(0)
        .build({
            let work = work.clone();
            move |key: &String| work.run(key)
        });

    assert_eq!(*cache.get("key".into()).unwrap(), 1);
    assert_eq!(*cache.get("key".into()).unwrap(), 1);

    thread::sleep(Duration::from_millis(100));

    // observed while still strongly held, released afterwards
    assert_eq!(*cache.get("key".into()).unwrap(), 1);
    assert_eq!(*cache.get("key".into()).unwrap(), 2);
    assert_eq!(work.calls(), 2);
}

#[test]
fn test_force_recomputes() {
    setup();
    let work = CountingWork::new();
    let cache = cache(&work);

    assert_eq!(*cache.get("key".into()).unwrap(), 1);
    assert_eq!(*cache.force("key".into()).unwrap(), 2);
    assert_eq!(*cache.force("key".into()).unwrap(), 3);
    assert_eq!(*cache.get("key".into()).unwrap(), 3);
    assert_eq!(work.calls(), 3);
}

#[test]
fn test_concurrent_force_produces_fresh_values() {
    setup();
    let work = CountingWork::new().with_delay(Duration::from_millis(50));
    let cache = cache(&work);

    let get = {
        let cache = cache.clone();
        thread::spawn(move || cache.get("key".into()))
    };
    thread::sleep(Duration::from_millis(10));
    let forced = cache.force("key".into()).unwrap();

    assert_eq!(*get.join().unwrap().unwrap(), 1);
    assert_eq!(*forced, 2);
}

#[test]
fn test_work_bypasses_cache() {
    setup();
    let work = CountingWork::new();
    let cache = cache(&work);

    assert_eq!(cache.work(&"key".into()), Ok(1));
    assert_eq!(cache.work(&"key".into()), Ok(2));
    assert_eq!(cache.entry_count(), 0);
    assert_eq!(*cache.get("key".into()).unwrap(), 3);
}

#[test]
fn test_set_seeds_value() {
    setup();
    let work = CountingWork::new();
    let cache = cache(&work);

    cache.set("key".into(), 42);
    assert_eq!(*cache.get("key".into()).unwrap(), 42);

    cache.set("key".into(), 43);
    assert_eq!(*cache.get("key".into()).unwrap(), 43);
    assert_eq!(work.calls(), 0);
}

#[test]
fn test_delete() {
    setup();
    let work = CountingWork::new();
    let cache = cache(&work);

    assert_eq!(*cache.get("key".into()).unwrap(), 1);
    cache.delete(&"key".into());
    // deleting a missing key is fine
    cache.delete(&"missing".into());

    assert_eq!(*cache.get("key".into()).unwrap(), 2);
}

#[test]
fn test_reset() {
    setup();
    let work = CountingWork::new();
    let cache = cache(&work);

    cache.get("a".into()).unwrap();
    cache.get("b".into()).unwrap();
    assert_eq!(cache.entry_count(), 2);

    cache.reset();
    assert_eq!(cache.entry_count(), 0);

    assert_eq!(*cache.get("a".into()).unwrap(), 3);
    assert_eq!(*cache.get("b".into()).unwrap(), 4);
}

#[test]
fn test_errors_are_shared_but_not_cached() {
    setup();
    let work = CountingWork::new()
        .with_delay(Duration::from_millis(100))
        .failing_on(&[1]);
    let cache = cache(&work);
    let barrier = Arc::new(Barrier::new(10));

    let handles: Vec<_> = (0..10)
        .map(|_| {
            let cache = cache.clone();
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                cache.get("key".into())
            })
        })
        .collect();

    for handle in handles {
        let err = handle.join().unwrap().unwrap_err();
        assert_eq!(err, FlightError::Work(TestError::Scripted(1)));
    }
    assert_eq!(work.calls(), 1);
    assert_eq!(cache.entry_count(), 0);

    assert_eq!(*cache.get("key".into()).unwrap(), 2);
}

#[test]
fn test_error_display() {
    let err = FlightError::Work(TestError::Scripted(3));
    insta::assert_snapshot!(err.to_string(), @"call 3 failed");

    let err = FlightError::<TestError>::Abandoned;
    insta::assert_snapshot!(err.to_string(), @"computation was abandoned before completing");
    assert_eq!(err.into_work(), None);
}

#[test]
fn test_runtime_expiry() {
    setup();
    let work = CountingWork::new();
    let cache = cache(&work);

    assert_eq!(cache.expiry(), Some(Duration::from_secs(3600)));
    cache.set_expiry(Duration::from_secs(5));
    assert_eq!(cache.expiry(), Some(Duration::from_secs(5)));
    cache.set_expiry(Duration::ZERO);
    assert_eq!(cache.expiry(), None);
}

#[test]
fn test_debug() {
    setup();
    let work = CountingWork::new();
    let cache = FlightCache::builder()
        .name("lengths")
        .strong_ttl(Duration::from_secs(60))
        .build({
            let work = work.clone();
            move |key: &String| work.run(key)
        });
    cache.get("a".into()).unwrap();
    cache.get("b".into()).unwrap();

    insta::assert_debug_snapshot!(cache, @r###"
    FlightCache {
        name: "lengths",
        entries: 2,
        in-flight: 0,
        strong_ttl: Some(
            60s,
        ),
    }
    "###);
}
