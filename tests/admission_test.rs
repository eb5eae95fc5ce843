use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tokio::sync::Barrier;

use fromheart::PipelineError;
use fromheart::admission::{AdmissionGate, Weight};
use fromheart::consts::ADMISSION_COUNTER_KEY;
use fromheart::store::{FaultyStore, KeyValueStore, MemoryStore, SqliteStore};

async fn counter(store: &dyn KeyValueStore) -> i64 {
    store
        .get(ADMISSION_COUNTER_KEY)
        .await
        .unwrap()
        .map(|v| String::from_utf8(v).unwrap().trim().parse().unwrap())
        .unwrap_or(0)
}

/// Fire `k + 5` simultaneous heavy admissions at a gate of size `k` and hold
/// every slot that was granted until all attempts are in.
async fn burst(store: Arc<dyn KeyValueStore>, k: u32) -> (usize, usize) {
    let gate = Arc::new(AdmissionGate::new(Arc::clone(&store), k));
    let attempts = k as usize + 5;
    let barrier = Arc::new(Barrier::new(attempts));

    let tasks: Vec<_> = (0..attempts)
        .map(|_| {
            let gate = Arc::clone(&gate);
            let barrier = Arc::clone(&barrier);
            tokio::spawn(async move {
                barrier.wait().await;
                gate.admit(Weight::Heavy).await
            })
        })
        .collect();

    let mut held = Vec::new();
    let mut rejected = 0;
    for task in tasks {
        match task.await.unwrap() {
            Ok(admission) => held.push(admission),
            Err(PipelineError::CapacityExceeded) => rejected += 1,
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    let admitted = held.len();
    assert_eq!(counter(store.as_ref()).await, admitted as i64);

    for admission in held {
        admission.release().await;
    }
    assert_eq!(counter(store.as_ref()).await, 0);
    (admitted, rejected)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn burst_over_ceiling_rejects_exactly_the_excess() {
    let (admitted, rejected) = burst(Arc::new(MemoryStore::new()), 10).await;
    assert_eq!(admitted, 10);
    assert_eq!(rejected, 5);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn burst_against_sqlite_store() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("gate.db");
    let store = SqliteStore::open(path.to_str().unwrap()).unwrap();

    let (admitted, rejected) = burst(Arc::new(store), 4).await;
    assert_eq!(admitted, 4);
    assert_eq!(rejected, 5);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn in_flight_never_exceeds_ceiling_under_churn() {
    let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
    let gate = Arc::new(AdmissionGate::new(Arc::clone(&store), 3));
    let running = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let tasks: Vec<_> = (0..40)
        .map(|_| {
            let gate = Arc::clone(&gate);
            let running = Arc::clone(&running);
            let peak = Arc::clone(&peak);
            tokio::spawn(async move {
                gate.run(Weight::Heavy, async {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                    Ok(())
                })
                .await
            })
        })
        .collect();

    let mut completed = 0;
    for task in tasks {
        if task.await.unwrap().is_ok() {
            completed += 1;
        }
    }

    assert!(completed >= 3);
    assert!(peak.load(Ordering::SeqCst) <= 3);
    assert_eq!(counter(store.as_ref()).await, 0);
}

#[tokio::test]
async fn outage_admits_everyone() {
    let store = Arc::new(FaultyStore::new());
    store.set_available(false);
    let gate = AdmissionGate::new(store.clone(), 1);

    for _ in 0..5 {
        let admission = gate.admit(Weight::Heavy).await.unwrap();
        assert!(!admission.is_counted());
        admission.release().await;
    }
    assert!(store.failures() >= 5);
}

#[tokio::test]
async fn gate_recovers_when_store_returns() {
    let store = Arc::new(FaultyStore::new());
    let gate = AdmissionGate::new(store.clone(), 1);

    store.set_available(false);
    let uncounted = gate.admit(Weight::Heavy).await.unwrap();
    uncounted.release().await;

    store.set_available(true);
    let counted = gate.admit(Weight::Heavy).await.unwrap();
    assert!(counted.is_counted());
    assert!(matches!(
        gate.admit(Weight::Heavy).await,
        Err(PipelineError::CapacityExceeded)
    ));
    counted.release().await;
}
