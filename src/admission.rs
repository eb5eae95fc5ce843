//! System-wide cap on concurrently running heavy requests.
//!
//! The gate counts in the shared store, not in process memory, so every
//! front end sharing the store shares the ceiling. It is independent of the
//! worker pool's own concurrency.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crate::consts::{ADMISSION_COUNTER_KEY, DEFAULT_COUNTER_TTL, DEFAULT_RELEASE_DEADLINE};
use crate::error::PipelineError;
use crate::store::KeyValueStore;

/// How much a request costs the system.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Weight {
    /// Mutating or compute-triggering: counted against the ceiling.
    Heavy,
    /// Cheap reads: always admitted, never counted.
    Light,
}

/// What to do when the counter itself can't be reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutagePolicy {
    /// Admit the request uncounted. A store hiccup must not take the whole
    /// service down with it.
    #[default]
    AvailabilityOverEnforcement,
    /// Reject the request as if the gate were full.
    StrictEnforcement,
}

pub struct AdmissionGate {
    store: Arc<dyn KeyValueStore>,
    max_concurrency: u32,
    policy: OutagePolicy,
    counter_ttl: Duration,
    release_deadline: Duration,
}

impl AdmissionGate {
    pub fn new(store: Arc<dyn KeyValueStore>, max_concurrency: u32) -> Self {
        Self {
            store,
            max_concurrency,
            policy: OutagePolicy::default(),
            counter_ttl: DEFAULT_COUNTER_TTL,
            release_deadline: DEFAULT_RELEASE_DEADLINE,
        }
    }

    pub fn with_policy(mut self, policy: OutagePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_counter_ttl(mut self, ttl: Duration) -> Self {
        self.counter_ttl = ttl;
        self
    }

    pub fn with_release_deadline(mut self, deadline: Duration) -> Self {
        self.release_deadline = deadline;
        self
    }

    /// Try to take a slot. Full gate → [`PipelineError::CapacityExceeded`],
    /// with the counter left untouched.
    pub async fn admit(&self, weight: Weight) -> Result<Admission, PipelineError> {
        if weight == Weight::Light {
            return Ok(Admission::uncounted());
        }

        match self
            .store
            .increment_below(ADMISSION_COUNTER_KEY, i64::from(self.max_concurrency))
            .await
        {
            Ok(Some(in_flight)) => {
                tracing::debug!(in_flight, max = self.max_concurrency, "request admitted");
                // Re-arm the safety expiry on every admission so an idle
                // system eventually forgets slots leaked by a crash.
                if let Err(e) = self
                    .store
                    .expire(ADMISSION_COUNTER_KEY, self.counter_ttl)
                    .await
                {
                    tracing::warn!(error = %e, "could not refresh admission counter expiry");
                }
                Ok(Admission {
                    slot: Some(Slot {
                        store: Arc::clone(&self.store),
                        counter_ttl: self.counter_ttl,
                        deadline: self.release_deadline,
                    }),
                })
            }
            Ok(None) => {
                tracing::info!(max = self.max_concurrency, "admission gate full, rejecting");
                Err(PipelineError::CapacityExceeded)
            }
            Err(e) => match self.policy {
                OutagePolicy::AvailabilityOverEnforcement => {
                    tracing::warn!(error = %e, "admission store unavailable, failing open");
                    Ok(Admission::uncounted())
                }
                OutagePolicy::StrictEnforcement => {
                    tracing::warn!(error = %e, "admission store unavailable, rejecting");
                    Err(PipelineError::CapacityExceeded)
                }
            },
        }
    }

    /// Run `request` under an admission slot, releasing it whatever happens
    /// to the request (including the caller dropping this future).
    pub async fn run<F, T>(&self, weight: Weight, request: F) -> Result<T, PipelineError>
    where
        F: Future<Output = Result<T, PipelineError>>,
    {
        let admission = self.admit(weight).await?;
        let outcome = request.await;
        admission.release().await;
        outcome
    }
}

struct Slot {
    store: Arc<dyn KeyValueStore>,
    counter_ttl: Duration,
    deadline: Duration,
}

impl Slot {
    async fn give_back(self) {
        let store = self.store;
        let ttl = self.counter_ttl;
        let released = tokio::time::timeout(self.deadline, async move {
            store.decrement(ADMISSION_COUNTER_KEY).await?;
            store.expire(ADMISSION_COUNTER_KEY, ttl).await
        })
        .await;
        match released {
            Ok(Ok(_)) => tracing::debug!("admission slot released"),
            Ok(Err(e)) => tracing::warn!(error = %e, "failed to release admission slot"),
            Err(_) => tracing::warn!("admission release timed out"),
        }
    }
}

/// A held slot. Release it with [`Admission::release`]; if it is dropped
/// instead, the release is spawned onto the runtime so the count still goes
/// down exactly once.
#[must_use = "dropping an admission releases its slot immediately"]
pub struct Admission {
    slot: Option<Slot>,
}

impl Admission {
    fn uncounted() -> Self {
        Self { slot: None }
    }

    /// Whether this admission holds a counted slot (false for light requests
    /// and for fail-open admissions).
    pub fn is_counted(&self) -> bool {
        self.slot.is_some()
    }

    /// Give the slot back and wait for the store to confirm. The decrement
    /// runs as its own task, so it still completes if this future is dropped.
    pub async fn release(mut self) {
        if let Some(slot) = self.slot.take() {
            if let Err(e) = tokio::spawn(slot.give_back()).await {
                tracing::warn!(error = %e, "admission release task failed");
            }
        }
    }
}

impl Drop for Admission {
    fn drop(&mut self) {
        let Some(slot) = self.slot.take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(slot.give_back());
            }
            Err(_) => tracing::warn!("admission dropped outside a runtime; counter left to expire"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{FaultyStore, MemoryStore};

    async fn in_flight(store: &dyn KeyValueStore) -> i64 {
        store
            .get(ADMISSION_COUNTER_KEY)
            .await
            .unwrap()
            .map(|v| String::from_utf8(v).unwrap().parse().unwrap())
            .unwrap_or(0)
    }

    #[tokio::test]
    async fn admits_up_to_ceiling_then_rejects() {
        let store = Arc::new(MemoryStore::new());
        let gate = AdmissionGate::new(store.clone(), 2);

        let a = gate.admit(Weight::Heavy).await.unwrap();
        let b = gate.admit(Weight::Heavy).await.unwrap();
        assert!(matches!(
            gate.admit(Weight::Heavy).await,
            Err(PipelineError::CapacityExceeded)
        ));
        assert_eq!(in_flight(store.as_ref()).await, 2);

        a.release().await;
        assert_eq!(in_flight(store.as_ref()).await, 1);
        let c = gate.admit(Weight::Heavy).await.unwrap();
        b.release().await;
        c.release().await;
        assert_eq!(in_flight(store.as_ref()).await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn release_survives_caller_giving_up() {
        let store = Arc::new(FaultyStore::new());
        let gate = AdmissionGate::new(store.clone(), 1);
        let admission = gate.admit(Weight::Heavy).await.unwrap();
        assert_eq!(in_flight(store.as_ref()).await, 1);

        store.set_latency(Duration::from_secs(1));
        let cut_short = tokio::time::timeout(Duration::from_millis(10), admission.release()).await;
        assert!(cut_short.is_err());

        tokio::time::sleep(Duration::from_secs(4)).await;
        store.set_latency(Duration::ZERO);
        assert_eq!(in_flight(store.as_ref()).await, 0);
    }

    #[tokio::test]
    async fn light_requests_are_not_counted() {
        let store = Arc::new(MemoryStore::new());
        let gate = AdmissionGate::new(store.clone(), 1);
        let _heavy = gate.admit(Weight::Heavy).await.unwrap();
        let light = gate.admit(Weight::Light).await.unwrap();
        assert!(!light.is_counted());
        assert_eq!(in_flight(store.as_ref()).await, 1);
    }

    #[tokio::test]
    async fn outage_fails_open_by_default() {
        let store = Arc::new(FaultyStore::new());
        store.set_available(false);
        let gate = AdmissionGate::new(store.clone(), 1);

        let first = gate.admit(Weight::Heavy).await.unwrap();
        let second = gate.admit(Weight::Heavy).await.unwrap();
        assert!(!first.is_counted());
        assert!(!second.is_counted());
    }

    #[tokio::test]
    async fn strict_policy_rejects_on_outage() {
        let store = Arc::new(FaultyStore::new());
        store.set_available(false);
        let gate =
            AdmissionGate::new(store, 1).with_policy(OutagePolicy::StrictEnforcement);
        assert!(matches!(
            gate.admit(Weight::Heavy).await,
            Err(PipelineError::CapacityExceeded)
        ));
    }

    #[tokio::test]
    async fn dropped_admission_still_releases() {
        let store = Arc::new(MemoryStore::new());
        let gate = AdmissionGate::new(store.clone(), 1);
        {
            let _slot = gate.admit(Weight::Heavy).await.unwrap();
        }
        // let the spawned release run
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert_eq!(in_flight(store.as_ref()).await, 0);
    }

    #[tokio::test]
    async fn run_releases_after_request_error() {
        let store = Arc::new(MemoryStore::new());
        let gate = AdmissionGate::new(store.clone(), 1);
        let outcome: Result<(), _> = gate
            .run(Weight::Heavy, async {
                Err(PipelineError::Validation("bad".to_string()))
            })
            .await;
        assert!(matches!(outcome, Err(PipelineError::Validation(_))));
        assert_eq!(in_flight(store.as_ref()).await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn leaked_slots_expire() {
        let store = Arc::new(MemoryStore::new());
        let gate = AdmissionGate::new(store.clone(), 1).with_counter_ttl(Duration::from_secs(60));
        let slot = gate.admit(Weight::Heavy).await.unwrap();
        std::mem::forget(slot);
        assert!(gate.admit(Weight::Heavy).await.is_err());

        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(gate.admit(Weight::Heavy).await.is_ok());
    }
}
