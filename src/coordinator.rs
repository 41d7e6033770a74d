//! Process-wide cap on concurrent provider invocations.
//!
//! Every bot instance acquires a slot here before calling the provider
//! chain. The cap follows `concurrency_limit` in the live settings. When
//! several instances answer the same trigger, later responders are
//! staggered so replies don't land at once.

use crate::InstanceId;
use crate::config::RuntimeConfig;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// Responder registrations older than this are dropped.
const RESPONDER_STALE_AFTER: Duration = Duration::from_secs(60);
/// How often stale registrations are swept.
const RESPONDER_SWEEP_INTERVAL: Duration = Duration::from_secs(300);

/// Holds one unit of concurrency. Released on drop.
#[derive(Debug)]
pub struct SlotGuard {
    permit: Option<OwnedSemaphorePermit>,
    in_flight: Arc<AtomicUsize>,
}

impl SlotGuard {
    /// True when the coordinator failed open and this slot is not counted
    /// against the limit.
    pub fn is_unbounded(&self) -> bool {
        self.permit.is_none()
    }
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        #[cfg(feature = "metrics")]
        crate::telemetry::Metrics::global().in_flight_generations.dec();
    }
}

struct ResponderEntry {
    registered_at: Instant,
    instances: Vec<InstanceId>,
}

#[derive(Default)]
struct ResponderRegistry {
    triggers: HashMap<u64, ResponderEntry>,
    last_sweep: Option<Instant>,
}

impl ResponderRegistry {
    fn sweep(&mut self, now: Instant) {
        let due = self
            .last_sweep
            .is_none_or(|last| now.duration_since(last) >= RESPONDER_SWEEP_INTERVAL);
        if !due {
            return;
        }
        self.last_sweep = Some(now);
        let before = self.triggers.len();
        self.triggers
            .retain(|_, entry| now.duration_since(entry.registered_at) < RESPONDER_STALE_AFTER);
        let removed = before - self.triggers.len();
        if removed > 0 {
            tracing::debug!(removed, "swept stale responder registrations");
        }
    }
}

/// Serializable coordinator state for the status API.
#[derive(Debug, Clone, Serialize)]
pub struct CoordinatorSnapshot {
    pub limit: usize,
    pub in_flight: usize,
    pub available: usize,
    pub tracked_triggers: usize,
}

pub struct GlobalConcurrencyCoordinator {
    runtime: Arc<RuntimeConfig>,
    semaphore: Arc<Semaphore>,
    /// Permits the semaphore is sized for, including ones still being retired.
    limit: Mutex<usize>,
    in_flight: Arc<AtomicUsize>,
    responders: Mutex<ResponderRegistry>,
}

impl GlobalConcurrencyCoordinator {
    pub fn new(runtime: Arc<RuntimeConfig>) -> Self {
        let limit = runtime.settings().concurrency_limit.min(Semaphore::MAX_PERMITS);
        Self {
            runtime,
            semaphore: Arc::new(Semaphore::new(limit)),
            limit: Mutex::new(limit),
            in_flight: Arc::new(AtomicUsize::new(0)),
            responders: Mutex::new(ResponderRegistry::default()),
        }
    }

    /// Register `instance` as a responder to `trigger_message_id` and return
    /// its position. The first responder gets 0. Re-registering returns the
    /// original position.
    pub fn register_responder(&self, trigger_message_id: u64, instance: &InstanceId) -> usize {
        let now = Instant::now();
        let mut registry = self.responders.lock();
        registry.sweep(now);
        let entry = registry
            .triggers
            .entry(trigger_message_id)
            .or_insert_with(|| ResponderEntry {
                registered_at: now,
                instances: Vec::new(),
            });
        match entry.instances.iter().position(|existing| existing == instance) {
            Some(position) => position,
            None => {
                entry.instances.push(instance.clone());
                entry.instances.len() - 1
            }
        }
    }

    /// Stagger delay for a responder position.
    pub fn stagger_delay(&self, responder_index: usize) -> Duration {
        let settings = self.runtime.settings();
        let seconds = (settings.stagger_seconds * responder_index as f64)
            .min(settings.stagger_max_seconds);
        Duration::try_from_secs_f64(seconds).unwrap_or_default()
    }

    /// Wait out the responder stagger, then wait for a slot.
    ///
    /// Never fails: if the limiter is unusable the call proceeds without a
    /// slot and the fault is logged.
    pub async fn acquire_slot(&self, responder_index: usize) -> SlotGuard {
        let delay = self.stagger_delay(responder_index);
        if !delay.is_zero() {
            tracing::debug!(responder_index, delay_ms = delay.as_millis() as u64, "staggering response");
            tokio::time::sleep(delay).await;
        }

        let permit = match self.sync_limit() {
            Ok(retirement) => {
                // Queue behind our own retirement so a shrink is honored
                // before this caller takes a slot.
                if let Some(retirement) = retirement {
                    let _ = retirement.await;
                }
                match self.semaphore.clone().acquire_owned().await {
                    Ok(permit) => Some(permit),
                    Err(error) => {
                        tracing::warn!(%error, "concurrency limiter closed, proceeding unbounded");
                        None
                    }
                }
            }
            Err(reason) => {
                tracing::warn!(reason, "concurrency limiter unavailable, proceeding unbounded");
                None
            }
        };

        self.in_flight.fetch_add(1, Ordering::SeqCst);
        #[cfg(feature = "metrics")]
        crate::telemetry::Metrics::global().in_flight_generations.inc();

        SlotGuard {
            permit,
            in_flight: self.in_flight.clone(),
        }
    }

    /// Resize the semaphore to the configured limit. Growing adds permits
    /// at once; shrinking retires permits as they are released.
    fn sync_limit(&self) -> Result<Option<JoinHandle<()>>, &'static str> {
        let target = self.runtime.settings().concurrency_limit;
        if target == 0 {
            return Err("concurrency_limit is 0");
        }
        if self.semaphore.is_closed() {
            return Err("semaphore closed");
        }
        let target = target.min(Semaphore::MAX_PERMITS);

        let mut current = self.limit.lock();
        if target == *current {
            return Ok(None);
        }

        let retirement = if target > *current {
            self.semaphore.add_permits(target - *current);
            None
        } else {
            let retire = (*current - target) as u32;
            let semaphore = self.semaphore.clone();
            // Detached so a cancelled caller can't lose the retirement.
            Some(tokio::spawn(async move {
                if let Ok(permits) = semaphore.acquire_many_owned(retire).await {
                    permits.forget();
                }
            }))
        };
        tracing::info!(from = *current, to = target, "concurrency limit changed");
        *current = target;
        Ok(retirement)
    }

    /// Number of generations currently holding a slot, unbounded ones included.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Configured limit currently applied.
    pub fn limit(&self) -> usize {
        *self.limit.lock()
    }

    /// Stop handing out bounded slots. Later acquisitions proceed unbounded.
    pub fn close(&self) {
        self.semaphore.close();
    }

    pub fn snapshot(&self) -> CoordinatorSnapshot {
        CoordinatorSnapshot {
            limit: self.limit(),
            in_flight: self.in_flight(),
            available: self.semaphore.available_permits(),
            tracked_triggers: self.responders.lock().triggers.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeSettings;
    use crate::llm::provider::ProviderSet;

    fn coordinator(limit: usize) -> (Arc<RuntimeConfig>, Arc<GlobalConcurrencyCoordinator>) {
        let runtime = Arc::new(RuntimeConfig::new(
            RuntimeSettings {
                concurrency_limit: limit,
                stagger_seconds: 1.5,
                stagger_max_seconds: 5.0,
                ..RuntimeSettings::default()
            },
            ProviderSet::default(),
        ));
        let coordinator = Arc::new(GlobalConcurrencyCoordinator::new(runtime.clone()));
        (runtime, coordinator)
    }

    #[tokio::test(start_paused = true)]
    async fn in_flight_never_exceeds_limit() {
        let (_runtime, coordinator) = coordinator(2);
        let peak = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let coordinator = coordinator.clone();
            let peak = peak.clone();
            handles.push(tokio::spawn(async move {
                let slot = coordinator.acquire_slot(0).await;
                assert!(!slot.is_unbounded());
                peak.fetch_max(coordinator.in_flight(), Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(100)).await;
                drop(slot);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(peak.load(Ordering::SeqCst), 2);
        assert_eq!(coordinator.in_flight(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn stagger_scales_with_position_and_caps() {
        let (_runtime, coordinator) = coordinator(4);
        assert_eq!(coordinator.stagger_delay(0), Duration::ZERO);
        assert_eq!(coordinator.stagger_delay(1), Duration::from_millis(1500));
        assert_eq!(coordinator.stagger_delay(3), Duration::from_secs(5));

        let started = Instant::now();
        let _slot = coordinator.acquire_slot(2).await;
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(3) && elapsed < Duration::from_millis(3100));
    }

    #[test]
    fn responder_positions_are_stable() {
        let (_runtime, coordinator) = coordinator(4);
        let first: InstanceId = Arc::from("firefly");
        let second: InstanceId = Arc::from("march");
        assert_eq!(coordinator.register_responder(10, &first), 0);
        assert_eq!(coordinator.register_responder(10, &second), 1);
        assert_eq!(coordinator.register_responder(10, &first), 0);
        assert_eq!(coordinator.register_responder(11, &second), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn zero_limit_fails_open() {
        let (_runtime, coordinator) = coordinator(0);
        let slot = coordinator.acquire_slot(0).await;
        assert!(slot.is_unbounded());
        assert_eq!(coordinator.in_flight(), 1);
        drop(slot);
        assert_eq!(coordinator.in_flight(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn closed_limiter_fails_open() {
        let (_runtime, coordinator) = coordinator(1);
        coordinator.close();
        assert!(coordinator.acquire_slot(0).await.is_unbounded());
    }

    #[tokio::test(start_paused = true)]
    async fn raising_the_limit_admits_waiters() {
        let (runtime, coordinator) = coordinator(1);
        let held = coordinator.acquire_slot(0).await;

        runtime.replace_settings(RuntimeSettings {
            concurrency_limit: 2,
            ..RuntimeSettings::default()
        });
        let second = tokio::time::timeout(Duration::from_secs(1), coordinator.acquire_slot(0))
            .await
            .expect("second slot should be granted after the limit grows");
        assert_eq!(coordinator.in_flight(), 2);
        assert_eq!(coordinator.limit(), 2);
        drop((held, second));
    }

    #[tokio::test(start_paused = true)]
    async fn lowering_the_limit_takes_effect_as_slots_release() {
        let (runtime, coordinator) = coordinator(2);
        let a = coordinator.acquire_slot(0).await;
        let b = coordinator.acquire_slot(0).await;

        runtime.replace_settings(RuntimeSettings {
            concurrency_limit: 1,
            ..RuntimeSettings::default()
        });
        // Acquire triggers the resize, then waits behind the retirement.
        let waiter = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move {
                let _slot = coordinator.acquire_slot(0).await;
                coordinator.in_flight()
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        drop(a);
        tokio::time::sleep(Duration::from_millis(10)).await;
        // One permit was retired; b still holds the other.
        assert!(!waiter.is_finished());
        drop(b);
        assert_eq!(waiter.await.unwrap(), 1);
        assert_eq!(coordinator.snapshot().available, 1);
    }
}
