use crate::core::errors::{BuildError, Result};
use crate::core::memory::MemoryProbe;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::debug;

/// Admission budget for one run
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AdmissionLimits {
    /// Maximum number of concurrently running actions
    pub max_slots: usize,
    /// Count action weight against the slot budget
    pub use_weights: bool,
    /// Free memory an action needs before it may start (0 = unchecked)
    pub memory_per_action: u64,
}

impl AdmissionLimits {
    pub fn new(max_slots: usize) -> Self {
        Self {
            max_slots,
            use_weights: false,
            memory_per_action: 0,
        }
    }

    pub fn with_weights(mut self, use_weights: bool) -> Self {
        self.use_weights = use_weights;
        self
    }

    pub fn with_memory_per_action(mut self, bytes: u64) -> Self {
        self.memory_per_action = bytes;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_slots == 0 {
            return Err(BuildError::configuration_field(
                "max_slots must be greater than 0",
                "max_slots",
            ));
        }
        Ok(())
    }
}

/// Snapshot of admission bookkeeping
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct AdmissionState {
    pub max_slots: usize,
    pub occupied_slots: usize,
    pub in_flight_weight: f64,
    pub peak_slots: usize,
    pub total_admitted: u64,
    /// Requests turned away because free memory was short
    pub memory_deferrals: u64,
}

/// Gates how many ready actions may run at once.
///
/// All counters live behind one mutex. A successful `try_acquire` hands out
/// an [`AdmissionPermit`]; dropping it releases the slot and weight, so the
/// budget is returned on every exit path.
#[derive(Debug)]
pub struct AdmissionController {
    limits: AdmissionLimits,
    state: Mutex<AdmissionState>,
    memory: Arc<dyn MemoryProbe>,
}

impl AdmissionController {
    pub fn new(limits: AdmissionLimits, memory: Arc<dyn MemoryProbe>) -> Result<Arc<Self>> {
        limits.validate()?;
        Ok(Arc::new(Self {
            limits,
            state: Mutex::new(AdmissionState {
                max_slots: limits.max_slots,
                ..Default::default()
            }),
            memory,
        }))
    }

    pub fn limits(&self) -> &AdmissionLimits {
        &self.limits
    }

    fn lock(&self) -> MutexGuard<'_, AdmissionState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Reserve a slot for an action of the given weight without blocking.
    ///
    /// Returns `None` when the budget is exhausted or free memory is short;
    /// the caller retries after some other permit is released. A request is
    /// always admitted when nothing else holds a permit, so an oversized
    /// weight or a tight memory reading cannot stall a run forever.
    pub fn try_acquire(self: &Arc<Self>, weight: f64) -> Option<AdmissionPermit> {
        let weight = if self.limits.use_weights {
            weight.max(0.0)
        } else {
            1.0
        };
        let mut state = self.lock();
        let idle = state.occupied_slots == 0;

        if !idle {
            if state.occupied_slots + 1 > self.limits.max_slots {
                return None;
            }
            if self.limits.use_weights
                && state.in_flight_weight + weight > self.limits.max_slots as f64
            {
                return None;
            }
            if self.limits.memory_per_action > 0 {
                if let Some(available) = self.memory.available_bytes() {
                    if available < self.limits.memory_per_action {
                        state.memory_deferrals += 1;
                        debug!(
                            available,
                            needed = self.limits.memory_per_action,
                            "Deferring admission until memory frees up"
                        );
                        return None;
                    }
                }
            }
        }

        state.occupied_slots += 1;
        state.in_flight_weight += weight;
        state.total_admitted += 1;
        state.peak_slots = state.peak_slots.max(state.occupied_slots);

        Some(AdmissionPermit {
            controller: Arc::clone(self),
            weight,
        })
    }

    fn release(&self, weight: f64) {
        let mut state = self.lock();
        state.occupied_slots = state.occupied_slots.saturating_sub(1);
        state.in_flight_weight = (state.in_flight_weight - weight).max(0.0);
        if state.occupied_slots == 0 {
            // Clear float drift once everything is back.
            state.in_flight_weight = 0.0;
        }
    }

    pub fn snapshot(&self) -> AdmissionState {
        *self.lock()
    }

    pub fn occupied_slots(&self) -> usize {
        self.lock().occupied_slots
    }
}

/// RAII admission reservation
#[derive(Debug)]
pub struct AdmissionPermit {
    controller: Arc<AdmissionController>,
    weight: f64,
}

impl AdmissionPermit {
    pub fn weight(&self) -> f64 {
        self.weight
    }

    /// Give the slot back now instead of at end of scope.
    pub fn release(self) {}
}

impl Drop for AdmissionPermit {
    fn drop(&mut self) {
        self.controller.release(self.weight);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::memory::FixedMemory;

    fn controller(limits: AdmissionLimits) -> Arc<AdmissionController> {
        AdmissionController::new(limits, Arc::new(FixedMemory::new(u64::MAX))).unwrap()
    }

    #[test]
    fn test_zero_slots_rejected() {
        let result = AdmissionController::new(
            AdmissionLimits::new(0),
            Arc::new(FixedMemory::new(0)),
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_slots_are_bounded_and_released() {
        let admission = controller(AdmissionLimits::new(2));
        let a = admission.try_acquire(1.0).unwrap();
        let b = admission.try_acquire(1.0).unwrap();
        assert!(admission.try_acquire(1.0).is_none());
        assert_eq!(admission.occupied_slots(), 2);

        drop(a);
        assert_eq!(admission.occupied_slots(), 1);
        let c = admission.try_acquire(1.0).unwrap();
        b.release();
        c.release();

        let state = admission.snapshot();
        assert_eq!(state.occupied_slots, 0);
        assert_eq!(state.peak_slots, 2);
        assert_eq!(state.total_admitted, 3);
    }

    #[test]
    fn test_weights_count_against_slots() {
        let admission = controller(AdmissionLimits::new(4).with_weights(true));
        let heavy = admission.try_acquire(3.0).unwrap();
        assert!(admission.try_acquire(2.0).is_none());
        let light = admission.try_acquire(1.0).unwrap();
        assert_eq!(admission.snapshot().in_flight_weight, 4.0);
        drop(heavy);
        drop(light);
        assert_eq!(admission.snapshot().in_flight_weight, 0.0);
    }

    #[test]
    fn test_weights_ignored_when_disabled() {
        let admission = controller(AdmissionLimits::new(2));
        let _a = admission.try_acquire(10.0).unwrap();
        let _b = admission.try_acquire(10.0).unwrap();
        assert_eq!(admission.snapshot().in_flight_weight, 2.0);
    }

    #[test]
    fn test_oversized_action_admitted_when_idle() {
        let admission = controller(AdmissionLimits::new(2).with_weights(true));
        let permit = admission.try_acquire(5.0);
        assert!(permit.is_some());
        assert!(admission.try_acquire(1.0).is_none());
    }

    #[test]
    fn test_memory_deferral() {
        let memory = Arc::new(FixedMemory::new(50));
        let admission = AdmissionController::new(
            AdmissionLimits::new(4).with_memory_per_action(100),
            memory.clone(),
        )
        .unwrap();

        // Idle controllers always admit one.
        let first = admission.try_acquire(1.0).unwrap();
        assert!(admission.try_acquire(1.0).is_none());
        assert_eq!(admission.snapshot().memory_deferrals, 1);

        memory.set(1_000);
        let second = admission.try_acquire(1.0).unwrap();
        drop(first);
        drop(second);
        assert_eq!(admission.occupied_slots(), 0);
    }
}
