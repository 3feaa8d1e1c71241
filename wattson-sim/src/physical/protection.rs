//! Protection emulation (spec §4.6 "Protection emulation (optional)").
//!
//! Inferred from the `PROTECTION_TRIGGERED`/`PROTECTION_CLEARED` topics and
//! the protection bookkeeping `power_grid_simulator.py` wires into its
//! simulation thread (`on_protection_equipment_triggered`/`_cleared`
//! callbacks): a configurable delay plus a threshold factor turns a
//! sustained measurement excursion into a trigger, and a return below the
//! threshold clears it. There is no topology of actual breakers here (out
//! of scope); this monitors named measurement identifiers directly.

use dashmap::{DashMap, DashSet};

/// A trigger or clear transition [`ProtectionMonitor::observe`] reports;
/// `None` means "no change in protection state for this identifier".
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProtectionEvent {
    Triggered,
    Cleared,
}

/// Tracks, per `GridValue` identifier, a configured limit and how long the
/// measurement has sustained an excursion past `limit * threshold_factor`.
#[derive(Debug)]
pub struct ProtectionMonitor {
    trigger_delay_ms: i64,
    threshold_factor: f64,
    limits: DashMap<String, f64>,
    exceeding_since_ms: DashMap<String, i64>,
    triggered: DashSet<String>,
}

impl ProtectionMonitor {
    pub fn new(trigger_delay_ms: i64, threshold_factor: f64) -> Self {
        Self {
            trigger_delay_ms,
            threshold_factor,
            limits: DashMap::new(),
            exceeding_since_ms: DashMap::new(),
            triggered: DashSet::new(),
        }
    }

    /// Registers (or updates) the design limit for a measurement
    /// identifier. Identifiers with no registered limit are never watched.
    pub fn set_limit(&self, identifier: impl Into<String>, limit: f64) {
        self.limits.insert(identifier.into(), limit);
    }

    pub fn is_triggered(&self, identifier: &str) -> bool {
        self.triggered.contains(identifier)
    }

    /// Feeds a new measurement for `identifier` observed at `now_ms`.
    /// Returns the protection-state transition, if any.
    pub fn observe(&self, identifier: &str, value: f64, now_ms: i64) -> Option<ProtectionEvent> {
        let limit = *self.limits.get(identifier)?;
        let exceeds = value.abs() > limit.abs() * self.threshold_factor;

        if exceeds {
            let since = *self.exceeding_since_ms.entry(identifier.to_string()).or_insert(now_ms);
            if !self.triggered.contains(identifier) && now_ms.saturating_sub(since) >= self.trigger_delay_ms {
                self.triggered.insert(identifier.to_string());
                return Some(ProtectionEvent::Triggered);
            }
            None
        } else {
            self.exceeding_since_ms.remove(identifier);
            if self.triggered.remove(identifier).is_some() {
                return Some(ProtectionEvent::Cleared);
            }
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unregistered_identifier_is_never_watched() {
        let monitor = ProtectionMonitor::new(1000, 1.1);
        assert_eq!(monitor.observe("bus.1.MEASUREMENT.voltage", 999.0, 0), None);
    }

    #[test]
    fn transient_excursion_below_delay_does_not_trigger() {
        let monitor = ProtectionMonitor::new(1000, 1.1);
        monitor.set_limit("line.0.MEASUREMENT.loading", 100.0);
        assert_eq!(monitor.observe("line.0.MEASUREMENT.loading", 150.0, 0), None);
        assert_eq!(monitor.observe("line.0.MEASUREMENT.loading", 80.0, 500), None);
        assert!(!monitor.is_triggered("line.0.MEASUREMENT.loading"));
    }

    #[test]
    fn sustained_excursion_triggers_once_then_clears() {
        let monitor = ProtectionMonitor::new(1000, 1.1);
        monitor.set_limit("line.0.MEASUREMENT.loading", 100.0);
        assert_eq!(monitor.observe("line.0.MEASUREMENT.loading", 150.0, 0), None);
        assert_eq!(monitor.observe("line.0.MEASUREMENT.loading", 150.0, 1000), Some(ProtectionEvent::Triggered));
        assert!(monitor.is_triggered("line.0.MEASUREMENT.loading"));
        // Still exceeding: no repeated trigger.
        assert_eq!(monitor.observe("line.0.MEASUREMENT.loading", 150.0, 1500), None);
        assert_eq!(monitor.observe("line.0.MEASUREMENT.loading", 50.0, 2000), Some(ProtectionEvent::Cleared));
        assert!(!monitor.is_triggered("line.0.MEASUREMENT.loading"));
    }
}
