//! Read-model freshness of a single auction.
//!
//! ```text
//! Unknown ──applied──▶ Synced ──mutated──▶ Stale ──applied──▶ Synced
//!                                            │
//!                                   delivery exhausted
//!                                            ▼
//!                                     StaleProlonged ──reconciled──▶ Synced
//! ```
//!
//! There is no terminal failure state: every state can reach `Synced`.

use serde::{Deserialize, Serialize};

/// Freshness of one auction's search document.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Freshness {
    /// Never applied.
    #[default]
    Unknown,
    /// Mirrors the authoritative record.
    Synced,
    /// An authoritative mutation is in flight.
    Stale,
    /// Delivery gave up; waiting for reconciliation.
    StaleProlonged,
}

/// Inputs that move freshness between states.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FreshnessSignal {
    /// The authoritative record changed.
    Mutated,
    /// An event was applied by the consumer.
    Applied,
    /// The event was parked after exhausting delivery.
    DeliveryExhausted,
    /// The reconciler applied the current record.
    Reconciled,
}

impl Freshness {
    /// Next state after `signal`.
    #[must_use]
    pub const fn on(self, signal: FreshnessSignal) -> Self {
        match (self, signal) {
            (_, FreshnessSignal::Applied | FreshnessSignal::Reconciled) => Self::Synced,
            (Self::Synced | Self::Stale, FreshnessSignal::Mutated) => Self::Stale,
            (Self::Unknown, FreshnessSignal::Mutated) => Self::Unknown,
            (Self::StaleProlonged, FreshnessSignal::Mutated) => Self::StaleProlonged,
            (Self::Unknown | Self::Stale | Self::StaleProlonged, FreshnessSignal::DeliveryExhausted) => {
                Self::StaleProlonged
            }
            (Self::Synced, FreshnessSignal::DeliveryExhausted) => Self::Synced,
        }
    }

    /// Whether the document mirrors the authoritative record.
    #[must_use]
    pub const fn is_synced(self) -> bool {
        matches!(self, Self::Synced)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use FreshnessSignal::{Applied, DeliveryExhausted, Mutated, Reconciled};

    #[test]
    fn happy_path() {
        let state = Freshness::Unknown.on(Applied);
        assert_eq!(state, Freshness::Synced);
        let state = state.on(Mutated);
        assert_eq!(state, Freshness::Stale);
        assert_eq!(state.on(Applied), Freshness::Synced);
    }

    #[test]
    fn exhausted_delivery_is_repaired() {
        let state = Freshness::Synced.on(Mutated).on(DeliveryExhausted);
        assert_eq!(state, Freshness::StaleProlonged);
        assert_eq!(state.on(Mutated), Freshness::StaleProlonged);
        assert!(state.on(Reconciled).is_synced());
    }

    #[test]
    fn every_state_can_reach_synced() {
        for state in [
            Freshness::Unknown,
            Freshness::Synced,
            Freshness::Stale,
            Freshness::StaleProlonged,
        ] {
            for signal in [Mutated, Applied, DeliveryExhausted, Reconciled] {
                assert!(state.on(signal).on(Reconciled).is_synced());
            }
        }
    }
}
