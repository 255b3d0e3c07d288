//! CPU topology detection and placement of the producer/consumer pair.
//!
//! # Placement Strategy
//!
//! - **Producer and consumer** go on separate physical cores when there are
//!   at least two. Their cursors then bounce between private L1/L2 caches only
//!   when a cursor is actually published.
//! - With one physical core and SMT, they share the core as SMT siblings.
//! - Otherwise nothing is pinned and the OS schedules both.
//!
//! # Detection
//!
//! Uses `num_cpus` for physical/logical core counts and `core_affinity` for
//! pinning. On most systems, core IDs 0..N map to separate physical cores
//! before SMT siblings are enumerated.

use core_affinity::CoreId;

use crate::trace::warn;

/// CPU topology information detected at runtime.
#[derive(Debug, Clone)]
pub struct CpuTopology {
    /// Total logical cores (including SMT/hyperthreads).
    pub logical_cores: usize,
    /// Total physical cores.
    pub physical_cores: usize,
    /// Whether SMT (hyperthreading) is enabled.
    pub has_smt: bool,
    /// Available core IDs for pinning.
    pub available_cores: Vec<usize>,
}

impl CpuTopology {
    /// Detects the CPU topology of the current system.
    #[must_use]
    pub fn detect() -> Self {
        let logical_cores = num_cpus::get();
        let physical_cores = num_cpus::get_physical();
        let has_smt = logical_cores > physical_cores;

        let available_cores = core_affinity::get_core_ids()
            .map(|ids| ids.into_iter().map(|id| id.id).collect())
            .unwrap_or_else(|| (0..logical_cores).collect());

        Self {
            logical_cores,
            physical_cores,
            has_smt,
            available_cores,
        }
    }

    /// Selects thread placement based on detected topology.
    #[must_use]
    pub fn select_placement(&self) -> ThreadPlacement {
        let available = &self.available_cores;

        let strategy = if self.physical_cores >= 2 && available.len() >= 2 {
            PlacementStrategy::SeparateCores
        } else if self.physical_cores == 1 && self.has_smt && available.len() >= 2 {
            PlacementStrategy::SmtSiblings
        } else {
            PlacementStrategy::NoPin
        };

        let (producer_core, consumer_core) = match strategy {
            PlacementStrategy::SeparateCores | PlacementStrategy::SmtSiblings => {
                (available.first().copied(), available.get(1).copied())
            }
            PlacementStrategy::NoPin | PlacementStrategy::Manual => (None, None),
        };

        ThreadPlacement {
            producer_core,
            consumer_core,
            strategy,
        }
    }
}

/// Core assignments for the producer and consumer threads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadPlacement {
    /// Core ID for the producer thread (None = unpinned).
    pub producer_core: Option<usize>,
    /// Core ID for the consumer thread (None = unpinned).
    pub consumer_core: Option<usize>,
    /// Strategy used for placement.
    pub strategy: PlacementStrategy,
}

impl ThreadPlacement {
    /// Creates a placement with both threads unpinned.
    #[must_use]
    pub const fn unpinned() -> Self {
        Self {
            producer_core: None,
            consumer_core: None,
            strategy: PlacementStrategy::NoPin,
        }
    }

    /// Creates a manual placement with explicit core assignments.
    #[must_use]
    pub const fn manual(producer_core: Option<usize>, consumer_core: Option<usize>) -> Self {
        Self {
            producer_core,
            consumer_core,
            strategy: PlacementStrategy::Manual,
        }
    }
}

/// Strategy used for thread placement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlacementStrategy {
    /// 2+ physical cores: producer and consumer each on their own core.
    SeparateCores,
    /// 1 physical core + SMT: producer and consumer on SMT siblings.
    SmtSiblings,
    /// No pinning (fallback).
    NoPin,
    /// Manual assignment by user.
    Manual,
}

impl std::fmt::Display for PlacementStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SeparateCores => write!(f, "separate-cores"),
            Self::SmtSiblings => write!(f, "smt-siblings"),
            Self::NoPin => write!(f, "no-pin"),
            Self::Manual => write!(f, "manual"),
        }
    }
}

/// Configuration for CPU pinning behavior.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum CpuConfig {
    /// Auto-detect topology and choose placement.
    #[default]
    Auto,
    /// User-specified core assignments.
    Manual {
        /// Core for the producer thread (None = unpinned).
        producer_core: Option<usize>,
        /// Core for the consumer thread (None = unpinned).
        consumer_core: Option<usize>,
    },
    /// Disable CPU pinning entirely.
    Disabled,
}

impl CpuConfig {
    /// Resolves the config to a concrete thread placement.
    #[must_use]
    pub fn resolve(&self) -> ThreadPlacement {
        match self {
            Self::Auto => CpuTopology::detect().select_placement(),
            Self::Manual {
                producer_core,
                consumer_core,
            } => ThreadPlacement::manual(*producer_core, *consumer_core),
            Self::Disabled => ThreadPlacement::unpinned(),
        }
    }
}

/// Pins the current thread to the specified core.
///
/// Returns `true` if pinning succeeded, `false` otherwise.
/// Pinning may fail if the core ID is invalid or the OS denies the request.
pub fn pin_to_core(core_id: usize) -> bool {
    let pinned = core_affinity::set_for_current(CoreId { id: core_id });
    if !pinned {
        warn!(core_id, "failed to pin thread");
    }
    pinned
}

/// Pins the current thread if `core` is set; returns whether it is pinned.
pub fn pin_optional(core: Option<usize>) -> bool {
    core.is_some_and(pin_to_core)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn topology(physical: usize, logical: usize) -> CpuTopology {
        CpuTopology {
            logical_cores: logical,
            physical_cores: physical,
            has_smt: logical > physical,
            available_cores: (0..logical).collect(),
        }
    }

    #[test]
    fn topology_detection_returns_valid_counts() {
        let topo = CpuTopology::detect();

        assert!(topo.logical_cores > 0, "should have at least 1 logical core");
        assert!(topo.physical_cores > 0, "should have at least 1 physical core");
        assert!(
            topo.logical_cores >= topo.physical_cores,
            "logical >= physical"
        );
        assert!(!topo.available_cores.is_empty(), "should have available cores");
    }

    #[test]
    fn placement_returns_valid_cores() {
        let topo = CpuTopology::detect();
        let placement = topo.select_placement();

        for core in [placement.producer_core, placement.consumer_core]
            .into_iter()
            .flatten()
        {
            assert!(
                topo.available_cores.contains(&core),
                "core {core} should be in available set"
            );
        }
    }

    #[test]
    fn multi_core_uses_separate_cores() {
        let placement = topology(4, 8).select_placement();

        assert_eq!(placement.strategy, PlacementStrategy::SeparateCores);
        assert_eq!(placement.producer_core, Some(0));
        assert_eq!(placement.consumer_core, Some(1));
    }

    #[test]
    fn single_core_smt_uses_siblings() {
        let placement = topology(1, 2).select_placement();

        assert_eq!(placement.strategy, PlacementStrategy::SmtSiblings);
        assert_ne!(placement.producer_core, placement.consumer_core);
    }

    #[test]
    fn single_core_without_smt_does_not_pin() {
        let placement = topology(1, 1).select_placement();

        assert_eq!(placement, ThreadPlacement::unpinned());
    }

    #[test]
    fn cpu_config_auto_resolves() {
        let placement = CpuConfig::Auto.resolve();

        assert!(
            !matches!(placement.strategy, PlacementStrategy::Manual),
            "auto should not return manual strategy"
        );
    }

    #[test]
    fn cpu_config_disabled_returns_unpinned() {
        let placement = CpuConfig::Disabled.resolve();

        assert!(placement.producer_core.is_none());
        assert!(placement.consumer_core.is_none());
        assert_eq!(placement.strategy, PlacementStrategy::NoPin);
    }

    #[test]
    fn cpu_config_manual_uses_specified_cores() {
        let config = CpuConfig::Manual {
            producer_core: Some(5),
            consumer_core: None,
        };
        let placement = config.resolve();

        assert_eq!(placement.producer_core, Some(5));
        assert_eq!(placement.consumer_core, None);
        assert_eq!(placement.strategy, PlacementStrategy::Manual);
    }

    #[test]
    fn pin_optional_none_is_noop() {
        assert!(!pin_optional(None));
    }

    #[test]
    fn strategy_display() {
        assert_eq!(PlacementStrategy::SeparateCores.to_string(), "separate-cores");
        assert_eq!(PlacementStrategy::NoPin.to_string(), "no-pin");
    }
}
