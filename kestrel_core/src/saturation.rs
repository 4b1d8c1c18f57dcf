use log::info;
use serde::{Deserialize, Serialize};

pub const DEFAULT_PATIENCE: u64 = 500;
pub const DEFAULT_CHECK_INTERVAL: u64 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SaturationState {
    Normal,
    Expansion,
}

/// Result of feeding one observation into the detector.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SaturationSignal {
    pub should_expand: bool,
    pub message: String,
}

impl SaturationSignal {
    fn quiet() -> Self {
        Self::default()
    }
}

/// Detects stagnation in coverage growth.
///
/// Leaving `Expansion` happens on the first update that sees growth. Entering it is only
/// considered once per `check_interval` iterations, and only after `patience` updates
/// without growth.
#[derive(Debug, Clone)]
pub struct SaturationDetector {
    patience: u64,
    check_interval: u64,
    state: SaturationState,
    no_discovery_count: u64,
    last_check_iteration: u64,
    last_known_total: usize,
    expansion_count: u64,
}

impl Default for SaturationDetector {
    fn default() -> Self {
        Self::new(DEFAULT_PATIENCE, DEFAULT_CHECK_INTERVAL)
    }
}

impl SaturationDetector {
    pub fn new(patience: u64, check_interval: u64) -> Self {
        Self {
            patience,
            check_interval: check_interval.max(1),
            state: SaturationState::Normal,
            no_discovery_count: 0,
            last_check_iteration: 0,
            last_known_total: 0,
            expansion_count: 0,
        }
    }

    /// Seeds the detector after a resume so restored coverage does not count as growth.
    pub fn resume_from(&mut self, current_total: usize, iteration: u64) {
        self.last_known_total = current_total;
        self.last_check_iteration = iteration;
        self.no_discovery_count = 0;
        self.state = SaturationState::Normal;
    }

    pub fn update(&mut self, current_total: usize, iteration: u64) -> SaturationSignal {
        if current_total > self.last_known_total {
            self.no_discovery_count = 0;
            self.last_known_total = current_total;
            if self.state == SaturationState::Expansion {
                self.state = SaturationState::Normal;
                let message = format!(
                    "coverage grew to {current_total} at iteration {iteration}, returning to normal mode"
                );
                info!("{message}");
                return SaturationSignal {
                    should_expand: false,
                    message,
                };
            }
        } else {
            self.no_discovery_count += 1;
        }

        if iteration.saturating_sub(self.last_check_iteration) >= self.check_interval {
            self.last_check_iteration = iteration;
            if self.no_discovery_count >= self.patience && self.state == SaturationState::Normal {
                self.state = SaturationState::Expansion;
                self.expansion_count += 1;
                let message = format!(
                    "no new coverage for {} iterations (total {}), entering expansion mode",
                    self.no_discovery_count, current_total
                );
                info!("{message}");
                return SaturationSignal {
                    should_expand: true,
                    message,
                };
            }
        }

        SaturationSignal::quiet()
    }

    pub fn state(&self) -> SaturationState {
        self.state
    }

    pub fn is_expanding(&self) -> bool {
        self.state == SaturationState::Expansion
    }

    pub fn expansion_count(&self) -> u64 {
        self.expansion_count
    }

    pub fn no_discovery_count(&self) -> u64 {
        self.no_discovery_count
    }

    pub fn reset(&mut self) {
        self.state = SaturationState::Normal;
        self.no_discovery_count = 0;
    }
}
