use log::info;
use rand::Rng;
use rand_core::RngCore;
use serde::{Deserialize, Serialize};

pub const DEFAULT_BASE_EPSILON: f64 = 0.1;
pub const DEFAULT_EXPANSION_EPSILON: f64 = 0.3;
pub const DEFAULT_SURGICAL_RANGE: u32 = 8;
pub const DEFAULT_EXPLORATION_RANGE: u32 = 64;

/// Parameters for [`MutationPolicy`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyConfig {
    pub exploration_enabled: bool,
    pub expansion_enabled: bool,
    pub base_epsilon: f64,
    pub expansion_epsilon: f64,
    pub surgical_range: u32,
    pub exploration_range: u32,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            exploration_enabled: true,
            expansion_enabled: true,
            base_epsilon: DEFAULT_BASE_EPSILON,
            expansion_epsilon: DEFAULT_EXPANSION_EPSILON,
            surgical_range: DEFAULT_SURGICAL_RANGE,
            exploration_range: DEFAULT_EXPLORATION_RANGE,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct PolicyStats {
    pub exploration_count: u64,
    pub exploitation_count: u64,
    pub exploration_fraction: f64,
    pub expansions_entered: u64,
    pub in_expansion: bool,
    pub current_epsilon: f64,
    pub current_range: u32,
}

/// Epsilon-greedy source selection with an adaptive perturbation bound.
///
/// The active `(epsilon, range)` pair is always switched as a unit: normal mode uses
/// `(base_epsilon, surgical_range)`, expansion mode `(expansion_epsilon, exploration_range)`.
/// The policy never touches candidates; the range is only handed to the mutator.
#[derive(Debug, Clone)]
pub struct MutationPolicy {
    config: PolicyConfig,
    active: (f64, u32),
    expanding: bool,
    exploration_count: u64,
    exploitation_count: u64,
    expansions_entered: u64,
}

impl Default for MutationPolicy {
    fn default() -> Self {
        Self::new(PolicyConfig::default())
    }
}

impl MutationPolicy {
    pub fn new(config: PolicyConfig) -> Self {
        let active = (config.base_epsilon, config.surgical_range);
        Self {
            config,
            active,
            expanding: false,
            exploration_count: 0,
            exploitation_count: 0,
            expansions_entered: 0,
        }
    }

    pub fn config(&self) -> &PolicyConfig {
        &self.config
    }

    /// Draws `u` in `[0, 1)` and explores when `u < epsilon`.
    pub fn should_explore(&mut self, rng: &mut dyn RngCore) -> bool {
        if !self.config.exploration_enabled {
            self.exploitation_count += 1;
            return false;
        }
        let roll: f64 = rng.random();
        if roll < self.active.0 {
            self.exploration_count += 1;
            true
        } else {
            self.exploitation_count += 1;
            false
        }
    }

    /// Switches to the wide parameter pair. Returns `false` if nothing changed.
    pub fn enter_expansion(&mut self) -> bool {
        if self.expanding || !self.config.expansion_enabled {
            return false;
        }
        self.active = (self.config.expansion_epsilon, self.config.exploration_range);
        self.expanding = true;
        self.expansions_entered += 1;
        info!(
            "mutation policy: expansion mode (epsilon {:.2}, range ±{})",
            self.active.0, self.active.1
        );
        true
    }

    /// Switches back to the surgical parameter pair. Returns `false` if nothing changed.
    pub fn exit_expansion(&mut self) -> bool {
        if !self.expanding {
            return false;
        }
        self.active = (self.config.base_epsilon, self.config.surgical_range);
        self.expanding = false;
        info!(
            "mutation policy: normal mode (epsilon {:.2}, range ±{})",
            self.active.0, self.active.1
        );
        true
    }

    pub fn current_epsilon(&self) -> f64 {
        self.active.0
    }

    pub fn current_range(&self) -> u32 {
        self.active.1
    }

    pub fn is_expanding(&self) -> bool {
        self.expanding
    }

    pub fn stats(&self) -> PolicyStats {
        let decisions = self.exploration_count + self.exploitation_count;
        PolicyStats {
            exploration_count: self.exploration_count,
            exploitation_count: self.exploitation_count,
            exploration_fraction: if decisions == 0 {
                0.0
            } else {
                self.exploration_count as f64 / decisions as f64
            },
            expansions_entered: self.expansions_entered,
            in_expansion: self.expanding,
            current_epsilon: self.active.0,
            current_range: self.active.1,
        }
    }

    pub fn status_line(&self) -> String {
        let stats = self.stats();
        format!(
            "mode={} epsilon={:.2} range=±{} explore/exploit={}/{}",
            if self.expanding { "expansion" } else { "normal" },
            stats.current_epsilon,
            stats.current_range,
            stats.exploration_count,
            stats.exploitation_count
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand_chacha::ChaCha8Rng;
    use rand_core::SeedableRng;

    #[test]
    fn epsilon_and_range_switch_together() {
        let mut policy = MutationPolicy::default();
        assert_eq!(policy.current_epsilon(), 0.1);
        assert_eq!(policy.current_range(), 8);

        assert!(policy.enter_expansion());
        assert_eq!(policy.current_epsilon(), 0.3);
        assert_eq!(policy.current_range(), 64);
        assert!(!policy.enter_expansion(), "second entry is a no-op");

        assert!(policy.exit_expansion());
        assert_eq!(policy.current_epsilon(), 0.1);
        assert_eq!(policy.current_range(), 8);
        assert!(!policy.exit_expansion());
        assert_eq!(policy.stats().expansions_entered, 1);
    }

    #[test]
    fn exploration_fraction_tracks_epsilon() {
        let mut policy = MutationPolicy::default();
        let mut rng = ChaCha8Rng::from_seed([7u8; 32]);
        let trials = 20_000;
        let explored = (0..trials).filter(|_| policy.should_explore(&mut rng)).count();
        let fraction = explored as f64 / trials as f64;
        assert!((fraction - 0.1).abs() < 0.02, "fraction was {fraction}");

        let stats = policy.stats();
        assert_eq!(stats.exploration_count + stats.exploitation_count, trials as u64);
    }

    #[test]
    fn disabled_exploration_never_explores() {
        let mut policy = MutationPolicy::new(PolicyConfig {
            exploration_enabled: false,
            ..PolicyConfig::default()
        });
        let mut rng = ChaCha8Rng::from_seed([1u8; 32]);
        assert!((0..1000).all(|_| !policy.should_explore(&mut rng)));
        assert_eq!(policy.stats().exploitation_count, 1000);
    }

    #[test]
    fn disabled_expansion_keeps_surgical_parameters() {
        let mut policy = MutationPolicy::new(PolicyConfig {
            expansion_enabled: false,
            ..PolicyConfig::default()
        });
        assert!(!policy.enter_expansion());
        assert_eq!(policy.current_range(), DEFAULT_SURGICAL_RANGE);
        assert!(policy.status_line().contains("mode=normal"));
    }
}
