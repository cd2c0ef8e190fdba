//! Optional network simulator for loss experiments.
//!
//! Real networks drop and duplicate packets.  To exercise the reliability
//! mechanisms without depending on actual network conditions, the socket
//! layer can consult a [`Simulator`] before every outbound datagram and apply
//! a configurable fault model:
//!
//! | Fault            | Description                                      |
//! |------------------|--------------------------------------------------|
//! | Packet loss      | Drop a datagram with probability `loss_rate`.    |
//! | Duplication      | Send a datagram twice with `duplicate_rate`.     |
//!
//! The RNG is seeded so a failing run can be replayed exactly.

use std::sync::Mutex;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::sync::lock;

/// Configuration for the fault-injection model.
///
/// All probabilities are in the range `[0.0, 1.0]`; values outside it are
/// clamped.
#[derive(Debug, Clone)]
pub struct SimulatorConfig {
    /// Probability that any given datagram is silently dropped.
    pub loss_rate: f64,
    /// Probability that a datagram that survives loss is sent twice.
    pub duplicate_rate: f64,
    /// Seed for the fault RNG.
    pub seed: u64,
}

impl SimulatorConfig {
    /// A loss-only model with the given drop probability.
    pub fn lossy(loss_rate: f64, seed: u64) -> Self {
        Self {
            loss_rate,
            seed,
            ..Self::default()
        }
    }

    fn is_transparent(&self) -> bool {
        self.loss_rate <= 0.0 && self.duplicate_rate <= 0.0
    }
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        // No faults by default; the simulator is a transparent pass-through.
        Self {
            loss_rate: 0.0,
            duplicate_rate: 0.0,
            seed: 0,
        }
    }
}

/// What the simulated network does with one outbound datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fate {
    Drop,
    Deliver,
    Duplicate,
}

impl Fate {
    /// Number of copies that actually reach the wire.
    pub fn copies(self) -> usize {
        match self {
            Fate::Drop => 0,
            Fate::Deliver => 1,
            Fate::Duplicate => 2,
        }
    }
}

/// Seeded fault model consulted by [`crate::socket::Socket`] on every send.
#[derive(Debug)]
pub struct Simulator {
    pub config: SimulatorConfig,
    rng: Mutex<StdRng>,
}

impl Simulator {
    pub fn new(config: SimulatorConfig) -> Self {
        let rng = StdRng::seed_from_u64(config.seed);
        Self {
            config,
            rng: Mutex::new(rng),
        }
    }

    /// Decide the fate of the next outbound datagram.
    pub fn roll(&self) -> Fate {
        if self.config.is_transparent() {
            return Fate::Deliver;
        }
        let mut rng = lock(&self.rng);
        if rng.random::<f64>() < self.config.loss_rate.clamp(0.0, 1.0) {
            return Fate::Drop;
        }
        if rng.random::<f64>() < self.config.duplicate_rate.clamp(0.0, 1.0) {
            return Fate::Duplicate;
        }
        Fate::Deliver
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_always_delivers() {
        let sim = Simulator::new(SimulatorConfig::default());
        assert!((0..1000).all(|_| sim.roll() == Fate::Deliver));
    }

    #[test]
    fn full_loss_always_drops() {
        let sim = Simulator::new(SimulatorConfig::lossy(1.0, 7));
        assert!((0..1000).all(|_| sim.roll() == Fate::Drop));
    }

    #[test]
    fn same_seed_same_fates() {
        let config = SimulatorConfig {
            loss_rate: 0.3,
            duplicate_rate: 0.2,
            seed: 42,
        };
        let a = Simulator::new(config.clone());
        let b = Simulator::new(config);
        let fa: Vec<Fate> = (0..200).map(|_| a.roll()).collect();
        let fb: Vec<Fate> = (0..200).map(|_| b.roll()).collect();
        assert_eq!(fa, fb);
    }

    #[test]
    fn loss_rate_is_roughly_honoured() {
        let sim = Simulator::new(SimulatorConfig::lossy(0.3, 1));
        let dropped = (0..10_000).filter(|_| sim.roll() == Fate::Drop).count();
        assert!((2_500..3_500).contains(&dropped), "dropped {dropped}");
    }
}
