//! Adaptive dispatch throttling.
//!
//! [`RateController`] keeps a budget of concurrent batch commits and adapts it to backend feedback
//! with additive increase and multiplicative decrease:
//!
//! - A successful commit while all permits are in use raises the budget by `step`, up to
//!   `ceiling`.
//! - A commit that reports contention (`ABORTED`) or quota exhaustion (`RESOURCE_EXHAUSTED`)
//!   multiplies the budget by `decay`, never going below `floor`.
//!
//! The controller moves through three phases:
//!
//! ```text
//!   ramping-up ──(ceiling reached / no saturation for N successes)──▶ steady
//!       ▲  │                                                            │
//!       │  └──────────────(congestion)───────▶ backing-off ◀──(congestion)
//!       └────────(cooldown elapsed without congestion, on next success)──┘
//! ```

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::concurrency::DispatchPermit;
use crate::error::ConfigError;

/// Tunables of the adaptive rate controller.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct ThrottleConfig {
    /// Whether the adaptive controller is used at all.
    ///
    /// When disabled, dispatch concurrency is only bounded by
    /// [`WriterConfig::static_concurrency`](crate::WriterConfig::static_concurrency).
    pub enabled: bool,
    /// Budget at startup.
    pub initial: usize,
    /// Lowest budget the controller may decay to. At least `1`.
    pub floor: usize,
    /// Highest budget the controller may grow to.
    pub ceiling: usize,
    /// Additive increase per saturated success.
    pub step: usize,
    /// Multiplicative decrease per congestion signal, exclusive range `0.0..1.0`.
    pub decay: f64,
    /// Time without congestion before backing-off resumes ramping up.
    #[serde(with = "humantime_serde")]
    pub cooldown: Duration,
    /// Number of consecutive successes without saturation after which ramping up settles.
    pub steady_after: u32,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            initial: 10,
            floor: 1,
            ceiling: 500,
            step: 1,
            decay: 0.7,
            cooldown: Duration::from_secs(1),
            steady_after: 8,
        }
    }
}

impl ThrottleConfig {
    pub(crate) fn validate(&self) -> Result<(), ConfigError> {
        if self.floor == 0 {
            return Err(ConfigError::new("throttle.floor", "must be at least 1"));
        }
        if self.initial < self.floor {
            return Err(ConfigError::new(
                "throttle.initial",
                format!("must not be below floor ({})", self.floor),
            ));
        }
        if self.ceiling < self.initial {
            return Err(ConfigError::new(
                "throttle.ceiling",
                format!("must not be below initial ({})", self.initial),
            ));
        }
        if self.step == 0 {
            return Err(ConfigError::new("throttle.step", "must be at least 1"));
        }
        if !(self.decay > 0.0 && self.decay < 1.0) {
            return Err(ConfigError::new("throttle.decay", "must be within 0.0..1.0"));
        }
        Ok(())
    }
}

/// The phase of the [`RateController`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Phase {
    /// The budget grows with every saturated success.
    RampingUp,
    /// The budget is at its ceiling or is not the limiting factor.
    Steady,
    /// The backend signalled congestion recently, the budget is frozen.
    BackingOff,
}

/// A snapshot of the controller state.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ThrottleState {
    /// The current phase.
    pub phase: Phase,
    /// The number of batches allowed in flight.
    pub budget: usize,
    /// The number of permits currently held.
    pub in_use: usize,
    /// The lowest budget observed since startup.
    pub lowest_budget: usize,
}

#[derive(Debug)]
struct ControllerState {
    phase: Phase,
    budget: usize,
    in_use: usize,
    lowest_budget: usize,
    idle_successes: u32,
    last_congestion: Option<Instant>,
}

#[derive(Debug)]
pub(crate) struct Shared {
    config: ThrottleConfig,
    state: Mutex<ControllerState>,
    released: Notify,
}

impl Shared {
    /// Returns a permit to the budget, called when a [`DispatchPermit`] is dropped.
    pub(crate) fn release(&self) {
        self.state.lock().unwrap().in_use -= 1;
        self.released.notify_waiters();
    }
}

/// Additive-increase / multiplicative-decrease limiter for concurrent batch commits.
#[derive(Clone, Debug)]
pub(crate) struct RateController {
    shared: Arc<Shared>,
}

impl RateController {
    pub(crate) fn new(config: ThrottleConfig) -> Self {
        let state = ControllerState {
            phase: Phase::RampingUp,
            budget: config.initial,
            in_use: 0,
            lowest_budget: config.initial,
            idle_successes: 0,
            last_congestion: None,
        };

        Self {
            shared: Arc::new(Shared {
                config,
                state: Mutex::new(state),
                released: Notify::new(),
            }),
        }
    }

    pub(crate) fn state(&self) -> ThrottleState {
        let state = self.shared.state.lock().unwrap();
        ThrottleState {
            phase: state.phase,
            budget: state.budget,
            in_use: state.in_use,
            lowest_budget: state.lowest_budget,
        }
    }

    /// Takes a permit if the budget allows it.
    pub(crate) fn try_acquire(&self) -> Option<DispatchPermit> {
        let mut state = self.shared.state.lock().unwrap();
        if state.in_use >= state.budget {
            return None;
        }
        state.in_use += 1;
        Some(DispatchPermit::adaptive(Arc::clone(&self.shared)))
    }

    /// Waits until a permit is available and takes it.
    pub(crate) async fn acquire(&self) -> DispatchPermit {
        loop {
            let notified = self.shared.released.notified();
            if let Some(permit) = self.try_acquire() {
                return permit;
            }
            notified.await;
        }
    }

    /// Feeds back a commit that completed without congestion.
    ///
    /// Must be called while the permit of that commit is still held, so that saturation is judged
    /// correctly.
    pub(crate) fn on_success(&self) {
        let config = &self.shared.config;
        let mut state = self.shared.state.lock().unwrap();

        if state.phase == Phase::BackingOff {
            let cooled_down = state
                .last_congestion
                .is_none_or(|at| at.elapsed() >= config.cooldown);
            if !cooled_down {
                return;
            }
            tracing::debug!(budget = state.budget, "throttle cooled down, ramping up");
            state.phase = Phase::RampingUp;
            state.idle_successes = 0;
        }

        let saturated = state.in_use >= state.budget;
        if saturated && state.budget < config.ceiling {
            state.budget = (state.budget + config.step).min(config.ceiling);
            state.idle_successes = 0;
            state.phase = if state.budget == config.ceiling {
                Phase::Steady
            } else {
                Phase::RampingUp
            };
            drop(state);
            self.shared.released.notify_waiters();
            return;
        }

        if state.phase == Phase::RampingUp {
            state.idle_successes += 1;
            if state.budget >= config.ceiling || state.idle_successes >= config.steady_after {
                tracing::debug!(budget = state.budget, "throttle steady");
                state.phase = Phase::Steady;
            }
        }
    }

    /// Feeds back a commit that reported contention or quota exhaustion.
    pub(crate) fn on_congestion(&self) {
        let config = &self.shared.config;
        let mut state = self.shared.state.lock().unwrap();

        let decayed = (state.budget as f64 * config.decay).floor() as usize;
        let budget = decayed.max(config.floor);
        if budget != state.budget || state.phase != Phase::BackingOff {
            tracing::debug!(from = state.budget, to = budget, "throttle backing off");
        }

        state.budget = budget;
        state.lowest_budget = state.lowest_budget.min(budget);
        state.phase = Phase::BackingOff;
        state.idle_successes = 0;
        state.last_congestion = Some(Instant::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn controller(initial: usize, ceiling: usize) -> RateController {
        RateController::new(ThrottleConfig {
            initial,
            ceiling,
            steady_after: 3,
            ..Default::default()
        })
    }

    #[test]
    fn validates_config() {
        assert!(ThrottleConfig::default().validate().is_ok());

        let invalid = [
            ThrottleConfig {
                floor: 0,
                ..Default::default()
            },
            ThrottleConfig {
                initial: 1000,
                ..Default::default()
            },
            ThrottleConfig {
                step: 0,
                ..Default::default()
            },
            ThrottleConfig {
                decay: 1.0,
                ..Default::default()
            },
            ThrottleConfig {
                decay: 0.0,
                ..Default::default()
            },
        ];
        for config in invalid {
            assert!(config.validate().is_err(), "{config:?}");
        }
    }

    #[test]
    fn permits_are_bounded_by_budget() {
        let controller = controller(2, 10);
        let p1 = controller.try_acquire().unwrap();
        let _p2 = controller.try_acquire().unwrap();
        assert!(controller.try_acquire().is_none());
        assert_eq!(controller.state().in_use, 2);

        drop(p1);
        assert_eq!(controller.state().in_use, 1);
        assert!(controller.try_acquire().is_some());
    }

    #[test]
    fn saturated_success_ramps_up_to_ceiling() {
        let controller = controller(1, 3);

        for expected in [2, 3, 3] {
            let _permits: Vec<_> = std::iter::from_fn(|| controller.try_acquire()).collect();
            controller.on_success();
            assert_eq!(controller.state().budget, expected);
        }
        assert_eq!(controller.state().phase, Phase::Steady);
    }

    #[test]
    fn unsaturated_successes_settle_to_steady() {
        let controller = controller(4, 10);
        let _permit = controller.try_acquire().unwrap();

        for _ in 0..3 {
            controller.on_success();
        }

        let state = controller.state();
        assert_eq!(state.budget, 4);
        assert_eq!(state.phase, Phase::Steady);
    }

    #[test]
    fn congestion_decays_but_never_below_floor() {
        let controller = controller(10, 10);

        controller.on_congestion();
        assert_eq!(controller.state().budget, 7);
        assert_eq!(controller.state().phase, Phase::BackingOff);

        for _ in 0..20 {
            controller.on_congestion();
        }
        let state = controller.state();
        assert_eq!(state.budget, 1);
        assert_eq!(state.lowest_budget, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn backing_off_resumes_after_cooldown() {
        let controller = controller(10, 20);
        controller.on_congestion();
        assert_eq!(controller.state().budget, 7);

        // Within the cooldown, successes do not grow the budget.
        let permits: Vec<_> = std::iter::from_fn(|| controller.try_acquire()).collect();
        controller.on_success();
        assert_eq!(controller.state().budget, 7);
        assert_eq!(controller.state().phase, Phase::BackingOff);

        tokio::time::advance(Duration::from_secs(1)).await;
        controller.on_success();
        assert_eq!(controller.state().budget, 8);
        assert_eq!(controller.state().phase, Phase::RampingUp);
        drop(permits);
    }

    #[tokio::test]
    async fn acquire_waits_for_release() {
        let controller = controller(1, 1);
        let permit = controller.acquire().await;

        let mut waiting = Box::pin(controller.acquire());
        assert!(futures::poll!(&mut waiting).is_pending());

        drop(permit);
        assert!(futures::poll!(&mut waiting).is_ready());
    }

    #[tokio::test]
    async fn acquire_wakes_on_budget_increase() {
        let controller = controller(1, 2);
        let _permit = controller.acquire().await;

        let mut waiting = Box::pin(controller.acquire());
        assert!(futures::poll!(&mut waiting).is_pending());

        controller.on_success();
        assert!(futures::poll!(&mut waiting).is_ready());
    }
}
