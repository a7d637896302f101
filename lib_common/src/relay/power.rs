//! # Power State Machine
//!
//! Simulated battery of the drone. The level drains by a fixed step on every
//! tick and is clamped to `[0, 100]`. The mode follows the level with
//! hysteresis:
//!
//! - `Normal -> Constrained` when the level drops below the low threshold.
//! - `Constrained -> Normal` when the level climbs back to the high threshold.
//!
//! Between the two thresholds the mode never changes, so a level hovering
//! around either boundary cannot make the forwarder flap.
//!
//! The level only rises through `charge`, the external charging signal. Each
//! `Constrained -> Normal` transition sends exactly one `Recovered` signal on
//! the recovery channel, which the forwarder consumes to flush held data.

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::relay::tap::{EventTap, RelayEvent};

/// Lowest possible level.
pub const LEVEL_MIN: f64 = 0.0;
/// Highest possible level.
pub const LEVEL_MAX: f64 = 100.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PowerMode {
    /// Forwarding is allowed.
    Normal,
    /// Forwarding is suspended; pending data is held.
    Constrained,
}

impl fmt::Display for PowerMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PowerMode::Normal => f.write_str("NORMAL"),
            PowerMode::Constrained => f.write_str("CONSTRAINED"),
        }
    }
}

/// Fixed parameters of the state machine.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PowerSettings {
    /// Entering constrained mode happens below this level.
    pub low_threshold: f64,
    /// Leaving constrained mode happens at or above this level.
    pub high_threshold: f64,
    /// Amount drained per tick.
    pub drain_step: f64,
    /// Level at start-up.
    pub initial_level: f64,
}

impl Default for PowerSettings {
    fn default() -> Self {
        Self {
            low_threshold: 20.0,
            high_threshold: 90.0,
            drain_step: 1.0,
            initial_level: LEVEL_MAX,
        }
    }
}

/// Snapshot of the level and mode.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PowerState {
    pub level: f64,
    pub mode: PowerMode,
}

/// A mode change produced by `tick` or `charge`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PowerTransition {
    /// Normal -> Constrained at `level`.
    Constrained { level: f64 },
    /// Constrained -> Normal at `level`.
    Recovered { level: f64 },
}

/// Signal delivered through the recovery hook.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Recovered {
    pub level: f64,
}

/// Receiving end of the recovery hook.
pub type RecoveryReceiver = mpsc::UnboundedReceiver<Recovered>;

/// Shared power state, mutated only through `tick` and `charge`.
#[derive(Debug)]
pub struct PowerMonitor {
    settings: PowerSettings,
    state: Mutex<PowerState>,
    recovery_tx: mpsc::UnboundedSender<Recovered>,
    tap: EventTap,
}

impl PowerMonitor {
    /// Creates the monitor and the receiving end of its recovery hook.
    ///
    /// A start level already below the low threshold starts in constrained mode.
    pub fn new(settings: PowerSettings, tap: EventTap) -> (Self, RecoveryReceiver) {
        let level = settings.initial_level.clamp(LEVEL_MIN, LEVEL_MAX);
        let mode = if level < settings.low_threshold {
            PowerMode::Constrained
        } else {
            PowerMode::Normal
        };
        let (recovery_tx, recovery_rx) = mpsc::unbounded_channel();
        let monitor = Self {
            settings,
            state: Mutex::new(PowerState { level, mode }),
            recovery_tx,
            tap,
        };
        (monitor, recovery_rx)
    }

    pub fn state(&self) -> PowerState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn level(&self) -> f64 {
        self.state().level
    }

    pub fn mode(&self) -> PowerMode {
        self.state().mode
    }

    /// True when the battery is completely empty and new data must be dropped.
    pub fn is_depleted(&self) -> bool {
        self.level() <= LEVEL_MIN
    }

    /// Drains one step and evaluates the hysteresis.
    pub fn tick(&self) -> Option<PowerTransition> {
        self.adjust(-self.settings.drain_step)
    }

    /// External charging signal; raises the level by `amount`.
    pub fn charge(&self, amount: f64) -> Option<PowerTransition> {
        self.adjust(amount.max(0.0))
    }

    fn adjust(&self, delta: f64) -> Option<PowerTransition> {
        let (before, after, transition) = {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            let before = *state;
            state.level = (state.level + delta).clamp(LEVEL_MIN, LEVEL_MAX);
            let transition = apply_hysteresis(&mut state, &self.settings);
            (before, *state, transition)
        };

        if before != after {
            debug!(level = after.level, mode = %after.mode, "power level changed");
            self.tap.publish(RelayEvent::PowerChanged {
                level: after.level,
                mode: after.mode,
            });
        }

        match transition {
            Some(PowerTransition::Constrained { level }) => {
                warn!(level, "power low, entering CONSTRAINED mode; forwarding suspended");
            }
            Some(PowerTransition::Recovered { level }) => {
                info!(level, "power recovered, back to NORMAL mode; flushing held data");
                let _ = self.recovery_tx.send(Recovered { level });
            }
            None => {}
        }
        transition
    }

    /// Periodic drain loop. The first tick happens one `period` after start.
    pub async fn run(self: Arc<Self>, period: Duration, cancel: CancellationToken) {
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(?period, level = self.level(), "power monitor started");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("power monitor stopping");
                    break;
                }
                _ = ticker.tick() => {
                    self.tick();
                }
            }
        }
    }
}

fn apply_hysteresis(state: &mut PowerState, settings: &PowerSettings) -> Option<PowerTransition> {
    match state.mode {
        PowerMode::Normal if state.level < settings.low_threshold => {
            state.mode = PowerMode::Constrained;
            Some(PowerTransition::Constrained { level: state.level })
        }
        PowerMode::Constrained if state.level >= settings.high_threshold => {
            state.mode = PowerMode::Normal;
            Some(PowerTransition::Recovered { level: state.level })
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn monitor_at(level: f64) -> (PowerMonitor, RecoveryReceiver) {
        PowerMonitor::new(
            PowerSettings {
                initial_level: level,
                ..PowerSettings::default()
            },
            EventTap::default(),
        )
    }

    #[test]
    fn enters_constrained_at_19_after_six_ticks_from_25() {
        let (power, _rx) = monitor_at(25.0);
        for _ in 0..5 {
            assert_eq!(power.tick(), None);
            assert_eq!(power.mode(), PowerMode::Normal);
        }
        assert_eq!(power.level(), 20.0);
        assert_eq!(
            power.tick(),
            Some(PowerTransition::Constrained { level: 19.0 })
        );
        assert_eq!(power.mode(), PowerMode::Constrained);
    }

    #[test]
    fn level_clamps_at_zero() {
        let (power, _rx) = monitor_at(1.5);
        power.tick();
        power.tick();
        assert_eq!(power.level(), 0.0);
        assert!(power.is_depleted());
        power.tick();
        assert_eq!(power.level(), 0.0);
    }

    #[test]
    fn charge_clamps_at_hundred() {
        let (power, _rx) = monitor_at(95.0);
        power.charge(50.0);
        assert_eq!(power.level(), 100.0);
    }

    #[test]
    fn no_recovery_between_thresholds() {
        let (power, mut rx) = monitor_at(19.0);
        assert_eq!(power.mode(), PowerMode::Constrained);

        assert_eq!(power.charge(50.0), None);
        assert_eq!(power.level(), 69.0);
        assert_eq!(power.mode(), PowerMode::Constrained);

        assert_eq!(power.charge(20.9), None);
        assert_eq!(power.mode(), PowerMode::Constrained);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn recovery_hook_fires_exactly_once_at_high_threshold() {
        let (power, mut rx) = monitor_at(10.0);
        assert_eq!(
            power.charge(80.0),
            Some(PowerTransition::Recovered { level: 90.0 })
        );
        assert_eq!(power.mode(), PowerMode::Normal);
        assert_eq!(rx.try_recv().unwrap(), Recovered { level: 90.0 });

        power.charge(5.0);
        assert!(rx.try_recv().is_err(), "no second signal without a new dip");
    }

    #[test]
    fn draining_back_above_low_does_not_flip_mode() {
        let (power, _rx) = monitor_at(20.0);
        assert_eq!(power.mode(), PowerMode::Normal);
        power.tick();
        assert_eq!(power.mode(), PowerMode::Constrained);
        power.charge(1.0);
        assert_eq!(power.level(), 20.0);
        assert_eq!(power.mode(), PowerMode::Constrained);
    }

    #[test]
    fn transitions_are_published_on_the_tap() {
        let tap = EventTap::default();
        let mut events = tap.subscribe();
        let (power, _rx) = PowerMonitor::new(
            PowerSettings {
                initial_level: 20.0,
                ..PowerSettings::default()
            },
            tap,
        );
        power.tick();
        assert_eq!(
            events.try_recv().unwrap(),
            RelayEvent::PowerChanged {
                level: 19.0,
                mode: PowerMode::Constrained
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn run_drains_once_per_period_until_cancelled() {
        let (power, _rx) = monitor_at(50.0);
        let power = Arc::new(power);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(power.clone().run(Duration::from_secs(5), cancel.clone()));

        tokio::time::sleep(Duration::from_millis(15_500)).await;
        assert_eq!(power.level(), 47.0);

        cancel.cancel();
        task.await.unwrap();
    }
}
