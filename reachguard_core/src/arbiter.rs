//! Per-cycle selection of the command that reaches the actuators.
//!
//! Priority, evaluated every cycle:
//! 1. disarmed: hold, the platform's own idle/landing behaviour governs
//! 2. fresh external command: forward it
//! 3. otherwise: forward the safety-filtered control, if the last filter
//!    cycle succeeded and is no older than the window

use crate::error::ConfigurationFault;
use crate::filter::{FilterOutcome, FilteredControl};
use crate::platform::{NativeCommand, PlatformInterface};
use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Which control source won the cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlSource {
    /// Disarmed; nothing is forwarded
    Hold,

    External,

    Filtered,

    /// Armed, no fresh external command and no fresh filtered control
    NoCommand,
}

/// Arbitration diagnostics for one cycle.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ArbiterOutput {
    pub source: ControlSource,

    /// Native command to forward, if any
    pub command: Option<NativeCommand>,

    /// How the forwarded filtered control was obtained (filtered source only)
    pub filter_outcome: Option<FilterOutcome>,

    pub stamp: Duration,
}

#[derive(Debug)]
struct ArbiterState {
    armed: bool,
    external: Option<(Duration, NativeCommand)>,
    last_source: Option<ControlSource>,
}

/// Override arbiter for one platform.
pub struct OverrideArbiter {
    platform: Arc<dyn PlatformInterface>,
    window: Duration,
    state: Mutex<ArbiterState>,
}

impl OverrideArbiter {
    /// Starts disarmed with no external command.
    pub fn new(platform: Arc<dyn PlatformInterface>, window: Duration) -> Self {
        Self {
            platform,
            window,
            state: Mutex::new(ArbiterState {
                armed: false,
                external: None,
                last_source: None,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ArbiterState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn platform(&self) -> &Arc<dyn PlatformInterface> {
        &self.platform
    }

    /// External-command freshness window.
    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn is_armed(&self) -> bool {
        self.lock().armed
    }

    /// Flips the armed flag. Edge-triggered: every call inverts the state.
    pub fn toggle_armed(&self) -> bool {
        let mut state = self.lock();
        state.armed = !state.armed;
        info!(armed = state.armed, "in-flight flag toggled");
        state.armed
    }

    /// Records an external command received at `now`.
    pub fn on_external_command(&self, command: NativeCommand, now: Duration) {
        info!(
            window_secs = self.window.as_secs_f64(),
            "external setpoint received, prioritizing external control"
        );
        self.lock().external = Some((now, command));
    }

    /// Picks this cycle's command.
    ///
    /// `filtered` is the last filter cycle's result, `None` when that cycle
    /// failed. A result stamped more than one window before `now` is treated
    /// as missing.
    pub fn arbitrate(
        &self,
        filtered: Option<&FilteredControl>,
        now: Duration,
    ) -> Result<ArbiterOutput, ConfigurationFault> {
        let mut state = self.lock();
        let fresh_external = state
            .external
            .filter(|(received, _)| now.saturating_sub(*received) <= self.window)
            .map(|(_, command)| command);
        let fresh_filtered = filtered.filter(|f| now.saturating_sub(f.stamp) <= self.window);

        let (source, command, filter_outcome) = if !state.armed {
            (ControlSource::Hold, None, None)
        } else if let Some(command) = fresh_external {
            (ControlSource::External, Some(command), None)
        } else if let Some(filtered) = fresh_filtered {
            let command = self.platform.to_native(&filtered.control)?;
            (ControlSource::Filtered, Some(command), Some(filtered.outcome))
        } else {
            (ControlSource::NoCommand, None, None)
        };

        if state.last_source != Some(source) {
            match source {
                ControlSource::NoCommand => warn!(
                    expired = filtered.is_some(),
                    "armed but no control available to forward"
                ),
                _ => info!(?source, "control source changed"),
            }
            state.last_source = Some(source);
        }
        if filter_outcome == Some(FilterOutcome::Bypassed) {
            debug!("forwarding nominal control, safety filter has no certificate yet");
        }

        Ok(ArbiterOutput {
            source,
            command,
            filter_outcome,
            stamp: now,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::PlanarQuadrotorInterface;
    use nalgebra::DVector;
    use proptest::prelude::*;

    fn arbiter() -> OverrideArbiter {
        OverrideArbiter::new(
            Arc::new(PlanarQuadrotorInterface::default()),
            Duration::from_secs(1),
        )
    }

    fn external() -> NativeCommand {
        NativeCommand {
            roll: 0.1,
            thrust: 5.0,
            ..NativeCommand::default()
        }
    }

    fn filtered(control: Vec<f64>, stamp: Duration) -> FilteredControl {
        let control = DVector::from_vec(control);
        FilteredControl {
            nominal: control.clone(),
            control,
            value_at_state: Some(0.5),
            outcome: FilterOutcome::Corrected {
                constraint_satisfied: true,
            },
            certificate_revision: 1,
            stamp,
        }
    }

    #[test]
    fn test_toggle_is_an_edge_flip() {
        let a = arbiter();
        assert!(!a.is_armed());
        assert!(a.toggle_armed());
        assert!(!a.toggle_armed());
        assert!(a.toggle_armed());
    }

    #[test]
    fn test_external_window_boundaries() {
        let a = arbiter();
        a.toggle_armed();
        let t = Duration::from_secs(10);
        a.on_external_command(external(), t);

        for offset_ms in [0, 500, 1000] {
            let now = t + Duration::from_millis(offset_ms);
            let out = a.arbitrate(Some(&filtered(vec![0.0, 9.81], now)), now).unwrap();
            assert_eq!(out.source, ControlSource::External);
            assert_eq!(out.command, Some(external()));
            assert_eq!(out.filter_outcome, None);
        }
        let now = t + Duration::from_millis(1001);
        let out = a.arbitrate(Some(&filtered(vec![0.0, 9.81], now)), now).unwrap();
        assert_eq!(out.source, ControlSource::Filtered);
        assert_eq!(out.command.unwrap().thrust, 9.81);
    }

    #[test]
    fn test_no_filtered_control_is_surfaced() {
        let a = arbiter();
        a.toggle_armed();
        let out = a.arbitrate(None, Duration::ZERO).unwrap();
        assert_eq!(out.source, ControlSource::NoCommand);
        assert_eq!(out.command, None);
    }

    #[test]
    fn test_expired_filtered_control_is_not_forwarded() {
        let a = arbiter();
        a.toggle_armed();
        let old = filtered(vec![0.3, 9.0], Duration::from_secs(2));

        let out = a.arbitrate(Some(&old), Duration::from_millis(3000)).unwrap();
        assert_eq!(out.source, ControlSource::Filtered);

        let out = a.arbitrate(Some(&old), Duration::from_millis(3001)).unwrap();
        assert_eq!(out.source, ControlSource::NoCommand);
        assert_eq!(out.command, None);
    }

    #[test]
    fn test_filter_outcome_is_reported() {
        let a = arbiter();
        a.toggle_armed();
        let mut bypassed = filtered(vec![0.2, 9.0], Duration::ZERO);
        bypassed.outcome = FilterOutcome::Bypassed;
        let out = a.arbitrate(Some(&bypassed), Duration::ZERO).unwrap();
        assert_eq!(out.source, ControlSource::Filtered);
        assert_eq!(out.filter_outcome, Some(FilterOutcome::Bypassed));

        a.toggle_armed();
        let out = a.arbitrate(Some(&bypassed), Duration::ZERO).unwrap();
        assert_eq!(out.filter_outcome, None);
    }

    #[test]
    fn test_translation_fault_is_returned() {
        let a = arbiter();
        a.toggle_armed();
        let wrong = filtered(vec![0.0, 0.0, 0.0], Duration::ZERO);
        assert!(a.arbitrate(Some(&wrong), Duration::ZERO).is_err());
    }

    proptest! {
        #[test]
        fn prop_disarmed_always_holds(
            u0 in -5.0f64..5.0,
            u1 in -5.0f64..5.0,
            ext_at in 0u64..5_000,
            now in 0u64..5_000,
            send_external in any::<bool>(),
        ) {
            let a = arbiter();
            if send_external {
                a.on_external_command(external(), Duration::from_millis(ext_at));
            }
            let now = Duration::from_millis(now);
            let out = a.arbitrate(Some(&filtered(vec![u0, u1], now)), now).unwrap();
            prop_assert_eq!(out.source, ControlSource::Hold);
            prop_assert_eq!(out.command, None);
        }

        #[test]
        fn prop_armed_without_external_forwards_filtered(
            u0 in -5.0f64..5.0,
            u1 in -5.0f64..5.0,
            now in 0u64..100_000,
        ) {
            let a = arbiter();
            a.toggle_armed();
            let now = Duration::from_millis(now);
            let f = filtered(vec![u0, u1], now);
            let out = a.arbitrate(Some(&f), now).unwrap();
            prop_assert_eq!(out.source, ControlSource::Filtered);
            let expected = a.platform().to_native(&f.control).unwrap();
            prop_assert_eq!(out.command, Some(expected));
        }

        #[test]
        fn prop_external_wins_only_inside_window(at in 0u64..10_000, offset in 0u64..3_000) {
            let a = arbiter();
            a.toggle_armed();
            a.on_external_command(external(), Duration::from_millis(at));
            let now = Duration::from_millis(at + offset);
            let out = a.arbitrate(Some(&filtered(vec![0.0, 1.0], now)), now).unwrap();
            if offset <= 1_000 {
                prop_assert_eq!(out.source, ControlSource::External);
            } else {
                prop_assert_eq!(out.source, ControlSource::Filtered);
            }
        }
    }
}
