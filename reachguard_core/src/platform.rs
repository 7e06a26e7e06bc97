//! Translation between the supervisor's generic vectors and a platform's
//! native messages.
//!
//! One implementation per platform, selected once at startup from
//! configuration.

use crate::error::{ConfigurationFault, UnsupportedMode};
use nalgebra::DVector;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::Arc;

/// Native position/velocity/yaw state estimate.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct NativeState {
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub x_dot: f64,
    pub y_dot: f64,
    pub z_dot: f64,
    pub yaw: f64,
}

/// Native attitude/thrust command.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct NativeCommand {
    /// Roll angle (rad)
    pub roll: f64,

    /// Pitch angle (rad)
    pub pitch: f64,

    /// Yaw rate (rad/s)
    pub yaw_rate: f64,

    pub thrust: f64,

    /// Set only by prioritized platforms
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<f64>,
}

/// Native disturbance estimate over the planar state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct NativeDisturbance {
    pub y: f64,
    pub z: f64,
    pub y_dot: f64,
    pub z_dot: f64,
}

/// Capability interface for a concrete platform.
pub trait PlatformInterface: Send + Sync + std::fmt::Debug {
    fn name(&self) -> &'static str;

    /// Reduces a native state estimate to the supervisor state vector.
    fn state_from_native(&self, native: &NativeState) -> DVector<f64>;

    /// Expands a generic control vector into a native command.
    fn to_native(&self, control: &DVector<f64>) -> Result<NativeCommand, ConfigurationFault>;

    /// Reduces a native command to the generic control vector.
    fn from_native(&self, command: &NativeCommand) -> DVector<f64>;

    fn disturbance_to_native(&self, disturbance: &DVector<f64>) -> Result<NativeDisturbance, ConfigurationFault>;
}

/// Quadrotor flying in the y-z plane.
///
/// Generic control is `[tan(roll), thrust]`; pitch and yaw rate are zeroed.
#[derive(Debug, Clone, Default)]
pub struct PlanarQuadrotorInterface {
    /// Emit prioritized commands (`priority = 1.0`)
    pub prioritized: bool,
}

impl PlatformInterface for PlanarQuadrotorInterface {
    fn name(&self) -> &'static str {
        if self.prioritized {
            "planar_quadrotor_prioritized"
        } else {
            "planar_quadrotor"
        }
    }

    fn state_from_native(&self, native: &NativeState) -> DVector<f64> {
        DVector::from_vec(vec![native.y, native.z, native.y_dot, native.z_dot])
    }

    fn to_native(&self, control: &DVector<f64>) -> Result<NativeCommand, ConfigurationFault> {
        if control.len() != 2 {
            return Err(ConfigurationFault::dimension("planar quadrotor control", 2, control.len()));
        }
        Ok(NativeCommand {
            roll: control[0].atan(),
            pitch: 0.0,
            yaw_rate: 0.0,
            thrust: control[1],
            priority: self.prioritized.then_some(1.0),
        })
    }

    fn from_native(&self, command: &NativeCommand) -> DVector<f64> {
        DVector::from_vec(vec![command.roll.tan(), command.thrust])
    }

    fn disturbance_to_native(&self, disturbance: &DVector<f64>) -> Result<NativeDisturbance, ConfigurationFault> {
        if disturbance.len() != 4 {
            return Err(ConfigurationFault::dimension(
                "planar quadrotor disturbance",
                4,
                disturbance.len(),
            ));
        }
        Ok(NativeDisturbance {
            y: disturbance[0],
            z: disturbance[1],
            y_dot: disturbance[2],
            z_dot: disturbance[3],
        })
    }
}

/// Platform selected by configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlatformKind {
    PlanarQuadrotor,
    PlanarQuadrotorPrioritized,
}

impl PlatformKind {
    pub fn build(self) -> Arc<dyn PlatformInterface> {
        match self {
            PlatformKind::PlanarQuadrotor => Arc::new(PlanarQuadrotorInterface { prioritized: false }),
            PlatformKind::PlanarQuadrotorPrioritized => {
                Arc::new(PlanarQuadrotorInterface { prioritized: true })
            }
        }
    }
}

impl FromStr for PlatformKind {
    type Err = UnsupportedMode;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "planar_quadrotor" | "crazyflie" => Ok(PlatformKind::PlanarQuadrotor),
            "planar_quadrotor_prioritized" => Ok(PlatformKind::PlanarQuadrotorPrioritized),
            _ => Err(UnsupportedMode {
                kind: "platform",
                value: s.to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use proptest::prelude::*;

    #[test]
    fn test_roll_round_trip() {
        let platform = PlanarQuadrotorInterface::default();
        let native = NativeCommand {
            roll: 0.2,
            thrust: 9.5,
            ..NativeCommand::default()
        };
        let reduced = platform.from_native(&native);
        assert_relative_eq!(reduced[0], 0.2f64.tan());
        let back = platform.to_native(&reduced).unwrap();
        assert_relative_eq!(back.roll, 0.2, epsilon = 1e-12);
        assert_eq!(back.thrust, 9.5);
        assert_eq!(back.pitch, 0.0);
        assert_eq!(back.yaw_rate, 0.0);
        assert_eq!(back.priority, None);
    }

    #[test]
    fn test_prioritized_sets_priority() {
        let platform = PlatformKind::PlanarQuadrotorPrioritized.build();
        let cmd = platform.to_native(&DVector::from_vec(vec![0.0, 1.0])).unwrap();
        assert_eq!(cmd.priority, Some(1.0));
        assert_eq!(platform.name(), "planar_quadrotor_prioritized");
    }

    #[test]
    fn test_state_and_disturbance_mapping() {
        let platform = PlanarQuadrotorInterface::default();
        let native = NativeState {
            x: 9.0,
            y: 1.0,
            z: 2.0,
            x_dot: 9.0,
            y_dot: 3.0,
            z_dot: 4.0,
            yaw: 0.5,
        };
        assert_eq!(
            platform.state_from_native(&native),
            DVector::from_vec(vec![1.0, 2.0, 3.0, 4.0])
        );
        let d = platform
            .disturbance_to_native(&DVector::from_vec(vec![0.1, 0.2, 0.3, 0.4]))
            .unwrap();
        assert_eq!(d.z_dot, 0.4);
        assert!(platform.disturbance_to_native(&DVector::zeros(2)).is_err());
    }

    #[test]
    fn test_rejects_wrong_control_length() {
        let platform = PlanarQuadrotorInterface::default();
        assert!(platform.to_native(&DVector::zeros(3)).is_err());
    }

    #[test]
    fn test_unknown_platform() {
        assert!("rover".parse::<PlatformKind>().is_err());
        assert_eq!("crazyflie".parse::<PlatformKind>(), Ok(PlatformKind::PlanarQuadrotor));
    }

    proptest! {
        #[test]
        fn prop_native_round_trip(roll in -1.4f64..1.4, thrust in 0.0f64..20.0) {
            let platform = PlanarQuadrotorInterface::default();
            let native = NativeCommand { roll, thrust, ..NativeCommand::default() };
            let back = platform.to_native(&platform.from_native(&native)).unwrap();
            prop_assert!((back.roll - roll).abs() < 1e-12);
            prop_assert_eq!(back.thrust, thrust);
        }
    }
}
