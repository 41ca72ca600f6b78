//! Command frames and their wire encoding.
//!
//! Commands travel to the hand as short ASCII tokens with colon-separated
//! fields:
//! - Motor move: `M<motor_id>:<angle>`
//! - Sensor configuration: `S<sensor_id>:<value>`
//! - Calibration: `C:<phase>` where phase is `START`, `STEP` or `COMPLETE`
//! - Emergency stop: `STOP`
//!
//! The protocol defines no checksum and no acknowledgement.

/// Literal token sent for an emergency stop.
pub const EMERGENCY_STOP_TOKEN: &[u8] = b"STOP";

/// Largest angle a motor accepts, in degrees.
pub const MAX_MOTOR_ANGLE: u16 = 180;

/// Phase of the calibration routine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum CalibrationPhase {
    /// Begin calibration.
    Start,
    /// Advance to the next calibration step.
    Step,
    /// Finish calibration.
    Complete,
}

impl CalibrationPhase {
    /// The token used on the wire.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Start => "START",
            Self::Step => "STEP",
            Self::Complete => "COMPLETE",
        }
    }

    /// Parse a wire token.
    pub fn from_token(token: &str) -> Option<Self> {
        match token {
            "START" => Some(Self::Start),
            "STEP" => Some(Self::Step),
            "COMPLETE" => Some(Self::Complete),
            _ => None,
        }
    }
}

impl std::fmt::Display for CalibrationPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single command for the hand.
///
/// Values are not range-checked here. Motor identifiers are 1-based and
/// angles are expected in `0..=MAX_MOTOR_ANGLE`; keeping them there is the
/// caller's job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum CommandFrame {
    /// Move a motor to an absolute angle.
    MotorMove {
        /// 1-based motor identifier.
        motor_id: u8,
        /// Target angle in degrees.
        angle_degrees: u16,
    },
    /// Set a sensor configuration value.
    SensorConfig {
        /// Sensor identifier.
        sensor_id: u8,
        /// Configuration value.
        value: i32,
    },
    /// Drive the calibration routine.
    Calibration {
        /// Calibration phase.
        phase: CalibrationPhase,
    },
    /// Stop all motion immediately.
    EmergencyStop,
}

impl CommandFrame {
    /// Build a motor move command.
    pub fn motor(motor_id: u8, angle_degrees: u16) -> Self {
        Self::MotorMove {
            motor_id,
            angle_degrees,
        }
    }

    /// Build a sensor configuration command.
    pub fn sensor(sensor_id: u8, value: i32) -> Self {
        Self::SensorConfig { sensor_id, value }
    }

    /// Build a calibration command.
    pub fn calibration(phase: CalibrationPhase) -> Self {
        Self::Calibration { phase }
    }

    /// Encode this command into its wire bytes.
    pub fn encode(&self) -> Vec<u8> {
        encode(self)
    }
}

impl std::fmt::Display for CommandFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MotorMove {
                motor_id,
                angle_degrees,
            } => write!(f, "M{}:{}", motor_id, angle_degrees),
            Self::SensorConfig { sensor_id, value } => write!(f, "S{}:{}", sensor_id, value),
            Self::Calibration { phase } => write!(f, "C:{}", phase),
            Self::EmergencyStop => write!(f, "STOP"),
        }
    }
}

/// Encode a command into the ASCII wire format.
///
/// Every variant has exactly one encoding and the result does not depend
/// on any link state.
pub fn encode(frame: &CommandFrame) -> Vec<u8> {
    match frame {
        CommandFrame::EmergencyStop => EMERGENCY_STOP_TOKEN.to_vec(),
        other => other.to_string().into_bytes(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_motor_encoding() {
        assert_eq!(encode(&CommandFrame::motor(1, 90)), b"M1:90".to_vec());
        assert_eq!(encode(&CommandFrame::motor(5, 0)), b"M5:0".to_vec());
        assert_eq!(
            encode(&CommandFrame::motor(3, MAX_MOTOR_ANGLE)),
            b"M3:180".to_vec()
        );
    }

    #[test]
    fn test_sensor_encoding() {
        assert_eq!(encode(&CommandFrame::sensor(2, 350)), b"S2:350".to_vec());
        assert_eq!(encode(&CommandFrame::sensor(1, -4)), b"S1:-4".to_vec());
    }

    #[test]
    fn test_calibration_encoding() {
        assert_eq!(
            encode(&CommandFrame::calibration(CalibrationPhase::Start)),
            b"C:START".to_vec()
        );
        assert_eq!(
            encode(&CommandFrame::calibration(CalibrationPhase::Step)),
            b"C:STEP".to_vec()
        );
        assert_eq!(
            encode(&CommandFrame::calibration(CalibrationPhase::Complete)),
            b"C:COMPLETE".to_vec()
        );
    }

    #[test]
    fn test_emergency_stop_is_literal() {
        assert_eq!(CommandFrame::EmergencyStop.encode(), b"STOP".to_vec());
    }

    #[test]
    fn test_phase_tokens() {
        for phase in [
            CalibrationPhase::Start,
            CalibrationPhase::Step,
            CalibrationPhase::Complete,
        ] {
            assert_eq!(CalibrationPhase::from_token(phase.as_str()), Some(phase));
        }
        assert_eq!(CalibrationPhase::from_token("start"), None);
    }
}
