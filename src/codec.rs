use crate::error::{Result, VeloError};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Marker byte identifying a Fitness Machine Control Point response frame
pub const FTMS_RESPONSE_CODE: u8 = 0x80;

/// Maximum target power accepted by `SetTargetPower`, in watts
pub const MAX_TARGET_POWER_WATTS: i32 = 2000;

/// Maximum simulated grade magnitude accepted by `SetSimulation`, in percent
pub const MAX_GRADE_PERCENT: f64 = 45.0;

/// Decoded Heart Rate Measurement (characteristic 0x2A37)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartRateMeasurement {
    /// Heart rate in beats per minute
    pub heart_rate: u16,
    /// Whether the sensor reports skin contact right now
    pub is_contact_detected: bool,
    /// Whether the sensor supports contact detection at all
    pub contact_supported: bool,
}

/// Decoded Cycling Power Measurement (characteristic 0x2A63)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CyclingPowerMeasurement {
    /// Instantaneous power in watts, negative readings clamped to 0
    pub power_watts: u16,
    /// Cumulative crank revolutions, if the crank data flag is set
    pub crank_revolutions: Option<u16>,
    /// Last crank event time in 1/1024 s ticks, if crank data is present
    pub last_crank_event_time: Option<u16>,
    /// Cumulative wheel revolutions, if the wheel data flag is set
    pub wheel_revolutions: Option<u32>,
    /// Last wheel event time in 1/1024 s ticks, if wheel data is present
    pub last_wheel_event_time: Option<u16>,
}

/// Decoded CSC Measurement (characteristic 0x2A5B)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CscMeasurement {
    /// Cumulative crank revolutions, if present
    pub crank_revolutions: Option<u16>,
    /// Last crank event time in 1/1024 s ticks, if present
    pub last_crank_event_time: Option<u16>,
    /// Cumulative wheel revolutions, if present
    pub wheel_revolutions: Option<u32>,
    /// Last wheel event time in 1/1024 s ticks, if present
    pub last_wheel_event_time: Option<u16>,
}

/// FTMS Control Point request opcodes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ControlOpcode {
    /// Request control of the fitness machine
    RequestControl = 0x00,
    /// Set target resistance level
    SetTargetResistance = 0x04,
    /// Set target power (ERG mode)
    SetTargetPower = 0x05,
    /// Set indoor bike simulation parameters (SIM mode)
    SetIndoorBikeSimulation = 0x11,
}

impl ControlOpcode {
    /// Convert from the raw opcode byte echoed in a response frame
    #[must_use]
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x00 => Some(Self::RequestControl),
            0x04 => Some(Self::SetTargetResistance),
            0x05 => Some(Self::SetTargetPower),
            0x11 => Some(Self::SetIndoorBikeSimulation),
            _ => None,
        }
    }
}

/// FTMS Control Point result codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlResult {
    /// Operation completed successfully
    Success,
    /// Opcode not supported by this machine
    NotSupported,
    /// Parameter out of the machine's accepted range
    InvalidParameter,
    /// Operation failed for a machine-internal reason
    OperationFailed,
    /// Control was not requested or was revoked
    ControlNotPermitted,
    /// Result code outside the specified set
    Unknown(u8),
}

impl From<u8> for ControlResult {
    fn from(value: u8) -> Self {
        match value {
            0x01 => Self::Success,
            0x02 => Self::NotSupported,
            0x03 => Self::InvalidParameter,
            0x04 => Self::OperationFailed,
            0x05 => Self::ControlNotPermitted,
            other => Self::Unknown(other),
        }
    }
}

/// A decoded FTMS Control Point response frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlResponse {
    /// The request opcode this response echoes
    pub request_opcode: Option<ControlOpcode>,
    /// Raw echoed opcode byte, kept for logging unknown opcodes
    pub raw_opcode: u8,
    /// Result code reported by the machine
    pub result: ControlResult,
}

/// FTMS Control Point commands with their wire encoding.
///
/// All parameters are clamped to the FTMS-specified ranges before encoding,
/// so a frame produced by [`ControlCommand::encode`] is always in range.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ControlCommand {
    /// Request control of the machine (opcode 0x00, 1-byte frame)
    RequestControl,
    /// Set target power in watts (opcode 0x05, 3-byte frame)
    SetTargetPower {
        /// Target power in watts, clamped to [0, 2000]
        watts: i32,
    },
    /// Set indoor bike simulation parameters (opcode 0x11, 7-byte frame)
    SetSimulation {
        /// Wind speed in m/s, encoded as i16 in 0.001 m/s units
        wind_mps: f64,
        /// Grade in percent, clamped to [-45, 45], encoded in 0.01% units
        grade_percent: f64,
        /// Rolling resistance coefficient, encoded as u8 in 0.0001 units
        crr: f64,
        /// Wind resistance coefficient in kg/m, encoded as u8 in 0.01 units
        cw: f64,
    },
    /// Set target resistance level (opcode 0x04, 2-byte frame)
    SetResistance {
        /// Resistance level in percent, clamped to [0, 100], 0.5% resolution
        percent: f64,
    },
}

impl ControlCommand {
    /// Opcode byte for this command
    #[must_use]
    pub const fn opcode(&self) -> ControlOpcode {
        match self {
            Self::RequestControl => ControlOpcode::RequestControl,
            Self::SetTargetPower { .. } => ControlOpcode::SetTargetPower,
            Self::SetSimulation { .. } => ControlOpcode::SetIndoorBikeSimulation,
            Self::SetResistance { .. } => ControlOpcode::SetTargetResistance,
        }
    }

    /// Serialize the command to a control-point write frame.
    ///
    /// Little-endian throughout, per the FTMS specification.
    #[must_use]
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(7);
        buf.put_u8(self.opcode() as u8);

        match *self {
            Self::RequestControl => {}
            Self::SetTargetPower { watts } => {
                let clamped = watts.clamp(0, MAX_TARGET_POWER_WATTS);
                #[allow(clippy::cast_possible_truncation)]
                buf.put_i16_le(clamped as i16);
            }
            Self::SetSimulation {
                wind_mps,
                grade_percent,
                crr,
                cw,
            } => {
                let grade = grade_percent.clamp(-MAX_GRADE_PERCENT, MAX_GRADE_PERCENT);
                #[allow(clippy::cast_possible_truncation)]
                {
                    buf.put_i16_le((wind_mps * 1000.0).round() as i16);
                    buf.put_i16_le((grade * 100.0).round() as i16);
                    buf.put_u8((crr * 10_000.0).round().clamp(0.0, 255.0) as u8);
                    buf.put_u8((cw * 100.0).round().clamp(0.0, 255.0) as u8);
                }
            }
            Self::SetResistance { percent } => {
                let clamped = percent.clamp(0.0, 100.0);
                // Wire resolution is 0.5%, so the unit value is percent * 2
                #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
                buf.put_u8((clamped * 2.0).round() as u8);
            }
        }

        buf.freeze()
    }
}

fn short_buffer(what: &str, len: usize, needed: usize) -> VeloError {
    VeloError::Decode(format!("{what}: {len} bytes, expected at least {needed}"))
}

/// Decode a Heart Rate Measurement frame.
///
/// Byte 0 is a flags field: bit 0 selects 8-bit vs 16-bit LE heart rate,
/// bits 1-2 encode sensor contact status (00/01 = unsupported, 10 = supported
/// but no contact, 11 = supported and detected).
///
/// # Errors
///
/// Returns [`VeloError::Decode`] if the buffer is too short for the format
/// selected by its flags.
pub fn decode_heart_rate(data: &[u8]) -> Result<HeartRateMeasurement> {
    if data.len() < 2 {
        return Err(short_buffer("heart rate frame", data.len(), 2));
    }

    let mut buf = data;
    let flags = buf.get_u8();

    let heart_rate = if flags & 0x01 == 0 {
        u16::from(buf.get_u8())
    } else {
        if buf.remaining() < 2 {
            return Err(short_buffer("16-bit heart rate frame", data.len(), 3));
        }
        buf.get_u16_le()
    };

    let contact_status = (flags & 0x06) >> 1;

    Ok(HeartRateMeasurement {
        heart_rate,
        is_contact_detected: contact_status == 3,
        contact_supported: contact_status >= 2,
    })
}

/// Decode a Cycling Power Measurement frame.
///
/// Bytes 0-1 are a 16-bit LE flags field. Instantaneous power is a signed
/// 16-bit value at bytes 2-3; negative readings are clamped to 0. Optional
/// fields follow in fixed order, each present only if its flag bit is set:
/// pedal power balance (bit 0, 1 byte), accumulated torque (bit 2, 2 bytes),
/// wheel revolution data (bit 4, u32 count + u16 event time), crank
/// revolution data (bit 5, u16 count + u16 event time).
///
/// # Errors
///
/// Returns [`VeloError::Decode`] if the buffer is shorter than its flags
/// claim.
pub fn decode_cycling_power(data: &[u8]) -> Result<CyclingPowerMeasurement> {
    if data.len() < 4 {
        return Err(short_buffer("cycling power frame", data.len(), 4));
    }

    let mut buf = data;
    let flags = buf.get_u16_le();

    let has_pedal_balance = flags & 0x0001 != 0;
    let has_torque = flags & 0x0004 != 0;
    let has_wheel_data = flags & 0x0010 != 0;
    let has_crank_data = flags & 0x0020 != 0;

    let instant_power = buf.get_i16_le();
    #[allow(clippy::cast_sign_loss)]
    let power_watts = instant_power.max(0) as u16;

    let mut measurement = CyclingPowerMeasurement {
        power_watts,
        ..Default::default()
    };

    if has_pedal_balance {
        if buf.remaining() < 1 {
            return Err(short_buffer("pedal balance field", data.len(), 5));
        }
        buf.advance(1);
    }

    if has_torque {
        if buf.remaining() < 2 {
            return Err(short_buffer("accumulated torque field", data.len(), 6));
        }
        buf.advance(2);
    }

    if has_wheel_data {
        if buf.remaining() < 6 {
            return Err(short_buffer("wheel revolution data", data.len(), 10));
        }
        measurement.wheel_revolutions = Some(buf.get_u32_le());
        measurement.last_wheel_event_time = Some(buf.get_u16_le());
    }

    if has_crank_data {
        if buf.remaining() < 4 {
            return Err(short_buffer("crank revolution data", data.len(), 8));
        }
        measurement.crank_revolutions = Some(buf.get_u16_le());
        measurement.last_crank_event_time = Some(buf.get_u16_le());
    }

    Ok(measurement)
}

/// Decode a CSC Measurement frame.
///
/// Byte 0 flags: bit 0 = crank revolution data present (u16 count + u16 event
/// time), bit 1 = wheel revolution data present (u32 count + u16 event time).
/// Per the SIG CSC specification the wheel block precedes the crank block
/// when both are present.
///
/// # Errors
///
/// Returns [`VeloError::Decode`] if the buffer is shorter than its flags
/// claim.
pub fn decode_csc_measurement(data: &[u8]) -> Result<CscMeasurement> {
    if data.is_empty() {
        return Err(short_buffer("CSC frame", 0, 1));
    }

    let mut buf = data;
    let flags = buf.get_u8();

    let has_wheel_data = flags & 0x02 != 0;
    let has_crank_data = flags & 0x01 != 0;

    let mut measurement = CscMeasurement::default();

    if has_wheel_data {
        if buf.remaining() < 6 {
            return Err(short_buffer("CSC wheel data", data.len(), 7));
        }
        measurement.wheel_revolutions = Some(buf.get_u32_le());
        measurement.last_wheel_event_time = Some(buf.get_u16_le());
    }

    if has_crank_data {
        if buf.remaining() < 4 {
            return Err(short_buffer("CSC crank data", data.len(), 5));
        }
        measurement.crank_revolutions = Some(buf.get_u16_le());
        measurement.last_crank_event_time = Some(buf.get_u16_le());
    }

    Ok(measurement)
}

/// Decode an FTMS Control Point notification.
///
/// Returns `Ok(None)` when byte 0 is not the response-code marker (0x80);
/// such frames are not control-point responses and are ignored by callers.
///
/// # Errors
///
/// Returns [`VeloError::Decode`] if a response frame is shorter than the
/// 3 bytes the format requires.
pub fn decode_control_response(data: &[u8]) -> Result<Option<ControlResponse>> {
    if data.is_empty() || data[0] != FTMS_RESPONSE_CODE {
        return Ok(None);
    }

    if data.len() < 3 {
        return Err(short_buffer("control point response", data.len(), 3));
    }

    Ok(Some(ControlResponse {
        request_opcode: ControlOpcode::from_u8(data[1]),
        raw_opcode: data[1],
        result: ControlResult::from(data[2]),
    }))
}
