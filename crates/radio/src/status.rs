//! Per-unit status as reported to the display layer

use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use crate::framing::Frame;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TargetState {
    Present,
    Absent,
    Unknown,
}

impl TargetState {
    pub fn to_byte(self) -> u8 {
        match self {
            TargetState::Unknown => 0,
            TargetState::Present => 1,
            TargetState::Absent => 2,
        }
    }

    pub fn from_byte(b: u8) -> Self {
        match b {
            1 => TargetState::Present,
            2 => TargetState::Absent,
            _ => TargetState::Unknown,
        }
    }
}

/// Status flag bits carried in the fourth byte of a status reply.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StatusFlags(pub u8);

impl StatusFlags {
    pub const LOW_BATTERY: u8 = 0x01;
    pub const FAULT: u8 = 0x02;

    pub fn contains(self, bit: u8) -> bool {
        self.0 & bit == bit
    }

    pub fn low_battery(self) -> bool {
        self.contains(Self::LOW_BATTERY)
    }

    pub fn fault(self) -> bool {
        self.contains(Self::FAULT)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetStatus {
    pub address: u8,
    pub state: TargetState,
    /// Percent, 0..=100.
    pub battery: Option<u8>,
    /// dBm.
    pub signal: Option<i16>,
    pub flags: StatusFlags,
    pub observed_at: SystemTime,
}

impl TargetStatus {
    /// Status for a unit that gave no valid reply within the retry budget.
    pub fn unknown(address: u8) -> Self {
        Self {
            address,
            state: TargetState::Unknown,
            battery: None,
            signal: None,
            flags: StatusFlags::default(),
            observed_at: SystemTime::now(),
        }
    }

    /// Maps a `GetStatus` reply payload `[state, battery, signal, flags]`.
    /// Trailing fields may be missing.
    pub fn from_reply(address: u8, frame: &Frame) -> Self {
        let p = &frame.payload;
        let Some(&state) = p.first() else {
            return Self::unknown(address);
        };

        Self {
            address,
            state: TargetState::from_byte(state),
            battery: p.get(1).copied().filter(|&b| b <= 100),
            signal: p.get(2).map(|&s| i16::from(s as i8)),
            flags: StatusFlags(p.get(3).copied().unwrap_or(0)),
            observed_at: SystemTime::now(),
        }
    }

    pub fn is_known(&self) -> bool {
        self.state != TargetState::Unknown
    }
}

/// Builds the payload a unit sends in reply to `GetStatus`.
pub fn encode_status_payload(state: TargetState, battery: u8, signal: i8, flags: StatusFlags) -> [u8; 4] {
    [state.to_byte(), battery, signal as u8, flags.0]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::framing::Command;

    fn reply(payload: &[u8]) -> Frame {
        Frame {
            command: Command::GetStatus.code(),
            address: 4,
            payload: payload.to_vec(),
        }
    }

    #[test]
    fn test_full_payload() {
        let payload = encode_status_payload(TargetState::Absent, 18, -71, StatusFlags(StatusFlags::LOW_BATTERY));
        let status = TargetStatus::from_reply(4, &reply(&payload));

        assert_eq!(status.state, TargetState::Absent);
        assert_eq!(status.battery, Some(18));
        assert_eq!(status.signal, Some(-71));
        assert!(status.flags.low_battery());
        assert!(!status.flags.fault());
    }

    #[test]
    fn test_state_only_payload() {
        let status = TargetStatus::from_reply(4, &reply(&[1]));
        assert_eq!(status.state, TargetState::Present);
        assert_eq!(status.battery, None);
        assert_eq!(status.signal, None);
        assert_eq!(status.flags, StatusFlags(0));
    }

    #[test]
    fn test_out_of_range_fields() {
        let status = TargetStatus::from_reply(4, &reply(&[9, 140]));
        assert_eq!(status.state, TargetState::Unknown);
        assert_eq!(status.battery, None);

        assert!(!TargetStatus::from_reply(4, &reply(&[])).is_known());
    }
}
