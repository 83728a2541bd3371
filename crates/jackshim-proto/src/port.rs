use crate::error::ProtocolError;

/// Port data-type tag, matching the legacy API's integer type ids.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortType {
    Audio = 0,
    Midi = 1,
    Video = 2,
    Other = 3,
}

impl PortType {
    /// The bit-exact type strings the legacy API returns from `port_type()`.
    pub const AUDIO_STR: &'static str = "32 bit float mono audio";
    pub const MIDI_STR: &'static str = "8 bit raw midi";
    pub const VIDEO_STR: &'static str = "32 bit float RGBA video";
    pub const OTHER_STR: &'static str = "other";

    pub fn as_str(self) -> &'static str {
        match self {
            PortType::Audio => Self::AUDIO_STR,
            PortType::Midi => Self::MIDI_STR,
            PortType::Video => Self::VIDEO_STR,
            PortType::Other => Self::OTHER_STR,
        }
    }

    pub fn from_u32(v: u32) -> Result<Self, ProtocolError> {
        match v {
            0 => Ok(PortType::Audio),
            1 => Ok(PortType::Midi),
            2 => Ok(PortType::Video),
            3 => Ok(PortType::Other),
            other => Err(ProtocolError::FormatMismatch(format!("unknown port type id {other}"))),
        }
    }
}

/// Per-port flag bits, matching the legacy API's `JackPortFlags` bitfield.
/// Implemented as a plain `u32` newtype rather than a bitflags crate since
/// the vocabulary is small and fixed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PortFlags(pub u32);

impl PortFlags {
    pub const IS_INPUT: u32 = 0x01;
    pub const IS_OUTPUT: u32 = 0x02;
    pub const IS_PHYSICAL: u32 = 0x04;
    pub const CAN_MONITOR: u32 = 0x08;
    pub const IS_TERMINAL: u32 = 0x10;
    pub const IS_CONTROL_VOLTAGE: u32 = 0x100;

    pub fn new(bits: u32) -> Self {
        PortFlags(bits)
    }

    pub fn contains(self, bit: u32) -> bool {
        self.0 & bit != 0
    }

    pub fn is_input(self) -> bool {
        self.contains(Self::IS_INPUT)
    }

    pub fn is_output(self) -> bool {
        self.contains(Self::IS_OUTPUT)
    }

    pub fn is_physical(self) -> bool {
        self.contains(Self::IS_PHYSICAL)
    }

    pub fn is_terminal(self) -> bool {
        self.contains(Self::IS_TERMINAL)
    }

    pub fn is_control(self) -> bool {
        self.contains(Self::IS_CONTROL_VOLTAGE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn type_strings_are_exact() {
        assert_eq!(PortType::Audio.as_str(), "32 bit float mono audio");
        assert_eq!(PortType::Midi.as_str(), "8 bit raw midi");
        assert_eq!(PortType::Video.as_str(), "32 bit float RGBA video");
        assert_eq!(PortType::Other.as_str(), "other");
    }

    #[test]
    fn flags_roundtrip() {
        let f = PortFlags::new(PortFlags::IS_OUTPUT | PortFlags::IS_TERMINAL);
        assert!(f.is_output());
        assert!(f.is_terminal());
        assert!(!f.is_input());
    }
}
