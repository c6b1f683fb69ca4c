//! Command frames: the outbound control vocabulary.

/// Commands a client may send to a device.
///
/// The numeric codes follow the IEEE C37.118 command word; the other
/// variants map onto the same vocabulary where the device supports it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandCode {
    /// Stop real-time data transmission.
    TurnOffTransmission,
    /// Start real-time data transmission.
    TurnOnTransmission,
    /// Request the ASCII header frame.
    SendHeaderFrame,
    /// Request configuration frame 1 (capabilities).
    SendConfig1,
    /// Request configuration frame 2 (current configuration).
    SendConfig2,
    /// Request configuration frame 3 (extended, 2011 revision only).
    SendConfig3,
    /// User-defined extended frame; payload travels after the command word.
    Extended,
}

impl CommandCode {
    /// Wire value of the command word.
    pub fn code(&self) -> u16 {
        match self {
            CommandCode::TurnOffTransmission => 0x0001,
            CommandCode::TurnOnTransmission => 0x0002,
            CommandCode::SendHeaderFrame => 0x0003,
            CommandCode::SendConfig1 => 0x0004,
            CommandCode::SendConfig2 => 0x0005,
            CommandCode::SendConfig3 => 0x0008,
            CommandCode::Extended => 0x0800,
        }
    }

    /// Map a received command word back to a code.
    pub fn from_code(code: u16) -> Option<Self> {
        match code {
            0x0001 => Some(CommandCode::TurnOffTransmission),
            0x0002 => Some(CommandCode::TurnOnTransmission),
            0x0003 => Some(CommandCode::SendHeaderFrame),
            0x0004 => Some(CommandCode::SendConfig1),
            0x0005 => Some(CommandCode::SendConfig2),
            0x0008 => Some(CommandCode::SendConfig3),
            0x0800 => Some(CommandCode::Extended),
            _ => None,
        }
    }
}

/// A decoded (or to-be-encoded) command frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandFrame {
    /// Target (outbound) or source (inbound) device IDCODE.
    pub device_id: u16,
    pub code: CommandCode,
    /// Extended-frame payload; empty for the standard commands.
    pub payload: Vec<u8>,
}

impl CommandFrame {
    pub fn new(device_id: u16, code: CommandCode) -> Self {
        Self { device_id, code, payload: Vec::new() }
    }

    pub fn with_payload(device_id: u16, code: CommandCode, payload: Vec<u8>) -> Self {
        Self { device_id, code, payload }
    }
}
