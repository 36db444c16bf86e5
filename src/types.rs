use serde::{Deserialize, Serialize};
use std::fmt;

/// Highest valid 11-bit standard identifier
pub const MAX_STANDARD_ID: u16 = 0x7FF;

/// Maximum classic CAN payload length in bytes
pub const MAX_PAYLOAD_LEN: usize = 8;

/// TEC value at which a node becomes error passive
pub const ERROR_PASSIVE_THRESHOLD: u16 = 128;

/// TEC value at which a node goes bus-off
pub const BUS_OFF_THRESHOLD: u16 = 256;

/// Logical level of a single bus bit
///
/// The bus behaves as a wired-AND: a single dominant driver overrides any
/// number of recessive ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BitPolarity {
    Dominant,
    Recessive,
}

impl BitPolarity {
    /// Resolve concurrently driven bits into the bus value
    ///
    /// An empty set of drivers leaves the bus recessive (idle).
    pub fn wired_and<I>(bits: I) -> BitPolarity
    where
        I: IntoIterator<Item = BitPolarity>,
    {
        if bits.into_iter().any(|b| b == BitPolarity::Dominant) {
            BitPolarity::Dominant
        } else {
            BitPolarity::Recessive
        }
    }

    /// Logic level (dominant = 0, recessive = 1)
    pub fn as_bit(self) -> u8 {
        match self {
            BitPolarity::Dominant => 0,
            BitPolarity::Recessive => 1,
        }
    }

    pub fn from_bit(bit: bool) -> Self {
        if bit {
            BitPolarity::Recessive
        } else {
            BitPolarity::Dominant
        }
    }

    pub fn complement(self) -> Self {
        match self {
            BitPolarity::Dominant => BitPolarity::Recessive,
            BitPolarity::Recessive => BitPolarity::Dominant,
        }
    }

    pub fn is_dominant(self) -> bool {
        self == BitPolarity::Dominant
    }
}

impl fmt::Display for BitPolarity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_bit())
    }
}

/// Protocol field a bus bit belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FrameField {
    Sof,
    Identifier,
    Rtr,
    Ide,
    Reserved0,
    Dlc,
    Data,
    Crc,
    CrcDelimiter,
    AckSlot,
    AckDelimiter,
    Eof,
    Intermission,
    Stuff,
    ErrorFlag,
    ErrorDelimiter,
}

impl FrameField {
    /// Fields that take part in identifier arbitration
    pub fn is_arbitration(self) -> bool {
        matches!(self, FrameField::Sof | FrameField::Identifier | FrameField::Rtr)
    }

    /// Fields covered by bit stuffing (SOF through CRC)
    pub fn is_stuffable(self) -> bool {
        matches!(
            self,
            FrameField::Sof
                | FrameField::Identifier
                | FrameField::Rtr
                | FrameField::Ide
                | FrameField::Reserved0
                | FrameField::Dlc
                | FrameField::Data
                | FrameField::Crc
        )
    }

    pub fn short_name(self) -> &'static str {
        match self {
            FrameField::Sof => "SOF",
            FrameField::Identifier => "ID",
            FrameField::Rtr => "RTR",
            FrameField::Ide => "IDE",
            FrameField::Reserved0 => "r0",
            FrameField::Dlc => "DLC",
            FrameField::Data => "DATA",
            FrameField::Crc => "CRC",
            FrameField::CrcDelimiter => "CRCdel",
            FrameField::AckSlot => "ACK",
            FrameField::AckDelimiter => "ACKdel",
            FrameField::Eof => "EOF",
            FrameField::Intermission => "IFS",
            FrameField::Stuff => "STUFF",
            FrameField::ErrorFlag => "ERRFLAG",
            FrameField::ErrorDelimiter => "ERRDEL",
        }
    }
}

/// Well-known identifiers used by the demo scenarios
pub mod can_ids {
    /// Periodic status message of the victim ECU
    pub const VICTIM_STATUS: u16 = 0x173;
    /// Low-priority bystander traffic
    pub const BYSTANDER_TELEMETRY: u16 = 0x2A0;
    /// High-priority bystander traffic
    pub const BYSTANDER_SPEED: u16 = 0x0C4;
}

/// Classic CAN data frame with an 11-bit identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CanFrame {
    pub id: u16,
    pub data: Vec<u8>, // 0-8 bytes
}

impl CanFrame {
    /// Build a frame; identifiers above 0x7FF are masked, not rejected
    pub fn new(id: u16, data: Vec<u8>) -> Self {
        Self {
            id: id & MAX_STANDARD_ID,
            data,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.data.len() <= MAX_PAYLOAD_LEN
    }

    /// Data length code as transmitted (payload truncated to 8 bytes)
    pub fn dlc(&self) -> u8 {
        self.data.len().min(MAX_PAYLOAD_LEN) as u8
    }
}

impl fmt::Display for CanFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let data = self
            .data
            .iter()
            .map(|b| format!("{:02X}", b))
            .collect::<Vec<_>>()
            .join(" ");
        write!(f, "0x{:03X} [{}] {}", self.id, self.dlc(), data)
    }
}

/// Stable per-node key used to route intents and report results
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId {
    pub name: String,
    pub id: u32,
}

impl NodeId {
    pub fn new(name: impl Into<String>, id: u32) -> Self {
        Self {
            name: name.into(),
            id,
        }
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.name, self.id)
    }
}

/// Fault confinement state, a pure function of the transmit error counter
///
/// Ordered by severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum FaultState {
    ErrorActive,
    ErrorPassive,
    BusOff,
}

impl FaultState {
    pub fn from_tec(tec: u16) -> Self {
        if tec >= BUS_OFF_THRESHOLD {
            FaultState::BusOff
        } else if tec >= ERROR_PASSIVE_THRESHOLD {
            FaultState::ErrorPassive
        } else {
            FaultState::ErrorActive
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FaultState::ErrorActive => "ERROR_ACTIVE",
            FaultState::ErrorPassive => "ERROR_PASSIVE",
            FaultState::BusOff => "BUS_OFF",
        }
    }
}

impl fmt::Display for FaultState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Kind of error flag a node raises after detecting a bit error
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorFlagKind {
    /// Dominant flag, destroys the frame for every node
    Active,
    /// Recessive flag, invisible under dominant traffic
    Passive,
}

impl ErrorFlagKind {
    pub fn polarity(self) -> BitPolarity {
        match self {
            ErrorFlagKind::Active => BitPolarity::Dominant,
            ErrorFlagKind::Passive => BitPolarity::Recessive,
        }
    }
}

impl fmt::Display for ErrorFlagKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorFlagKind::Active => write!(f, "ACTIVE"),
            ErrorFlagKind::Passive => write!(f, "PASSIVE"),
        }
    }
}
