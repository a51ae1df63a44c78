//! Wire types for the charge-management protocol
//!
//! Every packet starts with a [`PacketHeader`] followed by a payload whose
//! layout is selected by the header's version. Payload versions are strictly
//! additive: a v3 state packet carries the v1 and v2 blocks unchanged and
//! appends its own. All integers and floats are little-endian.

use crate::validate::{ValidationError, COMMAND_LAYOUT, STATE_LAYOUT};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Magic number identifying charge-management packets
pub const PACKET_MAGIC: u32 = 34237;

/// Port chargers listen on for command packets
pub const CHARGE_MANAGEMENT_PORT: u16 = 34127;

/// Port the manager listens on for state packets
pub const CHARGE_MANAGER_PORT: u16 = 34128;

pub const HEADER_LEN: usize = 10;

pub const COMMAND_VERSION_MIN: u8 = 1;
pub const COMMAND_VERSION: u8 = 2;

pub const STATE_VERSION_MIN: u8 = 1;
pub const STATE_VERSION: u8 = 3;

pub(crate) const COMMAND_V1_LEN: usize = 4;
pub(crate) const STATE_V1_LEN: usize = 72;
pub(crate) const STATE_V2_LEN: usize = 4;
pub(crate) const STATE_V3_LEN: usize = 4;

/// Size of a current-version command packet
pub const COMMAND_PACKET_LEN: usize = HEADER_LEN + COMMAND_V1_LEN;

/// Size of a current-version state packet
pub const STATE_PACKET_LEN: usize = HEADER_LEN + STATE_V1_LEN + STATE_V2_LEN + STATE_V3_LEN;

/// Bits of `CommandV1::command_flags`
pub mod command_flags {
    pub const CP_DISCONNECT: u8 = 1 << 6;
}

/// Bits of `StateV1::feature_flags`
pub mod feature_flags {
    pub const PHASE_SWITCH: u8 = 1 << 0;
    pub const CP_DISCONNECT: u8 = 1 << 1;
    pub const EVSE: u8 = 1 << 2;
    pub const NFC: u8 = 1 << 3;
    pub const METER_ALL_VALUES: u8 = 1 << 4;
    pub const METER_PHASES: u8 = 1 << 5;
    pub const METER: u8 = 1 << 6;
    pub const BUTTON_CONFIGURATION: u8 = 1 << 7;
}

/// Bits of `StateV1::state_flags`
pub mod state_flags {
    pub const MANAGED: u8 = 1 << 7;
    pub const CP_DISCONNECTED: u8 = 1 << 6;
    pub const L1_CONNECTED: u8 = 1 << 5;
    pub const L2_CONNECTED: u8 = 1 << 4;
    pub const L3_CONNECTED: u8 = 1 << 3;
    pub const L1_ACTIVE: u8 = 1 << 2;
    pub const L2_ACTIVE: u8 = 1 << 1;
    pub const L3_ACTIVE: u8 = 1 << 0;
}

/// Layout of `StateV3::phases`
pub mod phases {
    pub const COUNT_MASK: i8 = 0b11;
    pub const CAN_SWITCH: i8 = 1 << 2;
}

/// Header shared by command and state packets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PacketHeader {
    pub magic: u32,
    pub version: u8,
    /// Total packet length in bytes, header included
    pub length: u16,
    pub seq_num: u16,
}

impl PacketHeader {
    pub fn new(version: u8, length: u16, seq_num: u16) -> Self {
        Self {
            magic: PACKET_MAGIC,
            version,
            length,
            seq_num,
        }
    }

    fn encode(&self, buf: &mut impl BufMut) {
        buf.put_u32_le(self.magic);
        buf.put_u8(self.version);
        buf.put_u8(0);
        buf.put_u16_le(self.length);
        buf.put_u16_le(self.seq_num);
    }

    /// Read the header at the front of a receive buffer.
    ///
    /// Bytes missing from a short buffer read as zero, the same as a
    /// zero-initialised receive buffer would. Validation rejects such
    /// headers based on the received byte count.
    pub fn peek(bytes: &[u8]) -> Self {
        let mut raw = [0u8; HEADER_LEN];
        let n = bytes.len().min(HEADER_LEN);
        raw[..n].copy_from_slice(&bytes[..n]);

        let mut buf = &raw[..];
        let magic = buf.get_u32_le();
        let version = buf.get_u8();
        buf.advance(1);
        let length = buf.get_u16_le();
        let seq_num = buf.get_u16_le();

        Self {
            magic,
            version,
            length,
            seq_num,
        }
    }
}

/// Command payload, version 1
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CommandV1 {
    /// Allocated current in mA
    pub allocated_current: u16,
    pub command_flags: u8,
}

/// Command payload, version 2. Occupies the reserved byte of v1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CommandV2 {
    pub allocated_phases: i8,
}

/// Manager to charger packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandPacket {
    pub header: PacketHeader,
    pub v1: CommandV1,
    pub v2: Option<CommandV2>,
}

impl CommandPacket {
    /// Build a current-version command packet
    pub fn new(
        seq_num: u16,
        allocated_current: u16,
        cp_disconnect_requested: bool,
        allocated_phases: i8,
    ) -> Self {
        let command_flags = if cp_disconnect_requested {
            command_flags::CP_DISCONNECT
        } else {
            0
        };

        Self {
            header: PacketHeader::new(COMMAND_VERSION, COMMAND_PACKET_LEN as u16, seq_num),
            v1: CommandV1 {
                allocated_current,
                command_flags,
            },
            v2: Some(CommandV2 { allocated_phases }),
        }
    }

    pub fn cp_disconnect_requested(&self) -> bool {
        self.v1.command_flags & command_flags::CP_DISCONNECT != 0
    }

    /// Allocated phases, 0 if the sender predates version 2
    pub fn allocated_phases(&self) -> i8 {
        self.v2.map_or(0, |v2| v2.allocated_phases)
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(COMMAND_PACKET_LEN);
        self.header.encode(&mut buf);
        buf.put_u16_le(self.v1.allocated_current);
        buf.put_u8(self.v1.command_flags);
        buf.put_i8(self.allocated_phases());
        buf.freeze()
    }

    /// Validate and decode a received command packet
    pub fn decode(bytes: &[u8]) -> Result<Self, ValidationError> {
        let header = PacketHeader::peek(bytes);
        COMMAND_LAYOUT.validate(&header, bytes.len())?;

        let mut buf = &bytes[HEADER_LEN..];
        let allocated_current = buf.get_u16_le();
        let command_flags = buf.get_u8();
        let allocated_phases = buf.get_i8();

        Ok(Self {
            header,
            v1: CommandV1 {
                allocated_current,
                command_flags,
            },
            v2: (header.version >= 2).then_some(CommandV2 { allocated_phases }),
        })
    }
}

/// State payload, version 1
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct StateV1 {
    pub feature_flags: u8,
    pub esp32_uid: u32,
    pub evse_uptime: u32,
    pub car_stopped_charging: u32,
    pub allowed_charging_current: u16,
    pub supported_current: u16,
    pub iec61851_state: u8,
    pub charger_state: u8,
    pub error_state: u8,
    pub state_flags: u8,
    pub line_voltages: [f32; 3],
    pub line_currents: [f32; 3],
    pub line_power_factors: [f32; 3],
    pub power_total: f32,
    pub energy_rel: f32,
    pub energy_abs: f32,
}

impl StateV1 {
    pub fn is_managed(&self) -> bool {
        self.state_flags & state_flags::MANAGED != 0
    }

    pub fn cp_disconnected(&self) -> bool {
        self.state_flags & state_flags::CP_DISCONNECTED != 0
    }

    pub fn has_feature(&self, flag: u8) -> bool {
        self.feature_flags & flag != 0
    }

    fn encode(&self, buf: &mut impl BufMut) {
        buf.put_u8(self.feature_flags);
        buf.put_u8(self.state_flags);
        buf.put_u8(self.iec61851_state);
        buf.put_u8(self.charger_state);
        buf.put_u8(self.error_state);
        buf.put_bytes(0, 3);
        buf.put_u32_le(self.esp32_uid);
        buf.put_u32_le(self.evse_uptime);
        buf.put_u32_le(self.car_stopped_charging);
        buf.put_u16_le(self.allowed_charging_current);
        buf.put_u16_le(self.supported_current);
        for values in [&self.line_voltages, &self.line_currents, &self.line_power_factors] {
            for v in values {
                buf.put_f32_le(*v);
            }
        }
        buf.put_f32_le(self.power_total);
        buf.put_f32_le(self.energy_rel);
        buf.put_f32_le(self.energy_abs);
    }

    fn decode(buf: &mut impl Buf) -> Self {
        let feature_flags = buf.get_u8();
        let state_flags = buf.get_u8();
        let iec61851_state = buf.get_u8();
        let charger_state = buf.get_u8();
        let error_state = buf.get_u8();
        buf.advance(3);
        let esp32_uid = buf.get_u32_le();
        let evse_uptime = buf.get_u32_le();
        let car_stopped_charging = buf.get_u32_le();
        let allowed_charging_current = buf.get_u16_le();
        let supported_current = buf.get_u16_le();

        let mut read_triple = || [buf.get_f32_le(), buf.get_f32_le(), buf.get_f32_le()];
        let line_voltages = read_triple();
        let line_currents = read_triple();
        let line_power_factors = read_triple();

        Self {
            feature_flags,
            esp32_uid,
            evse_uptime,
            car_stopped_charging,
            allowed_charging_current,
            supported_current,
            iec61851_state,
            charger_state,
            error_state,
            state_flags,
            line_voltages,
            line_currents,
            line_power_factors,
            power_total: buf.get_f32_le(),
            energy_rel: buf.get_f32_le(),
            energy_abs: buf.get_f32_le(),
        }
    }
}

/// State payload, version 2
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StateV2 {
    /// Milliseconds since the charger state last changed
    pub time_since_state_change: u32,
}

/// State payload, version 3
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StateV3 {
    pub phases: i8,
}

impl StateV3 {
    pub fn new(phase_count: i8, can_switch_phases: bool) -> Self {
        let mut phases = phase_count & phases::COUNT_MASK;
        if can_switch_phases {
            phases |= phases::CAN_SWITCH;
        }
        Self { phases }
    }

    pub fn phase_count(&self) -> i8 {
        self.phases & phases::COUNT_MASK
    }

    pub fn can_switch_phases(&self) -> bool {
        self.phases & phases::CAN_SWITCH != 0
    }
}

/// Charger to manager packet
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StatePacket {
    pub header: PacketHeader,
    pub v1: StateV1,
    pub v2: Option<StateV2>,
    pub v3: Option<StateV3>,
}

impl StatePacket {
    /// Build a current-version state packet
    pub fn new(seq_num: u16, v1: StateV1, v2: StateV2, v3: StateV3) -> Self {
        Self {
            header: PacketHeader::new(STATE_VERSION, STATE_PACKET_LEN as u16, seq_num),
            v1,
            v2: Some(v2),
            v3: Some(v3),
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(STATE_PACKET_LEN);
        self.header.encode(&mut buf);
        self.v1.encode(&mut buf);
        if let Some(v2) = &self.v2 {
            buf.put_u32_le(v2.time_since_state_change);
        }
        if let Some(v3) = &self.v3 {
            buf.put_i8(v3.phases);
            buf.put_bytes(0, 3);
        }
        buf.freeze()
    }

    /// Validate and decode a received state packet.
    ///
    /// Packets from newer protocol versions arrive truncated to the newest
    /// known layout; all known blocks are decoded and the rest is ignored.
    pub fn decode(bytes: &[u8]) -> Result<Self, ValidationError> {
        let header = PacketHeader::peek(bytes);
        STATE_LAYOUT.validate(&header, bytes.len())?;

        let mut buf = &bytes[HEADER_LEN..];
        let v1 = StateV1::decode(&mut buf);
        let v2 = (header.version >= 2).then(|| StateV2 {
            time_since_state_change: buf.get_u32_le(),
        });
        let v3 = (header.version >= 3).then(|| {
            let phases = buf.get_i8();
            buf.advance(3);
            StateV3 { phases }
        });

        Ok(Self { header, v1, v2, v3 })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_state() -> StatePacket {
        let v1 = StateV1 {
            feature_flags: feature_flags::EVSE | feature_flags::METER,
            esp32_uid: 0x00c0_ffee,
            evse_uptime: 123_456,
            car_stopped_charging: 0,
            allowed_charging_current: 16000,
            supported_current: 32000,
            iec61851_state: 2,
            charger_state: 3,
            error_state: 0,
            state_flags: state_flags::MANAGED | state_flags::L1_CONNECTED,
            line_voltages: [230.1, 229.8, 231.0],
            line_currents: [15.9, 0.0, 0.0],
            line_power_factors: [0.99, 0.0, 0.0],
            power_total: 3658.5,
            energy_rel: 12.25,
            energy_abs: 4711.0,
        };
        StatePacket::new(42, v1, StateV2 { time_since_state_change: 5000 }, StateV3::new(1, true))
    }

    #[test]
    fn test_packet_sizes() {
        assert_eq!(COMMAND_PACKET_LEN, 14);
        assert_eq!(STATE_PACKET_LEN, 90);
        assert_eq!(CommandPacket::new(1, 6000, false, 3).encode().len(), COMMAND_PACKET_LEN);
        assert_eq!(sample_state().encode().len(), STATE_PACKET_LEN);
    }

    #[test]
    fn test_header_layout() {
        let bytes = CommandPacket::new(0x0102, 6000, false, 3).encode();
        assert_eq!(&bytes[0..4], &PACKET_MAGIC.to_le_bytes());
        assert_eq!(bytes[4], COMMAND_VERSION);
        assert_eq!(&bytes[6..8], &(COMMAND_PACKET_LEN as u16).to_le_bytes());
        assert_eq!(&bytes[8..10], &[0x02, 0x01]);
    }

    #[test]
    fn test_state_v3_roundtrip() {
        let packet = sample_state();
        let bytes = packet.encode();
        let decoded = StatePacket::decode(&bytes).unwrap();

        assert_eq!(decoded, packet);
        assert_eq!(decoded.encode(), bytes);
        assert!(decoded.v1.is_managed());
        assert_eq!(decoded.v3.unwrap().phase_count(), 1);
        assert!(decoded.v3.unwrap().can_switch_phases());
    }

    #[test]
    fn test_command_flags() {
        let packet = CommandPacket::new(7, 6000, true, -1);
        let decoded = CommandPacket::decode(&packet.encode()).unwrap();

        assert!(decoded.cp_disconnect_requested());
        assert_eq!(decoded.v1.allocated_current, 6000);
        assert_eq!(decoded.allocated_phases(), -1);
    }

    #[test]
    fn test_command_v1_has_no_phases() {
        let mut packet = CommandPacket::new(7, 6000, false, 3);
        packet.header.version = 1;
        let decoded = CommandPacket::decode(&packet.encode()).unwrap();

        assert_eq!(decoded.v2, None);
        assert_eq!(decoded.allocated_phases(), 0);
    }

    #[test]
    fn test_state_v1_only() {
        let mut packet = sample_state();
        packet.header.version = 1;
        packet.header.length = (HEADER_LEN + STATE_V1_LEN) as u16;
        packet.v2 = None;
        packet.v3 = None;

        let bytes = packet.encode();
        assert_eq!(bytes.len(), HEADER_LEN + STATE_V1_LEN);

        let decoded = StatePacket::decode(&bytes).unwrap();
        assert_eq!(decoded.v2, None);
        assert_eq!(decoded.v3, None);
        assert_eq!(decoded.v1, packet.v1);
    }

    #[test]
    fn test_future_state_version_decodes_known_blocks() {
        let mut packet = sample_state();
        packet.header.version = 4;
        packet.header.length = STATE_PACKET_LEN as u16 + 8;

        // The receive buffer only holds the known layout.
        let decoded = StatePacket::decode(&packet.encode()).unwrap();
        assert_eq!(decoded.header.version, 4);
        assert_eq!(decoded.v3, packet.v3);
    }

    #[test]
    fn test_peek_short_buffer() {
        let header = PacketHeader::peek(&[0xbd, 0x85]);
        assert_eq!(header.magic, 0x85bd);
        assert_eq!(header.length, 0);
    }
}
