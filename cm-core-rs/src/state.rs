//! Charger state reported to the manager
//!
//! State packets combine the values the caller passes in with feature flags
//! and meter readings queried from a [`SystemState`]. Readings of features the
//! charger does not have are sent as zero.

use crate::error::CmError;
use crate::protocol::{feature_flags, state_flags, StatePacket, StateV1, StateV2, StateV3};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Feature names understood by [`SystemState::has_feature`]
pub mod feature {
    pub const PHASE_SWITCH: &str = "phase_switch";
    pub const CP_DISCONNECT: &str = "cp_disconnect";
    pub const EVSE: &str = "evse";
    pub const NFC: &str = "nfc";
    pub const METER_ALL_VALUES: &str = "meter_all_values";
    pub const METER_PHASES: &str = "meter_phases";
    pub const METER: &str = "meter";
    pub const BUTTON_CONFIGURATION: &str = "button_configuration";
}

/// Per-phase connection state from the meter
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct MeterPhases {
    pub connected: [bool; 3],
    pub active: [bool; 3],
}

/// Per-phase readings from the meter
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct LineValues {
    pub voltages: [f32; 3],
    pub currents: [f32; 3],
    pub power_factors: [f32; 3],
}

/// Totals from the meter
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct MeterValues {
    pub power: f32,
    pub energy_rel: f32,
    pub energy_abs: f32,
}

/// Live system state queried while assembling state packets
pub trait SystemState: Send {
    fn has_feature(&self, name: &str) -> bool;

    fn meter_phases(&self) -> Option<MeterPhases>;

    fn line_values(&self) -> Option<LineValues>;

    fn meter_values(&self) -> Option<MeterValues>;
}

/// Fixed system state, e.g. loaded from a JSON file
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StaticSystemState {
    pub features: Vec<String>,
    pub meter_phases: Option<MeterPhases>,
    pub line_values: Option<LineValues>,
    pub meter_values: Option<MeterValues>,
}

impl StaticSystemState {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, CmError> {
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    pub fn with_feature(mut self, name: &str) -> Self {
        if !self.has_feature(name) {
            self.features.push(name.to_string());
        }
        self
    }
}

impl SystemState for StaticSystemState {
    fn has_feature(&self, name: &str) -> bool {
        self.features.iter().any(|f| f == name)
    }

    fn meter_phases(&self) -> Option<MeterPhases> {
        self.meter_phases
    }

    fn line_values(&self) -> Option<LineValues> {
        self.line_values
    }

    fn meter_values(&self) -> Option<MeterValues> {
        self.meter_values
    }
}

/// Values the charger reports on every state packet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ChargerStatus {
    pub esp32_uid: u32,
    pub iec61851_state: u8,
    pub charger_state: u8,
    pub time_since_state_change: u32,
    pub error_state: u8,
    pub uptime: u32,
    pub car_stopped_charging: u32,
    pub allowed_charging_current: u16,
    pub supported_current: u16,
    pub managed: bool,
    pub cp_disconnected: bool,
    pub phases: i8,
    pub can_switch_phases: bool,
}

fn flag(set: bool, bit: u8) -> u8 {
    if set {
        bit
    } else {
        0
    }
}

/// Feature flag byte for the features `system` reports
pub fn collect_feature_flags(system: &dyn SystemState) -> u8 {
    [
        (feature::PHASE_SWITCH, feature_flags::PHASE_SWITCH),
        (feature::CP_DISCONNECT, feature_flags::CP_DISCONNECT),
        (feature::EVSE, feature_flags::EVSE),
        (feature::NFC, feature_flags::NFC),
        (feature::METER_ALL_VALUES, feature_flags::METER_ALL_VALUES),
        (feature::METER_PHASES, feature_flags::METER_PHASES),
        (feature::METER, feature_flags::METER),
        (feature::BUTTON_CONFIGURATION, feature_flags::BUTTON_CONFIGURATION),
    ]
    .into_iter()
    .fold(0, |flags, (name, bit)| flags | flag(system.has_feature(name), bit))
}

/// Assemble a current-version state packet
pub fn build_state_packet(seq_num: u16, status: &ChargerStatus, system: &dyn SystemState) -> StatePacket {
    let mut v1 = StateV1 {
        feature_flags: collect_feature_flags(system),
        esp32_uid: status.esp32_uid,
        evse_uptime: status.uptime,
        car_stopped_charging: status.car_stopped_charging,
        allowed_charging_current: status.allowed_charging_current,
        supported_current: status.supported_current,
        iec61851_state: status.iec61851_state,
        charger_state: status.charger_state,
        error_state: status.error_state,
        state_flags: flag(status.managed, state_flags::MANAGED)
            | flag(status.cp_disconnected, state_flags::CP_DISCONNECTED),
        ..Default::default()
    };

    if system.has_feature(feature::METER_PHASES) {
        if let Some(phases) = system.meter_phases() {
            let connected = [
                state_flags::L1_CONNECTED,
                state_flags::L2_CONNECTED,
                state_flags::L3_CONNECTED,
            ];
            let active = [
                state_flags::L1_ACTIVE,
                state_flags::L2_ACTIVE,
                state_flags::L3_ACTIVE,
            ];
            for i in 0..3 {
                v1.state_flags |= flag(phases.connected[i], connected[i]);
                v1.state_flags |= flag(phases.active[i], active[i]);
            }
        }
    }

    if system.has_feature(feature::METER_ALL_VALUES) {
        if let Some(values) = system.line_values() {
            v1.line_voltages = values.voltages;
            v1.line_currents = values.currents;
            v1.line_power_factors = values.power_factors;
        }
    }

    if system.has_feature(feature::METER) {
        if let Some(values) = system.meter_values() {
            v1.power_total = values.power;
            v1.energy_rel = values.energy_rel;
            v1.energy_abs = values.energy_abs;
        }
    }

    StatePacket::new(
        seq_num,
        v1,
        StateV2 {
            time_since_state_change: status.time_since_state_change,
        },
        StateV3::new(status.phases, status.can_switch_phases),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn status() -> ChargerStatus {
        ChargerStatus {
            esp32_uid: 0x1234,
            iec61851_state: 2,
            charger_state: 3,
            time_since_state_change: 1500,
            uptime: 99,
            allowed_charging_current: 16000,
            supported_current: 32000,
            managed: true,
            phases: 3,
            can_switch_phases: true,
            ..Default::default()
        }
    }

    fn full_meter() -> StaticSystemState {
        StaticSystemState {
            meter_phases: Some(MeterPhases {
                connected: [true, true, false],
                active: [true, false, false],
            }),
            line_values: Some(LineValues {
                voltages: [230.0, 231.0, 229.0],
                currents: [16.0, 0.0, 0.0],
                power_factors: [1.0, 0.0, 0.0],
            }),
            meter_values: Some(MeterValues {
                power: 3680.0,
                energy_rel: 1.5,
                energy_abs: 300.0,
            }),
            ..Default::default()
        }
        .with_feature(feature::EVSE)
        .with_feature(feature::METER)
        .with_feature(feature::METER_PHASES)
        .with_feature(feature::METER_ALL_VALUES)
    }

    #[test]
    fn test_feature_absent_fields_are_zero() {
        // Readings are present but the features are not advertised.
        let mut system = full_meter();
        system.features.clear();

        let packet = build_state_packet(5, &status(), &system);
        assert_eq!(packet.v1.feature_flags, 0);
        assert_eq!(packet.v1.state_flags, state_flags::MANAGED);
        assert_eq!(packet.v1.line_voltages, [0.0; 3]);
        assert_eq!(packet.v1.power_total, 0.0);
        assert_eq!(packet.v1.energy_abs, 0.0);
        assert_eq!(packet.header.seq_num, 5);
    }

    #[test]
    fn test_meter_values_included() {
        let packet = build_state_packet(0, &status(), &full_meter());

        assert!(packet.v1.has_feature(feature_flags::METER));
        assert!(packet.v1.has_feature(feature_flags::EVSE));
        assert!(!packet.v1.has_feature(feature_flags::NFC));
        assert_eq!(
            packet.v1.state_flags,
            state_flags::MANAGED
                | state_flags::L1_CONNECTED
                | state_flags::L2_CONNECTED
                | state_flags::L1_ACTIVE
        );
        assert_eq!(packet.v1.line_currents, [16.0, 0.0, 0.0]);
        assert_eq!(packet.v1.power_total, 3680.0);
        assert_eq!(packet.v2.unwrap().time_since_state_change, 1500);

        let v3 = packet.v3.unwrap();
        assert_eq!(v3.phase_count(), 3);
        assert!(v3.can_switch_phases());
    }

    #[test]
    fn test_load_state_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"features": ["evse", "meter"], "meter_values": {{"power": 11000.0, "energy_rel": 2.0, "energy_abs": 10.0}}}}"#
        )
        .unwrap();

        let system = StaticSystemState::load(file.path()).unwrap();
        assert!(system.has_feature(feature::METER));
        assert!(!system.has_feature(feature::NFC));
        assert_eq!(system.meter_values().unwrap().power, 11000.0);
        assert_eq!(system.meter_phases(), None);
    }

    #[test]
    fn test_load_invalid_state_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "not json").unwrap();
        assert!(matches!(
            StaticSystemState::load(file.path()),
            Err(CmError::StateFile(_))
        ));
    }
}
