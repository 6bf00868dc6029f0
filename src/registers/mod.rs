//! Static register catalogue of the SUN2000 inverter family.
//!
//! Every telemetry metric maps to one holding register range on the device. The
//! catalogue is grouped by category and read group by group in [`TELEMETRY_GROUPS`]
//! order, so a snapshot always carries exactly these categories.

use std::collections::HashSet;

use serde::Serialize;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RegisterFormat {
    U16,
    I16,
    U32,
    I32,
    Str,
}

/// Telemetry categories, in the order the reader walks them.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Power,
    VoltageCurrent,
    Energy,
    Temperature,
    Grid,
    Status,
    PvStrings,
}

impl Category {
    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Power => "power",
            Category::VoltageCurrent => "voltage_current",
            Category::Energy => "energy",
            Category::Temperature => "temperature",
            Category::Grid => "grid",
            Category::Status => "status",
            Category::PvStrings => "pv_strings",
        }
    }
}

impl std::fmt::Display for Category {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Register {
    pub name: &'static str,
    pub address: u16,
    /// Length in 16 bit words
    pub length: u16,
    pub format: RegisterFormat,
    /// Raw value is divided by this to get the engineering value
    pub gain: u32,
    pub unit: Option<&'static str>,
    /// Raw code to label, used for enumerated status words
    pub mappings: &'static [(u16, &'static str)],
}

impl Register {
    const fn new(name: &'static str, address: u16, format: RegisterFormat, gain: u32, unit: Option<&'static str>) -> Self {
        let length = match format {
            RegisterFormat::U16 | RegisterFormat::I16 => 1,
            RegisterFormat::U32 | RegisterFormat::I32 => 2,
            RegisterFormat::Str => 0,
        };
        Register { name, address, length, format, gain, unit, mappings: &[] }
    }

    const fn text(name: &'static str, address: u16, length: u16) -> Self {
        Register { name, address, length, format: RegisterFormat::Str, gain: 1, unit: None, mappings: &[] }
    }

    const fn mapped(self, mappings: &'static [(u16, &'static str)]) -> Self {
        Register { mappings, ..self }
    }

    /// One past the last word of this register
    pub fn end(&self) -> u32 {
        self.address as u32 + self.length as u32
    }
}

#[derive(Clone, Copy, Debug)]
pub struct RegisterGroup {
    pub category: Category,
    pub registers: &'static [Register],
}

use RegisterFormat::*;

const DEVICE_STATUS_LABELS: &[(u16, &str)] = &[
    (0x0000, "Standby: initializing"),
    (0x0001, "Standby: detecting insulation resistance"),
    (0x0002, "Standby: detecting irradiation"),
    (0x0003, "Standby: grid detecting"),
    (0x0100, "Starting"),
    (0x0200, "On-grid"),
    (0x0201, "Grid Connection: power limited"),
    (0x0202, "Grid Connection: self-derating"),
    (0x0300, "Shutdown: fault"),
    (0x0301, "Shutdown: command"),
    (0x0302, "Shutdown: OVGR"),
    (0x0303, "Shutdown: communication disconnected"),
    (0x0304, "Shutdown: power limited"),
    (0x0305, "Shutdown: manual startup required"),
    (0x0306, "Shutdown: DC switches disconnected"),
    (0x0401, "Grid scheduling: cosphi-P curve"),
    (0x0402, "Grid scheduling: Q-U curve"),
    (0x0500, "Spot-check ready"),
    (0x0501, "Spot-checking"),
    (0x0600, "Inspecting"),
    (0x0700, "AFCI self check"),
    (0x0800, "I-V scanning"),
    (0x0900, "DC input detection"),
    (0x0A00, "Running: off-grid charging"),
    (0xA000, "Standby: no irradiation"),
];

pub const MODEL_NAME: Register = Register::text("model_name", 30000, 15);
pub const SERIAL_NUMBER: Register = Register::text("serial_number", 30015, 10);
pub const PN: Register = Register::text("pn", 30025, 10);
pub const MODEL_ID: Register = Register::new("model_id", 30070, U16, 1, None);
pub const NB_PV_STRINGS: Register = Register::new("nb_pv_strings", 30071, U16, 1, None);
pub const RATED_POWER: Register = Register::new("rated_power", 30073, U32, 1, Some("W"));
pub const DEVICE_STATUS: Register = Register::new("device_status", 32089, U16, 1, None).mapped(DEVICE_STATUS_LABELS);

pub const POWER: &[Register] = &[
    Register::new("input_power", 32064, I32, 1, Some("W")),
    Register::new("active_power", 32080, I32, 1, Some("W")),
    Register::new("reactive_power", 32082, I32, 1, Some("var")),
    Register::new("power_factor", 32084, I16, 1000, None),
];

pub const VOLTAGE_CURRENT: &[Register] = &[
    Register::new("line_voltage_A_B", 32066, U16, 10, Some("V")),
    Register::new("line_voltage_B_C", 32067, U16, 10, Some("V")),
    Register::new("line_voltage_C_A", 32068, U16, 10, Some("V")),
    Register::new("phase_A_voltage", 32069, U16, 10, Some("V")),
    Register::new("phase_B_voltage", 32070, U16, 10, Some("V")),
    Register::new("phase_C_voltage", 32071, U16, 10, Some("V")),
    Register::new("phase_A_current", 32072, I32, 1000, Some("A")),
    Register::new("phase_B_current", 32074, I32, 1000, Some("A")),
    Register::new("phase_C_current", 32076, I32, 1000, Some("A")),
];

pub const ENERGY: &[Register] = &[
    Register::new("daily_yield_energy", 32114, U32, 100, Some("kWh")),
    Register::new("accumulated_yield_energy", 32106, U32, 100, Some("kWh")),
];

pub const TEMPERATURE: &[Register] = &[
    Register::new("internal_temperature", 32087, I16, 10, Some("°C")),
];

pub const GRID: &[Register] = &[
    Register::new("grid_frequency", 32085, U16, 100, Some("Hz")),
];

pub const STATUS: &[Register] = &[
    DEVICE_STATUS,
    Register::new("alarm_1", 32008, U16, 1, None),
    Register::new("alarm_2", 32009, U16, 1, None),
    Register::new("alarm_3", 32010, U16, 1, None),
];

pub const PV_STRINGS: &[Register] = &[
    Register::new("pv_01_voltage", 32016, I16, 10, Some("V")),
    Register::new("pv_01_current", 32017, I16, 100, Some("A")),
    Register::new("pv_02_voltage", 32018, I16, 10, Some("V")),
    Register::new("pv_02_current", 32019, I16, 100, Some("A")),
    Register::new("pv_03_voltage", 32020, I16, 10, Some("V")),
    Register::new("pv_03_current", 32021, I16, 100, Some("A")),
    Register::new("pv_04_voltage", 32022, I16, 10, Some("V")),
    Register::new("pv_04_current", 32023, I16, 100, Some("A")),
];

/// Static information, read once per connection and only logged
pub const DEVICE_INFO: &[Register] = &[MODEL_NAME, SERIAL_NUMBER, PN, MODEL_ID, NB_PV_STRINGS, RATED_POWER];

pub const TELEMETRY_GROUPS: &[RegisterGroup] = &[
    RegisterGroup { category: Category::Power, registers: POWER },
    RegisterGroup { category: Category::VoltageCurrent, registers: VOLTAGE_CURRENT },
    RegisterGroup { category: Category::Energy, registers: ENERGY },
    RegisterGroup { category: Category::Temperature, registers: TEMPERATURE },
    RegisterGroup { category: Category::Grid, registers: GRID },
    RegisterGroup { category: Category::Status, registers: STATUS },
    RegisterGroup { category: Category::PvStrings, registers: PV_STRINGS },
];

/// Panics if the catalogue is inconsistent. A broken catalogue is a programming
/// error, so this runs once at startup and in the tests.
pub fn validate_catalogue() {
    let mut names = HashSet::new();
    let mut categories = HashSet::new();

    for group in TELEMETRY_GROUPS {
        assert!(categories.insert(group.category), "category {} listed twice", group.category);
        assert!(!group.registers.is_empty(), "category {} has no registers", group.category);
        for reg in group.registers {
            assert!(names.insert(reg.name), "register {} listed twice", reg.name);
        }
    }

    for reg in TELEMETRY_GROUPS.iter().flat_map(|g| g.registers.iter()).chain(DEVICE_INFO.iter()) {
        assert!(reg.length > 0, "register {} has no length", reg.name);
        assert!(reg.gain > 0, "register {} has a zero gain", reg.name);
        if reg.format == RegisterFormat::Str {
            assert!(reg.gain == 1 && reg.unit.is_none(), "text register {} carries a gain or unit", reg.name);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_catalogue_is_consistent() {
        validate_catalogue();
    }

    #[test]
    fn test_group_order() {
        let order: Vec<&str> = TELEMETRY_GROUPS.iter().map(|g| g.category.as_str()).collect();
        assert_eq!(
            order,
            vec!["power", "voltage_current", "energy", "temperature", "grid", "status", "pv_strings"]
        );
    }

    #[test]
    fn test_register_lengths() {
        assert_eq!(MODEL_NAME.length, 15);
        assert_eq!(RATED_POWER.length, 2);
        assert_eq!(DEVICE_STATUS.length, 1);
        assert_eq!(POWER[1].end(), 32082);
    }

    #[test]
    fn test_category_serializes_snake_case() {
        assert_eq!(serde_json::to_string(&Category::PvStrings).unwrap(), "\"pv_strings\"");
        assert_eq!(serde_json::to_string(&Category::VoltageCurrent).unwrap(), "\"voltage_current\"");
    }
}
