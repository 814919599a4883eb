//! Data model for the Trio water meter.
//!
//! Scope: types only. Fetching lives in `crate::client`, cleaning raw
//! register values in `crate::normalize`.
//!
//! Notes
//! - Every register the device exposes is a `FieldKey`; the endpoint path, the
//!   response key and the unit conversion all hang off the enum so adding a
//!   register is a compile-checked change.
//! - Absent values are modelled by the key being missing from a `Snapshot`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

// =====================
// Channels and field identifiers
// =====================

/// One of the two independently scheduled polling pipelines.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    Main,
    Pressure,
}

impl Channel {
    pub const ALL: [Channel; 2] = [Channel::Main, Channel::Pressure];

    pub fn name(self) -> &'static str {
        match self {
            Channel::Main => "main",
            Channel::Pressure => "pressure",
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldKey {
    Volume,
    LastTappedVolume,
    SingleConsumption,
    Conductivity,
    Flow,
    Temperature,
    BatteryVoltage,
    SupplyVoltage,
    WifiRssi,
    WifiState,
    IpAddress,
    Gateway,
    ValveStatus,
    FirmwareVersion,
    SerialNumber,
    Pressure,
    /// Derived by the rate tracker, never fetched.
    VolumePerHour,
}

impl FieldKey {
    /// Registers polled by the main channel, in request order.
    pub const MAIN: [FieldKey; 15] = [
        FieldKey::Volume,
        FieldKey::LastTappedVolume,
        FieldKey::SingleConsumption,
        FieldKey::Conductivity,
        FieldKey::Flow,
        FieldKey::Temperature,
        FieldKey::BatteryVoltage,
        FieldKey::SupplyVoltage,
        FieldKey::WifiRssi,
        FieldKey::WifiState,
        FieldKey::IpAddress,
        FieldKey::Gateway,
        FieldKey::ValveStatus,
        FieldKey::FirmwareVersion,
        FieldKey::SerialNumber,
    ];

    /// A batch response carrying any of these is treated as real data.
    pub const LIVENESS: [FieldKey; 3] = [FieldKey::Volume, FieldKey::Temperature, FieldKey::BatteryVoltage];

    /// Register code as used in `get/<code>`. `None` for derived keys.
    pub fn code(self) -> Option<&'static str> {
        let code = match self {
            FieldKey::Volume => "vol",
            FieldKey::LastTappedVolume => "ltv",
            FieldKey::SingleConsumption => "avo",
            FieldKey::Conductivity => "cnd",
            FieldKey::Flow => "flo",
            FieldKey::Temperature => "cel",
            FieldKey::BatteryVoltage => "bat",
            FieldKey::SupplyVoltage => "net",
            FieldKey::WifiRssi => "wfr",
            FieldKey::WifiState => "wfs",
            FieldKey::IpAddress => "wip",
            FieldKey::Gateway => "wgw",
            FieldKey::ValveStatus => "vlv",
            FieldKey::FirmwareVersion => "ver",
            FieldKey::SerialNumber => "srn",
            FieldKey::Pressure => "bar",
            FieldKey::VolumePerHour => return None,
        };
        Some(code)
    }

    /// Key the device echoes in its JSON answer, e.g. `getVOL`.
    pub fn response_key(self) -> Option<String> {
        self.code().map(|c| format!("get{}", c.to_ascii_uppercase()))
    }

    /// Endpoint path relative to the `/trio` base.
    pub fn path(self) -> Option<String> {
        self.code().map(|c| format!("get/{c}"))
    }

    pub fn channel(self) -> Channel {
        match self {
            FieldKey::Pressure => Channel::Pressure,
            _ => Channel::Main,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            FieldKey::Volume => "volume",
            FieldKey::LastTappedVolume => "last_tapped_volume",
            FieldKey::SingleConsumption => "single_consumption",
            FieldKey::Conductivity => "conductivity",
            FieldKey::Flow => "flow",
            FieldKey::Temperature => "temperature",
            FieldKey::BatteryVoltage => "battery_voltage",
            FieldKey::SupplyVoltage => "supply_voltage",
            FieldKey::WifiRssi => "wifi_rssi",
            FieldKey::WifiState => "wifi_state",
            FieldKey::IpAddress => "ip_address",
            FieldKey::Gateway => "gateway",
            FieldKey::ValveStatus => "valve_status",
            FieldKey::FirmwareVersion => "firmware_version",
            FieldKey::SerialNumber => "serial_number",
            FieldKey::Pressure => "pressure",
            FieldKey::VolumePerHour => "volume_per_hour",
        }
    }

    /// Static conversion table entry for this key.
    pub fn conversion(self) -> Conversion {
        use Conversion::{Scaled, Text};
        match self {
            FieldKey::Volume | FieldKey::LastTappedVolume => Scaled {
                divisor: 1.0,
                decimals: 3,
                unit: Unit::Liters,
            },
            // the device reports single consumption in millilitres
            FieldKey::SingleConsumption => Scaled {
                divisor: 1000.0,
                decimals: 3,
                unit: Unit::Liters,
            },
            FieldKey::Conductivity => Scaled {
                divisor: 30.0,
                decimals: 2,
                unit: Unit::GermanHardness,
            },
            FieldKey::Flow | FieldKey::VolumePerHour => Scaled {
                divisor: 1.0,
                decimals: 3,
                unit: Unit::LitersPerHour,
            },
            FieldKey::Temperature => Scaled {
                divisor: 10.0,
                decimals: 1,
                unit: Unit::Celsius,
            },
            FieldKey::BatteryVoltage | FieldKey::SupplyVoltage => Scaled {
                divisor: 10.0,
                decimals: 2,
                unit: Unit::Volts,
            },
            FieldKey::WifiRssi => Scaled {
                divisor: 1.0,
                decimals: 0,
                unit: Unit::Dbm,
            },
            FieldKey::WifiState | FieldKey::ValveStatus => Scaled {
                divisor: 1.0,
                decimals: 0,
                unit: Unit::Code,
            },
            FieldKey::Pressure => Scaled {
                divisor: 1000.0,
                decimals: 3,
                unit: Unit::Bar,
            },
            FieldKey::IpAddress | FieldKey::Gateway | FieldKey::FirmwareVersion | FieldKey::SerialNumber => Text,
        }
    }
}

impl fmt::Display for FieldKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// =====================
// Units and conversions
// =====================

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Unit {
    Liters,
    LitersPerHour,
    Celsius,
    Volts,
    Bar,
    /// Degrees of German hardness (°dH).
    GermanHardness,
    Dbm,
    /// Device status code without a physical unit.
    Code,
}

impl Unit {
    pub fn symbol(self) -> &'static str {
        match self {
            Unit::Liters => "L",
            Unit::LitersPerHour => "L/h",
            Unit::Celsius => "°C",
            Unit::Volts => "V",
            Unit::Bar => "bar",
            Unit::GermanHardness => "°dH",
            Unit::Dbm => "dBm",
            Unit::Code => "",
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq)]
pub enum Conversion {
    /// Numeric register: `round(raw / divisor, decimals)`.
    Scaled { divisor: f64, decimals: u32, unit: Unit },
    /// Passed through as text.
    Text,
}

impl Conversion {
    pub fn unit(&self) -> Option<Unit> {
        match self {
            Conversion::Scaled { unit, .. } => Some(*unit),
            Conversion::Text => None,
        }
    }
}

// =====================
// Values and snapshots
// =====================

/// A normalized field value.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Value {
    Number(f64),
    Text(String),
}

impl Value {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            Value::Text(_) => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            Value::Number(_) => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Number(n) => write!(f, "{n}"),
            Value::Text(s) => f.write_str(s),
        }
    }
}

pub type Fields = BTreeMap<FieldKey, Value>;

/// Immutable, fully normalized result of one fetch cycle.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Snapshot {
    pub captured_at: DateTime<Utc>,
    fields: Fields,
}

impl Snapshot {
    pub fn new(captured_at: DateTime<Utc>, fields: Fields) -> Self {
        Snapshot { captured_at, fields }
    }

    pub fn get(&self, key: FieldKey) -> Option<&Value> {
        self.fields.get(&key)
    }

    pub fn number(&self, key: FieldKey) -> Option<f64> {
        self.get(key).and_then(Value::as_f64)
    }

    pub fn text(&self, key: FieldKey) -> Option<&str> {
        self.get(key).and_then(Value::as_str)
    }

    pub fn fields(&self) -> &Fields {
        &self.fields
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn valve_status(&self) -> Option<ValveStatus> {
        self.number(FieldKey::ValveStatus).map(ValveStatus::from_code)
    }

    /// `key=value unit` pairs for log lines.
    pub fn describe(&self) -> String {
        self.fields
            .iter()
            .map(|(key, value)| match key.conversion().unit().map(Unit::symbol) {
                Some(sym) if !sym.is_empty() => format!("{key}={value} {sym}"),
                _ => format!("{key}={value}"),
            })
            .collect::<Vec<_>>()
            .join(", ")
    }
}

// =====================
// Decoded device state
// =====================

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ValveStatus {
    Closed,
    Closing,
    Open,
    Opening,
    Undefined,
    Unknown,
}

impl ValveStatus {
    // 10=CLOSED, 11=CLOSING, 20=OPEN, 21=OPENING, 30=UNDEFINED
    pub fn from_code(code: f64) -> Self {
        match code as i64 {
            10 => ValveStatus::Closed,
            11 => ValveStatus::Closing,
            20 => ValveStatus::Open,
            21 => ValveStatus::Opening,
            30 => ValveStatus::Undefined,
            _ => ValveStatus::Unknown,
        }
    }
}

impl fmt::Display for ValveStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ValveStatus::Closed => "Closed",
            ValveStatus::Closing => "Closing",
            ValveStatus::Open => "Open",
            ValveStatus::Opening => "Opening",
            ValveStatus::Undefined => "Undefined",
            ValveStatus::Unknown => "Unknown",
        };
        f.write_str(s)
    }
}

/// Identity of the polled device as far as the main snapshot reveals it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceInfo {
    /// Serial number, or the host when the device did not report one.
    pub identifier: String,
    pub serial_number: Option<String>,
    pub firmware_version: Option<String>,
    pub configuration_url: String,
}

impl DeviceInfo {
    pub fn new(host: &str, port: u16, main: Option<&Snapshot>) -> Self {
        let serial_number = main.and_then(|s| s.text(FieldKey::SerialNumber)).map(str::to_string);
        let firmware_version = main
            .and_then(|s| s.text(FieldKey::FirmwareVersion))
            .map(str::to_string);
        DeviceInfo {
            identifier: serial_number.clone().unwrap_or_else(|| host.to_string()),
            serial_number,
            firmware_version,
            configuration_url: format!("http://{host}:{port}"),
        }
    }
}
