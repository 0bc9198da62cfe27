//! HAP service and characteristic types
//!
//! HAP identifies every service and characteristic by a UUID. Apple-defined
//! types share the base UUID `0000XXXX-0000-1000-8000-0026BB765291` and are
//! usually abbreviated to the short code `XXXX`. Accessories send either form,
//! so parsing accepts the full UUID, the short hex code, or the snake_case
//! name used throughout this crate (e.g. `"lightbulb"`, `"on"`).

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

/// Low 96 bits shared by every Apple-defined HAP type
const HAP_BASE: u128 = 0x0000_0000_0000_1000_8000_0026_BB76_5291;
const HAP_BASE_MASK: u128 = (1u128 << 96) - 1;

/// Error type for unparseable type strings
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("'{0}' is not a HAP type UUID, short code or known name")]
pub struct TypeParseError(pub String);

/// Build a full UUID from a HAP short code
pub fn hap_uuid(short: u32) -> Uuid {
    Uuid::from_u128(((short as u128) << 96) | HAP_BASE)
}

/// Return the short code if the UUID lives in the HAP base range
pub fn short_code(uuid: &Uuid) -> Option<u32> {
    let raw = uuid.as_u128();
    if raw & HAP_BASE_MASK == HAP_BASE {
        Some((raw >> 96) as u32)
    } else {
        None
    }
}

fn parse_hap_uuid(s: &str) -> Option<Uuid> {
    if s.len() <= 8 && !s.is_empty() {
        return u32::from_str_radix(s, 16).ok().map(hap_uuid);
    }
    Uuid::parse_str(s).ok()
}

macro_rules! hap_types {
    (
        $(#[$meta:meta])*
        $name:ident {
            $($(#[$vmeta:meta])* $variant:ident = $short:literal => $label:literal,)*
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub enum $name {
            $($(#[$vmeta])* $variant,)*
            /// A vendor-specific or otherwise unnamed type
            Other(Uuid),
        }

        impl $name {
            /// Every named variant, in declaration order
            pub const KNOWN: &'static [$name] = &[$($name::$variant,)*];

            /// Classify a UUID, falling back to [`Self::Other`]
            pub fn from_uuid(uuid: Uuid) -> Self {
                match short_code(&uuid) {
                    $(Some($short) => $name::$variant,)*
                    _ => $name::Other(uuid),
                }
            }

            /// The full UUID for this type
            pub fn uuid(&self) -> Uuid {
                match self {
                    $($name::$variant => hap_uuid($short),)*
                    $name::Other(uuid) => *uuid,
                }
            }

            /// The snake_case name, if this is a named type
            pub fn short_name(&self) -> Option<&'static str> {
                match self {
                    $($name::$variant => Some($label),)*
                    $name::Other(_) => None,
                }
            }

            fn from_short_name(name: &str) -> Option<Self> {
                match name {
                    $($label => Some($name::$variant),)*
                    _ => None,
                }
            }
        }

        impl FromStr for $name {
            type Err = TypeParseError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let trimmed = s.trim();
                if let Some(named) = Self::from_short_name(trimmed) {
                    return Ok(named);
                }
                parse_hap_uuid(trimmed)
                    .map(Self::from_uuid)
                    .ok_or_else(|| TypeParseError(s.to_string()))
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                match self.short_name() {
                    Some(name) => write!(f, "{}", name),
                    None => write!(f, "{}", self.uuid().to_string().to_uppercase()),
                }
            }
        }

        impl From<Uuid> for $name {
            fn from(uuid: Uuid) -> Self {
                Self::from_uuid(uuid)
            }
        }
    };
}

hap_types! {
    /// Characteristic types the controller knows by name
    CharacteristicType {
        Brightness = 0x08 => "brightness",
        CurrentHeatingCoolingState = 0x0F => "heating_cooling_current",
        CurrentRelativeHumidity = 0x10 => "relative_humidity_current",
        CurrentTemperature = 0x11 => "temperature_current",
        Hue = 0x13 => "hue",
        Identify = 0x14 => "identify",
        LockCurrentState = 0x1D => "lock_mechanism_current_state",
        LockTargetState = 0x1E => "lock_mechanism_target_state",
        Manufacturer = 0x20 => "manufacturer",
        Model = 0x21 => "model",
        MotionDetected = 0x22 => "motion_detected",
        Name = 0x23 => "name",
        On = 0x25 => "on",
        OutletInUse = 0x26 => "outlet_in_use",
        RotationSpeed = 0x29 => "rotation_speed",
        Saturation = 0x2F => "saturation",
        SerialNumber = 0x30 => "serial_number",
        TargetHeatingCoolingState = 0x33 => "heating_cooling_target",
        TargetTemperature = 0x35 => "temperature_target",
        TemperatureDisplayUnits = 0x36 => "temperature_units",
        FirmwareRevision = 0x52 => "firmware_revision",
        HardwareRevision = 0x53 => "hardware_revision",
        BatteryLevel = 0x68 => "battery_level",
        ContactSensorState = 0x6A => "contact_state",
        ProgrammableSwitchEvent = 0x73 => "input_event",
        StatusLowBattery = 0x79 => "status_lo_batt",
        ChargingState = 0x8F => "charging_state",
        Active = 0xB0 => "active",
        ServiceLabelIndex = 0xCB => "service_label_index",
        ColorTemperature = 0xCE => "color_temperature",
    }
}

impl CharacteristicType {
    /// Event-only characteristics carry no readable state; every delivery is
    /// a distinct occurrence (a button press) and must not be polled.
    pub fn is_event_only(&self) -> bool {
        matches!(self, CharacteristicType::ProgrammableSwitchEvent)
    }
}

hap_types! {
    /// Service types the controller knows by name
    ServiceType {
        AccessoryInformation = 0x3E => "accessory_information",
        Fan = 0x40 => "fan",
        GarageDoorOpener = 0x41 => "garage_door_opener",
        Lightbulb = 0x43 => "lightbulb",
        LockMechanism = 0x45 => "lock_mechanism",
        Outlet = 0x47 => "outlet",
        Switch = 0x49 => "switch",
        Thermostat = 0x4A => "thermostat",
        ContactSensor = 0x80 => "contact_sensor",
        HumiditySensor = 0x82 => "humidity_sensor",
        MotionSensor = 0x85 => "motion_sensor",
        StatelessProgrammableSwitch = 0x89 => "stateless_programmable_switch",
        TemperatureSensor = 0x8A => "temperature_sensor",
        Battery = 0x96 => "battery",
        ServiceLabel = 0xCC => "service_label",
        Doorbell = 0x121 => "doorbell",
    }
}

/// Characteristic permission flags as sent in the `perms` array
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Perm {
    /// `pr`
    PairedRead,
    /// `pw`
    PairedWrite,
    /// `ev`
    Events,
    /// `aa`
    AdditionalAuthorization,
    /// `tw`
    TimedWrite,
    /// `hd`
    Hidden,
    /// `wr`
    WriteResponse,
    /// Anything else, kept verbatim
    Other(String),
}

impl Perm {
    pub fn as_str(&self) -> &str {
        match self {
            Perm::PairedRead => "pr",
            Perm::PairedWrite => "pw",
            Perm::Events => "ev",
            Perm::AdditionalAuthorization => "aa",
            Perm::TimedWrite => "tw",
            Perm::Hidden => "hd",
            Perm::WriteResponse => "wr",
            Perm::Other(other) => other,
        }
    }
}

impl From<String> for Perm {
    fn from(s: String) -> Self {
        match s.as_str() {
            "pr" => Perm::PairedRead,
            "pw" => Perm::PairedWrite,
            "ev" => Perm::Events,
            "aa" => Perm::AdditionalAuthorization,
            "tw" => Perm::TimedWrite,
            "hd" => Perm::Hidden,
            "wr" => Perm::WriteResponse,
            _ => Perm::Other(s),
        }
    }
}

impl From<Perm> for String {
    fn from(perm: Perm) -> Self {
        perm.as_str().to_string()
    }
}

impl fmt::Display for Perm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
