//! Status word codec
//!
//! Every device reports its state as one packed 32-bit word:
//!
//! ```text
//!  31        24 23        16 15                     0
//! ┌────────────┬────────────┬────────────────────────┐
//! │ state-type │ device-type│         status         │
//! └────────────┴────────────┴────────────────────────┘
//! ```
//!
//! The state-type decides how the status field is read. Everything in here is
//! pure; display text is derived on demand and is never parsed back.

use std::fmt;

pub const STATUS_OFF: u16 = 0;
pub const STATUS_ON: u16 = 1;
pub const STATUS_UNDETECTED: u16 = 2;
pub const STATUS_INVALID: u16 = 3;
pub const STATUS_OK: u16 = 4;
pub const STATUS_ERROR_OFFSET: u16 = 100;
/// Status used by level devices whose payload could not be decoded.
pub const STATUS_DECODE_ERROR: u16 = STATUS_ERROR_OFFSET + 1000;

const STATUS_MASK: u32 = 0x0000_FFFF;
const DEVICE_TYPE_MASK: u32 = 0x00FF_0000;
const STATE_TYPE_MASK: u32 = 0xFF00_0000;
const DEVICE_TYPE_SHIFT: u32 = 16;
const STATE_TYPE_SHIFT: u32 = 24;

pub const TEXT_ON: &str = "ON";
pub const TEXT_OFF: &str = "OFF";
pub const TEXT_UNDETECTED: &str = "N/A";
pub const TEXT_OK: &str = "OK";
pub const TEXT_ERROR: &str = "ERR";

/// How the status field of a word is interpreted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StateType {
    OnOff,
    Stateless,
    Level,
}

impl StateType {
    const fn bits(self) -> u32 {
        match self {
            StateType::OnOff => 1,
            StateType::Stateless => 2,
            StateType::Level => 3,
        }
    }

    const fn from_bits(bits: u32) -> Option<Self> {
        match bits {
            1 => Some(StateType::OnOff),
            2 => Some(StateType::Stateless),
            3 => Some(StateType::Level),
            _ => None,
        }
    }
}

/// Kind of physical appliance behind a device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceType {
    Switch,
    Light,
    Remote,
}

impl DeviceType {
    const fn bits(self) -> u32 {
        match self {
            DeviceType::Switch => 0,
            DeviceType::Light => 1,
            DeviceType::Remote => 2,
        }
    }

    const fn from_bits(bits: u32) -> Option<Self> {
        match bits {
            0 => Some(DeviceType::Switch),
            1 => Some(DeviceType::Light),
            2 => Some(DeviceType::Remote),
            _ => None,
        }
    }
}

/// Controls how a level word is rendered by [`status_text`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LevelDisplay {
    /// The raw level, e.g. `"42"`
    #[default]
    Raw,
    /// Collapsed to `"ON"`/`"OFF"` for toggle style controls
    Toggle,
}

/// Packed device state: state-type, device-type and status
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct StatusWord(u32);

impl StatusWord {
    pub const fn new(state_type: StateType, device_type: DeviceType, status: u16) -> Self {
        Self(
            (state_type.bits() << STATE_TYPE_SHIFT)
                | (device_type.bits() << DEVICE_TYPE_SHIFT)
                | status as u32,
        )
    }

    /// Fresh devices start as an undetected on/off device
    pub const fn undetected(device_type: DeviceType) -> Self {
        Self::new(StateType::OnOff, device_type, STATUS_UNDETECTED)
    }

    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    pub const fn raw(self) -> u32 {
        self.0
    }

    /// `None` when the state-type bits hold a value no device produces
    pub const fn state_type(self) -> Option<StateType> {
        StateType::from_bits((self.0 & STATE_TYPE_MASK) >> STATE_TYPE_SHIFT)
    }

    pub const fn device_type(self) -> Option<DeviceType> {
        DeviceType::from_bits((self.0 & DEVICE_TYPE_MASK) >> DEVICE_TYPE_SHIFT)
    }

    pub const fn status(self) -> u16 {
        (self.0 & STATUS_MASK) as u16
    }

    pub const fn with_status(self, status: u16) -> Self {
        Self((self.0 & !STATUS_MASK) | status as u32)
    }

    pub const fn with_state_type(self, state_type: StateType) -> Self {
        Self((self.0 & !STATE_TYPE_MASK) | (state_type.bits() << STATE_TYPE_SHIFT))
    }

    pub const fn with_device_type(self, device_type: DeviceType) -> Self {
        Self((self.0 & !DEVICE_TYPE_MASK) | (device_type.bits() << DEVICE_TYPE_SHIFT))
    }

    /// Error code carried by the status field, if any
    ///
    /// Level words use values above 100 for errors; stateless words use the
    /// same offset for failed emits.
    pub fn error_code(self) -> Option<u16> {
        match self.state_type()? {
            StateType::Level | StateType::Stateless if self.status() > STATUS_ERROR_OFFSET => {
                Some(self.status() - STATUS_ERROR_OFFSET)
            }
            StateType::Stateless if self.status() == STATUS_ERROR_OFFSET => Some(0),
            _ => None,
        }
    }

    /// True for on/off words that read "on" and level words above zero
    pub fn is_on(self) -> bool {
        match self.state_type() {
            Some(StateType::OnOff) => self.status() == STATUS_ON,
            Some(StateType::Level) => {
                self.status() != STATUS_UNDETECTED
                    && self.status() <= 100
                    && self.status() > 0
            }
            _ => false,
        }
    }
}

impl fmt::Debug for StatusWord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StatusWord")
            .field("raw", &format_args!("{:#010x}", self.0))
            .field("state_type", &self.state_type())
            .field("device_type", &self.device_type())
            .field("status", &self.status())
            .finish()
    }
}

impl fmt::Display for StatusWord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}

/// Human readable text for a status word
///
/// Total over all words. An unknown state-type yields an empty string, which
/// callers take as "leave the display alone".
pub fn status_text(word: StatusWord, level: LevelDisplay) -> String {
    let status = word.status();
    match word.state_type() {
        Some(StateType::OnOff) => match status {
            STATUS_OFF => TEXT_OFF,
            STATUS_ON => TEXT_ON,
            STATUS_UNDETECTED => TEXT_UNDETECTED,
            _ => TEXT_ERROR,
        }
        .to_string(),
        Some(StateType::Level) => match status {
            STATUS_UNDETECTED => TEXT_UNDETECTED.to_string(),
            s if s > 100 => TEXT_ERROR.to_string(),
            s => match level {
                LevelDisplay::Raw => s.to_string(),
                LevelDisplay::Toggle if s != 0 => TEXT_ON.to_string(),
                LevelDisplay::Toggle => TEXT_OFF.to_string(),
            },
        },
        Some(StateType::Stateless) => match status {
            STATUS_OK | STATUS_UNDETECTED => TEXT_OK,
            _ => TEXT_ERROR,
        }
        .to_string(),
        None => String::new(),
    }
}
