use crate::{
    Result,
    constants::{COILS_PER_CARD, MAX_LOCKER_ID, MIN_LOCKER_ID},
    error::Error,
};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Maximum kiosk identifier length.
const MAX_KIOSK_ID_LENGTH: usize = 64;

/// Card id length bounds after normalization.
const MIN_CARD_ID_LENGTH: usize = 3;
const MAX_CARD_ID_LENGTH: usize = 32;

/// Kiosk identifier (one kiosk = one RS-485 bus).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct KioskId(String);

impl KioskId {
    /// Create a kiosk id with validation.
    ///
    /// # Errors
    /// Returns `Error::InvalidKioskId` if the id is empty, longer than 64
    /// characters, or contains characters other than ASCII alphanumerics,
    /// `-` and `_`.
    pub fn new(id: impl Into<String>) -> Result<Self> {
        let id = id.into().trim().to_string();
        if id.is_empty() || id.len() > MAX_KIOSK_ID_LENGTH {
            return Err(Error::InvalidKioskId(format!(
                "length must be 1-{MAX_KIOSK_ID_LENGTH}, got {}",
                id.len()
            )));
        }
        if !id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(Error::InvalidKioskId(id));
        }
        Ok(Self(id))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for KioskId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for KioskId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        KioskId::new(s)
    }
}

impl TryFrom<String> for KioskId {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        KioskId::new(value)
    }
}

impl From<KioskId> for String {
    fn from(value: KioskId) -> Self {
        value.0
    }
}

/// Locker identifier, 1-based, one per physical relay channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u16", into = "u16")]
pub struct LockerId(u16);

impl LockerId {
    /// Create a locker id with validation.
    ///
    /// # Errors
    /// Returns `Error::InvalidLockerId` outside `1..=3952`.
    pub fn new(id: u16) -> Result<Self> {
        if !(MIN_LOCKER_ID..=MAX_LOCKER_ID).contains(&id) {
            return Err(Error::InvalidLockerId(format!(
                "locker id must be {MIN_LOCKER_ID}-{MAX_LOCKER_ID}, got {id}"
            )));
        }
        Ok(Self(id))
    }

    #[must_use]
    pub fn get(&self) -> u16 {
        self.0
    }

    /// Resolve the relay card and coil driving this locker.
    #[must_use]
    pub fn address(&self) -> HardwareAddress {
        HardwareAddress::from_locker(*self)
    }
}

impl fmt::Display for LockerId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for LockerId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let id: u16 = s
            .trim()
            .parse()
            .map_err(|_| Error::InvalidLockerId(s.to_string()))?;
        LockerId::new(id)
    }
}

impl TryFrom<u16> for LockerId {
    type Error = Error;

    fn try_from(value: u16) -> Result<Self> {
        LockerId::new(value)
    }
}

impl From<LockerId> for u16 {
    fn from(value: LockerId) -> Self {
        value.0
    }
}

/// RFID card identifier, normalized to trimmed uppercase ASCII.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CardId(String);

impl CardId {
    /// Create a card id.
    ///
    /// # Errors
    /// Returns `Error::InvalidCardId` if the normalized id is not 3-32 ASCII
    /// alphanumeric characters.
    pub fn new(id: &str) -> Result<Self> {
        let id = id.trim().to_uppercase();
        let len = id.len();
        if !(MIN_CARD_ID_LENGTH..=MAX_CARD_ID_LENGTH).contains(&len) {
            return Err(Error::InvalidCardId(format!(
                "card id must be {MIN_CARD_ID_LENGTH}-{MAX_CARD_ID_LENGTH} chars, got {len}"
            )));
        }
        if !id.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(Error::InvalidCardId(id));
        }
        Ok(Self(id))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CardId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for CardId {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        CardId::new(&value)
    }
}

impl From<CardId> for String {
    fn from(value: CardId) -> Self {
        value.0
    }
}

/// Bus location of a locker's relay: card slave address and 0-based coil.
///
/// Derived, never stored.
///
/// # Examples
///
/// ```
/// use locker_core::{HardwareAddress, LockerId};
///
/// let address = HardwareAddress::from_locker(LockerId::new(17).unwrap());
/// assert_eq!(address.slave, 2);
/// assert_eq!(address.coil, 0);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HardwareAddress {
    /// Modbus slave address of the relay card.
    pub slave: u8,
    /// 0-based coil address on the card.
    pub coil: u16,
}

impl HardwareAddress {
    #[must_use]
    pub fn from_locker(locker: LockerId) -> Self {
        let id = locker.get();
        // LockerId bounds keep this within 1..=247.
        let slave = id.div_ceil(COILS_PER_CARD) as u8;
        let relay_in_card = ((id - 1) % COILS_PER_CARD) + 1;
        Self {
            slave,
            coil: relay_in_card - 1,
        }
    }

    /// 1-based relay number as printed on the card.
    #[must_use]
    pub fn relay_in_card(&self) -> u16 {
        self.coil + 1
    }
}

impl fmt::Display for HardwareAddress {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "slave {} coil {}", self.slave, self.coil)
    }
}

macro_rules! wire_enum {
    ($name:ident, $label:literal, { $($variant:ident => $wire:literal),+ $(,)? }) => {
        impl $name {
            /// Stable wire/database representation.
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $wire,)+
                }
            }
        }

        impl FromStr for $name {
            type Err = Error;

            fn from_str(s: &str) -> Result<Self> {
                match s {
                    $($wire => Ok(Self::$variant),)+
                    other => Err(Error::UnknownVariant {
                        kind: $label,
                        value: other.to_string(),
                    }),
                }
            }
        }

        impl TryFrom<String> for $name {
            type Error = Error;

            fn try_from(value: String) -> Result<Self> {
                value.parse()
            }
        }
    };
}

/// Ownership and availability of one locker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LockerStatus {
    Free,
    Owned,
    Opening,
    Error,
    Blocked,
}

wire_enum!(LockerStatus, "locker status", {
    Free => "Free",
    Owned => "Owned",
    Opening => "Opening",
    Error => "Error",
    Blocked => "Blocked",
});

impl LockerStatus {
    /// Statuses that carry an owner.
    pub fn has_owner(&self) -> bool {
        matches!(self, Self::Owned | Self::Opening)
    }
}

impl fmt::Display for LockerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Who holds a locker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OwnerType {
    Rfid,
    Vip,
    Staff,
}

wire_enum!(OwnerType, "owner type", {
    Rfid => "rfid",
    Vip => "vip",
    Staff => "staff",
});

/// Owner of a locker.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Owner {
    pub owner_type: OwnerType,
    pub owner_id: String,
}

impl Owner {
    pub fn new(owner_type: OwnerType, owner_id: impl Into<String>) -> Self {
        Self {
            owner_type,
            owner_id: owner_id.into(),
        }
    }

    pub fn rfid(card: &CardId) -> Self {
        Self::new(OwnerType::Rfid, card.as_str())
    }
}

/// Lifecycle of a queued hardware command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandStatus {
    Pending,
    Executing,
    Completed,
    Failed,
    Cancelled,
}

wire_enum!(CommandStatus, "command status", {
    Pending => "pending",
    Executing => "executing",
    Completed => "completed",
    Failed => "failed",
    Cancelled => "cancelled",
});

impl CommandStatus {
    /// Terminal statuses are never left again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl fmt::Display for CommandStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of hardware operation carried by a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandType {
    OpenLocker,
    BulkOpen,
    CloseRelay,
}

wire_enum!(CommandType, "command type", {
    OpenLocker => "open_locker",
    BulkOpen => "bulk_open",
    CloseRelay => "close_relay",
});

impl fmt::Display for CommandType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a locker is being opened; decides the status after a good pulse.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum OpenPurpose {
    /// Opening hands the locker back: success ends `Free`.
    #[default]
    Release,
    /// Opening right after assignment: success ends `Owned`.
    Assign,
}
