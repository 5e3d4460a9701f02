use serde::{Deserialize, Serialize};
use std::fmt;

/// A named peripheral seen during one scan run.
///
/// `address` is the unique key; two identities with the same address are the
/// same peripheral even if the advertised name changed between packets.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PeripheralIdentity {
    pub display_name: String,
    pub address: String,
}

impl fmt::Display for PeripheralIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} - {}", self.display_name, self.address)
    }
}

/// The two custom characteristics exposed by the tab peripheral.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CharacteristicKind {
    AdminKey,
    SearchText,
}

impl CharacteristicKind {
    pub const ALL: [CharacteristicKind; 2] =
        [CharacteristicKind::AdminKey, CharacteristicKind::SearchText];

    /// Key used for this field in the persisted store.
    pub fn store_key(&self) -> &'static str {
        match self {
            Self::AdminKey => "ADMIN_KEY",
            Self::SearchText => "SEARCH_TEXT",
        }
    }
}

impl fmt::Display for CharacteristicKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AdminKey => f.write_str("Admin Key"),
            Self::SearchText => f.write_str("Search Text"),
        }
    }
}

/// Admin key / search text pair used as the patient lookup key.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialPair {
    #[serde(rename = "ADMIN_KEY", default, skip_serializing_if = "Option::is_none")]
    pub admin_key: Option<String>,
    #[serde(rename = "SEARCH_TEXT", default, skip_serializing_if = "Option::is_none")]
    pub search_text: Option<String>,
}

impl CredentialPair {
    pub fn new(admin_key: impl Into<String>, search_text: impl Into<String>) -> Self {
        Self {
            admin_key: Some(admin_key.into()),
            search_text: Some(search_text.into()),
        }
    }

    pub fn get(&self, field: CharacteristicKind) -> Option<&str> {
        match field {
            CharacteristicKind::AdminKey => self.admin_key.as_deref(),
            CharacteristicKind::SearchText => self.search_text.as_deref(),
        }
    }

    /// Overwrite exactly one field.
    pub fn set(&mut self, field: CharacteristicKind, value: impl Into<String>) {
        let value = Some(value.into());
        match field {
            CharacteristicKind::AdminKey => self.admin_key = value,
            CharacteristicKind::SearchText => self.search_text = value,
        }
    }

    /// The lookup is only valid once both fields are non-empty.
    pub fn is_complete(&self) -> bool {
        CharacteristicKind::ALL
            .iter()
            .all(|kind| self.get(*kind).is_some_and(|v| !v.is_empty()))
    }
}

/// Lifecycle of a GATT session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Connecting,
    Connected,
    DiscoveringServices,
    EnablingNotifications,
    Ready,
    Reading,
    Writing,
    Disconnecting,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// What the session does once services are discovered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionMode {
    /// Subscribe to both characteristics and wait for pushed values.
    #[default]
    Subscribe,
    /// Read both characteristics back so an editor can be pre-filled.
    Edit,
}

/// The ordered GATT chains a session can run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainKind {
    EnableNotifications,
    ReadAll,
    WriteAll,
}

impl fmt::Display for ChainKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EnableNotifications => f.write_str("enable-notifications"),
            Self::ReadAll => f.write_str("read-all"),
            Self::WriteAll => f.write_str("write-all"),
        }
    }
}
