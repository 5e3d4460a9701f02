//! Tab Peripheral Protocol
//!
//! GATT identifiers shared with the tab peripheral and the text codec used
//! for both custom characteristics. Payloads are raw UTF-8 with no length
//! prefix or framing; maximum length is agreed out of band.

use crate::domain::models::CharacteristicKind;
use uuid::Uuid;

/// Custom service exposed by the peripheral.
pub const SERVICE_UUID: Uuid = Uuid::from_u128(0x0000180f_0000_1000_8000_00805f9b34fb);

/// Admin key characteristic.
pub const ADMIN_KEY_UUID: Uuid = Uuid::from_u128(0x00002a19_0000_1000_8000_00805f9b34fb);

/// Search text characteristic.
pub const SEARCH_TEXT_UUID: Uuid = Uuid::from_u128(0x00002a1a_0000_1000_8000_00805f9b34fb);

/// Client Characteristic Configuration descriptor.
pub const CLIENT_CHARACTERISTIC_CONFIG_UUID: Uuid =
    Uuid::from_u128(0x00002902_0000_1000_8000_00805f9b34fb);

/// CCCD value turning notifications on.
pub const ENABLE_NOTIFICATION_VALUE: [u8; 2] = [0x01, 0x00];

/// CCCD value turning notifications off.
pub const DISABLE_NOTIFICATION_VALUE: [u8; 2] = [0x00, 0x00];

impl CharacteristicKind {
    pub fn uuid(&self) -> Uuid {
        match self {
            Self::AdminKey => ADMIN_KEY_UUID,
            Self::SearchText => SEARCH_TEXT_UUID,
        }
    }

    pub fn from_uuid(uuid: Uuid) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.uuid() == uuid)
    }
}

/// Decode a characteristic payload. Invalid sequences are replaced, never rejected.
pub fn decode(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}

/// Encode text for a characteristic write. No truncation.
pub fn encode(text: &str) -> Vec<u8> {
    text.as_bytes().to_vec()
}
