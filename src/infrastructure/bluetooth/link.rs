//! GATT Link Module
//!
//! The seam between the session state machine and the radio. A link accepts
//! one operation at a time and reports its completion later as a
//! [`LinkEvent`] on the session mailbox; it never blocks the caller.

use crate::domain::models::CharacteristicKind;
use crate::infrastructure::bluetooth::error::BleError;
use async_trait::async_trait;
use std::fmt;

/// Identifies one opened connection. Never reused, so a completion for a
/// closed connection can always be told apart from the live one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A single GATT operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GattOp {
    DiscoverServices,
    /// Write the CCCD of `field` with the enable/disable sentinel.
    WriteDescriptor {
        field: CharacteristicKind,
        value: [u8; 2],
    },
    Read {
        field: CharacteristicKind,
    },
    Write {
        field: CharacteristicKind,
        payload: Vec<u8>,
    },
}

/// Why a single operation failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpFailure {
    /// The peripheral refused the value (e.g. invalid attribute length).
    Rejected,
    /// Non-success GATT status.
    Status(u16),
    /// The transport failed before a status was available.
    Transport(String),
}

impl fmt::Display for OpFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Rejected => f.write_str("value rejected"),
            Self::Status(code) => write!(f, "status {code}"),
            Self::Transport(msg) => f.write_str(msg),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEventKind {
    Connected,
    ConnectFailed(BleError),
    ServicesDiscovered {
        service_present: bool,
    },
    DiscoveryFailed(String),
    DescriptorWritten {
        field: CharacteristicKind,
        result: Result<(), OpFailure>,
    },
    CharacteristicRead {
        field: CharacteristicKind,
        result: Result<Vec<u8>, OpFailure>,
    },
    CharacteristicWritten {
        field: CharacteristicKind,
        result: Result<(), OpFailure>,
    },
    ValueChanged {
        field: CharacteristicKind,
        value: Vec<u8>,
    },
    Disconnected,
}

/// A completion or unsolicited notification from the link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkEvent {
    pub connection: ConnectionId,
    pub kind: LinkEventKind,
}

impl LinkEvent {
    pub fn new(connection: ConnectionId, kind: LinkEventKind) -> Self {
        Self { connection, kind }
    }
}

/// Transport driven by [`GattSession`](super::session::GattSession).
///
/// Implementations deliver every outcome asynchronously as a [`LinkEvent`]
/// tagged with the connection it belongs to.
#[async_trait]
pub trait GattLink: Send {
    /// Begin connecting. Only failures known up front are returned here;
    /// everything else arrives as `ConnectFailed`.
    fn open(&mut self, address: &str) -> Result<ConnectionId, BleError>;

    /// Issue one operation. The caller guarantees nothing else is in flight.
    fn submit(&mut self, connection: ConnectionId, op: GattOp);

    /// Disable notifications on `notifying` (best effort), then release the
    /// connection. Must succeed even if the link is already gone.
    fn close(&mut self, connection: ConnectionId, notifying: &[CharacteristicKind]);

    /// Wait until every connection passed to `close` has been released.
    async fn drain(&mut self) {}
}
