//! Events the Bluetooth service reports to its owner.

use crate::domain::models::{ChainKind, CredentialPair, PeripheralIdentity, SessionState};
use crate::infrastructure::bluetooth::error::BleError;

#[derive(Debug, Clone)]
pub enum AppEvent {
    DeviceFound(PeripheralIdentity),
    ScanFinished,
    SessionState(SessionState),
    CredentialsUpdated(CredentialPair),
    ChainCompleted(ChainKind),
    OperationFailed(BleError),
    LogMessage(StatusMessage),
}

/// A user-facing progress notice.
#[derive(Debug, Clone)]
pub struct StatusMessage {
    pub message: String,
    pub severity: MessageSeverity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageSeverity {
    Info,
    Success,
    Warning,
    Error,
}
