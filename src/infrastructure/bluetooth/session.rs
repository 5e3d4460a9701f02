//! GATT Session Module
//!
//! Owns the single active connection and drives the ordered protocol:
//! connect, discover, enable notifications (AdminKey then SearchText),
//! and the read/write chains used by the editor.
//!
//! The session is a plain state machine. Every native callback reaches it as
//! one [`LinkEvent`] through [`GattSession::handle_link_event`], and the
//! owner feeds events in one at a time, so no two transitions interleave.

use crate::domain::models::{
    ChainKind, CharacteristicKind, CredentialPair, PeripheralIdentity, SessionMode, SessionState,
};
use crate::domain::store::SessionStore;
use crate::infrastructure::bluetooth::error::BleError;
use crate::infrastructure::bluetooth::events::{AppEvent, MessageSeverity, StatusMessage};
use crate::infrastructure::bluetooth::link::{
    ConnectionId, GattLink, GattOp, LinkEvent, LinkEventKind, OpFailure,
};
use crate::infrastructure::bluetooth::protocol::{self, SERVICE_UUID};
use crate::infrastructure::bluetooth::sequencer::{Advance, GattStep, Sequencer, StepAck};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

pub struct GattSession<L: GattLink> {
    link: L,
    store: Arc<SessionStore>,
    event_sender: mpsc::UnboundedSender<AppEvent>,
    state: SessionState,
    connection: Option<ConnectionId>,
    peer: Option<PeripheralIdentity>,
    mode: SessionMode,
    chain: Option<Sequencer>,
    notifying: Vec<CharacteristicKind>,
    credentials: CredentialPair,
}

impl<L: GattLink> GattSession<L> {
    pub fn new(
        link: L,
        store: Arc<SessionStore>,
        event_sender: mpsc::UnboundedSender<AppEvent>,
    ) -> Self {
        let credentials = store.get();
        Self {
            link,
            store,
            event_sender,
            state: SessionState::Idle,
            connection: None,
            peer: None,
            mode: SessionMode::default(),
            chain: None,
            notifying: Vec::new(),
            credentials,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn connection(&self) -> Option<ConnectionId> {
        self.connection
    }

    pub fn peer(&self) -> Option<&PeripheralIdentity> {
        self.peer.as_ref()
    }

    pub fn credentials(&self) -> &CredentialPair {
        &self.credentials
    }

    /// Characteristics with notifications requested on the current link.
    pub fn notifying(&self) -> &[CharacteristicKind] {
        &self.notifying
    }

    /// Start connecting to `identity`. Only valid from `Idle`.
    pub fn connect(
        &mut self,
        identity: PeripheralIdentity,
        mode: SessionMode,
    ) -> Result<(), BleError> {
        self.require(SessionState::Idle)?;

        info!("Connecting to device: {}", identity);
        let connection = self.link.open(&identity.address).map_err(|e| {
            error!(address = %identity.address, error = %e, "Failed to open connection");
            e
        })?;

        self.send_log(
            &format!("Connecting to {}...", identity.address),
            MessageSeverity::Info,
        );
        self.connection = Some(connection);
        self.peer = Some(identity);
        self.mode = mode;
        self.set_state(SessionState::Connecting);
        Ok(())
    }

    /// Read AdminKey, then SearchText.
    pub fn read_all(&mut self) -> Result<(), BleError> {
        self.require(SessionState::Ready)?;
        self.run_chain(Sequencer::read_all(), SessionState::Reading);
        Ok(())
    }

    /// Write AdminKey, then SearchText once the first write succeeds.
    pub fn write_all(&mut self, admin_key: &str, search_text: &str) -> Result<(), BleError> {
        if admin_key.trim().is_empty() || search_text.trim().is_empty() {
            return Err(BleError::InvalidInput(
                "Please enter both values".to_string(),
            ));
        }
        self.require(SessionState::Ready)?;
        self.run_chain(
            Sequencer::write_all(admin_key, search_text),
            SessionState::Writing,
        );
        Ok(())
    }

    /// Tear the link down. A no-op when already idle.
    ///
    /// Completions for operations still in flight are ignored once this returns.
    pub fn disconnect(&mut self) {
        if self.state == SessionState::Idle {
            return;
        }
        self.set_state(SessionState::Disconnecting);
        self.release();
        info!("Disconnected from device");
        self.send_log("Disconnected from device", MessageSeverity::Info);
        self.set_state(SessionState::Idle);
    }

    /// Disconnect, then wait for the link to release the handle.
    pub async fn shutdown(&mut self) {
        self.disconnect();
        self.link.drain().await;
    }

    /// Apply one event from the link.
    pub fn handle_link_event(&mut self, event: LinkEvent) {
        if self.connection != Some(event.connection) {
            debug!(
                "Ignoring event for closed connection {}: {:?}",
                event.connection, event.kind
            );
            return;
        }

        match event.kind {
            LinkEventKind::Connected => self.on_connected(),
            LinkEventKind::ConnectFailed(e) => self.on_connect_failed(e),
            LinkEventKind::ServicesDiscovered { service_present } => {
                self.on_services_discovered(service_present)
            }
            LinkEventKind::DiscoveryFailed(reason) => {
                if self.state == SessionState::DiscoveringServices {
                    self.fail_session(BleError::DiscoverServicesFailed { reason });
                }
            }
            LinkEventKind::DescriptorWritten { field, result } => {
                self.on_descriptor_written(field, result)
            }
            LinkEventKind::CharacteristicRead { field, result } => {
                self.on_characteristic_read(field, result)
            }
            LinkEventKind::CharacteristicWritten { field, result } => {
                self.on_characteristic_written(field, result)
            }
            LinkEventKind::ValueChanged { field, value } => {
                let text = protocol::decode(&value);
                debug!("Received from {}: {}", field, text);
                self.apply_value(field, text);
            }
            LinkEventKind::Disconnected => self.on_link_lost(),
        }
    }

    fn on_connected(&mut self) {
        if self.state != SessionState::Connecting {
            debug!("Unexpected connected event in state {}", self.state);
            return;
        }
        self.set_state(SessionState::Connected);
        self.send_log("Connected to device", MessageSeverity::Success);

        self.set_state(SessionState::DiscoveringServices);
        self.submit(GattOp::DiscoverServices);
    }

    fn on_connect_failed(&mut self, error: BleError) {
        if self.state != SessionState::Connecting {
            return;
        }
        let error = match error {
            e @ (BleError::PermissionDenied
            | BleError::AddressInvalid { .. }
            | BleError::ConnectionFailed { .. }) => e,
            other => BleError::ConnectionFailed {
                reason: other.to_string(),
            },
        };
        self.release();
        self.set_state(SessionState::Idle);
        self.report(error);
    }

    fn on_services_discovered(&mut self, service_present: bool) {
        if self.state != SessionState::DiscoveringServices {
            return;
        }
        if !service_present {
            self.fail_session(BleError::DiscoverServicesFailed {
                reason: format!("Service {} not found", SERVICE_UUID),
            });
            return;
        }

        info!("Found tab service");
        match self.mode {
            SessionMode::Subscribe => {
                self.run_chain(
                    Sequencer::enable_notifications(),
                    SessionState::EnablingNotifications,
                );
            }
            SessionMode::Edit => {
                self.set_state(SessionState::Ready);
                // Pre-fill the editor with what the peripheral currently holds.
                if let Err(e) = self.read_all() {
                    warn!("Could not start read-back: {}", e);
                }
            }
        }
    }

    fn on_descriptor_written(&mut self, field: CharacteristicKind, result: Result<(), OpFailure>) {
        let ack = StepAck::Descriptor(field);
        if !self.expects(ack) {
            debug!("Ignoring unexpected descriptor write for {}", field);
            return;
        }
        match result {
            Ok(()) => {
                info!("Enabled notifications for {}", field);
                self.advance(ack);
            }
            Err(failure) => {
                // Later subscriptions in the chain are not attempted.
                self.notifying.retain(|kind| *kind != field);
                self.fail_chain(BleError::DescriptorWriteFailed {
                    field,
                    reason: failure.to_string(),
                });
            }
        }
    }

    fn on_characteristic_read(
        &mut self,
        field: CharacteristicKind,
        result: Result<Vec<u8>, OpFailure>,
    ) {
        let ack = StepAck::Read(field);
        if !self.expects(ack) {
            debug!("Ignoring unexpected read completion for {}", field);
            return;
        }
        match result {
            Ok(bytes) => {
                let text = protocol::decode(&bytes);
                info!("Read {}: {}", field, text);
                self.apply_value(field, text);
                self.advance(ack);
            }
            Err(failure) => self.fail_chain(BleError::CharacteristicReadFailed {
                field,
                reason: failure.to_string(),
            }),
        }
    }

    fn on_characteristic_written(
        &mut self,
        field: CharacteristicKind,
        result: Result<(), OpFailure>,
    ) {
        let ack = StepAck::Write(field);
        if !self.expects(ack) {
            debug!("Ignoring unexpected write completion for {}", field);
            return;
        }
        match result {
            Ok(()) => {
                info!("{} written successfully", field);
                if let Some(GattStep::Write(_, text)) =
                    self.chain.as_ref().and_then(|c| c.in_flight()).cloned()
                {
                    self.apply_value(field, text);
                }
                self.send_log(&format!("{} updated", field), MessageSeverity::Info);
                self.advance(ack);
            }
            Err(OpFailure::Rejected) => self.fail_chain(BleError::PayloadRejected { field }),
            Err(failure) => self.fail_chain(BleError::CharacteristicWriteFailed {
                field,
                reason: failure.to_string(),
            }),
        }
    }

    fn on_link_lost(&mut self) {
        if self.state == SessionState::Idle {
            return;
        }
        warn!("Link lost in state {}", self.state);
        self.release();
        self.set_state(SessionState::Idle);
        self.report(BleError::LinkLost);
    }

    fn run_chain(&mut self, mut chain: Sequencer, state: SessionState) {
        let first = chain.start();
        self.chain = Some(chain);
        self.set_state(state);
        match first {
            Some(step) => self.issue(step),
            None => self.finish_chain(),
        }
    }

    fn advance(&mut self, ack: StepAck) {
        let Some(chain) = self.chain.as_mut() else {
            return;
        };
        match chain.complete(ack) {
            Advance::Next(step) => self.issue(step),
            Advance::Done => self.finish_chain(),
            Advance::Stale => debug!("Stale completion {:?}", ack),
        }
    }

    fn finish_chain(&mut self) {
        let Some(chain) = self.chain.take() else {
            return;
        };
        let kind = chain.chain();
        info!("Chain {} completed", kind);
        self.set_state(SessionState::Ready);
        if kind == ChainKind::WriteAll {
            self.send_log("Values saved successfully", MessageSeverity::Success);
        }
        let _ = self.event_sender.send(AppEvent::ChainCompleted(kind));
    }

    /// Abort the running chain; the session stays usable in `Ready`.
    fn fail_chain(&mut self, error: BleError) {
        if let Some(mut chain) = self.chain.take() {
            chain.abort();
        }
        self.set_state(SessionState::Ready);
        self.report(error);
    }

    /// Report and tear down; used for faults that leave the link useless.
    fn fail_session(&mut self, error: BleError) {
        self.report(error);
        self.disconnect();
    }

    fn issue(&mut self, step: GattStep) {
        if let GattStep::EnableNotifications(field) = step {
            if !self.notifying.contains(&field) {
                self.notifying.push(field);
            }
        }
        debug!("Issuing {:?}", step);
        self.submit(step.to_op());
    }

    fn submit(&mut self, op: GattOp) {
        if let Some(connection) = self.connection {
            self.link.submit(connection, op);
        }
    }

    fn expects(&self, ack: StepAck) -> bool {
        self.chain.as_ref().is_some_and(|chain| chain.expects(ack))
    }

    fn apply_value(&mut self, field: CharacteristicKind, value: String) {
        if let Err(e) = self.store.set(field, &value) {
            warn!(key = field.store_key(), "Failed to persist value: {:#}", e);
        }
        self.credentials.set(field, value);
        let _ = self
            .event_sender
            .send(AppEvent::CredentialsUpdated(self.credentials.clone()));
    }

    /// Close the handle (if any) and forget everything tied to it.
    fn release(&mut self) {
        if let Some(mut chain) = self.chain.take() {
            if let Some(step) = chain.abort() {
                debug!("Abandoning in-flight {:?}", step);
            }
        }
        if let Some(connection) = self.connection.take() {
            self.link.close(connection, &self.notifying);
        }
        self.notifying.clear();
        self.peer = None;
    }

    fn require(&self, expected: SessionState) -> Result<(), BleError> {
        if self.state == expected {
            Ok(())
        } else {
            Err(BleError::InvalidState { state: self.state })
        }
    }

    fn set_state(&mut self, state: SessionState) {
        if self.state == state {
            return;
        }
        debug!("Session state {} -> {}", self.state, state);
        self.state = state;
        let _ = self.event_sender.send(AppEvent::SessionState(state));
    }

    fn report(&self, error: BleError) {
        error!(field = ?error.field(), "{}", error);
        self.send_log(&error.to_string(), MessageSeverity::Error);
        let _ = self.event_sender.send(AppEvent::OperationFailed(error));
    }

    fn send_log(&self, message: &str, severity: MessageSeverity) {
        let _ = self.event_sender.send(AppEvent::LogMessage(StatusMessage {
            message: message.to_string(),
            severity,
        }));
    }
}

impl<L: GattLink> Drop for GattSession<L> {
    fn drop(&mut self) {
        if let Some(connection) = self.connection.take() {
            info!("Releasing connection {} on session teardown", connection);
            self.link.close(connection, &self.notifying);
        }
    }
}
