//! End-to-end flows against a simulated tab peripheral.

use bletab::domain::models::{
    ChainKind, CharacteristicKind, CredentialPair, PeripheralIdentity, SessionMode, SessionState,
};
use bletab::domain::store::SessionStore;
use bletab::infrastructure::bluetooth::link::{
    ConnectionId, GattLink, GattOp, LinkEvent, LinkEventKind, OpFailure,
};
use bletab::infrastructure::bluetooth::protocol::{self, ENABLE_NOTIFICATION_VALUE};
use bletab::infrastructure::bluetooth::session::GattSession;
use bletab::infrastructure::bluetooth::{AppEvent, BleError};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use CharacteristicKind::{AdminKey, SearchText};

/// A tab that answers every operation, with completions held until pumped.
#[derive(Default)]
struct Peripheral {
    values: CredentialPair,
    ops: Vec<GattOp>,
    pending: VecDeque<LinkEvent>,
    closed: Vec<ConnectionId>,
    next_id: u64,
    fail_writes_to: Option<CharacteristicKind>,
}

#[derive(Clone, Default)]
struct SimLink(Arc<Mutex<Peripheral>>);

impl SimLink {
    fn ops(&self) -> Vec<GattOp> {
        self.0.lock().unwrap().ops.clone()
    }

    fn next_event(&self) -> Option<LinkEvent> {
        self.0.lock().unwrap().pending.pop_front()
    }

    /// The peripheral pushes a new value for `field`.
    fn notify(&self, connection: ConnectionId, field: CharacteristicKind, value: &str) {
        let mut peripheral = self.0.lock().unwrap();
        peripheral.values.set(field, value);
        peripheral.pending.push_back(LinkEvent::new(
            connection,
            LinkEventKind::ValueChanged {
                field,
                value: protocol::encode(value),
            },
        ));
    }
}

impl GattLink for SimLink {
    fn open(&mut self, _address: &str) -> Result<ConnectionId, BleError> {
        let mut peripheral = self.0.lock().unwrap();
        peripheral.next_id += 1;
        let id = ConnectionId(peripheral.next_id);
        peripheral
            .pending
            .push_back(LinkEvent::new(id, LinkEventKind::Connected));
        Ok(id)
    }

    fn submit(&mut self, connection: ConnectionId, op: GattOp) {
        let mut peripheral = self.0.lock().unwrap();
        peripheral.ops.push(op.clone());
        let kind = match op {
            GattOp::DiscoverServices => LinkEventKind::ServicesDiscovered {
                service_present: true,
            },
            GattOp::WriteDescriptor { field, .. } => LinkEventKind::DescriptorWritten {
                field,
                result: Ok(()),
            },
            GattOp::Read { field } => LinkEventKind::CharacteristicRead {
                field,
                result: Ok(protocol::encode(peripheral.values.get(field).unwrap_or(""))),
            },
            GattOp::Write { field, payload } => {
                let result = if peripheral.fail_writes_to == Some(field) {
                    Err(OpFailure::Status(0x80))
                } else {
                    peripheral.values.set(field, protocol::decode(&payload));
                    Ok(())
                };
                LinkEventKind::CharacteristicWritten { field, result }
            }
        };
        peripheral.pending.push_back(LinkEvent::new(connection, kind));
    }

    fn close(&mut self, connection: ConnectionId, _notifying: &[CharacteristicKind]) {
        self.0.lock().unwrap().closed.push(connection);
    }
}

struct Flow {
    link: SimLink,
    session: GattSession<SimLink>,
    store: Arc<SessionStore>,
    events: mpsc::UnboundedReceiver<AppEvent>,
    _dir: tempfile::TempDir,
}

impl Flow {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(SessionStore::open(dir.path().join("BLEData.json")).unwrap());
        let (tx, events) = mpsc::unbounded_channel();
        let link = SimLink::default();
        let session = GattSession::new(link.clone(), store.clone(), tx);
        Self {
            link,
            session,
            store,
            events,
            _dir: dir,
        }
    }

    fn tab() -> PeripheralIdentity {
        PeripheralIdentity {
            display_name: "Tab-01".to_string(),
            address: "AA:BB:CC:DD:EE:FF".to_string(),
        }
    }

    /// Deliver queued completions until the peripheral goes quiet.
    fn pump(&mut self) {
        while let Some(event) = self.link.next_event() {
            self.session.handle_link_event(event);
        }
    }

    fn drain(&mut self) -> Vec<AppEvent> {
        std::iter::from_fn(|| self.events.try_recv().ok()).collect()
    }

    fn connect(&mut self, mode: SessionMode) -> ConnectionId {
        self.session.connect(Self::tab(), mode).unwrap();
        self.pump();
        self.session.connection().unwrap()
    }
}

fn failures(events: &[AppEvent]) -> Vec<BleError> {
    events
        .iter()
        .filter_map(|e| match e {
            AppEvent::OperationFailed(err) => Some(err.clone()),
            _ => None,
        })
        .collect()
}

#[test]
fn subscribe_flow_collects_pushed_values() {
    let mut flow = Flow::new();
    let connection = flow.connect(SessionMode::Subscribe);
    assert_eq!(flow.session.state(), SessionState::Ready);
    assert_eq!(flow.session.notifying(), &[AdminKey, SearchText]);

    flow.link.notify(connection, AdminKey, "5");
    flow.link.notify(connection, SearchText, "JOHN DOE");
    flow.pump();

    let expected = CredentialPair::new("5", "JOHN DOE");
    assert_eq!(flow.session.credentials(), &expected);
    assert_eq!(flow.store.get(), expected);
    assert!(flow.store.get().is_complete());

    // Persisted across store instances.
    let reopened = SessionStore::open(flow.store.path()).unwrap();
    assert_eq!(reopened.get(), expected);
}

#[test]
fn search_text_subscription_waits_for_admin_key() {
    let mut flow = Flow::new();
    flow.connect(SessionMode::Subscribe);

    let descriptor_writes: Vec<_> = flow
        .link
        .ops()
        .into_iter()
        .filter_map(|op| match op {
            GattOp::WriteDescriptor { field, value } => Some((field, value)),
            _ => None,
        })
        .collect();
    assert_eq!(
        descriptor_writes,
        vec![
            (AdminKey, ENABLE_NOTIFICATION_VALUE),
            (SearchText, ENABLE_NOTIFICATION_VALUE)
        ]
    );
}

#[test]
fn write_then_read_returns_written_values() {
    let mut flow = Flow::new();
    flow.connect(SessionMode::Edit);
    flow.drain();

    flow.session.write_all("7", "JANE ROE").unwrap();
    assert_eq!(flow.session.state(), SessionState::Writing);
    flow.pump();
    assert_eq!(flow.session.state(), SessionState::Ready);
    assert_eq!(flow.store.get(), CredentialPair::new("7", "JANE ROE"));

    flow.session.read_all().unwrap();
    flow.pump();
    let events = flow.drain();
    assert!(events
        .iter()
        .any(|e| matches!(e, AppEvent::ChainCompleted(ChainKind::ReadAll))));
    assert_eq!(flow.session.credentials(), &CredentialPair::new("7", "JANE ROE"));
}

#[test]
fn failed_admin_key_write_stops_the_chain() {
    let mut flow = Flow::new();
    flow.connect(SessionMode::Edit);
    flow.link.0.lock().unwrap().fail_writes_to = Some(AdminKey);
    flow.drain();

    flow.session.write_all("7", "JANE ROE").unwrap();
    flow.pump();

    let writes: Vec<_> = flow
        .link
        .ops()
        .into_iter()
        .filter(|op| matches!(op, GattOp::Write { .. }))
        .collect();
    assert_eq!(
        writes,
        vec![GattOp::Write {
            field: AdminKey,
            payload: b"7".to_vec()
        }]
    );
    let errors = failures(&flow.drain());
    assert!(matches!(
        errors.as_slice(),
        [BleError::CharacteristicWriteFailed { field: AdminKey, .. }]
    ));
    assert_eq!(flow.session.state(), SessionState::Ready);
}

#[test]
fn late_completion_after_disconnect_is_ignored() {
    let mut flow = Flow::new();
    let connection = flow.connect(SessionMode::Edit);
    flow.link.0.lock().unwrap().values = CredentialPair::new("9", "LATE");
    let before = flow.session.credentials().clone();

    flow.session.read_all().unwrap();
    flow.session.disconnect();
    assert_eq!(flow.session.state(), SessionState::Idle);
    assert!(flow.session.connection().is_none());
    assert_eq!(flow.link.0.lock().unwrap().closed, vec![connection]);

    // The read issued before the disconnect completes now.
    flow.pump();
    assert_eq!(flow.session.state(), SessionState::Idle);
    assert_eq!(flow.session.credentials(), &before);
}

#[test]
fn write_completion_after_disconnect_is_ignored() {
    let mut flow = Flow::new();
    let connection = flow.connect(SessionMode::Edit);
    let before = flow.store.get();

    flow.session.write_all("7", "JANE ROE").unwrap();
    flow.session.disconnect();
    assert_eq!(flow.link.0.lock().unwrap().closed, vec![connection]);

    flow.pump();
    assert_eq!(flow.session.state(), SessionState::Idle);
    assert_eq!(flow.session.credentials(), &before);
    assert_eq!(flow.store.get(), before);
    // Only the AdminKey write was ever issued.
    let writes = flow
        .link
        .ops()
        .into_iter()
        .filter(|op| matches!(op, GattOp::Write { .. }))
        .count();
    assert_eq!(writes, 1);
}

#[test]
fn dropping_the_session_releases_the_connection() {
    let mut flow = Flow::new();
    let connection = flow.connect(SessionMode::Subscribe);
    let link = flow.link.clone();

    drop(flow);
    assert_eq!(link.0.lock().unwrap().closed, vec![connection]);
}

#[test]
fn link_loss_returns_to_idle() {
    let mut flow = Flow::new();
    let connection = flow.connect(SessionMode::Subscribe);
    flow.drain();

    flow.session
        .handle_link_event(LinkEvent::new(connection, LinkEventKind::Disconnected));
    assert_eq!(flow.session.state(), SessionState::Idle);
    assert_eq!(failures(&flow.drain()), vec![BleError::LinkLost]);

    // A fresh connection gets a new id.
    let next = flow.connect(SessionMode::Subscribe);
    assert_ne!(next, connection);
}
