//! Ordered GATT chains.
//!
//! The link serializes GATT operations, so each chain issues one step and
//! waits for that step's completion before issuing the next.

use crate::domain::models::{ChainKind, CharacteristicKind};
use crate::infrastructure::bluetooth::link::GattOp;
use crate::infrastructure::bluetooth::protocol::{self, ENABLE_NOTIFICATION_VALUE};
use std::collections::VecDeque;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GattStep {
    EnableNotifications(CharacteristicKind),
    Read(CharacteristicKind),
    Write(CharacteristicKind, String),
}

impl GattStep {
    pub fn field(&self) -> CharacteristicKind {
        match self {
            Self::EnableNotifications(field) | Self::Read(field) | Self::Write(field, _) => *field,
        }
    }

    pub fn to_op(&self) -> GattOp {
        match self {
            Self::EnableNotifications(field) => GattOp::WriteDescriptor {
                field: *field,
                value: ENABLE_NOTIFICATION_VALUE,
            },
            Self::Read(field) => GattOp::Read { field: *field },
            Self::Write(field, text) => GattOp::Write {
                field: *field,
                payload: protocol::encode(text),
            },
        }
    }

    /// Whether a completion of `ack` belongs to this step.
    fn matches(&self, ack: StepAck) -> bool {
        match (self, ack) {
            (Self::EnableNotifications(a), StepAck::Descriptor(b))
            | (Self::Read(a), StepAck::Read(b))
            | (Self::Write(a, _), StepAck::Write(b)) => *a == b,
            _ => false,
        }
    }
}

/// Completion signal fed back into the sequencer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepAck {
    Descriptor(CharacteristicKind),
    Read(CharacteristicKind),
    Write(CharacteristicKind),
}

#[derive(Debug, PartialEq, Eq)]
pub enum Advance {
    /// Issue this step next.
    Next(GattStep),
    /// The final step completed.
    Done,
    /// The ack does not belong to the in-flight step.
    Stale,
}

#[derive(Debug)]
pub struct Sequencer {
    chain: ChainKind,
    pending: VecDeque<GattStep>,
    in_flight: Option<GattStep>,
}

impl Sequencer {
    pub fn new(chain: ChainKind, steps: impl IntoIterator<Item = GattStep>) -> Self {
        Self {
            chain,
            pending: steps.into_iter().collect(),
            in_flight: None,
        }
    }

    /// AdminKey first; SearchText only after AdminKey's descriptor write.
    pub fn enable_notifications() -> Self {
        Self::new(
            ChainKind::EnableNotifications,
            CharacteristicKind::ALL.map(GattStep::EnableNotifications),
        )
    }

    pub fn read_all() -> Self {
        Self::new(ChainKind::ReadAll, CharacteristicKind::ALL.map(GattStep::Read))
    }

    pub fn write_all(admin_key: &str, search_text: &str) -> Self {
        Self::new(
            ChainKind::WriteAll,
            [
                GattStep::Write(CharacteristicKind::AdminKey, admin_key.to_string()),
                GattStep::Write(CharacteristicKind::SearchText, search_text.to_string()),
            ],
        )
    }

    pub fn chain(&self) -> ChainKind {
        self.chain
    }

    pub fn in_flight(&self) -> Option<&GattStep> {
        self.in_flight.as_ref()
    }

    pub fn expects(&self, ack: StepAck) -> bool {
        self.in_flight.as_ref().is_some_and(|step| step.matches(ack))
    }

    /// Take the first step. Returns `None` for an empty chain or if already started.
    pub fn start(&mut self) -> Option<GattStep> {
        if self.in_flight.is_some() {
            return None;
        }
        self.promote()
    }

    /// Record completion of the in-flight step and move on.
    pub fn complete(&mut self, ack: StepAck) -> Advance {
        if !self.expects(ack) {
            return Advance::Stale;
        }
        self.in_flight = None;
        match self.promote() {
            Some(step) => Advance::Next(step),
            None => Advance::Done,
        }
    }

    /// Drop the in-flight step and everything after it.
    pub fn abort(&mut self) -> Option<GattStep> {
        self.pending.clear();
        self.in_flight.take()
    }

    fn promote(&mut self) -> Option<GattStep> {
        let step = self.pending.pop_front()?;
        self.in_flight = Some(step.clone());
        Some(step)
    }
}
