//! Optimistic control mutations layered over polled values.
//!
//! Each (control, field) pair runs `Idle -> Pending -> Settling -> Idle`.
//! While anything is pending or settling, polled values are ignored so a slow
//! poll cannot drag a fader back mid-gesture. A failed mutation is not rolled
//! back: the intended value stays until an authoritative read says otherwise.

use crate::modules::protocol::{Control, ControlReading};
use serde::Serialize;
use std::collections::HashMap;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Field {
    Volume,
    Mute,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ControlValue {
    pub id: String,
    pub volume: Option<f64>,
    pub mute: Option<bool>,
}

impl ControlValue {
    fn apply(&mut self, field: Field, reading: ControlReading) {
        match field {
            Field::Volume => self.volume = reading.as_level().or(self.volume),
            Field::Mute => self.mute = reading.as_flag(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MutationPhase {
    #[default]
    Idle,
    Pending,
    Settling,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcilePolicy {
    /// The backend stores exactly what was sent.
    KeepOptimistic,
    /// The backend may transform the value (clamping, rounding); read it back.
    Refetch,
}

pub fn reconcile_policy(field: Field) -> ReconcilePolicy {
    match field {
        Field::Volume => ReconcilePolicy::Refetch,
        Field::Mute => ReconcilePolicy::KeepOptimistic,
    }
}

/// Handed out by [`ControlReconciler::begin`] and given back on settle.
#[derive(Debug, Clone, PartialEq)]
pub struct MutationTicket {
    pub primary: String,
    pub field: Field,
    /// Id the request is addressed to (`secondId` for mutes).
    pub target: String,
    pub value: ControlReading,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SettleAction {
    /// A later gesture on the same slot is still in flight.
    StillPending,
    Done,
    Refetch { primary: String, field: Field },
}

#[derive(Debug, Default)]
struct Slot {
    phase: MutationPhase,
    in_flight: u32,
    pending: Option<ControlReading>,
}

#[derive(Debug, Default)]
pub struct ControlReconciler {
    order: Vec<String>,
    controls: HashMap<String, Control>,
    aliases: HashMap<String, String>,
    values: HashMap<String, ControlValue>,
    slots: HashMap<(String, Field), Slot>,
    outstanding: u32,
}

impl ControlReconciler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_controls(&mut self, controls: &[Control]) {
        self.order.clear();
        self.controls.clear();
        self.aliases.clear();
        for c in controls {
            if let Some(second) = c.second_id.as_deref().filter(|s| !s.is_empty()) {
                self.aliases.insert(second.to_string(), c.id.clone());
            }
            self.order.push(c.id.clone());
            self.controls.insert(c.id.clone(), c.clone());
        }
    }

    pub fn control(&self, id: &str) -> Option<&Control> {
        self.controls.get(&self.resolve(id).0)
    }

    pub fn controls(&self) -> impl Iterator<Item = &Control> {
        self.order.iter().filter_map(|id| self.controls.get(id))
    }

    /// Maps any control id to the primary id owning the cache entry, plus the
    /// field that id addresses.
    pub fn resolve(&self, id: &str) -> (String, Field) {
        match self.aliases.get(id) {
            Some(primary) => (primary.clone(), Field::Mute),
            None => (id.to_string(), Field::Volume),
        }
    }

    fn address(&self, id: &str, reading: ControlReading) -> (String, Field) {
        let (primary, field) = self.resolve(id);
        match (field, reading) {
            (Field::Volume, ControlReading::Flag(_)) => (primary, Field::Mute),
            other => (primary, other.0),
        }
    }

    /// Id a mutation of `field` on `primary` is sent to.
    pub fn target_id(&self, primary: &str, field: Field) -> String {
        match field {
            Field::Volume => primary.to_string(),
            Field::Mute => self
                .controls
                .get(primary)
                .and_then(|c| c.second_id.clone())
                .unwrap_or_else(|| primary.to_string()),
        }
    }

    pub fn begin(&mut self, id: &str, value: ControlReading) -> MutationTicket {
        let (primary, field) = self.address(id, value);
        let slot = self.slots.entry((primary.clone(), field)).or_default();
        slot.phase = MutationPhase::Pending;
        slot.in_flight += 1;
        slot.pending = Some(value);
        self.outstanding += 1;
        debug!(control = %primary, ?field, "mutation pending");

        MutationTicket {
            target: self.target_id(&primary, field),
            primary,
            field,
            value,
        }
    }

    pub fn settle(&mut self, ticket: &MutationTicket, ok: bool) -> SettleAction {
        self.outstanding = self.outstanding.saturating_sub(1);
        if !ok {
            warn!(control = %ticket.primary, field = ?ticket.field, "mutation failed, keeping optimistic value");
        }

        let key = (ticket.primary.clone(), ticket.field);
        let Some(slot) = self.slots.get_mut(&key) else {
            return SettleAction::Done;
        };
        slot.in_flight = slot.in_flight.saturating_sub(1);
        if slot.in_flight > 0 {
            return SettleAction::StillPending;
        }

        let intent = slot.pending.take().unwrap_or(ticket.value);
        self.values
            .entry(ticket.primary.clone())
            .or_insert_with(|| ControlValue {
                id: ticket.primary.clone(),
                ..Default::default()
            })
            .apply(ticket.field, intent);

        match reconcile_policy(ticket.field) {
            ReconcilePolicy::KeepOptimistic => {
                slot.phase = MutationPhase::Idle;
                SettleAction::Done
            }
            ReconcilePolicy::Refetch => {
                slot.phase = MutationPhase::Settling;
                SettleAction::Refetch {
                    primary: ticket.primary.clone(),
                    field: ticket.field,
                }
            }
        }
    }

    /// A read-back that will not arrive; the slot goes idle with the intended
    /// value still shown.
    pub fn abandon_refetch(&mut self, primary: &str, field: Field) {
        if let Some(slot) = self.slots.get_mut(&(primary.to_string(), field)) {
            if slot.phase == MutationPhase::Settling {
                slot.phase = MutationPhase::Idle;
            }
        }
    }

    /// Writes an authoritative single-control reading. `id` may be a `secondId`.
    pub fn apply_authoritative(&mut self, id: &str, reading: ControlReading) {
        let (primary, field) = self.address(id, reading);
        if let Some(slot) = self.slots.get_mut(&(primary.clone(), field)) {
            if slot.phase == MutationPhase::Pending {
                return;
            }
            slot.phase = MutationPhase::Idle;
        }
        self.values
            .entry(primary.clone())
            .or_insert_with(|| ControlValue {
                id: primary,
                ..Default::default()
            })
            .apply(field, reading);
    }

    /// Replaces cached values with a poll result unless a mutation is live.
    pub fn apply_poll(&mut self, polled: Vec<ControlValue>) -> bool {
        if self.is_mutating() {
            debug!("poll ignored while mutating");
            return false;
        }
        for v in polled {
            let (primary, _) = self.resolve(&v.id);
            let entry = self.values.entry(primary.clone()).or_default();
            entry.id = primary;
            if v.volume.is_some() {
                entry.volume = v.volume;
            }
            if v.mute.is_some() {
                entry.mute = v.mute;
            }
        }
        true
    }

    pub fn is_mutating(&self) -> bool {
        self.outstanding > 0
            || self
                .slots
                .values()
                .any(|s| s.phase != MutationPhase::Idle)
    }

    pub fn phase(&self, id: &str, field: Field) -> MutationPhase {
        let (primary, _) = self.resolve(id);
        self.slots
            .get(&(primary, field))
            .map(|s| s.phase)
            .unwrap_or_default()
    }

    /// Cached value with any pending gesture laid over it.
    pub fn displayed(&self, id: &str) -> ControlValue {
        let (primary, _) = self.resolve(id);
        let mut shown = self.values.get(&primary).cloned().unwrap_or_else(|| ControlValue {
            id: primary.clone(),
            ..Default::default()
        });
        for field in [Field::Volume, Field::Mute] {
            if let Some(p) = self.slots.get(&(primary.clone(), field)).and_then(|s| s.pending) {
                shown.apply(field, p);
            }
        }
        shown
    }

    pub fn cached(&self, id: &str) -> Option<&ControlValue> {
        self.values.get(&self.resolve(id).0)
    }

    pub fn cached_len(&self) -> usize {
        self.values.len()
    }
}
