//! Pending-response registry.
//!
//! Correlates an outstanding request with the acknowledgment that will
//! arrive for it later, possibly read off the socket by a different thread.
//! A caller registers a node keyed by (packet id, expected packet type)
//! before transmitting, then waits on it; whichever thread drains the
//! socket completes the matching node and wakes all waiters, each of which
//! re-checks only its own node.
//!
//! Nodes live in an index-based arena. A slot's generation counter is
//! bumped every time the slot is recycled, so a handle left over from a
//! cancelled exchange can never observe a later, unrelated one.

use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tinymq_core::packet::{Packet, PacketType};

use crate::error::{ClientError, Result};

#[derive(Debug)]
enum SlotState {
    Free,
    /// Linked, request in flight, ack not yet seen.
    Waiting {
        packet_id: u16,
        packet_type: PacketType,
    },
    /// Ack routed in; result parked until the issuer collects it.
    Done { packet_id: u16, response: Packet },
}

#[derive(Debug)]
struct Slot {
    gen: u64,
    state: SlotState,
}

/// Handle to one registered node. Valid until taken or cancelled.
#[derive(Debug, Clone, Copy)]
pub struct PendingHandle {
    index: usize,
    gen: u64,
}

/// Thread-safe correlation of outstanding requests to asynchronous
/// acknowledgments.
#[derive(Default)]
pub struct PendingRegistry {
    slots: Mutex<Vec<Slot>>,
    signal: Condvar,
}

/// CONNACK, PINGRESP and AUTH match on packet type alone: at most one of
/// each is ever outstanding and none carries a packet id.
fn matches_by_type_only(packet_type: PacketType) -> bool {
    matches!(
        packet_type,
        PacketType::Connack | PacketType::Pingresp | PacketType::Auth
    )
}

impl PendingRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Link a node for (packet id, expected type) before the request is
    /// transmitted.
    ///
    /// At most one unresolved node may exist per key; a duplicate
    /// registration fails with `Busy`.
    pub fn register(&self, packet_id: u16, packet_type: PacketType) -> Result<PendingHandle> {
        let mut slots = self.slots.lock();

        let type_only = matches_by_type_only(packet_type);
        for slot in slots.iter() {
            if let SlotState::Waiting {
                packet_id: id,
                packet_type: ptype,
            } = slot.state
            {
                if ptype == packet_type && (type_only || id == packet_id) {
                    return Err(ClientError::Busy("response already pending for this key"));
                }
            }
        }

        let state = SlotState::Waiting {
            packet_id,
            packet_type,
        };
        if let Some(index) = slots.iter().position(|s| matches!(s.state, SlotState::Free)) {
            slots[index].gen += 1;
            slots[index].state = state;
            Ok(PendingHandle {
                index,
                gen: slots[index].gen,
            })
        } else {
            slots.push(Slot { gen: 0, state });
            Ok(PendingHandle {
                index: slots.len() - 1,
                gen: 0,
            })
        }
    }

    /// Route an incoming acknowledgment to its node and wake waiters.
    ///
    /// Matching is by (type, packet id), or type alone for CONNACK,
    /// PINGRESP and AUTH. Returns `NoMatchingRequest` if no unresolved node
    /// matches — the caller discards the packet, leaving every other node
    /// untouched. This is how a late ack for a timed-out, unlinked exchange
    /// drains without stalling the read path.
    pub fn complete(
        &self,
        packet_type: PacketType,
        packet_id: u16,
        response: Packet,
    ) -> Result<()> {
        let mut slots = self.slots.lock();

        let type_only = matches_by_type_only(packet_type);
        let matched = slots.iter().position(|slot| {
            matches!(slot.state, SlotState::Waiting { packet_id: id, packet_type: ptype }
                if ptype == packet_type && (type_only || id == packet_id))
        });

        let Some(index) = matched else {
            log::debug!(
                "no pending request for {} id {}, discarding",
                packet_type.name(),
                packet_id
            );
            return Err(ClientError::NoMatchingRequest);
        };

        let SlotState::Waiting { packet_id: id, .. } = slots[index].state else {
            unreachable!()
        };
        slots[index].state = SlotState::Done {
            packet_id: id,
            response,
        };
        drop(slots);
        self.signal.notify_all();
        Ok(())
    }

    /// Collect the node's result if its ack has arrived, unlinking it.
    pub fn try_take(&self, handle: &PendingHandle) -> Option<Packet> {
        let mut slots = self.slots.lock();
        let slot = slots.get_mut(handle.index)?;
        if slot.gen != handle.gen {
            return None;
        }
        if matches!(slot.state, SlotState::Done { .. }) {
            let SlotState::Done { response, .. } =
                std::mem::replace(&mut slot.state, SlotState::Free)
            else {
                unreachable!()
            };
            return Some(response);
        }
        None
    }

    /// Block up to `timeout` for this node's ack, collecting it if it
    /// arrives. Wakeups re-check only the caller's own node.
    pub fn wait_done(&self, handle: &PendingHandle, timeout: Duration) -> Option<Packet> {
        let mut slots = self.slots.lock();

        let done = |slots: &Vec<Slot>| {
            slots
                .get(handle.index)
                .is_some_and(|s| s.gen == handle.gen && matches!(s.state, SlotState::Done { .. }))
        };

        if !done(&slots) {
            self.signal.wait_for(&mut slots, timeout);
        }
        if done(&slots) {
            let slot = &mut slots[handle.index];
            let SlotState::Done { response, .. } =
                std::mem::replace(&mut slot.state, SlotState::Free)
            else {
                unreachable!()
            };
            return Some(response);
        }
        None
    }

    /// Unlink the caller's own node (timeout or explicit cancellation).
    /// A later ack for this key will take the `NoMatchingRequest` path.
    pub fn cancel(&self, handle: &PendingHandle) {
        let mut slots = self.slots.lock();
        if let Some(slot) = slots.get_mut(handle.index) {
            if slot.gen == handle.gen {
                slot.state = SlotState::Free;
            }
        }
    }

    /// Whether a packet id is still attached to any unresolved or
    /// uncollected node. The allocator refuses to hand such ids out again.
    pub fn contains_id(&self, packet_id: u16) -> bool {
        let slots = self.slots.lock();
        slots.iter().any(|s| match s.state {
            SlotState::Waiting { packet_id: id, .. } => id == packet_id,
            SlotState::Done { packet_id: id, .. } => id == packet_id,
            SlotState::Free => false,
        })
    }

    /// Wake every waiter so it can re-check its node or contend for the
    /// read role.
    pub fn notify_waiters(&self) {
        self.signal.notify_all();
    }
}
