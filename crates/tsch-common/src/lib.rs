//! # tsch-common
//!
//! Common types for the TSCH scheduling-function simulator.
//!
//! This crate provides core simulation primitives including:
//! - Time representation in absolute slot numbers ([`Asn`])
//! - Node identification ([`NodeId`])
//! - Cells and their directions ([`Cell`], [`Direction`], [`CellType`])
//! - The per-node link-layer schedule store ([`schedule`])
//! - Callback and negotiation vocabulary ([`Callback`], [`SixpRequest`])
//! - Simulation context ([`SimContext`])

pub mod schedule;

pub use schedule::{CellRecord, Schedule, NUM_SUFFICIENT_TX};

use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

// ============================================================================
// Error Types
// ============================================================================

/// Simulation errors.
#[derive(Debug, Error, PartialEq)]
pub enum SimError {
    /// Node not found in the arena.
    #[error("Node not found: {0}")]
    NodeNotFound(NodeId),

    /// A callback was scheduled at or before the current slot.
    #[error("Cannot schedule {tag} at ASN {requested} (current ASN {now})")]
    TimeInPast {
        /// Tag of the rejected callback.
        tag: UniqueTag,
        /// Requested ASN.
        requested: Asn,
        /// Current ASN.
        now: Asn,
    },

    /// Simulation time overflow.
    #[error("Simulation time overflow")]
    TimeOverflow,
}

// ============================================================================
// Time Types
// ============================================================================

/// Absolute slot number: simulated time counted in timeslots since start.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct Asn(u64);

impl Asn {
    /// Zero time.
    pub const ZERO: Asn = Asn(0);

    /// Create from a slot count.
    pub fn from_slots(slots: u64) -> Self {
        Asn(slots)
    }

    /// Convert seconds to slots, truncating partial slots.
    pub fn from_secs(secs: f64, slot_duration_s: f64) -> Self {
        Asn((secs / slot_duration_s) as u64)
    }

    /// Get as a slot count.
    pub fn as_u64(&self) -> u64 {
        self.0
    }

    /// Get as seconds (float).
    pub fn as_secs_f64(&self, slot_duration_s: f64) -> f64 {
        self.0 as f64 * slot_duration_s
    }

    /// Slot offset of this ASN within a slotframe.
    pub fn slot_offset(&self, slotframe_length: u16) -> u16 {
        (self.0 % u64::from(slotframe_length)) as u16
    }

    /// Add a number of slots.
    pub fn checked_add(&self, slots: u64) -> Option<Asn> {
        self.0.checked_add(slots).map(Asn)
    }
}

impl std::ops::Add<u64> for Asn {
    type Output = Asn;

    fn add(self, rhs: u64) -> Self::Output {
        Asn(self.0 + rhs)
    }
}

impl std::fmt::Display for Asn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// Node Types
// ============================================================================

/// Stable node identifier.
///
/// Nodes live in a flat arena; every neighbor, preferred-parent and
/// per-neighbor counter key is a `NodeId` resolved through that arena.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct NodeId(pub u32);

impl NodeId {
    /// Create a new node ID.
    pub fn new(id: u32) -> Self {
        NodeId(id)
    }

    /// Raw identifier value.
    pub fn as_u32(&self) -> u32 {
        self.0
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "mote-{}", self.0)
    }
}

// ============================================================================
// Cell Types
// ============================================================================

/// Direction (cell options) of a cell as seen from the node that holds it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    /// Dedicated transmit cell.
    #[serde(rename = "TX")]
    Tx,
    /// Dedicated receive cell.
    #[serde(rename = "RX")]
    Rx,
    /// Shared cell usable in both directions.
    #[serde(rename = "TXRX_SHARED")]
    TxRxShared,
}

impl Direction {
    /// Direction recorded at the other end of a cell.
    pub fn mirrored(&self) -> Direction {
        match self {
            Direction::Tx => Direction::Rx,
            Direction::Rx => Direction::Tx,
            Direction::TxRxShared => Direction::TxRxShared,
        }
    }

    /// Whether this node may transmit in the cell.
    pub fn can_transmit(&self) -> bool {
        matches!(self, Direction::Tx | Direction::TxRxShared)
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Direction::Tx => "TX",
            Direction::Rx => "RX",
            Direction::TxRxShared => "TXRX_SHARED",
        };
        f.write_str(label)
    }
}

/// Kind of traffic that used a cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CellType {
    /// Application data frame.
    Data,
    /// Control frame (routing, negotiation).
    Control,
}

/// A reservation within the slotframe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Cell {
    /// Timeslot within the slotframe.
    pub slot_offset: u16,
    /// Channel offset.
    pub channel_offset: u16,
    /// Direction as seen from the holder.
    pub direction: Direction,
}

impl Cell {
    /// Create a new cell.
    pub fn new(slot_offset: u16, channel_offset: u16, direction: Direction) -> Self {
        Cell {
            slot_offset,
            channel_offset,
            direction,
        }
    }
}

// ============================================================================
// Callback Types
// ============================================================================

/// Scheduling-function action invoked by a delayed callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SfAction {
    /// Periodic housekeeping.
    Housekeeping,
    /// Parent-change protocol.
    ParentChange,
    /// Request more cells from the preferred parent.
    BandwidthIncrement,
    /// Release cells held with the preferred parent.
    BandwidthDecrement,
}

/// Purpose half of a callback deduplication key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Purpose {
    /// Periodic housekeeping timer.
    Housekeeping,
    /// First parent-change attempt after a routing change.
    ParentChange,
    /// Fixed-delay retry of the parent-change protocol.
    ParentChangeRetransmission,
    /// Bandwidth increment.
    BandwidthIncrement,
    /// Bandwidth decrement.
    BandwidthDecrement,
}

/// Deduplication key: at most one pending callback per tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UniqueTag {
    /// Owning node.
    pub node: NodeId,
    /// What the callback is for.
    pub purpose: Purpose,
}

impl UniqueTag {
    /// Create a new tag.
    pub fn new(node: NodeId, purpose: Purpose) -> Self {
        UniqueTag { node, purpose }
    }
}

impl std::fmt::Display for UniqueTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({}, {:?})", self.node, self.purpose)
    }
}

/// A callback requested by a scheduling function.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Callback {
    /// Slot at which the callback fires.
    pub asn: Asn,
    /// Ordering among callbacks at the same ASN; lower runs first.
    pub priority: u8,
    /// Deduplication key.
    pub tag: UniqueTag,
    /// Action to invoke on the owning node.
    pub action: SfAction,
}

// ============================================================================
// Negotiation Types
// ============================================================================

/// Negotiation command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SixpCommand {
    /// Add cells.
    Add,
    /// Delete cells.
    Delete,
}

/// A fire-and-forget negotiation request towards a neighbor.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SixpRequest {
    /// Add or delete.
    pub command: SixpCommand,
    /// Requesting node.
    pub from: NodeId,
    /// Target neighbor.
    pub neighbor: NodeId,
    /// Number of cells.
    pub num_cells: u32,
    /// Cell options of the cells concerned.
    pub cell_options: Direction,
    /// Negotiation timeout in seconds.
    pub timeout_s: u32,
}

// ============================================================================
// Simulation Context
// ============================================================================

/// Context passed to scheduling functions during callback handling.
///
/// Scheduling requests and negotiation requests are queued here and drained
/// by the event loop after each handled event.
pub struct SimContext {
    asn: Asn,
    slotframe_length: u16,
    slot_duration_s: f64,
    rng: ChaCha8Rng,
    pending_callbacks: Vec<Callback>,
    pending_requests: Vec<SixpRequest>,
}

impl SimContext {
    /// Create a new simulation context.
    pub fn new(seed: u64, slotframe_length: u16, slot_duration_s: f64) -> Self {
        SimContext {
            asn: Asn::ZERO,
            slotframe_length,
            slot_duration_s,
            rng: ChaCha8Rng::seed_from_u64(seed),
            pending_callbacks: Vec::new(),
            pending_requests: Vec::new(),
        }
    }

    /// Get the current slot.
    pub fn asn(&self) -> Asn {
        self.asn
    }

    /// Set the current slot (used by event loop).
    pub fn set_asn(&mut self, asn: Asn) {
        self.asn = asn;
    }

    /// Number of timeslots in a slotframe.
    pub fn slotframe_length(&self) -> u16 {
        self.slotframe_length
    }

    /// Duration of one timeslot in seconds.
    pub fn slot_duration_s(&self) -> f64 {
        self.slot_duration_s
    }

    /// Get mutable access to the random number generator.
    pub fn rng(&mut self) -> &mut ChaCha8Rng {
        &mut self.rng
    }

    /// Schedule a callback at an absolute slot.
    ///
    /// A pending callback with the same tag is replaced.
    pub fn schedule_at(
        &mut self,
        asn: Asn,
        tag: UniqueTag,
        action: SfAction,
        priority: u8,
    ) -> Result<(), SimError> {
        if asn <= self.asn {
            return Err(SimError::TimeInPast {
                tag,
                requested: asn,
                now: self.asn,
            });
        }
        self.pending_callbacks.retain(|cb| cb.tag != tag);
        self.pending_callbacks.push(Callback {
            asn,
            priority,
            tag,
            action,
        });
        Ok(())
    }

    /// Schedule a callback after a delay in seconds.
    pub fn schedule_in(
        &mut self,
        delay_s: f64,
        tag: UniqueTag,
        action: SfAction,
        priority: u8,
    ) -> Result<(), SimError> {
        let delay = Asn::from_secs(delay_s, self.slot_duration_s).as_u64();
        let asn = self.asn.checked_add(delay).ok_or(SimError::TimeOverflow)?;
        self.schedule_at(asn, tag, action, priority)
    }

    /// Ask the negotiation collaborator to add cells.
    pub fn issue_add_request(
        &mut self,
        from: NodeId,
        neighbor: NodeId,
        num_cells: u32,
        cell_options: Direction,
        timeout_s: u32,
    ) {
        self.pending_requests.push(SixpRequest {
            command: SixpCommand::Add,
            from,
            neighbor,
            num_cells,
            cell_options,
            timeout_s,
        });
    }

    /// Ask the negotiation collaborator to delete cells.
    pub fn issue_delete_request(
        &mut self,
        from: NodeId,
        neighbor: NodeId,
        num_cells: u32,
        cell_options: Direction,
        timeout_s: u32,
    ) {
        self.pending_requests.push(SixpRequest {
            command: SixpCommand::Delete,
            from,
            neighbor,
            num_cells,
            cell_options,
            timeout_s,
        });
    }

    /// Callbacks requested since the last drain.
    pub fn pending_callbacks(&self) -> &[Callback] {
        &self.pending_callbacks
    }

    /// Negotiation requests issued since the last drain.
    pub fn pending_requests(&self) -> &[SixpRequest] {
        &self.pending_requests
    }

    /// Take all pending callbacks (used by event loop).
    pub fn take_pending_callbacks(&mut self) -> Vec<Callback> {
        std::mem::take(&mut self.pending_callbacks)
    }

    /// Take all pending negotiation requests (used by event loop).
    pub fn take_pending_requests(&mut self) -> Vec<SixpRequest> {
        std::mem::take(&mut self.pending_requests)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tag(purpose: Purpose) -> UniqueTag {
        UniqueTag::new(NodeId(3), purpose)
    }

    #[test]
    fn test_asn_conversions() {
        let asn = Asn::from_secs(1.5, 0.01);
        assert_eq!(asn.as_u64(), 150);
        assert!((asn.as_secs_f64(0.01) - 1.5).abs() < 1e-9);
        assert_eq!(Asn::from_slots(205).slot_offset(101), 3);
    }

    #[test]
    fn test_direction_mirroring() {
        assert_eq!(Direction::Tx.mirrored(), Direction::Rx);
        assert_eq!(Direction::Rx.mirrored(), Direction::Tx);
        assert_eq!(Direction::TxRxShared.mirrored(), Direction::TxRxShared);
        assert!(!Direction::Rx.can_transmit());
    }

    #[test]
    fn test_schedule_at_replaces_same_tag() {
        let mut ctx = SimContext::new(1, 101, 0.01);
        ctx.schedule_at(Asn::from_slots(10), tag(Purpose::ParentChange), SfAction::ParentChange, 4)
            .unwrap();
        ctx.schedule_at(Asn::from_slots(20), tag(Purpose::ParentChange), SfAction::ParentChange, 4)
            .unwrap();
        ctx.schedule_at(Asn::from_slots(5), tag(Purpose::Housekeeping), SfAction::Housekeeping, 4)
            .unwrap();

        let pending = ctx.take_pending_callbacks();
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].tag.purpose, Purpose::ParentChange);
        assert_eq!(pending[0].asn, Asn::from_slots(20));
        assert!(ctx.pending_callbacks().is_empty());
    }

    #[test]
    fn test_schedule_at_rejects_past() {
        let mut ctx = SimContext::new(1, 101, 0.01);
        ctx.set_asn(Asn::from_slots(50));
        let err = ctx
            .schedule_at(Asn::from_slots(50), tag(Purpose::BandwidthIncrement), SfAction::BandwidthIncrement, 4)
            .unwrap_err();
        assert!(matches!(err, SimError::TimeInPast { .. }));
    }

    #[test]
    fn test_schedule_in_converts_seconds() {
        let mut ctx = SimContext::new(1, 101, 0.01);
        ctx.set_asn(Asn::from_slots(100));
        ctx.schedule_in(2.0, tag(Purpose::Housekeeping), SfAction::Housekeeping, 4)
            .unwrap();
        assert_eq!(ctx.pending_callbacks()[0].asn, Asn::from_slots(300));
    }

    #[test]
    fn test_requests_are_queued() {
        let mut ctx = SimContext::new(1, 101, 0.01);
        ctx.issue_add_request(NodeId(2), NodeId(1), 3, Direction::TxRxShared, 15);
        ctx.issue_delete_request(NodeId(2), NodeId(0), 1, Direction::TxRxShared, 15);
        let requests = ctx.take_pending_requests();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0].command, SixpCommand::Add);
        assert_eq!(requests[0].num_cells, 3);
        assert_eq!(requests[1].command, SixpCommand::Delete);
        assert_eq!(requests[1].neighbor, NodeId(0));
    }
}
