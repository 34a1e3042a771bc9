//! # tsch-sf
//!
//! Scheduling functions for TSCH meshes.
//!
//! This crate provides:
//! - [`Msf`] - the adaptive scheduling function, which negotiates cells with
//!   the preferred parent from measured cell usage
//! - [`ssf`] - static schedule installers that allocate every link's cells
//!   once at setup
//! - [`alloc`] - the helper that installs mirrored cells at both ends of a link
//! - [`Mote`] / [`Motes`] - the node arena the scheduling functions act on
//!
//! ## Selecting a Scheduling Function
//!
//! Each mote owns exactly one [`SchedulingFunction`], chosen once from an
//! [`SfKind`] when the mote is built:
//!
//! ```ignore
//! let kind: SfKind = "SSFCascading".parse()?;
//! let sf = SchedulingFunction::new(kind, &MsfConfig::default());
//! ```
//!
//! The static variants ignore every reactive signal; their work happens in
//! [`ssf::install`].

pub mod alloc;
pub mod mote;
pub mod msf;
pub mod ssf;

pub use mote::{CellTable, Mote, MoteView, Motes, Routing};
pub use msf::{Msf, MsfConfig};
pub use ssf::SsfInitMethod;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::trace;
use tsch_common::{CellType, Direction, NodeId, SfAction, SimContext, SimError};

// ============================================================================
// Error Types
// ============================================================================

/// Errors raised by scheduling functions.
#[derive(Debug, Error)]
pub enum SfError {
    /// Simulation error.
    #[error("Simulation error: {0}")]
    Sim(#[from] SimError),

    /// A caller broke a precondition; the run must abort.
    #[error("Contract violation at {node}: {reason}")]
    ContractViolation {
        /// Node whose scheduling function detected the violation.
        node: NodeId,
        /// What went wrong.
        reason: String,
    },

    /// A static installer ran out of slots.
    #[error("Slotframe of {slotframe_length} slots is too small: no free slot for {transmitter} -> {receiver}")]
    SlotframeTooSmall {
        /// Slotframe length.
        slotframe_length: u16,
        /// Transmitter of the link that could not be served.
        transmitter: NodeId,
        /// Receiver of the link that could not be served.
        receiver: NodeId,
    },

    /// A node's identifier cannot be used as its slot offset.
    #[error("Slot offset {slot_offset} for {node} does not fit a slotframe of {slotframe_length} slots")]
    SlotOutOfRange {
        /// Node concerned.
        node: NodeId,
        /// Requested slot offset.
        slot_offset: u32,
        /// Slotframe length.
        slotframe_length: u16,
    },

    /// The parent graph contains a cycle.
    #[error("Routing loop while walking up from {0}")]
    RoutingLoop(NodeId),
}

impl SfError {
    pub(crate) fn contract(node: NodeId, reason: impl Into<String>) -> Self {
        SfError::ContractViolation {
            node,
            reason: reason.into(),
        }
    }
}

/// Unknown scheduling function name.
#[derive(Debug, Error)]
#[error("Unknown scheduling function '{0}' (expected one of MSF, SSFSymmetric, SSFCascading, SSFTwoBranchCascading)")]
pub struct ParseSfKindError(pub String);

// ============================================================================
// Scheduling Function Selection
// ============================================================================

/// Selectable scheduling function variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum SfKind {
    /// Adaptive scheduling function.
    #[default]
    #[serde(rename = "MSF")]
    Msf,
    /// One fixed cell per node at slot = node identifier.
    #[serde(rename = "SSFSymmetric")]
    SsfSymmetric,
    /// Growing slot counter walked along every path to the root.
    #[serde(rename = "SSFCascading")]
    SsfCascading,
    /// Cascading walk with a sequential or random-pick slot pointer.
    #[serde(rename = "SSFTwoBranchCascading")]
    SsfTwoBranchCascading,
}

impl SfKind {
    /// All variants, in declaration order.
    pub const ALL: [SfKind; 4] = [
        SfKind::Msf,
        SfKind::SsfSymmetric,
        SfKind::SsfCascading,
        SfKind::SsfTwoBranchCascading,
    ];

    /// Configuration name of the variant.
    pub fn name(&self) -> &'static str {
        match self {
            SfKind::Msf => "MSF",
            SfKind::SsfSymmetric => "SSFSymmetric",
            SfKind::SsfCascading => "SSFCascading",
            SfKind::SsfTwoBranchCascading => "SSFTwoBranchCascading",
        }
    }

    /// Whether the variant installs its whole schedule at setup.
    pub fn is_static(&self) -> bool {
        !matches!(self, SfKind::Msf)
    }
}

impl std::fmt::Display for SfKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl std::str::FromStr for SfKind {
    type Err = ParseSfKindError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SfKind::ALL
            .into_iter()
            .find(|kind| kind.name().eq_ignore_ascii_case(s))
            .ok_or_else(|| ParseSfKindError(s.to_string()))
    }
}

/// The scheduling function instance owned by a mote.
#[derive(Debug, Clone)]
pub enum SchedulingFunction {
    /// Adaptive controller with its own counters.
    Msf(Msf),
    /// Static symmetric schedule.
    SsfSymmetric,
    /// Static cascading schedule.
    SsfCascading,
    /// Static two-branch cascading schedule.
    SsfTwoBranchCascading,
}

impl SchedulingFunction {
    /// Build the instance for a variant.
    pub fn new(kind: SfKind, config: &MsfConfig) -> Self {
        match kind {
            SfKind::Msf => SchedulingFunction::Msf(Msf::new(config.clone())),
            SfKind::SsfSymmetric => SchedulingFunction::SsfSymmetric,
            SfKind::SsfCascading => SchedulingFunction::SsfCascading,
            SfKind::SsfTwoBranchCascading => SchedulingFunction::SsfTwoBranchCascading,
        }
    }

    /// The variant of this instance.
    pub fn kind(&self) -> SfKind {
        match self {
            SchedulingFunction::Msf(_) => SfKind::Msf,
            SchedulingFunction::SsfSymmetric => SfKind::SsfSymmetric,
            SchedulingFunction::SsfCascading => SfKind::SsfCascading,
            SchedulingFunction::SsfTwoBranchCascading => SfKind::SsfTwoBranchCascading,
        }
    }

    /// The adaptive controller, if this is one.
    pub fn as_msf(&self) -> Option<&Msf> {
        match self {
            SchedulingFunction::Msf(msf) => Some(msf),
            _ => None,
        }
    }

    /// Mutable access to the adaptive controller, if this is one.
    pub fn as_msf_mut(&mut self) -> Option<&mut Msf> {
        match self {
            SchedulingFunction::Msf(msf) => Some(msf),
            _ => None,
        }
    }

    /// Start the scheduling function when its mote boots.
    pub fn activate(&mut self, mote: &mut MoteView<'_>, ctx: &mut SimContext) -> Result<(), SfError> {
        match self {
            SchedulingFunction::Msf(msf) => msf.activate(mote, ctx),
            _ => Ok(()),
        }
    }

    /// React to a preferred-parent change reported by routing.
    pub fn schedule_parent_change(
        &mut self,
        mote: &MoteView<'_>,
        ctx: &mut SimContext,
    ) -> Result<(), SfError> {
        match self {
            SchedulingFunction::Msf(msf) => msf.schedule_parent_change(mote, ctx),
            _ => Ok(()),
        }
    }

    /// MAC report: a cell carried a frame.
    pub fn signal_cell_used(
        &mut self,
        mote: &MoteView<'_>,
        neighbor: NodeId,
        cell_options: Direction,
        direction: Direction,
        cell_type: CellType,
    ) -> Result<(), SfError> {
        match self {
            SchedulingFunction::Msf(msf) => {
                msf.signal_cell_used(mote, neighbor, cell_options, direction, cell_type)
            }
            _ => Ok(()),
        }
    }

    /// MAC report: a cell opportunity went by.
    pub fn signal_cell_elapsed(
        &mut self,
        mote: &MoteView<'_>,
        neighbor: NodeId,
        direction: Direction,
        ctx: &mut SimContext,
    ) -> Result<(), SfError> {
        match self {
            SchedulingFunction::Msf(msf) => msf.signal_cell_elapsed(mote, neighbor, direction, ctx),
            _ => Ok(()),
        }
    }

    /// Run a callback previously scheduled by this scheduling function.
    pub fn handle_action(
        &mut self,
        action: SfAction,
        mote: &mut MoteView<'_>,
        ctx: &mut SimContext,
    ) -> Result<(), SfError> {
        match self {
            SchedulingFunction::Msf(msf) => match action {
                SfAction::Housekeeping => msf.action_housekeeping(mote, ctx),
                SfAction::ParentChange => msf.action_parent_change(mote, ctx),
                SfAction::BandwidthIncrement => msf.action_bandwidth_increment(mote, ctx),
                SfAction::BandwidthDecrement => msf.action_bandwidth_decrement(mote, ctx),
            },
            other => {
                trace!("{}: {} ignores {:?}", mote.id, other.kind(), action);
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sf_kind_parse() {
        assert_eq!("MSF".parse::<SfKind>().unwrap(), SfKind::Msf);
        assert_eq!("ssfcascading".parse::<SfKind>().unwrap(), SfKind::SsfCascading);
        assert_eq!(
            "SSFTwoBranchCascading".parse::<SfKind>().unwrap(),
            SfKind::SsfTwoBranchCascading
        );
        assert!("OTF".parse::<SfKind>().is_err());
    }

    #[test]
    fn test_selector_builds_matching_variant() {
        for kind in SfKind::ALL {
            let sf = SchedulingFunction::new(kind, &MsfConfig::default());
            assert_eq!(sf.kind(), kind);
            assert_eq!(sf.as_msf().is_some(), kind == SfKind::Msf);
            assert_eq!(kind.is_static(), kind != SfKind::Msf);
        }
    }

    #[test]
    fn test_static_variants_ignore_signals() {
        let mut mote = Mote::new(NodeId(1), false, SfKind::SsfSymmetric, &MsfConfig::default());
        mote.rpl.join(NodeId(0));
        let mut ctx = SimContext::new(1, 101, 0.01);

        mote.activate(&mut ctx).unwrap();
        mote.schedule_parent_change(&mut ctx).unwrap();
        mote.signal_cell_used(NodeId(0), Direction::TxRxShared, Direction::Tx, CellType::Data)
            .unwrap();
        mote.signal_cell_elapsed(NodeId(0), Direction::TxRxShared, &mut ctx)
            .unwrap();

        assert!(ctx.pending_callbacks().is_empty());
        assert!(ctx.pending_requests().is_empty());
    }
}
