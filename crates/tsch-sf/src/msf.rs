//! Adaptive scheduling function.
//!
//! MSF counts how many shared cells to the preferred parent elapsed and how
//! many of them carried a frame. Every `max_num_cells` opportunities it asks
//! the negotiation layer for more cells when usage is high, or releases cells
//! when usage is low. On a parent change it moves its cells to the new parent
//! and retries every [`PARENT_CHANGE_RETRY_S`] seconds until the cell counts
//! show the move completed.

use crate::mote::MoteView;
use crate::SfError;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{debug, info, trace};
use tsch_common::{
    Asn, CellType, Direction, NodeId, Purpose, Schedule, SfAction, SimContext, UniqueTag,
};

/// Timeout used when no cell statistics exist yet.
pub const DEFAULT_SIXTOP_TIMEOUT_S: u32 = 15;

/// Safety factor applied to the expected negotiation round trip.
pub const SIXP_TIMEOUT_SEC_FACTOR: f64 = 3.0;

/// Fixed delay between parent-change attempts.
pub const PARENT_CHANGE_RETRY_S: f64 = 300.0;

/// Priority of every MSF callback.
pub const MSF_PRIORITY: u8 = 4;

/// Parent changes are spread over this many slotframes.
const PARENT_CHANGE_SPREAD_SLOTFRAMES: u64 = 16;

/// MSF parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MsfConfig {
    /// Monitoring window: shared-cell opportunities between bandwidth decisions.
    pub max_num_cells: u32,
    /// Usage above which a bandwidth increment is scheduled.
    pub lim_num_cells_used_high: u32,
    /// Usage below which a bandwidth decrement is scheduled.
    pub lim_num_cells_used_low: u32,
    /// Cells added or removed per adjustment.
    pub num_cells_to_add_remove: u32,
    /// Housekeeping period in seconds (jittered by ±10%).
    pub housekeeping_period_s: f64,
    /// Cell count housekeeping reports as under-provisioned.
    pub min_num_cells: u32,
    /// Timeout exponent after a successful negotiation.
    pub default_timeout_exp: u32,
    /// Cap of the timeout exponent.
    pub max_timeout_exp: u32,
}

impl Default for MsfConfig {
    fn default() -> Self {
        MsfConfig {
            max_num_cells: 16,
            lim_num_cells_used_high: 12,
            lim_num_cells_used_low: 4,
            num_cells_to_add_remove: 1,
            housekeeping_period_s: 60.0,
            min_num_cells: 5,
            default_timeout_exp: 1,
            max_timeout_exp: 4,
        }
    }
}

/// Adaptive scheduling function state of one mote.
#[derive(Debug, Clone)]
pub struct Msf {
    config: MsfConfig,
    num_cells_elapsed: u32,
    num_cells_used: u32,
    timeout_exp: HashMap<NodeId, u32>,
}

impl Msf {
    /// Create a controller with zeroed counters.
    pub fn new(config: MsfConfig) -> Self {
        Msf {
            config,
            num_cells_elapsed: 0,
            num_cells_used: 0,
            timeout_exp: HashMap::new(),
        }
    }

    /// Parameters in use.
    pub fn config(&self) -> &MsfConfig {
        &self.config
    }

    /// Shared-cell opportunities seen in the current window.
    pub fn num_cells_elapsed(&self) -> u32 {
        self.num_cells_elapsed
    }

    /// Used shared cells seen in the current window.
    pub fn num_cells_used(&self) -> u32 {
        self.num_cells_used
    }

    /// Current timeout exponent for a neighbor.
    pub fn timeout_exponent(&self, neighbor: NodeId) -> Option<u32> {
        self.timeout_exp.get(&neighbor).copied()
    }

    // ------------------------------------------------------------------
    // Activation and housekeeping
    // ------------------------------------------------------------------

    /// Start periodic housekeeping.
    pub fn activate(&mut self, mote: &mut MoteView<'_>, ctx: &mut SimContext) -> Result<(), SfError> {
        self.housekeeping(mote.id, ctx)
    }

    fn housekeeping(&self, id: NodeId, ctx: &mut SimContext) -> Result<(), SfError> {
        let jitter: f64 = ctx.rng().gen_range(0.9..1.1);
        let period = Asn::from_secs(self.config.housekeeping_period_s * jitter, ctx.slot_duration_s());
        // Periods shorter than a slot still fire on the next slot.
        let delay = period.as_u64().max(1);
        ctx.schedule_at(
            ctx.asn() + delay,
            UniqueTag::new(id, Purpose::Housekeeping),
            SfAction::Housekeeping,
            MSF_PRIORITY,
        )?;
        Ok(())
    }

    /// Housekeeping callback.
    ///
    /// The root stops here. Other motes only inspect their cell count (cell
    /// relocation is not modeled) and re-arm the timer.
    pub fn action_housekeeping(
        &mut self,
        mote: &mut MoteView<'_>,
        ctx: &mut SimContext,
    ) -> Result<(), SfError> {
        if mote.dag_root {
            return Ok(());
        }

        if let Some(parent) = mote.rpl.preferred_parent() {
            let held = mote.cells.num_cells_to(parent);
            if held < self.config.min_num_cells {
                trace!(
                    "[msf] {} holds {} cells with {} (min {})",
                    mote.id,
                    held,
                    parent,
                    self.config.min_num_cells
                );
            }
        }

        self.housekeeping(mote.id, ctx)
    }

    // ------------------------------------------------------------------
    // Parent change
    // ------------------------------------------------------------------

    /// Arm the parent-change protocol after a random delay.
    pub fn schedule_parent_change(&self, mote: &MoteView<'_>, ctx: &mut SimContext) -> Result<(), SfError> {
        let spread = u64::from(ctx.slotframe_length()) * PARENT_CHANGE_SPREAD_SLOTFRAMES;
        let draw: f64 = ctx.rng().gen();
        let delay = 1 + (spread as f64 * draw) as u64;
        ctx.schedule_at(
            ctx.asn() + delay,
            UniqueTag::new(mote.id, Purpose::ParentChange),
            SfAction::ParentChange,
            MSF_PRIORITY,
        )?;
        Ok(())
    }

    /// Move cells from the old parent to the new one.
    ///
    /// Re-evaluates the current cell counts on every call, so the retry
    /// chain stops on its own once the move is reflected in the counters.
    pub fn action_parent_change(
        &mut self,
        mote: &mut MoteView<'_>,
        ctx: &mut SimContext,
    ) -> Result<(), SfError> {
        let parent = mote
            .rpl
            .preferred_parent()
            .ok_or_else(|| SfError::contract(mote.id, "parent change without a preferred parent"))?;
        let old_parent = mote.rpl.old_preferred_parent().filter(|old| *old != parent);

        let cells_with_parent = mote.cells.num_cells_to(parent);
        let cells_with_old = old_parent.map_or(0, |old| mote.cells.num_cells_to(old));
        let cell_options = Direction::TxRxShared;
        let mut arm_retry = false;

        if cells_with_parent == 0 {
            let timeout = self.sixtop_timeout(mote, parent, ctx)?;
            let num_cells = cells_with_old.max(1);
            info!(
                "[msf] {} triggering 6P ADD of {} cells, dir {}, to {}, 6P timeout {}",
                mote.id, num_cells, cell_options, parent, timeout
            );
            ctx.issue_add_request(mote.id, parent, num_cells, cell_options, timeout);
            arm_retry = true;
        }

        if let Some(old) = old_parent {
            if cells_with_old > 0 && cells_with_parent > 0 {
                let timeout = self.sixtop_timeout(mote, old, ctx)?;
                info!(
                    "[msf] {} triggering 6P DELETE of {} cells, dir {}, to {}, 6P timeout {}",
                    mote.id, cells_with_old, cell_options, old, timeout
                );
                ctx.issue_delete_request(mote.id, old, cells_with_old, cell_options, timeout);
                arm_retry = true;
            }
        }

        if arm_retry {
            ctx.schedule_in(
                PARENT_CHANGE_RETRY_S,
                UniqueTag::new(mote.id, Purpose::ParentChangeRetransmission),
                SfAction::ParentChange,
                MSF_PRIORITY,
            )?;
        } else {
            debug!("[msf] {} parent change to {} complete", mote.id, parent);
            mote.rpl.set_old_preferred_parent(None);
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Negotiation timeout
    // ------------------------------------------------------------------

    /// Negotiation timeout towards `neighbor`, in seconds.
    pub fn sixtop_timeout(
        &self,
        mote: &MoteView<'_>,
        neighbor: NodeId,
        ctx: &SimContext,
    ) -> Result<u32, SfError> {
        sixtop_timeout(
            mote.id,
            &mote.cells.schedule,
            neighbor,
            ctx.slotframe_length(),
            ctx.slot_duration_s(),
        )
    }

    // ------------------------------------------------------------------
    // Usage signaling
    // ------------------------------------------------------------------

    /// Count a used shared cell to the preferred parent.
    ///
    /// Within one cell opportunity the MAC reports the use before the
    /// elapsed cell. `num_cells_used <= num_cells_elapsed` therefore holds
    /// after every complete opportunity, not after each call: between the
    /// two calls `num_cells_used` may lead by one, and a second use without
    /// an elapsed cell in between is rejected.
    pub fn signal_cell_used(
        &mut self,
        mote: &MoteView<'_>,
        neighbor: NodeId,
        cell_options: Direction,
        direction: Direction,
        cell_type: CellType,
    ) -> Result<(), SfError> {
        if direction == Direction::TxRxShared {
            return Err(SfError::contract(
                mote.id,
                format!("cell used with direction {}, expected TX or RX", direction),
            ));
        }

        if cell_options == Direction::TxRxShared && Some(neighbor) == mote.rpl.preferred_parent() {
            if self.num_cells_used > self.num_cells_elapsed {
                return Err(SfError::contract(
                    mote.id,
                    format!(
                        "numCellsUsed {} would exceed numCellsElapsed {} by more than one opportunity",
                        self.num_cells_used + 1,
                        self.num_cells_elapsed
                    ),
                ));
            }
            trace!(
                "[msf] {} cell used: neighbor {} direction {} type {:?}",
                mote.id,
                neighbor,
                direction,
                cell_type
            );
            self.num_cells_used += 1;
        }
        Ok(())
    }

    /// Count an elapsed shared cell to the preferred parent and, at the end
    /// of the monitoring window, decide on a bandwidth change.
    pub fn signal_cell_elapsed(
        &mut self,
        mote: &MoteView<'_>,
        neighbor: NodeId,
        direction: Direction,
        ctx: &mut SimContext,
    ) -> Result<(), SfError> {
        if self.num_cells_elapsed > self.config.max_num_cells {
            return Err(SfError::contract(
                mote.id,
                format!(
                    "numCellsElapsed {} exceeds window {}",
                    self.num_cells_elapsed, self.config.max_num_cells
                ),
            ));
        }

        if direction != Direction::TxRxShared || Some(neighbor) != mote.rpl.preferred_parent() {
            return Ok(());
        }

        self.num_cells_elapsed += 1;
        if self.num_cells_used > self.num_cells_elapsed {
            return Err(SfError::contract(
                mote.id,
                format!(
                    "numCellsUsed {} exceeds numCellsElapsed {}",
                    self.num_cells_used, self.num_cells_elapsed
                ),
            ));
        }

        if self.num_cells_elapsed == self.config.max_num_cells {
            debug!(
                "[msf] {} window complete: numCellsElapsed = {}, numCellsUsed = {}",
                mote.id, self.num_cells_elapsed, self.num_cells_used
            );
            if self.num_cells_used > self.config.lim_num_cells_used_high {
                self.schedule_bandwidth_increment(mote.id, ctx)?;
            } else if self.num_cells_used < self.config.lim_num_cells_used_low {
                self.schedule_bandwidth_decrement(mote.id, ctx)?;
            }
            self.reset_counters();
        }
        Ok(())
    }

    fn reset_counters(&mut self) {
        self.num_cells_elapsed = 0;
        self.num_cells_used = 0;
    }

    // ------------------------------------------------------------------
    // Timeout exponent
    // ------------------------------------------------------------------

    /// Reset the exponent for a neighbor; the first use starts one below the cap.
    pub fn reset_timeout_exponent(&mut self, neighbor: NodeId, first_time: bool) {
        let exp = if first_time {
            self.config.max_timeout_exp.saturating_sub(1)
        } else {
            self.config.default_timeout_exp
        };
        self.timeout_exp.insert(neighbor, exp);
    }

    /// Double the backoff for a neighbor, up to the cap.
    pub fn increase_timeout_exponent(&mut self, neighbor: NodeId) {
        let max = self.config.max_timeout_exp;
        let exp = self
            .timeout_exp
            .entry(neighbor)
            .or_insert(self.config.default_timeout_exp);
        if *exp < max {
            *exp += 1;
        }
    }

    // ------------------------------------------------------------------
    // Bandwidth adjustment
    // ------------------------------------------------------------------

    /// Request more cells on the next slot.
    pub fn schedule_bandwidth_increment(&self, id: NodeId, ctx: &mut SimContext) -> Result<(), SfError> {
        ctx.schedule_at(
            ctx.asn() + 1,
            UniqueTag::new(id, Purpose::BandwidthIncrement),
            SfAction::BandwidthIncrement,
            MSF_PRIORITY,
        )?;
        Ok(())
    }

    /// Add `num_cells_to_add_remove` shared cells with the preferred parent.
    pub fn action_bandwidth_increment(
        &mut self,
        mote: &mut MoteView<'_>,
        ctx: &mut SimContext,
    ) -> Result<(), SfError> {
        let parent = self.require_parent(mote)?;
        let timeout = self.sixtop_timeout(mote, parent, ctx)?;
        info!(
            "[msf] {} triggering 6P ADD of {} cells, dir {}, to {}, 6P timeout {}",
            mote.id,
            self.config.num_cells_to_add_remove,
            Direction::TxRxShared,
            parent,
            timeout
        );
        ctx.issue_add_request(
            mote.id,
            parent,
            self.config.num_cells_to_add_remove,
            Direction::TxRxShared,
            timeout,
        );
        Ok(())
    }

    /// Release cells on the next slot.
    pub fn schedule_bandwidth_decrement(&self, id: NodeId, ctx: &mut SimContext) -> Result<(), SfError> {
        ctx.schedule_at(
            ctx.asn() + 1,
            UniqueTag::new(id, Purpose::BandwidthDecrement),
            SfAction::BandwidthDecrement,
            MSF_PRIORITY,
        )?;
        Ok(())
    }

    /// Remove up to `num_cells_to_add_remove` shared cells with the
    /// preferred parent, never asking for the last one.
    pub fn action_bandwidth_decrement(
        &mut self,
        mote: &mut MoteView<'_>,
        ctx: &mut SimContext,
    ) -> Result<(), SfError> {
        let parent = self.require_parent(mote)?;
        let held = mote.cells.num_cells_to(parent);
        if held <= 1 {
            debug!("[msf] {} keeps its last cell with {}", mote.id, parent);
            return Ok(());
        }

        let num_cells = self.config.num_cells_to_add_remove.min(held - 1);
        let timeout = self.sixtop_timeout(mote, parent, ctx)?;
        info!(
            "[msf] {} triggering 6P DELETE of {} cells, dir {}, to {}, 6P timeout {}",
            mote.id,
            num_cells,
            Direction::TxRxShared,
            parent,
            timeout
        );
        ctx.issue_delete_request(mote.id, parent, num_cells, Direction::TxRxShared, timeout);
        Ok(())
    }

    fn require_parent(&self, mote: &MoteView<'_>) -> Result<NodeId, SfError> {
        mote.rpl
            .preferred_parent()
            .ok_or_else(|| SfError::contract(mote.id, "bandwidth change without a preferred parent"))
    }
}

/// Negotiation timeout towards `neighbor` from the delivery ratio of the
/// TX and shared cells held with it.
///
/// `ceil(slotframe_duration / cells * 1 / mean_ratio * SIXP_TIMEOUT_SEC_FACTOR)`,
/// or [`DEFAULT_SIXTOP_TIMEOUT_S`] when no such cell exists.
pub fn sixtop_timeout(
    node: NodeId,
    schedule: &Schedule,
    neighbor: NodeId,
    slotframe_length: u16,
    slot_duration_s: f64,
) -> Result<u32, SfError> {
    let ratios: Vec<f64> = schedule
        .cells_with(neighbor)
        .filter(|cell| cell.direction.can_transmit())
        .map(|cell| cell.delivery_ratio())
        .collect();

    if ratios.is_empty() {
        return Ok(DEFAULT_SIXTOP_TIMEOUT_S);
    }

    let count = ratios.len() as f64;
    let mean = ratios.iter().sum::<f64>() / count;
    if !(mean > 0.0 && mean <= 1.0) {
        return Err(SfError::contract(
            node,
            format!("mean delivery ratio {} towards {} outside (0, 1]", mean, neighbor),
        ));
    }

    let slotframe_s = f64::from(slotframe_length) * slot_duration_s;
    let timeout = (slotframe_s / count * (1.0 / mean) * SIXP_TIMEOUT_SEC_FACTOR).ceil();
    trace!("[sixtop] {} timeout to {}: ratios {:?} -> {}s", node, neighbor, ratios, timeout);
    Ok(timeout as u32)
}
