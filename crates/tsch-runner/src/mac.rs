//! Emulated MAC.
//!
//! Once per slotframe every mote walks its schedule in slot order. Each cell
//! towards the preferred parent on which the mote may transmit carries a
//! frame with probability `traffic_load`; the frame is acknowledged with the
//! link's delivery ratio. The scheduling function hears about every cell
//! opportunity: first the use (if any), then the elapsed cell.

use rand::Rng;
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::trace;
use tsch_common::{CellType, Direction, NodeId, SimContext};
use tsch_model::Model;
use tsch_sf::{Motes, SfError};

/// Transmission counters of one mote.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MacStats {
    /// Frames sent.
    pub tx: u64,
    /// Frames acknowledged.
    pub tx_acked: u64,
}

/// Per-mote MAC emulation.
#[derive(Debug)]
pub struct Mac {
    traffic_load: f64,
    stats: BTreeMap<NodeId, MacStats>,
}

impl Mac {
    /// Create a MAC offering `traffic_load` frames per upstream cell.
    pub fn new(traffic_load: f64) -> Self {
        Mac {
            traffic_load: traffic_load.clamp(0.0, 1.0),
            stats: BTreeMap::new(),
        }
    }

    /// Counters of a mote.
    pub fn stats(&self, id: NodeId) -> MacStats {
        self.stats.get(&id).copied().unwrap_or_default()
    }

    /// Run one slotframe on every mote.
    pub fn run_slotframe(
        &mut self,
        motes: &mut Motes,
        ctx: &mut SimContext,
        model: &Model,
    ) -> Result<(), SfError> {
        for id in motes.ids() {
            self.run_mote(id, motes, ctx, model)?;
        }
        Ok(())
    }

    fn run_mote(
        &mut self,
        id: NodeId,
        motes: &mut Motes,
        ctx: &mut SimContext,
        model: &Model,
    ) -> Result<(), SfError> {
        let mote = motes.mote_mut(id)?;
        let parent = mote.rpl.preferred_parent();
        let cells: Vec<(u16, NodeId, Direction)> = mote
            .cells
            .schedule
            .iter()
            .map(|c| (c.slot_offset, c.neighbor, c.direction))
            .collect();

        for (slot, neighbor, cell_options) in cells {
            let upstream = Some(neighbor) == parent && cell_options.can_transmit();
            let used = upstream && ctx.rng().gen_bool(self.traffic_load);

            if used {
                let pdr = model.link_pdr(id, neighbor);
                let acked = ctx.rng().gen_bool(pdr);
                if let Some(record) = mote.cells.schedule.get_mut(slot) {
                    record.set_link_pdr(pdr);
                    record.record_tx(acked);
                }
                let stats = self.stats.entry(id).or_default();
                stats.tx += 1;
                if acked {
                    stats.tx_acked += 1;
                }
                trace!("[mac] {} slot {} to {} acked={}", id, slot, neighbor, acked);
                mote.signal_cell_used(neighbor, cell_options, Direction::Tx, CellType::Data)?;
            }
            mote.signal_cell_elapsed(neighbor, cell_options, ctx)?;
        }
        Ok(())
    }
}
