//! Per-node link-layer schedule store.
//!
//! Maps slot offsets to the cell installed there together with the
//! delivery statistics the MAC layer accumulates for it.

use crate::{Cell, Direction, NodeId};
use serde::Serialize;
use std::collections::BTreeMap;

/// Transmissions needed before the measured ratio replaces the link prior.
pub const NUM_SUFFICIENT_TX: u32 = 10;

/// A cell installed in a node's schedule.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CellRecord {
    /// Timeslot within the slotframe.
    pub slot_offset: u16,
    /// Channel offset.
    pub channel_offset: u16,
    /// Direction as seen from the holder.
    pub direction: Direction,
    /// Neighbor at the other end of the cell.
    pub neighbor: NodeId,
    num_tx: u32,
    num_tx_ack: u32,
    link_pdr: f64,
}

impl CellRecord {
    /// Create a record with no statistics and a perfect link prior.
    pub fn new(cell: Cell, neighbor: NodeId) -> Self {
        CellRecord {
            slot_offset: cell.slot_offset,
            channel_offset: cell.channel_offset,
            direction: cell.direction,
            neighbor,
            num_tx: 0,
            num_tx_ack: 0,
            link_pdr: 1.0,
        }
    }

    /// Set the link delivery ratio used until enough transmissions are seen.
    pub fn with_link_pdr(mut self, link_pdr: f64) -> Self {
        self.link_pdr = link_pdr;
        self
    }

    /// Update the link delivery ratio prior.
    pub fn set_link_pdr(&mut self, link_pdr: f64) {
        self.link_pdr = link_pdr;
    }

    /// Record one transmission attempt.
    pub fn record_tx(&mut self, acked: bool) {
        self.num_tx += 1;
        if acked {
            self.num_tx_ack += 1;
        }
    }

    /// Transmission attempts seen on this cell.
    pub fn num_tx(&self) -> u32 {
        self.num_tx
    }

    /// Acknowledged transmissions seen on this cell.
    pub fn num_tx_ack(&self) -> u32 {
        self.num_tx_ack
    }

    /// Fraction of successful transmissions on this cell.
    pub fn delivery_ratio(&self) -> f64 {
        if self.num_tx < NUM_SUFFICIENT_TX {
            self.link_pdr
        } else {
            f64::from(self.num_tx_ack) / f64::from(self.num_tx)
        }
    }

    /// The bare cell.
    pub fn cell(&self) -> Cell {
        Cell::new(self.slot_offset, self.channel_offset, self.direction)
    }
}

/// A node's schedule, keyed by slot offset.
#[derive(Debug, Clone, Default)]
pub struct Schedule {
    cells: BTreeMap<u16, CellRecord>,
}

impl Schedule {
    /// Create an empty schedule.
    pub fn new() -> Self {
        Schedule::default()
    }

    /// Install cells towards a neighbor.
    ///
    /// No collision check: a cell at an occupied slot replaces the old one.
    pub fn add_cells(&mut self, neighbor: NodeId, cells: &[Cell]) {
        for cell in cells {
            self.cells
                .insert(cell.slot_offset, CellRecord::new(*cell, neighbor));
        }
    }

    /// Install a fully formed record.
    pub fn insert(&mut self, record: CellRecord) {
        self.cells.insert(record.slot_offset, record);
    }

    /// Remove the cell at a slot.
    pub fn remove_cell(&mut self, slot_offset: u16) -> Option<CellRecord> {
        self.cells.remove(&slot_offset)
    }

    /// Get the cell at a slot.
    pub fn get(&self, slot_offset: u16) -> Option<&CellRecord> {
        self.cells.get(&slot_offset)
    }

    /// Get mutable access to the cell at a slot.
    pub fn get_mut(&mut self, slot_offset: u16) -> Option<&mut CellRecord> {
        self.cells.get_mut(&slot_offset)
    }

    /// Whether no cell is installed at the slot.
    pub fn is_slot_free(&self, slot_offset: u16) -> bool {
        !self.cells.contains_key(&slot_offset)
    }

    /// All cells in slot order.
    pub fn iter(&self) -> impl Iterator<Item = &CellRecord> + '_ {
        self.cells.values()
    }

    /// All cells in slot order, mutably.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut CellRecord> + '_ {
        self.cells.values_mut()
    }

    /// Cells whose other end is `neighbor`.
    pub fn cells_with(&self, neighbor: NodeId) -> impl Iterator<Item = &CellRecord> + '_ {
        self.cells.values().filter(move |c| c.neighbor == neighbor)
    }

    /// Number of installed cells.
    pub fn len(&self) -> usize {
        self.cells.len()
    }

    /// Check if the schedule is empty.
    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delivery_ratio_uses_prior_until_sufficient() {
        let mut record =
            CellRecord::new(Cell::new(4, 0, Direction::Tx), NodeId(1)).with_link_pdr(0.7);
        for _ in 0..NUM_SUFFICIENT_TX - 1 {
            record.record_tx(true);
        }
        assert!((record.delivery_ratio() - 0.7).abs() < 1e-12);

        record.record_tx(false);
        assert_eq!(record.num_tx(), NUM_SUFFICIENT_TX);
        assert!((record.delivery_ratio() - 0.9).abs() < 1e-12);
    }

    #[test]
    fn test_schedule_add_and_remove() {
        let mut schedule = Schedule::new();
        schedule.add_cells(
            NodeId(2),
            &[Cell::new(3, 0, Direction::Rx), Cell::new(7, 1, Direction::Rx)],
        );
        schedule.add_cells(NodeId(0), &[Cell::new(5, 0, Direction::Tx)]);

        assert_eq!(schedule.len(), 3);
        assert_eq!(schedule.cells_with(NodeId(2)).count(), 2);
        assert!(!schedule.is_slot_free(7));

        let removed = schedule.remove_cell(7).unwrap();
        assert_eq!(removed.channel_offset, 1);
        assert!(schedule.is_slot_free(7));
        let slots: Vec<u16> = schedule.iter().map(|c| c.slot_offset).collect();
        assert_eq!(slots, vec![3, 5]);
    }
}
