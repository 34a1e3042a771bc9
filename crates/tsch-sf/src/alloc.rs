//! Cell allocation helper.
//!
//! Installs (and releases) the two mirrored halves of a cell and keeps the
//! per-neighbor counters of both endpoints in step. There is no collision or
//! duplicate check; callers choose unique slots.

use crate::mote::Motes;
use crate::SfError;
use tsch_common::{Cell, CellRecord, Direction, NodeId, SimError};

/// Install a dedicated TX cell at `transmitter` and its RX mirror at `receiver`.
pub fn alloc_cell(
    motes: &mut Motes,
    transmitter: NodeId,
    receiver: NodeId,
    slot_offset: u16,
    channel_offset: u16,
) -> Result<(), SfError> {
    install(
        motes,
        transmitter,
        receiver,
        Cell::new(slot_offset, channel_offset, Direction::Tx),
    )
}

/// Install a shared TX/RX cell, recorded identically at both ends.
///
/// `requester` is counted as the transmitting side.
pub fn alloc_shared_cell(
    motes: &mut Motes,
    requester: NodeId,
    neighbor: NodeId,
    slot_offset: u16,
    channel_offset: u16,
) -> Result<(), SfError> {
    install(
        motes,
        requester,
        neighbor,
        Cell::new(slot_offset, channel_offset, Direction::TxRxShared),
    )
}

fn install(motes: &mut Motes, transmitter: NodeId, receiver: NodeId, cell: Cell) -> Result<(), SfError> {
    if !motes.contains(receiver) {
        return Err(SimError::NodeNotFound(receiver).into());
    }

    let tx = motes.mote_mut(transmitter)?;
    tx.cells.schedule.add_cells(receiver, &[cell]);
    tx.cells.increment_to(receiver);

    let mirrored = Cell::new(cell.slot_offset, cell.channel_offset, cell.direction.mirrored());
    let rx = motes.mote_mut(receiver)?;
    rx.cells.schedule.add_cells(transmitter, &[mirrored]);
    rx.cells.increment_from(transmitter);
    Ok(())
}

/// Remove the cell at `slot_offset` between `transmitter` and `receiver`.
///
/// Returns the transmitter's record, or `None` when the transmitter holds no
/// cell with `receiver` at that slot (nothing is changed then).
pub fn release_cell(
    motes: &mut Motes,
    transmitter: NodeId,
    receiver: NodeId,
    slot_offset: u16,
) -> Result<Option<CellRecord>, SfError> {
    if !motes.contains(receiver) {
        return Err(SimError::NodeNotFound(receiver).into());
    }

    let tx = motes.mote_mut(transmitter)?;
    let held = tx
        .cells
        .schedule
        .get(slot_offset)
        .is_some_and(|c| c.neighbor == receiver);
    if !held {
        return Ok(None);
    }
    let record = tx.cells.schedule.remove_cell(slot_offset);
    tx.cells.decrement_to(receiver);

    let rx = motes.mote_mut(receiver)?;
    if rx
        .cells
        .schedule
        .get(slot_offset)
        .is_some_and(|c| c.neighbor == transmitter)
    {
        rx.cells.schedule.remove_cell(slot_offset);
    }
    rx.cells.decrement_from(transmitter);
    Ok(record)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Mote, MsfConfig, SfKind};

    fn pair() -> Motes {
        let config = MsfConfig::default();
        let mut motes = Motes::new();
        motes.insert(Mote::new(NodeId(0), true, SfKind::SsfSymmetric, &config));
        motes.insert(Mote::new(NodeId(1), false, SfKind::SsfSymmetric, &config));
        motes
    }

    #[test]
    fn test_alloc_cell_mirrors_both_ends() {
        let mut motes = pair();
        alloc_cell(&mut motes, NodeId(1), NodeId(0), 5, 2).unwrap();

        let child = motes.mote(NodeId(1)).unwrap();
        let tx = child.cells.schedule.get(5).unwrap();
        assert_eq!(tx.cell(), Cell::new(5, 2, Direction::Tx));
        assert_eq!(tx.neighbor, NodeId(0));
        assert_eq!(child.cells.num_cells_to(NodeId(0)), 1);

        let root = motes.mote(NodeId(0)).unwrap();
        let rx = root.cells.schedule.get(5).unwrap();
        assert_eq!(rx.cell(), Cell::new(5, 2, Direction::Rx));
        assert_eq!(rx.neighbor, NodeId(1));
        assert_eq!(root.cells.num_cells_from(NodeId(1)), 1);
    }

    #[test]
    fn test_shared_cell_recorded_identically() {
        let mut motes = pair();
        alloc_shared_cell(&mut motes, NodeId(1), NodeId(0), 9, 0).unwrap();

        let a = motes.mote(NodeId(1)).unwrap().cells.schedule.get(9).unwrap().cell();
        let b = motes.mote(NodeId(0)).unwrap().cells.schedule.get(9).unwrap().cell();
        assert_eq!(a, b);
        assert_eq!(a.direction, Direction::TxRxShared);
    }

    #[test]
    fn test_alloc_to_unknown_mote_changes_nothing() {
        let mut motes = pair();
        let err = alloc_cell(&mut motes, NodeId(1), NodeId(9), 5, 0).unwrap_err();
        assert!(matches!(err, SfError::Sim(SimError::NodeNotFound(NodeId(9)))));
        assert!(motes.mote(NodeId(1)).unwrap().cells.schedule.is_empty());
    }

    #[test]
    fn test_release_cell_undoes_alloc() {
        let mut motes = pair();
        alloc_shared_cell(&mut motes, NodeId(1), NodeId(0), 9, 0).unwrap();
        alloc_shared_cell(&mut motes, NodeId(1), NodeId(0), 11, 3).unwrap();

        let released = release_cell(&mut motes, NodeId(1), NodeId(0), 9).unwrap();
        assert_eq!(released.map(|r| r.slot_offset), Some(9));
        assert!(release_cell(&mut motes, NodeId(1), NodeId(0), 9).unwrap().is_none());

        let child = motes.mote(NodeId(1)).unwrap();
        assert_eq!(child.cells.num_cells_to(NodeId(0)), 1);
        let root = motes.mote(NodeId(0)).unwrap();
        assert_eq!(root.cells.num_cells_from(NodeId(1)), 1);
        assert!(root.cells.schedule.is_slot_free(9));
        assert!(!root.cells.schedule.is_slot_free(11));
    }
}
