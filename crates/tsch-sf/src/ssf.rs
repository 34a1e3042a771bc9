//! Static schedule installers.
//!
//! Each installer runs once at setup against the finished parent graph and
//! allocates dedicated TX/RX cells on channel 0 through [`crate::alloc`].
//! Slot 0 is never handed out by the cascading installers; it belongs to
//! the shared minimal cell.

use crate::alloc::alloc_cell;
use crate::mote::Motes;
use crate::{SfError, SfKind};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tracing::{debug, info};
use tsch_common::NodeId;

/// Slot assignment policy of the two-branch cascading installer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SsfInitMethod {
    /// Global counter, one slot per hop.
    #[default]
    Sequential,
    /// Uniform draw among the slots not used yet.
    RandomPick,
}

impl std::fmt::Display for SsfInitMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SsfInitMethod::Sequential => f.write_str("sequential"),
            SsfInitMethod::RandomPick => f.write_str("random-pick"),
        }
    }
}

/// Install the static schedule of `kind` on every mote.
///
/// Returns the number of cells allocated. MSF installs nothing here.
pub fn install<R: Rng + ?Sized>(
    kind: SfKind,
    motes: &mut Motes,
    slotframe_length: u16,
    init_method: SsfInitMethod,
    rng: &mut R,
) -> Result<usize, SfError> {
    let allocated = match kind {
        SfKind::Msf => 0,
        SfKind::SsfSymmetric => install_symmetric(motes, slotframe_length)?,
        SfKind::SsfCascading => install_cascading(motes, slotframe_length)?,
        SfKind::SsfTwoBranchCascading => {
            install_two_branch_cascading(motes, slotframe_length, init_method, rng)?
        }
    };
    if kind.is_static() {
        info!(
            "[ssf] {} installed {} cells over {} motes",
            kind,
            allocated,
            motes.len()
        );
    }
    Ok(allocated)
}

/// One cell per non-root mote, at slot = mote identifier, towards its parent.
pub fn install_symmetric(motes: &mut Motes, slotframe_length: u16) -> Result<usize, SfError> {
    let mut allocated = 0;
    for id in motes.ids() {
        let mote = motes.mote(id)?;
        if mote.is_dag_root() {
            continue;
        }
        let parent = mote
            .rpl
            .preferred_parent()
            .ok_or_else(|| SfError::contract(id, "symmetric schedule needs a preferred parent"))?;

        let slot_offset = u16::try_from(id.as_u32())
            .ok()
            .filter(|slot| *slot < slotframe_length)
            .ok_or(SfError::SlotOutOfRange {
                node: id,
                slot_offset: id.as_u32(),
                slotframe_length,
            })?;

        alloc_cell(motes, id, parent, slot_offset, 0)?;
        debug!("[ssf] {} -> {} at slot {}", id, parent, slot_offset);
        allocated += 1;
    }
    Ok(allocated)
}

/// Walk every mote's path to the root in reverse enumeration order,
/// allocating one cell per hop from a counter starting at slot 1.
///
/// Links shared by several paths are allocated once per path.
pub fn install_cascading(motes: &mut Motes, slotframe_length: u16) -> Result<usize, SfError> {
    let mut pointer: u16 = 1;
    walk_paths(motes, |transmitter, receiver| {
        if pointer >= slotframe_length {
            return Err(SfError::SlotframeTooSmall {
                slotframe_length,
                transmitter,
                receiver,
            });
        }
        let slot = pointer;
        pointer += 1;
        Ok(slot)
    })
}

/// Cascading walk with a selectable slot policy.
pub fn install_two_branch_cascading<R: Rng + ?Sized>(
    motes: &mut Motes,
    slotframe_length: u16,
    init_method: SsfInitMethod,
    rng: &mut R,
) -> Result<usize, SfError> {
    match init_method {
        SsfInitMethod::Sequential => {
            let mut pointer: u16 = 0;
            walk_paths(motes, |transmitter, receiver| {
                pointer = pointer
                    .checked_add(1)
                    .filter(|next| *next < slotframe_length)
                    .ok_or(SfError::SlotframeTooSmall {
                        slotframe_length,
                        transmitter,
                        receiver,
                    })?;
                Ok(pointer)
            })
        }
        SsfInitMethod::RandomPick => {
            let mut picker = RandomPicker::new(slotframe_length);
            walk_paths(motes, |transmitter, receiver| {
                picker.pick(&mut *rng).ok_or(SfError::SlotframeTooSmall {
                    slotframe_length,
                    transmitter,
                    receiver,
                })
            })
        }
    }
}

/// Draws distinct slots from `[1, slotframe_length)`.
///
/// The used-set starts with slot 0, so it is full exactly when every
/// drawable slot is taken.
struct RandomPicker {
    slotframe_length: u16,
    used: BTreeSet<u16>,
}

impl RandomPicker {
    fn new(slotframe_length: u16) -> Self {
        RandomPicker {
            slotframe_length,
            used: BTreeSet::from([0]),
        }
    }

    fn pick<R: Rng + ?Sized>(&mut self, rng: &mut R) -> Option<u16> {
        if self.used.len() >= usize::from(self.slotframe_length) {
            return None;
        }
        loop {
            let slot = rng.gen_range(1..self.slotframe_length);
            if self.used.insert(slot) {
                return Some(slot);
            }
        }
    }
}

/// Visit motes in reverse enumeration order and walk each one up to the
/// root, allocating a cell per hop at the slot `next_slot` returns.
fn walk_paths<F>(motes: &mut Motes, mut next_slot: F) -> Result<usize, SfError>
where
    F: FnMut(NodeId, NodeId) -> Result<u16, SfError>,
{
    let mut allocated = 0;
    let ids = motes.ids();
    for start in ids.iter().rev().copied() {
        let mut child = start;
        let mut hops = 0;
        while let Some(parent) = motes.mote(child)?.rpl.preferred_parent() {
            hops += 1;
            if hops > motes.len() {
                return Err(SfError::RoutingLoop(start));
            }
            let slot = next_slot(child, parent)?;
            alloc_cell(motes, child, parent, slot, 0)?;
            debug!("[ssf] {} -> {} at slot {} (path of {})", child, parent, slot, start);
            allocated += 1;
            child = parent;
        }
    }
    Ok(allocated)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Mote, MsfConfig};
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;
    use tsch_common::{Cell, Direction};

    /// Motes `0..parents.len()`; mote 0 is the root, `parents[i]` is the
    /// parent of mote `i` (ignored for the root).
    fn tree(kind: SfKind, parents: &[u32]) -> Motes {
        let config = MsfConfig::default();
        let mut motes = Motes::new();
        for (i, parent) in parents.iter().enumerate() {
            let id = NodeId(i as u32);
            let mut mote = Mote::new(id, i == 0, kind, &config);
            if i != 0 {
                mote.rpl.join(NodeId(*parent));
            }
            motes.insert(mote);
        }
        motes
    }

    fn tx_slots(motes: &Motes, id: u32) -> Vec<u16> {
        motes
            .mote(NodeId(id))
            .unwrap()
            .cells
            .schedule
            .iter()
            .filter(|c| c.direction == Direction::Tx)
            .map(|c| c.slot_offset)
            .collect()
    }

    fn rng() -> ChaCha8Rng {
        ChaCha8Rng::seed_from_u64(42)
    }

    #[test]
    fn test_symmetric_uses_node_id_as_slot() {
        let mut motes = tree(SfKind::SsfSymmetric, &[0, 0, 1, 1]);
        let allocated = install_symmetric(&mut motes, 101).unwrap();
        assert_eq!(allocated, 3);

        for k in 1..4u32 {
            let mote = motes.mote(NodeId(k)).unwrap();
            let parent = mote.rpl.preferred_parent().unwrap();
            let cell = mote.cells.schedule.get(k as u16).unwrap();
            assert_eq!(cell.cell(), Cell::new(k as u16, 0, Direction::Tx));
            assert_eq!(cell.neighbor, parent);
            assert_eq!(tx_slots(&motes, k), vec![k as u16]);

            let rx = motes.mote(parent).unwrap().cells.schedule.get(k as u16).unwrap();
            assert_eq!(rx.direction, Direction::Rx);
            assert_eq!(rx.neighbor, NodeId(k));
        }
        assert!(motes.mote(NodeId(0)).unwrap().cells.schedule.iter().all(|c| c.direction == Direction::Rx));
    }

    #[test]
    fn test_symmetric_rejects_id_outside_slotframe() {
        let mut motes = tree(SfKind::SsfSymmetric, &[0, 0, 0, 0, 0]);
        let err = install_symmetric(&mut motes, 4).unwrap_err();
        assert!(matches!(
            err,
            SfError::SlotOutOfRange { node: NodeId(4), slot_offset: 4, slotframe_length: 4 }
        ));
    }

    #[test]
    fn test_symmetric_requires_parent() {
        let config = MsfConfig::default();
        let mut motes = Motes::new();
        motes.insert(Mote::new(NodeId(0), true, SfKind::SsfSymmetric, &config));
        motes.insert(Mote::new(NodeId(1), false, SfKind::SsfSymmetric, &config));
        let err = install_symmetric(&mut motes, 101).unwrap_err();
        assert!(matches!(err, SfError::ContractViolation { node: NodeId(1), .. }));
    }

    #[test]
    fn test_cascading_two_node_chain() {
        let mut motes = tree(SfKind::SsfCascading, &[0, 0]);
        assert_eq!(install_cascading(&mut motes, 101).unwrap(), 1);

        let cell = motes.mote(NodeId(1)).unwrap().cells.schedule.get(1).unwrap();
        assert_eq!(cell.cell(), Cell::new(1, 0, Direction::Tx));
        assert_eq!(cell.neighbor, NodeId(0));
        assert_eq!(motes.mote(NodeId(0)).unwrap().cells.num_cells_from(NodeId(1)), 1);
    }

    #[test]
    fn test_cascading_reallocates_shared_upper_links() {
        // 0 <- 1 <- 2: mote 2's path covers 2->1 and 1->0, then mote 1's own
        // path allocates 1->0 a second time on a fresh slot.
        let mut motes = tree(SfKind::SsfCascading, &[0, 0, 1]);
        assert_eq!(install_cascading(&mut motes, 101).unwrap(), 3);

        assert_eq!(tx_slots(&motes, 2), vec![1]);
        assert_eq!(tx_slots(&motes, 1), vec![2, 3]);
        assert_eq!(motes.mote(NodeId(1)).unwrap().cells.num_cells_to(NodeId(0)), 2);
    }

    #[test]
    fn test_cascading_capacity_error() {
        // Chain of 4 needs 3 + 2 + 1 = 6 hops; slots 1..=5 fit in a frame of 6.
        let mut motes = tree(SfKind::SsfCascading, &[0, 0, 1, 2]);
        assert!(matches!(
            install_cascading(&mut motes, 6),
            Err(SfError::SlotframeTooSmall { slotframe_length: 6, .. })
        ));

        let mut motes = tree(SfKind::SsfCascading, &[0, 0, 1, 2]);
        assert_eq!(install_cascading(&mut motes, 7).unwrap(), 6);
    }

    #[test]
    fn test_two_branch_sequential() {
        let mut motes = tree(SfKind::SsfTwoBranchCascading, &[0, 0, 0]);
        let n = install_two_branch_cascading(&mut motes, 101, SsfInitMethod::Sequential, &mut rng())
            .unwrap();
        assert_eq!(n, 2);
        assert_eq!(tx_slots(&motes, 2), vec![1]);
        assert_eq!(tx_slots(&motes, 1), vec![2]);

        let mut motes = tree(SfKind::SsfTwoBranchCascading, &[0, 0, 0, 0]);
        let err = install_two_branch_cascading(&mut motes, 3, SsfInitMethod::Sequential, &mut rng())
            .unwrap_err();
        assert!(matches!(
            err,
            SfError::SlotframeTooSmall { transmitter: NodeId(1), receiver: NodeId(0), .. }
        ));
    }

    #[test]
    fn test_random_pick_never_uses_slot_zero() {
        let mut motes = tree(SfKind::SsfTwoBranchCascading, &[0, 0, 1, 2, 0, 4]);
        let n = install_two_branch_cascading(&mut motes, 101, SsfInitMethod::RandomPick, &mut rng())
            .unwrap();
        assert_eq!(n, 3 + 2 + 1 + 1 + 2);

        let mut seen = BTreeSet::new();
        for mote in motes.iter() {
            for cell in mote.cells.schedule.iter().filter(|c| c.direction == Direction::Tx) {
                assert_ne!(cell.slot_offset, 0);
                assert!(cell.slot_offset < 101);
                assert!(seen.insert(cell.slot_offset), "slot {} reused", cell.slot_offset);
            }
        }
    }

    #[test]
    fn test_random_pick_exhaustion() {
        let mut picker = RandomPicker::new(5);
        let mut rng = rng();
        let mut slots: Vec<u16> = (0..4).filter_map(|_| picker.pick(&mut rng)).collect();
        slots.sort_unstable();
        assert_eq!(slots, vec![1, 2, 3, 4]);
        assert_eq!(picker.used.len(), 5);
        assert_eq!(picker.pick(&mut rng), None);

        // 3 hops fit in slots 1..=3 of a 4-slot frame; a 4th hop does not.
        let mut motes = tree(SfKind::SsfTwoBranchCascading, &[0, 0, 1]);
        assert_eq!(
            install_two_branch_cascading(&mut motes, 4, SsfInitMethod::RandomPick, &mut rng).unwrap(),
            3
        );
        let mut motes = tree(SfKind::SsfTwoBranchCascading, &[0, 0, 1, 0]);
        assert!(matches!(
            install_two_branch_cascading(&mut motes, 4, SsfInitMethod::RandomPick, &mut rng),
            Err(SfError::SlotframeTooSmall { .. })
        ));
    }

    #[test]
    fn test_walk_detects_routing_loop() {
        let config = MsfConfig::default();
        let mut motes = Motes::new();
        motes.insert(Mote::new(NodeId(0), true, SfKind::SsfCascading, &config));
        for (id, parent) in [(1, 2), (2, 1)] {
            let mut mote = Mote::new(NodeId(id), false, SfKind::SsfCascading, &config);
            mote.rpl.join(NodeId(parent));
            motes.insert(mote);
        }
        assert!(matches!(
            install_cascading(&mut motes, 101),
            Err(SfError::RoutingLoop(NodeId(2)))
        ));
    }

    #[test]
    fn test_install_dispatch() {
        let mut motes = tree(SfKind::Msf, &[0, 0, 1]);
        assert_eq!(install(SfKind::Msf, &mut motes, 101, SsfInitMethod::Sequential, &mut rng()).unwrap(), 0);
        assert!(motes.iter().all(|m| m.cells.schedule.is_empty()));

        let mut motes = tree(SfKind::SsfSymmetric, &[0, 0, 1]);
        assert_eq!(
            install(SfKind::SsfSymmetric, &mut motes, 101, SsfInitMethod::Sequential, &mut rng()).unwrap(),
            2
        );
        assert_eq!(SsfInitMethod::default().to_string(), "sequential");
    }
}
