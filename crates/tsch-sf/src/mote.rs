//! Node arena.
//!
//! Motes are stored in a flat map keyed by [`NodeId`]. Parents, old parents
//! and per-neighbor counters all hold identifiers, never references, and are
//! resolved through [`Motes`] when needed.

use crate::msf::MsfConfig;
use crate::{SchedulingFunction, SfError, SfKind};
use std::collections::{BTreeMap, HashMap};
use tsch_common::{CellType, Direction, NodeId, Schedule, SfAction, SimContext, SimError};

/// Routing state of a mote as maintained by the routing layer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Routing {
    preferred_parent: Option<NodeId>,
    old_preferred_parent: Option<NodeId>,
}

impl Routing {
    /// Current preferred parent.
    pub fn preferred_parent(&self) -> Option<NodeId> {
        self.preferred_parent
    }

    /// Parent held before the last change, until the change completes.
    pub fn old_preferred_parent(&self) -> Option<NodeId> {
        self.old_preferred_parent
    }

    /// Set or clear the old parent marker.
    pub fn set_old_preferred_parent(&mut self, parent: Option<NodeId>) {
        self.old_preferred_parent = parent;
    }

    /// Join a first parent.
    pub fn join(&mut self, parent: NodeId) {
        self.preferred_parent = Some(parent);
    }

    /// Switch to a new parent, remembering the current one.
    ///
    /// Returns false when `parent` already is the preferred parent.
    pub fn switch_parent(&mut self, parent: NodeId) -> bool {
        if self.preferred_parent == Some(parent) {
            return false;
        }
        if self.preferred_parent.is_some() {
            self.old_preferred_parent = self.preferred_parent;
        }
        self.preferred_parent = Some(parent);
        true
    }
}

/// A mote's schedule together with its per-neighbor cell counters.
///
/// Counters are only changed through [`crate::alloc`].
#[derive(Debug, Clone, Default)]
pub struct CellTable {
    /// Installed cells.
    pub schedule: Schedule,
    num_cells_to_neighbors: HashMap<NodeId, u32>,
    num_cells_from_neighbors: HashMap<NodeId, u32>,
}

impl CellTable {
    /// Cells this mote holds as transmitter towards `neighbor`.
    pub fn num_cells_to(&self, neighbor: NodeId) -> u32 {
        self.num_cells_to_neighbors.get(&neighbor).copied().unwrap_or(0)
    }

    /// Cells this mote holds as receiver from `neighbor`.
    pub fn num_cells_from(&self, neighbor: NodeId) -> u32 {
        self.num_cells_from_neighbors.get(&neighbor).copied().unwrap_or(0)
    }

    pub(crate) fn increment_to(&mut self, neighbor: NodeId) {
        *self.num_cells_to_neighbors.entry(neighbor).or_insert(0) += 1;
    }

    pub(crate) fn increment_from(&mut self, neighbor: NodeId) {
        *self.num_cells_from_neighbors.entry(neighbor).or_insert(0) += 1;
    }

    pub(crate) fn decrement_to(&mut self, neighbor: NodeId) {
        decrement(&mut self.num_cells_to_neighbors, neighbor);
    }

    pub(crate) fn decrement_from(&mut self, neighbor: NodeId) {
        decrement(&mut self.num_cells_from_neighbors, neighbor);
    }
}

fn decrement(counts: &mut HashMap<NodeId, u32>, neighbor: NodeId) {
    if let Some(count) = counts.get_mut(&neighbor) {
        *count = count.saturating_sub(1);
        if *count == 0 {
            counts.remove(&neighbor);
        }
    }
}

/// What a scheduling function sees of its mote.
pub struct MoteView<'a> {
    /// Mote identifier.
    pub id: NodeId,
    /// Whether the mote is the DAG root.
    pub dag_root: bool,
    /// Routing state.
    pub rpl: &'a mut Routing,
    /// Schedule and counters.
    pub cells: &'a CellTable,
}

/// A simulated node.
#[derive(Debug, Clone)]
pub struct Mote {
    id: NodeId,
    dag_root: bool,
    /// Routing state.
    pub rpl: Routing,
    /// Schedule and per-neighbor counters.
    pub cells: CellTable,
    sf: SchedulingFunction,
}

impl Mote {
    /// Create a mote running the given scheduling function.
    pub fn new(id: NodeId, dag_root: bool, kind: SfKind, msf_config: &MsfConfig) -> Self {
        Mote {
            id,
            dag_root,
            rpl: Routing::default(),
            cells: CellTable::default(),
            sf: SchedulingFunction::new(kind, msf_config),
        }
    }

    /// Mote identifier.
    pub fn id(&self) -> NodeId {
        self.id
    }

    /// Whether the mote is the DAG root.
    pub fn is_dag_root(&self) -> bool {
        self.dag_root
    }

    /// The mote's scheduling function.
    pub fn sf(&self) -> &SchedulingFunction {
        &self.sf
    }

    /// Mutable access to the mote's scheduling function.
    pub fn sf_mut(&mut self) -> &mut SchedulingFunction {
        &mut self.sf
    }

    fn split(&mut self) -> (&mut SchedulingFunction, MoteView<'_>) {
        (
            &mut self.sf,
            MoteView {
                id: self.id,
                dag_root: self.dag_root,
                rpl: &mut self.rpl,
                cells: &self.cells,
            },
        )
    }

    /// Activate the scheduling function.
    pub fn activate(&mut self, ctx: &mut SimContext) -> Result<(), SfError> {
        let (sf, mut view) = self.split();
        sf.activate(&mut view, ctx)
    }

    /// Notify the scheduling function of a parent change.
    pub fn schedule_parent_change(&mut self, ctx: &mut SimContext) -> Result<(), SfError> {
        let (sf, view) = self.split();
        sf.schedule_parent_change(&view, ctx)
    }

    /// Report a used cell.
    pub fn signal_cell_used(
        &mut self,
        neighbor: NodeId,
        cell_options: Direction,
        direction: Direction,
        cell_type: CellType,
    ) -> Result<(), SfError> {
        let (sf, view) = self.split();
        sf.signal_cell_used(&view, neighbor, cell_options, direction, cell_type)
    }

    /// Report an elapsed cell.
    pub fn signal_cell_elapsed(
        &mut self,
        neighbor: NodeId,
        direction: Direction,
        ctx: &mut SimContext,
    ) -> Result<(), SfError> {
        let (sf, view) = self.split();
        sf.signal_cell_elapsed(&view, neighbor, direction, ctx)
    }

    /// Run a scheduled callback.
    pub fn handle_action(&mut self, action: SfAction, ctx: &mut SimContext) -> Result<(), SfError> {
        let (sf, mut view) = self.split();
        sf.handle_action(action, &mut view, ctx)
    }
}

/// Flat arena of motes in enumeration (identifier) order.
#[derive(Debug, Clone, Default)]
pub struct Motes {
    motes: BTreeMap<NodeId, Mote>,
}

impl Motes {
    /// Create an empty arena.
    pub fn new() -> Self {
        Motes::default()
    }

    /// Add a mote, replacing any mote with the same identifier.
    pub fn insert(&mut self, mote: Mote) {
        self.motes.insert(mote.id(), mote);
    }

    /// Get a mote by ID.
    pub fn get(&self, id: NodeId) -> Option<&Mote> {
        self.motes.get(&id)
    }

    /// Get a mutable reference to a mote by ID.
    pub fn get_mut(&mut self, id: NodeId) -> Option<&mut Mote> {
        self.motes.get_mut(&id)
    }

    /// Get a mote, failing if it does not exist.
    pub fn mote(&self, id: NodeId) -> Result<&Mote, SimError> {
        self.motes.get(&id).ok_or(SimError::NodeNotFound(id))
    }

    /// Get a mutable mote, failing if it does not exist.
    pub fn mote_mut(&mut self, id: NodeId) -> Result<&mut Mote, SimError> {
        self.motes.get_mut(&id).ok_or(SimError::NodeNotFound(id))
    }

    /// Whether a mote exists.
    pub fn contains(&self, id: NodeId) -> bool {
        self.motes.contains_key(&id)
    }

    /// All identifiers in enumeration order.
    pub fn ids(&self) -> Vec<NodeId> {
        self.motes.keys().copied().collect()
    }

    /// All motes in enumeration order.
    pub fn iter(&self) -> impl Iterator<Item = &Mote> + '_ {
        self.motes.values()
    }

    /// All motes in enumeration order, mutably.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Mote> + '_ {
        self.motes.values_mut()
    }

    /// Number of motes.
    pub fn len(&self) -> usize {
        self.motes.len()
    }

    /// Check if the arena is empty.
    pub fn is_empty(&self) -> bool {
        self.motes.is_empty()
    }
}
