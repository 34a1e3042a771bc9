//! # tsch-model
//!
//! YAML model loading and network building for the TSCH simulator.
//!
//! This crate provides:
//! - YAML schema types for simulation models
//! - Model loading and validation from files and strings
//! - Building the mote arena from a loaded model
//!
//! Every section is optional:
//!
//! ```yaml
//! simulation:
//!   seed: 7
//!   num_cycles_per_run: 200
//! sf:
//!   type: MSF
//! nodes:
//!   - { id: 0, root: true }
//!   - { id: 1, parent: 0 }
//!   - { id: 2, parent: 1 }
//! links:
//!   - { a: 1, b: 2, pdr: 0.8 }
//! ```

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use thiserror::Error;
use tracing::debug;
use tsch_common::NodeId;
use tsch_sf::{Mote, Motes, MsfConfig, SfKind, SsfInitMethod};

// ============================================================================
// Error Types
// ============================================================================

/// Errors that can occur during model operations.
#[derive(Debug, Error)]
pub enum ModelError {
    /// YAML parsing error.
    #[error("YAML parse error: {0}")]
    YamlError(#[from] serde_yaml::Error),

    /// IO error.
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    /// Invalid configuration.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Node referenced but not defined.
    #[error("Node not found: {0}")]
    NodeNotFound(NodeId),

    /// Node defined twice.
    #[error("Duplicate node: {0}")]
    DuplicateNode(NodeId),

    /// Invalid link definition.
    #[error("Invalid link: {a} <-> {b}")]
    InvalidLink {
        /// First endpoint.
        a: NodeId,
        /// Second endpoint.
        b: NodeId,
    },

    /// The parent graph has a cycle.
    #[error("Routing loop through {0}")]
    RoutingLoop(NodeId),
}

// ============================================================================
// Settings
// ============================================================================

/// Run length and repetition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SimulationSettings {
    /// Seed of the first run; run `i` uses `seed + i`.
    pub seed: u64,
    /// Run length in slotframes.
    pub num_cycles_per_run: u64,
    /// Number of runs.
    pub runs: u32,
}

impl Default for SimulationSettings {
    fn default() -> Self {
        SimulationSettings {
            seed: 0,
            num_cycles_per_run: 101,
            runs: 1,
        }
    }
}

/// Link-layer parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TschSettings {
    /// Timeslots per slotframe.
    pub slotframe_length: u16,
    /// Timeslot duration in seconds.
    pub slot_duration_s: f64,
    /// Channel offsets available to negotiated cells.
    pub num_channels: u16,
    /// Delivery ratio of links without an explicit entry.
    pub default_link_pdr: f64,
}

impl Default for TschSettings {
    fn default() -> Self {
        TschSettings {
            slotframe_length: 101,
            slot_duration_s: 0.010,
            num_channels: 16,
            default_link_pdr: 1.0,
        }
    }
}

impl TschSettings {
    /// Slotframe duration in seconds.
    pub fn slotframe_duration_s(&self) -> f64 {
        f64::from(self.slotframe_length) * self.slot_duration_s
    }
}

/// Scheduling function selection.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SfSettings {
    /// Variant run by every mote.
    #[serde(rename = "type")]
    pub kind: SfKind,
}

/// Static installer options.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SsfSettings {
    /// Slot policy of the two-branch cascading installer.
    pub init_method: SsfInitMethod,
}

/// Application traffic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AppSettings {
    /// Probability that an upstream cell opportunity carries a packet.
    pub traffic_load: f64,
}

impl Default for AppSettings {
    fn default() -> Self {
        AppSettings { traffic_load: 0.5 }
    }
}

/// A node definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NodeConfig {
    /// Node identifier.
    pub id: NodeId,
    /// Whether this node is the DAG root.
    #[serde(default)]
    pub root: bool,
    /// Initial preferred parent.
    #[serde(default)]
    pub parent: Option<NodeId>,
}

/// A parent switch at a fixed time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ParentChangeConfig {
    /// Time of the switch in seconds.
    pub at_s: f64,
    /// Node switching parents.
    pub node: NodeId,
    /// New preferred parent.
    pub new_parent: NodeId,
}

// ============================================================================
// YAML Schema Types (Internal)
// ============================================================================

/// Link delivery ratio override.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct LinkConfigYaml {
    a: NodeId,
    b: NodeId,
    pdr: f64,
}

/// Root simulation model structure (YAML schema).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct SimulationModelYaml {
    #[serde(default)]
    simulation: SimulationSettings,
    #[serde(default)]
    tsch: TschSettings,
    #[serde(default)]
    sf: SfSettings,
    #[serde(default)]
    msf: MsfConfig,
    #[serde(default)]
    ssf: SsfSettings,
    #[serde(default)]
    app: AppSettings,
    #[serde(default)]
    nodes: Vec<NodeConfig>,
    #[serde(default)]
    links: Vec<LinkConfigYaml>,
    #[serde(default)]
    parent_changes: Vec<ParentChangeConfig>,
}

// ============================================================================
// Public Model API
// ============================================================================

/// A loaded and validated simulation model.
#[derive(Debug, Clone)]
pub struct Model {
    /// Run length and repetition.
    pub simulation: SimulationSettings,
    /// Link-layer parameters.
    pub tsch: TschSettings,
    /// Scheduling function selection.
    pub sf: SfSettings,
    /// MSF parameters.
    pub msf: MsfConfig,
    /// Static installer options.
    pub ssf: SsfSettings,
    /// Application traffic.
    pub app: AppSettings,
    nodes: BTreeMap<NodeId, NodeConfig>,
    links: BTreeMap<(NodeId, NodeId), f64>,
    parent_changes: Vec<ParentChangeConfig>,
}

/// Command-line overrides applied after loading.
#[derive(Debug, Clone, Copy, Default)]
pub struct Overrides {
    /// Replaces `simulation.seed`.
    pub seed: Option<u64>,
    /// Replaces `simulation.runs`.
    pub runs: Option<u32>,
    /// Replaces `simulation.num_cycles_per_run`.
    pub num_cycles_per_run: Option<u64>,
}

impl Model {
    /// Node definitions in identifier order.
    pub fn nodes(&self) -> impl Iterator<Item = &NodeConfig> + '_ {
        self.nodes.values()
    }

    /// Number of nodes.
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// The DAG root.
    pub fn root(&self) -> Option<NodeId> {
        self.nodes.values().find(|n| n.root).map(|n| n.id)
    }

    /// Delivery ratio of the link between `a` and `b`, in either direction.
    pub fn link_pdr(&self, a: NodeId, b: NodeId) -> f64 {
        self.links
            .get(&link_key(a, b))
            .copied()
            .unwrap_or(self.tsch.default_link_pdr)
    }

    /// Scripted parent switches, in time order.
    pub fn parent_changes(&self) -> &[ParentChangeConfig] {
        &self.parent_changes
    }

    /// Apply command-line overrides, re-checking the values they touch.
    pub fn apply_overrides(&mut self, overrides: Overrides) -> Result<(), ModelError> {
        if let Some(seed) = overrides.seed {
            self.simulation.seed = seed;
        }
        if let Some(runs) = overrides.runs {
            self.simulation.runs = runs;
        }
        if let Some(cycles) = overrides.num_cycles_per_run {
            self.simulation.num_cycles_per_run = cycles;
        }
        validate_simulation(&self.simulation)
    }

    /// Build the mote arena: one mote per node running the selected
    /// scheduling function, joined to its configured parent.
    pub fn build_motes(&self) -> Motes {
        let mut motes = Motes::new();
        for node in self.nodes.values() {
            let mut mote = Mote::new(node.id, node.root, self.sf.kind, &self.msf);
            if let Some(parent) = node.parent {
                mote.rpl.join(parent);
            }
            motes.insert(mote);
        }
        debug!("Built {} motes running {}", motes.len(), self.sf.kind);
        motes
    }
}

fn link_key(a: NodeId, b: NodeId) -> (NodeId, NodeId) {
    if a <= b {
        (a, b)
    } else {
        (b, a)
    }
}

// ============================================================================
// Model Loading
// ============================================================================

/// Load a simulation model from a file.
pub fn load_model(path: &Path) -> Result<Model, ModelError> {
    let yaml = std::fs::read_to_string(path)?;
    load_model_from_str(&yaml)
}

/// Parse a simulation model from a YAML string.
pub fn load_model_from_str(yaml_str: &str) -> Result<Model, ModelError> {
    let yaml: SimulationModelYaml = serde_yaml::from_str(yaml_str)?;

    validate_simulation(&yaml.simulation)?;
    validate_tsch(&yaml.tsch)?;
    validate_msf(&yaml.msf)?;
    if !(0.0..=1.0).contains(&yaml.app.traffic_load) {
        return Err(ModelError::InvalidConfig(format!(
            "app.traffic_load {} outside [0, 1]",
            yaml.app.traffic_load
        )));
    }

    let nodes = validate_nodes(yaml.nodes)?;

    let mut links = BTreeMap::new();
    for link in yaml.links {
        let valid = link.a != link.b
            && nodes.contains_key(&link.a)
            && nodes.contains_key(&link.b)
            && link.pdr > 0.0
            && link.pdr <= 1.0;
        if !valid {
            return Err(ModelError::InvalidLink { a: link.a, b: link.b });
        }
        links.insert(link_key(link.a, link.b), link.pdr);
    }

    let mut parent_changes = yaml.parent_changes;
    for change in &parent_changes {
        for id in [change.node, change.new_parent] {
            if !nodes.contains_key(&id) {
                return Err(ModelError::NodeNotFound(id));
            }
        }
        if change.node == change.new_parent || nodes[&change.node].root {
            return Err(ModelError::InvalidConfig(format!(
                "{} cannot switch to parent {}",
                change.node, change.new_parent
            )));
        }
        if !(change.at_s > 0.0) {
            return Err(ModelError::InvalidConfig(format!(
                "parent change of {} at {}s must be in the future",
                change.node, change.at_s
            )));
        }
    }
    parent_changes.sort_by(|a, b| a.at_s.total_cmp(&b.at_s));

    Ok(Model {
        simulation: yaml.simulation,
        tsch: yaml.tsch,
        sf: yaml.sf,
        msf: yaml.msf,
        ssf: yaml.ssf,
        app: yaml.app,
        nodes,
        links,
        parent_changes,
    })
}

// ============================================================================
// Validation
// ============================================================================

fn validate_simulation(sim: &SimulationSettings) -> Result<(), ModelError> {
    if sim.runs == 0 || sim.num_cycles_per_run == 0 {
        return Err(ModelError::InvalidConfig(
            "simulation needs at least one run of at least one slotframe".to_string(),
        ));
    }
    Ok(())
}

fn validate_tsch(tsch: &TschSettings) -> Result<(), ModelError> {
    if tsch.slotframe_length < 2 {
        return Err(ModelError::InvalidConfig(format!(
            "tsch.slotframe_length {} leaves no slot besides the shared cell",
            tsch.slotframe_length
        )));
    }
    if !(tsch.slot_duration_s > 0.0) {
        return Err(ModelError::InvalidConfig(format!(
            "tsch.slot_duration_s {} must be positive",
            tsch.slot_duration_s
        )));
    }
    if tsch.num_channels == 0 {
        return Err(ModelError::InvalidConfig("tsch.num_channels must be positive".to_string()));
    }
    if !(tsch.default_link_pdr > 0.0 && tsch.default_link_pdr <= 1.0) {
        return Err(ModelError::InvalidConfig(format!(
            "tsch.default_link_pdr {} outside (0, 1]",
            tsch.default_link_pdr
        )));
    }
    Ok(())
}

fn validate_msf(msf: &MsfConfig) -> Result<(), ModelError> {
    if msf.max_num_cells == 0 {
        return Err(ModelError::InvalidConfig("msf.max_num_cells must be positive".to_string()));
    }
    if msf.num_cells_to_add_remove == 0 {
        return Err(ModelError::InvalidConfig(
            "msf.num_cells_to_add_remove must be positive".to_string(),
        ));
    }
    if msf.lim_num_cells_used_low > msf.lim_num_cells_used_high {
        return Err(ModelError::InvalidConfig(format!(
            "msf.lim_num_cells_used_low {} above lim_num_cells_used_high {}",
            msf.lim_num_cells_used_low, msf.lim_num_cells_used_high
        )));
    }
    if !(msf.housekeeping_period_s > 0.0) {
        return Err(ModelError::InvalidConfig(format!(
            "msf.housekeeping_period_s {} must be positive",
            msf.housekeeping_period_s
        )));
    }
    if msf.default_timeout_exp > msf.max_timeout_exp {
        return Err(ModelError::InvalidConfig(format!(
            "msf.default_timeout_exp {} above max_timeout_exp {}",
            msf.default_timeout_exp, msf.max_timeout_exp
        )));
    }
    Ok(())
}

fn validate_nodes(configs: Vec<NodeConfig>) -> Result<BTreeMap<NodeId, NodeConfig>, ModelError> {
    let mut nodes = BTreeMap::new();
    for node in configs {
        if nodes.contains_key(&node.id) {
            return Err(ModelError::DuplicateNode(node.id));
        }
        nodes.insert(node.id, node);
    }

    let roots: Vec<NodeId> = nodes.values().filter(|n| n.root).map(|n| n.id).collect();
    if roots.len() != 1 {
        return Err(ModelError::InvalidConfig(format!(
            "expected exactly one root node, found {}",
            roots.len()
        )));
    }

    for node in nodes.values() {
        match (node.root, node.parent) {
            (true, Some(parent)) => {
                return Err(ModelError::InvalidConfig(format!(
                    "root {} cannot have parent {}",
                    node.id, parent
                )));
            }
            (false, None) => {
                return Err(ModelError::InvalidConfig(format!("{} has no parent", node.id)));
            }
            (false, Some(parent)) if !nodes.contains_key(&parent) => {
                return Err(ModelError::NodeNotFound(parent));
            }
            _ => {}
        }
    }

    // Every walk upwards must reach the root within `nodes.len()` hops.
    for start in nodes.keys().copied() {
        let mut seen = BTreeSet::new();
        let mut current = start;
        while let Some(parent) = nodes.get(&current).and_then(|n| n.parent) {
            if !seen.insert(current) {
                return Err(ModelError::RoutingLoop(start));
            }
            current = parent;
        }
    }

    Ok(nodes)
}
