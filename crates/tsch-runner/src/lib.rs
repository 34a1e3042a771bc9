//! # tsch-runner library
//!
//! Library interface for the TSCH scheduling-function simulator.
//!
//! A run builds the mote arena from a [`Model`], installs the static schedule
//! when a static scheduling function is selected, then drives a discrete
//! event loop in absolute slot numbers:
//!
//! - scheduling-function callbacks queued through [`SimContext`]
//! - one MAC pass per slotframe reporting cell usage ([`mac`])
//! - scripted parent switches from the model
//!
//! Negotiation requests issued by MSF are carried out right after the event
//! that issued them ([`sixtop`]).

pub mod mac;
pub mod queue;
pub mod sixtop;

pub use mac::{Mac, MacStats};
pub use queue::{Event, EventKind, EventQueue};
pub use sixtop::{Sixtop, SixtopStats};

use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::Serialize;
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, info};
use tsch_common::{Asn, NodeId, SimContext};
use tsch_model::Model;
use tsch_sf::{ssf, Motes, SfError};

// ============================================================================
// Error Types
// ============================================================================

/// Errors that can occur during simulation.
#[derive(Debug, Error)]
pub enum RunnerError {
    /// Model error.
    #[error("Model error: {0}")]
    Model(#[from] tsch_model::ModelError),

    /// Scheduling function error.
    #[error("Scheduling function error: {0}")]
    Sf(#[from] SfError),

    /// Simulation error.
    #[error("Simulation error: {0}")]
    Simulation(#[from] tsch_common::SimError),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

// ============================================================================
// Event Priorities
// ============================================================================

/// Scripted parent switches run before anything else in their slot.
const PARENT_SWITCH_PRIORITY: u8 = 0;

/// MAC passes run before scheduling-function callbacks in the same slot.
const SLOTFRAME_PRIORITY: u8 = 2;

// ============================================================================
// Run Reporting
// ============================================================================

/// End-of-run state of one mote.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MoteSummary {
    /// Mote identifier.
    pub id: NodeId,
    /// Whether the mote is the DAG root.
    pub dag_root: bool,
    /// Preferred parent at the end of the run.
    pub preferred_parent: Option<NodeId>,
    /// Cells held as transmitter towards the preferred parent.
    pub cells_to_parent: u32,
    /// All installed cells.
    pub total_cells: usize,
    /// MSF window counter of elapsed cells.
    pub num_cells_elapsed: Option<u32>,
    /// MSF window counter of used cells.
    pub num_cells_used: Option<u32>,
    /// Frames sent.
    pub tx: u64,
    /// Frames acknowledged.
    pub tx_acked: u64,
}

/// Result of one run.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    /// Seed of the run.
    pub seed: u64,
    /// Scheduling function in use.
    pub sf_type: String,
    /// Cells allocated by the static installer.
    pub static_cells: usize,
    /// Events processed.
    pub events_processed: u64,
    /// Negotiation counters.
    pub sixtop: SixtopStats,
    /// Slot at which the run stopped.
    pub final_asn: Asn,
    /// Wall-clock duration in seconds.
    pub wall_time_s: f64,
    /// Per-mote state, in identifier order.
    pub motes: Vec<MoteSummary>,
}

// ============================================================================
// Event Loop
// ============================================================================

/// The main simulation event loop.
pub struct EventLoop<'m> {
    model: &'m Model,
    queue: EventQueue,
    motes: Motes,
    context: SimContext,
    sixtop: Sixtop,
    mac: Mac,
    seed: u64,
    static_cells: usize,
    events_processed: u64,
}

impl<'m> EventLoop<'m> {
    /// Build the network for one run: static schedule, scheduling-function
    /// activation, routing bootstrap, and the first MAC pass and scripted
    /// parent switches.
    pub fn new(model: &'m Model, seed: u64) -> Result<Self, RunnerError> {
        let tsch = &model.tsch;
        let mut motes = model.build_motes();
        let context = SimContext::new(seed, tsch.slotframe_length, tsch.slot_duration_s);

        // Separate stream for the static installers.
        let mut install_rng = ChaCha8Rng::seed_from_u64(seed ^ 0x5353_4600);
        let static_cells = ssf::install(
            model.sf.kind,
            &mut motes,
            tsch.slotframe_length,
            model.ssf.init_method,
            &mut install_rng,
        )?;
        for mote in motes.iter_mut() {
            let id = mote.id();
            for record in mote.cells.schedule.iter_mut() {
                record.set_link_pdr(model.link_pdr(id, record.neighbor));
            }
        }

        let mut event_loop = EventLoop {
            model,
            queue: EventQueue::new(),
            motes,
            context,
            sixtop: Sixtop::new(tsch.num_channels),
            mac: Mac::new(model.app.traffic_load),
            seed,
            static_cells,
            events_processed: 0,
        };

        for id in event_loop.motes.ids() {
            let mote = event_loop.motes.mote_mut(id)?;
            mote.activate(&mut event_loop.context)?;
            if !mote.is_dag_root() && mote.rpl.preferred_parent().is_some() {
                mote.schedule_parent_change(&mut event_loop.context)?;
            }
        }
        event_loop.drain()?;

        event_loop.queue.schedule(
            Asn::ZERO,
            Event {
                asn: Asn::ZERO,
                priority: SLOTFRAME_PRIORITY,
                tag: None,
                kind: EventKind::Slotframe,
            },
        );
        for (index, change) in model.parent_changes().iter().enumerate() {
            event_loop.queue.schedule(
                Asn::ZERO,
                Event {
                    asn: Asn::from_secs(change.at_s, tsch.slot_duration_s),
                    priority: PARENT_SWITCH_PRIORITY,
                    tag: None,
                    kind: EventKind::ParentSwitch(index),
                },
            );
        }

        Ok(event_loop)
    }

    /// Run until the configured number of slotframes has elapsed.
    pub fn run(mut self) -> Result<RunReport, RunnerError> {
        let start_time = Instant::now();
        let slotframe = u64::from(self.model.tsch.slotframe_length);
        let end = Asn::from_slots(self.model.simulation.num_cycles_per_run * slotframe);

        while let Some(event) = self.queue.pop() {
            if event.asn >= end {
                break;
            }
            self.context.set_asn(event.asn);
            self.dispatch(event, end)?;
            self.drain()?;
            self.events_processed += 1;
        }
        self.context.set_asn(end);

        let report = self.report(start_time.elapsed().as_secs_f64());
        info!(
            "Run with seed {} done: {} events, {} ADD / {} DELETE requests",
            report.seed,
            report.events_processed,
            report.sixtop.add_requests,
            report.sixtop.delete_requests
        );
        Ok(report)
    }

    fn dispatch(&mut self, event: Event, end: Asn) -> Result<(), RunnerError> {
        match event.kind {
            EventKind::Sf { node, action } => {
                self.motes
                    .mote_mut(node)?
                    .handle_action(action, &mut self.context)?;
            }
            EventKind::Slotframe => {
                self.mac
                    .run_slotframe(&mut self.motes, &mut self.context, self.model)?;
                let next = event.asn + u64::from(self.model.tsch.slotframe_length);
                if next < end {
                    self.queue.schedule(
                        event.asn,
                        Event {
                            asn: next,
                            ..event
                        },
                    );
                }
            }
            EventKind::ParentSwitch(index) => {
                if let Some(change) = self.model.parent_changes().get(index) {
                    let mote = self.motes.mote_mut(change.node)?;
                    if mote.rpl.switch_parent(change.new_parent) {
                        info!(
                            "{} switches preferred parent to {} (old {:?})",
                            change.node,
                            change.new_parent,
                            mote.rpl.old_preferred_parent()
                        );
                        mote.schedule_parent_change(&mut self.context)?;
                    }
                }
            }
        }
        Ok(())
    }

    /// Move callbacks into the queue and carry out negotiation requests
    /// until the outbox stays empty.
    fn drain(&mut self) -> Result<(), RunnerError> {
        loop {
            let callbacks = self.context.take_pending_callbacks();
            let requests = self.context.take_pending_requests();
            if callbacks.is_empty() && requests.is_empty() {
                return Ok(());
            }
            let now = self.context.asn();
            for callback in callbacks {
                debug!("Queue {} at ASN {}", callback.tag, callback.asn);
                self.queue.schedule(now, Event::from(callback));
            }
            for request in &requests {
                self.sixtop
                    .handle(request, &mut self.motes, &mut self.context, self.model)?;
            }
        }
    }

    /// Current state of the network.
    pub fn motes(&self) -> &Motes {
        &self.motes
    }

    /// Current slot.
    pub fn current_asn(&self) -> Asn {
        self.context.asn()
    }

    fn report(&self, wall_time_s: f64) -> RunReport {
        let motes = self
            .motes
            .iter()
            .map(|mote| {
                let parent = mote.rpl.preferred_parent();
                let msf = mote.sf().as_msf();
                let mac = self.mac.stats(mote.id());
                MoteSummary {
                    id: mote.id(),
                    dag_root: mote.is_dag_root(),
                    preferred_parent: parent,
                    cells_to_parent: parent.map_or(0, |p| mote.cells.num_cells_to(p)),
                    total_cells: mote.cells.schedule.len(),
                    num_cells_elapsed: msf.map(|m| m.num_cells_elapsed()),
                    num_cells_used: msf.map(|m| m.num_cells_used()),
                    tx: mac.tx,
                    tx_acked: mac.tx_acked,
                }
            })
            .collect();

        RunReport {
            seed: self.seed,
            sf_type: self.model.sf.kind.to_string(),
            static_cells: self.static_cells,
            events_processed: self.events_processed,
            sixtop: self.sixtop.stats().clone(),
            final_asn: self.context.asn(),
            wall_time_s,
            motes,
        }
    }
}

/// Run the model `simulation.runs` times with seeds `seed, seed + 1, ...`.
pub fn run_model(model: &Model) -> Result<Vec<RunReport>, RunnerError> {
    (0..model.simulation.runs)
        .map(|run| {
            let seed = model.simulation.seed.wrapping_add(u64::from(run));
            debug!("Starting run {} with seed {}", run, seed);
            EventLoop::new(model, seed)?.run()
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tsch_common::SfAction;
    use tsch_model::load_model_from_str;
    use tsch_sf::alloc::alloc_shared_cell;

    fn chain(extra: &str) -> Model {
        let yaml = format!(
            "{}\nnodes:\n  - {{ id: 0, root: true }}\n  - {{ id: 1, parent: 0 }}\n  - {{ id: 2, parent: 1 }}\n",
            extra
        );
        load_model_from_str(&yaml).unwrap()
    }

    fn summary(report: &RunReport, id: u32) -> &MoteSummary {
        report.motes.iter().find(|m| m.id == NodeId(id)).unwrap()
    }

    #[test]
    fn test_bootstrap_gives_every_mote_a_cell() {
        let model = chain("app: { traffic_load: 0.5 }");
        let report = EventLoop::new(&model, 1).unwrap().run().unwrap();

        assert_eq!(report.final_asn, Asn::from_slots(101 * 101));
        assert!(summary(&report, 1).cells_to_parent >= 1);
        assert!(summary(&report, 2).cells_to_parent >= 1);
        assert_eq!(summary(&report, 0).cells_to_parent, 0);
        assert!(report.sixtop.add_requests >= 2);
        assert_eq!(report.static_cells, 0);
    }

    #[test]
    fn test_full_load_grows_bandwidth() {
        let model = chain("app: { traffic_load: 1.0 }\nsimulation: { num_cycles_per_run: 300 }");
        let report = EventLoop::new(&model, 2).unwrap().run().unwrap();

        assert!(summary(&report, 2).cells_to_parent > 1);
        assert_eq!(report.sixtop.delete_requests, 0);
    }

    #[test]
    fn test_no_load_keeps_last_cell() {
        let model = chain("app: { traffic_load: 0.0 }\nsimulation: { num_cycles_per_run: 300 }");
        let report = EventLoop::new(&model, 3).unwrap().run().unwrap();

        assert_eq!(summary(&report, 1).cells_to_parent, 1);
        assert_eq!(summary(&report, 2).cells_to_parent, 1);
        assert_eq!(report.sixtop.delete_requests, 0);
    }

    #[test]
    fn test_window_counters_stay_bounded() {
        let model = chain("app: { traffic_load: 0.7 }");
        let mut event_loop = EventLoop::new(&model, 4).unwrap();
        let end = Asn::from_slots(101 * 101);
        while let Some(event) = event_loop.queue.pop() {
            if event.asn >= end {
                break;
            }
            event_loop.context.set_asn(event.asn);
            event_loop.dispatch(event, end).unwrap();
            event_loop.drain().unwrap();
            for mote in event_loop.motes().iter() {
                if let Some(msf) = mote.sf().as_msf() {
                    assert!(msf.num_cells_used() <= msf.num_cells_elapsed());
                    assert!(msf.num_cells_elapsed() < msf.config().max_num_cells);
                }
            }
        }
    }

    #[test]
    fn test_static_symmetric_run() {
        let model = chain("sf: { type: SSFSymmetric }");
        let report = EventLoop::new(&model, 5).unwrap().run().unwrap();

        assert_eq!(report.static_cells, 2);
        assert_eq!(report.sixtop, SixtopStats::default());
        assert_eq!(summary(&report, 2).cells_to_parent, 1);
        assert!(summary(&report, 2).num_cells_elapsed.is_none());
        assert!(summary(&report, 2).tx > 0);
    }

    #[test]
    fn test_cascading_capacity_error_aborts() {
        let model = chain("sf: { type: SSFCascading }\ntsch: { slotframe_length: 3 }");
        assert!(matches!(
            EventLoop::new(&model, 6),
            Err(RunnerError::Sf(SfError::SlotframeTooSmall { .. }))
        ));
    }

    #[test]
    fn test_parent_switch_moves_cells() {
        let model = chain(
            "app: { traffic_load: 0.0 }\nsimulation: { num_cycles_per_run: 700 }\nparent_changes:\n  - { at_s: 100.0, node: 2, new_parent: 0 }",
        );
        let report = EventLoop::new(&model, 7).unwrap().run().unwrap();

        let moved = summary(&report, 2);
        assert_eq!(moved.preferred_parent, Some(NodeId(0)));
        assert!(moved.cells_to_parent >= 1);
        assert!(report.sixtop.delete_requests >= 1);
        // Cells with the old parent are gone at both ends.
        let old_parent = summary(&report, 1);
        assert_eq!(old_parent.total_cells, old_parent.cells_to_parent as usize);
    }

    #[test]
    fn test_decrement_with_large_step_keeps_one_cell() {
        let model = chain("msf: { num_cells_to_add_remove: 2 }");
        let mut motes = model.build_motes();
        let mut ctx = SimContext::new(8, model.tsch.slotframe_length, model.tsch.slot_duration_s);
        let mut sixtop = Sixtop::new(model.tsch.num_channels);
        alloc_shared_cell(&mut motes, NodeId(1), NodeId(0), 4, 0).unwrap();
        alloc_shared_cell(&mut motes, NodeId(1), NodeId(0), 9, 0).unwrap();

        motes
            .mote_mut(NodeId(1))
            .unwrap()
            .handle_action(SfAction::BandwidthDecrement, &mut ctx)
            .unwrap();
        for request in ctx.take_pending_requests() {
            sixtop.handle(&request, &mut motes, &mut ctx, &model).unwrap();
        }

        let mote = motes.mote(NodeId(1)).unwrap();
        assert_eq!(mote.cells.num_cells_to(NodeId(0)), 1);
        assert_eq!(sixtop.stats().cells_removed, 1);
    }

    #[test]
    fn test_sub_slot_housekeeping_period_runs() {
        let model = chain("msf: { housekeeping_period_s: 0.005 }\nsimulation: { num_cycles_per_run: 5 }");
        let report = EventLoop::new(&model, 11).unwrap().run().unwrap();
        assert_eq!(report.final_asn, Asn::from_slots(5 * 101));
        assert!(report.events_processed > 5 * 101);
    }

    #[test]
    fn test_runs_use_consecutive_seeds() {
        let model = chain("simulation: { seed: 10, runs: 3, num_cycles_per_run: 20 }");
        let reports = run_model(&model).unwrap();
        let seeds: Vec<u64> = reports.iter().map(|r| r.seed).collect();
        assert_eq!(seeds, vec![10, 11, 12]);
    }

    #[test]
    fn test_same_seed_same_result() {
        let model = chain("app: { traffic_load: 0.6 }");
        let a = EventLoop::new(&model, 9).unwrap().run().unwrap();
        let b = EventLoop::new(&model, 9).unwrap().run().unwrap();
        assert_eq!(a.motes, b.motes);
        assert_eq!(a.sixtop, b.sixtop);
        assert_eq!(a.events_processed, b.events_processed);
    }
}
