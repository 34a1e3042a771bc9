//! Emulated negotiation.
//!
//! Requests complete instantly and always reach both ends ("god mode").
//! ADD picks slots free at both endpoints; DELETE drops the cells with the
//! worst delivery ratio. The outcome feeds the requester's timeout exponent.

use rand::seq::SliceRandom;
use rand::Rng;
use serde::Serialize;
use tracing::{debug, info, warn};
use tsch_common::{NodeId, SimContext, SixpCommand, SixpRequest};
use tsch_model::Model;
use tsch_sf::alloc::{alloc_shared_cell, release_cell};
use tsch_sf::{Motes, SfError};

/// Negotiation counters of one run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SixtopStats {
    /// ADD requests handled.
    pub add_requests: u64,
    /// DELETE requests handled.
    pub delete_requests: u64,
    /// ADD requests that could not install any cell.
    pub failed_adds: u64,
    /// DELETE requests that found nothing to remove.
    pub failed_deletes: u64,
    /// Cells installed.
    pub cells_added: u64,
    /// Cells removed.
    pub cells_removed: u64,
}

/// Instant negotiation between any two motes.
#[derive(Debug)]
pub struct Sixtop {
    num_channels: u16,
    stats: SixtopStats,
}

impl Sixtop {
    /// Create an emulator drawing channels from `[0, num_channels)`.
    pub fn new(num_channels: u16) -> Self {
        Sixtop {
            num_channels: num_channels.max(1),
            stats: SixtopStats::default(),
        }
    }

    /// Counters so far.
    pub fn stats(&self) -> &SixtopStats {
        &self.stats
    }

    /// Carry out one request.
    pub fn handle(
        &mut self,
        request: &SixpRequest,
        motes: &mut Motes,
        ctx: &mut SimContext,
        model: &Model,
    ) -> Result<(), SfError> {
        let first_time = motes
            .mote(request.from)?
            .sf()
            .as_msf()
            .is_some_and(|msf| msf.timeout_exponent(request.neighbor).is_none());
        if first_time {
            update_exponent(motes, request.from, |msf| {
                msf.reset_timeout_exponent(request.neighbor, true)
            })?;
        }

        let done = match request.command {
            SixpCommand::Add => {
                self.stats.add_requests += 1;
                let added = self.add(request, motes, ctx, model)?;
                self.stats.cells_added += u64::from(added);
                if added == 0 {
                    self.stats.failed_adds += 1;
                    warn!(
                        "[sixtop] {} ADD to {} failed: no common free slot",
                        request.from, request.neighbor
                    );
                } else {
                    info!(
                        "[sixtop] {} ADD to {}: {} of {} cells installed",
                        request.from, request.neighbor, added, request.num_cells
                    );
                }
                added > 0
            }
            SixpCommand::Delete => {
                self.stats.delete_requests += 1;
                let removed = self.delete(request, motes)?;
                self.stats.cells_removed += u64::from(removed);
                if removed == 0 {
                    self.stats.failed_deletes += 1;
                    warn!(
                        "[sixtop] {} DELETE to {} failed: no {} cell",
                        request.from, request.neighbor, request.cell_options
                    );
                } else {
                    info!(
                        "[sixtop] {} DELETE to {}: {} of {} cells removed",
                        request.from, request.neighbor, removed, request.num_cells
                    );
                }
                removed > 0
            }
        };

        update_exponent(motes, request.from, |msf| {
            if done {
                msf.reset_timeout_exponent(request.neighbor, false);
            } else {
                msf.increase_timeout_exponent(request.neighbor);
            }
        })?;
        Ok(())
    }

    fn add(
        &mut self,
        request: &SixpRequest,
        motes: &mut Motes,
        ctx: &mut SimContext,
        model: &Model,
    ) -> Result<u32, SfError> {
        let requester = &motes.mote(request.from)?.cells.schedule;
        let neighbor = &motes.mote(request.neighbor)?.cells.schedule;
        let free: Vec<u16> = (1..ctx.slotframe_length())
            .filter(|slot| requester.is_slot_free(*slot) && neighbor.is_slot_free(*slot))
            .collect();

        let wanted = usize::try_from(request.num_cells).unwrap_or(usize::MAX);
        let mut chosen: Vec<u16> = free.choose_multiple(ctx.rng(), wanted).copied().collect();
        chosen.sort_unstable();

        let pdr = model.link_pdr(request.from, request.neighbor);
        for slot in &chosen {
            let channel = ctx.rng().gen_range(0..self.num_channels);
            alloc_shared_cell(motes, request.from, request.neighbor, *slot, channel)?;
            for holder in [request.from, request.neighbor] {
                if let Some(record) = motes.mote_mut(holder)?.cells.schedule.get_mut(*slot) {
                    record.set_link_pdr(pdr);
                }
            }
            debug!(
                "[sixtop] {} <-> {} shared cell at slot {} channel {} (timeout {}s)",
                request.from, request.neighbor, slot, channel, request.timeout_s
            );
        }
        Ok(chosen.len() as u32)
    }

    fn delete(&mut self, request: &SixpRequest, motes: &mut Motes) -> Result<u32, SfError> {
        let mut candidates: Vec<(f64, u16)> = motes
            .mote(request.from)?
            .cells
            .schedule
            .cells_with(request.neighbor)
            .filter(|cell| cell.direction == request.cell_options)
            .map(|cell| (cell.delivery_ratio(), cell.slot_offset))
            .collect();
        candidates.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));

        let wanted = usize::try_from(request.num_cells).unwrap_or(usize::MAX);
        let mut removed = 0;
        for (ratio, slot) in candidates.into_iter().take(wanted) {
            if release_cell(motes, request.from, request.neighbor, slot)?.is_some() {
                debug!(
                    "[sixtop] {} <-> {} released slot {} (ratio {:.2}, timeout {}s)",
                    request.from, request.neighbor, slot, ratio, request.timeout_s
                );
                removed += 1;
            }
        }
        Ok(removed)
    }
}

fn update_exponent<F>(motes: &mut Motes, id: NodeId, f: F) -> Result<(), SfError>
where
    F: FnOnce(&mut tsch_sf::Msf),
{
    if let Some(msf) = motes.mote_mut(id)?.sf_mut().as_msf_mut() {
        f(msf);
    }
    Ok(())
}
