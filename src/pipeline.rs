//! Per-slot latency tracking across pipelined re-submission rounds.
//!
//! A slot is one logical request, addressed by
//! `batch_index * batch_size + sub_index`. The slot index doubles as the
//! correlation tag of the ring entry carrying its current round, so a
//! completion finds its slot without any lookup structure.
//!
//! A slot is re-submitted under its own tag until it has completed `level`
//! rounds. The slot in the same position of the next batch then takes over;
//! in the last batch the position retires.

use std::time::{Duration, Instant};

use crate::error::BenchError;

#[derive(Debug, Clone, Copy)]
pub struct PipelineShape {
    pub batch_size: u32,
    pub level: u32,
    pub iteration: u64,
}

impl PipelineShape {
    pub fn slot_count(&self) -> Result<usize, BenchError> {
        self.iteration
            .checked_mul(u64::from(self.batch_size))
            .and_then(|n| usize::try_from(n).ok())
            .ok_or_else(|| {
                BenchError::InvalidConfig(format!(
                    "{} iterations of {} slots overflow",
                    self.iteration, self.batch_size
                ))
            })
    }

    /// Completions the run must see before it stops.
    pub fn total_ops(&self) -> Result<u64, BenchError> {
        self.iteration
            .checked_mul(u64::from(self.batch_size))
            .and_then(|n| n.checked_mul(u64::from(self.level)))
            .ok_or_else(|| BenchError::InvalidConfig(format!("{self:?} overflows the op count")))
    }
}

#[derive(Debug, Default, Clone)]
struct Slot {
    start: Option<Instant>,
    total: Duration,
    cur_level: u32,
    in_flight: bool,
}

/// What to do after a completion has been accounted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Routing {
    /// The position is retired; nothing is re-submitted.
    Finished,
    /// Submit a new round tagged `tag` into the buffer of `position`.
    Resubmit { tag: u64, position: usize, round: u32 },
}

pub struct Pipeline {
    shape: PipelineShape,
    slots: Vec<Slot>,
    total_ops: u64,
    finished_ops: u64,
}

impl Pipeline {
    pub fn new(shape: PipelineShape) -> Result<Self, BenchError> {
        if shape.batch_size == 0 || shape.level == 0 || shape.iteration == 0 {
            return Err(BenchError::InvalidConfig(format!("{shape:?} has a zero dimension")));
        }
        let total_ops = shape.total_ops()?;
        let count = shape.slot_count()?;
        let mut slots = Vec::new();
        slots
            .try_reserve_exact(count)
            .map_err(|e| BenchError::InvalidConfig(format!("{count} slots: {e}")))?;
        slots.resize(count, Slot::default());
        Ok(Pipeline {
            slots,
            shape,
            total_ops,
            finished_ops: 0,
        })
    }

    pub fn shape(&self) -> PipelineShape {
        self.shape
    }

    pub fn finished_ops(&self) -> u64 {
        self.finished_ops
    }

    pub fn is_done(&self) -> bool {
        self.finished_ops >= self.total_ops
    }

    fn slot_mut(&mut self, tag: u64) -> Result<&mut Slot, BenchError> {
        let slots = self.slots.len();
        usize::try_from(tag)
            .ok()
            .and_then(|i| self.slots.get_mut(i))
            .ok_or(BenchError::UnknownTag { tag, slots })
    }

    /// Stamps the start of the next round of slot `tag`.
    pub fn start(&mut self, tag: u64, now: Instant) -> Result<(), BenchError> {
        let level = self.shape.level;
        let slot = self.slot_mut(tag)?;
        if slot.in_flight {
            return Err(BenchError::SlotInFlight { tag });
        }
        debug_assert!(slot.cur_level < level);
        slot.start = Some(now);
        slot.in_flight = true;
        Ok(())
    }

    /// Accounts the completion of the in-flight round of slot `tag` and
    /// decides which slot runs next in its position.
    pub fn complete(&mut self, tag: u64, now: Instant) -> Result<Routing, BenchError> {
        let PipelineShape {
            batch_size,
            level,
            iteration,
        } = self.shape;
        let slot = self.slot_mut(tag)?;
        let start = match slot.start {
            Some(start) if slot.in_flight => start,
            _ => return Err(BenchError::SlotNotInFlight { tag }),
        };
        slot.total += now.saturating_duration_since(start);
        slot.cur_level += 1;
        slot.in_flight = false;
        let cur_level = slot.cur_level;
        self.finished_ops += 1;

        let batch_index = tag / u64::from(batch_size);
        let sub_index = tag % u64::from(batch_size);
        if cur_level == level && batch_index == iteration - 1 {
            return Ok(Routing::Finished);
        }
        let (next_batch_index, round) = if cur_level == level {
            (batch_index + 1, 0)
        } else {
            (batch_index, cur_level)
        };
        Ok(Routing::Resubmit {
            tag: next_batch_index * u64::from(batch_size) + sub_index,
            position: sub_index as usize,
            round,
        })
    }

    #[cfg(test)]
    pub fn cur_level(&self, tag: u64) -> Option<u32> {
        self.slots.get(tag as usize).map(|s| s.cur_level)
    }

    /// Accumulated latency of every slot, in slot order.
    pub fn totals(&self) -> impl Iterator<Item = Duration> + '_ {
        self.slots.iter().map(|s| s.total)
    }
}
