use crate::arbiter::BusState;
use crate::types::{BitPolarity, FrameField};
use serde::Serialize;
use std::collections::VecDeque;

/// One resolved tick
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TraceEntry {
    pub tick: u64,
    pub state: BusState,
    /// Resolved bus level, `None` while no node drove the bus
    pub bit: Option<BitPolarity>,
    pub field: Option<FrameField>,
}

/// Bounded ring of recent bus ticks
#[derive(Debug, Clone)]
pub struct BusTrace {
    capacity: usize,
    entries: VecDeque<TraceEntry>,
}

impl BusTrace {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: VecDeque::with_capacity(capacity),
        }
    }

    pub fn record(&mut self, entry: TraceEntry) {
        if self.capacity == 0 {
            return;
        }
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(entry);
    }

    pub fn entries(&self) -> impl Iterator<Item = &TraceEntry> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Bus levels as 0/1, idle ticks as '-'
    pub fn render_bits(&self) -> String {
        self.entries
            .iter()
            .map(|e| match e.bit {
                Some(BitPolarity::Dominant) => '0',
                Some(BitPolarity::Recessive) => '1',
                None => '-',
            })
            .collect()
    }
}
