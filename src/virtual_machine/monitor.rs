//! Fault statistics and pattern detection.
//!
//! The monitor is advisory: it records every fault the engine raises and
//! whether it was recovered, but never influences control flow.

use crate::virtual_machine::errors::{Fault, FaultKind};
use crate::warn;
use std::collections::VecDeque;
use std::fmt::Write;
use std::time::{Duration, Instant};

pub const RECENT_WINDOW: usize = 1000;
pub const PATTERN_THRESHOLD: usize = 3;
pub const PATTERN_WINDOW: Duration = Duration::from_secs(60);
/// Two faults are similar if their pcs differ by at most this many words.
pub const SIMILAR_PC_DISTANCE: usize = 10;
/// Records older than this many pattern windows are dropped by cleanup.
const RETENTION_WINDOWS: u32 = 10;

#[derive(Clone, Debug)]
pub struct FaultRecord {
    pub fault: Fault,
    pub handled: bool,
    pub at: Instant,
}

impl FaultRecord {
    fn similar_to(&self, fault: &Fault) -> bool {
        self.fault.kind == fault.kind
            && self.fault.pc.abs_diff(fault.pc) <= SIMILAR_PC_DISTANCE
            && self.fault.instruction == fault.instruction
    }
}

/// Raised when one kind of fault keeps recurring at the same place.
#[derive(Clone, Debug, PartialEq)]
pub struct PatternAlert {
    pub kind: FaultKind,
    pub occurrences: usize,
    pub pc: usize,
    pub instruction: &'static str,
}

#[derive(Debug)]
pub struct FaultMonitor {
    total: u64,
    handled: u64,
    per_kind: [u64; FaultKind::COUNT],
    per_kind_handled: [u64; FaultKind::COUNT],
    recent: VecDeque<FaultRecord>,
    alerts: Vec<PatternAlert>,
}

impl Default for FaultMonitor {
    fn default() -> Self {
        Self {
            total: 0,
            handled: 0,
            per_kind: [0; FaultKind::COUNT],
            per_kind_handled: [0; FaultKind::COUNT],
            recent: VecDeque::with_capacity(64),
            alerts: Vec::new(),
        }
    }
}

impl FaultMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, fault: &Fault, handled: bool) -> Option<PatternAlert> {
        self.record_at(fault, handled, Instant::now())
    }

    pub(crate) fn record_at(
        &mut self,
        fault: &Fault,
        handled: bool,
        now: Instant,
    ) -> Option<PatternAlert> {
        self.total += 1;
        self.per_kind[fault.kind.index()] += 1;
        if handled {
            self.handled += 1;
            self.per_kind_handled[fault.kind.index()] += 1;
        }

        if self.recent.len() == RECENT_WINDOW {
            self.recent.pop_front();
        }
        self.recent.push_back(FaultRecord {
            fault: fault.clone(),
            handled,
            at: now,
        });

        let similar = self
            .recent
            .iter()
            .rev()
            .take_while(|r| now.duration_since(r.at) <= PATTERN_WINDOW)
            .filter(|r| r.similar_to(fault))
            .count();
        if similar != PATTERN_THRESHOLD {
            return None;
        }

        let alert = PatternAlert {
            kind: fault.kind,
            occurrences: similar,
            pc: fault.pc,
            instruction: fault.instruction,
        };
        warn!(
            "fault pattern: {} x{} near pc {} ({})",
            alert.kind, alert.occurrences, alert.pc, alert.instruction
        );
        self.alerts.push(alert.clone());
        Some(alert)
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    pub fn handled(&self) -> u64 {
        self.handled
    }

    pub fn count(&self, kind: FaultKind) -> u64 {
        self.per_kind[kind.index()]
    }

    pub fn handled_count(&self, kind: FaultKind) -> u64 {
        self.per_kind_handled[kind.index()]
    }

    /// Fraction of faults that were recovered; 0 if none were recorded.
    pub fn handled_rate(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        self.handled as f64 / self.total as f64
    }

    /// Up to `n` most recent records, oldest first.
    pub fn recent(&self, n: usize) -> Vec<&FaultRecord> {
        let skip = self.recent.len().saturating_sub(n);
        self.recent.iter().skip(skip).collect()
    }

    pub fn alerts(&self) -> &[PatternAlert] {
        &self.alerts
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn cleanup(&mut self) {
        self.cleanup_at(Instant::now());
    }

    pub(crate) fn cleanup_at(&mut self, now: Instant) {
        let retention = PATTERN_WINDOW * RETENTION_WINDOWS;
        self.recent
            .retain(|r| now.duration_since(r.at) <= retention);
    }

    pub fn summary(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "faults: {} total, {} handled ({:.1}%)",
            self.total,
            self.handled,
            self.handled_rate() * 100.0
        );
        for kind in FaultKind::ALL {
            let n = self.count(kind);
            if n > 0 {
                let _ = writeln!(
                    out,
                    "  {:<28} {:>6} ({} handled)",
                    kind.as_str(),
                    n,
                    self.handled_count(kind)
                );
            }
        }
        for alert in &self.alerts {
            let _ = writeln!(
                out,
                "  pattern: {} x{} near pc {} ({})",
                alert.kind, alert.occurrences, alert.pc, alert.instruction
            );
        }
        out
    }
}
