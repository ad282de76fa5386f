use crate::virtual_machine::isa::Instruction;
use std::collections::BTreeMap;
use std::fmt::Write;

/// Taken / not-taken counts for one conditional branch.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct BranchStats {
    pub taken: u64,
    pub not_taken: u64,
}

impl BranchStats {
    /// Majority vote over past outcomes; ties predict taken.
    pub fn predict_taken(&self) -> bool {
        self.taken >= self.not_taken
    }

    pub fn total(&self) -> u64 {
        self.taken + self.not_taken
    }
}

/// Execution profile of one run.
///
/// Per-opcode counts live in a flat array indexed by opcode byte so the
/// hot path never hashes.
#[derive(Clone, Debug)]
pub struct ExecutionStats {
    pub instructions: u64,
    pub calls: u64,
    pub max_stack_depth: usize,
    pub max_frame_depth: usize,
    per_opcode: [u64; 256],
    branches: BTreeMap<usize, BranchStats>,
}

impl Default for ExecutionStats {
    fn default() -> Self {
        Self {
            instructions: 0,
            calls: 0,
            max_stack_depth: 0,
            max_frame_depth: 0,
            per_opcode: [0; 256],
            branches: BTreeMap::new(),
        }
    }
}

impl ExecutionStats {
    pub fn record_instruction(&mut self, instruction: Instruction) {
        self.instructions += 1;
        self.per_opcode[instruction.opcode() as usize] += 1;
    }

    pub fn record_stack_depth(&mut self, depth: usize) {
        self.max_stack_depth = self.max_stack_depth.max(depth);
    }

    pub fn record_call(&mut self, frame_depth: usize) {
        self.calls += 1;
        self.max_frame_depth = self.max_frame_depth.max(frame_depth);
    }

    pub fn record_branch(&mut self, pc: usize, taken: bool) {
        let entry = self.branches.entry(pc).or_default();
        if taken {
            entry.taken += 1;
        } else {
            entry.not_taken += 1;
        }
    }

    pub fn count(&self, instruction: Instruction) -> u64 {
        self.per_opcode[instruction.opcode() as usize]
    }

    pub fn branch(&self, pc: usize) -> Option<BranchStats> {
        self.branches.get(&pc).copied()
    }

    /// Predicted direction of the branch at `pc`, if it has run.
    pub fn predict(&self, pc: usize) -> Option<bool> {
        self.branch(pc).map(|b| b.predict_taken())
    }

    /// Executed instructions, most frequent first.
    pub fn hottest(&self) -> Vec<(Instruction, u64)> {
        let mut out: Vec<(Instruction, u64)> = Instruction::ALL
            .iter()
            .map(|i| (*i, self.count(*i)))
            .filter(|(_, n)| *n > 0)
            .collect();
        out.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
        out
    }

    pub fn report(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "instructions executed: {}", self.instructions);
        let _ = writeln!(out, "calls:                 {}", self.calls);
        let _ = writeln!(out, "max stack depth:       {}", self.max_stack_depth);
        let _ = writeln!(out, "max frame depth:       {}", self.max_frame_depth);
        for (instr, n) in self.hottest() {
            let _ = writeln!(out, "  {:<8} {:>10}", instr.mnemonic(), n);
        }
        for (pc, b) in &self.branches {
            let _ = writeln!(
                out,
                "  branch @{:<5} taken {:>6} not taken {:>6} predict {}",
                pc,
                b.taken,
                b.not_taken,
                if b.predict_taken() { "taken" } else { "not taken" }
            );
        }
        out
    }
}
