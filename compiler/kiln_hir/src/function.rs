//! HIR functions: an arena of blocks plus the register file.
//!
//! Blocks are addressed by [`BlockId`] and never move; removing a block
//! leaves a hole so ids held by other blocks stay valid. Each block owns
//! its instructions and exactly one terminator, kept in a separate field
//! so that "the last instruction" is never ambiguous.

use std::sync::Arc;

use kiln_rt::{CodeUnit, ConstValue, Name, ObjRef};
use rustc_hash::FxHashMap;
use smallvec::SmallVec;

use crate::instr::{BlockId, Instr, InstrKind, Reg};
use crate::types::Type;

#[derive(Clone, Debug)]
pub struct Block {
    pub id: BlockId,
    /// Phis first, then the body.
    pub instrs: Vec<Instr>,
    pub term: Instr,
}

impl Block {
    fn new(id: BlockId) -> Self {
        Block {
            id,
            instrs: Vec::new(),
            term: Instr::new(InstrKind::Unreachable),
        }
    }

    pub fn successors(&self) -> SmallVec<[BlockId; 2]> {
        self.term.kind.successors()
    }

    /// Number of leading phis.
    pub fn num_phis(&self) -> usize {
        self.instrs.iter().take_while(|i| i.is_phi()).count()
    }

    pub fn phis(&self) -> impl Iterator<Item = &Instr> {
        self.instrs.iter().take_while(|i| i.is_phi())
    }

    /// Body instructions followed by the terminator.
    pub fn all_instrs(&self) -> impl Iterator<Item = &Instr> {
        self.instrs.iter().chain(std::iter::once(&self.term))
    }

    pub fn all_instrs_mut(&mut self) -> impl Iterator<Item = &mut Instr> {
        self.instrs.iter_mut().chain(std::iter::once(&mut self.term))
    }
}

/// Why a call site was not inlined.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug, PartialOrd, Ord)]
pub enum InlineFailure {
    /// No preloader entry for the callee.
    NotPreloaded,
    /// Callee resolved to something other than a single function.
    NotAFunction,
    CostLimitExceeded,
    HasCellsOrFreevars,
    IsGenerator,
    ArgumentCountMismatch,
    /// The callee failed to build or is recursive.
    Unsupported,
}

impl InlineFailure {
    pub fn describe(self) -> &'static str {
        match self {
            InlineFailure::NotPreloaded => "callee was not preloaded",
            InlineFailure::NotAFunction => "callee is not a plain function",
            InlineFailure::CostLimitExceeded => "inline cost limit exceeded",
            InlineFailure::HasCellsOrFreevars => "callee uses closures",
            InlineFailure::IsGenerator => "callee is a generator",
            InlineFailure::ArgumentCountMismatch => "argument count mismatch",
            InlineFailure::Unsupported => "callee is unsupported",
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct InlineStats {
    pub num_inlined: usize,
    /// Sum of inlined callee costs.
    pub cost: usize,
    pub failures: FxHashMap<InlineFailure, usize>,
}

impl InlineStats {
    pub fn record_failure(&mut self, reason: InlineFailure) {
        *self.failures.entry(reason).or_default() += 1;
    }
}

#[derive(Clone, Debug)]
pub struct Function {
    pub name: Name,
    pub code: Arc<CodeUnit>,
    /// The function object being compiled.
    pub func: ObjRef,
    pub entry: BlockId,
    blocks: Vec<Option<Block>>,
    regs: Vec<Type>,
    /// Object constants, referenced by `HirConst::Object`.
    pub consts: Vec<ConstValue>,
    /// Entry types of the arguments, primitive for static arguments.
    pub arg_types: Vec<Type>,
    pub return_type: Type,
    /// Type-attribute caches allocated by the simplifier.
    pub num_attr_caches: u32,
    pub inline_stats: InlineStats,
}

impl Function {
    pub fn new(code: Arc<CodeUnit>, func: ObjRef) -> Self {
        let mut f = Function {
            name: code.name,
            code,
            func,
            entry: BlockId::new(0),
            blocks: Vec::new(),
            regs: Vec::new(),
            consts: Vec::new(),
            arg_types: Vec::new(),
            return_type: Type::OBJECT,
            num_attr_caches: 0,
            inline_stats: InlineStats::default(),
        };
        f.entry = f.new_block();
        f
    }

    // ── Blocks ─────────────────────────────────────────────────────

    pub fn new_block(&mut self) -> BlockId {
        let id = BlockId::new(self.blocks.len() as u32);
        self.blocks.push(Some(Block::new(id)));
        id
    }

    #[inline]
    pub fn has_block(&self, id: BlockId) -> bool {
        matches!(self.blocks.get(id.index()), Some(Some(_)))
    }

    /// # Panics
    ///
    /// Panics if `id` was removed; holding a stale id is a pass bug.
    #[inline]
    pub fn block(&self, id: BlockId) -> &Block {
        match self.blocks.get(id.index()) {
            Some(Some(b)) => b,
            _ => panic!("reference to removed block {id}"),
        }
    }

    #[inline]
    pub fn block_mut(&mut self, id: BlockId) -> &mut Block {
        match self.blocks.get_mut(id.index()) {
            Some(Some(b)) => b,
            _ => panic!("reference to removed block {id}"),
        }
    }

    pub fn remove_block(&mut self, id: BlockId) -> Option<Block> {
        debug_assert_ne!(id, self.entry, "entry block cannot be removed");
        self.blocks.get_mut(id.index()).and_then(Option::take)
    }

    /// Live block ids in creation order.
    pub fn block_ids(&self) -> Vec<BlockId> {
        self.blocks.iter().flatten().map(|b| b.id).collect()
    }

    pub fn blocks(&self) -> impl Iterator<Item = &Block> {
        self.blocks.iter().flatten()
    }

    pub fn blocks_mut(&mut self) -> impl Iterator<Item = &mut Block> {
        self.blocks.iter_mut().flatten()
    }

    pub fn num_blocks(&self) -> usize {
        self.blocks.iter().flatten().count()
    }

    /// Upper bound on block indices, for index-keyed side tables.
    pub fn block_capacity(&self) -> usize {
        self.blocks.len()
    }

    pub fn set_term(&mut self, id: BlockId, term: Instr) {
        debug_assert!(term.opcode().is_terminator());
        self.block_mut(id).term = term;
    }

    pub fn push(&mut self, id: BlockId, instr: Instr) {
        debug_assert!(!instr.opcode().is_terminator());
        self.block_mut(id).instrs.push(instr);
    }

    /// Move the instructions of `id` from `at` onward, and its terminator,
    /// into a new block. `id` is left ending in an `Unreachable` for the
    /// caller to replace. Phis of the old successors are rewired to the
    /// new block.
    pub fn split_block(&mut self, id: BlockId, at: usize) -> BlockId {
        let new_id = self.new_block();
        let old = self.block_mut(id);
        let tail = old.instrs.split_off(at);
        let term = std::mem::replace(&mut old.term, Instr::new(InstrKind::Unreachable));
        for succ in term.kind.successors() {
            self.retarget_phis(succ, id, new_id);
        }
        let new = self.block_mut(new_id);
        new.instrs = tail;
        new.term = term;
        new_id
    }

    /// Rename predecessor `from` to `to` in the phis of `block`.
    pub fn retarget_phis(&mut self, block: BlockId, from: BlockId, to: BlockId) {
        for phi in &mut self.block_mut(block).instrs {
            match &mut phi.kind {
                InstrKind::Phi { inputs, .. } => {
                    for (pred, _) in inputs.iter_mut() {
                        if *pred == from {
                            *pred = to;
                        }
                    }
                }
                _ => break,
            }
        }
    }

    /// Drop the inputs arriving from `pred` in the phis of `block`.
    pub fn remove_phi_inputs(&mut self, block: BlockId, pred: BlockId) {
        for phi in &mut self.block_mut(block).instrs {
            match &mut phi.kind {
                InstrKind::Phi { inputs, .. } => inputs.retain(|&(p, _)| p != pred),
                _ => break,
            }
        }
    }

    // ── Registers ──────────────────────────────────────────────────

    pub fn new_reg(&mut self, ty: Type) -> Reg {
        let r = Reg::new(self.regs.len() as u32);
        self.regs.push(ty);
        r
    }

    #[inline]
    pub fn reg_type(&self, r: Reg) -> Type {
        self.regs[r.index()]
    }

    #[inline]
    pub fn set_reg_type(&mut self, r: Reg, ty: Type) {
        self.regs[r.index()] = ty;
    }

    pub fn num_regs(&self) -> usize {
        self.regs.len()
    }

    /// A snapshot of every register's type, for monotonicity checks.
    pub fn reg_types(&self) -> Vec<Type> {
        self.regs.clone()
    }

    // ── Constants ──────────────────────────────────────────────────

    pub fn add_const(&mut self, value: ConstValue) -> u32 {
        if let Some(i) = self.consts.iter().position(|c| *c == value) {
            return i as u32;
        }
        self.consts.push(value);
        (self.consts.len() - 1) as u32
    }

    // ── Queries ────────────────────────────────────────────────────

    /// Map each register to the block and position defining it. The
    /// position is `None` for outputs of terminators (none exist today).
    pub fn def_sites(&self) -> FxHashMap<Reg, (BlockId, usize)> {
        let mut defs = FxHashMap::default();
        for block in self.blocks() {
            for (i, instr) in block.instrs.iter().enumerate() {
                if let Some(out) = instr.output() {
                    defs.insert(out, (block.id, i));
                }
            }
        }
        defs
    }

    /// The instruction defining `r`, if any.
    pub fn def_of(&self, r: Reg) -> Option<&Instr> {
        self.blocks()
            .flat_map(|b| b.instrs.iter())
            .find(|i| i.output() == Some(r))
    }

    /// Uses of every register across operands and deopt metadata.
    pub fn use_counts(&self) -> Vec<u32> {
        let mut counts = vec![0u32; self.regs.len()];
        for block in self.blocks() {
            for instr in block.all_instrs() {
                instr.visit_uses(|r| counts[r.index()] += 1);
            }
        }
        counts
    }

    /// Replace every use of each key with its value, following chains.
    pub fn replace_uses(&mut self, subst: &FxHashMap<Reg, Reg>) {
        if subst.is_empty() {
            return;
        }
        let resolve = |mut r: Reg| {
            let mut steps = 0;
            while let Some(&next) = subst.get(&r) {
                if next == r || steps > subst.len() {
                    break;
                }
                r = next;
                steps += 1;
            }
            r
        };
        for block in self.blocks_mut() {
            for instr in block.all_instrs_mut() {
                instr.map_uses(|r| *r = resolve(*r));
            }
        }
    }

    /// Number of instructions, terminators included.
    pub fn instr_count(&self) -> usize {
        self.blocks().map(|b| b.instrs.len() + 1).sum()
    }
}

#[cfg(test)]
mod tests;
