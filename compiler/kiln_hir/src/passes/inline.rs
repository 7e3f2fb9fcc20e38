//! Inline calls to preloaded bytecode functions.
//!
//! Candidates are `VectorCall`s whose callee is a known function object and
//! `InvokeStaticFunction`s. Each callee is built from its own preloader,
//! put into SSA form and simplified on its own, then spliced in:
//!
//! ```text
//! b:    ...                                  callee blocks, with
//!       code = LoadFunctionCode f              LoadArg i  -> args[i]
//!       GuardIs code, <code at preload>        Return v   -> Branch join
//!       BeginInlinedFunction f
//!       Branch callee_entry
//! join: dst = Phi (returns)
//!       EndInlinedFunction f
//!       Branch tail
//! tail: <rest of b>
//! ```
//!
//! Callee frame states are rebased onto the caller's frame at the call, so
//! a deopt inside the callee rebuilds both frames: the callee's, and the
//! caller's resuming after the call with the call's inputs popped.
//!
//! Only call sites present before the pass runs are considered; calls
//! inside inlined bodies are left alone.

use std::sync::Arc;

use kiln_rt::{CodeFlags, ObjKind, ObjRef};
use rustc_hash::FxHashMap;

use super::{refine_types, remove_unreachable_blocks, simplify, ssaify, PassContext};
use crate::builder::build_hir;
use crate::function::{Function, InlineFailure};
use crate::instr::{BlockId, FrameState, HirConst, Instr, InstrKind, Reg};
use crate::preload::Preloader;
use crate::types::Type;

pub fn inline_function_calls(func: &mut Function, cx: &PassContext<'_>) {
    let sites = call_sites(func);
    for dst in sites {
        let Some((b, idx)) = locate(func, dst) else {
            continue;
        };
        let call = func.block(b).instrs[idx].clone();
        let site = match prepare(func, cx, &call) {
            Ok(site) => site,
            Err(reason) => {
                tracing::debug!(
                    function = %func.name,
                    reason = reason.describe(),
                    "not inlined"
                );
                func.inline_stats.record_failure(reason);
                continue;
            }
        };
        let cost = site.callee.code.ops.len();
        splice(func, b, idx, &call, site);
        func.inline_stats.num_inlined += 1;
        func.inline_stats.cost += cost;
    }
    remove_unreachable_blocks(func);
    refine_types(func);
    tracing::debug!(
        function = %func.name,
        inlined = func.inline_stats.num_inlined,
        cost = func.inline_stats.cost,
        "inlining done"
    );
}

/// Output registers of candidate calls, in block order.
fn call_sites(func: &Function) -> Vec<Reg> {
    func.blocks()
        .flat_map(|b| b.instrs.iter())
        .filter_map(|i| match &i.kind {
            InstrKind::VectorCall { dst, func: f, .. }
                if func.reg_type(*f).object_spec().is_some()
                    && func.reg_type(*f).is_subtype(Type::FUNC) =>
            {
                Some(*dst)
            }
            InstrKind::InvokeStaticFunction { dst, .. } => Some(*dst),
            _ => None,
        })
        .collect()
}

fn locate(func: &Function, dst: Reg) -> Option<(BlockId, usize)> {
    func.blocks().find_map(|b| {
        b.instrs
            .iter()
            .position(|i| {
                i.output() == Some(dst)
                    && matches!(
                        i.kind,
                        InstrKind::VectorCall { .. } | InstrKind::InvokeStaticFunction { .. }
                    )
            })
            .map(|i| (b.id, i))
    })
}

struct Site {
    target: ObjRef,
    /// The callee's code object when the caller was preloaded.
    code_obj: ObjRef,
    args: Vec<Reg>,
    /// Register holding the function object, if the call had one.
    func_reg: Option<Reg>,
    callee: Function,
}

fn prepare(func: &Function, cx: &PassContext<'_>, call: &Instr) -> Result<Site, InlineFailure> {
    let (target, args, func_reg, via_static) = match &call.kind {
        InstrKind::VectorCall { func: f, args, .. } => {
            let target = func
                .reg_type(*f)
                .object_spec()
                .ok_or(InlineFailure::NotAFunction)?;
            (target, args.clone(), Some(*f), false)
        }
        InstrKind::InvokeStaticFunction { target, args, .. } => (*target, args.clone(), None, true),
        _ => return Err(InlineFailure::NotAFunction),
    };
    let callee_pre: &Arc<Preloader> = cx.callees.get(&target).ok_or(InlineFailure::NotPreloaded)?;
    let code = &callee_pre.code;
    if target == func.func {
        return Err(InlineFailure::Unsupported);
    }
    if code.flags.contains(CodeFlags::GENERATOR) {
        return Err(InlineFailure::IsGenerator);
    }
    if !code.cellvars.is_empty() || !code.freevars.is_empty() {
        return Err(InlineFailure::HasCellsOrFreevars);
    }
    if code.flags.contains(CodeFlags::VARARGS) || (code.is_static() && !via_static) {
        return Err(InlineFailure::Unsupported);
    }
    if code.argcount != args.len() {
        return Err(InlineFailure::ArgumentCountMismatch);
    }
    if func.inline_stats.cost + code.ops.len() > cx.config.inline_cost_limit {
        return Err(InlineFailure::CostLimitExceeded);
    }
    let code_obj = cx
        .pre
        .function_code_object(target)
        .ok_or(InlineFailure::NotPreloaded)?;
    if call.deopt.is_none() {
        return Err(InlineFailure::Unsupported);
    }

    let mut callee = build_hir(callee_pre).map_err(|_| InlineFailure::Unsupported)?;
    ssaify(&mut callee);
    let callee_cx = PassContext {
        pre: callee_pre.as_ref(),
        callees: cx.callees,
        config: cx.config,
    };
    simplify(&mut callee, &callee_cx);

    Ok(Site {
        target,
        code_obj,
        args,
        func_reg,
        callee,
    })
}

fn splice(func: &mut Function, b: BlockId, idx: usize, call: &Instr, site: Site) {
    let Site {
        target,
        code_obj,
        args,
        func_reg,
        callee,
    } = site;
    let Some(call_dst) = call.output() else { return };
    let Some(call_deopt) = call.deopt.as_deref() else { return };

    let tail = func.split_block(b, idx + 1);
    func.block_mut(b).instrs.pop();

    // The caller's frame as the interpreter sees it once the callee has
    // returned: callable and arguments popped, resuming after the call.
    let mut caller_frame = call_deopt.frame.clone();
    let keep = caller_frame.stack.len().saturating_sub(args.len() + 1);
    caller_frame.stack.truncate(keep);
    caller_frame.next_offset += 1;

    // Guard that the function still runs the code we inlined.
    let f = match func_reg {
        Some(r) => r,
        None => {
            let r = func.new_reg(Type::object_const(target, ObjKind::Function));
            func.push(
                b,
                Instr::at(
                    InstrKind::LoadConst {
                        dst: r,
                        value: HirConst::Ref(target),
                    },
                    call.bc_offset,
                ),
            );
            r
        }
    };
    let code_reg = func.new_reg(Type::CODE);
    func.push(
        b,
        Instr::at(InstrKind::LoadFunctionCode { dst: code_reg, func: f }, call.bc_offset),
    );
    let checked = func.new_reg(Type::object_const(code_obj, ObjKind::Code));
    let mut guard = Instr {
        kind: InstrKind::GuardIs {
            dst: checked,
            src: code_reg,
            target: code_obj,
        },
        bc_offset: call.bc_offset,
        deopt: call.deopt.clone(),
    };
    if let Some(d) = &mut guard.deopt {
        d.guilty = Some(code_reg);
        d.live.clear();
    }
    func.push(b, guard);
    func.push(
        b,
        Instr::at(
            InstrKind::BeginInlinedFunction {
                func: target,
                code: Arc::clone(&callee.code),
            },
            call.bc_offset,
        ),
    );

    // Registers: arguments map to the call's operands, the rest are fresh.
    let mut regs: Vec<Option<Reg>> = vec![None; callee.num_regs()];
    for block in callee.blocks() {
        for instr in &block.instrs {
            if let InstrKind::LoadArg { dst, idx } = instr.kind {
                regs[dst.index()] = args.get(idx as usize).copied();
            }
        }
    }
    for (i, slot) in regs.iter_mut().enumerate() {
        if slot.is_none() {
            *slot = Some(func.new_reg(callee.reg_type(Reg::new(i as u32))));
        }
    }
    let map_reg = |r: &mut Reg| {
        if let Some(Some(m)) = regs.get(r.index()) {
            *r = *m;
        }
    };

    let mut blocks: FxHashMap<BlockId, BlockId> = FxHashMap::default();
    for id in callee.block_ids() {
        blocks.insert(id, func.new_block());
    }
    let cache_base = func.num_attr_caches;
    func.num_attr_caches += callee.num_attr_caches;

    let join = func.new_block();
    let mut returns: Vec<(BlockId, Reg)> = Vec::new();
    for block in callee.blocks() {
        let nb = blocks[&block.id];
        let mut instrs = Vec::with_capacity(block.instrs.len());
        for instr in &block.instrs {
            if matches!(instr.kind, InstrKind::LoadArg { .. }) {
                continue;
            }
            let mut instr = instr.clone();
            rebase(&mut instr, &map_reg, &blocks, &caller_frame, target, cache_base);
            if let InstrKind::LoadConst {
                value: HirConst::Object(i),
                ..
            } = &mut instr.kind
            {
                if let Some(c) = callee.consts.get(*i as usize) {
                    *i = func.add_const(c.clone());
                }
            }
            instrs.push(instr);
        }
        let mut term = block.term.clone();
        rebase(&mut term, &map_reg, &blocks, &caller_frame, target, cache_base);
        if let InstrKind::Return { value } = term.kind {
            returns.push((nb, value));
            term = Instr::at(InstrKind::Branch { target: join }, term.bc_offset);
        }
        let new = func.block_mut(nb);
        new.instrs = instrs;
        new.term = term;
    }

    let callee_entry = blocks[&callee.entry];
    func.set_term(b, Instr::at(InstrKind::Branch { target: callee_entry }, call.bc_offset));

    match returns.as_slice() {
        [(_, v)] => {
            let mut subst = FxHashMap::default();
            subst.insert(call_dst, *v);
            func.replace_uses(&subst);
        }
        _ => {
            func.push(
                join,
                Instr::new(InstrKind::Phi {
                    dst: call_dst,
                    inputs: returns.clone(),
                }),
            );
        }
    }
    func.push(join, Instr::at(InstrKind::EndInlinedFunction { func: target }, call.bc_offset));
    func.set_term(join, Instr::at(InstrKind::Branch { target: tail }, call.bc_offset));

    tracing::debug!(
        function = %func.name,
        callee = %callee.name,
        blocks = blocks.len(),
        returns = returns.len(),
        "inlined"
    );
}

/// Move a callee instruction into the caller's register and block space
/// and hang its frame states under the caller's frame.
fn rebase(
    instr: &mut Instr,
    map_reg: &impl Fn(&mut Reg),
    blocks: &FxHashMap<BlockId, BlockId>,
    caller_frame: &FrameState,
    target: ObjRef,
    cache_base: u32,
) {
    instr.map_uses(map_reg);
    if let Some(out) = instr.kind.output_mut() {
        map_reg(out);
    }
    instr.kind.map_successors(|s| {
        if let Some(&m) = blocks.get(s) {
            *s = m;
        }
    });
    match &mut instr.kind {
        InstrKind::Phi { inputs, .. } => {
            for (pred, _) in inputs.iter_mut() {
                if let Some(&m) = blocks.get(pred) {
                    *pred = m;
                }
            }
        }
        InstrKind::CheckTypeAttrCache { cache, .. }
        | InstrKind::LoadTypeAttrCacheItem { cache, .. }
        | InstrKind::FillTypeAttrCache { cache, .. } => *cache += cache_base,
        _ => {}
    }
    if let Some(d) = &mut instr.deopt {
        mark_callee_frames(&mut d.frame, target);
        d.frame.set_outermost_parent(caller_frame.clone());
    }
}

fn mark_callee_frames(frame: &mut FrameState, target: ObjRef) {
    if frame.func.is_none() {
        frame.func = Some(target);
    }
    if let Some(parent) = &mut frame.parent {
        mark_callee_frames(parent, target);
    }
}

#[cfg(test)]
mod tests;
