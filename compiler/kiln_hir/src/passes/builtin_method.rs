//! Call builtin-type methods directly.
//!
//! `m = LoadMethod recv, name; CallMethod m, null, args` on a receiver of
//! an exact builtin type resolves `name` at compile time. The lookup is
//! dropped and the call becomes a `CallStatic` of the method's
//! implementation with the implicit first argument made explicit.
//!
//! Frame states keep their interpreter shape: the method slot holds the
//! method object and the self slot holds what the method receives (the
//! receiver, its type, or still `NULL` for static methods), which is
//! exactly what the interpreter's own method lookup would have pushed.

use kiln_rt::builtins::{self, MethodKind};
use kiln_rt::{BuiltinMethodId, ObjKind, ObjRef};
use rustc_hash::{FxHashMap, FxHashSet};

use crate::function::Function;
use crate::instr::{BlockId, HirConst, Instr, InstrKind, Reg};
use crate::preload::Preloader;
use crate::types::Type;

pub fn builtin_load_method_elimination(func: &mut Function, pre: &Preloader) {
    let mut rewritten = 0usize;
    loop {
        let Some(site) = find_site(func, pre) else { break };
        rewrite(func, &site);
        rewritten += 1;
    }
    if rewritten > 0 {
        tracing::debug!(function = %func.name, rewritten, "builtin method calls resolved");
    }
}

struct Site {
    load: (BlockId, usize),
    call: (BlockId, usize),
    method: Reg,
    receiver: Reg,
    null: Reg,
    kind: ObjKind,
    id: BuiltinMethodId,
    method_obj: ObjRef,
    /// The type object, for class methods.
    type_obj: Option<ObjRef>,
}

/// Operand uses per register, ignoring frame states.
fn operand_uses(func: &Function) -> Vec<u32> {
    let mut counts = vec![0u32; func.num_regs()];
    for instr in func.blocks().flat_map(|b| b.all_instrs()) {
        instr.kind.visit_operands(|r| counts[r.index()] += 1);
    }
    counts
}

fn find_site(func: &Function, pre: &Preloader) -> Option<Site> {
    let uses = operand_uses(func);
    let mut calls: FxHashMap<Reg, (BlockId, usize)> = FxHashMap::default();
    let mut nulls: FxHashSet<Reg> = FxHashSet::default();
    for block in func.blocks() {
        for (i, instr) in block.instrs.iter().enumerate() {
            match instr.kind {
                InstrKind::CallMethod { callable, .. } => {
                    calls.insert(callable, (block.id, i));
                }
                InstrKind::LoadConst {
                    dst,
                    value: HirConst::Nullptr,
                } => {
                    nulls.insert(dst);
                }
                _ => {}
            }
        }
    }

    for block in func.blocks() {
        for (i, instr) in block.instrs.iter().enumerate() {
            let InstrKind::LoadMethod { dst, receiver, name } = instr.kind else {
                continue;
            };
            if uses[dst.index()] != 1 {
                continue;
            }
            let Some(&call) = calls.get(&dst) else { continue };
            let Some(kind) = func.reg_type(receiver).exact_kind() else {
                continue;
            };
            let Some(id) = builtins::lookup_method(kind, name.as_str()) else {
                continue;
            };
            let Some(method_obj) = pre.builtin_method(id) else {
                continue;
            };
            let InstrKind::CallMethod {
                self_or_null, ref args, ..
            } = func.block(call.0).instrs[call.1].kind
            else {
                continue;
            };
            if !nulls.contains(&self_or_null) || uses[self_or_null.index()] != 1 {
                continue;
            }
            let def = builtins::method(id);
            if def.full_arity() != args.len() + usize::from(def.kind != MethodKind::Static) {
                continue;
            }
            let type_obj = match def.kind {
                MethodKind::Class => match pre.type_object(kind) {
                    Some(t) => Some(t),
                    None => continue,
                },
                _ => None,
            };
            return Some(Site {
                load: (block.id, i),
                call,
                method: dst,
                receiver,
                null: self_or_null,
                kind,
                id,
                method_obj,
                type_obj,
            });
        }
    }
    None
}

fn rewrite(func: &mut Function, site: &Site) {
    let (lb, li) = site.load;
    let bc_offset = func.block(lb).instrs[li].bc_offset;
    func.block_mut(lb).instrs[li] = Instr::at(
        InstrKind::LoadConst {
            dst: site.method,
            value: HirConst::Ref(site.method_obj),
        },
        bc_offset,
    );
    let old = func.reg_type(site.method);
    func.set_reg_type(site.method, old & Type::object_const(site.method_obj, ObjKind::Builtin));

    let self_reg = match (builtins::method(site.id).kind, site.type_obj) {
        (MethodKind::Instance, _) => Some(site.receiver),
        (MethodKind::Class, Some(t)) => {
            let r = func.new_reg(Type::object_const(t, ObjKind::Type));
            func.block_mut(lb).instrs.insert(
                li + 1,
                Instr::at(
                    InstrKind::LoadConst {
                        dst: r,
                        value: HirConst::Ref(t),
                    },
                    bc_offset,
                ),
            );
            Some(r)
        }
        _ => None,
    };

    // Inserting after the load shifts the call if both share a block.
    let (cb, mut ci) = site.call;
    if cb == lb && ci > li && self_reg.is_some() && self_reg != Some(site.receiver) {
        ci += 1;
    }
    let call = &mut func.block_mut(cb).instrs[ci];
    let direct = match &call.kind {
        InstrKind::CallMethod { dst, args, .. } => {
            let mut full = Vec::with_capacity(args.len() + 1);
            full.extend(self_reg);
            full.extend(args.iter().copied());
            Some(InstrKind::CallStatic {
                dst: *dst,
                method: site.id,
                args: full,
            })
        }
        _ => None,
    };
    if let Some(kind) = direct {
        call.kind = kind;
    }

    if let Some(s) = self_reg {
        let mut subst = FxHashMap::default();
        subst.insert(site.null, s);
        func.replace_uses(&subst);
    }
    tracing::trace!(
        function = %func.name,
        owner = site.kind.type_name(),
        method = builtins::method(site.id).name,
        "resolved builtin method"
    );
}

#[cfg(test)]
mod tests;
