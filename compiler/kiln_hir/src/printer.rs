//! Text rendering of HIR for trace dumps and tests.
//!
//! ```text
//! fun f {
//!   bb0:
//!     v0:Object = LoadArg 0
//!     v1:Long[1] = LoadConst 1
//!     v2:Object = BinaryOp Add v0, v1 {next 6, stack [], live [v0 borrowed]}
//!     Return v2
//! }
//! ```

use std::fmt::Write;

use crate::function::Function;
use crate::instr::{FrameState, HirConst, Instr, InstrKind, RefKind};

pub fn print_function(func: &Function) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "fun {} {{", func.name);
    for block in func.blocks() {
        let _ = writeln!(out, "  {}:", block.id);
        for instr in block.all_instrs() {
            out.push_str("    ");
            out.push_str(&print_instr(func, instr));
            out.push('\n');
        }
    }
    out.push('}');
    out
}

pub fn print_instr(func: &Function, instr: &Instr) -> String {
    let mut s = String::new();
    if let Some(d) = instr.output() {
        let _ = write!(s, "{d}:{} = ", func.reg_type(d));
    }
    s.push_str(instr.opcode().name());
    let detail = detail(&instr.kind);
    if !detail.is_empty() {
        s.push(' ');
        s.push_str(&detail);
    }
    if let Some(deopt) = &instr.deopt {
        s.push_str(" {");
        write_frame(&mut s, &deopt.frame);
        if let Some(g) = deopt.guilty {
            let _ = write!(s, ", guilty {g}");
        }
        if !deopt.live.is_empty() {
            let live: Vec<String> = deopt
                .live
                .iter()
                .map(|l| {
                    let kind = match l.kind {
                        RefKind::Uncounted => "uncounted",
                        RefKind::Owned => "owned",
                        RefKind::Borrowed => "borrowed",
                    };
                    format!("{} {kind}", l.reg)
                })
                .collect();
            let _ = write!(s, ", live [{}]", live.join(", "));
        }
        s.push('}');
    }
    s
}

fn write_frame(s: &mut String, frame: &FrameState) {
    if let Some(parent) = &frame.parent {
        write_frame(s, parent);
        s.push_str(" / ");
    }
    let locals: Vec<String> = frame
        .locals
        .iter()
        .map(|l| l.map_or_else(|| "_".to_owned(), |r| r.to_string()))
        .collect();
    let stack: Vec<String> = frame.stack.iter().map(ToString::to_string).collect();
    let _ = write!(
        s,
        "{} next {}, locals [{}], stack [{}]",
        frame.code.name,
        frame.next_offset,
        locals.join(", "),
        stack.join(", ")
    );
}

fn regs(kind: &InstrKind) -> String {
    let ops: Vec<String> = kind.operands().iter().map(ToString::to_string).collect();
    ops.join(", ")
}

fn detail(kind: &InstrKind) -> String {
    match kind {
        InstrKind::LoadArg { idx, .. } => idx.to_string(),
        InstrKind::LoadConst { value, .. } => match value {
            HirConst::Object(i) => format!("const#{i}"),
            HirConst::Ref(o) => format!("{o:?}"),
            HirConst::Int64(v) => v.to_string(),
            HirConst::Double(v) => format!("{v:?}"),
            HirConst::Bool(v) => v.to_string(),
            HirConst::Nullptr => "null".to_owned(),
        },
        InstrKind::Phi { inputs, .. } => {
            let parts: Vec<String> = inputs.iter().map(|(b, r)| format!("{b}:{r}")).collect();
            parts.join(", ")
        }
        InstrKind::GuardType { src, ty, .. } => format!("{src}, {ty}"),
        InstrKind::GuardIs { src, target, .. } => format!("{src}, {target:?}"),
        InstrKind::CheckVar { src, name, .. }
        | InstrKind::CheckFreevar { src, name, .. }
        | InstrKind::CheckField { src, name, .. } => format!("{src}, \"{name}\""),
        InstrKind::LoadGlobalCached { slot, name, .. } => format!("\"{name}\" slot {slot}"),
        InstrKind::LoadGlobal { name, .. } => format!("\"{name}\""),
        InstrKind::StoreGlobal { value, name } => format!("{value}, \"{name}\""),
        InstrKind::LoadAttr { obj, name, .. } => format!("{obj}, \"{name}\""),
        InstrKind::StoreAttr { obj, value, name } => format!("{obj}, {value}, \"{name}\""),
        InstrKind::LoadField { obj, index, .. } => format!("{obj}, field {index}"),
        InstrKind::StoreField {
            obj, value, index, ..
        } => format!("{obj}, field {index}, {value}"),
        InstrKind::LoadTypeAttrCacheItem { cache, .. } => format!("cache {cache}"),
        InstrKind::CheckTypeAttrCache { receiver, cache, .. } => {
            format!("{receiver}, cache {cache}")
        }
        InstrKind::FillTypeAttrCache {
            receiver,
            name,
            cache,
            ..
        } => format!("{receiver}, \"{name}\", cache {cache}"),
        InstrKind::LoadMethod { receiver, name, .. } => format!("{receiver}, \"{name}\""),
        InstrKind::CallStatic { method, args, .. } => {
            let args: Vec<String> = args.iter().map(ToString::to_string).collect();
            format!("{method:?}({})", args.join(", "))
        }
        InstrKind::InvokeStaticFunction { target, args, .. } => {
            let args: Vec<String> = args.iter().map(ToString::to_string).collect();
            format!("{target:?}({})", args.join(", "))
        }
        InstrKind::BinaryOp { op, .. }
        | InstrKind::LongBinaryOp { op, .. }
        | InstrKind::IntBinaryOp { op, .. } => format!("{op:?} {}", regs(kind)),
        InstrKind::Compare { op, .. }
        | InstrKind::PrimitiveCompare { op, .. }
        | InstrKind::CompareBool { op, .. } => format!("{op:?} {}", regs(kind)),
        InstrKind::PrimitiveBox { src, kind, .. } | InstrKind::PrimitiveUnbox { src, kind, .. } => {
            format!("{src}, {kind:?}")
        }
        InstrKind::LoadFreevar { idx, .. } => idx.to_string(),
        InstrKind::StoreFreevar { value, idx } => format!("{idx}, {value}"),
        InstrKind::DeoptPatchpoint { key } => format!("{key:?}"),
        InstrKind::BeginInlinedFunction { func, code } => format!("{func:?} {}", code.name),
        InstrKind::EndInlinedFunction { func } => format!("{func:?}"),
        InstrKind::UpdatePrevInstr { offset } => offset.to_string(),
        InstrKind::Branch { target } => format!("{target}"),
        InstrKind::CondBranch {
            cond,
            if_true,
            if_false,
        } => format!("{cond} -> {if_true}, {if_false}"),
        _ => regs(kind),
    }
}

#[cfg(test)]
mod tests;
