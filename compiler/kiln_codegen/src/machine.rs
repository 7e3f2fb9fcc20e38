//! The KX machine: executes code straight out of the shared code buffer.
//!
//! Each invocation gets its own register file and stack. Instructions are
//! fetched one at a time under the buffer lock, so another thread may
//! append or patch code while this one runs; a patched jump takes effect
//! the next time the slot is fetched.
//!
//! Object instructions act directly on the runtime heap. Helper calls go
//! through [`crate::helpers`].

use kiln_hir::{PrimKind, TypeBits};
use kiln_rt::{int_arith, Num, ObjRef, Object, Runtime};

use crate::code_buffer::SharedCodeBuffer;
use crate::code_runtime::CodeRuntime;
use crate::deopt::Location;
use crate::error::CodegenError;
use crate::helpers;
use crate::isa::{Gp, Inst, ARG_COUNT, ARG_FUNC, ARG_PTR, INSTR_SIZE, NUM_GPS, RET, WORD};

/// Byte address of the lowest stack word. Address `0` is never mapped.
pub const STACK_BASE: u64 = 0x1_0000;

/// Return address that ends the invocation when popped.
const SENTINEL: u64 = u64::MAX;

/// Written to caller-saved registers after a helper call.
pub const POISON: u64 = 0xDEAD_BEEF_DEAD_BEEF;

/// What compiled code may touch besides the machine itself.
pub struct ExecContext<'a> {
    pub rt: &'a mut Runtime,
    pub code: &'a CodeRuntime,
}

/// Register file at a deopt exit.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeoptCapture {
    /// Deopt metadata index pushed by the stub.
    pub index: u64,
    pub regs: [u64; NUM_GPS],
}

impl DeoptCapture {
    pub fn reg(&self, r: Gp) -> u64 {
        self.regs[r.index()]
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Exit {
    /// Value left in `r0` by the outermost return.
    Return(u64),
    Deopt(DeoptCapture),
}

pub struct Machine {
    regs: [u64; NUM_GPS],
    memory: Vec<u64>,
    fault: bool,
    cmp: (u64, u64),
    steps: u64,
}

impl Machine {
    /// A machine with `stack_bytes` of stack, rounded up to whole words.
    pub fn new(stack_bytes: usize) -> Self {
        Machine {
            regs: [0; NUM_GPS],
            memory: vec![0; stack_bytes.div_ceil(WORD as usize)],
            fault: false,
            cmp: (0, 0),
            steps: 0,
        }
    }

    pub fn reg(&self, r: Gp) -> u64 {
        self.regs[r.index()]
    }

    /// Instructions executed so far.
    pub fn steps(&self) -> u64 {
        self.steps
    }

    fn stack_top(&self) -> u64 {
        STACK_BASE + (self.memory.len() as u64) * WORD as u64
    }

    // ── Memory ─────────────────────────────────────────────────────

    fn word_index(&self, addr: u64) -> Result<usize, CodegenError> {
        if addr < STACK_BASE || addr % WORD as u64 != 0 {
            return Err(CodegenError::MemoryFault(addr));
        }
        let index = ((addr - STACK_BASE) / WORD as u64) as usize;
        if index >= self.memory.len() {
            return Err(CodegenError::MemoryFault(addr));
        }
        Ok(index)
    }

    pub fn read(&self, addr: u64) -> Result<u64, CodegenError> {
        Ok(self.memory[self.word_index(addr)?])
    }

    pub fn write(&mut self, addr: u64, value: u64) -> Result<(), CodegenError> {
        let i = self.word_index(addr)?;
        self.memory[i] = value;
        Ok(())
    }

    fn push(&mut self, value: u64) -> Result<(), CodegenError> {
        let sp = self.reg(Gp::SP).wrapping_sub(WORD as u64);
        if sp < STACK_BASE {
            return Err(CodegenError::StackOverflow);
        }
        self.write(sp, value)?;
        self.regs[Gp::SP.index()] = sp;
        Ok(())
    }

    fn pop(&mut self) -> Result<u64, CodegenError> {
        let sp = self.reg(Gp::SP);
        let value = self.read(sp)?;
        self.regs[Gp::SP.index()] = sp.wrapping_add(WORD as u64);
        Ok(value)
    }

    fn address(&self, base: Gp, offset: i32) -> u64 {
        self.reg(base).wrapping_add(offset as i64 as u64)
    }

    /// `count` words starting at `addr`.
    pub fn read_words(&self, addr: u64, count: usize) -> Result<Vec<u64>, CodegenError> {
        (0..count)
            .map(|i| self.read(addr.wrapping_add(i as u64 * WORD as u64)))
            .collect()
    }

    /// The value a deopt location held when `capture` was taken.
    pub fn read_location(&self, capture: &DeoptCapture, loc: Location) -> Result<u64, CodegenError> {
        match loc {
            Location::Reg(r) => Ok(capture.reg(r)),
            Location::Stack(offset) => self.read(capture.reg(Gp::FP).wrapping_add(offset as i64 as u64)),
        }
    }

    // ── Execution ──────────────────────────────────────────────────

    /// Enter the code at absolute buffer offset `entry` with `args` as the
    /// argument words and `func` as the function object.
    pub fn invoke(
        &mut self,
        buffer: &SharedCodeBuffer,
        entry: usize,
        func: ObjRef,
        args: &[u64],
        ctx: &mut ExecContext<'_>,
    ) -> Result<Exit, CodegenError> {
        self.regs = [0; NUM_GPS];
        self.regs[Gp::SP.index()] = self.stack_top();
        self.fault = false;
        for &word in args.iter().rev() {
            self.push(word)?;
        }
        self.regs[ARG_PTR.index()] = self.reg(Gp::SP);
        self.regs[ARG_COUNT.index()] = args.len() as u64;
        self.regs[ARG_FUNC.index()] = func.to_word();
        self.push(SENTINEL)?;
        self.run(buffer, entry, ctx)
    }

    fn run(&mut self, buffer: &SharedCodeBuffer, mut pc: usize, ctx: &mut ExecContext<'_>) -> Result<Exit, CodegenError> {
        loop {
            let inst = buffer.lock().fetch(pc)?;
            self.steps += 1;
            let next = pc + INSTR_SIZE;
            pc = next;
            match inst {
                Inst::Nop => {}
                Inst::Trap => return Err(CodegenError::Trap(next - INSTR_SIZE)),
                Inst::MovImm { dst, imm } => self.set(dst, imm as u64),
                Inst::Mov { dst, src } => self.set(dst, self.reg(src)),
                Inst::Load { dst, base, offset } => {
                    let value = self.read(self.address(base, offset))?;
                    self.set(dst, value);
                }
                Inst::Store { src, base, offset } => self.write(self.address(base, offset), self.reg(src))?,
                Inst::Alu { op, dst, a, b } => self.set(dst, op.eval(self.reg(a), self.reg(b))),
                Inst::AluImm { op, dst, a, imm } => self.set(dst, op.eval(self.reg(a), imm as u64)),
                Inst::CheckedArith { op, dst, a, b } => {
                    match int_arith(op, self.reg(a) as i64, self.reg(b) as i64) {
                        Ok(Num::Int(v)) => {
                            self.fault = false;
                            self.set(dst, v as u64);
                        }
                        Ok(Num::Float(_)) | Err(_) => self.fault = true,
                    }
                }
                Inst::Cmp { a, b } => self.cmp = (self.reg(a), self.reg(b)),
                Inst::CmpImm { a, imm } => self.cmp = (self.reg(a), imm as u64),
                Inst::SetCc { cond, dst } => {
                    let (a, b) = self.cmp;
                    self.set(dst, u64::from(cond.holds(a, b, self.fault)));
                }
                Inst::Jmp { rel } => pc = jump_target(next, rel)?,
                Inst::Jcc { cond, rel } => {
                    let (a, b) = self.cmp;
                    if cond.holds(a, b, self.fault) {
                        pc = jump_target(next, rel)?;
                    }
                }
                Inst::CallLocal { rel } => {
                    self.push(next as u64)?;
                    pc = jump_target(next, rel)?;
                }
                Inst::Ret => {
                    let ret = self.pop()?;
                    if ret == SENTINEL {
                        return Ok(Exit::Return(self.reg(RET)));
                    }
                    pc = usize::try_from(ret).map_err(|_| CodegenError::BadJump(ret as i64))?;
                }
                Inst::Push { src } => self.push(self.reg(src))?,
                Inst::PushImm { imm } => self.push(imm as u64)?,
                Inst::Pop { dst } => {
                    let value = self.pop()?;
                    self.set(dst, value);
                }
                Inst::Call { helper, nargs } => {
                    let args = self.read_words(self.reg(Gp::SP), usize::from(nargs))?;
                    let result = helpers::call(helper, &args, self, ctx)?;
                    for r in 1..=8u8 {
                        if let Some(g) = Gp::new(r) {
                            self.set(g, POISON);
                        }
                    }
                    match result {
                        Some(word) => {
                            self.fault = false;
                            self.set(RET, word);
                        }
                        None => {
                            self.fault = true;
                            self.set(RET, 0);
                        }
                    }
                }
                Inst::SaveRegs => {
                    let sp = self.reg(Gp::SP);
                    for i in 0..NUM_GPS {
                        let value = if i == Gp::SP.index() { sp } else { self.regs[i] };
                        self.push(value)?;
                    }
                }
                Inst::DeoptExit => {
                    let sp = self.reg(Gp::SP);
                    let saved = self.read_words(sp, NUM_GPS + 1)?;
                    let mut regs = [0; NUM_GPS];
                    for (i, reg) in regs.iter_mut().enumerate() {
                        // Pushed r0 first, so r0 sits highest.
                        *reg = saved[NUM_GPS - 1 - i];
                    }
                    return Ok(Exit::Deopt(DeoptCapture {
                        index: saved[NUM_GPS],
                        regs,
                    }));
                }
                other => self.exec_object(other, ctx)?,
            }
        }
    }

    fn set(&mut self, dst: Gp, value: u64) {
        self.regs[dst.index()] = value;
    }

    /// The live object in `r`.
    fn object(&self, rt: &Runtime, r: Gp) -> Result<ObjRef, CodegenError> {
        let word = self.reg(r);
        let obj = ObjRef::from_word(word);
        if word > u64::from(u32::MAX) || !rt.heap.is_live(obj) {
            return Err(CodegenError::NotAnObject { reg: r, word });
        }
        Ok(obj)
    }

    fn not_an_object(&self, r: Gp) -> CodegenError {
        CodegenError::NotAnObject { reg: r, word: self.reg(r) }
    }

    fn exec_object(&mut self, inst: Inst, ctx: &mut ExecContext<'_>) -> Result<(), CodegenError> {
        let rt = &mut *ctx.rt;
        match inst {
            Inst::LoadKind { dst, obj } => {
                let bits = if self.reg(obj) == 0 {
                    TypeBits::NULLPTR.bits()
                } else {
                    rt.kind_of(self.object(rt, obj)?).bit()
                };
                self.set(dst, u64::from(bits));
            }
            Inst::LoadClass { dst, obj } => {
                let o = self.object(rt, obj)?;
                let class = match rt.heap.get(o) {
                    Object::Instance(inst) => inst.class.to_word(),
                    _ => 0,
                };
                self.set(dst, class);
            }
            Inst::Unbox { kind, dst, obj } => {
                let o = self.object(rt, obj)?;
                let word = match (kind, rt.heap.get(o)) {
                    (PrimKind::Int64, Object::Int(v)) => *v as u64,
                    (PrimKind::Int64 | PrimKind::Bool, Object::Bool(b)) => u64::from(*b),
                    (PrimKind::Double, Object::Float(x)) => x.to_bits(),
                    (PrimKind::Double, Object::Int(v)) => (*v as f64).to_bits(),
                    _ => return Err(self.not_an_object(obj)),
                };
                self.set(dst, word);
            }
            Inst::LoadField { dst, obj, index } => {
                let o = self.object(rt, obj)?;
                let value = match rt.heap.get(o) {
                    Object::Instance(inst) => inst.fields.get(index as usize).copied(),
                    _ => return Err(self.not_an_object(obj)),
                };
                let value = value.ok_or(CodegenError::IndexOutOfRange {
                    obj: o.to_word(),
                    index: u64::from(index),
                })?;
                self.set(dst, value.to_word());
            }
            Inst::StoreField { obj, src, index } => {
                let o = self.object(rt, obj)?;
                let value = ObjRef::from_word(self.reg(src));
                let old = match rt.heap.get_mut(o) {
                    Object::Instance(inst) => inst
                        .fields
                        .get_mut(index as usize)
                        .map(|slot| std::mem::replace(slot, value)),
                    _ => return Err(self.not_an_object(obj)),
                };
                let old = old.ok_or(CodegenError::IndexOutOfRange {
                    obj: o.to_word(),
                    index: u64::from(index),
                })?;
                rt.decref(old);
            }
            Inst::SeqLen { dst, obj } => {
                let o = self.object(rt, obj)?;
                let len = match rt.heap.get(o) {
                    Object::Tuple(items) | Object::List(items) => items.len(),
                    _ => return Err(self.not_an_object(obj)),
                };
                self.set(dst, len as u64);
            }
            Inst::SeqItem { dst, obj, index } => {
                let o = self.object(rt, obj)?;
                let i = self.reg(index);
                let item = match rt.heap.get(o) {
                    Object::Tuple(items) | Object::List(items) => usize::try_from(i).ok().and_then(|i| items.get(i)).copied(),
                    _ => return Err(self.not_an_object(obj)),
                };
                let item = item.ok_or(CodegenError::IndexOutOfRange { obj: o.to_word(), index: i })?;
                self.set(dst, item.to_word());
            }
            Inst::LoadGlobal { dst, slot, namespace } => {
                let ns = ObjRef::from_word(namespace);
                let value = rt
                    .namespace(ns)
                    .map(|n| n.slot_value(slot as usize))
                    .ok_or(CodegenError::IndexOutOfRange {
                        obj: namespace,
                        index: u64::from(slot),
                    })?;
                self.set(dst, value.to_word());
            }
            Inst::LoadCell { dst, func, index } => {
                let cell = self.closure_cell(rt, func, index)?;
                let value = match rt.heap.get(cell) {
                    Object::Cell(v) => *v,
                    _ => ObjRef::NULL,
                };
                self.set(dst, value.to_word());
            }
            Inst::StoreCell { func, src, index } => {
                let cell = self.closure_cell(rt, func, index)?;
                let value = ObjRef::from_word(self.reg(src));
                let old = match rt.heap.get_mut(cell) {
                    Object::Cell(v) => std::mem::replace(v, value),
                    _ => ObjRef::NULL,
                };
                rt.decref(old);
            }
            Inst::LoadCode { dst, func } => {
                let f = self.object(rt, func)?;
                let code = rt.function(f).map(|f| f.code).ok_or_else(|| self.not_an_object(func))?;
                self.set(dst, code.to_word());
            }
            Inst::LoadConstObj { dst, index } => {
                let value = ctx.code.const_object(index).ok_or(CodegenError::IndexOutOfRange {
                    obj: 0,
                    index: u64::from(index),
                })?;
                self.set(dst, value.to_word());
            }
            Inst::CacheCheck { dst, obj, cache } => {
                let ty = ObjRef::from_word(self.reg(obj));
                let hit = ctx.code.cache_hit(rt, cache, ty);
                self.set(dst, u64::from(hit));
            }
            Inst::CacheLoad { dst, cache } => self.set(dst, ctx.code.cache_value(cache).to_word()),
            Inst::Incref { src } => {
                let o = self.object(rt, src)?;
                rt.incref(o);
            }
            Inst::Decref { src } => {
                let o = self.object(rt, src)?;
                rt.decref(o);
            }
            Inst::XDecref { src } => {
                if self.reg(src) != 0 {
                    let o = self.object(rt, src)?;
                    rt.decref(o);
                }
            }
            Inst::SetOffset { offset } => rt.set_shadow_offset(offset as usize),
            _ => {}
        }
        Ok(())
    }

    fn closure_cell(&self, rt: &Runtime, func: Gp, index: u32) -> Result<ObjRef, CodegenError> {
        let f = self.object(rt, func)?;
        let closure = rt.function(f).map(|f| &f.closure).ok_or_else(|| self.not_an_object(func))?;
        closure.get(index as usize).copied().ok_or(CodegenError::IndexOutOfRange {
            obj: f.to_word(),
            index: u64::from(index),
        })
    }
}

fn jump_target(next: usize, rel: i32) -> Result<usize, CodegenError> {
    let target = next as i64 + i64::from(rel);
    usize::try_from(target).map_err(|_| CodegenError::BadJump(target))
}

impl std::fmt::Debug for Machine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Machine")
            .field("regs", &self.regs)
            .field("stack_words", &self.memory.len())
            .field("fault", &self.fault)
            .finish_non_exhaustive()
    }
}
