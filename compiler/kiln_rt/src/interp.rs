//! Reference stack interpreter.
//!
//! Frames are plain values so that the deoptimizer can build one from
//! compiled-code state and hand it to [`Runtime::resume_frame`]. A frame
//! owns one reference to every non-null value in its locals, cells, and
//! stack, plus one to its function.

use std::sync::Arc;

use smallvec::SmallVec;

use crate::builtins::{self, MethodKind};
use crate::code::{ArgAnnotation, CodeUnit, Op};
use crate::exception::{ExcKind, Raised, RtResult};
use crate::hook::JitState;
use crate::intern::Name;
use crate::object::{ObjKind, ObjRef, Object};
use crate::runtime::{Runtime, MAX_CALL_DEPTH};

/// An interpreter activation.
#[derive(Debug)]
pub struct Frame {
    pub func: ObjRef,
    pub code: Arc<CodeUnit>,
    pub globals: ObjRef,
    pub builtins: ObjRef,
    /// `NULL` marks an unbound local.
    pub locals: Vec<ObjRef>,
    /// Cell objects: cellvars then freevars.
    pub cells: Vec<ObjRef>,
    pub stack: Vec<ObjRef>,
    /// Offset of the next instruction to execute.
    pub pc: usize,
}

impl Runtime {
    /// Call any callable with borrowed `args`.
    pub fn call(&mut self, callable: ObjRef, args: &[ObjRef]) -> RtResult<ObjRef> {
        match self.heap.get(callable) {
            Object::Function(_) => self.call_function(callable, args),
            Object::BuiltinFunction(id) => {
                let def = builtins::function(*id);
                if def.arity.is_some_and(|n| n != args.len()) {
                    return Err(self.raise(
                        ExcKind::TypeError,
                        format!(
                            "{}() takes {} arguments ({} given)",
                            def.name,
                            def.arity.unwrap_or(0),
                            args.len()
                        ),
                    ));
                }
                (def.func)(self, args)
            }
            Object::BuiltinMethod(id) => {
                let def = builtins::method(*id);
                if def.full_arity() != args.len() {
                    return Err(self.raise(
                        ExcKind::TypeError,
                        format!(
                            "{}() takes {} arguments ({} given)",
                            def.name,
                            def.full_arity(),
                            args.len()
                        ),
                    ));
                }
                if def.kind == MethodKind::Instance && self.kind_of(args[0]) != def.owner {
                    return Err(self.raise(
                        ExcKind::TypeError,
                        format!("descriptor '{}' requires a '{}' object", def.name, def.owner.type_name()),
                    ));
                }
                (def.func)(self, args)
            }
            Object::BoundMethod { func, receiver } => {
                let (func, receiver) = (*func, *receiver);
                let mut full: SmallVec<[ObjRef; 8]> = SmallVec::with_capacity(args.len() + 1);
                full.push(receiver);
                full.extend_from_slice(args);
                self.call(func, &full)
            }
            Object::Type(t) if t.builtin.is_none() => self.instantiate(callable, args),
            _ => {
                let tname = self.type_name_of(callable);
                Err(self.raise(
                    ExcKind::TypeError,
                    format!("'{tname}' object is not callable"),
                ))
            }
        }
    }

    fn instantiate(&mut self, class: ObjRef, args: &[ObjRef]) -> RtResult<ObjRef> {
        let init = self
            .type_obj(class)
            .and_then(|t| t.attr(crate::intern::Name::new("__init__")));
        let inst = self.new_instance(class);
        match init {
            Some(init) => {
                let mut full: SmallVec<[ObjRef; 8]> = SmallVec::with_capacity(args.len() + 1);
                full.push(inst);
                full.extend_from_slice(args);
                match self.call(init, &full) {
                    Ok(r) => {
                        self.decref(r);
                        Ok(inst)
                    }
                    Err(e) => {
                        self.decref(inst);
                        Err(e)
                    }
                }
            }
            None if args.is_empty() => Ok(inst),
            None => {
                self.decref(inst);
                Err(self.raise(ExcKind::TypeError, "object() takes no arguments"))
            }
        }
    }

    /// Call a function object, dispatching to compiled code when present.
    pub fn call_function(&mut self, func: ObjRef, args: &[ObjRef]) -> RtResult<ObjRef> {
        if self.depth >= MAX_CALL_DEPTH {
            return Err(self.raise(ExcKind::RecursionError, "maximum recursion depth exceeded"));
        }
        self.depth += 1;
        let result = self.call_function_inner(func, args);
        self.depth -= 1;
        result
    }

    fn call_function_inner(&mut self, func: ObjRef, args: &[ObjRef]) -> RtResult<ObjRef> {
        let hook = self.hook();
        if let Some(hook) = &hook {
            let mut state = self.jit_state(func);
            if state == JitState::NotCompiled {
                let threshold = hook.hot_threshold();
                let calls = match self.function_mut(func) {
                    Some(f) => {
                        f.calls = f.calls.saturating_add(1);
                        f.calls
                    }
                    None => 0,
                };
                if threshold > 0 && calls == threshold {
                    hook.function_hot(self, func)?;
                    state = self.jit_state(func);
                }
            }
            if let Some(entry) = state.active_entry() {
                return hook.invoke(self, func, entry, args);
            }
        }
        let frame = self.new_frame(func, args)?;
        self.eval_frame(frame)
    }

    /// Build a frame for `func` with `args` bound (borrowed).
    pub fn new_frame(&mut self, func: ObjRef, args: &[ObjRef]) -> RtResult<Frame> {
        let Some(f) = self.function(func) else {
            return Err(self.raise(ExcKind::TypeError, "not a function"));
        };
        let defaults = f.defaults.clone();
        let Some(code) = self.func_code(func) else {
            return Err(self.raise(ExcKind::TypeError, "function has no code"));
        };
        let argcount = code.argcount;
        if args.len() > argcount || args.len() + defaults.len() < argcount {
            return Err(self.raise(
                ExcKind::TypeError,
                format!(
                    "{}() takes {} positional arguments but {} were given",
                    code.name,
                    argcount,
                    args.len()
                ),
            ));
        }
        for (i, (&arg, ann)) in args.iter().zip(code.arg_types.iter()).enumerate() {
            let ok = match ann {
                crate::code::ArgAnnotation::Int64 => self.kind_of(arg) == ObjKind::Int,
                crate::code::ArgAnnotation::Float64 => self.kind_of(arg) == ObjKind::Float,
                _ => true,
            };
            if !ok {
                let tname = self.type_name_of(arg);
                return Err(self.raise(
                    ExcKind::TypeError,
                    format!(
                        "{}() argument {} expected a primitive {:?}, got '{tname}'",
                        code.name,
                        code.local_names[i],
                        ann
                    ),
                ));
            }
        }

        let mut frame = self.empty_frame(func);
        for (slot, &arg) in frame.locals.iter_mut().zip(args) {
            *slot = arg;
        }
        for &arg in args {
            self.incref(arg);
        }
        let missing = argcount - args.len();
        let first_default = defaults.len() - missing;
        for (i, &d) in defaults[first_default..].iter().enumerate() {
            frame.locals[args.len() + i] = d;
            self.incref(d);
        }
        Ok(frame)
    }

    /// A frame for `func` with every local unbound, an empty stack, and
    /// cells ready. Used directly by deoptimization.
    pub fn empty_frame(&mut self, func: ObjRef) -> Frame {
        let (code, globals, builtins, closure) = match self.function(func) {
            Some(f) => (
                self.code_unit(f.code),
                f.globals,
                f.builtins,
                f.closure.clone(),
            ),
            None => (None, ObjRef::NULL, ObjRef::NULL, Vec::new()),
        };
        let code = code.unwrap_or_else(|| panic!("empty_frame on non-function {func:?}"));
        self.incref(func);
        self.incref(globals);
        self.incref(builtins);
        let mut cells = Vec::with_capacity(code.ncells());
        for _ in &code.cellvars {
            cells.push(self.new_cell(ObjRef::NULL));
        }
        for &cell in &closure {
            self.incref(cell);
            cells.push(cell);
        }
        Frame {
            func,
            locals: vec![ObjRef::NULL; code.nlocals()],
            cells,
            stack: Vec::with_capacity(code.max_stack_depth()),
            pc: 0,
            code,
            globals,
            builtins,
        }
    }

    /// Release every reference a frame owns.
    pub fn release_frame(&mut self, frame: Frame) {
        let Frame {
            func,
            globals,
            builtins,
            locals,
            cells,
            stack,
            ..
        } = frame;
        self.decref_all(stack);
        self.decref_all(locals);
        self.decref_all(cells);
        self.decref(globals);
        self.decref(builtins);
        self.decref(func);
    }

    /// Run a fresh frame to completion.
    pub fn eval_frame(&mut self, mut frame: Frame) -> RtResult<ObjRef> {
        self.push_shadow(Arc::clone(&frame.code), frame.pc);
        let result = self.run(&mut frame);
        self.pop_shadow();
        self.release_frame(frame);
        result
    }

    /// Continue a frame reconstructed by the deoptimizer. If an exception is
    /// pending, the frame unwinds immediately.
    pub fn resume_frame(&mut self, frame: Frame) -> RtResult<ObjRef> {
        if self.has_pending() {
            self.release_frame(frame);
            return Err(Raised);
        }
        self.eval_frame(frame)
    }

    fn pop(&mut self, frame: &mut Frame) -> RtResult<ObjRef> {
        match frame.stack.pop() {
            Some(v) => Ok(v),
            None => Err(self.raise(ExcKind::RuntimeError, "value stack underflow")),
        }
    }

    fn pop_n(&mut self, frame: &mut Frame, n: usize) -> RtResult<Vec<ObjRef>> {
        if frame.stack.len() < n {
            return Err(self.raise(ExcKind::RuntimeError, "value stack underflow"));
        }
        let at = frame.stack.len() - n;
        Ok(frame.stack.split_off(at))
    }

    fn push_result(frame: &mut Frame, result: RtResult<ObjRef>) -> RtResult<()> {
        frame.stack.push(result?);
        Ok(())
    }

    fn run(&mut self, frame: &mut Frame) -> RtResult<ObjRef> {
        loop {
            let pc = frame.pc;
            let Some(&op) = frame.code.ops.get(pc) else {
                return Err(self.raise(ExcKind::RuntimeError, "execution fell off the end of the code"));
            };
            self.set_shadow_offset(pc);
            frame.pc = pc + 1;
            match op {
                Op::Nop => {}
                Op::PopTop => {
                    let v = self.pop(frame)?;
                    self.decref(v);
                }
                Op::DupTop => {
                    let v = self.pop(frame)?;
                    self.incref(v);
                    frame.stack.push(v);
                    frame.stack.push(v);
                }
                Op::RotTwo => {
                    let a = self.pop(frame)?;
                    let b = self.pop(frame)?;
                    frame.stack.push(a);
                    frame.stack.push(b);
                }
                Op::LoadConst(i) => {
                    let code = Arc::clone(&frame.code);
                    let v = self.box_const(&code.consts[i as usize]);
                    frame.stack.push(v);
                }
                Op::LoadFast(i) => {
                    let v = frame.locals[i as usize];
                    if v.is_null() {
                        let name = frame.code.local_names[i as usize];
                        return Err(self.unbound_local(name));
                    }
                    self.incref(v);
                    frame.stack.push(v);
                }
                Op::StoreFast(i) => {
                    let v = self.pop(frame)?;
                    let old = std::mem::replace(&mut frame.locals[i as usize], v);
                    self.decref(old);
                }
                Op::LoadDeref(i) => {
                    let cell = frame.cells[i as usize];
                    let v = match self.heap.get(cell) {
                        Object::Cell(v) => *v,
                        _ => ObjRef::NULL,
                    };
                    if v.is_null() {
                        return Err(self.unbound_deref(&frame.code, i as usize));
                    }
                    self.incref(v);
                    frame.stack.push(v);
                }
                Op::StoreDeref(i) => {
                    let v = self.pop(frame)?;
                    let cell = frame.cells[i as usize];
                    let old = match self.heap.get_mut(cell) {
                        Object::Cell(slot) => std::mem::replace(slot, v),
                        _ => v,
                    };
                    self.decref(old);
                }
                Op::LoadClosure(i) => {
                    let cell = frame.cells[i as usize];
                    self.incref(cell);
                    frame.stack.push(cell);
                }
                Op::LoadGlobal(i) => {
                    let name = frame.code.names[i as usize];
                    let r = self.load_global(frame.globals, frame.builtins, name);
                    Self::push_result(frame, r)?;
                }
                Op::StoreGlobal(i) => {
                    let name = frame.code.names[i as usize];
                    let v = self.pop(frame)?;
                    self.store_global_owned(frame.globals, name, v);
                }
                Op::LoadAttr(i) => {
                    let name = frame.code.names[i as usize];
                    let obj = self.pop(frame)?;
                    let r = self.get_attr(obj, name);
                    self.decref(obj);
                    Self::push_result(frame, r)?;
                }
                Op::StoreAttr(i) => {
                    let name = frame.code.names[i as usize];
                    let obj = self.pop(frame)?;
                    let value = self.pop(frame)?;
                    let r = self.set_attr(obj, name, value);
                    self.decref(obj);
                    self.decref(value);
                    r?;
                }
                Op::LoadMethod(i) => {
                    let name = frame.code.names[i as usize];
                    let obj = self.pop(frame)?;
                    let r = self.load_method(obj, name);
                    self.decref(obj);
                    let (callable, self_or_null) = r?;
                    frame.stack.push(callable);
                    frame.stack.push(self_or_null);
                }
                Op::CallMethod(n) => {
                    let args = self.pop_n(frame, n as usize)?;
                    let self_or_null = self.pop(frame)?;
                    let callable = self.pop(frame)?;
                    let r = if self_or_null.is_null() {
                        self.call(callable, &args)
                    } else {
                        let mut full = Vec::with_capacity(args.len() + 1);
                        full.push(self_or_null);
                        full.extend_from_slice(&args);
                        self.call(callable, &full)
                    };
                    self.decref_all(args);
                    self.decref(self_or_null);
                    self.decref(callable);
                    Self::push_result(frame, r)?;
                }
                Op::CallFunction(n) => {
                    let args = self.pop_n(frame, n as usize)?;
                    let callable = self.pop(frame)?;
                    let r = self.call(callable, &args);
                    self.decref_all(args);
                    self.decref(callable);
                    Self::push_result(frame, r)?;
                }
                Op::BinaryOp(bop) => {
                    let b = self.pop(frame)?;
                    let a = self.pop(frame)?;
                    let r = self.binary_op(bop, a, b);
                    self.decref(a);
                    self.decref(b);
                    Self::push_result(frame, r)?;
                }
                Op::CompareOp(cop) => {
                    let b = self.pop(frame)?;
                    let a = self.pop(frame)?;
                    let r = self.compare(cop, a, b);
                    self.decref(a);
                    self.decref(b);
                    Self::push_result(frame, r)?;
                }
                Op::UnaryNot => {
                    let v = self.pop(frame)?;
                    let r = self.unary_not(v);
                    self.decref(v);
                    Self::push_result(frame, r)?;
                }
                Op::UnaryNegative => {
                    let v = self.pop(frame)?;
                    let r = self.unary_negative(v);
                    self.decref(v);
                    Self::push_result(frame, r)?;
                }
                Op::BinarySubscr => {
                    let index = self.pop(frame)?;
                    let container = self.pop(frame)?;
                    let r = self.subscript(container, index);
                    self.decref(index);
                    self.decref(container);
                    Self::push_result(frame, r)?;
                }
                Op::BuildTuple(n) => {
                    let items = self.pop_n(frame, n as usize)?;
                    let t = self.new_tuple(items);
                    frame.stack.push(t);
                }
                Op::BuildList(n) => {
                    let items = self.pop_n(frame, n as usize)?;
                    let l = self.new_list(items);
                    frame.stack.push(l);
                }
                Op::MakeFunction => {
                    let closure = self.pop(frame)?;
                    let code_obj = self.pop(frame)?;
                    let r = self.make_function(frame.globals, code_obj, closure);
                    self.decref(closure);
                    self.decref(code_obj);
                    Self::push_result(frame, r)?;
                }
                Op::JumpAbsolute(target) => frame.pc = target as usize,
                Op::PopJumpIfFalse(target) | Op::PopJumpIfTrue(target) => {
                    let v = self.pop(frame)?;
                    let truth = self.is_truthy(v);
                    self.decref(v);
                    if truth? == matches!(op, Op::PopJumpIfTrue(_)) {
                        frame.pc = target as usize;
                    }
                }
                Op::ReturnValue => return self.pop(frame),
                Op::RaiseVarargs => {
                    let exc = self.pop(frame)?;
                    if self.kind_of(exc) == ObjKind::Exception {
                        return Err(self.raise_object(exc));
                    }
                    self.decref(exc);
                    return Err(self.raise(
                        ExcKind::TypeError,
                        "exceptions must derive from BaseException",
                    ));
                }
                Op::YieldValue => {
                    return Err(self.raise(ExcKind::RuntimeError, "generators are not supported"));
                }
            }
        }
    }

    /// The exception for reading an empty cell or free variable.
    pub fn unbound_deref(&mut self, code: &CodeUnit, index: usize) -> Raised {
        if index < code.cellvars.len() {
            self.unbound_local(code.cellvars[index])
        } else {
            self.unbound_free(code.freevars[index - code.cellvars.len()])
        }
    }

    pub fn unbound_local(&mut self, name: Name) -> Raised {
        self.raise(
            ExcKind::UnboundLocalError,
            format!("local variable '{name}' referenced before assignment"),
        )
    }

    pub fn unbound_free(&mut self, name: Name) -> Raised {
        self.raise(
            ExcKind::NameError,
            format!("free variable '{name}' referenced before assignment in enclosing scope"),
        )
    }

    /// Call a function with primitive arguments and result passed as raw
    /// machine words, following its code's annotations. Compiled targets
    /// are entered through their statically-typed entry point.
    pub fn call_static(&mut self, func: ObjRef, args: &[u64]) -> RtResult<u64> {
        let Some(code) = self.func_code(func) else {
            return Err(self.raise(ExcKind::TypeError, "not a function"));
        };
        if let (Some(hook), Some(entry)) = (self.hook(), self.jit_state(func).active_entry()) {
            if self.depth >= MAX_CALL_DEPTH {
                return Err(self.raise(ExcKind::RecursionError, "maximum recursion depth exceeded"));
            }
            self.depth += 1;
            let result = hook.invoke_static(self, func, entry, args);
            self.depth -= 1;
            return result;
        }
        let boxed: Vec<ObjRef> = args
            .iter()
            .zip(code.arg_types.iter().chain(std::iter::repeat(&ArgAnnotation::Object)))
            .map(|(&word, &ann)| self.box_word(word, ann))
            .collect();
        let result = self.call_function(func, &boxed);
        self.decref_all(boxed);
        let value = result?;
        let word = self.unbox_word(value, code.return_type);
        self.decref(value);
        word
    }

    /// A new reference for `word` interpreted per `ann`.
    pub fn box_word(&mut self, word: u64, ann: ArgAnnotation) -> ObjRef {
        match ann {
            ArgAnnotation::Int64 => self.new_int(word as i64),
            ArgAnnotation::Float64 => self.new_float(f64::from_bits(word)),
            _ => {
                let obj = ObjRef::from_word(word);
                self.incref(obj);
                obj
            }
        }
    }

    /// The machine word for `value` (borrowed) interpreted per `ann`.
    pub fn unbox_word(&mut self, value: ObjRef, ann: ArgAnnotation) -> RtResult<u64> {
        match ann {
            ArgAnnotation::Int64 => match self.int_value(value) {
                Some(v) => Ok(v as u64),
                None => Err(self.raise(ExcKind::TypeError, "expected a primitive int64 result")),
            },
            ArgAnnotation::Float64 => match self.float_value(value) {
                Some(v) => Ok(v.to_bits()),
                None => Err(self.raise(ExcKind::TypeError, "expected a primitive float64 result")),
            },
            _ => {
                self.incref(value);
                Ok(value.to_word())
            }
        }
    }

    fn make_function(&mut self, globals: ObjRef, code_obj: ObjRef, closure: ObjRef) -> RtResult<ObjRef> {
        let Some(code) = self.code_unit(code_obj) else {
            return Err(self.raise(ExcKind::TypeError, "MakeFunction expects a code object"));
        };
        let cells = match self.heap.get(closure) {
            Object::Tuple(items) => items.clone(),
            _ => Vec::new(),
        };
        if cells.len() != code.freevars.len() {
            return Err(self.raise(ExcKind::TypeError, "closure size mismatch"));
        }
        for &c in &cells {
            self.incref(c);
        }
        Ok(self.new_function_with(code, globals, Vec::new(), cells))
    }
}
