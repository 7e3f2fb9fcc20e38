//! Generic object operations shared by the interpreter and JIT helpers.
//!
//! Every operation borrows its operands and returns a new reference.
//! Operations that may run user code (dunder methods, `__init__`, lazy
//! globals) are marked as such in their docs; the JIT models exactly these
//! as having arbitrary execution.

use std::cmp::Ordering;
use std::sync::Arc;

use crate::builtins::{self, MethodKind};
use crate::code::{BinOp, CmpOp, ConstValue};
use crate::exception::{ExcKind, RtResult};
use crate::intern::Name;
use crate::object::{ObjKind, ObjRef, Object};
use crate::runtime::Runtime;

/// Result of numeric arithmetic before boxing.
#[derive(Copy, Clone, PartialEq, Debug)]
pub enum Num {
    Int(i64),
    Float(f64),
}

/// Integer arithmetic with floor-division semantics. Overflow raises.
pub fn int_arith(op: BinOp, a: i64, b: i64) -> Result<Num, (ExcKind, &'static str)> {
    let overflow = (ExcKind::OverflowError, "integer overflow");
    match op {
        BinOp::Add => a.checked_add(b).map(Num::Int).ok_or(overflow),
        BinOp::Sub => a.checked_sub(b).map(Num::Int).ok_or(overflow),
        BinOp::Mul => a.checked_mul(b).map(Num::Int).ok_or(overflow),
        BinOp::FloorDiv => {
            if b == 0 {
                return Err((ExcKind::ZeroDivisionError, "integer division or modulo by zero"));
            }
            let q = a.checked_div(b).ok_or(overflow)?;
            let adjust = a % b != 0 && ((a < 0) != (b < 0));
            Ok(Num::Int(if adjust { q - 1 } else { q }))
        }
        BinOp::Mod => {
            if b == 0 {
                return Err((ExcKind::ZeroDivisionError, "integer division or modulo by zero"));
            }
            let r = a.checked_rem(b).ok_or(overflow)?;
            Ok(Num::Int(if r != 0 && ((r < 0) != (b < 0)) { r + b } else { r }))
        }
        BinOp::TrueDiv => {
            if b == 0 {
                return Err((ExcKind::ZeroDivisionError, "division by zero"));
            }
            Ok(Num::Float(a as f64 / b as f64))
        }
    }
}

pub fn float_arith(op: BinOp, a: f64, b: f64) -> Result<f64, (ExcKind, &'static str)> {
    match op {
        BinOp::Add => Ok(a + b),
        BinOp::Sub => Ok(a - b),
        BinOp::Mul => Ok(a * b),
        BinOp::TrueDiv | BinOp::FloorDiv | BinOp::Mod if b == 0.0 => {
            Err((ExcKind::ZeroDivisionError, "float division by zero"))
        }
        BinOp::TrueDiv => Ok(a / b),
        BinOp::FloorDiv => Ok((a / b).floor()),
        BinOp::Mod => Ok(a - b * (a / b).floor()),
    }
}

impl Runtime {
    // ── Value views ────────────────────────────────────────────────

    pub fn int_value(&self, obj: ObjRef) -> Option<i64> {
        match self.heap.get(obj) {
            Object::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn float_value(&self, obj: ObjRef) -> Option<f64> {
        match self.heap.get(obj) {
            Object::Float(x) => Some(*x),
            _ => None,
        }
    }

    pub fn str_value(&self, obj: ObjRef) -> Option<Arc<str>> {
        match self.heap.get(obj) {
            Object::Str(s) => Some(Arc::clone(s)),
            _ => None,
        }
    }

    fn number(&self, obj: ObjRef) -> Option<Num> {
        match self.heap.get(obj) {
            Object::Int(i) => Some(Num::Int(*i)),
            Object::Bool(b) => Some(Num::Int(i64::from(*b))),
            Object::Float(x) => Some(Num::Float(*x)),
            _ => None,
        }
    }

    /// Human-readable rendering (no user code runs).
    pub fn display(&self, obj: ObjRef) -> String {
        if obj.is_null() {
            return "<null>".to_owned();
        }
        match self.heap.get(obj) {
            Object::None => "None".to_owned(),
            Object::Bool(true) => "True".to_owned(),
            Object::Bool(false) => "False".to_owned(),
            Object::Int(i) => i.to_string(),
            Object::Float(x) => format!("{x:?}"),
            Object::Str(s) => s.to_string(),
            Object::Tuple(items) => {
                let parts: Vec<String> = items.iter().map(|&i| self.repr(i)).collect();
                if parts.len() == 1 {
                    format!("({},)", parts[0])
                } else {
                    format!("({})", parts.join(", "))
                }
            }
            Object::List(items) => {
                let parts: Vec<String> = items.iter().map(|&i| self.repr(i)).collect();
                format!("[{}]", parts.join(", "))
            }
            Object::Function(f) => format!("<function {}>", f.name),
            Object::Code(c) => format!("<code {}>", c.name),
            Object::Type(t) => format!("<class '{}'>", t.name),
            Object::Instance(inst) => {
                let name = self.type_obj(inst.class).map_or(Name::EMPTY, |t| t.name);
                format!("<{name} object>")
            }
            Object::BuiltinFunction(id) => format!("<built-in function {}>", builtins::function(*id).name),
            Object::BuiltinMethod(id) => format!("<method '{}'>", builtins::method(*id).name),
            Object::BoundMethod { .. } => "<bound method>".to_owned(),
            Object::Exception(e) => format!("{}: {}", e.kind, e.message),
            Object::Cell(_) => "<cell>".to_owned(),
            Object::Namespace(ns) => format!("<namespace {}>", ns.name),
            Object::LazyValue { .. } => "<lazy>".to_owned(),
        }
    }

    /// Like [`display`](Self::display) but quotes strings.
    pub fn repr(&self, obj: ObjRef) -> String {
        match self.heap.get(obj) {
            Object::Str(s) => format!("{s:?}"),
            _ => self.display(obj),
        }
    }

    /// Allocate the object for a constant.
    pub fn box_const(&mut self, value: &ConstValue) -> ObjRef {
        match value {
            ConstValue::None => self.none(),
            ConstValue::Bool(b) => self.bool_obj(*b),
            ConstValue::Int(i) => self.new_int(*i),
            ConstValue::Float(x) => self.new_float(*x),
            ConstValue::Str(s) => self.heap.alloc(Object::Str(Arc::clone(s))),
            ConstValue::Tuple(items) => {
                let refs = items.iter().map(|c| self.box_const(c)).collect();
                self.new_tuple(refs)
            }
            ConstValue::Code(code) => self.new_code_object(Arc::clone(code)),
        }
    }

    fn box_num(&mut self, n: Num) -> ObjRef {
        match n {
            Num::Int(i) => self.new_int(i),
            Num::Float(x) => self.new_float(x),
        }
    }

    // ── Arithmetic and comparison ─────────────────────────────────

    /// `a <op> b`. May run user code through dunder methods.
    pub fn binary_op(&mut self, op: BinOp, a: ObjRef, b: ObjRef) -> RtResult<ObjRef> {
        if let (Some(x), Some(y)) = (self.number(a), self.number(b)) {
            let result = match (x, y) {
                (Num::Int(x), Num::Int(y)) => int_arith(op, x, y),
                (Num::Int(x), Num::Float(y)) => float_arith(op, x as f64, y).map(Num::Float),
                (Num::Float(x), Num::Int(y)) => float_arith(op, x, y as f64).map(Num::Float),
                (Num::Float(x), Num::Float(y)) => float_arith(op, x, y).map(Num::Float),
            };
            return match result {
                Ok(n) => Ok(self.box_num(n)),
                Err((kind, msg)) => Err(self.raise(kind, msg)),
            };
        }

        let sequence = match (self.heap.get(a), self.heap.get(b), op) {
            (Object::Str(x), Object::Str(y), BinOp::Add) => {
                Some(Object::Str(Arc::from(format!("{x}{y}").as_str())))
            }
            (Object::Str(x), Object::Int(n), BinOp::Mul) => {
                Some(Object::Str(Arc::from(x.repeat(usize::try_from(*n).unwrap_or(0)).as_str())))
            }
            (Object::Tuple(x), Object::Tuple(y), BinOp::Add) => {
                Some(Object::Tuple(x.iter().chain(y.iter()).copied().collect()))
            }
            (Object::List(x), Object::List(y), BinOp::Add) => {
                Some(Object::List(x.iter().chain(y.iter()).copied().collect()))
            }
            _ => None,
        };
        if let Some(obj) = sequence {
            if let Object::Tuple(items) | Object::List(items) = &obj {
                for &item in items {
                    self.heap.incref(item);
                }
            }
            return Ok(self.heap.alloc(obj));
        }

        if let Some(method) = self.class_attr_of_instance(a, Name::new(op.dunder())) {
            return self.call(method, &[a, b]);
        }
        let (ta, tb) = (self.type_name_of(a), self.type_name_of(b));
        Err(self.raise(
            ExcKind::TypeError,
            format!(
                "unsupported operand type(s) for {}: '{ta}' and '{tb}'",
                op.symbol()
            ),
        ))
    }

    /// `a <op> b` as a boxed bool (or whatever a dunder returns).
    pub fn compare(&mut self, op: CmpOp, a: ObjRef, b: ObjRef) -> RtResult<ObjRef> {
        if let Some(dunder) = op.dunder() {
            if let Some(method) = self.class_attr_of_instance(a, Name::new(dunder)) {
                return self.call(method, &[a, b]);
            }
        }
        let result = self.compare_bool(op, a, b)?;
        Ok(self.bool_obj(result))
    }

    /// `a <op> b` reduced to a truth value.
    pub fn compare_bool(&mut self, op: CmpOp, a: ObjRef, b: ObjRef) -> RtResult<bool> {
        match op {
            CmpOp::Is => return Ok(a == b),
            CmpOp::IsNot => return Ok(a != b),
            _ => {}
        }
        if let Some(dunder) = op.dunder() {
            if let Some(method) = self.class_attr_of_instance(a, Name::new(dunder)) {
                let r = self.call(method, &[a, b])?;
                let truth = self.is_truthy(r);
                self.decref(r);
                return truth;
            }
        }
        if matches!(op, CmpOp::Eq | CmpOp::Ne) {
            let eq = self.equals(a, b)?;
            return Ok(if op == CmpOp::Eq { eq } else { !eq });
        }
        match self.order(a, b)? {
            Some(ord) => Ok(op.eval_ord(ord)),
            None => {
                let (ta, tb) = (self.type_name_of(a), self.type_name_of(b));
                Err(self.raise(
                    ExcKind::TypeError,
                    format!(
                        "'{}' not supported between instances of '{ta}' and '{tb}'",
                        op.symbol()
                    ),
                ))
            }
        }
    }

    /// Structural equality for builtin values, identity otherwise.
    pub fn equals(&mut self, a: ObjRef, b: ObjRef) -> RtResult<bool> {
        if a == b {
            return Ok(true);
        }
        if let (Some(x), Some(y)) = (self.number(a), self.number(b)) {
            return Ok(match (x, y) {
                (Num::Int(x), Num::Int(y)) => x == y,
                (Num::Int(x), Num::Float(y)) | (Num::Float(y), Num::Int(x)) => (x as f64) == y,
                (Num::Float(x), Num::Float(y)) => x == y,
            });
        }
        let pairs = match (self.heap.get(a), self.heap.get(b)) {
            (Object::Str(x), Object::Str(y)) => return Ok(x == y),
            (Object::None, Object::None) => return Ok(true),
            (Object::Tuple(x), Object::Tuple(y)) | (Object::List(x), Object::List(y)) => {
                if x.len() != y.len() {
                    return Ok(false);
                }
                x.iter().copied().zip(y.iter().copied()).collect::<Vec<_>>()
            }
            _ => return Ok(false),
        };
        for (x, y) in pairs {
            if !self.equals(x, y)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn order(&mut self, a: ObjRef, b: ObjRef) -> RtResult<Option<Ordering>> {
        if let (Some(x), Some(y)) = (self.number(a), self.number(b)) {
            return Ok(match (x, y) {
                (Num::Int(x), Num::Int(y)) => Some(x.cmp(&y)),
                (Num::Int(x), Num::Float(y)) => (x as f64).partial_cmp(&y),
                (Num::Float(x), Num::Int(y)) => x.partial_cmp(&(y as f64)),
                (Num::Float(x), Num::Float(y)) => x.partial_cmp(&y),
            });
        }
        let pairs = match (self.heap.get(a), self.heap.get(b)) {
            (Object::Str(x), Object::Str(y)) => return Ok(Some(x.cmp(y))),
            (Object::Tuple(x), Object::Tuple(y)) | (Object::List(x), Object::List(y)) => {
                let pairs: Vec<_> = x.iter().copied().zip(y.iter().copied()).collect();
                (pairs, x.len().cmp(&y.len()))
            }
            _ => return Ok(None),
        };
        let (pairs, len_order) = pairs;
        for (x, y) in pairs {
            if !self.equals(x, y)? {
                return self.order(x, y);
            }
        }
        Ok(Some(len_order))
    }

    /// Truth value. May run a user `__bool__`.
    pub fn is_truthy(&mut self, obj: ObjRef) -> RtResult<bool> {
        match self.heap.get(obj) {
            Object::None => Ok(false),
            Object::Bool(b) => Ok(*b),
            Object::Int(i) => Ok(*i != 0),
            Object::Float(x) => Ok(*x != 0.0),
            Object::Str(s) => Ok(!s.is_empty()),
            Object::Tuple(items) | Object::List(items) => Ok(!items.is_empty()),
            Object::Instance(_) => match self.class_attr_of_instance(obj, Name::new("__bool__")) {
                Some(method) => {
                    let r = self.call(method, &[obj])?;
                    let b = matches!(self.heap.get(r), Object::Bool(true));
                    self.decref(r);
                    Ok(b)
                }
                None => Ok(true),
            },
            _ => Ok(true),
        }
    }

    pub fn unary_not(&mut self, obj: ObjRef) -> RtResult<ObjRef> {
        let truth = self.is_truthy(obj)?;
        Ok(self.bool_obj(!truth))
    }

    pub fn unary_negative(&mut self, obj: ObjRef) -> RtResult<ObjRef> {
        match self.number(obj) {
            Some(Num::Int(i)) => match i.checked_neg() {
                Some(v) => Ok(self.new_int(v)),
                None => Err(self.raise(ExcKind::OverflowError, "integer overflow")),
            },
            Some(Num::Float(x)) => Ok(self.new_float(-x)),
            None => {
                let tname = self.type_name_of(obj);
                Err(self.raise(
                    ExcKind::TypeError,
                    format!("bad operand type for unary -: '{tname}'"),
                ))
            }
        }
    }

    /// `container[index]`.
    pub fn subscript(&mut self, container: ObjRef, index: ObjRef) -> RtResult<ObjRef> {
        let Some(i) = self.int_value(index) else {
            let tname = self.type_name_of(index);
            return Err(self.raise(
                ExcKind::TypeError,
                format!("indices must be integers, not {tname}"),
            ));
        };
        let found = match self.heap.get(container) {
            Object::Tuple(items) | Object::List(items) => {
                normalize_index(i, items.len()).map(|idx| Ok(items[idx]))
            }
            Object::Str(s) => {
                let chars: Vec<char> = s.chars().collect();
                normalize_index(i, chars.len()).map(|idx| Err(chars[idx]))
            }
            _ => {
                let tname = self.type_name_of(container);
                return Err(self.raise(
                    ExcKind::TypeError,
                    format!("'{tname}' object is not subscriptable"),
                ));
            }
        };
        match found {
            Some(Ok(item)) => {
                self.incref(item);
                Ok(item)
            }
            Some(Err(ch)) => Ok(self.new_str(&ch.to_string())),
            None => Err(self.raise(ExcKind::IndexError, "index out of range")),
        }
    }

    // ── Attributes ─────────────────────────────────────────────────

    /// A class attribute found through an instance's class (borrowed).
    fn class_attr_of_instance(&self, obj: ObjRef, name: Name) -> Option<ObjRef> {
        match self.heap.get(obj) {
            Object::Instance(inst) => self.type_obj(inst.class)?.attr(name),
            _ => None,
        }
    }

    pub fn attribute_error(&mut self, obj: ObjRef, name: Name) -> crate::exception::Raised {
        let tname = self.type_name_of(obj);
        self.raise(
            ExcKind::AttributeError,
            format!("'{tname}' object has no attribute '{name}'"),
        )
    }

    fn new_bound_method(&mut self, func: ObjRef, receiver: ObjRef) -> ObjRef {
        self.incref(func);
        self.incref(receiver);
        self.heap.alloc(Object::BoundMethod { func, receiver })
    }

    /// `obj.name`.
    pub fn get_attr(&mut self, obj: ObjRef, name: Name) -> RtResult<ObjRef> {
        match self.heap.get(obj) {
            Object::Instance(inst) => {
                let class = inst.class;
                if let Some(idx) = self.type_obj(class).and_then(|t| t.slot_index(name)) {
                    let value = match self.heap.get(obj) {
                        Object::Instance(inst) => inst.fields[idx],
                        _ => ObjRef::NULL,
                    };
                    if value.is_null() {
                        return Err(self.attribute_error(obj, name));
                    }
                    self.incref(value);
                    return Ok(value);
                }
                match self.type_obj(class).and_then(|t| t.attr(name)) {
                    Some(attr) if self.kind_of(attr) == ObjKind::Function => {
                        Ok(self.new_bound_method(attr, obj))
                    }
                    Some(attr) => {
                        self.incref(attr);
                        Ok(attr)
                    }
                    None => Err(self.attribute_error(obj, name)),
                }
            }
            Object::Type(t) => {
                if let Some(attr) = t.attr(name) {
                    self.incref(attr);
                    return Ok(attr);
                }
                let builtin = t.builtin;
                match builtin.and_then(|k| builtins::lookup_method(k, name.as_str())) {
                    Some(id) => {
                        let m = self.method_object(id);
                        if builtins::method(id).kind == MethodKind::Class {
                            Ok(self.new_bound_method(m, obj))
                        } else {
                            Ok(m)
                        }
                    }
                    None => Err(self.attribute_error(obj, name)),
                }
            }
            other => {
                let kind = other.kind();
                match builtins::lookup_method(kind, name.as_str()) {
                    Some(id) => {
                        let m = self.method_object(id);
                        match builtins::method(id).kind {
                            MethodKind::Instance => Ok(self.new_bound_method(m, obj)),
                            MethodKind::Class => {
                                let ty = self.type_object(kind);
                                Ok(self.new_bound_method(m, ty))
                            }
                            MethodKind::Static => Ok(m),
                        }
                    }
                    None => Err(self.attribute_error(obj, name)),
                }
            }
        }
    }

    /// `obj.name = value` (`value` borrowed). Assigning to a user class
    /// bumps its version and notifies watchers.
    pub fn set_attr(&mut self, obj: ObjRef, name: Name, value: ObjRef) -> RtResult<()> {
        match self.heap.get(obj) {
            Object::Instance(inst) => {
                let class = inst.class;
                let Some(idx) = self.type_obj(class).and_then(|t| t.slot_index(name)) else {
                    return Err(self.attribute_error(obj, name));
                };
                self.incref(value);
                let old = match self.heap.get_mut(obj) {
                    Object::Instance(inst) => std::mem::replace(&mut inst.fields[idx], value),
                    _ => ObjRef::NULL,
                };
                self.decref(old);
                Ok(())
            }
            Object::Type(_) => {
                self.incref(value);
                self.store_class_attr(obj, name, value)
            }
            _ => Err(self.attribute_error(obj, name)),
        }
    }

    /// Method lookup for `obj.name(...)`: `(callable, self_or_null)`, both
    /// owned. `self_or_null` is non-null when `callable` expects the
    /// receiver as its first argument.
    pub fn load_method(&mut self, obj: ObjRef, name: Name) -> RtResult<(ObjRef, ObjRef)> {
        match self.heap.get(obj) {
            Object::Instance(inst) => {
                let class = inst.class;
                let has_slot = self.type_obj(class).and_then(|t| t.slot_index(name)).is_some();
                if !has_slot {
                    if let Some(attr) = self.type_obj(class).and_then(|t| t.attr(name)) {
                        if self.kind_of(attr) == ObjKind::Function {
                            self.incref(attr);
                            self.incref(obj);
                            return Ok((attr, obj));
                        }
                    }
                }
            }
            Object::Type(_) => {}
            other => {
                if let Some(id) = builtins::lookup_method(other.kind(), name.as_str()) {
                    if builtins::method(id).kind == MethodKind::Instance {
                        let m = self.method_object(id);
                        self.incref(obj);
                        return Ok((m, obj));
                    }
                }
            }
        }
        let attr = self.get_attr(obj, name)?;
        Ok((attr, ObjRef::NULL))
    }

    // ── Globals ────────────────────────────────────────────────────

    /// Look `name` up in `globals`, then `builtins`. Lazy globals are
    /// forced, which runs user code.
    pub fn load_global(&mut self, globals: ObjRef, builtins: ObjRef, name: Name) -> RtResult<ObjRef> {
        let value = self
            .namespace(globals)
            .and_then(|ns| ns.get(name))
            .or_else(|| self.namespace(builtins).and_then(|ns| ns.get(name)));
        let Some(value) = value else {
            return Err(self.raise(
                ExcKind::NameError,
                format!("name '{name}' is not defined"),
            ));
        };
        if let Object::LazyValue { thunk } = self.heap.get(value) {
            let thunk = *thunk;
            return self.force_lazy(globals, name, thunk);
        }
        self.incref(value);
        Ok(value)
    }

    /// Replace a lazy global with the result of calling its thunk.
    pub fn force_lazy(&mut self, ns: ObjRef, name: Name, thunk: ObjRef) -> RtResult<ObjRef> {
        self.incref(thunk);
        let result = self.call(thunk, &[]);
        self.decref(thunk);
        let value = result?;
        self.incref(value);
        self.store_global_owned(ns, name, value);
        Ok(value)
    }
}

fn normalize_index(i: i64, len: usize) -> Option<usize> {
    let len = i64::try_from(len).ok()?;
    let idx = if i < 0 { i + len } else { i };
    if (0..len).contains(&idx) {
        usize::try_from(idx).ok()
    } else {
        None
    }
}
