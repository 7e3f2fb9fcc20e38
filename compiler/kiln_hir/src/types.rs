//! The HIR type lattice.
//!
//! A [`Type`] is a set of [`TypeBits`] (object kinds, unboxed primitives,
//! and the null pointer) plus an optional [`TypeSpec`] narrowing it to a
//! single value or an exact user class. Object bits coincide with
//! [`ObjKind::bit`], so generated code can test an object against a type's
//! object bits directly.
//!
//! # Lattice
//!
//! - `a <= b` iff `a.bits ⊆ b.bits` and `b.spec` is `Top` or equals `a.spec`.
//! - `a | b` joins bits and keeps the specialization only when both agree.
//! - `a & b` meets bits; conflicting specs meet to `BOTTOM`.

use std::fmt;

use bitflags::bitflags;
use kiln_rt::{ArgAnnotation, ConstValue, ObjKind, ObjRef};

bitflags! {
    #[derive(Copy, Clone, PartialEq, Eq, Hash, Debug, Default)]
    pub struct TypeBits: u32 {
        const NONE_TYPE = ObjKind::None.bit();
        const BOOL = ObjKind::Bool.bit();
        const LONG = ObjKind::Int.bit();
        const FLOAT = ObjKind::Float.bit();
        const STR = ObjKind::Str.bit();
        const TUPLE = ObjKind::Tuple.bit();
        const LIST = ObjKind::List.bit();
        const FUNC = ObjKind::Function.bit();
        const CODE = ObjKind::Code.bit();
        const TYPE = ObjKind::Type.bit();
        const BUILTIN = ObjKind::Builtin.bit();
        const BOUND_METHOD = ObjKind::BoundMethod.bit();
        const EXCEPTION = ObjKind::Exception.bit();
        const CELL = ObjKind::Cell.bit();
        const USER = ObjKind::Instance.bit();
        const OTHER_OBJECT = ObjKind::Other.bit();
        const OBJECT = 0xFFFF;

        const CINT64 = 1 << 16;
        const CDOUBLE = 1 << 17;
        const CBOOL = 1 << 18;
        const PRIMITIVE = Self::CINT64.bits() | Self::CDOUBLE.bits() | Self::CBOOL.bits();

        const NULLPTR = 1 << 19;
    }
}

impl TypeBits {
    /// Object kinds whose instances are immortal singletons.
    pub const IMMORTAL: TypeBits = TypeBits::NONE_TYPE.union(TypeBits::BOOL);
}

/// A single-value or exact-class refinement.
#[derive(Copy, Clone, PartialEq, Debug, Default)]
pub enum TypeSpec {
    #[default]
    Top,
    /// A specific runtime object.
    Object(ObjRef),
    /// An int object or `CInt64` with this value.
    Int(i64),
    /// A float object or `CDouble` with this value.
    Double(f64),
    /// A bool object or `CBool` with this value.
    Bool(bool),
    /// An instance of exactly this user class.
    ExactClass(ObjRef),
}

impl Eq for TypeSpec {}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct Type {
    pub bits: TypeBits,
    pub spec: TypeSpec,
}

impl Default for Type {
    fn default() -> Self {
        Type::TOP
    }
}

impl Type {
    pub const fn new(bits: TypeBits) -> Type {
        Type {
            bits,
            spec: TypeSpec::Top,
        }
    }

    pub const BOTTOM: Type = Type::new(TypeBits::empty());
    pub const TOP: Type = Type::new(TypeBits::all());
    pub const OBJECT: Type = Type::new(TypeBits::OBJECT);
    pub const OPT_OBJECT: Type = Type::new(TypeBits::OBJECT.union(TypeBits::NULLPTR));
    pub const NULLPTR: Type = Type::new(TypeBits::NULLPTR);
    pub const NONE_TYPE: Type = Type::new(TypeBits::NONE_TYPE);
    pub const BOOL: Type = Type::new(TypeBits::BOOL);
    pub const LONG: Type = Type::new(TypeBits::LONG);
    pub const FLOAT: Type = Type::new(TypeBits::FLOAT);
    pub const STR: Type = Type::new(TypeBits::STR);
    pub const TUPLE: Type = Type::new(TypeBits::TUPLE);
    pub const LIST: Type = Type::new(TypeBits::LIST);
    pub const FUNC: Type = Type::new(TypeBits::FUNC);
    pub const CODE: Type = Type::new(TypeBits::CODE);
    pub const TYPE_OBJ: Type = Type::new(TypeBits::TYPE);
    pub const USER: Type = Type::new(TypeBits::USER);
    pub const CINT64: Type = Type::new(TypeBits::CINT64);
    pub const CDOUBLE: Type = Type::new(TypeBits::CDOUBLE);
    pub const CBOOL: Type = Type::new(TypeBits::CBOOL);

    pub fn from_kind(kind: ObjKind) -> Type {
        Type::new(TypeBits::from_bits_truncate(kind.bit()))
    }

    pub fn long_const(v: i64) -> Type {
        Type {
            bits: TypeBits::LONG,
            spec: TypeSpec::Int(v),
        }
    }

    pub fn cint64_const(v: i64) -> Type {
        Type {
            bits: TypeBits::CINT64,
            spec: TypeSpec::Int(v),
        }
    }

    pub fn cbool_const(v: bool) -> Type {
        Type {
            bits: TypeBits::CBOOL,
            spec: TypeSpec::Bool(v),
        }
    }

    pub fn bool_const(v: bool) -> Type {
        Type {
            bits: TypeBits::BOOL,
            spec: TypeSpec::Bool(v),
        }
    }

    pub fn double_const(v: f64) -> Type {
        Type {
            bits: TypeBits::FLOAT,
            spec: TypeSpec::Double(v),
        }
    }

    /// Exactly `obj`, whose kind is `kind`.
    pub fn object_const(obj: ObjRef, kind: ObjKind) -> Type {
        Type {
            bits: TypeBits::from_bits_truncate(kind.bit()),
            spec: TypeSpec::Object(obj),
        }
    }

    pub fn exact_instance(class: ObjRef) -> Type {
        Type {
            bits: TypeBits::USER,
            spec: TypeSpec::ExactClass(class),
        }
    }

    /// The type of a code-unit constant once loaded.
    pub fn of_const(value: &ConstValue) -> Type {
        match value {
            ConstValue::None => Type::NONE_TYPE,
            ConstValue::Bool(b) => Type::bool_const(*b),
            ConstValue::Int(i) => Type::long_const(*i),
            ConstValue::Float(f) => Type::double_const(*f),
            other => Type::from_kind(other.kind()),
        }
    }

    /// The type a value annotated with `ann` has on entry. Class
    /// annotations need a resolved class; pass it as `class`.
    pub fn from_annotation(ann: ArgAnnotation, class: Option<ObjRef>) -> Type {
        match ann {
            ArgAnnotation::Object => Type::OBJECT,
            ArgAnnotation::Int64 => Type::CINT64,
            ArgAnnotation::Float64 => Type::CDOUBLE,
            ArgAnnotation::Kind(kind) => Type::from_kind(kind),
            ArgAnnotation::Class(_) => class.map_or(Type::USER, Type::exact_instance),
        }
    }

    #[inline]
    pub fn is_bottom(self) -> bool {
        self.bits.is_empty()
    }

    pub fn is_subtype(self, other: Type) -> bool {
        if self.is_bottom() {
            return true;
        }
        other.bits.contains(self.bits) && (other.spec == TypeSpec::Top || other.spec == self.spec)
    }

    /// Whether some value has both types.
    pub fn could_be(self, other: Type) -> bool {
        !(self & other).is_bottom()
    }

    pub fn has_spec(self) -> bool {
        self.spec != TypeSpec::Top
    }

    /// Drop the specialization, keeping only bits.
    pub fn unspecialized(self) -> Type {
        Type::new(self.bits)
    }

    /// Whether values of this type carry a counted reference.
    pub fn is_refcounted(self) -> bool {
        !(self.bits & TypeBits::OBJECT).difference(TypeBits::IMMORTAL).is_empty()
    }

    pub fn is_primitive(self) -> bool {
        !self.is_bottom() && TypeBits::PRIMITIVE.contains(self.bits)
    }

    /// May hold `NULL`.
    pub fn maybe_null(self) -> bool {
        self.bits.contains(TypeBits::NULLPTR)
    }

    /// This type with `NULL` excluded.
    pub fn without_null(self) -> Type {
        let bits = self.bits.difference(TypeBits::NULLPTR);
        if bits.is_empty() {
            return Type::BOTTOM;
        }
        Type {
            bits,
            spec: self.spec,
        }
    }

    pub fn int_const(self) -> Option<i64> {
        match self.spec {
            TypeSpec::Int(v) => Some(v),
            _ => None,
        }
    }

    pub fn bool_value(self) -> Option<bool> {
        match self.spec {
            TypeSpec::Bool(v) => Some(v),
            _ => None,
        }
    }

    pub fn object_spec(self) -> Option<ObjRef> {
        match self.spec {
            TypeSpec::Object(o) => Some(o),
            _ => None,
        }
    }

    pub fn exact_class(self) -> Option<ObjRef> {
        match self.spec {
            TypeSpec::ExactClass(c) => Some(c),
            _ => None,
        }
    }

    /// The single object kind this type admits, if exactly one.
    pub fn exact_kind(self) -> Option<ObjKind> {
        if self.bits.bits().count_ones() != 1 {
            return None;
        }
        ObjKind::ALL
            .iter()
            .copied()
            .find(|k| k.bit() == self.bits.bits())
    }
}

impl std::ops::BitOr for Type {
    type Output = Type;

    fn bitor(self, rhs: Type) -> Type {
        if self.is_bottom() {
            return rhs;
        }
        if rhs.is_bottom() {
            return self;
        }
        Type {
            bits: self.bits | rhs.bits,
            spec: if self.spec == rhs.spec {
                self.spec
            } else {
                TypeSpec::Top
            },
        }
    }
}

impl std::ops::BitAnd for Type {
    type Output = Type;

    fn bitand(self, rhs: Type) -> Type {
        let bits = self.bits & rhs.bits;
        if bits.is_empty() {
            return Type::BOTTOM;
        }
        let spec = match (self.spec, rhs.spec) {
            (TypeSpec::Top, s) | (s, TypeSpec::Top) => s,
            (a, b) if a == b => a,
            _ => return Type::BOTTOM,
        };
        Type { bits, spec }
    }
}

const NAMED: &[(TypeBits, &str)] = &[
    (TypeBits::all(), "Top"),
    (TypeBits::OBJECT.union(TypeBits::NULLPTR), "OptObject"),
    (TypeBits::OBJECT, "Object"),
    (TypeBits::NONE_TYPE, "NoneType"),
    (TypeBits::BOOL, "Bool"),
    (TypeBits::LONG, "Long"),
    (TypeBits::FLOAT, "Float"),
    (TypeBits::STR, "Str"),
    (TypeBits::TUPLE, "Tuple"),
    (TypeBits::LIST, "List"),
    (TypeBits::FUNC, "Func"),
    (TypeBits::CODE, "Code"),
    (TypeBits::TYPE, "Type"),
    (TypeBits::BUILTIN, "Builtin"),
    (TypeBits::BOUND_METHOD, "BoundMethod"),
    (TypeBits::EXCEPTION, "Exception"),
    (TypeBits::CELL, "Cell"),
    (TypeBits::USER, "User"),
    (TypeBits::OTHER_OBJECT, "OtherObject"),
    (TypeBits::CINT64, "CInt64"),
    (TypeBits::CDOUBLE, "CDouble"),
    (TypeBits::CBOOL, "CBool"),
    (TypeBits::NULLPTR, "Nullptr"),
];

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_bottom() {
            return f.write_str("Bottom");
        }
        let mut remaining = self.bits;
        let mut parts = Vec::new();
        for &(bits, name) in NAMED {
            if !remaining.is_empty() && remaining.contains(bits) {
                parts.push(name);
                remaining.remove(bits);
            }
        }
        f.write_str(&parts.join("|"))?;
        match self.spec {
            TypeSpec::Top => Ok(()),
            TypeSpec::Object(o) => write!(f, "[{o:?}]"),
            TypeSpec::Int(v) => write!(f, "[{v}]"),
            TypeSpec::Double(v) => write!(f, "[{v:?}]"),
            TypeSpec::Bool(v) => write!(f, "[{v}]"),
            TypeSpec::ExactClass(c) => write!(f, "[exact {c:?}]"),
        }
    }
}
