//! Tagged value model: the wire format for every fact exchanged with the engine.
//!
//! A [`Value`] owns its children. Building a composite moves the children in,
//! and handing the composite to a [`crate::Command`] moves the whole tree on,
//! so a value can never be freed twice or touched after it left the producer.
//!
//! Decoding code goes through the checked accessors (`as_*`, `into_*`) or
//! [`Ctor::fields`]; there is no unchecked cast.

use std::borrow::Cow;
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Variant tag of a [`Value`], used in error reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Tag {
    Null,
    Bool,
    Int,
    String,
    Tuple,
    Vector,
    Map,
    Set,
    Struct,
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Tag::Null => "null",
            Tag::Bool => "bool",
            Tag::Int => "int",
            Tag::String => "string",
            Tag::Tuple => "tuple",
            Tag::Vector => "vector",
            Tag::Map => "map",
            Tag::Set => "set",
            Tag::Struct => "struct",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValueError {
    #[error("wrong variant: expected {expected}, found {found}")]
    WrongVariant { expected: Tag, found: Tag },
    #[error("{width}-bit integer does not fit in {target}")]
    Narrowing { width: u8, target: &'static str },
    #[error("expected constructor {expected}, found {found}")]
    Constructor { expected: &'static str, found: String },
    #[error("unknown constructor {found} (expected one of {})", .expected.join(", "))]
    UnknownVariant { expected: &'static [&'static str], found: String },
    #[error("constructor {ctor} expects {expected} fields, found {found}")]
    Arity { ctor: String, expected: usize, found: usize },
}

/// Sign- and width-aware integer. Width is in bits, `1..=64`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Int {
    Signed { width: u8, value: i64 },
    Unsigned { width: u8, value: u64 },
}

impl Int {
    pub fn width(self) -> u8 {
        match self {
            Int::Signed { width, .. } | Int::Unsigned { width, .. } => width,
        }
    }

    pub fn is_signed(self) -> bool { matches!(self, Int::Signed { .. }) }

    /// Narrow to `T`; succeeds only when the stored value is representable.
    fn narrow<T>(self, target: &'static str) -> Result<T, ValueError>
    where
        T: TryFrom<i64> + TryFrom<u64>,
    {
        let width = self.width();
        let out = match self {
            Int::Signed { value, .. } => T::try_from(value).ok(),
            Int::Unsigned { value, .. } => T::try_from(value).ok(),
        };
        out.ok_or(ValueError::Narrowing { width, target })
    }

    pub fn to_u64(self) -> Result<u64, ValueError> { self.narrow("u64") }
    pub fn to_u32(self) -> Result<u32, ValueError> { self.narrow("u32") }
    pub fn to_u16(self) -> Result<u16, ValueError> { self.narrow("u16") }
    pub fn to_i64(self) -> Result<i64, ValueError> { self.narrow("i64") }
    pub fn to_i32(self) -> Result<i32, ValueError> { self.narrow("i32") }
}

impl fmt::Display for Int {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Int::Signed { value, .. } => write!(f, "{}", value),
            Int::Unsigned { value, .. } => write!(f, "{}", value),
        }
    }
}

/// Named struct: a constructor name plus positional fields.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Struct {
    pub name: Cow<'static, str>,
    pub fields: Vec<Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Value {
    Null,
    Bool(bool),
    Int(Int),
    String(String),
    Tuple(Vec<Value>),
    Vector(Vec<Value>),
    /// Insertion-ordered pairs; duplicate keys are kept as given.
    Map(Vec<(Value, Value)>),
    /// Insertion-ordered elements; the producer deduplicates.
    Set(Vec<Value>),
    Struct(Struct),
}

/// Payload of a two-armed `Left`/`Right` struct.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Either<L, R> {
    Left(L),
    Right(R),
}

/// Struct constructor descriptor: name and expected field count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Ctor {
    pub name: &'static str,
    pub arity: usize,
}

pub const SOME: Ctor = Ctor::new("Some", 1);
pub const NONE: Ctor = Ctor::new("None", 0);
pub const LEFT: Ctor = Ctor::new("Left", 1);
pub const RIGHT: Ctor = Ctor::new("Right", 1);

const OPTION_ARMS: &[&str] = &["Some", "None"];
const EITHER_ARMS: &[&str] = &["Left", "Right"];

impl Ctor {
    pub const fn new(name: &'static str, arity: usize) -> Self { Self { name, arity } }

    /// Build a struct value. A wrong field count is a caller bug.
    pub fn build(self, fields: Vec<Value>) -> Value {
        debug_assert_eq!(fields.len(), self.arity, "constructor {} arity mismatch", self.name);
        Value::Struct(Struct { name: Cow::Borrowed(self.name), fields })
    }

    /// Zero-arity struct, used for enum-like constructors.
    pub fn unit(self) -> Value { self.build(Vec::new()) }

    /// Checked decode: verify tag, constructor name and arity, then expose the fields.
    pub fn fields(self, v: &Value) -> Result<&[Value], ValueError> {
        let s = v.as_struct()?;
        if s.name != self.name {
            return Err(ValueError::Constructor { expected: self.name, found: s.name.to_string() });
        }
        if s.fields.len() != self.arity {
            return Err(ValueError::Arity { ctor: s.name.to_string(), expected: self.arity, found: s.fields.len() });
        }
        Ok(&s.fields)
    }
}

impl Value {
    pub fn tag(&self) -> Tag {
        match self {
            Value::Null => Tag::Null,
            Value::Bool(_) => Tag::Bool,
            Value::Int(_) => Tag::Int,
            Value::String(_) => Tag::String,
            Value::Tuple(_) => Tag::Tuple,
            Value::Vector(_) => Tag::Vector,
            Value::Map(_) => Tag::Map,
            Value::Set(_) => Tag::Set,
            Value::Struct(_) => Tag::Struct,
        }
    }

    fn wrong(&self, expected: Tag) -> ValueError { ValueError::WrongVariant { expected, found: self.tag() } }

    // ---- constructors ----

    pub fn u64(v: u64) -> Value { Value::Int(Int::Unsigned { width: 64, value: v }) }
    pub fn u32(v: u32) -> Value { Value::Int(Int::Unsigned { width: 32, value: v as u64 }) }
    pub fn u16(v: u16) -> Value { Value::Int(Int::Unsigned { width: 16, value: v as u64 }) }
    pub fn u8(v: u8) -> Value { Value::Int(Int::Unsigned { width: 8, value: v as u64 }) }
    pub fn i64(v: i64) -> Value { Value::Int(Int::Signed { width: 64, value: v }) }
    pub fn i32(v: i32) -> Value { Value::Int(Int::Signed { width: 32, value: v as i64 }) }

    /// Unsigned integer of an arbitrary width (`bit<N>`, `N <= 64`).
    pub fn bits(width: u8, value: u64) -> Value {
        debug_assert!((1..=64).contains(&width), "invalid integer width {}", width);
        debug_assert!(width >= 64 || value >> width == 0, "{} does not fit in {} bits", value, width);
        Value::Int(Int::Unsigned { width, value })
    }

    /// Signed integer of an arbitrary width (`signed<N>`, `N <= 64`).
    pub fn signed(width: u8, value: i64) -> Value {
        debug_assert!((1..=64).contains(&width), "invalid integer width {}", width);
        debug_assert!(
            width >= 64 || (value >= -(1i64 << (width - 1)) && value < (1i64 << (width - 1))),
            "{} does not fit in signed {} bits",
            value,
            width
        );
        Value::Int(Int::Signed { width, value })
    }

    pub fn string(s: impl Into<String>) -> Value { Value::String(s.into()) }

    /// Accept arbitrary bytes; invalid UTF-8 sequences are replaced, never truncated.
    pub fn string_lossy(bytes: &[u8]) -> Value { Value::String(String::from_utf8_lossy(bytes).into_owned()) }

    pub fn tuple(items: Vec<Value>) -> Value { Value::Tuple(items) }
    pub fn pair(a: Value, b: Value) -> Value { Value::Tuple(vec![a, b]) }
    pub fn vector(items: Vec<Value>) -> Value { Value::Vector(items) }
    pub fn map(pairs: Vec<(Value, Value)>) -> Value { Value::Map(pairs) }
    pub fn set(items: Vec<Value>) -> Value { Value::Set(items) }

    // Empty collections never allocate.
    pub const fn empty_vector() -> Value { Value::Vector(Vec::new()) }
    pub const fn empty_map() -> Value { Value::Map(Vec::new()) }
    pub const fn empty_set() -> Value { Value::Set(Vec::new()) }

    pub fn strukt(name: impl Into<Cow<'static, str>>, fields: Vec<Value>) -> Value {
        Value::Struct(Struct { name: name.into(), fields })
    }

    pub fn some(v: Value) -> Value { SOME.build(vec![v]) }
    pub fn none() -> Value { NONE.unit() }
    pub fn left(v: Value) -> Value { LEFT.build(vec![v]) }
    pub fn right(v: Value) -> Value { RIGHT.build(vec![v]) }

    pub fn from_option(v: Option<Value>) -> Value {
        match v {
            Some(v) => Value::some(v),
            None => Value::none(),
        }
    }

    /// Append to a vector, set or tuple.
    pub fn push(&mut self, v: Value) -> Result<(), ValueError> {
        match self {
            Value::Vector(items) | Value::Set(items) | Value::Tuple(items) => {
                items.push(v);
                Ok(())
            }
            other => Err(other.wrong(Tag::Vector)),
        }
    }

    pub fn map_push(&mut self, k: Value, v: Value) -> Result<(), ValueError> {
        match self {
            Value::Map(pairs) => {
                pairs.push((k, v));
                Ok(())
            }
            other => Err(other.wrong(Tag::Map)),
        }
    }

    // ---- checked accessors ----

    pub fn is_null(&self) -> bool { matches!(self, Value::Null) }

    pub fn as_bool(&self) -> Result<bool, ValueError> {
        match self {
            Value::Bool(b) => Ok(*b),
            other => Err(other.wrong(Tag::Bool)),
        }
    }

    pub fn as_int(&self) -> Result<Int, ValueError> {
        match self {
            Value::Int(i) => Ok(*i),
            other => Err(other.wrong(Tag::Int)),
        }
    }

    pub fn as_u64(&self) -> Result<u64, ValueError> { self.as_int()?.to_u64() }
    pub fn as_u32(&self) -> Result<u32, ValueError> { self.as_int()?.to_u32() }
    pub fn as_u16(&self) -> Result<u16, ValueError> { self.as_int()?.to_u16() }
    pub fn as_i64(&self) -> Result<i64, ValueError> { self.as_int()?.to_i64() }
    pub fn as_i32(&self) -> Result<i32, ValueError> { self.as_int()?.to_i32() }

    pub fn as_str(&self) -> Result<&str, ValueError> {
        match self {
            Value::String(s) => Ok(s),
            other => Err(other.wrong(Tag::String)),
        }
    }

    pub fn as_tuple(&self) -> Result<&[Value], ValueError> {
        match self {
            Value::Tuple(items) => Ok(items),
            other => Err(other.wrong(Tag::Tuple)),
        }
    }

    pub fn as_vector(&self) -> Result<&[Value], ValueError> {
        match self {
            Value::Vector(items) => Ok(items),
            other => Err(other.wrong(Tag::Vector)),
        }
    }

    pub fn as_set(&self) -> Result<&[Value], ValueError> {
        match self {
            Value::Set(items) => Ok(items),
            other => Err(other.wrong(Tag::Set)),
        }
    }

    pub fn as_map(&self) -> Result<&[(Value, Value)], ValueError> {
        match self {
            Value::Map(pairs) => Ok(pairs),
            other => Err(other.wrong(Tag::Map)),
        }
    }

    pub fn as_struct(&self) -> Result<&Struct, ValueError> {
        match self {
            Value::Struct(s) => Ok(s),
            other => Err(other.wrong(Tag::Struct)),
        }
    }

    /// Decode the `Some`/`None` optionality convention.
    pub fn as_option(&self) -> Result<Option<&Value>, ValueError> {
        let s = self.as_struct()?;
        if s.name == SOME.name {
            SOME.fields(self).map(|f| Some(&f[0]))
        } else if s.name == NONE.name {
            NONE.fields(self).map(|_| None)
        } else {
            Err(ValueError::UnknownVariant { expected: OPTION_ARMS, found: s.name.to_string() })
        }
    }

    /// Decode a `Left`/`Right` disjoint union. Any other constructor is an error.
    pub fn as_either(&self) -> Result<Either<&Value, &Value>, ValueError> {
        let s = self.as_struct()?;
        if s.name == LEFT.name {
            LEFT.fields(self).map(|f| Either::Left(&f[0]))
        } else if s.name == RIGHT.name {
            RIGHT.fields(self).map(|f| Either::Right(&f[0]))
        } else {
            Err(ValueError::UnknownVariant { expected: EITHER_ARMS, found: s.name.to_string() })
        }
    }

    /// Element count of a composite; `None` for scalars.
    pub fn len(&self) -> Option<usize> {
        match self {
            Value::Tuple(items) | Value::Vector(items) | Value::Set(items) => Some(items.len()),
            Value::Map(pairs) => Some(pairs.len()),
            Value::Struct(s) => Some(s.fields.len()),
            _ => None,
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self { Value::Bool(b) }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self { Value::String(s.to_string()) }
}

impl From<String> for Value {
    fn from(s: String) -> Self { Value::String(s) }
}

fn write_seq(f: &mut fmt::Formatter<'_>, items: &[Value]) -> fmt::Result {
    for (i, v) in items.iter().enumerate() {
        if i > 0 {
            f.write_str(", ")?;
        }
        write!(f, "{}", v)?;
    }
    Ok(())
}

/// Human-readable dump, one line, used by logs, dumpers and the command recorder.
impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("<null>"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(i) => write!(f, "{}", i),
            Value::String(s) => write!(f, "{:?}", s),
            Value::Tuple(items) => {
                f.write_str("(")?;
                write_seq(f, items)?;
                f.write_str(")")
            }
            Value::Vector(items) => {
                f.write_str("[")?;
                write_seq(f, items)?;
                f.write_str("]")
            }
            Value::Set(items) => {
                f.write_str("#{")?;
                write_seq(f, items)?;
                f.write_str("}")
            }
            Value::Map(pairs) => {
                f.write_str("{")?;
                for (i, (k, v)) in pairs.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{} => {}", k, v)?;
                }
                f.write_str("}")
            }
            Value::Struct(s) => {
                write!(f, "{}{{", s.name)?;
                write_seq(f, &s.fields)?;
                f.write_str("}")
            }
        }
    }
}
