//! Guest-language values as seen by the dispatch core.
pub mod object;
pub mod selector;

pub use object::{HashStorage, Object, ObjectRef};
pub use selector::Selector;

use crate::{
    types::ClassId,
    vm::{bound_method::BoundMethodRef, closure::ClosureRef},
};
use parking_lot::RwLock;
use smallvec::SmallVec;
use std::{fmt, sync::Arc};

pub type ArrayRef = Arc<RwLock<Vec<Value>>>;
pub type HashRef = Arc<RwLock<HashStorage>>;

/// Inline capacity of argument buffers before they spill to the heap.
pub const INLINE_ARGS: usize = 8;

/// Fixed-size argument array produced by the argument adapter. Stays on the
/// stack for the common case of a handful of parameters.
pub type ArgBuffer = SmallVec<[Value; INLINE_ARGS]>;

#[derive(Clone)]
pub enum Value {
    Nil,
    /// An optional parameter the caller did not supply.
    Undef,
    Bool(bool),
    Fixnum(i64),
    Float(f64),
    Symbol(Selector),
    Str(Arc<str>),
    Array(ArrayRef),
    Hash(HashRef),
    Object(ObjectRef),
    Class(ClassId),
    Proc(ClosureRef),
    Method(BoundMethodRef),
}

impl Value {
    pub fn array(items: Vec<Value>) -> Self {
        Value::Array(Arc::new(RwLock::new(items)))
    }

    pub fn hash(pairs: impl IntoIterator<Item = (Value, Value)>) -> Self {
        let mut storage = HashStorage::default();
        for (k, v) in pairs {
            storage.insert(k, v);
        }
        Value::Hash(Arc::new(RwLock::new(storage)))
    }

    pub fn string(s: &str) -> Self {
        Value::Str(Arc::from(s))
    }

    pub fn symbol(name: &str) -> Self {
        Value::Symbol(Selector::intern(name))
    }

    pub fn truthy(&self) -> bool {
        !matches!(self, Value::Nil | Value::Undef | Value::Bool(false))
    }

    pub fn is_nil(&self) -> bool {
        matches!(self, Value::Nil)
    }

    pub fn is_undef(&self) -> bool {
        matches!(self, Value::Undef)
    }

    pub fn as_fixnum(&self) -> Option<i64> {
        match self {
            Value::Fixnum(i) => Some(*i),
            _ => None,
        }
    }

    /// Floats, and fixnums widened to float.
    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            Value::Fixnum(i) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&ArrayRef> {
        match self {
            Value::Array(a) => Some(a),
            _ => None,
        }
    }

    /// Snapshot of an array's elements.
    pub fn array_items(&self) -> Option<Vec<Value>> {
        self.as_array().map(|a| a.read().clone())
    }

    pub fn as_proc(&self) -> Option<&ClosureRef> {
        match self {
            Value::Proc(p) => Some(p),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&ObjectRef> {
        match self {
            Value::Object(o) => Some(o),
            _ => None,
        }
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            Value::Nil => "nil",
            Value::Undef => "undef",
            Value::Bool(true) => "true",
            Value::Bool(false) => "false",
            Value::Fixnum(_) => "Integer",
            Value::Float(_) => "Float",
            Value::Symbol(_) => "Symbol",
            Value::Str(_) => "String",
            Value::Array(_) => "Array",
            Value::Hash(_) => "Hash",
            Value::Object(_) => "Object",
            Value::Class(_) => "Class",
            Value::Proc(_) => "Proc",
            Value::Method(_) => "Method",
        }
    }

    /// Strict equality, as used for hash keys: no numeric widening,
    /// containers compare element-wise, heap objects by identity.
    pub fn eql(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Nil, Value::Nil) | (Value::Undef, Value::Undef) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Fixnum(a), Value::Fixnum(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::Symbol(a), Value::Symbol(b)) => a == b,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Class(a), Value::Class(b)) => a == b,
            (Value::Array(a), Value::Array(b)) => {
                if Arc::ptr_eq(a, b) {
                    return true;
                }
                let (a, b) = (a.read(), b.read());
                a.len() == b.len() && a.iter().zip(b.iter()).all(|(x, y)| x.eql(y))
            }
            (Value::Hash(a), Value::Hash(b)) => {
                if Arc::ptr_eq(a, b) {
                    return true;
                }
                let (a, b) = (a.read(), b.read());
                a.len() == b.len()
                    && a.iter()
                        .all(|(k, v)| b.get(k).is_some_and(|other| other.eql(v)))
            }
            (Value::Object(a), Value::Object(b)) => a == b,
            (Value::Proc(a), Value::Proc(b)) => Arc::ptr_eq(a, b),
            (Value::Method(a), Value::Method(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }

    /// `==` for built-in values: like [`Value::eql`] but integers and floats
    /// compare numerically.
    pub fn equals(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Fixnum(a), Value::Float(b)) | (Value::Float(b), Value::Fixnum(a)) => {
                *a as f64 == *b
            }
            _ => self.eql(other),
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Nil => f.write_str("nil"),
            Value::Undef => f.write_str("undef"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Fixnum(i) => write!(f, "{i}"),
            Value::Float(x) => write!(f, "{x:?}"),
            Value::Symbol(s) => write!(f, "{s:?}"),
            Value::Str(s) => write!(f, "{s:?}"),
            Value::Array(a) => f.debug_list().entries(a.read().iter()).finish(),
            Value::Hash(h) => f
                .debug_map()
                .entries(h.read().iter().map(|(k, v)| (k, v)))
                .finish(),
            Value::Object(o) => write!(f, "{o:?}"),
            Value::Class(c) => write!(f, "{c:?}"),
            Value::Proc(p) => write!(f, "#<Proc {:p}>", Arc::as_ptr(p)),
            Value::Method(m) => write!(f, "#<Method {}>", m.selector),
        }
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Fixnum(i)
    }
}

impl From<f64> for Value {
    fn from(x: f64) -> Self {
        Value::Float(x)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truthiness() {
        assert!(!Value::Nil.truthy());
        assert!(!Value::Bool(false).truthy());
        assert!(Value::Fixnum(0).truthy());
        assert!(Value::array(vec![]).truthy());
    }

    #[test]
    fn test_eql_versus_equals() {
        assert!(!Value::Fixnum(1).eql(&Value::Float(1.0)));
        assert!(Value::Fixnum(1).equals(&Value::Float(1.0)));
        assert!(Value::string("a").eql(&Value::string("a")));
        assert!(Value::array(vec![1.into(), 2.into()]).eql(&Value::array(vec![1.into(), 2.into()])));
    }

    #[test]
    fn test_hash_keys() {
        let h = Value::hash([(Value::symbol("a"), Value::Fixnum(1))]);
        let Value::Hash(storage) = &h else { unreachable!() };
        storage.write().insert(Value::symbol("a"), Value::Fixnum(2));
        assert_eq!(storage.read().len(), 1);
        assert_eq!(
            storage.read().get(&Value::symbol("a")).and_then(Value::as_fixnum),
            Some(2)
        );
    }
}
