//! Shortcuts for builtin operators.
//!
//! An [`OperatorSite`] is created by the compiler for each operator
//! expression. When the compiler could not rule out a redefinition of the
//! operator, the site is marked `redefined` and always dispatches. Otherwise
//! integers, floats, arrays and hashes are handled inline, and anything else
//! (including integer overflow and division by zero) goes through the site's
//! own cache.
use crate::{
    error::DispatchResult,
    value::{Selector, Value},
    vm::{cache::CallSiteCache, dispatch::DispatchKind, CallStack},
};
use std::cmp::Ordering;

#[derive(Debug)]
pub struct OperatorSite {
    selector: Selector,
    redefined: bool,
    cache: CallSiteCache,
}

impl OperatorSite {
    /// A site for operator `op` (`"+"`, `"[]"`, `"<<"`...).
    pub fn new(op: &str) -> Self {
        Self::with_redefinition(op, false)
    }

    pub fn with_redefinition(op: &str, redefined: bool) -> Self {
        Self {
            selector: Selector::intern(&format!("{op}:")),
            redefined,
            cache: CallSiteCache::new(),
        }
    }

    pub fn selector(&self) -> Selector {
        self.selector
    }

    pub fn cache(&self) -> &CallSiteCache {
        &self.cache
    }
}

fn arith(
    left: &Value,
    right: &Value,
    int: impl FnOnce(i64, i64) -> Option<i64>,
    float: impl FnOnce(f64, f64) -> f64,
) -> Option<Value> {
    match (left, right) {
        (Value::Fixnum(a), Value::Fixnum(b)) => int(*a, *b).map(Value::Fixnum),
        (Value::Float(_), Value::Fixnum(_) | Value::Float(_)) | (Value::Fixnum(_), Value::Float(_)) => {
            Some(Value::Float(float(left.as_float()?, right.as_float()?)))
        }
        _ => None,
    }
}

fn compare(left: &Value, right: &Value, accept: impl FnOnce(Ordering) -> bool) -> Option<Value> {
    let ordering = match (left, right) {
        (Value::Fixnum(a), Value::Fixnum(b)) => Some(a.cmp(b)),
        (Value::Float(_), Value::Fixnum(_) | Value::Float(_)) | (Value::Fixnum(_), Value::Float(_)) => {
            left.as_float()?.partial_cmp(&right.as_float()?)
        }
        _ => return None,
    };
    // NaN compares false with everything
    Some(Value::Bool(ordering.is_some_and(accept)))
}

/// How far `[]=` may grow an array past its end before the store is left to
/// the dispatched method.
const MAX_INLINE_GROWTH: usize = 1 << 16;

fn floor_div(a: i64, b: i64) -> Option<i64> {
    let q = a.checked_div(b)?;
    if a % b != 0 && ((a < 0) != (b < 0)) {
        Some(q - 1)
    } else {
        Some(q)
    }
}

/// Resolves a possibly negative index against `len`.
fn array_index(index: i64, len: usize) -> Option<usize> {
    if index >= 0 {
        Some(index as usize)
    } else {
        let from_end = len as i64 + index;
        (from_end >= 0).then_some(from_end as usize)
    }
}

fn aref(receiver: &Value, index: &Value) -> Option<Value> {
    match (receiver, index) {
        (Value::Array(items), Value::Fixnum(i)) => {
            let items = items.read();
            Some(
                array_index(*i, items.len())
                    .and_then(|i| items.get(i).cloned())
                    .unwrap_or(Value::Nil),
            )
        }
        (Value::Hash(hash), key) => Some(hash.read().get(key).cloned().unwrap_or(Value::Nil)),
        _ => None,
    }
}

fn aset(receiver: &Value, index: &Value, value: &Value) -> Option<Value> {
    match (receiver, index) {
        (Value::Array(items), Value::Fixnum(i)) => {
            let mut items = items.write();
            let i = array_index(*i, items.len())?;
            if i >= items.len() {
                let grow = i - items.len() + 1;
                if grow > MAX_INLINE_GROWTH {
                    return None;
                }
                items.try_reserve(grow).ok()?;
                items.resize(i + 1, Value::Nil);
            }
            items[i] = value.clone();
            Some(value.clone())
        }
        (Value::Hash(hash), key) => {
            hash.write().insert(key.clone(), value.clone());
            Some(value.clone())
        }
        _ => None,
    }
}

macro_rules! binary_ops {
    ($($(#[$doc:meta])* $name:ident => $op:expr;)*) => {
        $(
            $(#[$doc])*
            pub fn $name(&mut self, site: &OperatorSite, left: &Value, right: &Value) -> DispatchResult<Value> {
                let op: fn(&Value, &Value) -> Option<Value> = $op;
                self.fast_binary(site, left, right, op)
            }
        )*
    };
}

impl CallStack {
    fn fast_binary(
        &mut self,
        site: &OperatorSite,
        left: &Value,
        right: &Value,
        op: fn(&Value, &Value) -> Option<Value>,
    ) -> DispatchResult<Value> {
        if !site.redefined {
            if let Some(v) = op(left, right) {
                self.shared.metrics.record_fast_path_hit();
                return Ok(v);
            }
        }
        self.shared.metrics.record_fast_path_fallback();
        self.dispatch(
            &site.cache,
            left,
            site.selector,
            None,
            DispatchKind::Normal,
            &[right.clone()],
        )
    }

    binary_ops! {
        fast_plus => |l, r| arith(l, r, i64::checked_add, |a, b| a + b);
        fast_minus => |l, r| arith(l, r, i64::checked_sub, |a, b| a - b);
        fast_mult => |l, r| arith(l, r, i64::checked_mul, |a, b| a * b);
        /// Integer division rounds toward negative infinity.
        fast_div => |l, r| arith(l, r, floor_div, |a, b| a / b);
        fast_lt => |l, r| compare(l, r, Ordering::is_lt);
        fast_le => |l, r| compare(l, r, Ordering::is_le);
        fast_gt => |l, r| compare(l, r, Ordering::is_gt);
        fast_ge => |l, r| compare(l, r, Ordering::is_ge);
        fast_eq => |l, r| compare(l, r, Ordering::is_eq);
        fast_neq => |l, r| compare(l, r, Ordering::is_ne);
        fast_eqq => |l, r| compare(l, r, Ordering::is_eq);
        /// Appends to an array and returns it.
        fast_ltlt => |l, r| match l {
            Value::Array(items) => {
                items.write().push(r.clone());
                Some(l.clone())
            }
            _ => None,
        };
        fast_aref => aref;
    }

    pub fn fast_aset(
        &mut self,
        site: &OperatorSite,
        receiver: &Value,
        index: &Value,
        value: &Value,
    ) -> DispatchResult<Value> {
        if !site.redefined {
            if let Some(v) = aset(receiver, index, value) {
                self.shared.metrics.record_fast_path_hit();
                return Ok(v);
            }
        }
        self.shared.metrics.record_fast_path_fallback();
        self.dispatch(
            &site.cache,
            receiver,
            site.selector,
            None,
            DispatchKind::Normal,
            &[index.clone(), value.clone()],
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        resolve::ClassTable,
        types::{Arity, MethodFlags},
        vm::SharedGlobalState,
    };
    use std::sync::Arc;

    fn stack() -> (Arc<ClassTable>, CallStack) {
        let table = Arc::new(ClassTable::new());
        let stack = CallStack::new(Arc::new(SharedGlobalState::with_model(table.clone())));
        (table, stack)
    }

    #[test]
    fn test_integer_arithmetic() {
        let (_, mut s) = stack();
        let plus = OperatorSite::new("+");
        let div = OperatorSite::new("/");
        let v = s.fast_plus(&plus, &Value::Fixnum(2), &Value::Fixnum(3)).unwrap();
        assert_eq!(v.as_fixnum(), Some(5));
        let v = s.fast_div(&div, &Value::Fixnum(-7), &Value::Fixnum(2)).unwrap();
        assert_eq!(v.as_fixnum(), Some(-4));
        let v = s.fast_plus(&plus, &Value::Fixnum(1), &Value::Float(0.5)).unwrap();
        assert_eq!(v.as_float(), Some(1.5));
        assert_eq!(s.shared.get_cache_stats().fast_path_hits, 3);
    }

    #[test]
    fn test_overflow_falls_through() {
        let (table, mut s) = stack();
        let integer = table.builtins().integer;
        table.define_method(integer, "+:", Arity::fixed(1), MethodFlags::empty(), |_, _, _| {
            Ok(Value::string("bignum"))
        });
        let plus = OperatorSite::new("+");
        let v = s.fast_plus(&plus, &Value::Fixnum(i64::MAX), &Value::Fixnum(1)).unwrap();
        assert!(matches!(v, Value::Str(ref t) if &**t == "bignum"));
        assert_eq!(s.shared.get_cache_stats().fast_path_fallbacks, 1);
        assert!(!plus.cache().is_empty());
    }

    #[test]
    fn test_division_by_zero_dispatches() {
        let (_, mut s) = stack();
        let div = OperatorSite::new("/");
        let err = s.fast_div(&div, &Value::Fixnum(1), &Value::Fixnum(0)).unwrap_err();
        assert!(err.to_string().contains("undefined method `/'"));
    }

    #[test]
    fn test_redefined_site_always_dispatches() {
        let (table, mut s) = stack();
        let integer = table.builtins().integer;
        table.define_method(integer, "<:", Arity::fixed(1), MethodFlags::empty(), |_, _, _| {
            Ok(Value::Bool(true))
        });
        let lt = OperatorSite::with_redefinition("<", true);
        let v = s.fast_lt(&lt, &Value::Fixnum(5), &Value::Fixnum(1)).unwrap();
        assert!(v.truthy());
    }

    #[test]
    fn test_comparisons() {
        let (_, mut s) = stack();
        let site = OperatorSite::new("<=");
        assert!(s.fast_le(&site, &Value::Fixnum(2), &Value::Float(2.0)).unwrap().truthy());
        let site = OperatorSite::new("!=");
        assert!(!s.fast_neq(&site, &Value::Fixnum(2), &Value::Fixnum(2)).unwrap().truthy());
        let site = OperatorSite::new(">");
        assert!(!s.fast_gt(&site, &Value::Float(f64::NAN), &Value::Fixnum(0)).unwrap().truthy());
    }

    #[test]
    fn test_array_and_hash_access() {
        let (_, mut s) = stack();
        let arr = Value::array(vec![Value::Fixnum(1)]);
        let ltlt = OperatorSite::new("<<");
        let aref = OperatorSite::new("[]");
        let aset = OperatorSite::new("[]=");

        s.fast_ltlt(&ltlt, &arr, &Value::Fixnum(2)).unwrap();
        assert_eq!(s.fast_aref(&aref, &arr, &Value::Fixnum(-1)).unwrap().as_fixnum(), Some(2));
        assert!(s.fast_aref(&aref, &arr, &Value::Fixnum(9)).unwrap().is_nil());

        s.fast_aset(&aset, &arr, &Value::Fixnum(4), &Value::Fixnum(5)).unwrap();
        let items = arr.array_items().unwrap();
        assert_eq!(items.len(), 5);
        assert!(items[2].is_nil());
        assert_eq!(items[4].as_fixnum(), Some(5));

        let hash = Value::hash(vec![(Value::symbol("seed"), Value::Nil)]);
        s.fast_aset(&aset, &hash, &Value::symbol("k"), &Value::Fixnum(7)).unwrap();
        let v = s.fast_aref(&aref, &hash, &Value::symbol("k")).unwrap();
        assert_eq!(v.as_fixnum(), Some(7));
    }

    #[test]
    fn test_huge_array_index_falls_through() {
        let (table, mut s) = stack();
        let aset = OperatorSite::new("[]=");
        let arr = Value::array(vec![Value::Fixnum(1)]);

        let err = s
            .fast_aset(&aset, &arr, &Value::Fixnum(i64::MAX), &Value::Fixnum(1))
            .unwrap_err();
        assert!(matches!(err, crate::error::DispatchError::NoMethod { .. }));
        assert_eq!(arr.array_items().unwrap().len(), 1);

        let array = table.builtins().array;
        table.define_method(array, "[]=:", Arity::fixed(2), MethodFlags::empty(), |_, _, args| {
            Ok(args[1].clone())
        });
        let v = s
            .fast_aset(&aset, &arr, &Value::Fixnum(1 << 40), &Value::Fixnum(3))
            .unwrap();
        assert_eq!(v.as_fixnum(), Some(3));
        assert_eq!(arr.array_items().unwrap().len(), 1);
        assert_eq!(s.shared.get_cache_stats().fast_path_fallbacks, 2);
    }
}
