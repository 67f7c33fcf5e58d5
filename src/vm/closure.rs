//! Closure values and their activation protocol.
//!
//! A closure refers to variables of enclosing scopes through [`VarRef`]s and
//! keeps its own locals in a [`LocalScope`], a range of slots in a
//! [`BindingArena`]. One canonical closure exists per definition site and
//! defining scope ([`ClosureMemo`]). Invoking a closure that is already
//! active runs a duplicate instead: the duplicate shares the captured
//! variables but gets a private copy of the locals, so a recursive
//! activation never clobbers the bindings of the activation below it.
use crate::{
    error::{DispatchError, DispatchResult},
    types::{fix_args, Arity, ClassId},
    value::{ArgBuffer, Selector, Value},
    vm::{bound_method::BoundMethodRef, CallStack},
};
use bitflags::bitflags;
use parking_lot::{Mutex, RwLock};
use std::{
    collections::HashMap,
    fmt,
    ops::Range,
    sync::{
        atomic::{AtomicU8, AtomicUsize, Ordering},
        Arc, OnceLock,
    },
};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ClosureFlags: u8 {
        /// An activation of this instance is on the stack.
        const ACTIVE = 1 << 0;
        /// Strict arity, no auto-splat.
        const LAMBDA = 1 << 1;
        /// Escaped through `to_proc`; the memo no longer hands it out.
        const LONG_LIVED = 1 << 2;
        /// Receives its arguments unadapted.
        const NATIVE_THUNK = 1 << 3;
        const EMPTY = 1 << 4;
        const BOUND_METHOD = 1 << 5;
    }
}

/// Compiled closure body: `(stack, closure, self, args) -> result`. The
/// closure argument is the instance being activated, which may be a
/// duplicate of the one that was invoked.
pub type BlockBody =
    Arc<dyn Fn(&mut CallStack, &ClosureRef, &Value, &[Value]) -> DispatchResult<Value> + Send + Sync>;

/// Storage for local variable slots.
#[derive(Debug, Default)]
pub struct BindingArena {
    slots: RwLock<Vec<Value>>,
}

pub type ArenaRef = Arc<BindingArena>;

impl BindingArena {
    pub fn new() -> ArenaRef {
        Arc::new(Self::default())
    }

    /// Appends `n` nil slots.
    pub fn alloc(&self, n: usize) -> Range<usize> {
        let mut slots = self.slots.write();
        let start = slots.len();
        slots.resize(start + n, Value::Nil);
        start..start + n
    }

    pub fn get(&self, index: usize) -> Value {
        match self.slots.read().get(index) {
            Some(v) => v.clone(),
            None => fatal!("binding slot {index} out of range"),
        }
    }

    pub fn set(&self, index: usize, value: Value) {
        match self.slots.write().get_mut(index) {
            Some(slot) => *slot = value,
            None => fatal!("binding slot {index} out of range"),
        }
    }

    pub fn len(&self) -> usize {
        self.slots.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A reference to one variable slot of some scope.
#[derive(Clone)]
pub struct VarRef {
    arena: ArenaRef,
    index: usize,
}

impl VarRef {
    pub fn new(arena: ArenaRef, index: usize) -> Self {
        Self { arena, index }
    }

    pub fn get(&self) -> Value {
        self.arena.get(self.index)
    }

    pub fn set(&self, value: Value) {
        self.arena.set(self.index, value)
    }

    pub fn same_slot(&self, other: &VarRef) -> bool {
        Arc::ptr_eq(&self.arena, &other.arena) && self.index == other.index
    }
}

impl fmt::Debug for VarRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VarRef({:p}[{}])", Arc::as_ptr(&self.arena), self.index)
    }
}

/// Named local variables occupying a range of an arena.
#[derive(Clone, Debug)]
pub struct LocalScope {
    arena: ArenaRef,
    range: Range<usize>,
    names: Arc<[Selector]>,
}

impl LocalScope {
    pub fn new(names: Arc<[Selector]>) -> Self {
        Self::in_arena(&BindingArena::new(), names)
    }

    pub fn in_arena(arena: &ArenaRef, names: Arc<[Selector]>) -> Self {
        let range = arena.alloc(names.len());
        Self {
            arena: arena.clone(),
            range,
            names,
        }
    }

    pub fn len(&self) -> usize {
        self.range.len()
    }

    pub fn is_empty(&self) -> bool {
        self.range.is_empty()
    }

    pub fn names(&self) -> &[Selector] {
        &self.names
    }

    fn slot(&self, i: usize) -> usize {
        if i >= self.range.len() {
            fatal!("local {i} out of range for a scope of {}", self.range.len());
        }
        self.range.start + i
    }

    pub fn get(&self, i: usize) -> Value {
        self.arena.get(self.slot(i))
    }

    pub fn set(&self, i: usize, value: Value) {
        self.arena.set(self.slot(i), value)
    }

    pub fn var(&self, i: usize) -> VarRef {
        VarRef::new(self.arena.clone(), self.slot(i))
    }

    pub fn lookup(&self, name: Selector) -> Option<VarRef> {
        self.names
            .iter()
            .position(|n| *n == name)
            .map(|i| self.var(i))
    }

    /// A copy of this scope's values, names preserved, in a fresh arena.
    pub fn deep_copy(&self) -> Self {
        let copy = Self::new(self.names.clone());
        for i in 0..self.len() {
            copy.set(i, self.get(i));
        }
        copy
    }
}

/// A closure definition site.
pub struct ClosureDefinition {
    pub site: usize,
    pub arity: Arity,
    /// Static flags: `LAMBDA`, `EMPTY`, `NATIVE_THUNK`.
    pub flags: ClosureFlags,
    pub local_names: Arc<[Selector]>,
    source: BlockBody,
    compiled: OnceLock<BlockBody>,
}

impl ClosureDefinition {
    pub fn new(
        arity: Arity,
        flags: ClosureFlags,
        local_names: &[&str],
        body: impl Fn(&mut CallStack, &ClosureRef, &Value, &[Value]) -> DispatchResult<Value>
            + Send
            + Sync
            + 'static,
    ) -> Arc<Self> {
        static NEXT_SITE: AtomicUsize = AtomicUsize::new(0);
        Arc::new(Self {
            site: NEXT_SITE.fetch_add(1, Ordering::Relaxed),
            arity,
            flags: flags & (ClosureFlags::LAMBDA | ClosureFlags::EMPTY | ClosureFlags::NATIVE_THUNK),
            local_names: local_names.iter().map(|n| Selector::intern(n)).collect(),
            source: Arc::new(body),
            compiled: OnceLock::new(),
        })
    }

    /// The body as handed to the compiler.
    pub fn source(&self) -> &BlockBody {
        &self.source
    }

    pub fn is_compiled(&self) -> bool {
        self.compiled.get().is_some()
    }
}

impl fmt::Debug for ClosureDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClosureDefinition")
            .field("site", &self.site)
            .field("arity", &self.arity)
            .field("flags", &self.flags)
            .field("compiled", &self.is_compiled())
            .finish()
    }
}

enum Target {
    Compiled(Arc<ClosureDefinition>),
    Bound(BoundMethodRef),
}

pub struct Closure {
    target: Target,
    flags: AtomicU8,
    pub arity: Arity,
    pub captured: Vec<VarRef>,
    pub locals: LocalScope,
    pub receiver: Value,
    pub defining_class: Option<ClassId>,
    pub parent: Option<ClosureRef>,
}

pub type ClosureRef = Arc<Closure>;

impl Closure {
    pub fn new(
        definition: &Arc<ClosureDefinition>,
        receiver: Value,
        captured: Vec<VarRef>,
        defining_class: Option<ClassId>,
        parent: Option<ClosureRef>,
    ) -> ClosureRef {
        Arc::new(Self {
            flags: AtomicU8::new(definition.flags.bits()),
            arity: definition.arity,
            locals: LocalScope::new(definition.local_names.clone()),
            target: Target::Compiled(definition.clone()),
            captured,
            receiver,
            defining_class,
            parent,
        })
    }

    /// A closure that calls `method` with its arguments.
    pub fn from_bound_method(method: BoundMethodRef) -> ClosureRef {
        Arc::new(Self {
            flags: AtomicU8::new((ClosureFlags::BOUND_METHOD | ClosureFlags::LAMBDA).bits()),
            arity: method.arity,
            locals: LocalScope::new(Arc::from([])),
            receiver: method.receiver.clone(),
            defining_class: Some(method.origin),
            target: Target::Bound(method),
            captured: vec![],
            parent: None,
        })
    }

    pub fn flags(&self) -> ClosureFlags {
        ClosureFlags::from_bits_truncate(self.flags.load(Ordering::Acquire))
    }

    pub fn is_lambda(&self) -> bool {
        self.flags().contains(ClosureFlags::LAMBDA)
    }

    pub fn is_active(&self) -> bool {
        self.flags().contains(ClosureFlags::ACTIVE)
    }

    pub fn definition(&self) -> Option<&Arc<ClosureDefinition>> {
        match &self.target {
            Target::Compiled(d) => Some(d),
            Target::Bound(_) => None,
        }
    }

    pub fn bound_method(&self) -> Option<&BoundMethodRef> {
        match &self.target {
            Target::Bound(m) => Some(m),
            Target::Compiled(_) => None,
        }
    }

    /// Claims the instance for one activation; false if it is already active.
    fn try_activate(&self) -> bool {
        let previous = self.flags.fetch_or(ClosureFlags::ACTIVE.bits(), Ordering::AcqRel);
        previous & ClosureFlags::ACTIVE.bits() == 0
    }

    fn deactivate(&self) {
        self.flags
            .fetch_and(!ClosureFlags::ACTIVE.bits(), Ordering::AcqRel);
    }

    fn promote(&self) {
        self.flags
            .fetch_or(ClosureFlags::LONG_LIVED.bits(), Ordering::AcqRel);
    }

    /// Copy for a re-entrant activation: captured variables are shared,
    /// locals are copied, the compiled body is the same.
    fn duplicate(&self) -> ClosureRef {
        let target = match &self.target {
            Target::Compiled(d) => Target::Compiled(d.clone()),
            Target::Bound(m) => Target::Bound(m.clone()),
        };
        Arc::new(Self {
            target,
            flags: AtomicU8::new((self.flags() - ClosureFlags::ACTIVE).bits()),
            arity: self.arity,
            captured: self.captured.clone(),
            locals: self.locals.deep_copy(),
            receiver: self.receiver.clone(),
            defining_class: self.defining_class,
            parent: self.parent.clone(),
        })
    }
}

impl fmt::Debug for Closure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Closure")
            .field("site", &self.definition().map(|d| d.site))
            .field("flags", &self.flags())
            .field("arity", &self.arity)
            .finish()
    }
}

/// Clears `ACTIVE` when an activation ends.
struct Activation(ClosureRef);

impl Drop for Activation {
    fn drop(&mut self) {
        self.0.deactivate();
    }
}

/// Canonical closures of one defining scope, by definition site.
#[derive(Default)]
pub struct ClosureMemo {
    closures: Mutex<HashMap<usize, ClosureRef>>,
}

impl ClosureMemo {
    pub fn new() -> Self {
        Self::default()
    }

    /// The memoized closure for `site`, unless it escaped as a long-lived
    /// proc, in which case `create` makes its replacement.
    pub fn get_or_create(&self, site: usize, create: impl FnOnce() -> ClosureRef) -> ClosureRef {
        let mut closures = self.closures.lock();
        match closures.get(&site) {
            Some(c) if !c.flags().contains(ClosureFlags::LONG_LIVED) => c.clone(),
            _ => {
                let c = create();
                closures.insert(site, c.clone());
                c
            }
        }
    }

    pub fn len(&self) -> usize {
        self.closures.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Argument binding for loose (non-lambda) closures: a lone array argument
/// is splatted when more than one parameter is expected, then missing
/// arguments are nil and extra ones dropped.
fn adapt_loose(arity: &Arity, args: &[Value]) -> ArgBuffer {
    let splat = args.len() == 1
        && (arity.min > 1 || (arity.min == 1 && arity.min != arity.max));
    let mut buf: ArgBuffer = match (splat, args.first().and_then(Value::array_items)) {
        (true, Some(items)) => ArgBuffer::from_vec(items),
        _ => ArgBuffer::from(args),
    };

    let min = arity.min as usize;
    if buf.len() < min {
        buf.resize(min, Value::Nil);
    } else if arity.max != -1 && buf.len() > arity.max as usize {
        buf.truncate(arity.max as usize);
    }
    buf
}

pub(crate) fn adapt_block_args(arity: &Arity, lambda: bool, args: &[Value]) -> DispatchResult<ArgBuffer> {
    let buf = if lambda {
        arity.check(args.len())?;
        ArgBuffer::from(args)
    } else {
        adapt_loose(arity, args)
    };
    Ok(if arity.needs_fixing(buf.len()) {
        fix_args(&buf, arity)
    } else {
        buf
    })
}

impl CallStack {
    /// A new closure for `definition`, closing over the current block and
    /// defining class.
    pub fn make_closure(
        &self,
        definition: &Arc<ClosureDefinition>,
        receiver: Value,
        captured: Vec<VarRef>,
    ) -> ClosureRef {
        Closure::new(
            definition,
            receiver,
            captured,
            self.current_class(),
            self.current_block().cloned(),
        )
    }

    /// The canonical closure for `definition` in the scope owning `memo`.
    pub fn closure_for(
        &self,
        memo: &ClosureMemo,
        definition: &Arc<ClosureDefinition>,
        receiver: Value,
        captured: Vec<VarRef>,
    ) -> ClosureRef {
        memo.get_or_create(definition.site, || {
            self.make_closure(definition, receiver, captured)
        })
    }

    /// Promotes `closure` to a long-lived proc value.
    pub fn to_proc(&self, closure: &ClosureRef) -> Value {
        closure.promote();
        Value::Proc(closure.clone())
    }

    fn compiled_body(&self, definition: &ClosureDefinition) -> DispatchResult<BlockBody> {
        if let Some(body) = definition.compiled.get() {
            return Ok(body.clone());
        }
        let _guard = self.shared.caches.compile_lock.lock();
        if let Some(body) = definition.compiled.get() {
            return Ok(body.clone());
        }
        let body = self.shared.bridge.compile(definition)?;
        self.shared.metrics.record_closure_compilation();
        tracing::debug!(site = definition.site, "compiled closure");
        Ok(definition.compiled.get_or_init(|| body).clone())
    }

    pub fn invoke_closure(
        &mut self,
        closure: &ClosureRef,
        self_override: Option<&Value>,
        args: &[Value],
    ) -> DispatchResult<Value> {
        let flags = closure.flags();
        if flags.contains(ClosureFlags::EMPTY) {
            return Ok(Value::Nil);
        }
        let definition = match &closure.target {
            Target::Bound(method) => return method.call(self, args, None),
            Target::Compiled(d) => d,
        };

        let adapted;
        let args = if flags.contains(ClosureFlags::NATIVE_THUNK) {
            args
        } else {
            adapted = adapt_block_args(&closure.arity, flags.contains(ClosureFlags::LAMBDA), args)?;
            &adapted[..]
        };

        let body = self.compiled_body(definition)?;

        let instance = if closure.try_activate() {
            closure.clone()
        } else {
            let copy = closure.duplicate();
            copy.try_activate();
            self.shared.metrics.record_closure_duplication();
            crate::vm_debug!(self, site = definition.site, "duplicated active closure");
            copy
        };
        let _active = Activation(instance.clone());

        let mut ctx = self.enter_closure(instance.parent.clone(), instance.defining_class);
        let receiver = self_override.unwrap_or(&instance.receiver);
        body(&mut *ctx, &instance, receiver, args)
    }

    /// Invokes the current block; `LocalJumpError` when there is none.
    pub fn yield_block(&mut self, args: &[Value]) -> DispatchResult<Value> {
        match self.current_block().cloned() {
            Some(block) => self.invoke_closure(&block, None, args),
            None => Err(DispatchError::LocalJump("no block given (yield)".to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ints(v: &[i64]) -> Vec<Value> {
        v.iter().copied().map(Value::Fixnum).collect()
    }

    #[test]
    fn test_loose_pad_and_truncate() {
        let two = Arity::fixed(2);
        let padded = adapt_block_args(&two, false, &ints(&[1])).unwrap();
        assert_eq!(padded.len(), 2);
        assert!(padded[1].is_nil());
        let cut = adapt_block_args(&two, false, &ints(&[1, 2, 3])).unwrap();
        assert_eq!(cut.len(), 2);
        assert_eq!(cut[1].as_fixnum(), Some(2));
    }

    #[test]
    fn test_loose_auto_splat() {
        let two = Arity::fixed(2);
        let arg = [Value::array(ints(&[7, 8]))];
        let splatted = adapt_block_args(&two, false, &arg).unwrap();
        assert_eq!(splatted[0].as_fixnum(), Some(7));
        assert_eq!(splatted[1].as_fixnum(), Some(8));

        // one required plus rest also splats
        let rest = Arity::from_params(1, 0, true, 0);
        let splatted = adapt_block_args(&rest, false, &arg).unwrap();
        assert_eq!(splatted[0].as_fixnum(), Some(7));
        assert_eq!(splatted[1].array_items().unwrap().len(), 1);

        // exactly one parameter receives the array itself
        let one = Arity::fixed(1);
        let kept = adapt_block_args(&one, false, &arg).unwrap();
        assert_eq!(kept.len(), 1);
        assert!(kept[0].as_array().is_some());
    }

    #[test]
    fn test_lambda_is_strict() {
        let two = Arity::fixed(2);
        assert!(adapt_block_args(&two, true, &ints(&[1])).unwrap_err().is_argument_error());
        assert!(adapt_block_args(&two, true, &[Value::array(ints(&[1, 2]))]).is_err());
        assert_eq!(adapt_block_args(&two, true, &ints(&[1, 2])).unwrap().len(), 2);
    }

    #[test]
    fn test_deep_copy_is_independent() {
        let scope = LocalScope::new(Arc::from([Selector::intern("x"), Selector::intern("y")]));
        scope.set(0, Value::Fixnum(1));
        let copy = scope.deep_copy();
        copy.set(0, Value::Fixnum(2));
        assert_eq!(scope.get(0).as_fixnum(), Some(1));
        assert_eq!(copy.get(0).as_fixnum(), Some(2));
        assert_eq!(copy.names(), scope.names());
        assert!(copy.lookup(Selector::intern("y")).is_some());
    }

    #[test]
    fn test_duplicate_shares_captures() {
        let outer = LocalScope::new(Arc::from([Selector::intern("total")]));
        let def = ClosureDefinition::new(Arity::fixed(0), ClosureFlags::empty(), &["i"], |_, _, _, _| {
            Ok(Value::Nil)
        });
        let c = Closure::new(&def, Value::Nil, vec![outer.var(0)], None, None);
        assert!(c.try_activate());
        assert!(!c.try_activate());
        let d = c.duplicate();
        assert!(!d.is_active());
        assert!(d.captured[0].same_slot(&c.captured[0]));
        d.locals.set(0, Value::Fixnum(5));
        assert!(c.locals.get(0).is_nil());
    }

    #[test]
    fn test_memo_replaces_long_lived() {
        let def = ClosureDefinition::new(Arity::fixed(0), ClosureFlags::empty(), &[], |_, _, _, _| {
            Ok(Value::Nil)
        });
        let memo = ClosureMemo::new();
        let make = || Closure::new(&def, Value::Nil, vec![], None, None);
        let a = memo.get_or_create(def.site, make);
        let b = memo.get_or_create(def.site, make);
        assert!(Arc::ptr_eq(&a, &b));
        a.promote();
        let c = memo.get_or_create(def.site, make);
        assert!(!Arc::ptr_eq(&a, &c));
        assert_eq!(memo.len(), 1);
    }
}
