//! Per-call-site inline caches.
//!
//! A [`CallSiteCache`] holds at most one shared [`CacheEntry`]. An entry is
//! immutable and carries the receiver class, the method serial and the
//! strategy together, so a reader always sees a class paired with the
//! strategy it was resolved for. Racing fills both resolve and the last store
//! wins; the replaced entry is freed once no reader holds it.
use crate::{
    error::DispatchResult,
    types::{fix_args_if_needed, BridgedFunction, ClassId, ImpId, MethodFlags, MethodRecord, NativeMethod},
    value::{ArgBuffer, Selector, Value},
    vm::{bridge::CallStub, closure::ClosureRef, CallStack, StackFrame},
};
use arc_swap::ArcSwapOption;
use enum_dispatch::enum_dispatch;
use std::{fmt, sync::Arc};

#[enum_dispatch]
pub trait Invoke {
    fn invoke(
        &self,
        stack: &mut CallStack,
        receiver: &Value,
        selector: Selector,
        block: Option<ClosureRef>,
        args: &[Value],
    ) -> DispatchResult<Value>;
}

#[derive(Debug)]
pub struct GuestCall {
    pub method: Arc<MethodRecord>,
}

impl Invoke for GuestCall {
    fn invoke(
        &self,
        stack: &mut CallStack,
        receiver: &Value,
        _selector: Selector,
        block: Option<ClosureRef>,
        args: &[Value],
    ) -> DispatchResult<Value> {
        let m = &self.method;
        let variadic = m.flags.contains(MethodFlags::VARIADIC);
        if !variadic {
            m.arity.check(args.len())?;
            if m.is_trivially_empty() {
                return Ok(Value::Nil);
            }
        }

        let fixed;
        let args = if variadic {
            args
        } else {
            fixed = fix_args_if_needed(args, &m.arity);
            fixed.as_deref().unwrap_or(args)
        };

        let mut frame = stack.enter_method(StackFrame::new(m.owner, m.selector, m.id), block);
        (m.body)(&mut *frame, receiver, args)
    }
}

#[derive(Debug)]
pub struct NativeCall {
    pub method: Arc<NativeMethod>,
    pub stub: Arc<CallStub>,
    /// Sent through a catch-all forwarding entry; the native side receives
    /// the original selector.
    pub forwarded: bool,
}

impl Invoke for NativeCall {
    fn invoke(
        &self,
        stack: &mut CallStack,
        receiver: &Value,
        selector: Selector,
        block: Option<ClosureRef>,
        args: &[Value],
    ) -> DispatchResult<Value> {
        let m = &self.method;
        let cmd = if self.forwarded { selector } else { m.selector };
        let mut full = ArgBuffer::with_capacity(args.len() + 2);
        full.push(receiver.clone());
        full.push(Value::Symbol(cmd));
        full.extend(args.iter().cloned());

        let frame = stack.enter_method(StackFrame::new(m.owner, m.selector, m.id), block);
        self.stub.invoke(&frame.shared.handles, m.entry, &full)
    }
}

#[derive(Debug)]
pub struct BridgedFunctionCall {
    pub function: Arc<BridgedFunction>,
    pub stub: Arc<CallStub>,
}

impl Invoke for BridgedFunctionCall {
    fn invoke(
        &self,
        stack: &mut CallStack,
        _receiver: &Value,
        _selector: Selector,
        _block: Option<ClosureRef>,
        args: &[Value],
    ) -> DispatchResult<Value> {
        self.stub
            .invoke(&stack.shared.handles, self.function.entry, args)
    }
}

#[enum_dispatch(Invoke)]
#[derive(Debug)]
pub enum Strategy {
    GuestCall,
    NativeCall,
    BridgedFunctionCall,
}

impl Strategy {
    fn implementation(&self) -> ImpId {
        match self {
            Strategy::GuestCall(g) => g.method.id,
            Strategy::NativeCall(n) => n.method.id,
            Strategy::BridgedFunctionCall(b) => b.function.id,
        }
    }

    /// Native stubs are built for one argument count.
    fn argc_sized(&self) -> bool {
        !matches!(self, Strategy::GuestCall(_))
    }
}

#[derive(Debug)]
pub struct CacheEntry {
    pub class: ClassId,
    pub selector: Selector,
    /// Only set for strategies whose stub is sized for one argument count.
    pub argc: Option<usize>,
    pub serial: u64,
    pub strategy: Strategy,
}

impl CacheEntry {
    pub fn new(class: ClassId, selector: Selector, argc: usize, serial: u64, strategy: Strategy) -> Self {
        Self {
            class,
            selector,
            argc: strategy.argc_sized().then_some(argc),
            serial,
            strategy,
        }
    }

    pub fn matches(&self, class: ClassId, selector: Selector, argc: usize, serial: u64) -> bool {
        self.serial == serial
            && self.class == class
            && self.selector == selector
            && self.argc.map_or(true, |n| n == argc)
    }
}

#[derive(Default)]
pub struct CallSiteCache {
    entry: ArcSwapOption<CacheEntry>,
}

impl CallSiteCache {
    pub const fn new() -> Self {
        Self {
            entry: ArcSwapOption::const_empty(),
        }
    }

    pub fn current(&self) -> Option<Arc<CacheEntry>> {
        self.entry.load_full()
    }

    /// The cached entry, if it was filled for this receiver class, selector
    /// and argument count under the current method serial.
    pub fn lookup(
        &self,
        class: ClassId,
        selector: Selector,
        argc: usize,
        serial: u64,
    ) -> Option<Arc<CacheEntry>> {
        self.current()
            .filter(|e| e.matches(class, selector, argc, serial))
    }

    pub fn publish(&self, entry: Arc<CacheEntry>) {
        self.entry.store(Some(entry));
    }

    pub fn clear(&self) {
        self.entry.store(None);
    }

    pub fn is_empty(&self) -> bool {
        self.entry.load().is_none()
    }
}

impl fmt::Debug for CallSiteCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.current() {
            None => write!(f, "CallSiteCache(empty)"),
            Some(e) => write!(
                f,
                "CallSiteCache({:?} {} -> {:?})",
                e.class,
                e.selector,
                e.strategy.implementation()
            ),
        }
    }
}
