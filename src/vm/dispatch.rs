//! The dispatch engine.
//!
//! Every call enters through [`CallStack::dispatch`] with the cache of its
//! call site. A cache hit invokes the remembered strategy directly. A miss
//! resolves the selector against the receiver's class, trying in order:
//!
//! 1. the method tables along the ancestor list,
//! 2. a catch-all forwarding entry,
//! 3. keyword coalescing (`name:k1:k2:` retried as `name:` with a mapping),
//! 4. accessor rewriting (`foo=:` as `setFoo:`, `foo?` as `isFoo`),
//! 5. a bridged native function named like the selector,
//!
//! and escalates to method-missing when all of them fail.
use crate::{
    error::{DispatchError, DispatchResult, MissingReason},
    resolve::ObjectModel,
    types::{ClassId, Implementation, NativeMethod},
    value::{ArgBuffer, Selector, Value},
    vm::{
        cache::{BridgedFunctionCall, CacheEntry, CallSiteCache, GuestCall, Invoke, NativeCall, Strategy},
        closure::ClosureRef,
        CallStack,
    },
};
use serde::Serialize;
use std::sync::Arc;

/// How a call site names its receiver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum DispatchKind {
    /// Explicit receiver; private methods are rejected.
    Normal,
    /// Implicit `self` receiver.
    FCall,
    /// Bare word with no receiver and no arguments.
    VCall,
    Super,
}

/// One argument expression at a call site.
#[derive(Debug, Clone)]
pub enum CallArg {
    Value(Value),
    /// `*expr`: an array contributes its elements, anything else itself.
    Splat(Value),
}

/// Flattens spread arguments into a plain argument list.
pub fn expand_spread(args: &[CallArg], capacity: usize) -> ArgBuffer {
    let mut out = ArgBuffer::new();
    out.reserve(capacity.max(args.len()));
    for arg in args {
        match arg {
            CallArg::Value(v) => out.push(v.clone()),
            CallArg::Splat(v) => match v.array_items() {
                Some(items) => out.extend(items),
                None => out.push(v.clone()),
            },
        }
    }
    out
}

enum Resolution {
    /// Cache under the receiver's class.
    Cacheable(Strategy),
    /// Retry with another selector and arguments, bypassing the cache.
    Coalesced(Selector, ArgBuffer),
    Missing(MissingReason),
}

impl CallStack {
    pub fn dispatch(
        &mut self,
        cache: &CallSiteCache,
        receiver: &Value,
        selector: Selector,
        block: Option<ClosureRef>,
        kind: DispatchKind,
        args: &[Value],
    ) -> DispatchResult<Value> {
        let model = self.shared.model.clone();
        let class = model.class_of(receiver);
        if kind == DispatchKind::Super {
            return self.dispatch_super(receiver, class, selector, block, args);
        }

        let argc = args.len();
        let serial = model.method_serial();
        if let Some(entry) = cache.lookup(class, selector, argc, serial) {
            self.shared.metrics.record_cache_hit();
            crate::vm_trace!(self, %selector, class = class.0, "cache hit");
            return entry.strategy.invoke(self, receiver, selector, block, args);
        }
        self.shared.metrics.record_cache_miss();

        match self.resolve(&*model, class, selector, kind, args)? {
            Resolution::Cacheable(strategy) => {
                let entry = Arc::new(CacheEntry::new(class, selector, argc, serial, strategy));
                cache.publish(entry.clone());
                self.shared.metrics.record_cache_fill();
                crate::vm_debug!(self, %selector, class = class.0, serial, "filled call-site cache");
                entry.strategy.invoke(self, receiver, selector, block, args)
            }
            Resolution::Coalesced(head, coalesced) => {
                self.shared.metrics.record_uncached();
                crate::vm_debug!(self, from = %selector, to = %head, "coalesced keyword arguments");
                self.dispatch(&CallSiteCache::new(), receiver, head, block, kind, &coalesced)
            }
            Resolution::Missing(reason) => self.method_missing(receiver, selector, block, reason, args),
        }
    }

    /// Dispatches after expanding spread arguments.
    pub fn dispatch_spread(
        &mut self,
        cache: &CallSiteCache,
        receiver: &Value,
        selector: Selector,
        block: Option<ClosureRef>,
        kind: DispatchKind,
        args: &[CallArg],
    ) -> DispatchResult<Value> {
        let expanded = expand_spread(args, self.shared.config.spread_capacity);
        self.dispatch(cache, receiver, selector, block, kind, &expanded)
    }

    /// An ad hoc call through a throwaway cache. Private methods are allowed.
    pub fn send(
        &mut self,
        receiver: &Value,
        selector: impl Into<Selector>,
        args: &[Value],
    ) -> DispatchResult<Value> {
        self.shared.metrics.record_uncached();
        self.dispatch(
            &CallSiteCache::new(),
            receiver,
            selector.into(),
            None,
            DispatchKind::FCall,
            args,
        )
    }

    pub fn respond_to(&self, receiver: &Value, selector: impl Into<Selector>, include_private: bool) -> bool {
        let model = self.model();
        model
            .resolve_method(model.class_of(receiver), selector.into())
            .is_some_and(|m| include_private || !m.is_private())
    }

    /// Allocates an instance of `class` and runs its initializer.
    pub fn instantiate(
        &mut self,
        class: ClassId,
        args: &[Value],
        block: Option<ClosureRef>,
    ) -> DispatchResult<Value> {
        let object = self.model().allocate(class)?;
        let initialize = Selector::intern(if args.is_empty() { "initialize" } else { "initialize:" });
        if self.respond_to(&object, initialize, true) {
            self.dispatch(&CallSiteCache::new(), &object, initialize, block, DispatchKind::FCall, args)?;
        } else if !args.is_empty() {
            return Err(DispatchError::arity(args.len(), 0, 0));
        }
        Ok(object)
    }

    fn dispatch_super(
        &mut self,
        receiver: &Value,
        class: ClassId,
        selector: Selector,
        block: Option<ClosureRef>,
        args: &[Value],
    ) -> DispatchResult<Value> {
        self.shared.metrics.record_super_lookup();
        match self.super_lookup(class, selector) {
            Some(implementation) => {
                crate::vm_trace!(self, %selector, owner = implementation.owner().0, "super resolved");
                let strategy = self.strategy_for(&implementation, args.len())?;
                strategy.invoke(self, receiver, selector, block, args)
            }
            None => self.method_missing(receiver, selector, block, MissingReason::Super, args),
        }
    }

    fn resolve(
        &self,
        model: &dyn ObjectModel,
        class: ClassId,
        selector: Selector,
        kind: DispatchKind,
        args: &[Value],
    ) -> DispatchResult<Resolution> {
        let argc = args.len();
        let config = &self.shared.config;

        if let Some(implementation) = model.resolve_method(class, selector) {
            if kind == DispatchKind::Normal && implementation.is_private() {
                return Ok(Resolution::Missing(MissingReason::Private));
            }
            let strategy = self.strategy_for(&implementation, argc)?;
            return Ok(Resolution::Cacheable(strategy));
        }

        if let Some(forward) = model.forwarding_entry(class) {
            crate::vm_debug!(self, %selector, "forwarding to catch-all entry");
            let strategy = self.native_strategy(forward, argc, true)?;
            return Ok(Resolution::Cacheable(strategy));
        }

        if config.keyword_coalescing {
            if let Some((head, keys)) = selector.keyword_parts() {
                if argc == keys.len() + 1 && model.resolve_method(class, head).is_some() {
                    let mapping = Value::hash(
                        keys.into_iter()
                            .map(Value::Symbol)
                            .zip(args[1..].iter().cloned()),
                    );
                    let mut coalesced = ArgBuffer::new();
                    coalesced.push(args[0].clone());
                    coalesced.push(mapping);
                    return Ok(Resolution::Coalesced(head, coalesced));
                }
            }
        }

        if config.accessor_rewrite {
            if let Some(rewritten) = selector.accessor_rewrite(argc) {
                if let Some(implementation) = model.resolve_method(class, rewritten) {
                    if kind == DispatchKind::Normal && implementation.is_private() {
                        return Ok(Resolution::Missing(MissingReason::Private));
                    }
                    crate::vm_debug!(self, from = %selector, to = %rewritten, "rewrote accessor selector");
                    let strategy = self.strategy_for(&implementation, argc)?;
                    return Ok(Resolution::Cacheable(strategy));
                }
            }
        }

        if config.bridged_functions {
            if let Some(function) = model.bridged_function(&selector.missing_name()) {
                function.arity().check(argc)?;
                let stub = self
                    .shared
                    .call_stub(&function.signature, function.variadic, argc)?;
                crate::vm_debug!(self, %selector, "bridged to native function");
                return Ok(Resolution::Cacheable(BridgedFunctionCall { function, stub }.into()));
            }
        }

        Ok(Resolution::Missing(if kind == DispatchKind::VCall {
            MissingReason::VCall
        } else {
            MissingReason::Default
        }))
    }

    pub(crate) fn strategy_for(&self, implementation: &Implementation, argc: usize) -> DispatchResult<Strategy> {
        match implementation {
            Implementation::Guest(method) => Ok(GuestCall {
                method: method.clone(),
            }
            .into()),
            Implementation::Native(method) => self.native_strategy(method.clone(), argc, false),
        }
    }

    fn native_strategy(
        &self,
        method: Arc<NativeMethod>,
        argc: usize,
        forwarded: bool,
    ) -> DispatchResult<Strategy> {
        if !forwarded {
            method.arity().check(argc)?;
        }
        let stub = self
            .shared
            .call_stub(&method.signature, method.variadic, argc + 2)?;
        Ok(NativeCall {
            method,
            stub,
            forwarded,
        }
        .into())
    }
}
