use crate::{
    error::{DispatchError, DispatchResult, MissingReason},
    types::{Arity, ClassId, Implementation},
    value::{Selector, Value},
    vm::{
        cache::CallSiteCache,
        closure::{Closure, ClosureRef},
        dispatch::DispatchKind,
        CallStack,
    },
};
use std::sync::Arc;

/// A method detached from its call site together with its receiver.
///
/// Each bound method owns a one-entry cache, so calling it repeatedly never
/// competes with other call sites for a cache slot.
#[derive(Debug)]
pub struct BoundMethod {
    /// Class of the receiver at bind time.
    pub origin: ClassId,
    /// Class that defines the implementation.
    pub class: ClassId,
    pub receiver: Value,
    pub selector: Selector,
    pub arity: Arity,
    pub implementation: Implementation,
    cache: CallSiteCache,
}

pub type BoundMethodRef = Arc<BoundMethod>;

impl BoundMethod {
    pub fn call(
        &self,
        stack: &mut CallStack,
        args: &[Value],
        block: Option<ClosureRef>,
    ) -> DispatchResult<Value> {
        stack.dispatch(
            &self.cache,
            &self.receiver,
            self.selector,
            block,
            DispatchKind::FCall,
            args,
        )
    }

    /// A lambda closure calling this method.
    pub fn to_proc(self: &Arc<Self>) -> ClosureRef {
        Closure::from_bound_method(self.clone())
    }
}

impl CallStack {
    /// Binds `selector` on `receiver`. Private methods can be bound.
    pub fn bind_method(&self, receiver: &Value, selector: Selector) -> DispatchResult<BoundMethodRef> {
        let model = self.model();
        let origin = model.class_of(receiver);
        let Some(implementation) = model.resolve_method(origin, selector) else {
            return Err(DispatchError::no_method(
                &*selector.missing_name(),
                &*model.class_name(origin),
                MissingReason::Default,
            ));
        };
        Ok(Arc::new(BoundMethod {
            origin,
            class: implementation.owner(),
            receiver: receiver.clone(),
            selector,
            arity: implementation.arity(),
            implementation,
            cache: CallSiteCache::new(),
        }))
    }
}
