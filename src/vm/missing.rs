use crate::{
    error::{DispatchError, DispatchResult, MissingReason},
    resolve::ObjectModel,
    types::{ClassId, Implementation},
    value::{ArgBuffer, Selector, Value},
    vm::{closure::ClosureRef, dispatch::DispatchKind, CallStack},
};

/// Selector of the guest handler for unresolved messages.
pub const METHOD_MISSING: &str = "method_missing:";

/// `foo:` called with arguments while only `foo` exists, or `foo` called
/// without arguments while only `foo:` exists, is an argument count mistake
/// against a guest method rather than a missing method.
fn twin_arity_error(
    model: &dyn ObjectModel,
    class: ClassId,
    selector: Selector,
    argc: usize,
) -> Option<DispatchError> {
    let twin = if argc > 0 {
        selector.without_colon()?
    } else if selector.colon_count() == 0 {
        selector.with_colon()
    } else {
        return None;
    };
    match model.resolve_method(class, twin)? {
        Implementation::Guest(m) => Some(DispatchError::arity(argc, m.arity.min, m.arity.max)),
        Implementation::Native(_) => None,
    }
}

impl CallStack {
    /// Hands an unresolved message to the receiver's `method_missing`, or
    /// fails with `NoMethod` when it has none.
    pub(crate) fn method_missing(
        &mut self,
        receiver: &Value,
        selector: Selector,
        block: Option<ClosureRef>,
        reason: MissingReason,
        args: &[Value],
    ) -> DispatchResult<Value> {
        self.shared.metrics.record_method_missing();
        let shared = self.shared.clone();
        let model = &*shared.model;
        let class = model.class_of(receiver);

        if matches!(reason, MissingReason::Default | MissingReason::VCall) {
            if let Some(e) = twin_arity_error(model, class, selector, args.len()) {
                return Err(e);
            }
        }

        let name = selector.missing_name();
        let handler = Selector::intern(METHOD_MISSING);
        if model.resolve_method(class, handler).is_some() {
            crate::vm_debug!(self, %selector, ?reason, "escalating to method_missing");
            let mut full = ArgBuffer::with_capacity(args.len() + 1);
            full.push(Value::Symbol(Selector::intern(&name)));
            full.extend(args.iter().cloned());

            let mut ctx = self.enter_method_missing(reason);
            return ctx.dispatch(
                &shared.caches.method_missing,
                receiver,
                handler,
                block,
                DispatchKind::FCall,
                &full,
            );
        }

        let class_name = model.class_name(class);
        tracing::warn!(%selector, class = %class_name, ?reason, "no method");
        Err(DispatchError::no_method(&*name, &*class_name, reason))
    }
}
