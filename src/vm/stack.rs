use crate::{
    error::MissingReason,
    resolve::ObjectModel,
    types::{ClassId, ImpId},
    value::Selector,
    vm::{closure::ClosureRef, state::SharedGlobalState},
};
use std::{
    ops::{Deref, DerefMut},
    sync::Arc,
};

/// One method activation: the class that defines the running implementation,
/// the selector it was entered through, and the implementation itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StackFrame {
    pub class: ClassId,
    pub selector: Selector,
    pub implementation: ImpId,
}

impl StackFrame {
    pub fn new(class: ClassId, selector: Selector, implementation: ImpId) -> Self {
        Self {
            class,
            selector,
            implementation,
        }
    }
}

/// Per-thread dispatch state: the explicit frame stack super lookup scans,
/// and the lexical context (current block and defining class) nested bodies
/// observe.
pub struct CallStack {
    pub shared: Arc<SharedGlobalState>,
    frames: Vec<StackFrame>,
    current_block: Option<ClosureRef>,
    current_class: Option<ClassId>,
    missing_reason: Option<MissingReason>,
}

impl CallStack {
    pub fn new(shared: Arc<SharedGlobalState>) -> Self {
        Self {
            shared,
            frames: vec![],
            current_block: None,
            current_class: None,
            missing_reason: None,
        }
    }

    pub fn model(&self) -> &dyn ObjectModel {
        &*self.shared.model
    }

    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    pub fn frames(&self) -> &[StackFrame] {
        &self.frames
    }

    pub fn current_frame(&self) -> Option<&StackFrame> {
        self.frames.last()
    }

    /// The block passed to the running method, or the parent block of the
    /// running closure.
    pub fn current_block(&self) -> Option<&ClosureRef> {
        self.current_block.as_ref()
    }

    pub fn current_class(&self) -> Option<ClassId> {
        self.current_class
    }

    /// Why the running `method_missing` handler was entered.
    pub fn method_missing_reason(&self) -> Option<MissingReason> {
        self.missing_reason
    }

    fn save(&mut self, frame: Option<StackFrame>) -> ContextGuard<'_> {
        let pushed = frame.is_some();
        if let Some(f) = frame {
            self.frames.push(f);
        }
        ContextGuard {
            saved_block: self.current_block.clone(),
            saved_class: self.current_class,
            saved_reason: self.missing_reason,
            pushed,
            stack: self,
        }
    }

    /// Pushes a method frame and installs its block and defining class until
    /// the guard is dropped.
    pub(crate) fn enter_method(
        &mut self,
        frame: StackFrame,
        block: Option<ClosureRef>,
    ) -> ContextGuard<'_> {
        let class = frame.class;
        let mut guard = self.save(Some(frame));
        guard.current_block = block;
        guard.current_class = Some(class);
        guard
    }

    /// Installs a closure's lexical context until the guard is dropped.
    pub(crate) fn enter_closure(
        &mut self,
        block: Option<ClosureRef>,
        class: Option<ClassId>,
    ) -> ContextGuard<'_> {
        let mut guard = self.save(None);
        guard.current_block = block;
        if class.is_some() {
            guard.current_class = class;
        }
        guard
    }

    pub(crate) fn enter_method_missing(&mut self, reason: MissingReason) -> ContextGuard<'_> {
        let mut guard = self.save(None);
        guard.missing_reason = Some(reason);
        guard
    }
}

/// Restores the context a call replaced, on every exit path.
pub struct ContextGuard<'a> {
    stack: &'a mut CallStack,
    saved_block: Option<ClosureRef>,
    saved_class: Option<ClassId>,
    saved_reason: Option<MissingReason>,
    pushed: bool,
}

impl Deref for ContextGuard<'_> {
    type Target = CallStack;
    fn deref(&self) -> &CallStack {
        self.stack
    }
}

impl DerefMut for ContextGuard<'_> {
    fn deref_mut(&mut self) -> &mut CallStack {
        self.stack
    }
}

impl Drop for ContextGuard<'_> {
    fn drop(&mut self) {
        if self.pushed {
            self.stack.frames.pop();
        }
        self.stack.current_block = self.saved_block.take();
        self.stack.current_class = self.saved_class;
        self.stack.missing_reason = self.saved_reason;
    }
}
