//! The object model the dispatch core resolves against.
//!
//! Class structure, method tables and ancestor lists belong to the object
//! model. The dispatch core only reads them through [`ObjectModel`].
use crate::{
    error::DispatchResult,
    types::{BridgedFunction, ClassId, Implementation, NativeMethod},
    value::{Selector, Value},
};
use std::sync::Arc;

mod class_table;

pub use class_table::{Builtins, ClassTable};

pub trait ObjectModel: Send + Sync {
    fn class_of(&self, value: &Value) -> ClassId;

    fn class_name(&self, class: ClassId) -> Arc<str>;

    /// Looks `selector` up along the full ancestor list of `class`.
    fn resolve_method(&self, class: ClassId, selector: Selector) -> Option<Implementation>;

    /// Looks `selector` up in the method table of `class` alone.
    fn local_method(&self, class: ClassId, selector: Selector) -> Option<Implementation>;

    /// Linearized lookup order, starting with `class` itself.
    fn ancestors_of(&self, class: ClassId) -> Vec<ClassId>;

    fn superclass_of(&self, class: ClassId) -> Option<ClassId>;

    /// The catch-all entry instances of `class` forward unknown messages to.
    fn forwarding_entry(&self, class: ClassId) -> Option<Arc<NativeMethod>>;

    fn bridged_function(&self, name: &str) -> Option<Arc<BridgedFunction>>;

    /// Allocates an uninitialized instance. Fails with `TypeError` for classes
    /// without an allocator.
    fn allocate(&self, class: ClassId) -> DispatchResult<Value>;

    /// Bumped by every change to any method table or ancestor list.
    fn method_serial(&self) -> u64;
}
