//! Method dispatch for a dynamic language hosted on a native object runtime.
//!
//! Calls enter through [`vm::CallStack::dispatch`] with the inline cache of
//! their call site. Classes and method tables live behind
//! [`resolve::ObjectModel`]; [`resolve::ClassTable`] is the in-crate model.
pub mod error;
pub mod resolve;
pub mod types;
pub mod value;
#[macro_use]
pub mod vm;

pub use error::{BridgeError, DispatchError, DispatchResult, MissingReason};
pub use types::{fix_args, Arity, ClassId};
pub use value::{Selector, Value};
pub use vm::{CallSiteCache, CallStack, DispatchKind, SharedGlobalState};
