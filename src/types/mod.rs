pub mod arity;
pub mod members;
pub mod signature;

pub use arity::{fix_args, fix_args_if_needed, Arity};
pub use members::{
    BridgedFunction, EntryPoint, GuestBody, ImpId, Implementation, MethodFlags, MethodRecord,
    NativeMethod,
};
pub use signature::{NativeType, TypeSignature};

use std::fmt;

/// Runtime class identity. Indexes the object model's class table.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize)]
pub struct ClassId(pub u32);

impl fmt::Debug for ClassId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ClassId({})", self.0)
    }
}
