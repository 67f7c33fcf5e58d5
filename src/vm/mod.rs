//! The dispatch engine and everything it drives: call-site caches, native
//! call stubs, closure activation, super lookup and operator fast paths.
#[macro_use]
mod macros;
mod ancestor;
pub mod bound_method;
pub mod bridge;
pub mod cache;
pub mod closure;
pub mod config;
pub mod dispatch;
pub mod fastpath;
pub mod metrics;
mod missing;
mod stack;
pub mod state;

pub use bound_method::{BoundMethod, BoundMethodRef};
pub use bridge::{CallStub, CodeBridge, FfiBridge, HandleTable, NativeLibraries};
pub use cache::CallSiteCache;
pub use closure::{
    BindingArena, BlockBody, Closure, ClosureDefinition, ClosureFlags, ClosureMemo, ClosureRef,
    LocalScope, VarRef,
};
pub use config::DispatchConfig;
pub use dispatch::{expand_spread, CallArg, DispatchKind};
pub use fastpath::OperatorSite;
pub use metrics::{DispatchStats, RuntimeMetrics};
pub use missing::METHOD_MISSING;
pub use stack::{CallStack, ContextGuard, StackFrame};
pub use state::SharedGlobalState;
