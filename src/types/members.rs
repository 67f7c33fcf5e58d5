use crate::{
    error::DispatchResult,
    types::{Arity, ClassId, TypeSignature},
    value::{Selector, Value},
    vm::CallStack,
};
use bitflags::bitflags;
use libffi::middle::CodePtr;
use std::{
    ffi::c_void,
    fmt::{Debug, Formatter},
    hash::{Hash, Hasher},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

/// Identity of one method implementation. Redefining a method produces a
/// new id; copying an entry into another class's table keeps it.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize)]
pub struct ImpId(pub u64);

impl ImpId {
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        ImpId(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl Debug for ImpId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "imp#{}", self.0)
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct MethodFlags: u8 {
        const PRIVATE = 1 << 0;
        /// The body does nothing; calls return nil without binding arguments.
        const EMPTY_BODY = 1 << 1;
        /// Defined through a variadic native entry point: the body receives
        /// the raw argument list and checks it itself.
        const VARIADIC = 1 << 2;
    }
}

/// Compiled body of a guest method: `(stack, self, fixed_args) -> result`.
pub type GuestBody = dyn Fn(&mut CallStack, &Value, &[Value]) -> DispatchResult<Value> + Send + Sync;

/// A resolved guest-language method.
pub struct MethodRecord {
    pub id: ImpId,
    pub selector: Selector,
    pub owner: ClassId,
    pub arity: Arity,
    pub flags: MethodFlags,
    pub body: Arc<GuestBody>,
}

impl MethodRecord {
    pub fn new(
        selector: Selector,
        owner: ClassId,
        arity: Arity,
        flags: MethodFlags,
        body: Arc<GuestBody>,
    ) -> Self {
        Self {
            id: ImpId::next(),
            selector,
            owner,
            arity,
            flags,
            body,
        }
    }

    pub fn is_private(&self) -> bool {
        self.flags.contains(MethodFlags::PRIVATE)
    }

    /// Whether a call may return nil straight away.
    pub fn is_trivially_empty(&self) -> bool {
        self.flags.contains(MethodFlags::EMPTY_BODY)
            && self.arity.optional() == 0
            && !self.arity.has_rest()
    }
}

impl Debug for MethodRecord {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:?} {:?}#{} {:?} {:?}",
            self.id, self.owner, self.selector, self.arity, self.flags
        )
    }
}

/// Address of a native function. Constructing one asserts that the address
/// is callable with the C ABI and the signature it is registered under.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct EntryPoint(*const c_void);

// SAFETY: an entry point is an immutable code address.
unsafe impl Send for EntryPoint {}
unsafe impl Sync for EntryPoint {}

impl EntryPoint {
    /// # Safety
    /// `ptr` must be a C ABI function whose parameter and return types match
    /// the type signature it is registered with.
    pub unsafe fn new(ptr: *const c_void) -> Self {
        Self(ptr)
    }

    pub fn code_ptr(self) -> CodePtr {
        CodePtr::from_ptr(self.0)
    }

    pub fn addr(self) -> usize {
        self.0 as usize
    }
}

impl Debug for EntryPoint {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:p}", self.0)
    }
}

/// A method implemented in native code. The signature includes the
/// receiver (`@`) and selector (`:`) parameters.
#[derive(Debug)]
pub struct NativeMethod {
    pub id: ImpId,
    pub selector: Selector,
    pub owner: ClassId,
    pub signature: TypeSignature,
    pub variadic: bool,
    pub entry: EntryPoint,
}

impl NativeMethod {
    pub fn new(
        selector: Selector,
        owner: ClassId,
        signature: TypeSignature,
        variadic: bool,
        entry: EntryPoint,
    ) -> Self {
        Self {
            id: ImpId::next(),
            selector,
            owner,
            signature,
            variadic,
            entry,
        }
    }

    /// Arguments the caller supplies, not counting receiver and selector.
    pub fn arity(&self) -> Arity {
        let fixed = self.signature.params.len().saturating_sub(2);
        Arity::from_params(fixed, 0, self.variadic, 0)
    }
}

/// A free native function callable by name, ignoring the receiver.
#[derive(Debug)]
pub struct BridgedFunction {
    pub id: ImpId,
    pub name: Arc<str>,
    pub signature: TypeSignature,
    pub variadic: bool,
    pub entry: EntryPoint,
}

impl BridgedFunction {
    pub fn new(name: &str, signature: TypeSignature, variadic: bool, entry: EntryPoint) -> Self {
        Self {
            id: ImpId::next(),
            name: Arc::from(name),
            signature,
            variadic,
            entry,
        }
    }

    pub fn arity(&self) -> Arity {
        Arity::from_params(self.signature.params.len(), 0, self.variadic, 0)
    }
}

/// What the object model resolves a (class, selector) pair to.
#[derive(Clone, Debug)]
pub enum Implementation {
    Guest(Arc<MethodRecord>),
    Native(Arc<NativeMethod>),
}

impl Implementation {
    pub fn id(&self) -> ImpId {
        match self {
            Implementation::Guest(m) => m.id,
            Implementation::Native(m) => m.id,
        }
    }

    pub fn owner(&self) -> ClassId {
        match self {
            Implementation::Guest(m) => m.owner,
            Implementation::Native(m) => m.owner,
        }
    }

    pub fn selector(&self) -> Selector {
        match self {
            Implementation::Guest(m) => m.selector,
            Implementation::Native(m) => m.selector,
        }
    }

    pub fn arity(&self) -> Arity {
        match self {
            Implementation::Guest(m) => m.arity,
            Implementation::Native(m) => m.arity(),
        }
    }

    pub fn is_guest(&self) -> bool {
        matches!(self, Implementation::Guest(_))
    }

    pub fn is_private(&self) -> bool {
        match self {
            Implementation::Guest(m) => m.is_private(),
            Implementation::Native(_) => false,
        }
    }
}

impl PartialEq for Implementation {
    fn eq(&self, other: &Self) -> bool {
        self.id() == other.id()
    }
}

impl Eq for Implementation {}

impl Hash for Implementation {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id().hash(state);
    }
}
