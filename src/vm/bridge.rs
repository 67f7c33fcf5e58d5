//! Calls into native code.
//!
//! A [`CallStub`] is a libffi call interface built from a type signature for
//! one concrete argument count. Guest values are marshalled per parameter
//! type; objects cross the boundary as handles from the [`HandleTable`],
//! retained for the duration of the call.
use crate::{
    error::{BridgeError, DispatchResult},
    types::{ClassId, EntryPoint, NativeType, TypeSignature},
    value::{Selector, Value},
    vm::closure::{BlockBody, ClosureDefinition},
};
use dashmap::DashMap;
use libffi::middle::{Arg, Cif, Type};
use libloading::{Library, Symbol};
use smallvec::SmallVec;
use std::{
    collections::HashMap,
    ffi::{c_char, c_void, CStr, CString},
    path::{Path, PathBuf},
    sync::atomic::{AtomicU64, Ordering},
};

/// The code generation collaborator: compiles closure definitions and builds
/// calling stubs for native entry points.
pub trait CodeBridge: Send + Sync {
    fn compile(&self, definition: &ClosureDefinition) -> DispatchResult<BlockBody>;

    fn generate_call_stub(
        &self,
        signature: &TypeSignature,
        variadic: bool,
        argc: usize,
    ) -> Result<CallStub, BridgeError>;
}

/// Closure bodies arrive precompiled; call stubs are libffi call interfaces.
#[derive(Debug, Default)]
pub struct FfiBridge;

impl CodeBridge for FfiBridge {
    fn compile(&self, definition: &ClosureDefinition) -> DispatchResult<BlockBody> {
        Ok(definition.source().clone())
    }

    fn generate_call_stub(
        &self,
        signature: &TypeSignature,
        variadic: bool,
        argc: usize,
    ) -> Result<CallStub, BridgeError> {
        let stub = CallStub::new(signature, variadic, argc)?;
        tracing::debug!(%signature, variadic, argc, "generated call stub");
        Ok(stub)
    }
}

fn ffi_type(t: NativeType) -> Type {
    match t {
        NativeType::Void => Type::void(),
        NativeType::Char => Type::i8(),
        NativeType::UChar | NativeType::Bool => Type::u8(),
        NativeType::Short => Type::i16(),
        NativeType::UShort => Type::u16(),
        NativeType::Int | NativeType::Long => Type::i32(),
        NativeType::UInt | NativeType::ULong => Type::u32(),
        NativeType::LongLong => Type::i64(),
        NativeType::ULongLong => Type::u64(),
        NativeType::Float => Type::f32(),
        NativeType::Double => Type::f64(),
        NativeType::Object => Type::u64(),
        NativeType::Class | NativeType::Selector => Type::usize(),
        NativeType::CString | NativeType::Pointer => Type::pointer(),
    }
}

fn c_name(t: NativeType) -> &'static str {
    match t {
        NativeType::Void => "void",
        NativeType::Char => "char",
        NativeType::UChar => "unsigned char",
        NativeType::Short => "short",
        NativeType::UShort => "unsigned short",
        NativeType::Int => "int",
        NativeType::UInt => "unsigned int",
        NativeType::Long => "long",
        NativeType::ULong => "unsigned long",
        NativeType::LongLong => "long long",
        NativeType::ULongLong => "unsigned long long",
        NativeType::Float => "float",
        NativeType::Double => "double",
        NativeType::Bool => "BOOL",
        NativeType::Object => "id",
        NativeType::Class => "Class",
        NativeType::Selector => "SEL",
        NativeType::CString => "char *",
        NativeType::Pointer => "void *",
    }
}

pub struct CallStub {
    signature: TypeSignature,
    params: Vec<NativeType>,
    cif: Cif,
}

// SAFETY: the call interface is never mutated after construction, and libffi
// only reads it during a call.
unsafe impl Send for CallStub {}
unsafe impl Sync for CallStub {}

impl std::fmt::Debug for CallStub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "CallStub({} x{})", self.signature, self.params.len())
    }
}

enum Slot {
    I8(i8),
    U8(u8),
    I16(i16),
    U16(u16),
    I32(i32),
    U32(u32),
    I64(i64),
    U64(u64),
    F32(f32),
    F64(f64),
    Usize(usize),
    Ptr(*const c_void),
}

impl Slot {
    fn arg(&self) -> Arg {
        match self {
            Slot::I8(v) => Arg::new(v),
            Slot::U8(v) => Arg::new(v),
            Slot::I16(v) => Arg::new(v),
            Slot::U16(v) => Arg::new(v),
            Slot::I32(v) => Arg::new(v),
            Slot::U32(v) => Arg::new(v),
            Slot::I64(v) => Arg::new(v),
            Slot::U64(v) => Arg::new(v),
            Slot::F32(v) => Arg::new(v),
            Slot::F64(v) => Arg::new(v),
            Slot::Usize(v) => Arg::new(v),
            Slot::Ptr(v) => Arg::new(v),
        }
    }
}

/// Releases the handles retained for a call's arguments.
struct Retained<'a> {
    handles: &'a HandleTable,
    ids: SmallVec<[u64; 4]>,
}

impl Drop for Retained<'_> {
    fn drop(&mut self) {
        for id in self.ids.drain(..) {
            self.handles.release(id);
        }
    }
}

impl CallStub {
    pub fn new(signature: &TypeSignature, variadic: bool, argc: usize) -> Result<Self, BridgeError> {
        let params = signature.params_for(variadic, argc)?;
        let cif = Cif::new(params.iter().copied().map(ffi_type), ffi_type(signature.ret));
        Ok(Self {
            signature: signature.clone(),
            params,
            cif,
        })
    }

    pub fn signature(&self) -> &TypeSignature {
        &self.signature
    }

    pub fn argc(&self) -> usize {
        self.params.len()
    }

    /// Calls `entry` with `args`, one value per parameter of this stub.
    pub fn invoke(
        &self,
        handles: &HandleTable,
        entry: EntryPoint,
        args: &[Value],
    ) -> DispatchResult<Value> {
        if args.len() != self.params.len() {
            fatal!(
                "call stub for '{}' sized for {} arguments invoked with {}",
                self.signature,
                self.params.len(),
                args.len()
            );
        }

        let mut retained = Retained {
            handles,
            ids: SmallVec::new(),
        };
        let mut strings = vec![];
        let slots = self
            .params
            .iter()
            .zip(args)
            .map(|(t, v)| marshal(*t, v, &mut retained, &mut strings))
            .collect::<Result<SmallVec<[Slot; 8]>, _>>()?;
        let ffi_args = slots.iter().map(Slot::arg).collect::<SmallVec<[_; 8]>>();

        macro_rules! call {
            ($t:ty) => {
                // SAFETY: `entry` was registered under this signature and the
                // slots match the parameter types of the call interface.
                unsafe { self.cif.call::<$t>(entry.code_ptr(), &ffi_args) }
            };
        }

        // integer returns narrower than a register come back widened
        let v = match self.signature.ret {
            NativeType::Void => {
                call!(());
                Value::Nil
            }
            NativeType::Char => Value::Fixnum(call!(u64) as i8 as i64),
            NativeType::UChar => Value::Fixnum(call!(u64) as u8 as i64),
            NativeType::Short => Value::Fixnum(call!(u64) as i16 as i64),
            NativeType::UShort => Value::Fixnum(call!(u64) as u16 as i64),
            NativeType::Int | NativeType::Long => Value::Fixnum(call!(u64) as i32 as i64),
            NativeType::UInt | NativeType::ULong => Value::Fixnum(call!(u64) as u32 as i64),
            NativeType::LongLong => Value::Fixnum(call!(i64)),
            NativeType::ULongLong => Value::Fixnum(call!(u64) as i64),
            NativeType::Float => Value::Float(call!(f32) as f64),
            NativeType::Double => Value::Float(call!(f64)),
            NativeType::Bool => Value::Bool(call!(u64) as u8 != 0),
            NativeType::Object => match call!(u64) {
                0 => Value::Nil,
                h => handles.get(h).ok_or(BridgeError::UnknownHandle(h))?,
            },
            NativeType::Class => Value::Class(ClassId(call!(usize) as u32)),
            NativeType::Selector => match call!(usize) {
                0 => Value::Nil,
                word => Selector::from_id((word - 1) as u32)
                    .map(Value::Symbol)
                    .unwrap_or(Value::Nil),
            },
            NativeType::CString => {
                let p = call!(*const c_char);
                if p.is_null() {
                    Value::Nil
                } else {
                    // SAFETY: a `*` return is a NUL-terminated string
                    Value::string(&unsafe { CStr::from_ptr(p) }.to_string_lossy())
                }
            }
            NativeType::Pointer => Value::Fixnum(call!(usize) as i64),
        };
        drop(strings);
        Ok(v)
    }
}

fn marshal(
    t: NativeType,
    value: &Value,
    retained: &mut Retained,
    strings: &mut Vec<CString>,
) -> Result<Slot, BridgeError> {
    let mismatch = || BridgeError::Marshal {
        value: value.kind_name().to_string(),
        target: c_name(t),
    };

    if t.is_integer() {
        let i = match value {
            Value::Fixnum(i) => *i,
            Value::Float(f) if f.fract() == 0.0 && *f >= i64::MIN as f64 && *f < i64::MAX as f64 => *f as i64,
            _ => return Err(mismatch()),
        };
        let slot = match t {
            NativeType::Char => i8::try_from(i).map(Slot::I8).ok(),
            NativeType::UChar => u8::try_from(i).map(Slot::U8).ok(),
            NativeType::Short => i16::try_from(i).map(Slot::I16).ok(),
            NativeType::UShort => u16::try_from(i).map(Slot::U16).ok(),
            NativeType::Int | NativeType::Long => i32::try_from(i).map(Slot::I32).ok(),
            NativeType::UInt | NativeType::ULong => u32::try_from(i).map(Slot::U32).ok(),
            NativeType::LongLong => Some(Slot::I64(i)),
            _ => u64::try_from(i).map(Slot::U64).ok(),
        };
        return slot.ok_or_else(mismatch);
    }

    Ok(match t {
        NativeType::Float => Slot::F32(value.as_float().ok_or_else(mismatch)? as f32),
        NativeType::Double => Slot::F64(value.as_float().ok_or_else(mismatch)?),
        NativeType::Bool => Slot::U8(u8::from(value.truthy())),
        NativeType::Object => match value {
            Value::Nil => Slot::U64(0),
            v => {
                let id = retained.handles.retain(v.clone());
                retained.ids.push(id);
                Slot::U64(id)
            }
        },
        NativeType::Class => match value {
            Value::Class(c) => Slot::Usize(c.0 as usize),
            _ => return Err(mismatch()),
        },
        NativeType::Selector => match value {
            Value::Nil => Slot::Usize(0),
            Value::Symbol(s) => Slot::Usize(selector_word(*s)),
            _ => return Err(mismatch()),
        },
        NativeType::CString => match value {
            Value::Nil => Slot::Ptr(std::ptr::null()),
            Value::Str(s) => {
                let c = CString::new(s.as_bytes()).map_err(|_| mismatch())?;
                let p = c.as_ptr() as *const c_void;
                strings.push(c);
                Slot::Ptr(p)
            }
            _ => return Err(mismatch()),
        },
        NativeType::Pointer => match value {
            Value::Nil => Slot::Ptr(std::ptr::null()),
            Value::Fixnum(addr) => Slot::Ptr(*addr as usize as *const c_void),
            _ => return Err(mismatch()),
        },
        _ => return Err(mismatch()),
    })
}

/// The word a selector is passed as; zero is reserved for nil.
pub fn selector_word(selector: Selector) -> usize {
    selector.id() as usize + 1
}

/// Guest values handed to native code as opaque 64-bit handles.
///
/// Native code can only pass handles back; it never dereferences them.
#[derive(Debug)]
pub struct HandleTable {
    next: AtomicU64,
    live: DashMap<u64, Value>,
}

impl Default for HandleTable {
    fn default() -> Self {
        Self::new()
    }
}

impl HandleTable {
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
            live: DashMap::new(),
        }
    }

    /// Keeps `value` alive until the returned handle is released.
    pub fn retain(&self, value: Value) -> u64 {
        let id = self.next.fetch_add(1, Ordering::Relaxed);
        self.live.insert(id, value);
        id
    }

    pub fn release(&self, handle: u64) -> Option<Value> {
        self.live.remove(&handle).map(|(_, v)| v)
    }

    pub fn get(&self, handle: u64) -> Option<Value> {
        self.live.get(&handle).map(|v| v.clone())
    }

    pub fn len(&self) -> usize {
        self.live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }
}

/// Shared libraries bridged functions are imported from, loaded on first use.
pub struct NativeLibraries {
    root: PathBuf,
    libraries: HashMap<String, Library>,
}

impl NativeLibraries {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            libraries: HashMap::new(),
        }
    }

    /// A file in the library root whose name starts with `name`, if any.
    fn locate(&self, name: &str) -> Option<PathBuf> {
        self.root
            .read_dir()
            .ok()?
            .filter_map(Result::ok)
            .find(|d| d.file_name().to_str().is_some_and(|f| f.starts_with(name)))
            .map(|d| d.path())
    }

    pub fn get_library(&mut self, name: &str) -> Result<&Library, BridgeError> {
        if !self.libraries.contains_key(name) {
            let located = self.locate(name);
            let path = located.clone().unwrap_or_else(|| PathBuf::from(name));
            // SAFETY: loading runs the library's initializers; libraries
            // under the configured root are trusted.
            let library = unsafe { Library::new(&path) }.map_err(|e| match located {
                Some(_) => BridgeError::LoadError(name.to_string(), e.to_string()),
                None => BridgeError::LibraryNotFound(name.to_string()),
            })?;
            tracing::debug!(library = name, path = %path.display(), "loaded native library");
            self.libraries.insert(name.to_string(), library);
        }
        self.libraries
            .get(name)
            .ok_or_else(|| BridgeError::LibraryNotFound(name.to_string()))
    }

    pub fn get_function(&mut self, library: &str, name: &str) -> Result<EntryPoint, BridgeError> {
        let l = self.get_library(library)?;
        let sym: Symbol<unsafe extern "C" fn()> = unsafe { l.get(name.as_bytes()) }
            .map_err(|_| BridgeError::SymbolNotFound(library.to_string(), name.to_string()))?;
        // SAFETY: the caller registers the symbol under its real signature
        Ok(unsafe { EntryPoint::new(*sym as *const c_void) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    extern "C" fn add_ints(a: i32, b: i32) -> i32 {
        a + b
    }

    extern "C" fn negate_byte(a: i8) -> i8 {
        -a
    }

    extern "C" fn scale(x: f64, by: f32) -> f64 {
        x * by as f64
    }

    extern "C" fn identity(h: u64) -> u64 {
        h
    }

    extern "C" fn greeting(flag: u8) -> *const c_char {
        if flag != 0 {
            c"hello".as_ptr()
        } else {
            std::ptr::null()
        }
    }

    fn entry(f: *const c_void) -> EntryPoint {
        unsafe { EntryPoint::new(f) }
    }

    #[test]
    fn test_integer_call() {
        let handles = HandleTable::new();
        let stub = CallStub::new(&TypeSignature::parse("iii").unwrap(), false, 2).unwrap();
        let v = stub
            .invoke(&handles, entry(add_ints as *const c_void), &[Value::Fixnum(40), Value::Fixnum(2)])
            .unwrap();
        assert_eq!(v.as_fixnum(), Some(42));
    }

    #[test]
    fn test_narrow_return_sign_extends() {
        let handles = HandleTable::new();
        let stub = CallStub::new(&TypeSignature::parse("cc").unwrap(), false, 1).unwrap();
        let v = stub
            .invoke(&handles, entry(negate_byte as *const c_void), &[Value::Fixnum(5)])
            .unwrap();
        assert_eq!(v.as_fixnum(), Some(-5));
    }

    #[test]
    fn test_out_of_range_integers_are_rejected() {
        let handles = HandleTable::new();
        let stub = CallStub::new(&TypeSignature::parse("cc").unwrap(), false, 1).unwrap();
        let f = entry(negate_byte as *const c_void);
        for bad in [Value::Fixnum(300), Value::Fixnum(-129), Value::Float(1.5)] {
            let err = stub.invoke(&handles, f, &[bad]).unwrap_err();
            assert!(matches!(err, crate::error::DispatchError::Bridge(BridgeError::Marshal { .. })));
        }
        let v = stub.invoke(&handles, f, &[Value::Float(-7.0)]).unwrap();
        assert_eq!(v.as_fixnum(), Some(7));

        let stub = CallStub::new(&TypeSignature::parse("iii").unwrap(), false, 2).unwrap();
        let err = stub
            .invoke(&handles, entry(add_ints as *const c_void), &[Value::Fixnum(1 << 40), Value::Fixnum(0)])
            .unwrap_err();
        assert!(matches!(err, crate::error::DispatchError::Bridge(BridgeError::Marshal { .. })));
    }

    #[test]
    fn test_float_call() {
        let handles = HandleTable::new();
        let stub = CallStub::new(&TypeSignature::parse("ddf").unwrap(), false, 2).unwrap();
        let v = stub
            .invoke(&handles, entry(scale as *const c_void), &[Value::Fixnum(3), Value::Float(0.5)])
            .unwrap();
        assert!(matches!(v, Value::Float(x) if x == 1.5));
    }

    #[test]
    fn test_object_handles_round_trip_and_release() {
        let handles = HandleTable::new();
        let stub = CallStub::new(&TypeSignature::parse("@@").unwrap(), false, 1).unwrap();
        let arr = Value::array(vec![Value::Fixnum(1)]);
        let v = stub
            .invoke(&handles, entry(identity as *const c_void), &[arr.clone()])
            .unwrap();
        assert!(v.eql(&arr));
        assert!(handles.is_empty());
    }

    #[test]
    fn test_cstring_return() {
        let handles = HandleTable::new();
        let stub = CallStub::new(&TypeSignature::parse("*B").unwrap(), false, 1).unwrap();
        let f = entry(greeting as *const c_void);
        let v = stub.invoke(&handles, f, &[Value::Bool(true)]).unwrap();
        assert!(v.eql(&Value::string("hello")));
        assert!(stub.invoke(&handles, f, &[Value::Nil]).unwrap().is_nil());
    }

    #[test]
    fn test_marshal_mismatch() {
        let handles = HandleTable::new();
        let stub = CallStub::new(&TypeSignature::parse("iii").unwrap(), false, 2).unwrap();
        let err = stub
            .invoke(&handles, entry(add_ints as *const c_void), &[Value::string("x"), Value::Fixnum(1)])
            .unwrap_err();
        assert!(matches!(
            err,
            crate::error::DispatchError::Bridge(BridgeError::Marshal { .. })
        ));
    }

    #[test]
    fn test_missing_library() {
        let mut libs = NativeLibraries::new("/nonexistent-dispatch-rs-root");
        assert!(matches!(
            libs.get_function("libdefinitely-not-here", "f"),
            Err(BridgeError::LibraryNotFound(_))
        ));
    }
}
