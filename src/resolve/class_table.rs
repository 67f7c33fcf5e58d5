use crate::{
    error::{BridgeError, DispatchError, DispatchResult},
    resolve::ObjectModel,
    types::{
        Arity, BridgedFunction, ClassId, EntryPoint, GuestBody, Implementation, MethodFlags,
        MethodRecord, NativeMethod, NativeType, TypeSignature,
    },
    value::{ObjectRef, Selector, Value},
    vm::{bridge::NativeLibraries, CallStack},
};
use parking_lot::RwLock;
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ClassKind {
    Class,
    Module,
}

struct ClassEntry {
    name: Arc<str>,
    kind: ClassKind,
    superclass: Option<ClassId>,
    includes: Vec<ClassId>,
    has_allocator: bool,
    methods: HashMap<Selector, Implementation>,
    forwarding: Option<Arc<NativeMethod>>,
}

/// Ids of the classes every table starts with.
#[derive(Debug, Clone, Copy)]
pub struct Builtins {
    pub object: ClassId,
    pub nil: ClassId,
    pub true_class: ClassId,
    pub false_class: ClassId,
    pub integer: ClassId,
    pub float: ClassId,
    pub symbol: ClassId,
    pub string: ClassId,
    pub array: ClassId,
    pub hash: ClassId,
    pub proc_class: ClassId,
    pub method: ClassId,
    pub class: ClassId,
}

/// In-process object model: a class hierarchy with mixins, method tables
/// holding guest and native implementations, and a registry of bridged
/// functions.
pub struct ClassTable {
    classes: RwLock<Vec<ClassEntry>>,
    functions: RwLock<HashMap<Arc<str>, Arc<BridgedFunction>>>,
    serial: AtomicU64,
    builtins: Builtins,
}

impl Default for ClassTable {
    fn default() -> Self {
        Self::new()
    }
}

impl ClassTable {
    pub fn new() -> Self {
        let mut classes = vec![ClassEntry {
            name: Arc::from("Object"),
            kind: ClassKind::Class,
            superclass: None,
            includes: vec![],
            has_allocator: true,
            methods: HashMap::new(),
            forwarding: None,
        }];
        let object = ClassId(0);
        let mut builtin = |name: &str| {
            classes.push(ClassEntry {
                name: Arc::from(name),
                kind: ClassKind::Class,
                superclass: Some(object),
                includes: vec![],
                has_allocator: false,
                methods: HashMap::new(),
                forwarding: None,
            });
            ClassId(classes.len() as u32 - 1)
        };
        let builtins = Builtins {
            object,
            nil: builtin("NilClass"),
            true_class: builtin("TrueClass"),
            false_class: builtin("FalseClass"),
            integer: builtin("Integer"),
            float: builtin("Float"),
            symbol: builtin("Symbol"),
            string: builtin("String"),
            array: builtin("Array"),
            hash: builtin("Hash"),
            proc_class: builtin("Proc"),
            method: builtin("Method"),
            class: builtin("Class"),
        };
        Self {
            classes: RwLock::new(classes),
            functions: RwLock::new(HashMap::new()),
            serial: AtomicU64::new(0),
            builtins,
        }
    }

    pub fn builtins(&self) -> &Builtins {
        &self.builtins
    }

    fn bump_serial(&self) {
        self.serial.fetch_add(1, Ordering::Release);
    }

    fn push_class(&self, entry: ClassEntry) -> ClassId {
        let mut classes = self.classes.write();
        classes.push(entry);
        ClassId(classes.len() as u32 - 1)
    }

    /// Defines a class. `superclass` defaults to `Object`.
    pub fn define_class(&self, name: &str, superclass: Option<ClassId>) -> ClassId {
        self.push_class(ClassEntry {
            name: Arc::from(name),
            kind: ClassKind::Class,
            superclass: Some(superclass.unwrap_or(self.builtins.object)),
            includes: vec![],
            has_allocator: true,
            methods: HashMap::new(),
            forwarding: None,
        })
    }

    pub fn define_module(&self, name: &str) -> ClassId {
        self.push_class(ClassEntry {
            name: Arc::from(name),
            kind: ClassKind::Module,
            superclass: None,
            includes: vec![],
            has_allocator: false,
            methods: HashMap::new(),
            forwarding: None,
        })
    }

    pub fn find_class(&self, name: &str) -> Option<ClassId> {
        self.classes
            .read()
            .iter()
            .position(|c| &*c.name == name)
            .map(|i| ClassId(i as u32))
    }

    /// Mixes `module` into `class`; later inclusions are looked up first.
    pub fn include_module(&self, class: ClassId, module: ClassId) {
        let mut classes = self.classes.write();
        if classes.get(module.0 as usize).map(|m| m.kind) != Some(ClassKind::Module) {
            tracing::warn!(?class, ?module, "include of a non-module ignored");
            return;
        }
        if let Some(entry) = classes.get_mut(class.0 as usize) {
            if !entry.includes.contains(&module) {
                entry.includes.push(module);
            }
        }
        drop(classes);
        self.bump_serial();
    }

    /// Removes the allocator of `class`; `allocate` then fails with `TypeError`.
    pub fn make_abstract(&self, class: ClassId) {
        if let Some(entry) = self.classes.write().get_mut(class.0 as usize) {
            entry.has_allocator = false;
        }
    }

    fn install(&self, class: ClassId, selector: Selector, imp: Implementation) {
        if let Some(entry) = self.classes.write().get_mut(class.0 as usize) {
            tracing::debug!(class = %entry.name, %selector, id = ?imp.id(), "method installed");
            entry.methods.insert(selector, imp);
        }
        self.bump_serial();
    }

    pub fn define_method(
        &self,
        class: ClassId,
        selector: impl Into<Selector>,
        arity: Arity,
        flags: MethodFlags,
        body: impl Fn(&mut CallStack, &Value, &[Value]) -> DispatchResult<Value> + Send + Sync + 'static,
    ) -> Arc<MethodRecord> {
        let selector = selector.into();
        let body: Arc<GuestBody> = Arc::new(body);
        let record = Arc::new(MethodRecord::new(selector, class, arity, flags, body));
        self.install(class, selector, Implementation::Guest(record.clone()));
        record
    }

    /// Registers a native method. The signature must take the receiver
    /// (`@`) and the selector (`:`) as its first two parameters.
    pub fn define_native_method(
        &self,
        class: ClassId,
        selector: impl Into<Selector>,
        signature: &str,
        variadic: bool,
        entry: EntryPoint,
    ) -> Result<Arc<NativeMethod>, BridgeError> {
        let selector = selector.into();
        let signature = method_signature(signature)?;
        let method = Arc::new(NativeMethod::new(selector, class, signature, variadic, entry));
        self.install(class, selector, Implementation::Native(method.clone()));
        Ok(method)
    }

    /// Installs the catch-all entry unknown messages to instances of `class`
    /// are forwarded to. Arguments past the signature are passed as objects.
    pub fn define_forwarding(
        &self,
        class: ClassId,
        signature: &str,
        entry: EntryPoint,
    ) -> Result<Arc<NativeMethod>, BridgeError> {
        let signature = method_signature(signature)?;
        let method = Arc::new(NativeMethod::new(
            Selector::intern("forwardInvocation:"),
            class,
            signature,
            true,
            entry,
        ));
        if let Some(c) = self.classes.write().get_mut(class.0 as usize) {
            c.forwarding = Some(method.clone());
        }
        self.bump_serial();
        Ok(method)
    }

    /// Puts the implementation `from` resolves `selector` to into the method
    /// table of `to`, keeping its identity.
    pub fn copy_method(&self, from: ClassId, to: ClassId, selector: impl Into<Selector>) -> bool {
        let selector = selector.into();
        match self.resolve_method(from, selector) {
            Some(imp) => {
                self.install(to, selector, imp);
                true
            }
            None => false,
        }
    }

    pub fn remove_method(&self, class: ClassId, selector: impl Into<Selector>) -> bool {
        let selector = selector.into();
        let removed = self
            .classes
            .write()
            .get_mut(class.0 as usize)
            .and_then(|c| c.methods.remove(&selector))
            .is_some();
        if removed {
            self.bump_serial();
        }
        removed
    }

    pub fn define_function(
        &self,
        name: &str,
        signature: &str,
        variadic: bool,
        entry: EntryPoint,
    ) -> Result<Arc<BridgedFunction>, BridgeError> {
        let signature = TypeSignature::parse(signature)?;
        let function = Arc::new(BridgedFunction::new(name, signature, variadic, entry));
        self.functions
            .write()
            .insert(function.name.clone(), function.clone());
        self.bump_serial();
        Ok(function)
    }

    /// Looks `symbol` up in a shared library and registers it as a bridged
    /// function under the same name.
    ///
    /// # Safety
    /// The symbol must be a C ABI function matching `signature`.
    pub unsafe fn import_function(
        &self,
        libraries: &mut NativeLibraries,
        library: &str,
        symbol: &str,
        signature: &str,
        variadic: bool,
    ) -> Result<Arc<BridgedFunction>, BridgeError> {
        let entry = libraries.get_function(library, symbol)?;
        self.define_function(symbol, signature, variadic, entry)
    }

    fn linearize(classes: &[ClassEntry], class: ClassId, out: &mut Vec<ClassId>) {
        let Some(entry) = classes.get(class.0 as usize) else {
            return;
        };
        if out.contains(&class) {
            return;
        }
        out.push(class);
        for module in entry.includes.iter().rev() {
            Self::linearize(classes, *module, out);
        }
        if let Some(superclass) = entry.superclass {
            Self::linearize(classes, superclass, out);
        }
    }
}

fn method_signature(source: &str) -> Result<TypeSignature, BridgeError> {
    let signature = TypeSignature::parse(source)?;
    match signature.params.as_slice() {
        [NativeType::Object, NativeType::Selector, ..] => Ok(signature),
        _ => Err(BridgeError::BadSignature(
            source.to_string(),
            "method signatures start with receiver and selector ('@:')".to_string(),
        )),
    }
}

impl ObjectModel for ClassTable {
    fn class_of(&self, value: &Value) -> ClassId {
        let b = &self.builtins;
        match value {
            Value::Nil | Value::Undef => b.nil,
            Value::Bool(true) => b.true_class,
            Value::Bool(false) => b.false_class,
            Value::Fixnum(_) => b.integer,
            Value::Float(_) => b.float,
            Value::Symbol(_) => b.symbol,
            Value::Str(_) => b.string,
            Value::Array(_) => b.array,
            Value::Hash(_) => b.hash,
            Value::Object(o) => o.class,
            Value::Class(_) => b.class,
            Value::Proc(_) => b.proc_class,
            Value::Method(_) => b.method,
        }
    }

    fn class_name(&self, class: ClassId) -> Arc<str> {
        match self.classes.read().get(class.0 as usize) {
            Some(c) => c.name.clone(),
            None => Arc::from(format!("#<Class:{}>", class.0)),
        }
    }

    fn resolve_method(&self, class: ClassId, selector: Selector) -> Option<Implementation> {
        let classes = self.classes.read();
        let mut ancestors = vec![];
        Self::linearize(&classes, class, &mut ancestors);
        ancestors
            .into_iter()
            .find_map(|c| classes[c.0 as usize].methods.get(&selector).cloned())
    }

    fn local_method(&self, class: ClassId, selector: Selector) -> Option<Implementation> {
        self.classes
            .read()
            .get(class.0 as usize)
            .and_then(|c| c.methods.get(&selector).cloned())
    }

    fn ancestors_of(&self, class: ClassId) -> Vec<ClassId> {
        let mut ancestors = vec![];
        Self::linearize(&self.classes.read(), class, &mut ancestors);
        ancestors
    }

    fn superclass_of(&self, class: ClassId) -> Option<ClassId> {
        self.classes
            .read()
            .get(class.0 as usize)
            .and_then(|c| c.superclass)
    }

    fn forwarding_entry(&self, class: ClassId) -> Option<Arc<NativeMethod>> {
        let classes = self.classes.read();
        let mut ancestors = vec![];
        Self::linearize(&classes, class, &mut ancestors);
        ancestors
            .into_iter()
            .find_map(|c| classes[c.0 as usize].forwarding.clone())
    }

    fn bridged_function(&self, name: &str) -> Option<Arc<BridgedFunction>> {
        self.functions.read().get(name).cloned()
    }

    fn allocate(&self, class: ClassId) -> DispatchResult<Value> {
        let classes = self.classes.read();
        match classes.get(class.0 as usize) {
            Some(c) if c.has_allocator => Ok(Value::Object(ObjectRef::new(class))),
            Some(c) => Err(DispatchError::Type(format!(
                "allocator undefined for {}",
                c.name
            ))),
            None => Err(DispatchError::Type(format!(
                "allocator undefined for #<Class:{}>",
                class.0
            ))),
        }
    }

    fn method_serial(&self) -> u64 {
        self.serial.load(Ordering::Acquire)
    }
}
