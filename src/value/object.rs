use crate::{
    types::ClassId,
    value::{Selector, Value},
};
use parking_lot::RwLock;
use std::{
    collections::HashMap,
    fmt::{Debug, Formatter},
    hash::{Hash, Hasher},
    sync::Arc,
};

/// A heap instance of a user class.
pub struct Object {
    pub class: ClassId,
    ivars: RwLock<HashMap<Selector, Value>>,
}

impl Object {
    pub fn new(class: ClassId) -> Self {
        Self {
            class,
            ivars: RwLock::new(HashMap::new()),
        }
    }

    pub fn ivar(&self, name: Selector) -> Value {
        self.ivars.read().get(&name).cloned().unwrap_or(Value::Nil)
    }

    pub fn set_ivar(&self, name: Selector, value: Value) {
        self.ivars.write().insert(name, value);
    }
}

/// Shared reference to an [`Object`]. Equality and hashing are by identity.
#[derive(Clone)]
#[repr(transparent)]
pub struct ObjectRef(pub Arc<Object>);

impl ObjectRef {
    pub fn new(class: ClassId) -> Self {
        Self(Arc::new(Object::new(class)))
    }

    pub fn as_ptr(&self) -> *const Object {
        Arc::as_ptr(&self.0)
    }
}

impl std::ops::Deref for ObjectRef {
    type Target = Object;
    fn deref(&self) -> &Object {
        &self.0
    }
}

impl PartialEq for ObjectRef {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for ObjectRef {}

impl Hash for ObjectRef {
    fn hash<H: Hasher>(&self, state: &mut H) {
        (self.as_ptr() as usize).hash(state)
    }
}

impl Debug for ObjectRef {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "#<{:?} {:p}>", self.class, self.as_ptr())
    }
}

/// Ordered key/value storage for hash values. Lookups compare keys with
/// [`Value::eql`].
#[derive(Default, Debug)]
pub struct HashStorage {
    entries: Vec<(Value, Value)>,
}

impl HashStorage {
    pub fn get(&self, key: &Value) -> Option<&Value> {
        self.entries.iter().find(|(k, _)| k.eql(key)).map(|(_, v)| v)
    }

    pub fn insert(&mut self, key: Value, value: Value) {
        match self.entries.iter_mut().find(|(k, _)| k.eql(&key)) {
            Some(slot) => slot.1 = value,
            None => self.entries.push((key, value)),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &(Value, Value)> {
        self.entries.iter()
    }
}
