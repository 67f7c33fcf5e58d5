//! Interned selectors and the name rewrites the dispatch fallbacks rely on.
//!
//! A selector is a message name in native messaging syntax: one `:` per
//! argument (`insertObject:atIndex:`), `name=:` for attribute writers and
//! `name?` for predicates. Symbols in guest code share the same interner.
use parking_lot::RwLock;
use std::{collections::HashMap, fmt, sync::Arc, sync::OnceLock};

#[derive(Default)]
struct Interner {
    ids: HashMap<Arc<str>, u32>,
    names: Vec<Arc<str>>,
}

fn interner() -> &'static RwLock<Interner> {
    static INTERNER: OnceLock<RwLock<Interner>> = OnceLock::new();
    INTERNER.get_or_init(|| RwLock::new(Interner::default()))
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Selector(u32);

impl Selector {
    pub fn intern(name: &str) -> Self {
        if let Some(id) = interner().read().ids.get(name) {
            return Selector(*id);
        }
        let mut table = interner().write();
        // another thread may have won the race between the two locks
        if let Some(id) = table.ids.get(name) {
            return Selector(*id);
        }
        let id = table.names.len() as u32;
        let name: Arc<str> = Arc::from(name);
        table.names.push(name.clone());
        table.ids.insert(name, id);
        Selector(id)
    }

    pub fn name(self) -> Arc<str> {
        interner().read().names[self.0 as usize].clone()
    }

    pub fn id(self) -> u32 {
        self.0
    }

    /// Only ids previously handed out by [`Selector::intern`] are valid.
    pub fn from_id(id: u32) -> Option<Self> {
        if (id as usize) < interner().read().names.len() {
            Some(Selector(id))
        } else {
            None
        }
    }

    /// Number of argument separators in the selector.
    pub fn colon_count(self) -> usize {
        self.name().bytes().filter(|b| *b == b':').count()
    }

    /// The name a method-missing handler sees: a single trailing `:` is
    /// dropped, multi-keyword selectors are kept whole.
    pub fn missing_name(self) -> Arc<str> {
        let name = self.name();
        if name.ends_with(':') && name.find(':') == Some(name.len() - 1) {
            Arc::from(&name[..name.len() - 1])
        } else {
            name
        }
    }

    /// Appends a trailing separator: `foo` becomes `foo:`.
    pub fn with_colon(self) -> Selector {
        Selector::intern(&format!("{}:", self.name()))
    }

    /// Drops a single trailing separator: `foo:` becomes `foo`. `None` when
    /// the selector has no separator or more than one.
    pub fn without_colon(self) -> Option<Selector> {
        let name = self.name();
        if name.ends_with(':') && name.find(':') == Some(name.len() - 1) {
            Some(Selector::intern(&name[..name.len() - 1]))
        } else {
            None
        }
    }

    /// Splits `name:key1:key2:` into `name:` and `[key1, key2]`.
    ///
    /// Used to reinterpret a keyword-style call as a single-keyword call with
    /// the trailing arguments collected into a mapping. Returns `None` unless
    /// the selector has at least two parts and every part is non-empty.
    pub fn keyword_parts(self) -> Option<(Selector, Vec<Selector>)> {
        let name = self.name();
        if !name.ends_with(':') {
            return None;
        }
        let mut parts = name[..name.len() - 1].split(':');
        let head = parts.next()?;
        let keys: Vec<&str> = parts.collect();
        if head.is_empty() || keys.is_empty() || keys.iter().any(|k| k.is_empty()) {
            return None;
        }
        Some((
            Selector::intern(&format!("{head}:")),
            keys.into_iter().map(Selector::intern).collect(),
        ))
    }

    /// The native-convention spelling of an accessor selector:
    /// `foo=:` maps to `setFoo:` (one argument) and `foo?` to `isFoo`
    /// (no arguments).
    pub fn accessor_rewrite(self, argc: usize) -> Option<Selector> {
        let name = self.name();
        if argc == 1 && name.len() > 2 {
            if let Some(base) = name.strip_suffix("=:") {
                return Some(Selector::intern(&format!("set{}:", capitalize(base)?)));
            }
        }
        if argc == 0 && name.len() > 1 {
            if let Some(base) = name.strip_suffix('?') {
                return Some(Selector::intern(&format!("is{}", capitalize(base)?)));
            }
        }
        None
    }
}

fn capitalize(s: &str) -> Option<String> {
    let mut chars = s.chars();
    let first = chars.next()?;
    if !first.is_ascii_alphabetic() {
        return None;
    }
    Some(first.to_ascii_uppercase().to_string() + chars.as_str())
}

impl fmt::Debug for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, ":{}", self.name())
    }
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name())
    }
}

impl From<&str> for Selector {
    fn from(s: &str) -> Self {
        Selector::intern(s)
    }
}
