use serde::Serialize;
use std::{
    fmt,
    sync::atomic::{AtomicU64, Ordering},
};

#[derive(Debug, Default)]
pub struct RuntimeMetrics {
    /// Dispatches answered by a call-site cache
    pub cache_hits: AtomicU64,
    /// Dispatches that had to resolve
    pub cache_misses: AtomicU64,
    /// Cache entries published after resolution
    pub cache_fills: AtomicU64,
    /// Resolutions that were invoked without being cached
    pub uncached_dispatches: AtomicU64,
    pub super_lookups: AtomicU64,
    pub method_missing: AtomicU64,
    /// Closures copied because they were already active
    pub closure_duplications: AtomicU64,
    pub closure_compilations: AtomicU64,
    pub stubs_generated: AtomicU64,
    pub fast_path_hits: AtomicU64,
    pub fast_path_fallbacks: AtomicU64,
}

macro_rules! counter {
    ($($name:ident => $field:ident),* $(,)?) => {
        $(
            pub fn $name(&self) {
                self.$field.fetch_add(1, Ordering::Relaxed);
            }
        )*
    };
}

impl RuntimeMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    counter! {
        record_cache_hit => cache_hits,
        record_cache_miss => cache_misses,
        record_cache_fill => cache_fills,
        record_uncached => uncached_dispatches,
        record_super_lookup => super_lookups,
        record_method_missing => method_missing,
        record_closure_duplication => closure_duplications,
        record_closure_compilation => closure_compilations,
        record_stub_generated => stubs_generated,
        record_fast_path_hit => fast_path_hits,
        record_fast_path_fallback => fast_path_fallbacks,
    }

    pub fn snapshot(&self) -> DispatchStats {
        let get = |c: &AtomicU64| c.load(Ordering::Relaxed);
        DispatchStats {
            cache_hits: get(&self.cache_hits),
            cache_misses: get(&self.cache_misses),
            cache_fills: get(&self.cache_fills),
            uncached_dispatches: get(&self.uncached_dispatches),
            super_lookups: get(&self.super_lookups),
            method_missing: get(&self.method_missing),
            closure_duplications: get(&self.closure_duplications),
            closure_compilations: get(&self.closure_compilations),
            stubs_generated: get(&self.stubs_generated),
            fast_path_hits: get(&self.fast_path_hits),
            fast_path_fallbacks: get(&self.fast_path_fallbacks),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DispatchStats {
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub cache_fills: u64,
    pub uncached_dispatches: u64,
    pub super_lookups: u64,
    pub method_missing: u64,
    pub closure_duplications: u64,
    pub closure_compilations: u64,
    pub stubs_generated: u64,
    pub fast_path_hits: u64,
    pub fast_path_fallbacks: u64,
}

impl DispatchStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.cache_hits + self.cache_misses;
        if total == 0 {
            0.0
        } else {
            self.cache_hits as f64 / total as f64 * 100.0
        }
    }
}

impl fmt::Display for DispatchStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Dispatch Statistics:")?;
        writeln!(
            f,
            "  Call sites: {} hits, {} misses ({:.1}% hit rate), {} fills, {} uncached",
            self.cache_hits,
            self.cache_misses,
            self.hit_rate(),
            self.cache_fills,
            self.uncached_dispatches
        )?;
        writeln!(
            f,
            "  Fallbacks: {} super lookups, {} method missing",
            self.super_lookups, self.method_missing
        )?;
        writeln!(
            f,
            "  Closures: {} compiled, {} duplicated",
            self.closure_compilations, self.closure_duplications
        )?;
        writeln!(f, "  Call stubs generated: {}", self.stubs_generated)?;
        write!(
            f,
            "  Fast paths: {} hits, {} fallbacks",
            self.fast_path_hits, self.fast_path_fallbacks
        )
    }
}
