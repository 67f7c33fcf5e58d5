//! Dispatch fallbacks that can be switched off.
//!
//! # Environment Variables
//!
//! - `DISPATCH_RS_KEYWORD_COALESCING`: retry `name:k1:k2:` calls as `name:`
//!   with a keyword mapping (default: on)
//! - `DISPATCH_RS_ACCESSOR_REWRITE`: retry `foo=:` as `setFoo:` and `foo?` as
//!   `isFoo` (default: on)
//! - `DISPATCH_RS_BRIDGED_FUNCTIONS`: fall back to bridged native functions
//!   (default: on)
//! - `DISPATCH_RS_LIBRARY_ROOT`: directory searched for native libraries
//!   (default: current directory)
//!
//! `"0"`, `"false"` and `"off"` disable a switch.
use crate::value::INLINE_ARGS;
use serde::Serialize;
use std::{env, path::PathBuf};

#[derive(Debug, Clone, Serialize)]
pub struct DispatchConfig {
    pub keyword_coalescing: bool,
    pub accessor_rewrite: bool,
    pub bridged_functions: bool,
    pub library_root: PathBuf,
    /// Slots reserved up front by the spread adapter's scratch buffer.
    pub spread_capacity: usize,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            keyword_coalescing: true,
            accessor_rewrite: true,
            bridged_functions: true,
            library_root: PathBuf::from("."),
            spread_capacity: INLINE_ARGS,
        }
    }
}

fn switch(name: &str, default: bool) -> bool {
    match env::var(name) {
        Ok(v) => !matches!(v.to_ascii_lowercase().as_str(), "0" | "false" | "off"),
        Err(_) => default,
    }
}

impl DispatchConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            keyword_coalescing: switch("DISPATCH_RS_KEYWORD_COALESCING", defaults.keyword_coalescing),
            accessor_rewrite: switch("DISPATCH_RS_ACCESSOR_REWRITE", defaults.accessor_rewrite),
            bridged_functions: switch("DISPATCH_RS_BRIDGED_FUNCTIONS", defaults.bridged_functions),
            library_root: env::var("DISPATCH_RS_LIBRARY_ROOT")
                .map(PathBuf::from)
                .unwrap_or(defaults.library_root),
            spread_capacity: defaults.spread_capacity,
        }
    }
}
