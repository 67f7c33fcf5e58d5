use crate::{
    error::BridgeError,
    resolve::ObjectModel,
    types::TypeSignature,
    vm::{
        bridge::{CallStub, CodeBridge, FfiBridge, HandleTable, NativeLibraries},
        cache::CallSiteCache,
        config::DispatchConfig,
        metrics::{DispatchStats, RuntimeMetrics},
    },
};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::Arc;

/// Caches shared by every thread dispatching against one object model.
pub struct GlobalCaches {
    /// Call stubs: (signature, variadic, argc) -> stub
    pub stubs: DashMap<(TypeSignature, bool, usize), Arc<CallStub>>,
    /// Dedicated site for method-missing redispatch
    pub method_missing: CallSiteCache,
    /// Serializes closure compilation
    pub compile_lock: Mutex<()>,
}

impl GlobalCaches {
    pub fn new() -> Self {
        Self {
            stubs: DashMap::new(),
            method_missing: CallSiteCache::new(),
            compile_lock: Mutex::new(()),
        }
    }
}

impl Default for GlobalCaches {
    fn default() -> Self {
        Self::new()
    }
}

/// Thread-safe state shared across every [`CallStack`](crate::vm::CallStack).
pub struct SharedGlobalState {
    pub model: Arc<dyn ObjectModel>,
    pub bridge: Arc<dyn CodeBridge>,
    pub config: DispatchConfig,
    pub metrics: RuntimeMetrics,
    pub handles: HandleTable,
    pub libraries: Mutex<NativeLibraries>,
    pub caches: GlobalCaches,
}

impl SharedGlobalState {
    pub fn new(
        model: Arc<dyn ObjectModel>,
        bridge: Arc<dyn CodeBridge>,
        config: DispatchConfig,
    ) -> Self {
        Self {
            libraries: Mutex::new(NativeLibraries::new(&config.library_root)),
            model,
            bridge,
            config,
            metrics: RuntimeMetrics::new(),
            handles: HandleTable::new(),
            caches: GlobalCaches::new(),
        }
    }

    /// Default bridge and configuration.
    pub fn with_model(model: Arc<dyn ObjectModel>) -> Self {
        Self::new(model, Arc::new(FfiBridge), DispatchConfig::default())
    }

    /// The call stub for `argc` arguments, generated on first request.
    pub fn call_stub(
        &self,
        signature: &TypeSignature,
        variadic: bool,
        argc: usize,
    ) -> Result<Arc<CallStub>, BridgeError> {
        let key = (signature.clone(), variadic, argc);
        if let Some(stub) = self.caches.stubs.get(&key) {
            return Ok(stub.clone());
        }
        let stub = Arc::new(self.bridge.generate_call_stub(signature, variadic, argc)?);
        self.metrics.record_stub_generated();
        Ok(self.caches.stubs.entry(key).or_insert(stub).clone())
    }

    pub fn get_cache_stats(&self) -> DispatchStats {
        self.metrics.snapshot()
    }
}
