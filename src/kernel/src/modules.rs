//! Boot modules: named blobs handed over by the bootloader (initial
//! archive, fonts).

use alloc::collections::BTreeMap;
use alloc::string::String;
use spin::RwLock;

/// Registry of boot modules keyed by name.
#[derive(Default)]
pub struct BootModules {
    modules: RwLock<BTreeMap<String, &'static [u8]>>,
}

impl BootModules {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `data` under `name`, replacing any previous module.
    pub fn register(&self, name: &str, data: &'static [u8]) {
        log::debug!(target: "boot", "module {} ({} bytes) at {:p}", name, data.len(), data.as_ptr());
        self.modules.write().insert(String::from(name), data);
    }

    /// Look up a module. `None` if it was not provided.
    pub fn lookup(&self, name: &str) -> Option<&'static [u8]> {
        self.modules.read().get(name).copied()
    }

    /// Number of registered modules.
    pub fn len(&self) -> usize {
        self.modules.read().len()
    }

    /// Returns `true` if nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.modules.read().is_empty()
    }
}
