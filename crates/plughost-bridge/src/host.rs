//! The host's own core module, seen as a module image.

use plughost_core::{
    Error, HostHandle, ModuleIdentity, ModuleImage, Result, ToolingEntryFn,
};

/// Core module exported by the host process itself.
///
/// It is already mapped by the time the bridge starts, so it has no file
/// and no dependencies of its own. Registered as shared so every plugin
/// referencing it binds to the host's copy.
pub struct HostModule {
    identity: ModuleIdentity,
    handle: HostHandle,
}

impl HostModule {
    pub fn new(name: &str, handle: HostHandle) -> Self {
        Self {
            identity: ModuleIdentity::new(name, format!("<host>/{}", name)),
            handle,
        }
    }

    pub fn handle(&self) -> HostHandle {
        self.handle
    }
}

impl ModuleImage for HostModule {
    fn identity(&self) -> &ModuleIdentity {
        &self.identity
    }

    fn dependencies(&self) -> &[String] {
        &[]
    }

    fn tooling_entry(&self, symbol: &str) -> Result<ToolingEntryFn> {
        Err(Error::SymbolNotFound {
            module: self.identity.name().to_string(),
            symbol: symbol.to_string(),
        })
    }

    fn bind_host(&self, _host: HostHandle) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::c_void;

    #[test]
    fn test_host_module_identity() {
        let handle = HostHandle::from_ptr(0x1000 as *mut c_void);
        let module = HostModule::new("host_api", handle);

        assert_eq!(module.identity().name(), "host_api");
        assert!(module.dependencies().is_empty());
        assert_eq!(module.handle(), handle);
        assert!(matches!(
            module.tooling_entry("anything"),
            Err(Error::SymbolNotFound { .. })
        ));
    }
}
