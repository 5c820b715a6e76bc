//! Platform enumeration.
//!
//! A platform is one wgpu backend (Vulkan, Metal, DX12, GL) together
//! with the adapters that backend exposes on this machine.  Enumeration
//! is a pure query: nothing is cached and no device is opened.

use log::debug;
use wgpu::{Adapter, Backend, Backends, Instance};

use crate::error::{DispatchError, Result};

/// Backends in the order platforms are reported.
const BACKEND_ORDER: [(Backend, Backends); 4] = [
    (Backend::Vulkan, Backends::VULKAN),
    (Backend::Metal, Backends::METAL),
    (Backend::Dx12, Backends::DX12),
    (Backend::Gl, Backends::GL),
];

/// One backend and the adapters it exposes.
#[derive(Debug)]
pub struct Platform {
    backend: Backend,
    adapters: Vec<Adapter>,
}

impl Platform {
    /// The wgpu backend implementing this platform.
    pub fn backend(&self) -> Backend {
        self.backend
    }

    /// Adapters exposed by this platform, in driver order.
    pub fn adapters(&self) -> &[Adapter] {
        &self.adapters
    }

    /// Human readable name, e.g. `Vulkan`.
    pub fn name(&self) -> &'static str {
        self.backend.to_str()
    }
}

/// Create the wgpu instance used for discovery.
pub fn create_instance(backends: Backends) -> Instance {
    Instance::new(&wgpu::InstanceDescriptor {
        backends,
        ..Default::default()
    })
}

/// List every platform among `backends` that exposes at least one
/// adapter.  Fails with [`DispatchError::Discovery`] when none does.
pub fn list_platforms(instance: &Instance, backends: Backends) -> Result<Vec<Platform>> {
    let mut platforms = Vec::new();
    for (backend, bit) in BACKEND_ORDER {
        if !backends.contains(bit) {
            continue;
        }
        let adapters = instance.enumerate_adapters(bit);
        debug!("platform {backend:?}: {} adapter(s)", adapters.len());
        if !adapters.is_empty() {
            platforms.push(Platform { backend, adapters });
        }
    }
    if platforms.is_empty() {
        return Err(DispatchError::Discovery(format!(
            "no adapters exposed by any of {backends:?}"
        )));
    }
    Ok(platforms)
}
