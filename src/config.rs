//! Harness configuration.
//!
//! [`HarnessConfig`] gathers the knobs that influence device discovery
//! and session creation.  The defaults match what a headless compute
//! harness wants: every backend is searched, an accelerator is preferred
//! and the session requests the downlevel limits so that the widest range
//! of adapters qualifies.  A few settings can be overridden from the
//! environment with [`HarnessConfig::from_env`].

use crate::device::DeviceKind;
use crate::error::{DispatchError, Result};

/// Default cap, in bytes, on the build diagnostic log.
pub const DEFAULT_BUILD_LOG_LIMIT: usize = 4096;
/// Smallest accepted build log cap.  A failed build always leaves a
/// message this long.
pub const MIN_BUILD_LOG_LIMIT: usize = 64;

/// Environment variable selecting the preferred device kind.
pub const ENV_DEVICE: &str = "GRIDLAUNCH_DEVICE";
/// Environment variable restricting the searched backends.
pub const ENV_BACKENDS: &str = "GRIDLAUNCH_BACKENDS";
/// Environment variable overriding the build log cap.
pub const ENV_BUILD_LOG_LIMIT: &str = "GRIDLAUNCH_BUILD_LOG_LIMIT";

/// Which set of device limits to request when opening a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LimitsProfile {
    /// `wgpu::Limits::downlevel_defaults()`; accepted by almost any adapter.
    #[default]
    Downlevel,
    /// `wgpu::Limits::default()`; the full WebGPU baseline.
    Default,
    /// Whatever the selected adapter supports.
    Adapter,
}

/// Configuration for discovery, session creation and program builds.
#[derive(Debug, Clone)]
pub struct HarnessConfig {
    /// Device kind to look for first.  The selector falls back to a
    /// general-purpose device when none of this kind exists.
    pub preferred_kind: DeviceKind,
    /// Backends searched during platform enumeration.
    pub backends: wgpu::Backends,
    /// Limits requested from the adapter.
    pub limits: LimitsProfile,
    /// Maximum number of bytes kept in a build diagnostic log.
    pub build_log_limit: usize,
    /// Label attached to the logical device.
    pub device_label: String,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            preferred_kind: DeviceKind::Accelerator,
            backends: wgpu::Backends::all(),
            limits: LimitsProfile::default(),
            build_log_limit: DEFAULT_BUILD_LOG_LIMIT,
            device_label: "gridlaunch_device".to_string(),
        }
    }
}

impl HarnessConfig {
    /// Build a configuration from the defaults overridden by the
    /// `GRIDLAUNCH_*` environment variables.  Unset variables keep their
    /// defaults; malformed values are reported as configuration errors.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`Self::from_env`] with an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();
        if let Some(kind) = lookup(ENV_DEVICE) {
            config.preferred_kind = kind.parse()?;
        }
        if let Some(list) = lookup(ENV_BACKENDS) {
            config.backends = parse_backends(&list)?;
        }
        if let Some(limit) = lookup(ENV_BUILD_LOG_LIMIT) {
            let bytes: usize = limit.trim().parse().map_err(|_| {
                DispatchError::Config(format!("{ENV_BUILD_LOG_LIMIT} must be a byte count, got '{limit}'"))
            })?;
            if bytes < MIN_BUILD_LOG_LIMIT {
                return Err(DispatchError::Config(format!(
                    "{ENV_BUILD_LOG_LIMIT} must be at least {MIN_BUILD_LOG_LIMIT}, got {bytes}"
                )));
            }
            config.build_log_limit = bytes;
        }
        Ok(config)
    }

    /// Set the preferred device kind.
    pub fn with_preferred_kind(mut self, kind: DeviceKind) -> Self {
        self.preferred_kind = kind;
        self
    }

    /// Restrict the searched backends.
    pub fn with_backends(mut self, backends: wgpu::Backends) -> Self {
        self.backends = backends;
        self
    }

    /// Resolve the limits profile against a concrete adapter.
    pub(crate) fn required_limits(&self, adapter: &wgpu::Adapter) -> wgpu::Limits {
        match self.limits {
            LimitsProfile::Downlevel => wgpu::Limits::downlevel_defaults(),
            LimitsProfile::Default => wgpu::Limits::default(),
            LimitsProfile::Adapter => adapter.limits(),
        }
    }
}

/// Parse a comma separated backend list such as `"vulkan,gl"`.
pub fn parse_backends(list: &str) -> Result<wgpu::Backends> {
    let mut backends = wgpu::Backends::empty();
    for name in list.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        backends |= match name.to_ascii_lowercase().as_str() {
            "vulkan" | "vk" => wgpu::Backends::VULKAN,
            "metal" | "mtl" => wgpu::Backends::METAL,
            "dx12" | "d3d12" => wgpu::Backends::DX12,
            "gl" | "gles" | "opengl" => wgpu::Backends::GL,
            "primary" => wgpu::Backends::PRIMARY,
            "all" => wgpu::Backends::all(),
            other => {
                return Err(DispatchError::Config(format!("unknown backend '{other}'")));
            }
        };
    }
    if backends.is_empty() {
        return Err(DispatchError::Config("backend list is empty".into()));
    }
    Ok(backends)
}
