//! Device selection.
//!
//! The selector walks the enumerated platforms looking for an adapter of
//! the preferred [`DeviceKind`].  If no such adapter exists it accepts a
//! general-purpose one instead: a slower device that produces correct
//! results is better than no result.  Only when both searches come up
//! empty does selection fail.
//!
//! The policy itself lives in [`select_from_pool`], which works on any
//! item implementing [`Classify`], so it can be exercised without real
//! hardware.

use std::fmt;
use std::str::FromStr;

use log::{info, warn};
use wgpu::{Adapter, AdapterInfo, DeviceType};

use crate::config::HarnessConfig;
use crate::error::{DispatchError, Result};
use crate::platform::{create_instance, list_platforms, Platform};

/// Coarse classification of a compute device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceKind {
    /// A GPU or other dedicated compute unit.
    Accelerator,
    /// A CPU, software rasteriser or unclassified adapter.
    GeneralPurpose,
}

impl DeviceKind {
    /// The kind the selector tries when the preferred kind is missing.
    pub const FALLBACK: DeviceKind = DeviceKind::GeneralPurpose;

    /// Classify a wgpu device type.
    pub fn of(device_type: DeviceType) -> Self {
        match device_type {
            DeviceType::DiscreteGpu | DeviceType::IntegratedGpu | DeviceType::VirtualGpu => {
                DeviceKind::Accelerator
            }
            DeviceType::Cpu | DeviceType::Other => DeviceKind::GeneralPurpose,
        }
    }
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceKind::Accelerator => write!(f, "accelerator"),
            DeviceKind::GeneralPurpose => write!(f, "general-purpose"),
        }
    }
}

impl FromStr for DeviceKind {
    type Err = DispatchError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "accelerator" | "gpu" => Ok(DeviceKind::Accelerator),
            "general" | "general-purpose" | "cpu" => Ok(DeviceKind::GeneralPurpose),
            other => Err(DispatchError::Config(format!("unknown device kind '{other}'"))),
        }
    }
}

/// Anything the selection policy can classify.
pub trait Classify {
    /// The kind of device this item represents.
    fn kind(&self) -> DeviceKind;
}

/// A selected compute device: an adapter plus its cached description.
#[derive(Debug, Clone)]
pub struct Device {
    adapter: Adapter,
    info: AdapterInfo,
}

impl Device {
    /// Wrap an adapter, caching its description.
    pub fn new(adapter: Adapter) -> Self {
        let info = adapter.get_info();
        Self { adapter, info }
    }

    /// The underlying wgpu adapter.
    pub fn adapter(&self) -> &Adapter {
        &self.adapter
    }

    /// Adapter description (name, vendor, backend, driver).
    pub fn info(&self) -> &AdapterInfo {
        &self.info
    }

    /// Adapter name as reported by the driver.
    pub fn name(&self) -> &str {
        &self.info.name
    }
}

impl Classify for Device {
    fn kind(&self) -> DeviceKind {
        DeviceKind::of(self.info.device_type)
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({:?}, {})",
            self.info.name,
            self.info.backend,
            self.kind()
        )
    }
}

/// Pick the first item of `preferred` kind, else the first general-purpose
/// item.  Fails with [`DispatchError::DeviceNotFound`] if neither exists.
pub fn select_from_pool<D: Classify>(
    pool: impl IntoIterator<Item = D>,
    preferred: DeviceKind,
) -> Result<D> {
    let mut fallback = None;
    for item in pool {
        let kind = item.kind();
        if kind == preferred {
            return Ok(item);
        }
        if kind == DeviceKind::FALLBACK && fallback.is_none() {
            fallback = Some(item);
        }
    }
    fallback.ok_or(DispatchError::DeviceNotFound {
        preferred,
        fallback: DeviceKind::FALLBACK,
    })
}

/// Select a device from the enumerated platforms according to the
/// preferred kind, falling back to a general-purpose device.
pub fn select_device(platforms: &[Platform], preferred: DeviceKind) -> Result<Device> {
    let pool = platforms
        .iter()
        .flat_map(|platform| platform.adapters().iter().cloned())
        .map(Device::new);
    let device = select_from_pool(pool, preferred)?;
    if device.kind() != preferred {
        warn!("no {preferred} device available, falling back to {device}");
    } else {
        info!("selected {device}");
    }
    Ok(device)
}

/// Enumerate the configured backends and select a device in one step.
pub fn discover_device(config: &HarnessConfig) -> Result<Device> {
    let instance = create_instance(config.backends);
    let platforms = list_platforms(&instance, config.backends)?;
    select_device(&platforms, config.preferred_kind)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq)]
    struct FakeDevice(&'static str, DeviceKind);

    impl Classify for FakeDevice {
        fn kind(&self) -> DeviceKind {
            self.1
        }
    }

    #[test]
    fn preferred_kind_wins_even_when_listed_later() {
        let pool = vec![
            FakeDevice("llvmpipe", DeviceKind::GeneralPurpose),
            FakeDevice("gpu", DeviceKind::Accelerator),
        ];
        let picked = select_from_pool(pool, DeviceKind::Accelerator).unwrap();
        assert_eq!(picked.0, "gpu");
    }

    #[test]
    fn falls_back_to_general_purpose_device() {
        let pool = vec![
            FakeDevice("cpu0", DeviceKind::GeneralPurpose),
            FakeDevice("cpu1", DeviceKind::GeneralPurpose),
        ];
        let picked = select_from_pool(pool, DeviceKind::Accelerator).unwrap();
        assert_eq!(picked, FakeDevice("cpu0", DeviceKind::GeneralPurpose));
    }

    #[test]
    fn empty_pool_is_device_not_found() {
        let err = select_from_pool(Vec::<FakeDevice>::new(), DeviceKind::Accelerator).unwrap_err();
        assert!(matches!(
            err,
            DispatchError::DeviceNotFound {
                preferred: DeviceKind::Accelerator,
                fallback: DeviceKind::GeneralPurpose,
            }
        ));
    }

    #[test]
    fn accelerators_do_not_satisfy_a_general_purpose_request() {
        let pool = vec![FakeDevice("gpu", DeviceKind::Accelerator)];
        assert!(select_from_pool(pool, DeviceKind::GeneralPurpose).is_err());
    }

    #[test]
    fn device_types_are_classified() {
        assert_eq!(DeviceKind::of(DeviceType::DiscreteGpu), DeviceKind::Accelerator);
        assert_eq!(DeviceKind::of(DeviceType::IntegratedGpu), DeviceKind::Accelerator);
        assert_eq!(DeviceKind::of(DeviceType::Cpu), DeviceKind::GeneralPurpose);
        assert_eq!(DeviceKind::of(DeviceType::Other), DeviceKind::GeneralPurpose);
        assert_eq!("gpu".parse::<DeviceKind>().unwrap(), DeviceKind::Accelerator);
        assert!("fpga".parse::<DeviceKind>().is_err());
    }
}
