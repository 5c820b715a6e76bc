//! Compute session: one logical device and its in-order queue.
//!
//! This module wraps the wgpu `Device` (the context every buffer and
//! program is created against) and the `Queue` bound to it.  A session
//! is either fully open or not constructed at all: wgpu hands out the
//! device and the queue together, and compute support is checked before
//! either is requested.  The request is driven synchronously with
//! [`pollster`].
//!
//! Teardown is explicit through [`ComputeSession::close`] and also
//! happens on drop.  The queue is always released before the device.

use log::{debug, info, warn};

use crate::config::HarnessConfig;
use crate::device::Device;
use crate::error::{DispatchError, Result};

/// Owner of the logical device and command queue for one selected
/// [`Device`].
///
/// No other component may keep the wgpu device or queue alive past the
/// session: borrow them through [`Self::gpu`] and [`Self::queue`] only for
/// the duration of a call.
#[derive(Debug)]
pub struct ComputeSession {
    device: Device,
    queue: Option<wgpu::Queue>,
    gpu: Option<wgpu::Device>,
}

impl ComputeSession {
    /// Open a session on `device`.
    ///
    /// Blocks while the adapter creates the logical device.  Fails with
    /// [`DispatchError::SessionCreation`] if the adapter cannot run
    /// compute shaders or refuses the request.
    pub fn open(device: Device, config: &HarnessConfig) -> Result<Self> {
        let adapter = device.adapter();
        // Downlevel adapters may not support compute on every backend.
        let capabilities = adapter.get_downlevel_capabilities();
        if !capabilities
            .flags
            .contains(wgpu::DownlevelFlags::COMPUTE_SHADERS)
        {
            return Err(DispatchError::SessionCreation(format!(
                "{} does not support compute shaders",
                device.name()
            )));
        }
        let (gpu, queue) = pollster::block_on(adapter.request_device(&wgpu::DeviceDescriptor {
            label: Some(config.device_label.as_str()),
            required_features: wgpu::Features::empty(),
            required_limits: config.required_limits(adapter),
            memory_hints: wgpu::MemoryHints::MemoryUsage,
            trace: wgpu::Trace::Off,
        }))
        .map_err(|e| DispatchError::SessionCreation(e.to_string()))?;
        info!("opened compute session on {device}");
        Ok(Self {
            device,
            queue: Some(queue),
            gpu: Some(gpu),
        })
    }

    /// The device this session is bound to.
    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Whether `close` has not run yet.
    pub fn is_open(&self) -> bool {
        self.gpu.is_some()
    }

    /// The logical device (context).  Fails once the session is closed.
    pub fn gpu(&self) -> Result<&wgpu::Device> {
        self.gpu.as_ref().ok_or(DispatchError::SessionClosed)
    }

    /// The in-order command queue.  Fails once the session is closed.
    pub fn queue(&self) -> Result<&wgpu::Queue> {
        self.queue.as_ref().ok_or(DispatchError::SessionClosed)
    }

    /// Limits granted to the logical device.
    pub fn limits(&self) -> Result<wgpu::Limits> {
        Ok(self.gpu()?.limits())
    }

    /// Block until every submission on the queue has completed.
    pub fn wait(&self) -> Result<()> {
        self.gpu()?
            .poll(wgpu::PollType::Wait)
            .map(|_| ())
            .map_err(|e| DispatchError::Transfer(format!("device poll failed: {e}")))
    }

    /// Release the queue, then the device.
    ///
    /// Outstanding work is drained first.  Returns `true` if this call
    /// released the handles and `false` if the session was already
    /// closed, so calling it twice is harmless.
    pub fn close(&mut self) -> bool {
        let Some(gpu) = self.gpu.take() else {
            return false;
        };
        if let Err(e) = gpu.poll(wgpu::PollType::Wait) {
            warn!("draining the queue of {} before close failed: {e}", self.device.name());
        }
        drop(self.queue.take());
        debug!("released queue on {}", self.device.name());
        gpu.destroy();
        drop(gpu);
        debug!("released context on {}", self.device.name());
        true
    }
}

impl Drop for ComputeSession {
    fn drop(&mut self) {
        self.close();
    }
}
