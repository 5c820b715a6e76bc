//! Device buffers.
//!
//! This module defines [`DeviceBuffer`], a wrapper around
//! [`wgpu::Buffer`] that records the requested byte size and an
//! [`AccessMode`] describing how kernels may use it.  The buffer does not
//! own any host data; uploads and downloads always go through a
//! [`ComputeSession`].
//!
//! Every buffer carries `STORAGE | COPY_SRC | COPY_DST` usage so it can be
//! bound to a kernel, filled from the host and read back.  The access
//! mode is enforced when the buffer is bound to a kernel parameter, not
//! by wgpu usage flags.

use std::fmt;

use bytemuck::{cast_slice, Pod};
use log::debug;
use wgpu::{Buffer, BufferDescriptor, BufferUsages};

use crate::error::{DispatchError, Result};
use crate::matrix::MatrixShape;
use crate::session::ComputeSession;

/// How a kernel may access a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccessMode {
    /// Kernels only read the buffer.
    ReadOnly,
    /// Kernels only write the buffer.
    WriteOnly,
    /// Kernels read and write the buffer.
    ReadWrite,
}

impl AccessMode {
    /// Whether a kernel may read from a buffer with this mode.
    pub fn kernel_reads(self) -> bool {
        matches!(self, AccessMode::ReadOnly | AccessMode::ReadWrite)
    }

    /// Whether a kernel may write to a buffer with this mode.
    pub fn kernel_writes(self) -> bool {
        matches!(self, AccessMode::WriteOnly | AccessMode::ReadWrite)
    }
}

impl fmt::Display for AccessMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AccessMode::ReadOnly => write!(f, "read-only"),
            AccessMode::WriteOnly => write!(f, "write-only"),
            AccessMode::ReadWrite => write!(f, "read-write"),
        }
    }
}

/// Round `size` up to the copy alignment wgpu requires for transfers.
pub(crate) fn padded_size(size: u64) -> u64 {
    let align = wgpu::COPY_BUFFER_ALIGNMENT;
    size.div_ceil(align) * align
}

/// A device-resident memory region.
///
/// The underlying wgpu buffer may be a few bytes larger than requested
/// because transfers must be 4-byte aligned; [`Self::byte_size`] always
/// reports the requested size.
#[derive(Debug)]
pub struct DeviceBuffer {
    buffer: Buffer,
    byte_size: u64,
    access: AccessMode,
    label: String,
}

impl DeviceBuffer {
    /// Allocate `byte_size` bytes of device memory.
    ///
    /// Fails with [`DispatchError::Allocation`] for an empty request, a
    /// size beyond the device limits, or when the device reports an
    /// out-of-memory or validation error while creating the buffer.
    pub fn allocate(session: &ComputeSession, byte_size: u64, access: AccessMode) -> Result<Self> {
        Self::allocate_labeled(session, byte_size, access, "device_buffer")
    }

    /// Allocate a buffer sized for a `rows x cols` matrix of `T`.
    pub fn allocate_for<T: Pod>(
        session: &ComputeSession,
        shape: MatrixShape,
        access: AccessMode,
    ) -> Result<Self> {
        let bytes = shape.byte_len::<T>()?;
        Self::allocate_labeled(session, bytes, access, "matrix_buffer")
    }

    /// Allocate with an explicit debug label.
    pub fn allocate_labeled(
        session: &ComputeSession,
        byte_size: u64,
        access: AccessMode,
        label: &str,
    ) -> Result<Self> {
        let fail = |reason: String| DispatchError::Allocation {
            size: byte_size,
            reason,
        };
        if byte_size == 0 {
            return Err(fail("zero-sized buffers are not allowed".into()));
        }
        let gpu = session.gpu()?;
        let limits = gpu.limits();
        let size = padded_size(byte_size);
        if size > limits.max_buffer_size {
            return Err(fail(format!(
                "exceeds the device buffer limit of {} bytes",
                limits.max_buffer_size
            )));
        }
        if size > u64::from(limits.max_storage_buffer_binding_size) {
            return Err(fail(format!(
                "exceeds the storage binding limit of {} bytes",
                limits.max_storage_buffer_binding_size
            )));
        }

        gpu.push_error_scope(wgpu::ErrorFilter::OutOfMemory);
        gpu.push_error_scope(wgpu::ErrorFilter::Validation);
        let buffer = gpu.create_buffer(&BufferDescriptor {
            label: Some(label),
            size,
            usage: BufferUsages::STORAGE | BufferUsages::COPY_SRC | BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let validation = pollster::block_on(gpu.pop_error_scope());
        let out_of_memory = pollster::block_on(gpu.pop_error_scope());
        if let Some(e) = out_of_memory.or(validation) {
            buffer.destroy();
            return Err(fail(e.to_string()));
        }
        debug!("allocated {label}: {byte_size} bytes, {access}");
        Ok(Self {
            buffer,
            byte_size,
            access,
            label: label.to_string(),
        })
    }

    /// Requested size in bytes.
    pub fn byte_size(&self) -> u64 {
        self.byte_size
    }

    /// Access mode the buffer was created with.
    pub fn access(&self) -> AccessMode {
        self.access
    }

    /// Debug label.
    pub fn label(&self) -> &str {
        &self.label
    }

    /// The underlying wgpu buffer.
    pub fn raw(&self) -> &Buffer {
        &self.buffer
    }

    /// Size of the underlying allocation, including alignment padding.
    pub(crate) fn padded_size(&self) -> u64 {
        self.buffer.size()
    }

    /// Upload host data into the buffer through the queue.
    ///
    /// The data must cover the buffer exactly.  The write is ordered
    /// before any later submission on the same queue.
    pub fn write<T: Pod>(&self, session: &ComputeSession, data: &[T]) -> Result<()> {
        let bytes: &[u8] = cast_slice(data);
        if bytes.len() as u64 != self.byte_size {
            return Err(DispatchError::Transfer(format!(
                "host data is {} bytes but {} holds {}",
                bytes.len(),
                self.label,
                self.byte_size
            )));
        }
        let queue = session.queue()?;
        if bytes.len() as u64 % wgpu::COPY_BUFFER_ALIGNMENT == 0 {
            queue.write_buffer(&self.buffer, 0, bytes);
        } else {
            let mut padded = bytes.to_vec();
            padded.resize(self.padded_size() as usize, 0);
            queue.write_buffer(&self.buffer, 0, &padded);
        }
        Ok(())
    }

    /// Release the device memory.
    ///
    /// Waits for the queue to drain first, so a dispatch that still uses
    /// the buffer always completes before the memory goes away.
    pub fn release(self, session: &ComputeSession) -> Result<()> {
        session.wait()?;
        self.buffer.destroy();
        debug!("released {}", self.label);
        Ok(())
    }
}
