//! Blocking result transfer.
//!
//! Device buffers cannot be mapped directly, so a read-back copies the
//! buffer into a `MAP_READ` staging buffer on the same queue, maps the
//! staging buffer and copies the bytes into host memory.  Because the
//! queue is in-order the copy runs after every dispatch submitted before
//! it, so a read-back is also the synchronisation point for those
//! dispatches.

use std::sync::mpsc;

use bytemuck::{cast_slice_mut, Pod};
use log::debug;
use wgpu::{BufferDescriptor, BufferUsages};

use crate::buffer::{AccessMode, DeviceBuffer};
use crate::error::{DispatchError, Result};
use crate::session::ComputeSession;

/// Check that a buffer of `access` mode holding `byte_size` bytes may be
/// read back into a destination of `dst_len` bytes.
fn check_source(label: &str, access: AccessMode, byte_size: u64, dst_len: usize) -> Result<()> {
    if access == AccessMode::WriteOnly {
        return Err(DispatchError::Transfer(format!(
            "{label} is write-only and cannot be read back"
        )));
    }
    if dst_len as u64 != byte_size {
        return Err(DispatchError::Transfer(format!(
            "destination is {dst_len} bytes but {label} holds {byte_size}"
        )));
    }
    Ok(())
}

/// Copy the contents of `buffer` into `dst`, blocking until done.
///
/// `dst` must be exactly [`DeviceBuffer::byte_size`] bytes long and the
/// buffer must not be [`AccessMode::WriteOnly`].  Violations and failed
/// mappings are reported as [`DispatchError::Transfer`].
pub fn read_back<T: Pod>(session: &ComputeSession, buffer: &DeviceBuffer, dst: &mut [T]) -> Result<()> {
    let dst_bytes: &mut [u8] = cast_slice_mut(dst);
    check_source(buffer.label(), buffer.access(), buffer.byte_size(), dst_bytes.len())?;
    let gpu = session.gpu()?;
    let queue = session.queue()?;
    let size = buffer.padded_size();

    let staging = gpu.create_buffer(&BufferDescriptor {
        label: Some("readback_staging"),
        size,
        usage: BufferUsages::COPY_DST | BufferUsages::MAP_READ,
        mapped_at_creation: false,
    });
    let mut encoder = gpu.create_command_encoder(&wgpu::CommandEncoderDescriptor {
        label: Some("readback_encoder"),
    });
    encoder.copy_buffer_to_buffer(buffer.raw(), 0, &staging, 0, size);
    queue.submit([encoder.finish()]);

    let slice = staging.slice(..);
    let (tx, rx) = mpsc::channel();
    slice.map_async(wgpu::MapMode::Read, move |result| {
        let _ = tx.send(result);
    });
    // Waits for the copy, and with it every earlier submission.
    gpu.poll(wgpu::PollType::Wait)
        .map_err(|e| DispatchError::Transfer(format!("device poll failed: {e}")))?;
    rx.recv()
        .map_err(|_| DispatchError::Transfer("mapping callback never ran".into()))?
        .map_err(|e| DispatchError::Transfer(format!("mapping failed: {e}")))?;

    {
        let data = slice.get_mapped_range();
        dst_bytes.copy_from_slice(&data[..dst_bytes.len()]);
    }
    staging.unmap();
    staging.destroy();
    debug!("read back {} bytes from {}", buffer.byte_size(), buffer.label());
    Ok(())
}

/// Read the whole buffer back as a vector of `T`.
///
/// The buffer size must be a multiple of `size_of::<T>()`.
pub fn read_back_vec<T: Pod>(session: &ComputeSession, buffer: &DeviceBuffer) -> Result<Vec<T>> {
    let elem = std::mem::size_of::<T>() as u64;
    if elem == 0 || buffer.byte_size() % elem != 0 {
        return Err(DispatchError::Transfer(format!(
            "{} bytes is not a whole number of {elem}-byte elements",
            buffer.byte_size()
        )));
    }
    let mut out = vec![T::zeroed(); (buffer.byte_size() / elem) as usize];
    read_back(session, buffer, &mut out)?;
    Ok(out)
}
