// src/wgpu_utils/readback.rs
//! Blocking device synchronization and buffer readback.

use crate::error::BackendError;

/// Blocks until every submission on `device` has completed.
pub fn wait_idle(device: &wgpu::Device, operation: &'static str) -> Result<(), BackendError> {
    device
        .poll(wgpu::PollType::Wait)
        .map(|_| ())
        .map_err(|e| BackendError::call(operation, e.to_string()))
}

/// Copies `buffer` into a staging buffer and maps it back to the host.
/// `buffer` must have `COPY_SRC` usage.
pub fn read_buffer(
    device: &wgpu::Device,
    queue: &wgpu::Queue,
    buffer: &wgpu::Buffer,
) -> Result<Vec<u8>, BackendError> {
    let size = buffer.size();
    let staging_buffer = device.create_buffer(&wgpu::BufferDescriptor {
        label: Some("staging_buffer"),
        size,
        usage: wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::MAP_READ,
        mapped_at_creation: false,
    });

    let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
        label: Some("readback_encoder"),
    });
    encoder.copy_buffer_to_buffer(buffer, 0, &staging_buffer, 0, size);
    queue.submit(std::iter::once(encoder.finish()));

    let slice = staging_buffer.slice(..);
    let (tx, rx) = futures::channel::oneshot::channel();
    slice.map_async(wgpu::MapMode::Read, move |result| {
        let _ = tx.send(result);
    });
    wait_idle(device, "read buffer")?;

    match futures::executor::block_on(rx) {
        Ok(Ok(())) => {
            let mapped = slice.get_mapped_range();
            let bytes = mapped.to_vec();
            drop(mapped);
            staging_buffer.unmap();
            Ok(bytes)
        }
        Ok(Err(e)) => Err(BackendError::call("read buffer", e.to_string())),
        Err(_) => Err(BackendError::call("read buffer", "map callback dropped")),
    }
}
