use engine_wire::Extent;
use thiserror::Error;

use super::foreign::LocalHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GpuMemory(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GpuImage(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GpuSemaphore(pub u64);

#[derive(Debug, Error)]
#[error("gpu backend: {0}")]
pub struct GpuError(pub String);

/// The editor's GPU device, as far as the frame handoff needs it.
///
/// Imports take ownership of the local handle: a successful import hands it
/// to the driver, a failed one drops (closes) it.
pub trait GpuBackend {
    fn import_memory(&mut self, handle: LocalHandle, size: u64) -> Result<GpuMemory, GpuError>;

    /// Creates a 2D RGBA image bound to `memory` at `offset`.
    fn bind_image(
        &mut self,
        memory: GpuMemory,
        extent: Extent,
        offset: u64,
    ) -> Result<GpuImage, GpuError>;

    /// Imports a binary semaphore.
    fn import_semaphore(&mut self, handle: LocalHandle) -> Result<GpuSemaphore, GpuError>;

    fn wait(&mut self, semaphore: GpuSemaphore) -> Result<(), GpuError>;

    fn signal(&mut self, semaphore: GpuSemaphore) -> Result<(), GpuError>;

    /// GPU-side copy of `image` into the presentable frame texture.
    fn copy_to_frame(&mut self, image: GpuImage, extent: Extent) -> Result<(), GpuError>;

    fn destroy_image(&mut self, image: GpuImage);

    fn free_memory(&mut self, memory: GpuMemory);

    fn destroy_semaphore(&mut self, semaphore: GpuSemaphore);
}
