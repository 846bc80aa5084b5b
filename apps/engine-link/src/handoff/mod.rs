//! Zero-copy frame presentation from shared GPU memory.
//!
//! The engine exports a small ring of images plus a start/end semaphore pair
//! per image. The editor imports them once, then for every swap waits on the
//! current image's end semaphore, copies the image into the frame texture,
//! advances the ring and signals the next image's start semaphore so the
//! engine may render into it.

use engine_wire::{DmaBuffer, Extent, ForeignKind};
use thiserror::Error;
use tracing::{debug, warn};

pub mod foreign;
pub mod gpu;

pub use foreign::{ForeignHandleImporter, LocalHandle, native_importer};
pub use gpu::{GpuBackend, GpuError, GpuImage, GpuMemory, GpuSemaphore};

use crate::process::ProcessHandle;

#[derive(Debug, Error)]
pub enum HandoffError {
    #[error("swap requested with an empty ring")]
    EmptyRing,
    #[error("{0:?} references cannot be imported on this platform")]
    UnsupportedKind(ForeignKind),
    #[error("foreign reference {0:#x} is out of range")]
    InvalidReference(u64),
    #[error("no handle to engine process {0}")]
    NoProcessReference(u32),
    #[error("failed to import foreign reference {value:#x}: {source}")]
    Import {
        value: u64,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Gpu(#[from] GpuError),
}

/// One imported ring entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwapImage {
    pub memory: GpuMemory,
    pub image: GpuImage,
    pub start_semaphore: GpuSemaphore,
    pub end_semaphore: GpuSemaphore,
    pub extent: Extent,
    pub offset: u64,
}

#[derive(Debug, Default)]
pub struct FrameHandoff {
    ring: Vec<SwapImage>,
    index: usize,
    pending: usize,
    dma_mode: bool,
}

impl FrameHandoff {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.ring.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn pending_swaps(&self) -> usize {
        self.pending
    }

    /// Whether frames arrive through shared images instead of pixel copies.
    pub fn is_dma_mode(&self) -> bool {
        self.dma_mode
    }

    pub fn current(&self) -> Option<&SwapImage> {
        self.ring.get(self.index)
    }

    /// Imports one engine-exported image and appends it to the ring.
    pub fn push_buffer(
        &mut self,
        gpu: &mut dyn GpuBackend,
        importer: &dyn ForeignHandleImporter,
        process: &ProcessHandle,
        buffer: &DmaBuffer,
    ) -> Result<(), HandoffError> {
        let memory_handle = importer.import(process, buffer.kind, buffer.memory)?;
        let start_handle = importer.import(process, buffer.kind, buffer.start_semaphore)?;
        let end_handle = importer.import(process, buffer.kind, buffer.end_semaphore)?;

        let memory = gpu.import_memory(memory_handle, buffer.size)?;
        let image = match gpu.bind_image(memory, buffer.extent, buffer.offset) {
            Ok(image) => image,
            Err(err) => {
                gpu.free_memory(memory);
                return Err(err.into());
            }
        };
        let start_semaphore = match gpu.import_semaphore(start_handle) {
            Ok(semaphore) => semaphore,
            Err(err) => {
                gpu.destroy_image(image);
                gpu.free_memory(memory);
                return Err(err.into());
            }
        };
        let end_semaphore = match gpu.import_semaphore(end_handle) {
            Ok(semaphore) => semaphore,
            Err(err) => {
                gpu.destroy_semaphore(start_semaphore);
                gpu.destroy_image(image);
                gpu.free_memory(memory);
                return Err(err.into());
            }
        };

        self.ring.push(SwapImage {
            memory,
            image,
            start_semaphore,
            end_semaphore,
            extent: buffer.extent,
            offset: buffer.offset,
        });
        self.dma_mode = true;
        debug!(
            entries = self.ring.len(),
            width = buffer.extent.width,
            height = buffer.extent.height,
            "imported swap image"
        );
        Ok(())
    }

    /// Records one engine swap. Rejected, without touching any state, while
    /// the ring is empty.
    pub fn queue_swap(&mut self) -> Result<(), HandoffError> {
        if self.ring.is_empty() {
            return Err(HandoffError::EmptyRing);
        }
        self.pending += 1;
        Ok(())
    }

    /// Consumes pending swaps oldest first and returns how many were
    /// presented. A GPU failure drops the remaining backlog.
    pub fn present_pending(
        &mut self,
        gpu: &mut dyn GpuBackend,
        target: Extent,
    ) -> Result<usize, HandoffError> {
        let mut presented = 0;
        while self.pending > 0 && !self.ring.is_empty() {
            if let Err(err) = self.present_one(gpu, target) {
                self.pending = 0;
                return Err(err);
            }
            self.pending -= 1;
            presented += 1;
        }
        self.pending = 0;
        Ok(presented)
    }

    fn present_one(&mut self, gpu: &mut dyn GpuBackend, target: Extent) -> Result<(), HandoffError> {
        let current = self.ring[self.index];
        gpu.wait(current.end_semaphore)?;
        if current.extent == target {
            gpu.copy_to_frame(current.image, current.extent)?;
        } else {
            debug!(
                image_width = current.extent.width,
                image_height = current.extent.height,
                target_width = target.width,
                target_height = target.height,
                "swap image size differs from frame; keeping previous frame"
            );
        }
        self.index = (self.index + 1) % self.ring.len();
        gpu.signal(self.ring[self.index].start_semaphore)?;
        Ok(())
    }

    /// Releases every entry and leaves DMA mode.
    pub fn flush(&mut self, gpu: &mut dyn GpuBackend) {
        let released = self.ring.len();
        for entry in self.ring.drain(..) {
            gpu.destroy_image(entry.image);
            gpu.free_memory(entry.memory);
            gpu.destroy_semaphore(entry.start_semaphore);
            gpu.destroy_semaphore(entry.end_semaphore);
        }
        self.index = 0;
        self.pending = 0;
        self.dma_mode = false;
        if released > 0 {
            debug!(released, "flushed swap ring");
        }
    }

    /// Forgets the ring without a device to release it on. Only for teardown
    /// paths where the GPU backend is already gone.
    pub(crate) fn abandon(&mut self) {
        if !self.ring.is_empty() {
            warn!(entries = self.ring.len(), "dropping swap ring without a gpu backend");
        }
        self.ring.clear();
        self.index = 0;
        self.pending = 0;
        self.dma_mode = false;
    }
}
