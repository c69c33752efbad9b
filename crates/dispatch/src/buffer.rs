//! Typed, visibility-tagged GPU buffers.

use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::backend::{BufferId, BufferKind, BufferVisibility, DescriptorSetId};
use crate::error::DispatchError;
use crate::instance::InstanceContext;

/// Logical dimensions of a buffer; `size = width * height * element_size`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferDims {
    pub width: usize,
    pub height: usize,
    pub element_size: usize,
}

impl BufferDims {
    #[must_use]
    pub const fn new(width: usize, height: usize, element_size: usize) -> Self {
        Self {
            width,
            height,
            element_size,
        }
    }

    /// Zero-length buffers cannot be allocated or bound, so every factor is
    /// forced to at least 1. Callers that only know their real size later
    /// allocate a placeholder and `resize` when the size is known.
    #[must_use]
    pub fn clamped(self) -> Self {
        Self {
            width: self.width.max(1),
            height: self.height.max(1),
            element_size: self.element_size.max(1),
        }
    }

    #[must_use]
    pub fn size(&self) -> usize {
        self.width * self.height * self.element_size
    }
}

struct BufferInner {
    ctx: Option<InstanceContext>,
    dims: BufferDims,
    backend_buffer: Option<BufferId>,
    bound_set: Option<DescriptorSetId>,
    mapped: bool,
}

/// A uniform or storage buffer owned by one job and bound to one descriptor
/// slot.
///
/// The per-buffer mutex guards (de)allocation and map/unmap transitions; it
/// does not serialize access to mapped memory, and `bind`/`resize` are only
/// legal while no GPU command referencing the buffer is in flight.
pub struct ComputeBuffer {
    binding: u32,
    kind: BufferKind,
    visibility: BufferVisibility,
    size_has_changed: AtomicBool,
    inner: Mutex<BufferInner>,
}

impl ComputeBuffer {
    #[must_use]
    pub fn new(binding: u32, kind: BufferKind, visibility: BufferVisibility) -> Arc<Self> {
        Arc::new(Self {
            binding,
            kind,
            visibility,
            size_has_changed: AtomicBool::new(false),
            inner: Mutex::new(BufferInner {
                ctx: None,
                dims: BufferDims::new(1, 1, 1),
                backend_buffer: None,
                bound_set: None,
                mapped: false,
            }),
        })
    }

    #[must_use]
    pub fn binding(&self) -> u32 {
        self.binding
    }

    #[must_use]
    pub fn kind(&self) -> BufferKind {
        self.kind
    }

    #[must_use]
    pub fn visibility(&self) -> BufferVisibility {
        self.visibility
    }

    #[must_use]
    pub fn dims(&self) -> BufferDims {
        self.inner.lock().dims
    }

    #[must_use]
    pub fn size(&self) -> usize {
        self.inner.lock().dims.size()
    }

    /// True while a `resize` has not yet been observed by a command-buffer
    /// re-record.
    #[must_use]
    pub fn size_changed(&self) -> bool {
        self.size_has_changed.load(Ordering::SeqCst)
    }

    pub(crate) fn take_size_changed(&self) -> bool {
        self.size_has_changed.swap(false, Ordering::SeqCst)
    }

    /// Creates the backend buffer with `dims` clamped to at least 1 per
    /// factor. Allocating an already-allocated buffer is a no-op.
    pub fn allocate(&self, ctx: &InstanceContext, dims: BufferDims) -> Result<(), DispatchError> {
        let mut inner = self.inner.lock();
        if inner.backend_buffer.is_some() {
            return Ok(());
        }
        let dims = dims.clamped();
        let id = ctx
            .backend()
            .create_buffer(dims.size(), self.kind, self.visibility)?;
        inner.ctx = Some(ctx.clone());
        inner.dims = dims;
        inner.backend_buffer = Some(id);
        Ok(())
    }

    pub(crate) fn ensure_allocated(&self, ctx: &InstanceContext) -> Result<(), DispatchError> {
        let dims = self.dims();
        self.allocate(ctx, dims)
    }

    /// Writes this buffer into `set` at its binding slot. Legal only while
    /// the GPU is not executing a command referencing the set.
    pub fn bind(&self, set: DescriptorSetId) -> Result<(), DispatchError> {
        let mut inner = self.inner.lock();
        let ctx = inner.ctx.clone().ok_or(DispatchError::InvalidArg)?;
        let buffer = inner.backend_buffer.ok_or(DispatchError::InvalidArg)?;
        ctx.backend()
            .update_descriptor_set(set, self.binding, self.kind, buffer, inner.dims.size())?;
        inner.bound_set = Some(set);
        Ok(())
    }

    /// Deallocates and reallocates at `dims`, flags the owning shader that
    /// its command buffer must be re-recorded, and re-issues the descriptor
    /// write when bound. The caller guarantees GPU quiescence.
    pub fn resize(&self, dims: BufferDims) -> Result<(), DispatchError> {
        let mut inner = self.inner.lock();
        let ctx = inner.ctx.clone().ok_or(DispatchError::InvalidArg)?;
        if inner.mapped {
            return Err(DispatchError::InvalidArg);
        }

        let dims = dims.clamped();
        tracing::debug!(
            binding = self.binding,
            width = dims.width,
            height = dims.height,
            element_size = dims.element_size,
            "resizing buffer"
        );

        if let Some(old) = inner.backend_buffer.take() {
            ctx.backend().destroy_buffer(old);
        }
        let id = ctx
            .backend()
            .create_buffer(dims.size(), self.kind, self.visibility)?;
        inner.dims = dims;
        inner.backend_buffer = Some(id);
        self.size_has_changed.store(true, Ordering::SeqCst);

        if let Some(set) = inner.bound_set {
            ctx.backend()
                .update_descriptor_set(set, self.binding, self.kind, id, dims.size())?;
        }
        Ok(())
    }

    /// Maps the buffer into host memory, allocating it first if needed.
    /// The returned guard unmaps on drop.
    pub fn map(&self) -> Result<MappedBuffer<'_>, DispatchError> {
        let mut inner = self.inner.lock();
        let ctx = inner.ctx.clone().ok_or(DispatchError::InvalidArg)?;
        if inner.mapped {
            return Err(DispatchError::InvalidArg);
        }

        if inner.backend_buffer.is_none() {
            let dims = inner.dims.clamped();
            let id = ctx
                .backend()
                .create_buffer(dims.size(), self.kind, self.visibility)?;
            inner.dims = dims;
            inner.backend_buffer = Some(id);
        }

        let buffer = inner.backend_buffer.expect("allocated above");
        let ptr = ctx.backend().map_buffer(buffer)?;
        inner.mapped = true;
        Ok(MappedBuffer {
            owner: self,
            ptr,
            len: inner.dims.size(),
        })
    }

    /// Releases the backend buffer. The dims are kept so a later `map` or
    /// `allocate` can recreate it.
    pub fn free(&self) {
        let mut inner = self.inner.lock();
        if let (Some(ctx), Some(buffer)) = (inner.ctx.clone(), inner.backend_buffer.take()) {
            ctx.backend().destroy_buffer(buffer);
        }
        inner.bound_set = None;
    }

    fn unmap(&self) {
        let mut inner = self.inner.lock();
        if !inner.mapped {
            return;
        }
        if let (Some(ctx), Some(buffer)) = (inner.ctx.clone(), inner.backend_buffer) {
            ctx.backend().unmap_buffer(buffer);
        }
        inner.mapped = false;
    }
}

impl Drop for ComputeBuffer {
    fn drop(&mut self) {
        self.free();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::HostBackend;

    fn ctx(generation: u64) -> InstanceContext {
        InstanceContext::for_tests(Arc::new(HostBackend::new(0, false)), generation)
    }

    #[test]
    fn allocate_clamps_zero_dims() {
        let buffer = ComputeBuffer::new(0, BufferKind::Storage, BufferVisibility::Shared);
        buffer.allocate(&ctx(1000), BufferDims::new(0, 0, 0)).unwrap();
        assert_eq!(buffer.dims(), BufferDims::new(1, 1, 1));
        assert_eq!(buffer.size(), 1);
    }

    #[test]
    fn repeated_resize_flags_each_time() {
        let buffer = ComputeBuffer::new(0, BufferKind::Storage, BufferVisibility::Shared);
        buffer.allocate(&ctx(1001), BufferDims::new(1, 1, 4)).unwrap();
        assert!(!buffer.size_changed());

        let dims = BufferDims::new(640, 480, 16);
        buffer.resize(dims).unwrap();
        assert!(buffer.size_changed());
        assert!(buffer.take_size_changed());
        assert!(!buffer.size_changed());

        // Same dims again still deallocates, reallocates and re-flags.
        buffer.resize(dims).unwrap();
        assert!(buffer.take_size_changed());
        assert_eq!(buffer.dims(), dims);
    }

    #[test]
    fn map_write_then_read_roundtrip() {
        let buffer = ComputeBuffer::new(0, BufferKind::Storage, BufferVisibility::Shared);
        buffer.allocate(&ctx(1002), BufferDims::new(4, 1, 4)).unwrap();

        {
            let mut mapped = buffer.map().unwrap();
            mapped.copy_from_slice(&[7u8; 16]);
        }
        let mapped = buffer.map().unwrap();
        assert_eq!(&mapped[..], &[7u8; 16]);
    }

    #[test]
    fn map_after_free_reallocates_with_kept_dims() {
        let buffer = ComputeBuffer::new(0, BufferKind::Storage, BufferVisibility::Shared);
        buffer.allocate(&ctx(1003), BufferDims::new(8, 1, 4)).unwrap();
        buffer.free();

        let mapped = buffer.map().unwrap();
        assert_eq!(mapped.len(), 32);
    }

    #[test]
    fn resize_without_allocate_is_invalid() {
        let buffer = ComputeBuffer::new(0, BufferKind::Storage, BufferVisibility::Shared);
        assert_eq!(
            buffer.resize(BufferDims::new(2, 2, 2)),
            Err(DispatchError::InvalidArg)
        );
    }

    #[test]
    fn concurrent_map_is_rejected() {
        let buffer = ComputeBuffer::new(0, BufferKind::Storage, BufferVisibility::Shared);
        buffer.allocate(&ctx(1004), BufferDims::new(1, 1, 4)).unwrap();

        let mapped = buffer.map().unwrap();
        assert!(matches!(buffer.map(), Err(DispatchError::InvalidArg)));
        drop(mapped);
        assert!(buffer.map().is_ok());
    }
}

/// Scoped view of a mapped buffer; unmaps when dropped.
pub struct MappedBuffer<'a> {
    owner: &'a ComputeBuffer,
    ptr: *mut u8,
    len: usize,
}

impl Deref for MappedBuffer<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        // The backend keeps the mapping valid until unmap, and the owner's
        // mapped flag prevents a concurrent remap or resize.
        unsafe { std::slice::from_raw_parts(self.ptr, self.len) }
    }
}

impl DerefMut for MappedBuffer<'_> {
    fn deref_mut(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr, self.len) }
    }
}

impl Drop for MappedBuffer<'_> {
    fn drop(&mut self) {
        self.owner.unmap();
    }
}
