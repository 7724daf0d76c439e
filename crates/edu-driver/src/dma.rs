//! Shared DMA staging buffer
//!
//! One coherent, bus-addressable buffer per attachment. It is the implicit
//! source or destination of every DMA command and can be exposed to any
//! number of callers as a zero-copy [`MappedView`]. All views alias the same
//! memory: the buffer is a shared staging area, not per-caller storage.
//!
//! Lifecycle: allocated once at attach, never resized, released when the
//! attachment and every outstanding view have been dropped.

// Bus addresses and sizes are u64 on the wire, usize in the host
#![allow(clippy::cast_possible_truncation)]

use crate::backend::EduBackend;
use crate::error::{EduError, Result};
use edu_chip::regs::dma_mask;
use rustix::mm::{mlock, munlock};
use std::alloc::Layout;
use std::fs::File;
use std::ptr::NonNull;
use std::sync::Arc;

const PAGE_SIZE: usize = 4096;

/// Callback run when a host-backed buffer is released, with its bus address.
pub type ReleaseHook = Box<dyn FnOnce(u64) + Send + Sync>;

enum Backing {
    /// Plain page-aligned host memory (simulated or identity-mapped platforms)
    Host { release: Option<ReleaseHook> },
    /// Pinned memory mapped into a VFIO container's IOMMU domain
    Vfio { container: Arc<File> },
}

/// DMA buffer shared between the host and the device
pub struct DmaBuffer {
    /// Host virtual address
    vaddr: NonNull<u8>,
    /// Device-visible address
    bus_address: u64,
    /// Usable capacity (what DMA commands and views may cover)
    capacity: usize,
    /// Page-rounded allocation layout
    layout: Layout,
    backing: Backing,
}

impl std::fmt::Debug for DmaBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match self.backing {
            Backing::Host { .. } => "host",
            Backing::Vfio { .. } => "vfio",
        };
        f.debug_struct("DmaBuffer")
            .field("vaddr", &format_args!("{:p}", self.vaddr))
            .field("bus_address", &format_args!("{:#x}", self.bus_address))
            .field("capacity", &self.capacity)
            .field("backing", &kind)
            .finish()
    }
}

// SAFETY: DmaBuffer owns its allocation; the raw pointer is never tied to a thread.
unsafe impl Send for DmaBuffer {}

// SAFETY: all host access goes through MappedView's bounds-checked copies. Views
// alias by design (the device writes the same memory concurrently); there are no
// Rust references into the buffer handed out, so no aliasing guarantees are broken.
unsafe impl Sync for DmaBuffer {}

fn alloc_pages(capacity: usize) -> Result<(NonNull<u8>, Layout)> {
    if capacity == 0 {
        return Err(EduError::invalid_argument("DMA buffer capacity must be non-zero"));
    }
    let aligned = capacity.div_ceil(PAGE_SIZE) * PAGE_SIZE;
    let layout = Layout::from_size_align(aligned, PAGE_SIZE)
        .map_err(|_| EduError::OutOfMemory { requested: capacity })?;

    // SAFETY: layout has non-zero size and a power-of-two alignment; the
    // allocation is released in Drop with the same layout.
    let vaddr = unsafe { std::alloc::alloc_zeroed(layout) };
    let vaddr = NonNull::new(vaddr).ok_or(EduError::OutOfMemory { requested: capacity })?;
    Ok((vaddr, layout))
}

impl DmaBuffer {
    /// Allocate page-aligned host memory that the platform exposes at `bus_address`.
    ///
    /// `release` runs once the buffer is dropped, so the platform can drop its
    /// translation for `bus_address`.
    ///
    /// # Errors
    ///
    /// Returns `OutOfMemory` if the allocation fails, `InvalidArgument` for a zero capacity.
    pub fn host(capacity: usize, bus_address: u64, release: Option<ReleaseHook>) -> Result<Self> {
        let (vaddr, layout) = alloc_pages(capacity)?;
        tracing::debug!(
            "Allocated host DMA buffer: vaddr={vaddr:p}, bus={bus_address:#x}, capacity={capacity}"
        );
        Ok(Self {
            vaddr,
            bus_address,
            capacity,
            layout,
            backing: Backing::Host { release },
        })
    }

    /// Allocate pinned memory and map it into a VFIO container at `iova`.
    pub(crate) fn vfio(container: Arc<File>, capacity: usize, iova: u64) -> Result<Self> {
        let (vaddr, layout) = alloc_pages(capacity)?;

        // SAFETY: mlock prevents the pages from moving while the device addresses them.
        // [vaddr, vaddr + layout.size()) is exactly the allocation above.
        if let Err(e) = unsafe { mlock(vaddr.as_ptr().cast(), layout.size()) } {
            // SAFETY: vaddr allocated above with layout; released before return.
            unsafe { std::alloc::dealloc(vaddr.as_ptr(), layout) };
            tracing::warn!("Failed to lock DMA memory: {e}");
            return Err(EduError::OutOfMemory { requested: capacity });
        }

        if let Err(e) = crate::vfio::map_dma(&container, vaddr.as_ptr() as u64, iova, layout.size())
        {
            // SAFETY: vaddr was allocated and mlock'd above with this layout.
            unsafe {
                let _ = munlock(vaddr.as_ptr().cast(), layout.size());
                std::alloc::dealloc(vaddr.as_ptr(), layout);
            };
            return Err(e);
        }

        tracing::debug!(
            "Created VFIO DMA buffer: vaddr={vaddr:p}, iova={iova:#x}, size={:#x}",
            layout.size()
        );

        Ok(Self {
            vaddr,
            bus_address: iova,
            capacity,
            layout,
            backing: Backing::Vfio { container },
        })
    }

    /// Allocate the attachment's buffer through `backend` and check it is
    /// addressable by a device with a `dma_bits`-wide DMA engine.
    ///
    /// # Errors
    ///
    /// Returns `OutOfMemory` if the backend cannot allocate, `AddressNotSupported`
    /// if any byte of the buffer lies above the device's address mask.
    pub fn allocate(backend: &dyn EduBackend, capacity: usize, dma_bits: u8) -> Result<Arc<Self>> {
        let buffer = backend.alloc_dma(capacity)?;
        if !buffer.fits(dma_bits) {
            tracing::warn!(
                "DMA buffer at {:#x} exceeds the {dma_bits}-bit device mask",
                buffer.bus_address
            );
            return Err(EduError::AddressNotSupported {
                bus_address: buffer.bus_address,
                bits: dma_bits,
            });
        }
        tracing::debug!("DMA bus addr = {:#010x}", buffer.bus_address);
        tracing::debug!("DMA virt addr = {:p}", buffer.vaddr);
        Ok(Arc::new(buffer))
    }

    /// Whether every byte of the buffer is reachable with a `bits`-wide address.
    pub fn fits(&self, bits: u8) -> bool {
        self.bus_address
            .checked_add(self.capacity as u64 - 1)
            .is_some_and(|end| end <= dma_mask(bits))
    }

    /// Bus address as programmed into a 32-bit DMA register.
    ///
    /// # Errors
    ///
    /// Returns `AddressNotSupported` if the address does not fit 32 bits.
    pub fn bus_address32(&self) -> Result<u32> {
        u32::try_from(self.bus_address).map_err(|_| {
            tracing::warn!("DMA bus addr is greater than 32 bits, cannot program the device");
            EduError::AddressNotSupported {
                bus_address: self.bus_address,
                bits: 32,
            }
        })
    }

    /// Device-visible address
    pub const fn bus_address(&self) -> u64 {
        self.bus_address
    }

    /// Usable capacity in bytes
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Host pointer to the start of the buffer
    pub const fn as_ptr(&self) -> *mut u8 {
        self.vaddr.as_ptr()
    }
}

impl Drop for DmaBuffer {
    fn drop(&mut self) {
        match &mut self.backing {
            Backing::Host { release } => {
                if let Some(release) = release.take() {
                    release(self.bus_address);
                }
            }
            Backing::Vfio { container } => {
                if let Err(e) = crate::vfio::unmap_dma(container, self.bus_address, self.layout.size())
                {
                    tracing::warn!("DMA unmap failed: {e}");
                }
                // SAFETY: vaddr was mlock'd for layout.size() bytes in vfio().
                unsafe {
                    let _ = munlock(self.vaddr.as_ptr().cast(), self.layout.size());
                };
            }
        }

        // SAFETY: vaddr came from alloc_zeroed with self.layout; no references remain.
        unsafe { std::alloc::dealloc(self.vaddr.as_ptr(), self.layout) };

        tracing::debug!("Freed DMA buffer at bus={:#x}", self.bus_address);
    }
}

/// Zero-copy view of the shared DMA buffer.
///
/// Views keep the buffer's memory alive. After the device is detached the
/// contents are no longer meaningful.
#[derive(Debug, Clone)]
pub struct MappedView {
    buffer: Arc<DmaBuffer>,
    len: usize,
}

/// Expose `buffer` as a view of `len` bytes starting at `offset`.
///
/// Only offset 0 is supported.
///
/// # Errors
///
/// Returns `InvalidArgument` if `offset != 0` or `len` exceeds the capacity.
pub fn expose(buffer: &Arc<DmaBuffer>, offset: u64, len: usize) -> Result<MappedView> {
    if offset != 0 {
        return Err(EduError::invalid_argument(format!(
            "map offset must be 0, got {offset:#x}"
        )));
    }
    if len > buffer.capacity() {
        return Err(EduError::invalid_argument(format!(
            "map length {len} exceeds buffer capacity {}",
            buffer.capacity()
        )));
    }
    Ok(MappedView {
        buffer: Arc::clone(buffer),
        len,
    })
}

impl MappedView {
    /// Length of the view in bytes
    pub const fn len(&self) -> usize {
        self.len
    }

    /// Whether the view is empty
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Bus address of the underlying buffer
    pub fn bus_address(&self) -> u64 {
        self.buffer.bus_address()
    }

    /// Raw pointer to the first byte of the view.
    pub fn as_ptr(&self) -> *mut u8 {
        self.buffer.as_ptr()
    }

    fn check(&self, offset: usize, count: usize) -> Result<()> {
        if offset.checked_add(count).is_none_or(|end| end > self.len) {
            return Err(EduError::invalid_argument(format!(
                "access of {count} bytes at {offset:#x} outside {}-byte view",
                self.len
            )));
        }
        Ok(())
    }

    /// Copy bytes out of the view.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` if the range exceeds the view.
    pub fn read(&self, offset: usize, dst: &mut [u8]) -> Result<()> {
        self.check(offset, dst.len())?;
        // SAFETY: range checked against len <= capacity; dst is a distinct Rust slice.
        unsafe {
            std::ptr::copy_nonoverlapping(self.as_ptr().add(offset), dst.as_mut_ptr(), dst.len());
        }
        Ok(())
    }

    /// Copy bytes into the view.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` if the range exceeds the view.
    pub fn write(&self, offset: usize, src: &[u8]) -> Result<()> {
        self.check(offset, src.len())?;
        // SAFETY: range checked against len <= capacity; src is a distinct Rust slice.
        unsafe {
            std::ptr::copy_nonoverlapping(src.as_ptr(), self.as_ptr().add(offset), src.len());
        }
        Ok(())
    }

    /// Fill the whole view with `byte`.
    pub fn fill(&self, byte: u8) {
        // SAFETY: the view covers len bytes of a live allocation.
        unsafe { std::ptr::write_bytes(self.as_ptr(), byte, self.len) };
    }

    /// Copy the whole view into a new vector.
    pub fn to_vec(&self) -> Vec<u8> {
        let mut out = vec![0u8; self.len];
        // SAFETY: out has exactly len bytes; the view covers len bytes.
        unsafe { std::ptr::copy_nonoverlapping(self.as_ptr(), out.as_mut_ptr(), self.len) };
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn buffer(capacity: usize, bus: u64) -> Arc<DmaBuffer> {
        Arc::new(DmaBuffer::host(capacity, bus, None).unwrap())
    }

    #[test]
    fn zero_capacity_rejected() {
        assert!(matches!(
            DmaBuffer::host(0, 0x1000, None),
            Err(EduError::InvalidArgument { .. })
        ));
    }

    #[test]
    fn addressable_width() {
        let buf = buffer(4096, 0x0010_0000);
        assert!(buf.fits(28));
        assert!(buf.fits(32));
        assert_eq!(buf.bus_address32().unwrap(), 0x0010_0000);

        let edge = buffer(4096, 0x0FFF_F000);
        assert!(edge.fits(28));
        let over = buffer(4096, 0x0FFF_F001);
        assert!(!over.fits(28));

        let high = buffer(4096, 0x1_0000_0000);
        assert!(!high.fits(32));
        assert!(high.fits(40));
        assert!(matches!(
            high.bus_address32(),
            Err(EduError::AddressNotSupported { bits: 32, .. })
        ));
    }

    #[test]
    fn expose_rules() {
        let buf = buffer(4096, 0x1000);
        assert!(expose(&buf, 0, 4096).is_ok());
        assert!(expose(&buf, 0, 0).is_ok());
        assert!(matches!(
            expose(&buf, 4096, 16),
            Err(EduError::InvalidArgument { .. })
        ));
        assert!(matches!(
            expose(&buf, 0, 4097),
            Err(EduError::InvalidArgument { .. })
        ));
    }

    #[test]
    fn views_alias_the_same_memory() {
        let buf = buffer(4096, 0x1000);
        let a = expose(&buf, 0, 4096).unwrap();
        let b = expose(&buf, 0, 128).unwrap();
        a.write(10, b"shared").unwrap();
        let mut out = [0u8; 6];
        b.read(10, &mut out).unwrap();
        assert_eq!(&out, b"shared");
        assert!(b.read(125, &mut out).is_err());
    }

    #[test]
    fn release_hook_runs_after_last_view() {
        use std::sync::atomic::{AtomicU64, Ordering};
        let released = Arc::new(AtomicU64::new(0));
        let seen = Arc::clone(&released);
        let buf = Arc::new(
            DmaBuffer::host(
                4096,
                0x2000,
                Some(Box::new(move |bus| seen.store(bus, Ordering::SeqCst))),
            )
            .unwrap(),
        );
        let view = expose(&buf, 0, 16).unwrap();
        drop(buf);
        assert_eq!(released.load(Ordering::SeqCst), 0);
        view.fill(0xAA);
        assert_eq!(view.to_vec(), vec![0xAA; 16]);
        drop(view);
        assert_eq!(released.load(Ordering::SeqCst), 0x2000);
    }
}
