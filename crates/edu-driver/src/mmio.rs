//! Memory-mapped register access for the edu device
//!
//! [`RegisterFile`] is the seam every backend implements: one 32-bit read or
//! write per call, issued in program order, never cached or batched.
//! [`MappedRegion`] is the hardware implementation over a VFIO-mapped BAR.

// MMIO registers are naturally aligned by hardware, so pointer casts are safe
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_ptr_alignment)]

use crate::error::{EduError, Result};
use crate::vfio::ioctls;
use edu_chip::bar::Bar;
use rustix::mm::{mmap, munmap, MapFlags, ProtFlags};
use std::fs::File;
use std::os::unix::io::{AsFd, AsRawFd};
use std::ptr::NonNull;
use std::sync::atomic::{fence, Ordering};

/// Ordered 32-bit register access.
///
/// A failing access is a [`EduError::BusFault`]; callers treat it as fatal
/// for the whole attachment.
pub trait RegisterFile: Send + Sync {
    /// Read a 32-bit register.
    ///
    /// # Errors
    ///
    /// Returns `BusFault` if the access cannot be performed.
    fn read32(&self, offset: usize) -> Result<u32>;

    /// Write a 32-bit register.
    ///
    /// # Errors
    ///
    /// Returns `BusFault` if the access cannot be performed.
    fn write32(&self, offset: usize, value: u32) -> Result<()>;
}

/// VFIO region info structure
#[repr(C)]
#[derive(Debug, Default)]
struct VfioRegionInfo {
    argsz: u32,
    flags: u32,
    index: u32,
    cap_offset: u32,
    size: u64,
    offset: u64,
}

/// Mapped BAR region for MMIO access
pub struct MappedRegion {
    ptr: NonNull<u8>,
    size: usize,
    bar: Bar,
}

impl std::fmt::Debug for MappedRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MappedRegion")
            .field("ptr", &format_args!("{:p}", self.ptr))
            .field("size", &self.size)
            .field("bar", &self.bar)
            .finish()
    }
}

// SAFETY: Send - MappedRegion owns the mapping exclusively. Moving between threads
// doesn't invalidate it (mmap'd memory is process-wide). No thread-local state.
unsafe impl Send for MappedRegion {}

// SAFETY: Sync - every access is a single volatile 32-bit load or store followed
// by a fence; concurrent callers see whole register values and ordering between
// callers is the engine's responsibility, not the mapping's.
unsafe impl Sync for MappedRegion {}

impl MappedRegion {
    /// Map a BAR region via VFIO
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The VFIO ioctl to get region info fails
    /// - The region is smaller than the register span
    /// - Memory mapping the BAR region fails
    pub fn map(device_fd: &File, bar: Bar) -> Result<Self> {
        let mut region_info = VfioRegionInfo {
            argsz: std::mem::size_of::<VfioRegionInfo>() as u32,
            index: bar.vfio_index(),
            ..Default::default()
        };

        // SAFETY: VFIO_DEVICE_GET_REGION_INFO ioctl - kernel returns BAR size/offset.
        // Invariants: (1) device_fd valid from VFIO device open; (2) VfioRegionInfo initialized
        // with argsz = size_of, index = bar; (3) kernel reads/writes region_info; (4) layout
        // matches kernel.
        let ret = unsafe {
            libc::ioctl(
                device_fd.as_raw_fd(),
                ioctls::VFIO_DEVICE_GET_REGION_INFO as _,
                &raw mut region_info,
            )
        };

        if ret < 0 {
            return Err(EduError::unsupported(format!(
                "Failed to get BAR{} info: {}",
                bar.vfio_index(),
                std::io::Error::last_os_error()
            )));
        }

        tracing::debug!(
            "BAR{}: size={:#x}, offset={:#x}, flags={:#x}",
            bar.vfio_index(),
            region_info.size,
            region_info.offset,
            region_info.flags
        );

        if (region_info.size as usize) < edu_chip::regs::REGISTER_SPAN {
            return Err(EduError::unsupported(format!(
                "BAR{} too small for register file: {:#x} bytes",
                bar.vfio_index(),
                region_info.size
            )));
        }

        // SAFETY: mmap maps the BAR region into the process address space.
        // Invariants: (1) device_fd valid; (2) size/offset from a successful ioctl;
        // (3) mapping exclusive via VFIO/IOMMU; (4) ptr valid for size bytes or Err.
        let addr = unsafe {
            mmap(
                std::ptr::null_mut(),
                region_info.size as usize,
                ProtFlags::READ | ProtFlags::WRITE,
                MapFlags::SHARED,
                device_fd.as_fd(),
                region_info.offset,
            )
            .map_err(|e| {
                EduError::unsupported(format!("Failed to mmap BAR{}: {e}", bar.vfio_index()))
            })?
        };

        let ptr = NonNull::new(addr.cast::<u8>())
            .ok_or_else(|| EduError::unsupported("mmap returned a null mapping"))?;

        tracing::info!(
            "Mapped BAR{} at {:p}, size={:#x}",
            bar.vfio_index(),
            ptr,
            region_info.size
        );

        Ok(Self {
            ptr,
            size: region_info.size as usize,
            bar,
        })
    }

    fn check(&self, offset: usize) -> Result<*mut u32> {
        if offset % 4 != 0 || offset + 4 > self.size {
            return Err(EduError::bus_fault(format!(
                "register access at {offset:#x} outside BAR{} ({:#x} bytes)",
                self.bar.vfio_index(),
                self.size
            )));
        }
        // SAFETY: offset + 4 <= size, so the pointer stays inside the mapping.
        Ok(unsafe { self.ptr.as_ptr().add(offset).cast::<u32>() })
    }

    /// Get BAR type
    pub const fn bar(&self) -> Bar {
        self.bar
    }

    /// Get region size
    pub const fn size(&self) -> usize {
        self.size
    }
}

impl RegisterFile for MappedRegion {
    fn read32(&self, offset: usize) -> Result<u32> {
        let reg = self.check(offset)?;
        // SAFETY: read_volatile required for MMIO - hardware can change the value.
        // reg is inside the mapping (checked) and 4-byte aligned.
        let value = unsafe { reg.read_volatile() };
        fence(Ordering::SeqCst);
        tracing::trace!("read32 @ {offset:#x} = {value:#x}");
        Ok(value)
    }

    fn write32(&self, offset: usize, value: u32) -> Result<()> {
        let reg = self.check(offset)?;
        tracing::trace!("write32 @ {offset:#x} = {value:#x}");
        // Prior stores (e.g. to the DMA buffer) must be visible before the device sees this one.
        fence(Ordering::SeqCst);
        // SAFETY: write_volatile required for MMIO - triggers hardware side effects.
        // reg is inside the mapping (checked) and 4-byte aligned.
        unsafe { reg.write_volatile(value) };
        Ok(())
    }
}

impl Drop for MappedRegion {
    fn drop(&mut self) {
        // SAFETY: ptr and size are exactly what mmap returned in map(); Drop runs once.
        unsafe {
            if let Err(e) = munmap(self.ptr.as_ptr().cast(), self.size) {
                tracing::error!("munmap failed during drop: {e}");
            }
        }
        tracing::debug!("Unmapped BAR{}", self.bar.vfio_index());
    }
}
