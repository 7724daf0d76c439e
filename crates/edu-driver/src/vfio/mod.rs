//! VFIO edu backend
//!
//! This backend uses Linux VFIO (Virtual Function I/O) to provide:
//!
//! - BAR0 register access through an mmap of the device region
//! - A DMA buffer pinned and mapped into the IOMMU at a chosen IOVA
//! - Interrupt delivery through an eventfd (INTx with unmask, or MSI)
//!
//! # Requirements
//!
//! 1. IOMMU enabled in the kernel (`intel_iommu=on` or `amd_iommu=on`), or
//!    QEMU started with `-device intel-iommu`
//! 2. Device bound to `vfio-pci`
//! 3. User in `vfio` group or root permissions
//!
//! # Setup Commands
//!
//! ```bash
//! # QEMU guest with the device
//! qemu-system-x86_64 ... -device edu
//!
//! # Bind to vfio-pci
//! echo "1234 11e8" > /sys/bus/pci/drivers/vfio-pci/new_id
//!
//! # Grant user access
//! sudo chown $USER /dev/vfio/$IOMMU_GROUP
//! ```
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────┐     ┌─────────────┐     ┌─────────────┐
//! │  Session    │────▶│  VFIO API   │────▶│   IOMMU     │
//! │  (Rust)     │     │  (ioctls)   │     │             │
//! └─────────────┘     └─────────────┘     └─────────────┘
//!        ▲                   │                   │
//!        │ eventfd           ▼                   ▼
//! ┌─────────────┐     ┌─────────────┐     ┌─────────────┐
//! │ dispatcher  │◀────│  DMA Buffer │────▶│   edu       │
//! │  thread     │     │  (pinned)   │     │   device    │
//! └─────────────┘     └─────────────┘     └─────────────┘
//! ```
//!
//! VFIO ioctls use libc: rustix::ioctl requires an Ioctl impl per call shape,
//! and VFIO mixes int, struct, fd-pointer and C-string arguments.

// FFI/ioctl casts are intentional - VFIO API requires specific types
#![allow(clippy::cast_possible_truncation)]

use crate::backend::{BackendType, EduBackend, InterruptSource};
use crate::config::{EduConfig, IrqMode};
use crate::dma::DmaBuffer;
use crate::error::{EduError, Result};
use crate::mmio::{MappedRegion, RegisterFile};
use edu_chip::bar::Bar;
use parking_lot::Mutex;
use rustix::event::{eventfd, EventfdFlags};
use std::fs::{File, OpenOptions};
use std::os::fd::{AsFd, AsRawFd, FromRawFd, OwnedFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// VFIO ioctl numbers (from Linux kernel headers)
///
/// These are calculated as: _IO(';', base + offset)
/// where _IO is: ((type as u64) << 8) | nr
pub(crate) mod ioctls {
    use std::os::raw::c_ulong;

    /// Helper to create ioctl number: _IO(type, nr) = (type << 8) | nr
    const fn io(ty: u8, nr: u8) -> c_ulong {
        ((ty as c_ulong) << 8) | (nr as c_ulong)
    }

    pub const VFIO_TYPE: u8 = b';';
    pub const VFIO_BASE: u8 = 100;

    // VFIO container ioctls
    pub const VFIO_GET_API_VERSION: c_ulong = io(VFIO_TYPE, VFIO_BASE);
    pub const VFIO_CHECK_EXTENSION: c_ulong = io(VFIO_TYPE, VFIO_BASE + 1);
    pub const VFIO_SET_IOMMU: c_ulong = io(VFIO_TYPE, VFIO_BASE + 2);

    // VFIO group ioctls
    pub const VFIO_GROUP_GET_STATUS: c_ulong = io(VFIO_TYPE, VFIO_BASE + 3);
    pub const VFIO_GROUP_SET_CONTAINER: c_ulong = io(VFIO_TYPE, VFIO_BASE + 4);
    pub const VFIO_GROUP_GET_DEVICE_FD: c_ulong = io(VFIO_TYPE, VFIO_BASE + 6);

    // VFIO device ioctls
    pub const VFIO_DEVICE_GET_INFO: c_ulong = io(VFIO_TYPE, VFIO_BASE + 7);
    pub const VFIO_DEVICE_GET_REGION_INFO: c_ulong = io(VFIO_TYPE, VFIO_BASE + 8);
    pub const VFIO_DEVICE_GET_IRQ_INFO: c_ulong = io(VFIO_TYPE, VFIO_BASE + 9);
    pub const VFIO_DEVICE_SET_IRQS: c_ulong = io(VFIO_TYPE, VFIO_BASE + 10);

    // IOMMU DMA mapping
    pub const VFIO_IOMMU_MAP_DMA: c_ulong = io(VFIO_TYPE, VFIO_BASE + 13);
    pub const VFIO_IOMMU_UNMAP_DMA: c_ulong = io(VFIO_TYPE, VFIO_BASE + 14);

    // API version
    pub const VFIO_API_VERSION: i32 = 0;

    // IOMMU types
    pub const VFIO_TYPE1V2_IOMMU: u32 = 3;

    // Group status flags
    pub const VFIO_GROUP_FLAGS_VIABLE: u32 = 1 << 0;

    // DMA map flags
    pub const VFIO_DMA_MAP_FLAG_READ: u32 = 1 << 0;
    pub const VFIO_DMA_MAP_FLAG_WRITE: u32 = 1 << 1;

    // IRQ set flags
    pub const VFIO_IRQ_SET_DATA_NONE: u32 = 1 << 0;
    pub const VFIO_IRQ_SET_DATA_EVENTFD: u32 = 1 << 2;
    pub const VFIO_IRQ_SET_ACTION_UNMASK: u32 = 1 << 4;
    pub const VFIO_IRQ_SET_ACTION_TRIGGER: u32 = 1 << 5;

    // IRQ indexes of a PCI device
    pub const VFIO_PCI_INTX_IRQ_INDEX: u32 = 0;
    pub const VFIO_PCI_MSI_IRQ_INDEX: u32 = 1;
}

/// VFIO device info structure
#[repr(C)]
#[derive(Debug, Default)]
struct VfioDeviceInfo {
    argsz: u32,
    flags: u32,
    num_regions: u32,
    num_irqs: u32,
}

/// VFIO group status structure
#[repr(C)]
#[derive(Debug, Default)]
struct VfioGroupStatus {
    argsz: u32,
    flags: u32,
}

/// VFIO IRQ info structure
#[repr(C)]
#[derive(Debug, Default)]
struct VfioIrqInfo {
    argsz: u32,
    flags: u32,
    index: u32,
    count: u32,
}

/// VFIO IRQ set structure without payload
#[repr(C)]
#[derive(Debug, Default)]
struct VfioIrqSet {
    argsz: u32,
    flags: u32,
    index: u32,
    start: u32,
    count: u32,
}

/// VFIO IRQ set structure carrying one eventfd
#[repr(C)]
#[derive(Debug, Default)]
struct VfioIrqSetFd {
    argsz: u32,
    flags: u32,
    index: u32,
    start: u32,
    count: u32,
    fd: i32,
}

/// VFIO DMA map structure
#[repr(C)]
#[derive(Debug, Default)]
struct VfioDmaMap {
    argsz: u32,
    flags: u32,
    vaddr: u64,
    iova: u64,
    size: u64,
}

/// VFIO DMA unmap structure
#[repr(C)]
#[derive(Debug, Default)]
struct VfioDmaUnmap {
    argsz: u32,
    flags: u32,
    iova: u64,
    size: u64,
}

/// Map `size` bytes at host `vaddr` into the container's IOMMU at `iova`.
pub(crate) fn map_dma(container: &File, vaddr: u64, iova: u64, size: usize) -> Result<()> {
    let dma_map = VfioDmaMap {
        argsz: std::mem::size_of::<VfioDmaMap>() as u32,
        flags: ioctls::VFIO_DMA_MAP_FLAG_READ | ioctls::VFIO_DMA_MAP_FLAG_WRITE,
        vaddr,
        iova,
        size: size as u64,
    };

    tracing::debug!(
        "DMA map attempt: vaddr={:#x}, iova={:#x}, size={:#x}, flags={:#x}",
        dma_map.vaddr,
        dma_map.iova,
        dma_map.size,
        dma_map.flags
    );

    // SAFETY: VFIO_IOMMU_MAP_DMA ioctl - kernel maps the user buffer at IOVA.
    // Invariants: (1) container fd valid from VFIO container open; (2) dma_map has argsz,
    // vaddr/iova/size of a pinned allocation; (3) _IOW ioctl reads dma_map; (4) layout matches kernel.
    let ret = unsafe {
        libc::ioctl(
            container.as_raw_fd(),
            ioctls::VFIO_IOMMU_MAP_DMA as _,
            &raw const dma_map,
        )
    };

    if ret < 0 {
        let err = std::io::Error::last_os_error();
        tracing::warn!("DMA map failed: {} (ret={})", err, ret);
        return Err(err.into());
    }
    Ok(())
}

/// Remove the IOMMU mapping at `iova`.
pub(crate) fn unmap_dma(container: &File, iova: u64, size: usize) -> Result<()> {
    let dma_unmap = VfioDmaUnmap {
        argsz: std::mem::size_of::<VfioDmaUnmap>() as u32,
        flags: 0,
        iova,
        size: size as u64,
    };

    // SAFETY: VFIO_IOMMU_UNMAP_DMA ioctl - kernel unmaps IOVA before the memory is freed.
    // Invariants: (1) container fd valid; (2) iova/size from our mapping; (3) layout matches kernel.
    let ret = unsafe {
        libc::ioctl(
            container.as_raw_fd(),
            ioctls::VFIO_IOMMU_UNMAP_DMA as _,
            &raw const dma_unmap,
        )
    };

    if ret < 0 {
        return Err(std::io::Error::last_os_error().into());
    }
    Ok(())
}

fn read_sysfs_id(pcie_address: &str, attr: &str) -> Result<u16> {
    let path = format!("/sys/bus/pci/devices/{pcie_address}/{attr}");
    let raw = std::fs::read_to_string(&path).map_err(|_| EduError::device_not_found(&path))?;
    let raw = raw.trim();
    u16::from_str_radix(raw.trim_start_matches("0x"), 16)
        .map_err(|e| EduError::unsupported(format!("Cannot parse {path} ({raw}): {e}")))
}

/// VFIO edu backend
#[derive(Debug)]
pub struct VfioBackend {
    /// PCIe address
    pcie_address: String,
    /// VFIO container file descriptor (shared with DMA buffers for unmap)
    container: Arc<File>,
    /// VFIO group file descriptor (kept open for lifetime)
    #[allow(dead_code)] // Needed for VFIO lifetime
    group: File,
    /// VFIO device file descriptor
    device: Arc<File>,
    /// BAR0 registers (MMIO mapped)
    control_regs: MappedRegion,
    /// Interrupt delivery mode
    irq_mode: IrqMode,
    /// Next available IOVA
    next_iova: Mutex<u64>,
}

impl VfioBackend {
    /// Open the device at `pcie_address` through VFIO.
    ///
    /// # Errors
    ///
    /// Returns `DeviceNotFound` if the PCI function does not exist, or
    /// `Unsupported` if any VFIO setup step fails.
    pub fn init(pcie_address: &str, config: &EduConfig) -> Result<Self> {
        tracing::info!("Initializing VFIO backend for {pcie_address}");

        let vendor = read_sysfs_id(pcie_address, "vendor")?;
        let device_id = read_sysfs_id(pcie_address, "device")?;
        if !edu_chip::pcie::is_edu(vendor, device_id) {
            return Err(EduError::unsupported(format!(
                "{pcie_address} is {vendor:04x}:{device_id:04x}, not an edu device"
            )));
        }

        let iommu_group = iommu_group(pcie_address)?;
        tracing::debug!("IOMMU group: {iommu_group}");

        // Open VFIO container
        let container = OpenOptions::new()
            .read(true)
            .write(true)
            .open("/dev/vfio/vfio")
            .map_err(|e| EduError::unsupported(format!("Cannot open /dev/vfio/vfio: {e}")))?;

        // SAFETY: VFIO_GET_API_VERSION ioctl - queries kernel VFIO API version.
        // Invariants: (1) container fd valid from open; (2) _IO(no arg) returns int.
        let api_version =
            unsafe { libc::ioctl(container.as_raw_fd(), ioctls::VFIO_GET_API_VERSION as _) };

        if api_version != ioctls::VFIO_API_VERSION {
            return Err(EduError::unsupported(format!(
                "Unsupported VFIO API version: {api_version}"
            )));
        }

        // SAFETY: VFIO_CHECK_EXTENSION ioctl - queries kernel for Type1v2 IOMMU.
        // Invariants: (1) container fd valid; (2) third arg is the extension id.
        let has_type1 = unsafe {
            libc::ioctl(
                container.as_raw_fd(),
                ioctls::VFIO_CHECK_EXTENSION as _,
                ioctls::VFIO_TYPE1V2_IOMMU,
            )
        };

        if has_type1 != 1 {
            return Err(EduError::unsupported("VFIO Type1v2 IOMMU not supported"));
        }

        // Open IOMMU group
        let group_path = format!("/dev/vfio/{iommu_group}");
        let group = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&group_path)
            .map_err(|e| EduError::unsupported(format!("Cannot open {group_path}: {e}")))?;

        let mut group_status = VfioGroupStatus {
            argsz: std::mem::size_of::<VfioGroupStatus>() as u32,
            flags: 0,
        };

        // SAFETY: VFIO_GROUP_GET_STATUS ioctl - kernel fills group_status.
        // Invariants: (1) group fd valid from open; (2) _IOWR reads/writes group_status;
        // (3) layout matches kernel.
        let ret = unsafe {
            libc::ioctl(
                group.as_raw_fd(),
                ioctls::VFIO_GROUP_GET_STATUS as _,
                &raw mut group_status,
            )
        };

        if ret < 0 || (group_status.flags & ioctls::VFIO_GROUP_FLAGS_VIABLE) == 0 {
            return Err(EduError::unsupported(
                "VFIO group not viable (all devices must be bound to vfio-pci)",
            ));
        }

        // SAFETY: VFIO_GROUP_SET_CONTAINER ioctl - attaches group to container.
        // Invariants: (1) group fd valid; (2) third arg points to the container fd.
        let ret = unsafe {
            libc::ioctl(
                group.as_raw_fd(),
                ioctls::VFIO_GROUP_SET_CONTAINER as _,
                std::ptr::from_ref(&container.as_raw_fd()),
            )
        };

        if ret < 0 {
            return Err(EduError::unsupported(format!(
                "Failed to set container: {}",
                std::io::Error::last_os_error()
            )));
        }

        // SAFETY: VFIO_SET_IOMMU ioctl - enables Type1v2 IOMMU in container.
        // Invariants: (1) container fd valid; (2) group attached; (3) third arg is IOMMU type.
        let ret = unsafe {
            libc::ioctl(
                container.as_raw_fd(),
                ioctls::VFIO_SET_IOMMU as _,
                ioctls::VFIO_TYPE1V2_IOMMU,
            )
        };

        if ret < 0 {
            return Err(EduError::unsupported(format!(
                "Failed to set IOMMU: {}",
                std::io::Error::last_os_error()
            )));
        }

        let pcie_address_cstr = std::ffi::CString::new(pcie_address)
            .map_err(|e| EduError::invalid_argument(format!("Invalid PCIe address: {e}")))?;

        // SAFETY: VFIO_GROUP_GET_DEVICE_FD ioctl - opens device fd by PCIe address.
        // Invariants: (1) group fd valid; (2) pcie_address_cstr null-terminated.
        let device_fd = unsafe {
            libc::ioctl(
                group.as_raw_fd(),
                ioctls::VFIO_GROUP_GET_DEVICE_FD as _,
                pcie_address_cstr.as_ptr(),
            )
        };

        if device_fd < 0 {
            return Err(EduError::unsupported(format!(
                "Failed to get device fd: {}",
                std::io::Error::last_os_error()
            )));
        }

        // SAFETY: device_fd is a fresh fd from the ioctl above; File takes ownership.
        let device = unsafe { File::from_raw_fd(device_fd) };

        let mut device_info = VfioDeviceInfo {
            argsz: std::mem::size_of::<VfioDeviceInfo>() as u32,
            ..Default::default()
        };

        // SAFETY: VFIO_DEVICE_GET_INFO ioctl - kernel fills device_info (regions, IRQs).
        // Invariants: (1) device fd valid; (2) _IOWR reads/writes device_info; (3) layout matches.
        let ret = unsafe {
            libc::ioctl(
                device.as_raw_fd(),
                ioctls::VFIO_DEVICE_GET_INFO as _,
                &raw mut device_info,
            )
        };

        if ret < 0 {
            return Err(EduError::unsupported(format!(
                "Failed to get device info: {}",
                std::io::Error::last_os_error()
            )));
        }

        tracing::info!(
            "VFIO device: {} regions, {} IRQs",
            device_info.num_regions,
            device_info.num_irqs
        );

        let control_regs = MappedRegion::map(&device, Bar::Control)?;

        tracing::info!("Initialized VFIO backend for {pcie_address} ({} interrupts)", config.irq_mode);

        Ok(Self {
            pcie_address: pcie_address.to_string(),
            container: Arc::new(container),
            group,
            device: Arc::new(device),
            control_regs,
            irq_mode: config.irq_mode,
            next_iova: Mutex::new(config.iova_base),
        })
    }

    /// PCIe address this backend was opened for
    pub fn pcie_address(&self) -> &str {
        &self.pcie_address
    }

    fn irq_index(&self) -> u32 {
        match self.irq_mode {
            IrqMode::Intx => ioctls::VFIO_PCI_INTX_IRQ_INDEX,
            IrqMode::Msi => ioctls::VFIO_PCI_MSI_IRQ_INDEX,
        }
    }
}

impl RegisterFile for VfioBackend {
    fn read32(&self, offset: usize) -> Result<u32> {
        self.control_regs.read32(offset)
    }

    fn write32(&self, offset: usize, value: u32) -> Result<()> {
        self.control_regs.write32(offset, value)
    }
}

impl EduBackend for VfioBackend {
    fn alloc_dma(&self, capacity: usize) -> Result<DmaBuffer> {
        let mut next_iova = self.next_iova.lock();
        let iova = *next_iova;
        let buffer = DmaBuffer::vfio(Arc::clone(&self.container), capacity, iova)?;
        *next_iova += (capacity.div_ceil(4096) * 4096) as u64;
        Ok(buffer)
    }

    fn interrupts(&self) -> Result<Arc<dyn InterruptSource>> {
        let index = self.irq_index();

        let mut irq_info = VfioIrqInfo {
            argsz: std::mem::size_of::<VfioIrqInfo>() as u32,
            index,
            ..Default::default()
        };

        // SAFETY: VFIO_DEVICE_GET_IRQ_INFO ioctl - kernel fills irq_info for `index`.
        // Invariants: (1) device fd valid; (2) argsz/index set; (3) layout matches kernel.
        let ret = unsafe {
            libc::ioctl(
                self.device.as_raw_fd(),
                ioctls::VFIO_DEVICE_GET_IRQ_INFO as _,
                &raw mut irq_info,
            )
        };

        if ret < 0 || irq_info.count == 0 {
            return Err(EduError::unsupported(format!(
                "Device has no {} interrupt",
                self.irq_mode
            )));
        }

        let event = eventfd(0, EventfdFlags::CLOEXEC)
            .map_err(|e| EduError::unsupported(format!("Cannot create eventfd: {e}")))?;

        let irq_set = VfioIrqSetFd {
            argsz: std::mem::size_of::<VfioIrqSetFd>() as u32,
            flags: ioctls::VFIO_IRQ_SET_DATA_EVENTFD | ioctls::VFIO_IRQ_SET_ACTION_TRIGGER,
            index,
            start: 0,
            count: 1,
            fd: event.as_raw_fd(),
        };

        // SAFETY: VFIO_DEVICE_SET_IRQS ioctl - registers the eventfd as the trigger.
        // Invariants: (1) device fd valid; (2) irq_set carries exactly one fd; (3) layout matches.
        let ret = unsafe {
            libc::ioctl(
                self.device.as_raw_fd(),
                ioctls::VFIO_DEVICE_SET_IRQS as _,
                &raw const irq_set,
            )
        };

        if ret < 0 {
            return Err(EduError::unsupported(format!(
                "Failed to enable {} interrupt: {}",
                self.irq_mode,
                std::io::Error::last_os_error()
            )));
        }

        tracing::info!("{} interrupt routed to eventfd", self.irq_mode);

        Ok(Arc::new(VfioInterrupts {
            device: Arc::clone(&self.device),
            event,
            index,
            mode: self.irq_mode,
            stopped: AtomicBool::new(false),
        }))
    }

    fn backend_type(&self) -> BackendType {
        BackendType::Vfio
    }
}

/// Eventfd-backed interrupt source
#[derive(Debug)]
struct VfioInterrupts {
    device: Arc<File>,
    event: OwnedFd,
    index: u32,
    mode: IrqMode,
    stopped: AtomicBool,
}

impl VfioInterrupts {
    fn set_irqs(&self, flags: u32, count: u32) -> Result<()> {
        let irq_set = VfioIrqSet {
            argsz: std::mem::size_of::<VfioIrqSet>() as u32,
            flags,
            index: self.index,
            start: 0,
            count,
        };

        // SAFETY: VFIO_DEVICE_SET_IRQS ioctl with DATA_NONE - no payload follows the header.
        // Invariants: (1) device fd valid; (2) argsz matches the header-only struct.
        let ret = unsafe {
            libc::ioctl(
                self.device.as_raw_fd(),
                ioctls::VFIO_DEVICE_SET_IRQS as _,
                &raw const irq_set,
            )
        };

        if ret < 0 {
            return Err(std::io::Error::last_os_error().into());
        }
        Ok(())
    }
}

impl InterruptSource for VfioInterrupts {
    fn wait(&self) -> Result<bool> {
        let mut count = [0u8; 8];
        loop {
            match rustix::io::read(self.event.as_fd(), &mut count) {
                Ok(_) => return Ok(!self.stopped.load(Ordering::SeqCst)),
                Err(rustix::io::Errno::INTR) => {}
                Err(e) => return Err(std::io::Error::from(e).into()),
            }
        }
    }

    fn unmask(&self) -> Result<()> {
        match self.mode {
            IrqMode::Intx => self.set_irqs(
                ioctls::VFIO_IRQ_SET_DATA_NONE | ioctls::VFIO_IRQ_SET_ACTION_UNMASK,
                1,
            ),
            IrqMode::Msi => Ok(()),
        }
    }

    fn shutdown(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        if let Err(e) = rustix::io::write(self.event.as_fd(), &1u64.to_ne_bytes()) {
            tracing::warn!("Failed to wake interrupt waiter: {e}");
        }
    }
}

impl Drop for VfioInterrupts {
    fn drop(&mut self) {
        // count = 0 with DATA_NONE | ACTION_TRIGGER tears the trigger down.
        if let Err(e) = self.set_irqs(
            ioctls::VFIO_IRQ_SET_DATA_NONE | ioctls::VFIO_IRQ_SET_ACTION_TRIGGER,
            0,
        ) {
            tracing::warn!("Failed to disable {} interrupt: {e}", self.mode);
        }
    }
}


// ── VFIO device binding helpers ───────────────────────────────────────────────

/// Bind an edu device to `vfio-pci`, unbinding any existing driver.
///
/// Requires root or CAP_SYS_ADMIN.
///
/// # Errors
///
/// Returns an error if any sysfs write fails (usually permission denied).
pub fn bind_to_vfio(pcie_address: &str) -> Result<()> {
    use edu_chip::pcie::{device_id, QEMU_VENDOR_ID};
    use std::path::Path;

    tracing::info!("Binding {} to vfio-pci", pcie_address);

    let driver_unbind = format!("/sys/bus/pci/devices/{pcie_address}/driver/unbind");
    if Path::new(&driver_unbind).exists() {
        std::fs::write(&driver_unbind, pcie_address).map_err(|e| {
            EduError::unsupported(format!("Cannot unbind {pcie_address}: {e}"))
        })?;
        tracing::info!("Unbound from existing driver");
    }

    let new_id = "/sys/bus/pci/drivers/vfio-pci/new_id";
    if Path::new(new_id).exists() {
        // EEXIST when the id is already registered
        if let Err(e) = std::fs::write(new_id, format!("{QEMU_VENDOR_ID:04x} {:04x}", device_id::EDU))
        {
            tracing::debug!("vfio-pci/new_id: {e}");
        }
    }

    let bind_path = "/sys/bus/pci/drivers/vfio-pci/bind";
    if let Err(e) = std::fs::write(bind_path, pcie_address) {
        // new_id above may already have bound it
        if !Path::new(&format!("/sys/bus/pci/drivers/vfio-pci/{pcie_address}")).exists() {
            return Err(EduError::unsupported(format!("Cannot bind to vfio-pci: {e}")));
        }
    }

    tracing::info!("{pcie_address} bound to vfio-pci");
    Ok(())
}

/// Unbind from `vfio-pci`.
///
/// # Errors
///
/// Returns an error if the sysfs write fails.
pub fn unbind_from_vfio(pcie_address: &str) -> Result<()> {
    let unbind = "/sys/bus/pci/drivers/vfio-pci/unbind";
    std::fs::write(unbind, pcie_address)
        .map_err(|e| EduError::unsupported(format!("Cannot unbind from vfio-pci: {e}")))?;
    tracing::info!("{pcie_address} unbound from vfio-pci");
    Ok(())
}

/// Find the IOMMU group number for a PCIe device.
///
/// Reads `/sys/bus/pci/devices/{addr}/iommu_group` symlink.
///
/// # Errors
///
/// Returns `Unsupported` if the sysfs symlink cannot be read (no IOMMU).
pub fn iommu_group(pcie_address: &str) -> Result<u32> {
    let link = format!("/sys/bus/pci/devices/{pcie_address}/iommu_group");
    let target = std::fs::read_link(&link).map_err(|e| {
        EduError::unsupported(format!(
            "Cannot read iommu_group for {pcie_address}: {e}. Is IOMMU enabled?"
        ))
    })?;

    let group = target
        .file_name()
        .and_then(|n| n.to_str())
        .and_then(|s| s.parse::<u32>().ok())
        .ok_or_else(|| EduError::unsupported(format!("Cannot parse IOMMU group from {target:?}")))?;

    tracing::debug!("{pcie_address} → IOMMU group {group}");
    Ok(group)
}
