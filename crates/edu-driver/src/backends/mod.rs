//! edu backend implementations
//!
//! Two backends available:
//! - **VFIO** ([`crate::vfio::VfioBackend`]): BAR mmap, IOMMU-mapped DMA and
//!   eventfd interrupts for a device bound to `vfio-pci`
//! - **Simulated**: in-process device model for CI and development

pub mod simulated;

pub use simulated::SimulatedEdu;
