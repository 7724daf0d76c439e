//! PCI BAR layout.
//!
//! ```text
//! BAR  Size    Type                  Purpose
//! ──── ─────── ───────────────────── ─────────────────────────────
//!  0   1 MB    32-bit non-prefetch   Register space (MMIO)
//! ```
//!
//! Only the first 0x100 bytes decode to registers; the rest of the window
//! reads as all-ones.

/// BAR0: control register space (1 MB, MMIO).
pub mod bar0 {
    /// Size in bytes.
    pub const SIZE: u64 = 1024 * 1024;
    /// BAR index for VFIO region queries.
    pub const VFIO_INDEX: u32 = 0;
    /// Whether the BAR is a 64-bit BAR.
    pub const IS_64BIT: bool = false;
    /// Whether the BAR is prefetchable.
    pub const IS_PREFETCHABLE: bool = false;
}

/// BAR index enumeration for VFIO region queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Bar {
    /// BAR0: control registers.
    Control = 0,
}

impl Bar {
    /// Size of this BAR in bytes.
    #[must_use]
    pub const fn size(&self) -> u64 {
        match self {
            Self::Control => bar0::SIZE,
        }
    }

    /// VFIO region index.
    #[must_use]
    pub const fn vfio_index(&self) -> u32 {
        *self as u32
    }
}
