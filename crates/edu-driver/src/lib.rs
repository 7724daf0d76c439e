//! Userspace driver for the edu compute+DMA PCI device.
//!
//! The edu device (QEMU's teaching device, PCI `1234:11e8`) exposes a small
//! register file: identification, a liveness inverter, a factorial unit, an
//! interrupt status/raise/ack triple, and a DMA engine that moves up to 4 KiB
//! between host memory and a device-side window. This crate drives it from
//! userspace with interrupt-synchronized blocking operations.
//!
//! # Layers
//!
//! ```text
//! Session ──▶ CommandEngine ──▶ RegisterFile (VFIO BAR0 / simulated)
//!                 │    ▲
//!                 ▼    │ wake
//!           CompletionChannel ◀── dispatcher thread ◀── InterruptSource
//! ```
//!
//! Backends:
//!
//! ```text
//!   VfioBackend   BAR0 mmap, IOMMU-mapped DMA, eventfd interrupts
//!   SimulatedEdu  in-process device model (CI, development)
//! ```
//!
//! # Quick start
//!
//! ```no_run
//! use edu_driver::{select_backend, BackendSelection, EduConfig, EduDevice};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = EduConfig::from_env()?;
//! let backend = select_backend(BackendSelection::Auto, "0000:00:04.0", &config)?;
//! let device = EduDevice::attach(backend, &config)?;
//! let session = device.open();
//!
//! println!("{}: 10! = {}", device.identity(), session.factorial(10)?);
//!
//! let view = session.map_buffer(0, 4096)?;
//! view.write(0, b"hello")?;
//! session.dma_to_device(5)?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::doc_markdown)]

mod backend;
pub mod backends;
mod completion;
mod config;
mod dma;
mod error;
pub mod mmio;
mod protocol;
mod request;
mod session;
pub mod vfio;

/// Hardware constants (re-exported from edu-chip).
pub mod chip {
    pub use edu_chip::ident::{DeviceIdentity, EDU_1_0};
    pub use edu_chip::ioctl;
    pub use edu_chip::pcie::{device_id, is_edu, lspci_filter, QEMU_VENDOR_ID};
    pub use edu_chip::regs;
}

pub use backend::{select_backend, BackendSelection, BackendType, EduBackend, InterruptSource};
pub use backends::SimulatedEdu;
pub use completion::{ArmedWait, CancelToken, CompletionChannel, FlightPermit};
pub use config::{EduConfig, IrqMode, SimConfig};
pub use dma::{expose, DmaBuffer, MappedView, ReleaseHook};
pub use error::{EduError, Result};
pub use mmio::{MappedRegion, RegisterFile};
pub use protocol::{CommandEngine, Direction};
pub use request::{Reply, Request};
pub use session::{EduDevice, Session};
pub use vfio::VfioBackend;

/// Commonly used types.
pub mod prelude {
    pub use crate::{
        select_backend, BackendSelection, CancelToken, EduConfig, EduDevice, EduError,
        MappedView, Result, Session, SimulatedEdu,
    };
}
