//! Backend abstraction for edu devices
//!
//! A backend is everything the protocol layer needs from a platform: ordered
//! register access, one DMA-capable allocation, and a source of interrupt
//! notifications. The protocol itself never knows which backend it runs on.

use crate::config::EduConfig;
use crate::dma::DmaBuffer;
use crate::error::Result;
use crate::mmio::RegisterFile;
use std::fmt::Debug;
use std::sync::Arc;

/// Platform the edu device is reached through
pub trait EduBackend: RegisterFile + Debug {
    /// Allocate a coherent buffer of `capacity` bytes the device can address.
    ///
    /// # Errors
    ///
    /// Returns `OutOfMemory` if the platform cannot provide the memory, or an
    /// I/O error if mapping it for the device fails.
    fn alloc_dma(&self, capacity: usize) -> Result<DmaBuffer>;

    /// Interrupt notifications for this device.
    ///
    /// # Errors
    ///
    /// Returns an error if interrupt delivery cannot be set up.
    fn interrupts(&self) -> Result<Arc<dyn InterruptSource>>;

    /// Get backend type for debugging
    fn backend_type(&self) -> BackendType;
}

/// Notification side of the device's interrupt line
pub trait InterruptSource: Debug + Send + Sync {
    /// Block until the device signals an interrupt.
    ///
    /// Returns `Ok(false)` once [`shutdown`](Self::shutdown) has been called.
    ///
    /// # Errors
    ///
    /// Returns an error if the notification channel fails.
    fn wait(&self) -> Result<bool>;

    /// Re-enable delivery after an interrupt has been serviced.
    ///
    /// # Errors
    ///
    /// Returns an error if the line cannot be re-armed.
    fn unmask(&self) -> Result<()>;

    /// Stop delivery and release any thread blocked in [`wait`](Self::wait).
    fn shutdown(&self);
}

/// Backend type identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendType {
    /// VFIO driver (BAR mmap, IOMMU-mapped DMA, eventfd interrupts)
    Vfio,

    /// In-process model of the device, no hardware required
    Simulated,
}

impl std::fmt::Display for BackendType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Vfio => write!(f, "VFIO"),
            Self::Simulated => write!(f, "Simulated"),
        }
    }
}

/// Backend selection strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendSelection {
    /// VFIO if the device is bound to vfio-pci, otherwise the simulator
    Auto,

    /// Force VFIO driver
    Vfio,

    /// Force simulated device, for CI and development
    Simulated,
}

/// Select appropriate backend based on availability
///
/// # Errors
///
/// Returns error if the requested backend cannot be initialized for the device.
pub fn select_backend(
    selection: BackendSelection,
    pcie_address: &str,
    config: &EduConfig,
) -> Result<Arc<dyn EduBackend>> {
    use crate::backends::simulated::SimulatedEdu;
    use crate::config::SimConfig;
    use crate::vfio::VfioBackend;

    let simulated = || {
        let sim = SimConfig {
            bus_base: config.iova_base,
            ..SimConfig::default()
        };
        Arc::new(SimulatedEdu::new(sim, config.dma_bits)) as Arc<dyn EduBackend>
    };

    match selection {
        BackendSelection::Auto => match VfioBackend::init(pcie_address, config) {
            Ok(backend) => {
                tracing::info!("Using VFIO backend for {pcie_address}");
                Ok(Arc::new(backend))
            }
            Err(e) => {
                tracing::info!("VFIO unavailable for {pcie_address} ({e}), using simulated device");
                Ok(simulated())
            }
        },

        BackendSelection::Vfio => {
            VfioBackend::init(pcie_address, config).map(|b| Arc::new(b) as Arc<dyn EduBackend>)
        }

        BackendSelection::Simulated => {
            tracing::info!("Using simulated device");
            Ok(simulated())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_type_display() {
        assert_eq!(BackendType::Vfio.to_string(), "VFIO");
        assert_eq!(BackendType::Simulated.to_string(), "Simulated");
    }

    #[test]
    fn auto_falls_back_to_simulated() {
        // No such PCI function exists, so VFIO init fails.
        let backend =
            select_backend(BackendSelection::Auto, "ffff:ff:1f.7", &EduConfig::default()).unwrap();
        assert_eq!(backend.backend_type(), BackendType::Simulated);
    }

    #[test]
    fn forced_vfio_reports_failure() {
        assert!(
            select_backend(BackendSelection::Vfio, "ffff:ff:1f.7", &EduConfig::default()).is_err()
        );
    }
}
