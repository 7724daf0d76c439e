//! Attachment and simulator configuration
//!
//! Defaults describe a stock edu device behind VFIO. Deployments override
//! individual fields through the environment (`EDU_DMA_BITS`, `EDU_DMA_CAPACITY`,
//! `EDU_MSI`, `EDU_IOVA_BASE`) or by building the struct directly.

use crate::error::{EduError, Result};
use edu_chip::regs::{DEFAULT_DMA_BITS, DMA_BUF_SIZE};
use std::time::Duration;

/// How the device signals interrupts to the host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IrqMode {
    /// Legacy level-triggered INTx, re-armed by an unmask after each delivery
    #[default]
    Intx,
    /// Message-signalled interrupt
    Msi,
}

impl std::fmt::Display for IrqMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Intx => write!(f, "INTx"),
            Self::Msi => write!(f, "MSI"),
        }
    }
}

/// Attachment configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EduConfig {
    /// Addressable width of the device's DMA engine
    pub dma_bits: u8,

    /// Capacity of the shared DMA buffer in bytes
    pub dma_capacity: usize,

    /// Interrupt delivery mode
    pub irq_mode: IrqMode,

    /// Bus address the VFIO backend maps the DMA buffer at
    pub iova_base: u64,
}

impl Default for EduConfig {
    fn default() -> Self {
        Self {
            dma_bits: DEFAULT_DMA_BITS,
            dma_capacity: DMA_BUF_SIZE,
            irq_mode: IrqMode::Intx,
            iova_base: 0x0010_0000,
        }
    }
}

fn parse_u64(name: &str, raw: &str) -> Result<u64> {
    let raw = raw.trim();
    let parsed = match raw.strip_prefix("0x").or_else(|| raw.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => raw.parse(),
    };
    parsed.map_err(|e| EduError::invalid_argument(format!("{name}={raw}: {e}")))
}

fn parse_flag(name: &str, raw: &str) -> Result<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        other => Err(EduError::invalid_argument(format!("{name}={other}: expected a boolean"))),
    }
}

impl EduConfig {
    /// Defaults overlaid with `EDU_*` environment variables.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` if a variable is malformed or out of range.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Defaults overlaid with values from `lookup`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` if a value is malformed or out of range.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(raw) = lookup("EDU_DMA_BITS") {
            let bits = parse_u64("EDU_DMA_BITS", &raw)?;
            config.dma_bits = u8::try_from(bits)
                .map_err(|_| EduError::invalid_argument(format!("EDU_DMA_BITS={bits} out of range")))?;
        }
        if let Some(raw) = lookup("EDU_DMA_CAPACITY") {
            let capacity = parse_u64("EDU_DMA_CAPACITY", &raw)?;
            config.dma_capacity = usize::try_from(capacity).map_err(|_| {
                EduError::invalid_argument(format!("EDU_DMA_CAPACITY={capacity} out of range"))
            })?;
        }
        if let Some(raw) = lookup("EDU_MSI") {
            if parse_flag("EDU_MSI", &raw)? {
                config.irq_mode = IrqMode::Msi;
            }
        }
        if let Some(raw) = lookup("EDU_IOVA_BASE") {
            config.iova_base = parse_u64("EDU_IOVA_BASE", &raw)?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Check every field is within what the device supports.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` naming the first offending field.
    pub fn validate(&self) -> Result<()> {
        if !(1..=64).contains(&self.dma_bits) {
            return Err(EduError::invalid_argument(format!(
                "dma_bits must be 1..=64, got {}",
                self.dma_bits
            )));
        }
        if !(1..=DMA_BUF_SIZE).contains(&self.dma_capacity) {
            return Err(EduError::invalid_argument(format!(
                "dma_capacity must be 1..={DMA_BUF_SIZE}, got {}",
                self.dma_capacity
            )));
        }
        if self.iova_base % 4096 != 0 {
            return Err(EduError::invalid_argument(format!(
                "iova_base {:#x} is not page aligned",
                self.iova_base
            )));
        }
        Ok(())
    }
}

/// Behaviour knobs for the simulated device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimConfig {
    /// Time the factorial unit stays busy per computation
    pub factorial_latency: Duration,

    /// Time a DMA transfer takes to complete
    pub dma_latency: Duration,

    /// Total bytes of DMA memory the host will hand out (`None` = unlimited)
    pub memory_limit: Option<usize>,

    /// Bus address of the first allocation
    pub bus_base: u64,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            factorial_latency: Duration::from_millis(1),
            dma_latency: Duration::from_millis(1),
            memory_limit: None,
            bus_base: 0x0010_0000,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn defaults_match_device() {
        let config = EduConfig::default();
        assert_eq!(config.dma_bits, 28);
        assert_eq!(config.dma_capacity, 4096);
        assert_eq!(config.irq_mode, IrqMode::Intx);
        config.validate().unwrap();
    }

    #[test]
    fn env_overrides() {
        let config = EduConfig::from_lookup(lookup(&[
            ("EDU_DMA_BITS", "32"),
            ("EDU_DMA_CAPACITY", "1024"),
            ("EDU_MSI", "yes"),
            ("EDU_IOVA_BASE", "0x200000"),
        ]))
        .unwrap();
        assert_eq!(config.dma_bits, 32);
        assert_eq!(config.dma_capacity, 1024);
        assert_eq!(config.irq_mode, IrqMode::Msi);
        assert_eq!(config.iova_base, 0x20_0000);
    }

    #[test]
    fn rejects_out_of_range() {
        assert!(EduConfig::from_lookup(lookup(&[("EDU_DMA_BITS", "0")])).is_err());
        assert!(EduConfig::from_lookup(lookup(&[("EDU_DMA_BITS", "65")])).is_err());
        assert!(EduConfig::from_lookup(lookup(&[("EDU_DMA_BITS", "300")])).is_err());
        assert!(EduConfig::from_lookup(lookup(&[("EDU_DMA_CAPACITY", "8192")])).is_err());
        assert!(EduConfig::from_lookup(lookup(&[("EDU_MSI", "maybe")])).is_err());
        assert!(EduConfig::from_lookup(lookup(&[("EDU_IOVA_BASE", "0x1001")])).is_err());
    }
}
