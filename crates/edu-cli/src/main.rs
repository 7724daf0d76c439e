//! `edu`: command-line interface for the edu compute+DMA device.
//!
//! ```text
//! USAGE:
//!   edu [--sim] [--device <pcie-addr>] <command>
//!
//!   edu ident                      Identification register and decoded version
//!   edu liveness <value>           Liveness round trip (returns !value)
//!   edu factorial <n>              n! computed by the device
//!   edu raise-irq <value>          Raise interrupt bits
//!   edu wait-irq                   Block until the next interrupt
//!   edu irq-test <value>           Arm, raise, wait: interrupt path self-test
//!   edu dma-roundtrip [len]        Buffer → device → buffer with a test pattern
//!   edu bind-vfio <pcie-addr>      Bind device to vfio-pci (root)
//!   edu unbind-vfio <pcie-addr>    Unbind from vfio-pci (root)
//!   edu iommu-group <pcie-addr>    IOMMU group for VFIO setup
//! ```

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use edu_driver::{select_backend, BackendSelection, EduConfig, EduDevice, IrqMode, Session};
use tracing::debug;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "edu", about = "edu compute+DMA device CLI", version)]
struct Cli {
    /// Use the simulated device instead of VFIO hardware.
    #[arg(long, global = true)]
    sim: bool,

    /// PCIe address of the device (e.g. 0000:00:04.0).
    #[arg(long, global = true, default_value = "0000:00:04.0")]
    device: String,

    /// Use MSI instead of INTx.
    #[arg(long, global = true)]
    msi: bool,

    /// Addressable DMA width of the device (default from EDU_DMA_BITS or 28).
    #[arg(long, global = true)]
    dma_bits: Option<u8>,

    /// Log protocol steps (DMA addresses, factorial values, interrupt status).
    #[arg(long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// Read the identification register.
    Ident,
    /// Liveness check: the device returns the bitwise inverse.
    Liveness {
        /// Value to write (decimal or 0x-prefixed hex).
        #[arg(value_parser = parse_u32)]
        value: u32,
    },
    /// Compute n! on the device (32-bit wrapping).
    Factorial {
        /// Input value.
        n: u32,
    },
    /// Ask the device to raise interrupt bits.
    RaiseIrq {
        /// Interrupt bits (decimal or 0x-prefixed hex).
        #[arg(value_parser = parse_u32)]
        value: u32,
    },
    /// Block until the next interrupt and print its status value.
    WaitIrq,
    /// Arm a wait, raise an interrupt, and check it comes back.
    IrqTest {
        /// Interrupt bits (decimal or 0x-prefixed hex).
        #[arg(value_parser = parse_u32, default_value = "0x8000")]
        value: u32,
    },
    /// DMA a test pattern to the device and back, then compare.
    DmaRoundtrip {
        /// Transfer length in bytes.
        #[arg(default_value_t = 4096)]
        len: u32,
    },
    /// Bind a device to vfio-pci (requires root / CAP_SYS_ADMIN).
    BindVfio {
        /// PCIe address (e.g. 0000:00:04.0).
        pcie_addr: String,
    },
    /// Unbind a device from vfio-pci.
    UnbindVfio {
        /// PCIe address (e.g. 0000:00:04.0).
        pcie_addr: String,
    },
    /// Query the IOMMU group for a device.
    IommuGroup {
        /// PCIe address (e.g. 0000:00:04.0).
        pcie_addr: String,
    },
}

fn parse_u32(s: &str) -> Result<u32, std::num::ParseIntError> {
    match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => s.parse(),
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.debug { "warn,edu_driver=debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter.into()),
        )
        .init();

    match &cli.command {
        Cmd::BindVfio { pcie_addr } => return cmd_bind_vfio(pcie_addr),
        Cmd::UnbindVfio { pcie_addr } => return cmd_unbind_vfio(pcie_addr),
        Cmd::IommuGroup { pcie_addr } => return cmd_iommu_group(pcie_addr),
        _ => {}
    }

    let device = attach(&cli)?;
    let session = device.open();

    match cli.command {
        Cmd::Ident => cmd_ident(&device, &session)?,
        Cmd::Liveness { value } => {
            let result = session.liveness(value)?;
            println!("liveness({value:#010x}) = {result:#010x}");
        }
        Cmd::Factorial { n } => println!("{n}! = {}", session.factorial(n)?),
        Cmd::RaiseIrq { value } => {
            session.raise_irq(value)?;
            println!("Raised irq {value:#x}");
        }
        Cmd::WaitIrq => println!("irq_value = {:#x}", session.wait_for_any_event()?),
        Cmd::IrqTest { value } => cmd_irq_test(&session, value)?,
        Cmd::DmaRoundtrip { len } => cmd_dma_roundtrip(&session, len)?,
        Cmd::BindVfio { .. } | Cmd::UnbindVfio { .. } | Cmd::IommuGroup { .. } => {}
    }

    device.detach();
    Ok(())
}

fn attach(cli: &Cli) -> Result<EduDevice> {
    let mut config = EduConfig::from_env()?;
    if cli.msi {
        config.irq_mode = IrqMode::Msi;
    }
    if let Some(bits) = cli.dma_bits {
        config.dma_bits = bits;
    }

    let selection = if cli.sim {
        BackendSelection::Simulated
    } else {
        BackendSelection::Vfio
    };
    let backend = select_backend(selection, &cli.device, &config)
        .with_context(|| format!("Cannot open {} (try --sim)", cli.device))?;
    debug!("dma_bits={} irq_mode={}", config.dma_bits, config.irq_mode);
    Ok(EduDevice::attach(backend, &config)?)
}

fn cmd_ident(device: &EduDevice, session: &Session) -> Result<()> {
    let raw = session.identify()?;
    println!("Identification : {raw:#010x}");
    println!("Device         : {}", device.identity());
    println!("Backend        : {}", device.backend_type());
    println!("DMA bus addr   : {:#010x}", device.dma_bus_address());
    if !device.identity().is_genuine() {
        println!("Signature      : {:#04x} (unexpected)", device.identity().signature);
    }
    Ok(())
}

fn cmd_irq_test(session: &Session, value: u32) -> Result<()> {
    let armed = session.arm_event_wait()?;
    session.raise_irq(value)?;
    let got = armed.wait()?;
    println!("Raised {value:#x}, received {got:#x}");
    if got & value != value {
        bail!("interrupt status {got:#x} does not contain raised bits {value:#x}");
    }
    Ok(())
}

fn cmd_dma_roundtrip(session: &Session, len: u32) -> Result<()> {
    let view = session.map_buffer(0, len as usize)?;
    let pattern: Vec<u8> = (0..len).map(|i| (i.wrapping_mul(31) >> 2) as u8).collect();

    view.write(0, &pattern)?;
    session.dma_to_device(len)?;
    view.fill(0);
    session.dma_from_device(len)?;

    let back = view.to_vec();
    if let Some(first) = back.iter().zip(&pattern).position(|(a, b)| a != b) {
        bail!(
            "DMA mismatch at byte {first}: wrote {:#04x}, read {:#04x}",
            pattern[first],
            back[first]
        );
    }
    println!("DMA round trip of {len} bytes OK");
    Ok(())
}

fn cmd_bind_vfio(pcie_addr: &str) -> Result<()> {
    println!("Binding {pcie_addr} to vfio-pci ...");
    edu_driver::vfio::bind_to_vfio(pcie_addr)?;
    let group = edu_driver::vfio::iommu_group(pcie_addr)?;
    println!("Done. IOMMU group: {group}");
    println!("Grant access:  sudo chown $USER /dev/vfio/{group}");
    Ok(())
}

fn cmd_unbind_vfio(pcie_addr: &str) -> Result<()> {
    println!("Unbinding {pcie_addr} from vfio-pci ...");
    edu_driver::vfio::unbind_from_vfio(pcie_addr)?;
    println!("Done.");
    Ok(())
}

fn cmd_iommu_group(pcie_addr: &str) -> Result<()> {
    let group = edu_driver::vfio::iommu_group(pcie_addr)?;
    println!("IOMMU group for {pcie_addr}: {group}");
    println!("Device file: /dev/vfio/{group}");
    Ok(())
}
