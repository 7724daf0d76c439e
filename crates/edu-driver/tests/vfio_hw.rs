//! Hardware validation tests
//!
//! Run inside a QEMU guest started with `-device edu`, with the function
//! bound to vfio-pci. Set `EDU_PCI_ADDR` if it is not at `0000:00:04.0`.

use edu_driver::{select_backend, BackendSelection, BackendType, EduConfig, EduDevice, IrqMode};

fn pcie_address() -> String {
    std::env::var("EDU_PCI_ADDR").unwrap_or_else(|_| "0000:00:04.0".to_string())
}

fn attach(config: &EduConfig) -> EduDevice {
    let backend = select_backend(BackendSelection::Vfio, &pcie_address(), config)
        .expect("VFIO backend init");
    assert_eq!(backend.backend_type(), BackendType::Vfio);
    EduDevice::attach(backend, config).expect("attach")
}

#[test]
#[ignore] // Requires hardware
fn test_vfio_identity_and_liveness() {
    let device = attach(&EduConfig::default());
    let session = device.open();
    assert!(device.identity().is_genuine());
    assert_eq!(session.liveness(0x1234_5678).unwrap(), !0x1234_5678);
    println!("{} at {}", device.identity(), pcie_address());
}

#[test]
#[ignore] // Requires hardware
fn test_vfio_factorial_intx() {
    let device = attach(&EduConfig::default());
    assert_eq!(device.open().factorial(10).unwrap(), 3_628_800);
}

#[test]
#[ignore] // Requires hardware
fn test_vfio_factorial_msi() {
    let config = EduConfig {
        irq_mode: IrqMode::Msi,
        ..EduConfig::default()
    };
    let device = attach(&config);
    assert_eq!(device.open().factorial(6).unwrap(), 720);
}

#[test]
#[ignore] // Requires hardware
fn test_vfio_dma_round_trip() {
    let device = attach(&EduConfig::default());
    let session = device.open();
    let view = session.map_buffer(0, 4096).unwrap();

    let pattern: Vec<u8> = (0..4096u32).map(|i| (i % 256) as u8).collect();
    view.write(0, &pattern).unwrap();
    session.dma_to_device(4096).unwrap();
    view.fill(0);
    session.dma_from_device(4096).unwrap();
    assert_eq!(view.to_vec(), pattern);
}

#[test]
#[ignore] // Requires hardware
fn test_vfio_raise_irq() {
    let device = attach(&EduConfig::default());
    let session = device.open();
    let armed = session.arm_event_wait().unwrap();
    session.raise_irq(0x8000).unwrap();
    assert_eq!(armed.wait().unwrap(), 0x8000);
}
