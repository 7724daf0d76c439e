//! Protocol tests against the simulated device
//!
//! Exercises every client operation end to end: register ordering, blocking
//! completion, cancellation, DMA boundaries and fault handling.

use edu_driver::chip::regs::{
    self, dma_cmd, status, DMA_BUF_DEVICE_OFFSET, DMA_CMD, DMA_DST, DMA_SRC, DMA_XFER, FACTORIAL,
    IRQ_ACK, IRQ_STATUS, STATUS,
};
use edu_driver::chip::ioctl;
use edu_driver::{
    BackendType, DmaBuffer, EduBackend, EduConfig, EduDevice, EduError, InterruptSource,
    RegisterFile, Result, SimConfig, SimulatedEdu,
};
use parking_lot::Mutex;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Access {
    Read(usize),
    Write(usize, u32),
}

/// Simulated device that records every register access in order
#[derive(Debug)]
struct Recording {
    sim: Arc<SimulatedEdu>,
    log: Mutex<Vec<Access>>,
}

impl Recording {
    fn new(sim: Arc<SimulatedEdu>) -> Self {
        Self {
            sim,
            log: Mutex::new(Vec::new()),
        }
    }

    /// Accesses made by client operations (interrupt servicing filtered out).
    fn protocol_log(&self) -> Vec<Access> {
        self.log
            .lock()
            .iter()
            .copied()
            .filter(|a| !matches!(a, Access::Read(IRQ_STATUS) | Access::Write(IRQ_ACK, _)))
            .collect()
    }

    fn clear(&self) {
        self.log.lock().clear();
    }
}

impl RegisterFile for Recording {
    fn read32(&self, offset: usize) -> Result<u32> {
        self.log.lock().push(Access::Read(offset));
        self.sim.read32(offset)
    }

    fn write32(&self, offset: usize, value: u32) -> Result<()> {
        self.log.lock().push(Access::Write(offset, value));
        self.sim.write32(offset, value)
    }
}

impl EduBackend for Recording {
    fn alloc_dma(&self, capacity: usize) -> Result<DmaBuffer> {
        self.sim.alloc_dma(capacity)
    }

    fn interrupts(&self) -> Result<Arc<dyn InterruptSource>> {
        self.sim.interrupts()
    }

    fn backend_type(&self) -> BackendType {
        self.sim.backend_type()
    }
}

fn sim_with(config: SimConfig, dma_bits: u8) -> Arc<SimulatedEdu> {
    Arc::new(SimulatedEdu::new(config, dma_bits))
}

fn attach_recording(sim: SimConfig) -> (Arc<Recording>, EduDevice) {
    let config = EduConfig::default();
    let recording = Arc::new(Recording::new(sim_with(sim, config.dma_bits)));
    let device = EduDevice::attach(Arc::clone(&recording) as Arc<dyn EduBackend>, &config)
        .expect("attach to simulated device");
    recording.clear();
    (recording, device)
}

fn attach_default() -> (Arc<SimulatedEdu>, EduDevice) {
    let config = EduConfig::default();
    let sim = sim_with(SimConfig::default(), config.dma_bits);
    let device = EduDevice::attach(Arc::clone(&sim) as Arc<dyn EduBackend>, &config)
        .expect("attach to simulated device");
    (sim, device)
}

fn slow_factorial() -> SimConfig {
    SimConfig {
        factorial_latency: Duration::from_millis(500),
        ..SimConfig::default()
    }
}

#[test]
fn identify_is_idempotent() {
    let (_sim, device) = attach_default();
    let session = device.open();
    assert_eq!(session.identify().unwrap(), 0x0100_00ED);
    assert_eq!(session.identify().unwrap(), 0x0100_00ED);
    assert_eq!(device.identity().to_string(), "edu 1.0");
    assert_eq!(device.backend_type(), BackendType::Simulated);
}

#[test]
fn liveness_returns_inverse() {
    let (_sim, device) = attach_default();
    let session = device.open();
    for value in [0, 1, 0xDEAD_BEEF, u32::MAX] {
        assert_eq!(session.liveness(value).unwrap(), !value);
    }
}

#[test]
fn factorial_values() {
    let (_sim, device) = attach_default();
    let session = device.open();
    assert_eq!(session.factorial(0).unwrap(), 1);
    assert_eq!(session.factorial(1).unwrap(), 1);
    assert_eq!(session.factorial(5).unwrap(), 120);
    assert_eq!(session.factorial(12).unwrap(), 479_001_600);
    // 13! wraps at 32 bits
    assert_eq!(session.factorial(13).unwrap(), 1_932_053_504);
}

#[test]
fn factorial_register_order() {
    let (recording, device) = attach_recording(SimConfig::default());
    let session = device.open();
    assert_eq!(session.factorial(5).unwrap(), 120);

    let log = recording.protocol_log();
    assert_eq!(log[0], Access::Write(STATUS, status::RAISE_IRQ_ARM));
    assert_eq!(log[1], Access::Write(FACTORIAL, 5));
    assert_eq!(*log.last().unwrap(), Access::Read(FACTORIAL));
    assert!(log[2..log.len() - 1]
        .iter()
        .all(|a| *a == Access::Read(STATUS)));
}

#[test]
fn dma_register_order() {
    let (recording, device) = attach_recording(SimConfig::default());
    let session = device.open();
    let bus = u32::try_from(device.dma_bus_address()).unwrap();

    session.dma_to_device(64).unwrap();
    let log = recording.protocol_log();
    assert_eq!(
        log[..4],
        [
            Access::Write(DMA_SRC, bus),
            Access::Write(DMA_DST, DMA_BUF_DEVICE_OFFSET),
            Access::Write(DMA_XFER, 64),
            Access::Write(DMA_CMD, 0x5),
        ]
    );
    assert!(log[4..].iter().all(|a| *a == Access::Read(DMA_CMD)));

    recording.clear();
    session.dma_from_device(64).unwrap();
    let log = recording.protocol_log();
    assert_eq!(
        log[..4],
        [
            Access::Write(DMA_SRC, DMA_BUF_DEVICE_OFFSET),
            Access::Write(DMA_DST, bus),
            Access::Write(DMA_XFER, 64),
            Access::Write(
                DMA_CMD,
                dma_cmd::START_XFER | dma_cmd::DEVICE_TO_RAM | dma_cmd::RAISE_IRQ
            ),
        ]
    );
}

#[test]
fn dma_length_boundaries() {
    let (recording, device) = attach_recording(SimConfig::default());
    let session = device.open();

    assert!(matches!(
        session.dma_to_device(0),
        Err(EduError::InvalidArgument { .. })
    ));
    assert!(matches!(
        session.dma_from_device(4097),
        Err(EduError::InvalidArgument { .. })
    ));
    // Rejected before any register is touched
    assert!(recording.protocol_log().is_empty());

    session.dma_to_device(4096).unwrap();
    session.dma_from_device(1).unwrap();
}

#[test]
fn dma_round_trip() {
    let (sim, device) = attach_default();
    let session = device.open();
    let view = session.map_buffer(0, 4096).unwrap();

    let pattern: Vec<u8> = (0..4096u32).map(|i| (i * 7 % 251) as u8).collect();
    view.write(0, &pattern).unwrap();
    session.dma_to_device(4096).unwrap();
    assert_eq!(sim.device_window(), pattern);

    view.fill(0);
    session.dma_from_device(4096).unwrap();
    assert_eq!(view.to_vec(), pattern);
}

#[test]
fn dma_completion_interrupt_captured() {
    let (_sim, device) = attach_default();
    let session = device.open();
    let armed = session.arm_event_wait().unwrap();
    session.dma_to_device(16).unwrap();
    assert_eq!(armed.wait().unwrap(), regs::irq::DMA);
}

#[test]
fn cancelled_factorial_never_reads_result() {
    let (recording, device) = attach_recording(slow_factorial());
    let session = device.open();
    let canceller = session.canceller();

    let worker = thread::spawn(move || {
        let result = session.factorial(6);
        (session, result)
    });
    thread::sleep(Duration::from_millis(50));
    canceller.cancel();
    let (session, result) = worker.join().unwrap();

    assert!(matches!(result, Err(EduError::Cancelled)));
    assert_eq!(EduError::Cancelled.errno(), 512);
    assert!(!recording.protocol_log().contains(&Access::Read(FACTORIAL)));

    // The next factorial waits out the abandoned one before programming the unit.
    assert_eq!(session.factorial(5).unwrap(), 120);
    let log = recording.protocol_log();
    let first_write = log
        .iter()
        .position(|a| matches!(a, Access::Write(FACTORIAL, 5)))
        .unwrap();
    assert!(log[..first_write].contains(&Access::Read(STATUS)));
}

#[test]
fn cancel_releases_session_queued_behind_another() {
    let (recording, device) = attach_recording(SimConfig {
        factorial_latency: Duration::from_millis(1500),
        ..SimConfig::default()
    });
    let holder = device.open();
    let running = thread::spawn(move || holder.factorial(5));
    thread::sleep(Duration::from_millis(50));

    let queued = device.open();
    let canceller = queued.canceller();
    let waiter = thread::spawn(move || {
        let started = Instant::now();
        let result = queued.factorial(7);
        (result, started.elapsed())
    });
    thread::sleep(Duration::from_millis(50));
    canceller.cancel();

    let (result, elapsed) = waiter.join().unwrap();
    assert!(matches!(result, Err(EduError::Cancelled)));
    assert!(elapsed < Duration::from_millis(700), "queued caller held for {elapsed:?}");

    assert_eq!(running.join().unwrap().unwrap(), 120);
    // The cancelled caller never programmed the unit.
    assert!(!recording
        .protocol_log()
        .contains(&Access::Write(FACTORIAL, 7)));
}

#[test]
fn pending_cancel_issues_no_registers() {
    let (recording, device) = attach_recording(SimConfig::default());
    let session = device.open();
    session.canceller().cancel();

    assert!(matches!(session.dma_to_device(64), Err(EduError::Cancelled)));
    assert!(recording.protocol_log().is_empty());
    session.dma_to_device(64).unwrap();
}

#[test]
fn cancelled_dma_is_settled_before_next_transfer() {
    let (recording, device) = attach_recording(SimConfig {
        dma_latency: Duration::from_millis(400),
        ..SimConfig::default()
    });
    let session = device.open();
    let view = session.map_buffer(0, 256).unwrap();
    let first: Vec<u8> = (0..=255u8).collect();
    let second = vec![0xA5u8; 256];

    view.write(0, &first).unwrap();
    session.dma_to_device(256).unwrap();
    view.write(0, &second).unwrap();

    let canceller = session.canceller();
    let worker = thread::spawn(move || {
        let result = session.dma_from_device(16);
        (session, result)
    });
    thread::sleep(Duration::from_millis(50));
    canceller.cancel();
    let (session, result) = worker.join().unwrap();
    assert!(matches!(result, Err(EduError::Cancelled)));
    recording.clear();

    // The abandoned 16-byte read-back lands first, then the whole buffer goes out.
    session.dma_to_device(256).unwrap();
    let mut expected = first[..16].to_vec();
    expected.extend_from_slice(&second[16..]);
    assert_eq!(view.to_vec(), expected);
    assert_eq!(recording.sim.device_window()[..256], expected[..]);

    let log = recording.protocol_log();
    let src = log
        .iter()
        .position(|a| matches!(a, Access::Write(DMA_SRC, _)))
        .unwrap();
    assert!(log[..src].contains(&Access::Read(DMA_CMD)));
}

#[test]
fn concurrent_factorials_do_not_interleave() {
    let (recording, device) = attach_recording(SimConfig::default());
    let device = Arc::new(device);

    let workers: Vec<_> = [(5u32, 120u32), (7, 5040)]
        .into_iter()
        .map(|(n, expected)| {
            let device = Arc::clone(&device);
            thread::spawn(move || {
                let session = device.open();
                for _ in 0..20 {
                    assert_eq!(session.factorial(n).unwrap(), expected);
                }
            })
        })
        .collect();
    for w in workers {
        w.join().unwrap();
    }

    // Each FACTORIAL write is followed by its own result read before the next write.
    let log = recording.protocol_log();
    let mut pending = false;
    for access in log {
        match access {
            Access::Write(FACTORIAL, _) => {
                assert!(!pending, "factorial sequences interleaved");
                pending = true;
            }
            Access::Read(FACTORIAL) => pending = false,
            _ => {}
        }
    }
}

#[test]
fn raise_irq_wakes_armed_waiter() {
    let (sim, device) = attach_default();
    let session = device.open();

    let armed = session.arm_event_wait().unwrap();
    session.raise_irq(0x8000).unwrap();
    assert_eq!(armed.wait().unwrap(), 0x8000);

    // Acknowledged by the interrupt path
    thread::sleep(Duration::from_millis(20));
    assert_eq!(sim.read32(IRQ_STATUS).unwrap(), 0);
}

#[test]
fn wait_for_any_event_from_other_session() {
    let (_sim, device) = attach_default();
    let device = Arc::new(device);
    let waiter = {
        let device = Arc::clone(&device);
        thread::spawn(move || device.open().wait_for_any_event())
    };
    thread::sleep(Duration::from_millis(50));
    device.open().raise_irq(0x42).unwrap();
    assert_eq!(waiter.join().unwrap().unwrap(), 0x42);
}

#[test]
fn cancel_interrupts_event_wait() {
    let (_sim, device) = attach_default();
    let session = device.open();
    let canceller = session.canceller();
    let waiter = thread::spawn(move || session.wait_for_any_event());
    thread::sleep(Duration::from_millis(30));
    canceller.cancel();
    assert!(matches!(waiter.join().unwrap(), Err(EduError::Cancelled)));
}

#[test]
fn cancel_is_per_session() {
    let (_sim, device) = attach_default();
    let a = device.open();
    let b = device.open();
    a.canceller().cancel();
    assert_eq!(b.factorial(4).unwrap(), 24);
    assert!(matches!(a.wait_for_any_event(), Err(EduError::Cancelled)));
}

#[test]
fn buffer_above_32_bits_is_not_programmable() {
    let config = EduConfig {
        dma_bits: 40,
        ..EduConfig::default()
    };
    let sim = sim_with(
        SimConfig {
            bus_base: 0x1_0000_0000,
            ..SimConfig::default()
        },
        config.dma_bits,
    );
    let device = EduDevice::attach(sim as Arc<dyn EduBackend>, &config).unwrap();
    let session = device.open();

    let err = session.dma_to_device(16).unwrap_err();
    assert!(matches!(
        err,
        EduError::AddressNotSupported {
            bus_address: 0x1_0000_0000,
            bits: 32
        }
    ));
    assert_eq!(err.errno(), libc::EOPNOTSUPP);
    // Non-DMA operations still work
    assert_eq!(session.factorial(3).unwrap(), 6);
}

#[test]
fn attach_rejects_buffer_beyond_device_mask() {
    let config = EduConfig::default();
    let sim = sim_with(
        SimConfig {
            bus_base: 0x1000_0000,
            ..SimConfig::default()
        },
        config.dma_bits,
    );
    let err = EduDevice::attach(sim as Arc<dyn EduBackend>, &config).unwrap_err();
    assert!(matches!(err, EduError::AddressNotSupported { bits: 28, .. }));
}

#[test]
fn attach_reports_out_of_memory() {
    let config = EduConfig::default();
    let sim = sim_with(
        SimConfig {
            memory_limit: Some(1024),
            ..SimConfig::default()
        },
        config.dma_bits,
    );
    let err = EduDevice::attach(sim as Arc<dyn EduBackend>, &config).unwrap_err();
    assert!(matches!(err, EduError::OutOfMemory { requested: 4096 }));
    assert_eq!(err.errno(), libc::ENOMEM);
}

#[test]
fn bus_fault_makes_device_unusable() {
    let (sim, device) = attach_default();
    let session = device.open();
    assert_eq!(session.liveness(1).unwrap(), !1);

    sim.inject_bus_fault();
    assert!(matches!(session.identify(), Err(EduError::BusFault { .. })));
    assert!(device.is_faulted());
    assert!(matches!(session.liveness(1), Err(EduError::BusFault { .. })));
    assert!(matches!(session.factorial(3), Err(EduError::BusFault { .. })));
    assert!(matches!(
        session.dma_to_device(1),
        Err(EduError::BusFault { .. })
    ));
}

#[test]
fn bus_fault_releases_blocked_waiter() {
    let (sim, device) = attach_default();
    let session = device.open();
    let worker = thread::spawn(move || session.wait_for_any_event());
    thread::sleep(Duration::from_millis(30));
    sim.inject_bus_fault();
    assert!(matches!(
        worker.join().unwrap(),
        Err(EduError::BusFault { .. })
    ));
}

#[test]
fn ioctl_dispatch() {
    let (_sim, device) = attach_default();
    let session = device.open();

    let mut arg = 0;
    session.ioctl(ioctl::EDU_IOCTL_IDENT, &mut arg).unwrap();
    assert_eq!(arg, 0x0100_00ED);

    let mut arg = 0x0F0F_0F0F;
    session.ioctl(ioctl::EDU_IOCTL_LIVENESS, &mut arg).unwrap();
    assert_eq!(arg, 0xF0F0_F0F0);

    let mut arg = 10;
    session.ioctl(ioctl::EDU_IOCTL_FACTORIAL, &mut arg).unwrap();
    assert_eq!(arg, 3_628_800);

    let mut arg = 128;
    session.ioctl(ioctl::EDU_IOCTL_DMA_TO_DEVICE, &mut arg).unwrap();
    assert_eq!(arg, 128);

    let mut arg = 0;
    let err = session.ioctl(ioctl::EDU_IOCTL_DMA_FROM_DEVICE, &mut arg).unwrap_err();
    assert_eq!(err.errno(), libc::EINVAL);

    let mut arg = 77;
    let err = session.ioctl(0xDEAD, &mut arg).unwrap_err();
    assert!(matches!(err, EduError::UnknownCommand { cmd: 0xDEAD }));
    assert_eq!(arg, 77);
}

#[test]
fn map_buffer_rules() {
    let (_sim, device) = attach_default();
    let a = device.open();
    let b = device.open();

    assert!(matches!(
        a.map_buffer(4096, 16),
        Err(EduError::InvalidArgument { .. })
    ));
    assert!(matches!(
        a.map_buffer(0, 4097),
        Err(EduError::InvalidArgument { .. })
    ));
    assert!(a.map_buffer(0, 0).unwrap().is_empty());

    // Every session maps the same staging area
    let va = a.map_buffer(0, 4096).unwrap();
    let vb = b.map_buffer(0, 64).unwrap();
    va.write(0, b"edu").unwrap();
    let mut out = [0u8; 3];
    vb.read(0, &mut out).unwrap();
    assert_eq!(&out, b"edu");
    assert_eq!(va.bus_address(), device.dma_bus_address());
}

#[test]
fn detach_stops_sessions_but_not_views() {
    let (sim, device) = attach_default();
    let session = device.open();
    let view = session.map_buffer(0, 16).unwrap();
    view.write(0, b"still here").unwrap();

    device.detach();
    assert!(session.identify().is_err());
    assert!(session.wait_for_any_event().is_err());

    let mut out = [0u8; 10];
    view.read(0, &mut out).unwrap();
    assert_eq!(&out, b"still here");
    assert_eq!(sim.allocated(), 4096);
    drop(session);
    drop(view);
    assert_eq!(sim.allocated(), 0);
}

#[test]
fn reattach_after_detach() {
    let config = EduConfig::default();
    let sim = sim_with(SimConfig::default(), config.dma_bits);
    EduDevice::attach(Arc::clone(&sim) as Arc<dyn EduBackend>, &config)
        .unwrap()
        .detach();
    let device = EduDevice::attach(sim as Arc<dyn EduBackend>, &config).unwrap();
    assert_eq!(device.open().factorial(4).unwrap(), 24);
}
