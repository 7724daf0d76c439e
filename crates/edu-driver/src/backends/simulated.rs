// SPDX-License-Identifier: AGPL-3.0-only

//! Simulated edu device
//!
//! An in-process model of the edu PCI function, register-compatible with the
//! hardware. It lets the full protocol stack (completion channel, command
//! engine, sessions) run in CI and in development without a VFIO-bound device.
//!
//! ## Device model
//!
//! - `IDENT` reads `0x010000ed`; `LIVENESS` reads back the inverse of the last write.
//! - Writing `FACTORIAL` sets `COMPUTING`; a worker thread computes `n!` with
//!   32-bit wrapping after [`SimConfig::factorial_latency`], clears `COMPUTING`
//!   and raises interrupt bit `0x1` if `STATUS.0x80` is armed. Writes while
//!   computing are ignored.
//! - `IRQ_RAISE` ORs into `IRQ_STATUS`, `IRQ_ACK` clears bits. The line is
//!   level-triggered: it stays asserted while any status bit is set and
//!   re-fires on unmask.
//! - The DMA engine moves bytes between registered host buffers and a 4 KiB
//!   device window at `0x40000`. Host addresses are truncated to the
//!   configured DMA width. A transfer outside the window or into unmapped
//!   host memory faults the device, after which every register access fails.
//!
//! ## Timing
//!
//! ```text
//! write FACTORIAL ── latency ──▶ clear COMPUTING, IRQ 0x1
//! write DMA_CMD   ── latency ──▶ copy, clear START, IRQ 0x100
//! ```

use crate::backend::{BackendType, EduBackend, InterruptSource};
use crate::config::SimConfig;
use crate::dma::DmaBuffer;
use crate::error::{EduError, Result};
use crate::mmio::RegisterFile;
use edu_chip::bar::bar0;
use edu_chip::ident::EDU_1_0;
use edu_chip::regs::{
    dma_cmd, dma_mask, irq, status, DEFAULT_DMA_BITS, DMA_BUF_DEVICE_OFFSET, DMA_BUF_SIZE,
    DMA_CMD, DMA_DST, DMA_SRC, DMA_XFER, FACTORIAL, IDENT, IRQ_ACK, IRQ_RAISE, IRQ_STATUS,
    LIVENESS, STATUS,
};
use parking_lot::{Condvar, Mutex};
use std::collections::BTreeMap;
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Host memory the simulated device can reach, by bus address
#[derive(Debug, Clone, Copy)]
struct HostRegion {
    /// Host virtual address, stored as an integer so the state stays `Send`
    vaddr: usize,
    len: usize,
}

#[derive(Debug)]
struct DeviceState {
    liveness: u32,
    factorial: u32,
    status: u32,
    irq_status: u32,
    dma_src: u64,
    dma_dst: u64,
    dma_len: u64,
    dma_cmd: u32,
    window: Box<[u8]>,

    factorial_due: Option<Instant>,
    dma_due: Option<Instant>,

    /// Interrupt line: a notification is waiting to be consumed
    irq_pending: bool,
    /// Interrupt line: delivery disabled until unmasked
    irq_masked: bool,
    /// Interrupt line: consumer detached
    irq_closed: bool,

    regions: BTreeMap<u64, HostRegion>,
    next_bus: u64,
    allocated: usize,

    fault: Option<String>,
    shutdown: bool,
}

#[derive(Debug)]
struct SimCore {
    state: Mutex<DeviceState>,
    /// Wakes the device worker when work is scheduled
    worker: Condvar,
    /// Wakes the interrupt consumer
    line: Condvar,
    config: SimConfig,
    dma_mask: u64,
}

fn factorial(n: u32) -> u32 {
    (1..=n).fold(1u32, u32::wrapping_mul)
}

fn in_window(addr: u64, len: u64) -> bool {
    let start = u64::from(DMA_BUF_DEVICE_OFFSET);
    let end = start + DMA_BUF_SIZE as u64;
    addr >= start && addr.checked_add(len).is_some_and(|last| last <= end)
}

impl SimCore {
    /// Raise interrupt bits and assert the line.
    fn raise(&self, state: &mut DeviceState, bits: u32) {
        state.irq_status |= bits;
        self.assert_line(state);
    }

    fn assert_line(&self, state: &mut DeviceState) {
        if state.irq_status != 0 && !state.irq_masked {
            state.irq_pending = true;
            state.irq_masked = true;
            self.line.notify_all();
        }
    }

    fn fault(&self, state: &mut DeviceState, reason: String) {
        warn!("Simulated device fault: {reason}");
        state.fault = Some(reason);
        self.worker.notify_all();
        self.line.notify_all();
    }

    fn host_region(&self, state: &DeviceState, bus: u64, len: usize) -> Option<usize> {
        let (base, region) = state.regions.range(..=bus).next_back()?;
        let offset = usize::try_from(bus - base).ok()?;
        (offset.checked_add(len)? <= region.len).then_some(region.vaddr + offset)
    }

    fn finish_factorial(&self, state: &mut DeviceState) {
        state.factorial = factorial(state.factorial);
        state.status &= !status::COMPUTING;
        debug!("Simulated factorial done: {}", state.factorial);
        if state.status & status::RAISE_IRQ_ARM != 0 {
            self.raise(state, irq::FACTORIAL);
        }
    }

    #[allow(clippy::cast_possible_truncation)]
    fn finish_dma(&self, state: &mut DeviceState) {
        if state.dma_cmd & dma_cmd::START_XFER == 0 {
            return;
        }
        let len = state.dma_len as usize;
        let to_device = state.dma_cmd & dma_cmd::DEVICE_TO_RAM == 0;
        let (device_addr, host_bus) = if to_device {
            (state.dma_dst, state.dma_src & self.dma_mask)
        } else {
            (state.dma_src, state.dma_dst & self.dma_mask)
        };

        if !in_window(device_addr, state.dma_len) {
            self.fault(
                state,
                format!("DMA range {device_addr:#x}+{len:#x} outside device window"),
            );
            return;
        }
        let Some(host) = self.host_region(state, host_bus, len) else {
            self.fault(state, format!("DMA to unmapped bus address {host_bus:#x}+{len:#x}"));
            return;
        };

        let window_offset = (device_addr - u64::from(DMA_BUF_DEVICE_OFFSET)) as usize;
        let window = &mut state.window[window_offset..window_offset + len];
        // SAFETY: host_region() checked [host, host + len) lies inside a live
        // registered buffer; buffers unregister before their memory is freed and
        // both happen under the state lock this thread holds.
        unsafe {
            if to_device {
                std::ptr::copy_nonoverlapping(host as *const u8, window.as_mut_ptr(), len);
            } else {
                std::ptr::copy_nonoverlapping(window.as_ptr(), host as *mut u8, len);
            }
        }
        debug!(
            "Simulated DMA {} {len} bytes, host={host_bus:#x}",
            if to_device { "to device" } else { "from device" }
        );

        state.dma_cmd &= !dma_cmd::START_XFER;
        if state.dma_cmd & dma_cmd::RAISE_IRQ != 0 {
            self.raise(state, irq::DMA);
        }
    }

    fn run(&self) {
        let mut state = self.state.lock();
        loop {
            if state.shutdown || state.fault.is_some() {
                break;
            }

            let now = Instant::now();
            if state.factorial_due.is_some_and(|due| due <= now) {
                state.factorial_due = None;
                self.finish_factorial(&mut state);
            }
            if state.dma_due.is_some_and(|due| due <= now) {
                state.dma_due = None;
                self.finish_dma(&mut state);
            }

            match [state.factorial_due, state.dma_due].into_iter().flatten().min() {
                Some(due) => {
                    self.worker.wait_until(&mut state, due);
                }
                None => self.worker.wait(&mut state),
            }
        }
        debug!("Simulated device worker stopped");
    }

    fn check_access(state: &DeviceState, offset: usize) -> Result<()> {
        if let Some(reason) = &state.fault {
            return Err(EduError::bus_fault(format!("device faulted: {reason}")));
        }
        if offset % 4 != 0 || offset + 4 > bar0::SIZE as usize {
            return Err(EduError::bus_fault(format!(
                "register access at {offset:#x} outside BAR0"
            )));
        }
        Ok(())
    }
}

/// Software model of the edu device.
#[derive(Debug)]
pub struct SimulatedEdu {
    core: Arc<SimCore>,
    worker: Option<JoinHandle<()>>,
}

impl SimulatedEdu {
    /// Create a simulated device whose DMA engine addresses `dma_bits` bits.
    pub fn new(config: SimConfig, dma_bits: u8) -> Self {
        let core = Arc::new(SimCore {
            state: Mutex::new(DeviceState {
                liveness: 0,
                factorial: 0,
                status: 0,
                irq_status: 0,
                dma_src: 0,
                dma_dst: 0,
                dma_len: 0,
                dma_cmd: 0,
                window: vec![0u8; DMA_BUF_SIZE].into_boxed_slice(),
                factorial_due: None,
                dma_due: None,
                irq_pending: false,
                irq_masked: false,
                irq_closed: false,
                regions: BTreeMap::new(),
                next_bus: config.bus_base,
                allocated: 0,
                fault: None,
                shutdown: false,
            }),
            worker: Condvar::new(),
            line: Condvar::new(),
            dma_mask: dma_mask(dma_bits),
            config,
        });

        let worker = {
            let core = Arc::clone(&core);
            std::thread::Builder::new()
                .name("edu-sim".into())
                .spawn(move || core.run())
                .map_err(|e| warn!("Simulated device worker failed to start: {e}"))
                .ok()
        };

        info!("Simulated edu device created (dma_bits={dma_bits})");
        Self { core, worker }
    }

    /// Make the device stop responding, as if it fell off the bus.
    pub fn inject_bus_fault(&self) {
        let mut state = self.core.state.lock();
        self.core.fault(&mut state, "injected bus fault".into());
    }

    /// Copy of the device-side DMA window.
    pub fn device_window(&self) -> Vec<u8> {
        self.core.state.lock().window.to_vec()
    }

    /// Bytes of DMA memory currently handed out.
    pub fn allocated(&self) -> usize {
        self.core.state.lock().allocated
    }
}

impl Default for SimulatedEdu {
    fn default() -> Self {
        Self::new(SimConfig::default(), DEFAULT_DMA_BITS)
    }
}

impl RegisterFile for SimulatedEdu {
    fn read32(&self, offset: usize) -> Result<u32> {
        let state = self.core.state.lock();
        SimCore::check_access(&state, offset)?;
        #[allow(clippy::cast_possible_truncation)]
        let value = match offset {
            IDENT => EDU_1_0,
            LIVENESS => state.liveness,
            FACTORIAL => state.factorial,
            STATUS => state.status,
            IRQ_STATUS => state.irq_status,
            DMA_SRC => state.dma_src as u32,
            DMA_DST => state.dma_dst as u32,
            DMA_XFER => state.dma_len as u32,
            DMA_CMD => state.dma_cmd,
            _ => u32::MAX,
        };
        Ok(value)
    }

    fn write32(&self, offset: usize, value: u32) -> Result<()> {
        let mut state = self.core.state.lock();
        SimCore::check_access(&state, offset)?;
        let core = &self.core;
        let dma_idle = state.dma_cmd & dma_cmd::START_XFER == 0;

        match offset {
            LIVENESS => state.liveness = !value,
            FACTORIAL => {
                if state.status & status::COMPUTING == 0 {
                    state.factorial = value;
                    state.status |= status::COMPUTING;
                    state.factorial_due = Some(Instant::now() + core.config.factorial_latency);
                    core.worker.notify_all();
                }
            }
            STATUS => {
                if value & status::RAISE_IRQ_ARM != 0 {
                    state.status |= status::RAISE_IRQ_ARM;
                } else {
                    state.status &= !status::RAISE_IRQ_ARM;
                }
            }
            IRQ_RAISE => core.raise(&mut state, value),
            IRQ_ACK => state.irq_status &= !value,
            DMA_SRC if dma_idle => state.dma_src = u64::from(value),
            DMA_DST if dma_idle => state.dma_dst = u64::from(value),
            DMA_XFER if dma_idle => state.dma_len = u64::from(value),
            DMA_CMD if dma_idle => {
                state.dma_cmd = value;
                if value & dma_cmd::START_XFER != 0 {
                    state.dma_due = Some(Instant::now() + core.config.dma_latency);
                    core.worker.notify_all();
                }
            }
            _ => {}
        }
        Ok(())
    }
}

impl EduBackend for SimulatedEdu {
    fn alloc_dma(&self, capacity: usize) -> Result<DmaBuffer> {
        let mut state = self.core.state.lock();
        if let Some(limit) = self.core.config.memory_limit {
            if state.allocated.saturating_add(capacity) > limit {
                return Err(EduError::OutOfMemory {
                    requested: capacity,
                });
            }
        }

        let bus = state.next_bus;
        let weak: Weak<SimCore> = Arc::downgrade(&self.core);
        let buffer = DmaBuffer::host(
            capacity,
            bus,
            Some(Box::new(move |bus| {
                if let Some(core) = weak.upgrade() {
                    let mut state = core.state.lock();
                    if let Some(region) = state.regions.remove(&bus) {
                        state.allocated -= region.len;
                    }
                }
            })),
        )?;

        state.regions.insert(
            bus,
            HostRegion {
                vaddr: buffer.as_ptr() as usize,
                len: capacity,
            },
        );
        state.allocated += capacity;
        state.next_bus = bus + (capacity.div_ceil(4096) * 4096) as u64;
        debug!("Simulated DMA allocation: bus={bus:#x}, capacity={capacity}");
        Ok(buffer)
    }

    fn interrupts(&self) -> Result<Arc<dyn InterruptSource>> {
        self.core.state.lock().irq_closed = false;
        Ok(Arc::new(SimInterrupts {
            core: Arc::clone(&self.core),
        }))
    }

    fn backend_type(&self) -> BackendType {
        BackendType::Simulated
    }
}

impl Drop for SimulatedEdu {
    fn drop(&mut self) {
        {
            let mut state = self.core.state.lock();
            state.shutdown = true;
            self.core.worker.notify_all();
            self.core.line.notify_all();
        }
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

/// Interrupt line of the simulated device
#[derive(Debug)]
struct SimInterrupts {
    core: Arc<SimCore>,
}

impl InterruptSource for SimInterrupts {
    fn wait(&self) -> Result<bool> {
        let mut state = self.core.state.lock();
        loop {
            if state.shutdown || state.irq_closed {
                return Ok(false);
            }
            if let Some(reason) = &state.fault {
                return Err(EduError::bus_fault(format!("device faulted: {reason}")));
            }
            if state.irq_pending {
                state.irq_pending = false;
                return Ok(true);
            }
            self.core.line.wait(&mut state);
        }
    }

    fn unmask(&self) -> Result<()> {
        let mut state = self.core.state.lock();
        state.irq_masked = false;
        self.core.assert_line(&mut state);
        Ok(())
    }

    fn shutdown(&self) {
        let mut state = self.core.state.lock();
        state.irq_closed = true;
        self.core.line.notify_all();
    }
}
