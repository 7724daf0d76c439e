//! Command protocol engine
//!
//! Turns client operations into ordered register sequences and, for the
//! long-running ones, blocks on the completion channel until the device's
//! busy bit clears.
//!
//! # Ordering
//!
//! | Operation | Register sequence |
//! |-----------|-------------------|
//! | identify | read `IDENT` |
//! | liveness | write `LIVENESS`, read `LIVENESS` |
//! | factorial | write `STATUS=0x80`, write `FACTORIAL`, wait `!COMPUTING`, read `FACTORIAL` |
//! | dma | write `DMA_SRC`, `DMA_DST`, `DMA_XFER`, `DMA_CMD`, wait `!START` |
//! | raise irq | write `IRQ_RAISE` |
//!
//! Every operation that touches device state holds the channel's
//! single-flight permit, so sequences from concurrent callers never
//! interleave. A caller queued for the permit can be cancelled, and a cancel
//! that is pending once the permit is held stops a factorial or DMA before
//! its first register write. Identify is a single read of a constant
//! register and skips the permit.
//!
//! A cancelled factorial or DMA leaves the device busy. The engine records
//! it and the next long-running operation first waits for the busy bit to
//! clear, so it never reprograms a unit that is still working.

use crate::backend::{BackendType, EduBackend};
use crate::completion::{ArmedWait, CancelToken, CompletionChannel, FlightPermit};
use crate::dma::DmaBuffer;
use crate::error::{EduError, Result};
use edu_chip::regs::{
    dma_cmd, status, DMA_BUF_DEVICE_OFFSET, DMA_CMD, DMA_DST, DMA_SRC, DMA_XFER, FACTORIAL,
    IDENT, IRQ_RAISE, LIVENESS, STATUS,
};
use parking_lot::{Mutex, MutexGuard};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error};

/// Direction of a DMA transfer, relative to the device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Shared buffer → device window
    ToDevice,
    /// Device window → shared buffer
    FromDevice,
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ToDevice => write!(f, "to device"),
            Self::FromDevice => write!(f, "from device"),
        }
    }
}

/// Unit of the device a cancelled operation left running
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Unit {
    Factorial,
    Dma,
}

#[derive(Debug, Default)]
struct Flight {
    abandoned: Option<Unit>,
}

/// Permit plus the flight record it guards
struct InFlight<'a> {
    flight: MutexGuard<'a, Flight>,
    _permit: FlightPermit<'a>,
}

/// Serializes register sequences against one device
#[derive(Debug)]
pub struct CommandEngine {
    backend: Arc<dyn EduBackend>,
    buffer: Arc<DmaBuffer>,
    channel: Arc<CompletionChannel>,
    flight: Mutex<Flight>,
    faulted: AtomicBool,
    detached: AtomicBool,
}

impl CommandEngine {
    /// Create an engine over `backend`, using `buffer` for every DMA and
    /// `channel` for completion waits.
    pub fn new(
        backend: Arc<dyn EduBackend>,
        buffer: Arc<DmaBuffer>,
        channel: Arc<CompletionChannel>,
    ) -> Self {
        Self {
            backend,
            buffer,
            channel,
            flight: Mutex::new(Flight::default()),
            faulted: AtomicBool::new(false),
            detached: AtomicBool::new(false),
        }
    }

    /// Backend the engine drives
    pub fn backend(&self) -> &Arc<dyn EduBackend> {
        &self.backend
    }

    /// Shared DMA buffer
    pub fn buffer(&self) -> &Arc<DmaBuffer> {
        &self.buffer
    }

    /// Completion channel the engine waits on
    pub fn channel(&self) -> &Arc<CompletionChannel> {
        &self.channel
    }

    /// Get backend type for debugging
    pub fn backend_type(&self) -> BackendType {
        self.backend.backend_type()
    }

    /// Whether a bus fault has made the device unusable.
    pub fn is_faulted(&self) -> bool {
        self.faulted.load(Ordering::SeqCst)
    }

    /// Record a fatal error: every later operation and every blocked wait fails.
    pub fn mark_faulted(&self, cause: &EduError) {
        if !self.faulted.swap(true, Ordering::SeqCst) {
            error!("edu device unusable: {cause}");
        }
        self.channel.close();
    }

    /// Stop accepting operations after the device has been detached.
    pub(crate) fn retire(&self) {
        self.detached.store(true, Ordering::SeqCst);
        self.channel.close();
    }

    fn enter(&self, cancel: &CancelToken) -> Result<InFlight<'_>> {
        let permit = self.channel.enter(cancel)?;
        // Only the permit holder locks `flight`.
        Ok(InFlight {
            flight: self.flight.lock(),
            _permit: permit,
        })
    }

    /// Enter for an operation that starts a device unit.
    fn enter_unit(&self, cancel: &CancelToken) -> Result<InFlight<'_>> {
        let mut held = self.enter(cancel)?;
        if cancel.take() {
            debug!("Cancelled before issuing");
            return Err(EduError::Cancelled);
        }
        self.settle(&mut held.flight, cancel)?;
        Ok(held)
    }

    fn ensure_usable(&self) -> Result<()> {
        if self.detached.load(Ordering::SeqCst) {
            return Err(EduError::bus_fault("device detached"));
        }
        if self.is_faulted() {
            return Err(EduError::bus_fault("device no longer responding"));
        }
        Ok(())
    }

    fn checked<T>(&self, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            if e.is_fatal() {
                self.mark_faulted(e);
            }
        }
        result
    }

    fn read(&self, offset: usize) -> Result<u32> {
        self.checked(self.backend.read32(offset))
    }

    fn write(&self, offset: usize, value: u32) -> Result<()> {
        self.checked(self.backend.write32(offset, value))
    }

    fn busy(&self, unit: Unit) -> Result<bool> {
        Ok(match unit {
            Unit::Factorial => self.read(STATUS)? & status::COMPUTING != 0,
            Unit::Dma => self.read(DMA_CMD)? & dma_cmd::START_XFER != 0,
        })
    }

    /// Block until `unit` is idle. On cancellation the unit is recorded as
    /// abandoned and its result is never read.
    fn wait_idle(&self, flight: &mut Flight, unit: Unit, cancel: &CancelToken) -> Result<()> {
        match self.channel.arm_and_block(cancel, || Ok(!self.busy(unit)?)) {
            Err(EduError::Cancelled) => {
                debug!("{unit:?} wait cancelled, device left busy");
                flight.abandoned = Some(unit);
                Err(EduError::Cancelled)
            }
            other => other,
        }
    }

    /// Wait out a unit a cancelled caller left running.
    fn settle(&self, flight: &mut Flight, cancel: &CancelToken) -> Result<()> {
        if let Some(unit) = flight.abandoned.take() {
            debug!("Waiting for abandoned {unit:?} to finish");
            self.wait_idle(flight, unit, cancel)?;
        }
        Ok(())
    }

    /// Identification register.
    ///
    /// # Errors
    ///
    /// Returns `BusFault` if the register cannot be read or reads all-ones.
    pub fn identify(&self) -> Result<u32> {
        self.ensure_usable()?;
        let ident = self.read(IDENT)?;
        if ident == u32::MAX {
            let e = EduError::bus_fault("identification register reads all-ones");
            self.mark_faulted(&e);
            return Err(e);
        }
        Ok(ident)
    }

    /// Write `value` to the liveness register and read back its inverse.
    ///
    /// # Errors
    ///
    /// Returns `Cancelled` if `cancel` fires while queued behind another
    /// operation, `BusFault` if register access fails.
    pub fn liveness(&self, value: u32, cancel: &CancelToken) -> Result<u32> {
        self.ensure_usable()?;
        let _held = self.enter(cancel)?;
        self.write(LIVENESS, value)?;
        self.read(LIVENESS)
    }

    /// Compute `n!` on the device (32-bit wrapping), blocking until done.
    ///
    /// # Errors
    ///
    /// Returns `Cancelled` if `cancel` fires before completion, `BusFault` on
    /// register failure.
    pub fn factorial(&self, n: u32, cancel: &CancelToken) -> Result<u32> {
        self.ensure_usable()?;
        let mut held = self.enter_unit(cancel)?;

        self.write(STATUS, status::RAISE_IRQ_ARM)?;
        debug!("Writing {n} to register");
        self.write(FACTORIAL, n)?;
        self.wait_idle(&mut held.flight, Unit::Factorial, cancel)?;

        let result = self.read(FACTORIAL)?;
        debug!("Got factorial result: {result}");
        Ok(result)
    }

    /// Move `len` bytes between the shared buffer and the device window.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` for a zero or oversized length,
    /// `AddressNotSupported` if the buffer's bus address needs more than 32
    /// bits, `Cancelled` if `cancel` fires first, `BusFault` on register failure.
    pub fn dma(&self, direction: Direction, len: u32, cancel: &CancelToken) -> Result<()> {
        self.ensure_usable()?;
        if len == 0 || len as usize > self.buffer.capacity() {
            return Err(EduError::invalid_argument(format!(
                "DMA length {len} outside 1..={}",
                self.buffer.capacity()
            )));
        }
        let bus = self.buffer.bus_address32()?;

        let (src, dst, cmd) = match direction {
            Direction::ToDevice => (
                bus,
                DMA_BUF_DEVICE_OFFSET,
                dma_cmd::START_XFER | dma_cmd::RAM_TO_DEVICE | dma_cmd::RAISE_IRQ,
            ),
            Direction::FromDevice => (
                DMA_BUF_DEVICE_OFFSET,
                bus,
                dma_cmd::START_XFER | dma_cmd::DEVICE_TO_RAM | dma_cmd::RAISE_IRQ,
            ),
        };

        let mut held = self.enter_unit(cancel)?;

        debug!("src={src:#010x} dst={dst:#010x} len={len}");
        self.write(DMA_SRC, src)?;
        self.write(DMA_DST, dst)?;
        self.write(DMA_XFER, len)?;
        self.write(DMA_CMD, cmd)?;
        self.wait_idle(&mut held.flight, Unit::Dma, cancel)
    }

    /// Ask the device to raise interrupt bits `value`.
    ///
    /// # Errors
    ///
    /// Returns `Cancelled` if `cancel` fires while queued behind another
    /// operation, `BusFault` if register access fails.
    pub fn raise_irq(&self, value: u32, cancel: &CancelToken) -> Result<()> {
        self.ensure_usable()?;
        let _held = self.enter(cancel)?;
        debug!("Raising irq {value:#x}");
        self.write(IRQ_RAISE, value)
    }

    /// Capture point for the next interrupt, taken without waiting for
    /// operations in flight.
    ///
    /// # Errors
    ///
    /// Returns `BusFault` if the device is unusable.
    pub fn arm(&self, cancel: CancelToken) -> Result<ArmedWait> {
        self.ensure_usable()?;
        Ok(self.channel.arm(cancel))
    }

    /// Block until the next interrupt and return its status value.
    ///
    /// The wait is armed once operations in flight have finished issuing
    /// their register sequence; the block itself runs without the permit.
    ///
    /// # Errors
    ///
    /// Returns `Cancelled` if `cancel` fires first, `BusFault` if delivery stops.
    pub fn wait_for_any_event(&self, cancel: CancelToken) -> Result<u32> {
        self.ensure_usable()?;
        let armed = {
            let _permit = self.channel.enter(&cancel)?;
            self.channel.arm(cancel)
        };
        armed.wait()
    }

    /// Interrupt-context entry: capture, acknowledge and publish the event.
    ///
    /// # Errors
    ///
    /// Returns `BusFault` if the interrupt registers cannot be accessed.
    pub fn service_interrupt(&self) -> Result<u32> {
        let handled = self.channel.handle_interrupt(self.backend.as_ref());
        self.checked(handled)
    }
}
