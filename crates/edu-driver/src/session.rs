//! Attached device and per-client sessions
//!
//! [`EduDevice::attach`] brings one device up: it allocates the shared DMA
//! buffer, checks the identification register and starts the interrupt
//! dispatcher thread. Clients then [`open`](EduDevice::open) any number of
//! [`Session`]s; all of them share the device, its buffer and its last-event
//! cell.

use crate::backend::{BackendType, EduBackend, InterruptSource};
use crate::completion::{ArmedWait, CancelToken, CompletionChannel};
use crate::config::EduConfig;
use crate::dma::{expose, DmaBuffer, MappedView};
use crate::error::Result;
use crate::protocol::{CommandEngine, Direction};
use crate::request::{Reply, Request};
use edu_chip::ident::DeviceIdentity;
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{debug, error, info, warn};

/// Interrupt dispatcher: the only place interrupts are serviced.
fn dispatch_interrupts(engine: &CommandEngine, source: &dyn InterruptSource) {
    loop {
        match source.wait() {
            Ok(true) => {}
            Ok(false) => break,
            Err(e) => {
                engine.mark_faulted(&e);
                break;
            }
        }
        if let Err(e) = engine.service_interrupt() {
            error!("Interrupt service failed: {e}");
            break;
        }
        if let Err(e) = source.unmask() {
            engine.mark_faulted(&e);
            break;
        }
    }
    debug!("Interrupt dispatcher stopped");
}

/// An attached edu device
#[derive(Debug)]
pub struct EduDevice {
    engine: Arc<CommandEngine>,
    interrupts: Arc<dyn InterruptSource>,
    dispatcher: Option<JoinHandle<()>>,
    identity: DeviceIdentity,
}

impl EduDevice {
    /// Attach to the device behind `backend`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` for a bad configuration, `OutOfMemory` or
    /// `AddressNotSupported` if the shared buffer cannot be set up, `BusFault`
    /// if the device does not respond, or an error from interrupt setup.
    pub fn attach(backend: Arc<dyn EduBackend>, config: &EduConfig) -> Result<Self> {
        config.validate()?;

        let buffer = DmaBuffer::allocate(backend.as_ref(), config.dma_capacity, config.dma_bits)?;
        let channel = Arc::new(CompletionChannel::new());
        let engine = Arc::new(CommandEngine::new(backend, buffer, channel));

        let identity = DeviceIdentity::from_raw(engine.identify()?);
        if !identity.is_genuine() {
            warn!(
                "Unexpected identification signature {:#04x} (expected {:#04x})",
                identity.signature,
                edu_chip::ident::SIGNATURE
            );
        }

        let interrupts = engine.backend().interrupts()?;
        let dispatcher = {
            let engine = Arc::clone(&engine);
            let source = Arc::clone(&interrupts);
            std::thread::Builder::new()
                .name("edu-irq".into())
                .spawn(move || dispatch_interrupts(&engine, source.as_ref()))?
        };

        info!(
            "Attached {identity} via {} backend, DMA bus {:#x}",
            engine.backend_type(),
            engine.buffer().bus_address()
        );

        Ok(Self {
            engine,
            interrupts,
            dispatcher: Some(dispatcher),
            identity,
        })
    }

    /// Open a new client session.
    pub fn open(&self) -> Session {
        Session {
            engine: Arc::clone(&self.engine),
            cancel: CancelToken::new(Arc::clone(self.engine.channel())),
        }
    }

    /// Identity read at attach
    pub const fn identity(&self) -> DeviceIdentity {
        self.identity
    }

    /// Get backend type for debugging
    pub fn backend_type(&self) -> BackendType {
        self.engine.backend_type()
    }

    /// Whether a bus fault has made the device unusable.
    pub fn is_faulted(&self) -> bool {
        self.engine.is_faulted()
    }

    /// Bus address of the shared DMA buffer
    pub fn dma_bus_address(&self) -> u64 {
        self.engine.buffer().bus_address()
    }

    /// Stop interrupt delivery and release the device.
    ///
    /// Open sessions fail every later operation; mapped views stay readable
    /// until dropped.
    pub fn detach(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        let Some(dispatcher) = self.dispatcher.take() else {
            return;
        };
        self.engine.retire();
        self.interrupts.shutdown();
        if dispatcher.join().is_err() {
            error!("Interrupt dispatcher panicked");
        }
        info!("Detached {}", self.identity);
    }
}

impl Drop for EduDevice {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// One client's handle on an attached device
///
/// Operations block the calling thread; a [`CancelToken`] from
/// [`canceller`](Self::canceller) interrupts them from another thread.
#[derive(Debug)]
pub struct Session {
    engine: Arc<CommandEngine>,
    cancel: CancelToken,
}

impl Session {
    /// Read the identification register.
    ///
    /// # Errors
    ///
    /// Returns `BusFault` if the device does not respond.
    pub fn identify(&self) -> Result<u32> {
        self.engine.identify()
    }

    /// Liveness round trip: returns the bitwise inverse of `value`.
    ///
    /// # Errors
    ///
    /// Returns `Cancelled` if cancelled while queued behind another
    /// operation, `BusFault` if the device does not respond.
    pub fn liveness(&self, value: u32) -> Result<u32> {
        self.engine.liveness(value, &self.cancel)
    }

    /// `n!` modulo 2^32, computed by the device.
    ///
    /// # Errors
    ///
    /// Returns `Cancelled` if cancelled before completion, `BusFault` if the
    /// device does not respond.
    pub fn factorial(&self, n: u32) -> Result<u32> {
        self.engine.factorial(n, &self.cancel)
    }

    /// Ask the device to raise interrupt bits `value`.
    ///
    /// # Errors
    ///
    /// Returns `Cancelled` if cancelled while queued, `BusFault` if the
    /// device does not respond.
    pub fn raise_irq(&self, value: u32) -> Result<()> {
        self.engine.raise_irq(value, &self.cancel)
    }

    /// Block until the next interrupt and return its status value.
    ///
    /// # Errors
    ///
    /// Returns `Cancelled` if cancelled first, `BusFault` if delivery stops.
    pub fn wait_for_any_event(&self) -> Result<u32> {
        self.engine.wait_for_any_event(self.cancel.clone())
    }

    /// Start capturing interrupts now, to wait for them later.
    ///
    /// ```no_run
    /// # fn demo(session: &edu_driver::Session) -> edu_driver::Result<()> {
    /// let armed = session.arm_event_wait()?;
    /// session.raise_irq(0x8000)?;
    /// assert_eq!(armed.wait()?, 0x8000);
    /// # Ok(())
    /// # }
    /// ```
    ///
    /// # Errors
    ///
    /// Returns `BusFault` if the device is unusable.
    pub fn arm_event_wait(&self) -> Result<ArmedWait> {
        self.engine.arm(self.cancel.clone())
    }

    /// DMA `len` bytes from the shared buffer into the device.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` for a zero or oversized length,
    /// `AddressNotSupported` if the buffer is above 4 GiB, `Cancelled` or `BusFault`.
    pub fn dma_to_device(&self, len: u32) -> Result<()> {
        self.engine.dma(Direction::ToDevice, len, &self.cancel)
    }

    /// DMA `len` bytes from the device into the shared buffer.
    ///
    /// # Errors
    ///
    /// As [`dma_to_device`](Self::dma_to_device).
    pub fn dma_from_device(&self, len: u32) -> Result<()> {
        self.engine.dma(Direction::FromDevice, len, &self.cancel)
    }

    /// Map the shared DMA buffer into the caller.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` unless `offset == 0` and `len` fits the buffer.
    pub fn map_buffer(&self, offset: u64, len: usize) -> Result<MappedView> {
        expose(self.engine.buffer(), offset, len)
    }

    /// Handle that cancels this session's blocking waits from another thread.
    pub fn canceller(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Run a decoded request.
    ///
    /// # Errors
    ///
    /// Whatever the underlying operation returns.
    pub fn dispatch(&self, request: Request) -> Result<Reply> {
        Ok(match request {
            Request::Identify => Reply::Value(self.identify()?),
            Request::Liveness(value) => Reply::Value(self.liveness(value)?),
            Request::Factorial(n) => Reply::Value(self.factorial(n)?),
            Request::WaitIrq => Reply::Value(self.wait_for_any_event()?),
            Request::RaiseIrq(value) => {
                self.raise_irq(value)?;
                Reply::Done
            }
            Request::DmaToDevice(len) => {
                self.dma_to_device(len)?;
                Reply::Done
            }
            Request::DmaFromDevice(len) => {
                self.dma_from_device(len)?;
                Reply::Done
            }
        })
    }

    /// Command-number entry point: decode, run, and write any result back
    /// into `arg`.
    ///
    /// # Errors
    ///
    /// Returns `UnknownCommand` for an unrecognized number, otherwise whatever
    /// the operation returns. `arg` is left untouched on error.
    pub fn ioctl(&self, cmd: u32, arg: &mut u32) -> Result<()> {
        let request = Request::decode(cmd, *arg)?;
        if let Reply::Value(value) = self.dispatch(request)? {
            *arg = value;
        }
        Ok(())
    }
}
