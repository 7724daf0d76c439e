//! Interrupt completion channel
//!
//! The interrupt path records the device's interrupt status as the "last
//! event" and wakes every blocked waiter. Waiters never rely on the wake-up
//! alone: they re-check their completion condition (a device register, or a
//! change of event generation) after every wake-up, so a wake-up that arrives
//! before the waiter sleeps is never lost.
//!
//! ```text
//! dispatcher thread            waiter
//! ─────────────────            ──────
//! read IRQ_STATUS              snapshot generation
//! write IRQ_ACK                check condition ── done? → return
//! lock; store; gen += 1        lock; gen unchanged? → sleep
//! notify_all ───────────────▶  wake; re-check
//! ```

use crate::error::{EduError, Result};
use crate::mmio::RegisterFile;
use edu_chip::regs::{IRQ_ACK, IRQ_STATUS};
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Debug, Default)]
struct EventCell {
    /// Interrupt status captured by the most recent interrupt
    value: u32,
    /// Number of interrupts handled so far
    generation: u64,
    /// Set once delivery has stopped for good
    closed: bool,
    /// A caller holds the single-flight permit
    in_flight: bool,
}

/// Last-event cell plus the wait queue blocked callers sleep on
#[derive(Debug, Default)]
pub struct CompletionChannel {
    state: Mutex<EventCell>,
    wake: Condvar,
}

impl CompletionChannel {
    /// Create an open channel with no events recorded.
    pub fn new() -> Self {
        Self::default()
    }

    /// Interrupt-context handler: capture and acknowledge the device's
    /// interrupt status, record it, and wake every waiter.
    ///
    /// # Errors
    ///
    /// Returns `BusFault` if the status register cannot be accessed.
    pub fn handle_interrupt<R: RegisterFile + ?Sized>(&self, regs: &R) -> Result<u32> {
        let value = regs.read32(IRQ_STATUS)?;
        tracing::debug!("irq_value = {value}");
        regs.write32(IRQ_ACK, value)?;

        let mut cell = self.state.lock();
        cell.value = value;
        cell.generation = cell.generation.wrapping_add(1);
        drop(cell);
        self.wake.notify_all();
        Ok(value)
    }

    /// Value captured by the most recent interrupt (0 before the first one).
    pub fn last_event(&self) -> u32 {
        self.state.lock().value
    }

    /// Number of interrupts handled so far.
    pub fn generation(&self) -> u64 {
        self.state.lock().generation
    }

    /// Wake every waiter without recording an event.
    pub fn wake_all(&self) {
        // Taking the lock orders this wake-up after any waiter's final check.
        let _cell = self.state.lock();
        self.wake.notify_all();
    }

    /// Stop delivery: every current and future wait fails with `BusFault`.
    pub fn close(&self) {
        let mut cell = self.state.lock();
        cell.closed = true;
        drop(cell);
        self.wake.notify_all();
    }

    /// Whether [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Take the single-flight permit, sleeping while another caller holds it.
    ///
    /// Queued callers sleep on the same wait queue as completion waiters, so
    /// a cancel or a close releases them too.
    ///
    /// # Errors
    ///
    /// Returns `Cancelled` if `cancel` fires while queued, `BusFault` if the
    /// channel is closed.
    pub fn enter(&self, cancel: &CancelToken) -> Result<FlightPermit<'_>> {
        let mut cell = self.state.lock();
        loop {
            if cell.closed {
                return Err(EduError::bus_fault("interrupt delivery stopped"));
            }
            if !cell.in_flight {
                cell.in_flight = true;
                return Ok(FlightPermit { channel: self });
            }
            if cancel.take() {
                return Err(EduError::Cancelled);
            }
            self.wake.wait(&mut cell);
        }
    }

    /// Block until `done` reports completion.
    ///
    /// `done` is evaluated before the first sleep and after every interrupt.
    /// A completion that is already visible wins over a pending cancellation.
    ///
    /// # Errors
    ///
    /// Returns `Cancelled` if `cancel` fires first, `BusFault` if the channel
    /// is closed, or whatever `done` returns.
    pub fn arm_and_block(
        &self,
        cancel: &CancelToken,
        mut done: impl FnMut() -> Result<bool>,
    ) -> Result<()> {
        loop {
            let seen = self.state.lock().generation;
            if done()? {
                return Ok(());
            }

            let mut cell = self.state.lock();
            loop {
                if cell.closed {
                    return Err(EduError::bus_fault("interrupt delivery stopped"));
                }
                if cancel.take() {
                    return Err(EduError::Cancelled);
                }
                if cell.generation != seen {
                    break;
                }
                self.wake.wait(&mut cell);
            }
        }
    }

    /// Start capturing interrupts from this point on.
    pub fn arm(self: &Arc<Self>, cancel: CancelToken) -> ArmedWait {
        let generation = self.state.lock().generation;
        ArmedWait {
            channel: Arc::clone(self),
            generation,
            cancel,
        }
    }

    /// Block until the next interrupt and return its captured status.
    ///
    /// # Errors
    ///
    /// Returns `Cancelled` or `BusFault` as [`ArmedWait::wait`] does.
    pub fn wait_for_any_event(self: &Arc<Self>, cancel: CancelToken) -> Result<u32> {
        self.arm(cancel).wait()
    }
}

/// A wait armed at a known point: any interrupt handled after the arm
/// completes it, even one that fires before [`wait`](Self::wait) is called.
#[derive(Debug)]
pub struct ArmedWait {
    channel: Arc<CompletionChannel>,
    generation: u64,
    cancel: CancelToken,
}

impl ArmedWait {
    /// Whether an interrupt has been handled since the wait was armed.
    pub fn is_ready(&self) -> bool {
        self.channel.state.lock().generation != self.generation
    }

    /// Block until an interrupt is handled after the arm point, returning
    /// the last captured status value.
    ///
    /// # Errors
    ///
    /// Returns `Cancelled` if the cancel token fires first, `BusFault` if
    /// interrupt delivery stops.
    pub fn wait(self) -> Result<u32> {
        let mut cell = self.channel.state.lock();
        loop {
            if cell.generation != self.generation {
                return Ok(cell.value);
            }
            if cell.closed {
                return Err(EduError::bus_fault("interrupt delivery stopped"));
            }
            if self.cancel.take() {
                return Err(EduError::Cancelled);
            }
            self.channel.wake.wait(&mut cell);
        }
    }
}

/// Exclusive right to issue a register sequence, released on drop
#[derive(Debug)]
pub struct FlightPermit<'a> {
    channel: &'a CompletionChannel,
}

impl Drop for FlightPermit<'_> {
    fn drop(&mut self) {
        let mut cell = self.channel.state.lock();
        cell.in_flight = false;
        drop(cell);
        self.channel.wake.notify_all();
    }
}

/// Cancels blocking waits of the session it was taken from.
///
/// Safe to use from any thread. A cancel that arrives while nothing is
/// waiting is reported by the next blocking wait.
#[derive(Debug, Clone)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
    channel: Arc<CompletionChannel>,
}

impl CancelToken {
    /// Create a token that wakes waiters on `channel`.
    pub fn new(channel: Arc<CompletionChannel>) -> Self {
        Self {
            flag: Arc::new(AtomicBool::new(false)),
            channel,
        }
    }

    /// Interrupt the current (or next) blocking wait.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
        self.channel.wake_all();
    }

    /// Whether a cancel is pending.
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Consume a pending cancel.
    pub(crate) fn take(&self) -> bool {
        self.flag.swap(false, Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use std::thread;
    use std::time::Duration;

    /// Status/ack register pair
    #[derive(Default)]
    struct IrqRegs {
        status: AtomicU32,
        acked: AtomicU32,
    }

    impl RegisterFile for IrqRegs {
        fn read32(&self, offset: usize) -> Result<u32> {
            assert_eq!(offset, IRQ_STATUS);
            Ok(self.status.load(Ordering::SeqCst))
        }

        fn write32(&self, offset: usize, value: u32) -> Result<()> {
            assert_eq!(offset, IRQ_ACK);
            self.acked.store(value, Ordering::SeqCst);
            self.status.fetch_and(!value, Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn interrupt_is_captured_and_acked() {
        let channel = CompletionChannel::new();
        let regs = IrqRegs::default();
        regs.status.store(0x100, Ordering::SeqCst);

        assert_eq!(channel.handle_interrupt(&regs).unwrap(), 0x100);
        assert_eq!(regs.acked.load(Ordering::SeqCst), 0x100);
        assert_eq!(regs.status.load(Ordering::SeqCst), 0);
        assert_eq!(channel.last_event(), 0x100);
        assert_eq!(channel.generation(), 1);
    }

    #[test]
    fn armed_wait_sees_event_fired_before_wait() {
        let channel = Arc::new(CompletionChannel::new());
        let token = CancelToken::new(Arc::clone(&channel));
        let regs = IrqRegs::default();

        let armed = channel.arm(token);
        assert!(!armed.is_ready());
        regs.status.store(0x42, Ordering::SeqCst);
        channel.handle_interrupt(&regs).unwrap();
        assert!(armed.is_ready());
        assert_eq!(armed.wait().unwrap(), 0x42);
    }

    #[test]
    fn every_waiter_is_woken() {
        let channel = Arc::new(CompletionChannel::new());
        let armed: Vec<_> = (0..4)
            .map(|_| channel.arm(CancelToken::new(Arc::clone(&channel))))
            .collect();
        let waiters: Vec<_> = armed
            .into_iter()
            .map(|w| thread::spawn(move || w.wait()))
            .collect();

        let regs = IrqRegs::default();
        regs.status.store(0x1, Ordering::SeqCst);
        channel.handle_interrupt(&regs).unwrap();

        for w in waiters {
            assert_eq!(w.join().unwrap().unwrap(), 0x1);
        }
    }

    #[test]
    fn cancel_interrupts_blocked_wait() {
        let channel = Arc::new(CompletionChannel::new());
        let token = CancelToken::new(Arc::clone(&channel));
        let canceller = token.clone();

        let waiter = {
            let channel = Arc::clone(&channel);
            thread::spawn(move || channel.wait_for_any_event(token))
        };
        thread::sleep(Duration::from_millis(20));
        canceller.cancel();
        assert!(matches!(waiter.join().unwrap(), Err(EduError::Cancelled)));
        assert!(!canceller.is_cancelled());
    }

    #[test]
    fn queued_permit_request_is_cancellable() {
        let channel = Arc::new(CompletionChannel::new());
        let holder = CancelToken::new(Arc::clone(&channel));
        let permit = channel.enter(&holder).unwrap();

        let token = CancelToken::new(Arc::clone(&channel));
        let canceller = token.clone();
        let queued = {
            let channel = Arc::clone(&channel);
            thread::spawn(move || channel.enter(&token).map(drop))
        };
        thread::sleep(Duration::from_millis(20));
        canceller.cancel();
        assert!(matches!(queued.join().unwrap(), Err(EduError::Cancelled)));

        // Still held by the first caller until dropped.
        drop(permit);
        assert!(channel.enter(&holder).is_ok());
    }

    #[test]
    fn permit_passes_to_next_caller_on_drop() {
        let channel = Arc::new(CompletionChannel::new());
        let permit = channel.enter(&CancelToken::new(Arc::clone(&channel))).unwrap();
        let queued = {
            let channel = Arc::clone(&channel);
            thread::spawn(move || {
                let token = CancelToken::new(Arc::clone(&channel));
                channel.enter(&token).map(drop)
            })
        };
        thread::sleep(Duration::from_millis(20));
        assert!(!queued.is_finished());
        drop(permit);
        assert!(queued.join().unwrap().is_ok());
    }

    #[test]
    fn pending_cancel_reported_by_next_wait() {
        let channel = Arc::new(CompletionChannel::new());
        let token = CancelToken::new(Arc::clone(&channel));
        token.cancel();
        assert!(token.is_cancelled());
        assert!(matches!(
            channel.wait_for_any_event(token.clone()),
            Err(EduError::Cancelled)
        ));
        assert!(!token.is_cancelled());
    }

    #[test]
    fn visible_completion_wins_over_cancel() {
        let channel = Arc::new(CompletionChannel::new());
        let token = CancelToken::new(Arc::clone(&channel));
        token.cancel();
        channel.arm_and_block(&token, || Ok(true)).unwrap();
        // The cancel is still pending for the next wait.
        assert!(token.is_cancelled());
    }

    #[test]
    fn condition_rechecked_after_each_interrupt() {
        let channel = Arc::new(CompletionChannel::new());
        let token = CancelToken::new(Arc::clone(&channel));
        let busy = Arc::new(AtomicBool::new(true));

        let device = {
            let channel = Arc::clone(&channel);
            let busy = Arc::clone(&busy);
            thread::spawn(move || {
                let regs = IrqRegs::default();
                // Unrelated interrupt first; the waiter must keep sleeping.
                thread::sleep(Duration::from_millis(10));
                regs.status.store(0x8000, Ordering::SeqCst);
                channel.handle_interrupt(&regs).unwrap();
                thread::sleep(Duration::from_millis(10));
                busy.store(false, Ordering::SeqCst);
                regs.status.store(0x1, Ordering::SeqCst);
                channel.handle_interrupt(&regs).unwrap();
            })
        };

        channel
            .arm_and_block(&token, || Ok(!busy.load(Ordering::SeqCst)))
            .unwrap();
        assert!(!busy.load(Ordering::SeqCst));
        device.join().unwrap();
    }

    #[test]
    fn close_fails_waiters() {
        let channel = Arc::new(CompletionChannel::new());
        let token = CancelToken::new(Arc::clone(&channel));
        let waiter = {
            let channel = Arc::clone(&channel);
            thread::spawn(move || channel.arm_and_block(&token, || Ok(false)))
        };
        thread::sleep(Duration::from_millis(20));
        channel.close();
        assert!(matches!(
            waiter.join().unwrap(),
            Err(EduError::BusFault { .. })
        ));
        assert!(channel.is_closed());
    }
}
