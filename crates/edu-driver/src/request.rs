//! Control-command façade
//!
//! Decodes Linux-style command numbers (see [`edu_chip::ioctl`]) into typed
//! requests, so a character-device shim or a test harness can drive a
//! [`Session`](crate::Session) with `(cmd, arg)` pairs.

use crate::error::{EduError, Result};
use edu_chip::ioctl::{
    EDU_IOCTL_DMA_FROM_DEVICE, EDU_IOCTL_DMA_TO_DEVICE, EDU_IOCTL_FACTORIAL, EDU_IOCTL_IDENT,
    EDU_IOCTL_LIVENESS, EDU_IOCTL_RAISE_IRQ, EDU_IOCTL_WAIT_IRQ,
};

/// One client operation with its argument
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Request {
    /// Read the identification register
    Identify,
    /// Liveness round trip
    Liveness(u32),
    /// Factorial of the argument
    Factorial(u32),
    /// Wait for the next interrupt
    WaitIrq,
    /// Raise interrupt bits
    RaiseIrq(u32),
    /// DMA `len` bytes from the shared buffer to the device
    DmaToDevice(u32),
    /// DMA `len` bytes from the device to the shared buffer
    DmaFromDevice(u32),
}

/// Result of a [`Request`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reply {
    /// Value handed back through the argument
    Value(u32),
    /// Completed with nothing to return
    Done,
}

impl Request {
    /// Decode a command number and its argument.
    ///
    /// # Errors
    ///
    /// Returns `UnknownCommand` for a number that is not an edu command.
    pub fn decode(cmd: u32, arg: u32) -> Result<Self> {
        Ok(match cmd {
            EDU_IOCTL_IDENT => Self::Identify,
            EDU_IOCTL_LIVENESS => Self::Liveness(arg),
            EDU_IOCTL_FACTORIAL => Self::Factorial(arg),
            EDU_IOCTL_WAIT_IRQ => Self::WaitIrq,
            EDU_IOCTL_RAISE_IRQ => Self::RaiseIrq(arg),
            EDU_IOCTL_DMA_TO_DEVICE => Self::DmaToDevice(arg),
            EDU_IOCTL_DMA_FROM_DEVICE => Self::DmaFromDevice(arg),
            _ => return Err(EduError::UnknownCommand { cmd }),
        })
    }

    /// Command number this request decodes from.
    pub const fn command(&self) -> u32 {
        match self {
            Self::Identify => EDU_IOCTL_IDENT,
            Self::Liveness(_) => EDU_IOCTL_LIVENESS,
            Self::Factorial(_) => EDU_IOCTL_FACTORIAL,
            Self::WaitIrq => EDU_IOCTL_WAIT_IRQ,
            Self::RaiseIrq(_) => EDU_IOCTL_RAISE_IRQ,
            Self::DmaToDevice(_) => EDU_IOCTL_DMA_TO_DEVICE,
            Self::DmaFromDevice(_) => EDU_IOCTL_DMA_FROM_DEVICE,
        }
    }
}
