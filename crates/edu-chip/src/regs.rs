//! BAR0 register map.
//!
//! Every register is 32 bits wide and every access is a single bus
//! transaction. The DMA source/destination registers are 64-bit slots on the
//! device, but the protocol only ever writes their low 32 bits.
//!
//! ```text
//! 0x00  IDENT        RO  0xRRrr00ed  (major, minor, signature)
//! 0x04  LIVENESS     RW  reads back the bitwise inverse of the last write
//! 0x08  FACTORIAL    RW  write n to start; read n! once COMPUTING clears
//! 0x20  STATUS       RW  COMPUTING (RO), RAISE_IRQ_ARM (RW)
//! 0x24  IRQ_STATUS   RO  pending interrupt source bits
//! 0x60  IRQ_RAISE    WO  OR bits into IRQ_STATUS and assert the line
//! 0x64  IRQ_ACK      WO  clear bits from IRQ_STATUS
//! 0x80  DMA_SRC      RW
//! 0x88  DMA_DST      RW
//! 0x90  DMA_XFER     RW  transfer length in bytes
//! 0x98  DMA_CMD      RW  START_XFER | direction | RAISE_IRQ
//! ```

// ── Identification and liveness ──────────────────────────────────────────────

/// Identification register.
pub const IDENT: usize = 0x00;

/// Liveness check register.
pub const LIVENESS: usize = 0x04;

// ── Factorial unit ───────────────────────────────────────────────────────────

/// Factorial operand / result register.
pub const FACTORIAL: usize = 0x08;

/// Status register.
pub const STATUS: usize = 0x20;

// ── Interrupts ───────────────────────────────────────────────────────────────

/// Interrupt status register.
pub const IRQ_STATUS: usize = 0x24;
/// Interrupt raise register.
pub const IRQ_RAISE: usize = 0x60;
/// Interrupt acknowledge register.
pub const IRQ_ACK: usize = 0x64;

// ── DMA engine ───────────────────────────────────────────────────────────────

/// DMA source address.
pub const DMA_SRC: usize = 0x80;
/// DMA destination address.
pub const DMA_DST: usize = 0x88;
/// DMA transfer length.
pub const DMA_XFER: usize = 0x90;
/// DMA command register. Writing it with `START_XFER` latches src/dst/len.
pub const DMA_CMD: usize = 0x98;

/// Offset one past the last decoded register.
pub const REGISTER_SPAN: usize = 0x100;

// ── Status register bit definitions ──────────────────────────────────────────

pub mod status {
    /// Factorial computation in progress.
    pub const COMPUTING: u32 = 0x01;
    /// Raise an interrupt when the factorial finishes.
    pub const RAISE_IRQ_ARM: u32 = 0x80;
}

// ── DMA command bit definitions ──────────────────────────────────────────────

pub mod dma_cmd {
    /// Start the transfer. Cleared by the device on completion.
    pub const START_XFER: u32 = 1;
    /// Direction: host RAM to device buffer.
    pub const RAM_TO_DEVICE: u32 = 0;
    /// Direction: device buffer to host RAM.
    pub const DEVICE_TO_RAM: u32 = 2;
    /// Raise an interrupt when the transfer finishes.
    pub const RAISE_IRQ: u32 = 4;
}

// ── Interrupt sources ────────────────────────────────────────────────────────

pub mod irq {
    /// Factorial completion.
    pub const FACTORIAL: u32 = 0x0000_0001;
    /// DMA completion.
    pub const DMA: u32 = 0x0000_0100;
}

// ── Device DMA window ────────────────────────────────────────────────────────

/// Device-side address of the on-device DMA buffer.
pub const DMA_BUF_DEVICE_OFFSET: u32 = 0x40000;

/// Size of the on-device DMA buffer in bytes.
pub const DMA_BUF_SIZE: usize = 4096;

/// Default addressable DMA width of the device (bits).
pub const DEFAULT_DMA_BITS: u8 = 28;

/// Address mask for a DMA width in bits.
#[must_use]
pub const fn dma_mask(bits: u8) -> u64 {
    if bits >= 64 {
        u64::MAX
    } else {
        (1u64 << bits) - 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_offsets_non_overlapping() {
        let all = [
            IDENT, LIVENESS, FACTORIAL, STATUS, IRQ_STATUS, IRQ_RAISE, IRQ_ACK, DMA_SRC, DMA_DST,
            DMA_XFER, DMA_CMD,
        ];
        for (i, a) in all.iter().enumerate() {
            assert_eq!(a % 4, 0, "offset {a:#x} not 32-bit aligned");
            assert!(*a < REGISTER_SPAN);
            for b in &all[i + 1..] {
                assert_ne!(a, b);
            }
        }
    }

    #[test]
    fn fixed_register_layout() {
        assert_eq!(STATUS, 0x20);
        assert_eq!(IRQ_ACK, 0x64);
        assert_eq!(DMA_CMD, 0x98);
        assert_eq!(DMA_BUF_DEVICE_OFFSET, 0x40000);
    }

    #[test]
    fn dma_mask_widths() {
        assert_eq!(dma_mask(28), 0x0FFF_FFFF);
        assert_eq!(dma_mask(32), 0xFFFF_FFFF);
        assert_eq!(dma_mask(64), u64::MAX);
    }
}
