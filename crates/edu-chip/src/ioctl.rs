//! Control command numbers.
//!
//! Linux `_IOC` encoding: `dir << 30 | size << 16 | type << 8 | nr`.
//! Commands that exchange a value through user memory carry a 4-byte
//! `u32` payload; `RAISE_IRQ` and the two DMA commands take their argument
//! by value, but are still encoded as `_IOW` so the size field documents it.

/// Command type byte shared by every edu command.
pub const EDU_IOC_MAGIC: u8 = b'E';

const IOC_NONE: u32 = 0;
const IOC_WRITE: u32 = 1;
const IOC_READ: u32 = 2;

const fn ioc(dir: u32, ty: u8, nr: u8, size: u32) -> u32 {
    (dir << 30) | (size << 16) | ((ty as u32) << 8) | nr as u32
}

const U32_SIZE: u32 = 4;

/// `_IOR(EDU_IOC_MAGIC, 1, u32)`: read the identification register.
pub const EDU_IOCTL_IDENT: u32 = ioc(IOC_READ, EDU_IOC_MAGIC, 1, U32_SIZE);
/// `_IOWR(EDU_IOC_MAGIC, 2, u32)`: liveness round trip.
pub const EDU_IOCTL_LIVENESS: u32 = ioc(IOC_READ | IOC_WRITE, EDU_IOC_MAGIC, 2, U32_SIZE);
/// `_IOWR(EDU_IOC_MAGIC, 3, u32)`: factorial.
pub const EDU_IOCTL_FACTORIAL: u32 = ioc(IOC_READ | IOC_WRITE, EDU_IOC_MAGIC, 3, U32_SIZE);
/// `_IOR(EDU_IOC_MAGIC, 4, u32)`: wait for any interrupt.
pub const EDU_IOCTL_WAIT_IRQ: u32 = ioc(IOC_READ, EDU_IOC_MAGIC, 4, U32_SIZE);
/// `_IOW(EDU_IOC_MAGIC, 5, u32)`: raise an interrupt.
pub const EDU_IOCTL_RAISE_IRQ: u32 = ioc(IOC_WRITE, EDU_IOC_MAGIC, 5, U32_SIZE);
/// `_IOW(EDU_IOC_MAGIC, 6, u32)`: DMA from the shared buffer to the device.
pub const EDU_IOCTL_DMA_TO_DEVICE: u32 = ioc(IOC_WRITE, EDU_IOC_MAGIC, 6, U32_SIZE);
/// `_IOW(EDU_IOC_MAGIC, 7, u32)`: DMA from the device to the shared buffer.
pub const EDU_IOCTL_DMA_FROM_DEVICE: u32 = ioc(IOC_WRITE, EDU_IOC_MAGIC, 7, U32_SIZE);

/// Every defined command number.
pub const ALL_COMMANDS: &[u32] = &[
    EDU_IOCTL_IDENT,
    EDU_IOCTL_LIVENESS,
    EDU_IOCTL_FACTORIAL,
    EDU_IOCTL_WAIT_IRQ,
    EDU_IOCTL_RAISE_IRQ,
    EDU_IOCTL_DMA_TO_DEVICE,
    EDU_IOCTL_DMA_FROM_DEVICE,
];

/// Command type byte of an encoded number.
#[must_use]
pub const fn ioc_type(cmd: u32) -> u8 {
    ((cmd >> 8) & 0xFF) as u8
}

/// Sequence number of an encoded command.
#[must_use]
pub const fn ioc_nr(cmd: u32) -> u8 {
    (cmd & 0xFF) as u8
}

/// Whether the command hands a result back through its argument.
#[must_use]
pub const fn returns_value(cmd: u32) -> bool {
    (cmd >> 30) & IOC_READ != 0
}

/// Whether the command carries no payload at all.
#[must_use]
pub const fn is_bare(cmd: u32) -> bool {
    cmd >> 30 == IOC_NONE
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_numbers_unique() {
        for (i, a) in ALL_COMMANDS.iter().enumerate() {
            assert_eq!(ioc_type(*a), EDU_IOC_MAGIC);
            assert!(!is_bare(*a));
            for b in &ALL_COMMANDS[i + 1..] {
                assert_ne!(a, b);
            }
        }
    }

    #[test]
    fn linux_encoding() {
        // _IOR('E', 1, u32)
        assert_eq!(EDU_IOCTL_IDENT, 0x8004_4501);
        // _IOW('E', 5, u32)
        assert_eq!(EDU_IOCTL_RAISE_IRQ, 0x4004_4505);
        assert_eq!(ioc_nr(EDU_IOCTL_DMA_FROM_DEVICE), 7);
    }

    #[test]
    fn direction_bits() {
        assert!(returns_value(EDU_IOCTL_FACTORIAL));
        assert!(returns_value(EDU_IOCTL_WAIT_IRQ));
        assert!(!returns_value(EDU_IOCTL_RAISE_IRQ));
        assert!(!returns_value(EDU_IOCTL_DMA_TO_DEVICE));
    }
}
