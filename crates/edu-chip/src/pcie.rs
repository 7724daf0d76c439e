//! PCI identifiers.

/// QEMU vendor ID (`lspci: 1234:xxxx`).
pub const QEMU_VENDOR_ID: u16 = 0x1234;

/// Device IDs for the edu family.
pub mod device_id {
    /// edu educational device (`lspci: 1234:11e8`).
    pub const EDU: u16 = 0x11E8;
}

/// Format a `vendor:device` string for use with `lspci -d`.
#[must_use]
pub fn lspci_filter() -> String {
    format!("{:04x}:{:04x}", QEMU_VENDOR_ID, device_id::EDU)
}

/// Whether a vendor/device pair names an edu device.
#[must_use]
pub const fn is_edu(vendor: u16, device: u16) -> bool {
    vendor == QEMU_VENDOR_ID && device == device_id::EDU
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lspci_filter_format() {
        assert_eq!(lspci_filter(), "1234:11e8");
    }

    #[test]
    fn matches_only_edu() {
        assert!(is_edu(0x1234, 0x11e8));
        assert!(!is_edu(0x1234, 0x1111));
        assert!(!is_edu(0x1e7c, 0x11e8));
    }
}
