//! Identification register decoding.
//!
//! The register reads `0xRRrr00ed`: major revision in the top byte, minor
//! revision in the next, and the constant signature `0xed` in the low byte.

/// Signature byte carried in the low 8 bits of the identification register.
pub const SIGNATURE: u8 = 0xED;

/// Value read from a device revision `1.0`.
pub const EDU_1_0: u32 = 0x0100_00ED;

/// Decoded identification register.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceIdentity {
    /// Major revision.
    pub major: u8,
    /// Minor revision.
    pub minor: u8,
    /// Signature byte (`0xed` on a genuine device).
    pub signature: u8,
}

impl DeviceIdentity {
    /// Decode a raw identification value.
    #[must_use]
    pub const fn from_raw(raw: u32) -> Self {
        let [major, minor, _, signature] = raw.to_be_bytes();
        Self {
            major,
            minor,
            signature,
        }
    }

    /// Whether the signature byte matches.
    #[must_use]
    pub const fn is_genuine(&self) -> bool {
        self.signature == SIGNATURE
    }
}

impl std::fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "edu {}.{}", self.major, self.minor)
    }
}
