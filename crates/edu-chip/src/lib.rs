//! Silicon model for the `edu` compute+DMA PCI device.
//!
//! This crate has **no dependencies** and **no hardware access**. It is a
//! pure model of the device: PCI identifiers, BAR layout, the register map
//! with its bit definitions, identification decoding, and the control
//! command numbers the char-device façade understands.
//!
//! The register set is fixed by the device revision (`1.0`); nothing here is
//! discovered at runtime.
//!
//! # Crate organisation
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`pcie`] | Vendor/device IDs |
//! | [`bar`] | BAR0 layout (1 MB MMIO register window) |
//! | [`regs`] | Register offsets, status / DMA command bits, IRQ sources |
//! | [`ident`] | Identification register decoding |
//! | [`ioctl`] | Control command numbers (`_IOR`/`_IOW`/`_IOWR` encoding) |

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod bar;
pub mod ident;
pub mod ioctl;
pub mod pcie;
pub mod regs;
