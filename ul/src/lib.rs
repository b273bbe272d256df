//! This crate contains the types and methods needed to interact
//! with DICOM nodes through the upper layer protocol.
//!
//! This crate can be used as a base
//! for finite-state machines and higher-level helpers,
//! enabling the creation of concrete service class users (SCUs)
//! and service class providers (SCPs).
//!
//! - The [`pdu`] module
//!   provides data structures representing _protocol data units_,
//!   which are passed around as part of the DICOM network communication support,
//!   and their binary codec.
//! - The [`association`] module
//!   comprises the association state machine,
//!   presentation context negotiation,
//!   the fragmentation of commands and data sets into P-Data,
//!   and drivers establishing associations over byte streams.
//!
//! ## Features
//! * `async`: Enables an async driver of associations over tokio streams.
//!   See `AsyncAssociation` in the [`association`] module for details.

pub mod association;
pub mod pdu;

/// The current implementation class UID of this crate.
///
/// Automatically generated as per the standard, part 5, section B.2.
///
/// This UID may change in future versions,
/// even between patch versions.
pub const IMPLEMENTATION_CLASS_UID: &str = "2.25.262086406829110419931297894772577063974";

/// The current implementation version name of this crate.
///
/// This name may change in future versions,
/// even between patch versions.
pub const IMPLEMENTATION_VERSION_NAME: &str = "DICOM-DUL 0.1.0";

// re-exports

pub use association::client::ClientAssociationOptions;
pub use association::server::ServerAssociationOptions;
pub use association::{Association, AssociationState, Received};
pub use pdu::read_pdu;
pub use pdu::write_pdu;
pub use pdu::Pdu;
