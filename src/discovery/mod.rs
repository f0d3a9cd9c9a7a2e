//! Stream discovery
//!
//! Passive discovery of AES67 sessions announced over SAP. Discovered
//! descriptors are surfaced to the controller layer; nothing here
//! instantiates streams.

mod sap;

pub use sap::{SapAnnouncement, SapListener};
