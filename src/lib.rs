//! Forensic triage of decrypted ASP.NET ViewState payloads.
//!
//! Each payload is checked for an embedded Windows executable and scanned
//! against a catalog of known .NET deserialization gadget signatures.

pub mod analyzer;
pub mod decrypt;
pub mod extractor;
pub mod gadgets;
pub mod models;
pub mod output;
pub mod parser;
