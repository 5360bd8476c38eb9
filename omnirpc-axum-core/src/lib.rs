//! Core protocol types for omnirpc.
//!
//! This crate provides the protocol-neutral types shared by the gateway
//! server (`omnirpc-axum`) and any future client crates.
//!
//! ## Modules
//!
//! - [`message`]: Wire message values and format/encoding tags
//! - [`codec`]: Per-type message encoders and decoders
//! - [`frame`]: Incremental frame codecs for each protocol's framing rules
//! - [`envelope`]: JSON-RPC 2.0 envelope model
//! - [`status`]: Neutral status codes and the `Status` error value
//! - [`compression`]: Per-message payload compression

mod codec;
pub mod compression;
mod envelope;
mod frame;
mod message;
mod status;

pub use codec::*;
pub use envelope::*;
pub use frame::*;
pub use message::*;
pub use status::*;
