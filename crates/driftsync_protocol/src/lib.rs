//! # DriftSync Protocol
//!
//! Wire frame envelope and CRUD record types for DriftSync.
//!
//! This crate provides:
//! - `Frame` and `FrameDecoder` for the server change stream envelope
//! - `CrudEntry` and `CrudTransaction` for pending local mutations
//! - `CrudOp` numeric codes for adapters that persist entries
//!
//! This is a pure protocol crate with no I/O operations. Change record
//! payloads inside a frame are opaque bytes; only the envelope (frame
//! kind and length) is decoded here.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod crud;
mod frame;

pub use crud::{CrudEntry, CrudOp, CrudTransaction};
pub use frame::{Frame, FrameDecoder, FrameError, FrameKind, MAX_FRAME_LEN};
