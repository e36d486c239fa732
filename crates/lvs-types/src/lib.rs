//! Foundation types for the Large Value Store (LVS).
//!
//! This crate provides the identifiers and small value types shared by the
//! block cache and the large-buffer tree. Every other LVS crate depends on
//! `lvs-types`.
//!
//! # Key Types
//!
//! - [`BlockId`] -- Identifier of a fixed-size storage block
//! - [`BlockSize`] -- Usable byte capacity of one block
//! - [`BlockMagic`] -- Four-byte format tag stamped at the start of a block
//! - [`Access`] -- Shared-read or exclusive-write lock mode

pub mod access;
pub mod block;
pub mod error;

pub use access::Access;
pub use block::{BlockId, BlockMagic, BlockSize};
pub use error::TypeError;
