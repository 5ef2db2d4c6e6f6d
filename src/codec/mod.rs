//! Portable value schema and its binary codec.
//!
//! - [`value`] - the [`Value`] model shared by every pool handle
//! - [`wire`] - tagged, length-prefixed encoding used on the segment

pub mod value;
pub mod wire;

pub use value::Value;
pub use wire::{decode, encode, WireError};
