//! Conflict-free replicated data types
//!
//! Hand-rolled building blocks for the room document:
//!
//! - [`LwwRegister`]: last-writer-wins scalar keyed on a [`Stamp`](crate::clock::Stamp)
//! - [`Sequence`]: replicated growable array (RGA) for ordered name lists
//!
//! Both merge deterministically regardless of delivery order, and
//! re-applying an operation is a no-op.

mod register;
mod sequence;

pub use register::LwwRegister;
pub use sequence::{Element, Sequence};
