//! Shared pieces of the dynamic geometry demo.

pub mod cvar;

pub use cvar::{Cvar, CvarCallback, CvarContext, CvarError, CvarKind, CvarValue};
