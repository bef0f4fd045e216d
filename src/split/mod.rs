//! Split design - which pool model trains on which samples.

mod design;

pub use design::*;
