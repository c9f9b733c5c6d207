//! Frame broadcast module
//!
//! Streams frame artifacts written by the execution side to the control
//! connection.

mod controller;
mod frames;

pub use controller::*;
pub use frames::*;
