//! Request and response bodies of the control API

pub mod extensions;
pub mod system;

pub use extensions::*;
pub use system::*;
