//! # Architecture Abstraction Layer
//!
//! The port boundary of the kernel: initial task frames, the tick source
//! and the context switch handler. The Cortex-M4F port is selected on ARM
//! targets; every other target gets the host port used by the tests.

#[cfg(target_arch = "arm")]
pub mod cortex_m4;
#[cfg(target_arch = "arm")]
pub use cortex_m4::init_stack;

#[cfg(not(target_arch = "arm"))]
mod host;
#[cfg(not(target_arch = "arm"))]
pub use host::init_stack;
