//! End-to-end tests: a real proxy on a loopback port, real origins behind
//! it, and plain TCP clients configured to use it.
pub mod mock;

#[cfg(test)]
mod tests;

pub const BUFFER_SIZE: usize = 4096;
