//! # Fractional Estate
//!
//! Operational glue around the estate engine: daily payout scheduling and a
//! logging notification sink, used by the `estate-engine` binary.
//!
//! The engine itself lives in `estate-core`; PostgreSQL persistence lives in
//! `estate-database`.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, missing_debug_implementations)]

pub mod notifier;
pub mod scheduler;

pub use notifier::LogNotifier;
pub use scheduler::{next_fire, PayoutScheduler};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Build information
pub const BUILD_INFO: &str = concat!("estate-engine v", env!("CARGO_PKG_VERSION"));

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_info() {
        assert!(BUILD_INFO.ends_with(VERSION));
    }
}
