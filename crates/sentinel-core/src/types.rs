//! Core domain types for the Wallet Sentinel engine.

pub mod correlation;
pub mod events;
pub mod signals;
pub mod wallet;

pub use correlation::*;
pub use events::*;
pub use signals::*;
pub use wallet::*;

/// Clamp a score into `[0, 1]`, mapping NaN to zero.
pub fn clamp_unit(value: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 1.0)
    }
}
