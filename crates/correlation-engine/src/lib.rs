//! Correlation Engine
//!
//! Windowed-stream detectors over on-chain events: the CEX withdrawal to
//! fresh wallet matcher and the cabal cluster detector.

pub mod cabal_detector;
pub mod fresh_matcher;

pub use cabal_detector::{CabalConfig, CabalDetector, ClusterHealth, Demotion};
pub use fresh_matcher::{fractional_digits, FreshWalletMatcher, MatcherConfig};
