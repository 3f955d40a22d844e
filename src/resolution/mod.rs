//! Market and event resolution reconciliation.

pub mod sweep;

pub use sweep::{ResolutionFailure, ResolutionOptions, ResolutionSummary, ResolutionSweep};
