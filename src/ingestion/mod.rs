//! Upstream market catalogue access and run date windows.

pub mod gamma;
pub mod source;
pub mod window;

pub use gamma::GammaClient;
pub use source::{MarketFilters, MarketSource};
pub use window::{daily_window_filters, day_bounds, resolve_dates};

#[cfg(test)]
pub use source::MockMarketSource;
