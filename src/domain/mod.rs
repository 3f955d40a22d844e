pub mod market;
pub mod normalize;

pub use market::*;
pub use normalize::normalize_market;
