pub mod params;
pub mod usage;

pub use params::{TransformedMessages, normalize_params, transform_messages};
pub use usage::{CostBreakdown, Usage, calculate_cost, normalize_usage};
