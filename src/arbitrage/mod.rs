pub mod detector;
pub mod tiers;
pub mod types;

pub use detector::detect;
pub use tiers::TierTable;
pub use types::DetectorConfig;
