//! NAV/PnL tracking.

pub mod nav_source;
pub mod state;

pub use nav_source::{HttpNavSource, NavSource};
pub use state::{NavObservation, NavState, NavTracker};
