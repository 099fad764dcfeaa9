pub mod cardinality;
pub mod rate;

pub use cardinality::{Admission, CardinalityGuard};
pub use rate::RateTracker;
