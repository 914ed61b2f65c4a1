//! ResourceSlice lifecycle: status aggregation into the Composition and
//! cleanup of slices no attempt references anymore.

pub mod aggregator;
pub mod cleaner;

pub use aggregator::CONTROLLER_ID as AGGREGATOR_CONTROLLER_ID;
pub use cleaner::CONTROLLER_ID as CLEANER_CONTROLLER_ID;
