//! Pluggable analysis units.
//!
//! An analysis unit is one piece of business-rule work (budget pacing,
//! keyword waste, search-term mining, ...) run for a subject over a date
//! range. The execution core never looks inside a unit; it only drives the
//! [`AnalysisUnit`] contract and interprets the [`UnitError`] class.

mod registry;
mod types;

pub use registry::AnalysisRegistry;
pub use types::{AnalysisRequest, AnalysisUnit, UnitError, UnitResult};
