//! Scheduled workload scans: tier partitioning, summary delivery, and
//! alert dedup.

pub mod engine;
pub mod report;

pub use engine::{AlertCondition, ScanEngine, ScanReport};
pub use report::{SummaryPublisher, render_summary};
