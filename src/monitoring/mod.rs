//! Monitoring Module
//!
//! Per-run execution timeline used for timing reports.
//!
//! # Components
//!
//! - [`ExecutionTimeline`]: instance start/end timing for Gantt charts
//! - [`TimelineStore`]: timelines of recent runs, bounded by retention

pub mod timeline;

pub use timeline::{EventType, ExecutionTimeline, TimelineEvent, TimelineStore};
