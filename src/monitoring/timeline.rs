//! Execution Timeline
//!
//! Records when each state instance of a run starts, pauses, resumes and
//! finishes, for timing reports and the CLI's Gantt chart.

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::{Duration, Instant};

/// Kind of timeline event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    Started,
    Completed,
    Failed,
    Paused,
    Resumed,
    Aborted,
}

impl EventType {
    /// Whether the event closes an instance's bar.
    pub fn is_end(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Aborted)
    }
}

#[derive(Debug, Clone)]
pub struct TimelineEvent {
    /// Instance label, `state` or `state[index]` for repeat children
    pub label: String,
    pub event_type: EventType,
    pub timestamp: Instant,
}

/// Timeline of one workflow run.
#[derive(Debug, Clone)]
pub struct ExecutionTimeline {
    events: Vec<TimelineEvent>,
    start_time: Instant,
}

impl ExecutionTimeline {
    pub fn new() -> Self {
        Self {
            events: Vec::new(),
            start_time: Instant::now(),
        }
    }

    pub fn add_event(&mut self, label: impl Into<String>, event_type: EventType) {
        self.events.push(TimelineEvent {
            label: label.into(),
            event_type,
            timestamp: Instant::now(),
        });
    }

    pub fn get_events(&self) -> &[TimelineEvent] {
        &self.events
    }

    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    fn offset(&self, event: &TimelineEvent) -> u128 {
        event.timestamp.duration_since(self.start_time).as_millis()
    }

    /// Start and end offsets in milliseconds of every finished instance,
    /// ordered by start. A retried instance keeps its last attempt.
    fn spans(&self) -> Vec<(String, u128, u128)> {
        let mut open: HashMap<&str, u128> = HashMap::new();
        let mut closed: HashMap<&str, (u128, u128)> = HashMap::new();

        for event in &self.events {
            let at = self.offset(event);
            match event.event_type {
                EventType::Started => {
                    open.insert(&event.label, at);
                }
                kind if kind.is_end() => {
                    // Instances aborted before starting have no bar
                    if let Some(start) = open.remove(event.label.as_str()) {
                        closed.insert(&event.label, (start, at));
                    }
                }
                _ => {}
            }
        }

        let mut spans: Vec<(String, u128, u128)> = closed
            .into_iter()
            .map(|(label, (start, end))| (label.to_string(), start, end))
            .collect();
        spans.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
        spans
    }

    /// Renders an ASCII Gantt chart scaled to 50 columns.
    pub fn gantt_chart(&self) -> String {
        let mut output = String::from("\nExecution Timeline:\n\n");

        let total = self.elapsed().as_millis();
        if total == 0 {
            return output;
        }
        let scale = 50.0 / total as f64;

        for (label, start, end) in self.spans() {
            let offset = (start as f64 * scale) as usize;
            let width = ((end - start) as f64 * scale).max(1.0) as usize;

            let mut bar = " ".repeat(offset);
            bar.push_str(&"#".repeat(width));
            output.push_str(&format!(
                "{} |{:<50}| ({} ms)\n",
                truncate(&label, 16),
                bar,
                end - start
            ));
        }

        output.push_str(&format!("\nTotal: {} ms\n", total));
        output
    }

    /// Duration in milliseconds of every finished instance.
    pub fn get_durations(&self) -> HashMap<String, u128> {
        self.spans()
            .into_iter()
            .map(|(label, start, end)| (label, end - start))
            .collect()
    }
}

impl Default for ExecutionTimeline {
    fn default() -> Self {
        Self::new()
    }
}

/// Timelines of the most recent runs.
///
/// Once more than `retention` runs are held, the oldest finished ones are
/// dropped. Runs still in progress are never evicted.
#[derive(Debug)]
pub struct TimelineStore {
    timelines: HashMap<String, ExecutionTimeline>,
    order: VecDeque<String>,
    finished: HashSet<String>,
    retention: usize,
}

impl TimelineStore {
    pub fn new(retention: usize) -> Self {
        Self {
            timelines: HashMap::new(),
            order: VecDeque::new(),
            finished: HashSet::new(),
            retention: retention.max(1),
        }
    }

    /// Opens an empty timeline for a run.
    pub fn start(&mut self, run_id: &str) {
        if self.timelines.contains_key(run_id) {
            return;
        }
        self.timelines.insert(run_id.to_string(), ExecutionTimeline::new());
        self.order.push_back(run_id.to_string());
        self.evict();
    }

    pub fn record(&mut self, run_id: &str, label: impl Into<String>, event_type: EventType) {
        if !self.timelines.contains_key(run_id) {
            self.start(run_id);
        }
        self.finished.remove(run_id);
        if let Some(timeline) = self.timelines.get_mut(run_id) {
            timeline.add_event(label, event_type);
        }
    }

    /// Marks a run's timeline as evictable.
    pub fn finish(&mut self, run_id: &str) {
        if self.timelines.contains_key(run_id) {
            self.finished.insert(run_id.to_string());
            self.evict();
        }
    }

    pub fn get(&self, run_id: &str) -> Option<&ExecutionTimeline> {
        self.timelines.get(run_id)
    }

    pub fn len(&self) -> usize {
        self.timelines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timelines.is_empty()
    }

    fn evict(&mut self) {
        while self.timelines.len() > self.retention {
            let Some(position) = self.order.iter().position(|id| self.finished.contains(id)) else {
                return;
            };
            if let Some(run_id) = self.order.remove(position) {
                self.finished.remove(&run_id);
                self.timelines.remove(&run_id);
            }
        }
    }
}

/// Pads or shortens a label to exactly `width` characters.
fn truncate(s: &str, width: usize) -> String {
    let count = s.chars().count();
    if count <= width {
        format!("{:width$}", s, width = width)
    } else {
        let kept: String = s.chars().take(width.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_add_events() {
        let mut timeline = ExecutionTimeline::new();
        timeline.add_event("build", EventType::Started);
        timeline.add_event("build", EventType::Completed);

        assert_eq!(timeline.get_events().len(), 2);
        assert_eq!(timeline.get_events()[1].event_type, EventType::Completed);
    }

    #[test]
    fn test_durations_only_for_finished() {
        let mut timeline = ExecutionTimeline::new();
        timeline.add_event("deploy[0]", EventType::Started);
        thread::sleep(Duration::from_millis(30));
        timeline.add_event("deploy[0]", EventType::Completed);
        timeline.add_event("deploy[1]", EventType::Started);

        let durations = timeline.get_durations();
        assert!(durations["deploy[0]"] >= 30);
        assert!(!durations.contains_key("deploy[1]"));
    }

    #[test]
    fn test_pause_does_not_end_bar() {
        let mut timeline = ExecutionTimeline::new();
        timeline.add_event("wait", EventType::Started);
        timeline.add_event("wait", EventType::Paused);
        assert!(timeline.get_durations().is_empty());

        timeline.add_event("wait", EventType::Resumed);
        timeline.add_event("wait", EventType::Aborted);
        assert!(timeline.get_durations().contains_key("wait"));
    }

    #[test]
    fn test_abort_before_start_has_no_bar() {
        let mut timeline = ExecutionTimeline::new();
        timeline.add_event("late", EventType::Aborted);
        assert!(timeline.get_durations().is_empty());
    }

    #[test]
    fn test_gantt_chart_lists_instances() {
        let mut timeline = ExecutionTimeline::new();
        timeline.add_event("build", EventType::Started);
        thread::sleep(Duration::from_millis(20));
        timeline.add_event("build", EventType::Completed);
        timeline.add_event("a-very-long-state-name", EventType::Started);
        thread::sleep(Duration::from_millis(20));
        timeline.add_event("a-very-long-state-name", EventType::Failed);

        let chart = timeline.gantt_chart();
        assert!(chart.contains("build"));
        assert!(chart.contains("a-very-long-s..."));
        assert!(chart.contains("Total:"));
    }

    #[test]
    fn test_gantt_chart_empty() {
        let chart = ExecutionTimeline::default().gantt_chart();
        assert!(chart.contains("Timeline"));
        assert!(!chart.contains('#'));
    }

    #[test]
    fn test_store_evicts_oldest_finished() {
        let mut store = TimelineStore::new(2);
        for run in ["r1", "r2", "r3"] {
            store.start(run);
            store.record(run, "build", EventType::Started);
        }
        // Nothing finished yet, so nothing can go
        assert_eq!(store.len(), 3);

        store.finish("r2");
        assert_eq!(store.len(), 2);
        assert!(store.get("r2").is_none());
        assert!(store.get("r1").is_some());

        store.finish("r1");
        store.finish("r3");
        store.start("r4");
        assert_eq!(store.len(), 2);
        assert!(store.get("r1").is_none());
        assert!(store.get("r3").is_some());
        assert!(store.get("r4").is_some());
    }

    #[test]
    fn test_store_record_reopens_finished_run() {
        let mut store = TimelineStore::new(1);
        store.start("r1");
        store.finish("r1");
        store.record("r1", "retry", EventType::Started);
        store.start("r2");

        // r1 became active again and is kept
        assert_eq!(store.len(), 2);
        assert_eq!(store.get("r1").map(|t| t.get_events().len()), Some(1));
    }

    #[test]
    fn test_event_type_ends() {
        assert!(EventType::Aborted.is_end());
        assert!(!EventType::Paused.is_end());
        assert!(!EventType::Started.is_end());
    }
}
