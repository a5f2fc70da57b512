//! Execution Trace
//!
//! Records when each step starts, completes, fails, pauses or is rolled back.
//! The trace travels with the outcome and is persisted inside pause
//! snapshots, so a resumed run reports the full history.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::recipe::StepId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TraceEventKind {
    Started,
    Completed,
    Failed,
    Paused,
    RolledBack,
}

/// A single event in the trace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceEvent {
    pub step: StepId,
    pub kind: TraceEventKind,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Trace {
    events: Vec<TraceEvent>,
}

impl Trace {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, step: &StepId, kind: TraceEventKind) {
        self.events.push(TraceEvent {
            step: step.clone(),
            kind,
            at: Utc::now(),
        });
    }

    pub fn events(&self) -> &[TraceEvent] {
        &self.events
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Steps in the order they started. A step that paused and was resumed
    /// appears twice.
    pub fn started(&self) -> Vec<&StepId> {
        self.events
            .iter()
            .filter(|e| e.kind == TraceEventKind::Started)
            .map(|e| &e.step)
            .collect()
    }

    /// Steps in the order they completed.
    pub fn completed(&self) -> Vec<&StepId> {
        self.events
            .iter()
            .filter(|e| e.kind == TraceEventKind::Completed)
            .map(|e| &e.step)
            .collect()
    }

    /// Milliseconds between each step's last start and its end event.
    pub fn durations(&self) -> BTreeMap<StepId, i64> {
        let mut starts: BTreeMap<&StepId, DateTime<Utc>> = BTreeMap::new();
        let mut durations = BTreeMap::new();

        for event in &self.events {
            match event.kind {
                TraceEventKind::Started => {
                    starts.insert(&event.step, event.at);
                }
                TraceEventKind::Completed | TraceEventKind::Failed | TraceEventKind::Paused => {
                    if let Some(start) = starts.get(&event.step) {
                        durations.insert(
                            event.step.clone(),
                            (event.at - *start).num_milliseconds(),
                        );
                    }
                }
                TraceEventKind::RolledBack => {}
            }
        }

        durations
    }
}
