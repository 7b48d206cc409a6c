//! Shared helpers for the integration suites.

#![allow(dead_code)]

use async_trait::async_trait;
use buildflow::{Action, ActionRunner, BuildError, ExecutionResult, Result};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Start(String),
    End(String),
}

/// How long a mock action keeps its slot.
#[derive(Debug, Clone, Copy)]
pub enum Pace {
    Fixed(Duration),
    /// Uniform between 1ms and the given bound
    Jitter(u64),
    /// Until the run is cancelled
    Hold,
}

/// Stands in for real processes: records start/end order and peak concurrency.
#[derive(Debug)]
pub struct MockRunner {
    pace: Pace,
    failing: HashSet<String>,
    slow: HashMap<String, Duration>,
    events: Mutex<Vec<Event>>,
    current: AtomicUsize,
    peak: AtomicUsize,
}

impl MockRunner {
    pub fn new(pace: Pace) -> Self {
        Self {
            pace,
            failing: HashSet::new(),
            slow: HashMap::new(),
            events: Mutex::new(Vec::new()),
            current: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }

    /// Actions with this name exit with code 1.
    pub fn failing(mut self, name: &str) -> Self {
        self.failing.insert(name.to_string());
        self
    }

    /// Actions with this name take `duration` regardless of the pace.
    pub fn slow(mut self, name: &str, duration: Duration) -> Self {
        self.slow.insert(name.to_string(), duration);
        self
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    pub fn started(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                Event::Start(name) => Some(name),
                Event::End(_) => None,
            })
            .collect()
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    pub fn position(&self, event: &Event) -> usize {
        self.events()
            .iter()
            .position(|e| e == event)
            .unwrap_or_else(|| panic!("{:?} never happened", event))
    }
}

#[async_trait]
impl ActionRunner for MockRunner {
    async fn run(&self, action: &Action, cancel: &CancellationToken) -> Result<ExecutionResult> {
        self.events
            .lock()
            .unwrap()
            .push(Event::Start(action.name.clone()));
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);

        let wait = match self.slow.get(&action.name) {
            Some(d) => Some(*d),
            None => match self.pace {
                Pace::Fixed(d) => Some(d),
                Pace::Jitter(max) => Some(Duration::from_millis(fastrand::u64(1..=max))),
                Pace::Hold => None,
            },
        };
        let cancelled = match wait {
            Some(d) => tokio::select! {
                _ = tokio::time::sleep(d) => false,
                _ = cancel.cancelled() => true,
            },
            None => {
                cancel.cancelled().await;
                true
            }
        };

        self.current.fetch_sub(1, Ordering::SeqCst);
        self.events
            .lock()
            .unwrap()
            .push(Event::End(action.name.clone()));

        if cancelled {
            return Err(BuildError::cancelled(action.name.clone()));
        }
        Ok(ExecutionResult {
            exit_code: if self.failing.contains(&action.name) { 1 } else { 0 },
            output: vec![format!("{} done", action.name)],
            duration: wait.unwrap_or_default(),
            processor_time: None,
            description: None,
        })
    }
}
