//! Per-question run records
//!
//! Every processed question leaves one record behind: the route it
//! took, the query that ran, how long it took and what came out.
//! Records accumulate in memory for inspection after a batch run.

use std::sync::Mutex;

use serde::Serialize;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize)]
pub struct RunLog {
    pub run_id: String,
    pub question_id: String,
    pub route: Option<String>,
    pub sql: Option<String>,
    pub attempts: u32,
    pub success: bool,
    pub confidence: f64,
    pub elapsed_ms: u64,
    pub trace: Vec<String>,
    pub timestamp: i64,
}

impl RunLog {
    pub fn new(question_id: impl Into<String>) -> Self {
        RunLog {
            run_id: Uuid::new_v4().to_string(),
            question_id: question_id.into(),
            route: None,
            sql: None,
            attempts: 0,
            success: false,
            confidence: 0.0,
            elapsed_ms: 0,
            trace: Vec::new(),
            timestamp: chrono::Utc::now().timestamp(),
        }
    }

    pub fn with_route(mut self, route: &str) -> Self {
        self.route = Some(route.to_string());
        self
    }

    pub fn with_sql(mut self, sql: Option<String>) -> Self {
        self.sql = sql;
        self
    }

    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts;
        self
    }

    pub fn with_outcome(mut self, success: bool, confidence: f64) -> Self {
        self.success = success;
        self.confidence = confidence;
        self
    }

    pub fn with_elapsed(mut self, elapsed_ms: u64) -> Self {
        self.elapsed_ms = elapsed_ms;
        self
    }

    pub fn with_trace(mut self, trace: Vec<String>) -> Self {
        self.trace = trace;
        self
    }
}

/// In-memory collection of run records, shared across workers.
#[derive(Debug, Default)]
pub struct RunLogStore {
    logs: Mutex<Vec<RunLog>>,
}

impl RunLogStore {
    pub fn new() -> Self {
        RunLogStore {
            logs: Mutex::new(Vec::new()),
        }
    }

    pub fn add(&self, log: RunLog) {
        self.logs.lock().unwrap().push(log);
    }

    pub fn all(&self) -> Vec<RunLog> {
        self.logs.lock().unwrap().clone()
    }

    pub fn for_question(&self, question_id: &str) -> Vec<RunLog> {
        self.logs
            .lock()
            .unwrap()
            .iter()
            .filter(|log| log.question_id == question_id)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.logs.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
