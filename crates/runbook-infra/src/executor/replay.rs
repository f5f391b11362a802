//! Deterministic replay executor.
//!
//! Answers every command and tool request from a recorded scenario instead
//! of touching real systems. Responses are matched per request key
//! (`command:<rendered command>` or `tool:<name>`) in recorded order; a
//! request with nothing left to answer it fails the step. Timestamps in
//! replayed output shift by the time elapsed since the recording, so
//! time-based conditions see the same relative ages they saw live.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, SecondsFormat, TimeDelta, Utc};
use runbook_core::runbook::executor::{
    CommandOutput, CommandRequest, ExecutionError, StepExecutor, ToolOutput, ToolRequest,
};
use runbook_types::scenario::{RecordedExchange, RecordedInput, Scenario};
use serde_json::Value;

/// `StepExecutor` over a recorded scenario.
pub struct ReplayExecutor {
    exchanges: Mutex<HashMap<String, VecDeque<RecordedExchange>>>,
    inputs: Mutex<HashMap<String, VecDeque<RecordedInput>>>,
    shift: TimeDelta,
}

impl ReplayExecutor {
    /// Build from `scenario`, skipping what the run already consumed in
    /// earlier requests.
    pub fn new(
        scenario: &Scenario,
        consumed_exchanges: &[RecordedExchange],
        consumed_inputs: &[RecordedInput],
    ) -> Self {
        let mut exchanges: HashMap<String, VecDeque<RecordedExchange>> = HashMap::new();
        for exchange in &scenario.exchanges {
            exchanges
                .entry(exchange.key.clone())
                .or_default()
                .push_back(exchange.clone());
        }
        for consumed in consumed_exchanges {
            if let Some(queue) = exchanges.get_mut(&consumed.key) {
                queue.pop_front();
            }
        }

        let mut inputs: HashMap<String, VecDeque<RecordedInput>> = HashMap::new();
        for input in &scenario.inputs {
            inputs
                .entry(input.step_id.clone())
                .or_default()
                .push_back(input.clone());
        }
        for consumed in consumed_inputs {
            if let Some(queue) = inputs.get_mut(&consumed.step_id) {
                queue.pop_front();
            }
        }

        Self {
            exchanges: Mutex::new(exchanges),
            inputs: Mutex::new(inputs),
            shift: Utc::now() - scenario.recorded_at,
        }
    }

    /// Override the timestamp shift.
    pub fn with_shift(mut self, shift: TimeDelta) -> Self {
        self.shift = shift;
        self
    }

    /// Exchanges not yet replayed.
    pub fn remaining(&self) -> usize {
        lock(&self.exchanges).values().map(VecDeque::len).sum()
    }

    fn next_exchange(&self, key: &str, step_id: &str) -> Result<RecordedExchange, ExecutionError> {
        lock(&self.exchanges)
            .get_mut(key)
            .and_then(VecDeque::pop_front)
            .ok_or_else(|| {
                tracing::warn!(key = %key, step_id = %step_id, "no recorded response");
                ExecutionError::NoRecordedResponse {
                    key: key.to_string(),
                    step_id: step_id.to_string(),
                }
            })
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl StepExecutor for ReplayExecutor {
    fn run_command<'a>(
        &'a self,
        request: &'a CommandRequest,
    ) -> Pin<Box<dyn Future<Output = Result<CommandOutput, ExecutionError>> + Send + 'a>> {
        Box::pin(async move {
            let exchange = self.next_exchange(&request.key(), &request.step_id)?;
            Ok(CommandOutput {
                stdout: rebase_timestamps(&exchange.stdout, self.shift),
                stderr: rebase_timestamps(&exchange.stderr, self.shift),
                exit_code: exchange.exit_code,
            })
        })
    }

    fn run_tool<'a>(
        &'a self,
        request: &'a ToolRequest,
    ) -> Pin<Box<dyn Future<Output = Result<ToolOutput, ExecutionError>> + Send + 'a>> {
        Box::pin(async move {
            let exchange = self.next_exchange(&request.key(), &request.step_id)?;
            Ok(ToolOutput {
                output: rebase_value(exchange.output.unwrap_or(Value::Null), self.shift),
                success: exchange.success,
            })
        })
    }

    fn recorded_input(&self, step_id: &str) -> Option<RecordedInput> {
        lock(&self.inputs)
            .get_mut(step_id)
            .and_then(VecDeque::pop_front)
    }
}

// ---------------------------------------------------------------------------
// Timestamp rebasing
// ---------------------------------------------------------------------------

/// Shift every RFC 3339 timestamp in `text` by `shift`, keeping its offset.
pub fn rebase_timestamps(text: &str, shift: TimeDelta) -> String {
    if shift == TimeDelta::zero() {
        return text.to_string();
    }
    let bytes = text.as_bytes();
    let mut out = String::with_capacity(text.len());
    let mut last = 0;
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i].is_ascii_digit() {
            if let Some(len) = timestamp_len(&bytes[i..]) {
                let candidate = &text[i..i + len];
                if let Ok(parsed) = DateTime::parse_from_rfc3339(candidate) {
                    let use_z = candidate.ends_with(['Z', 'z']);
                    out.push_str(&text[last..i]);
                    out.push_str(&(parsed + shift).to_rfc3339_opts(SecondsFormat::AutoSi, use_z));
                    i += len;
                    last = i;
                    continue;
                }
            }
        }
        i += 1;
    }
    out.push_str(&text[last..]);
    out
}

fn rebase_value(value: Value, shift: TimeDelta) -> Value {
    match value {
        Value::String(s) => Value::String(rebase_timestamps(&s, shift)),
        Value::Array(items) => Value::Array(
            items
                .into_iter()
                .map(|item| rebase_value(item, shift))
                .collect(),
        ),
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(k, v)| (k, rebase_value(v, shift)))
                .collect(),
        ),
        other => other,
    }
}

/// Length of an RFC 3339 timestamp at the start of `b`, if one is there.
fn timestamp_len(b: &[u8]) -> Option<usize> {
    const SHAPE: &[u8] = b"dddd-dd-ddTdd:dd:dd";
    if b.len() < SHAPE.len() {
        return None;
    }
    for (c, s) in b.iter().zip(SHAPE) {
        let ok = match s {
            b'd' => c.is_ascii_digit(),
            b'T' => matches!(c, b'T' | b't'),
            sep => c == sep,
        };
        if !ok {
            return None;
        }
    }

    let mut n = SHAPE.len();
    if b.get(n) == Some(&b'.') {
        let digits = b[n + 1..].iter().take_while(|c| c.is_ascii_digit()).count();
        if digits == 0 {
            return None;
        }
        n += 1 + digits;
    }

    match b.get(n) {
        Some(b'Z' | b'z') => Some(n + 1),
        Some(b'+' | b'-') => {
            let zone = b.get(n + 1..n + 6)?;
            let ok = zone[0].is_ascii_digit()
                && zone[1].is_ascii_digit()
                && zone[2] == b':'
                && zone[3].is_ascii_digit()
                && zone[4].is_ascii_digit();
            ok.then_some(n + 6)
        }
        _ => None,
    }
}
