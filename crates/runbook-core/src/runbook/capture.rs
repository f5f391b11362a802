//! Capture extraction.
//!
//! A step's `capture` map names values to pull out of what the step
//! produced. Sources:
//!
//! - `stdout`, `stderr` -- trimmed command output
//! - `exit_code` -- command exit status
//! - `output` -- tool result
//! - `json` / `json:<dotted.path>` -- stdout (or tool result) parsed as JSON
//! - `line:<n>` -- zero-based line of stdout
//! - `evidence:<name>` -- operator evidence
//! - `choice` -- operator choice

use std::collections::BTreeMap;

use serde_json::{Value, json};

/// A parsed capture source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptureSource {
    Stdout,
    Stderr,
    ExitCode,
    Output,
    Json(Vec<String>),
    Line(usize),
    Evidence(String),
    Choice,
}

impl CaptureSource {
    pub fn parse(source: &str) -> Option<Self> {
        let source = source.trim();
        match source {
            "stdout" => return Some(CaptureSource::Stdout),
            "stderr" => return Some(CaptureSource::Stderr),
            "exit_code" => return Some(CaptureSource::ExitCode),
            "output" => return Some(CaptureSource::Output),
            "json" => return Some(CaptureSource::Json(Vec::new())),
            "choice" => return Some(CaptureSource::Choice),
            _ => {}
        }

        let (kind, arg) = source.split_once(':')?;
        match kind {
            "json" => Some(CaptureSource::Json(
                arg.split('.')
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect(),
            )),
            "line" => arg.trim().parse().ok().map(CaptureSource::Line),
            "evidence" if !arg.trim().is_empty() => {
                Some(CaptureSource::Evidence(arg.trim().to_string()))
            }
            _ => None,
        }
    }
}

/// Everything a step produced that captures can read.
#[derive(Debug, Clone, Default)]
pub struct StepData {
    pub stdout: Option<String>,
    pub stderr: Option<String>,
    pub exit_code: Option<i32>,
    pub output: Option<Value>,
    pub evidence: BTreeMap<String, Value>,
    pub choice: Option<String>,
}

/// Extract every capture whose source has data; missing data is left out.
pub fn extract_captures(
    capture: &BTreeMap<String, String>,
    data: &StepData,
) -> BTreeMap<String, Value> {
    let mut captured = BTreeMap::new();
    for (name, source) in capture {
        let Some(parsed) = CaptureSource::parse(source) else {
            tracing::warn!(capture = %name, source = %source, "unknown capture source");
            continue;
        };
        match extract_one(&parsed, data) {
            Some(value) => {
                captured.insert(name.clone(), value);
            }
            None => {
                tracing::debug!(capture = %name, source = %source, "capture source produced no data");
            }
        }
    }
    captured
}

fn extract_one(source: &CaptureSource, data: &StepData) -> Option<Value> {
    match source {
        CaptureSource::Stdout => data.stdout.as_deref().map(|s| json!(s.trim())),
        CaptureSource::Stderr => data.stderr.as_deref().map(|s| json!(s.trim())),
        CaptureSource::ExitCode => data.exit_code.map(|c| json!(f64::from(c))),
        CaptureSource::Output => data.output.clone(),
        CaptureSource::Json(path) => {
            let root = match (&data.output, &data.stdout) {
                (Some(output), _) => match output {
                    Value::String(s) => serde_json::from_str(s).ok()?,
                    other => other.clone(),
                },
                (None, Some(stdout)) => serde_json::from_str(stdout.trim()).ok()?,
                (None, None) => return None,
            };
            walk_path(&root, path).cloned()
        }
        CaptureSource::Line(n) => data
            .stdout
            .as_deref()
            .and_then(|s| s.lines().nth(*n))
            .map(|line| json!(line.trim())),
        CaptureSource::Evidence(name) => data.evidence.get(name).cloned(),
        CaptureSource::Choice => data.choice.as_ref().map(|c| json!(c)),
    }
}

fn walk_path<'a>(root: &'a Value, path: &[String]) -> Option<&'a Value> {
    let mut current = root;
    for segment in path {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn capture(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_parse_sources() {
        assert_eq!(CaptureSource::parse("stdout"), Some(CaptureSource::Stdout));
        assert_eq!(
            CaptureSource::parse("json:a.b.0"),
            Some(CaptureSource::Json(vec!["a".into(), "b".into(), "0".into()]))
        );
        assert_eq!(CaptureSource::parse("line:2"), Some(CaptureSource::Line(2)));
        assert_eq!(
            CaptureSource::parse("evidence:log"),
            Some(CaptureSource::Evidence("log".into()))
        );
        assert_eq!(CaptureSource::parse("line:x"), None);
        assert_eq!(CaptureSource::parse("bogus"), None);
        assert_eq!(CaptureSource::parse("evidence:"), None);
    }

    #[test]
    fn test_extract_command_sources() {
        let data = StepData {
            stdout: Some("  first\nsecond \n".to_string()),
            stderr: Some("warn\n".to_string()),
            exit_code: Some(0),
            ..StepData::default()
        };
        let out = extract_captures(
            &capture(&[
                ("all", "stdout"),
                ("err", "stderr"),
                ("code", "exit_code"),
                ("second", "line:1"),
            ]),
            &data,
        );
        assert_eq!(out["all"], json!("first\nsecond"));
        assert_eq!(out["err"], json!("warn"));
        assert_eq!(out["code"], json!(0.0));
        assert_eq!(out["second"], json!("second"));
    }

    #[test]
    fn test_extract_json_path_from_stdout() {
        let data = StepData {
            stdout: Some(r#"{"disk": {"used": "91%"}, "hosts": ["a", "b"]}"#.to_string()),
            ..StepData::default()
        };
        let out = extract_captures(
            &capture(&[("used", "json:disk.used"), ("second", "json:hosts.1")]),
            &data,
        );
        assert_eq!(out["used"], json!("91%"));
        assert_eq!(out["second"], json!("b"));
    }

    #[test]
    fn test_extract_json_prefers_tool_output() {
        let data = StepData {
            stdout: Some("not json".to_string()),
            output: Some(json!({ "status": "ok" })),
            ..StepData::default()
        };
        let out = extract_captures(&capture(&[("status", "json:status")]), &data);
        assert_eq!(out["status"], json!("ok"));
    }

    #[test]
    fn test_missing_data_is_skipped() {
        let data = StepData::default();
        let out = extract_captures(
            &capture(&[("a", "stdout"), ("b", "json:x"), ("c", "evidence:log")]),
            &data,
        );
        assert!(out.is_empty());
    }

    #[test]
    fn test_extract_operator_input() {
        let mut data = StepData {
            choice: Some("restart".to_string()),
            ..StepData::default()
        };
        data.evidence.insert("log".to_string(), json!("oom at 10:02"));
        let out = extract_captures(&capture(&[("pick", "choice"), ("log", "evidence:log")]), &data);
        assert_eq!(out["pick"], json!("restart"));
        assert_eq!(out["log"], json!("oom at 10:02"));
    }
}
