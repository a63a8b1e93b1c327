// JSON results of the loopstim commands
//
// Every command prints one JSON document: a session file, a validation result,
// post-pass reports or a run summary. A document that cannot be rendered or
// written is reported on stderr and turns into EXECUTION_ERROR.

use crate::exit_codes;
use serde::Serialize;
use std::io::Write;

/// Where a command's JSON document goes
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonSink<'a> {
    pub compact: bool,
    /// Written to this file instead of stdout
    pub file: Option<&'a str>,
}

impl<'a> JsonSink<'a> {
    pub fn stdout(compact: bool) -> Self {
        Self {
            compact,
            file: None,
        }
    }

    pub fn render<T: Serialize>(&self, value: &T) -> serde_json::Result<String> {
        if self.compact {
            serde_json::to_string(value)
        } else {
            serde_json::to_string_pretty(value)
        }
    }

    /// Write `value` and return the command's exit code
    pub fn emit<T: Serialize>(&self, value: &T) -> i32 {
        let written = self
            .render(value)
            .map_err(|e| format!("JSON serialization failed: {}", e))
            .and_then(|json| self.write(&json));
        match written {
            Ok(()) => exit_codes::SUCCESS,
            Err(e) => {
                eprintln!("Error: {}", e);
                exit_codes::EXECUTION_ERROR
            }
        }
    }

    fn write(&self, json: &str) -> Result<(), String> {
        match self.file {
            Some(path) => std::fs::write(path, json)
                .map_err(|e| format!("Failed to write output file '{}': {}", path, e)),
            None => {
                let mut stdout = std::io::stdout().lock();
                writeln!(stdout, "{}", json).map_err(|e| format!("Failed to write to stdout: {}", e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compact_and_pretty_render() {
        let value = serde_json::json!({"rows": 40, "frequency": 5.0});
        let compact = JsonSink::stdout(true).render(&value).unwrap();
        assert!(!compact.contains('\n'));
        let pretty = JsonSink::stdout(false).render(&value).unwrap();
        assert!(pretty.contains("\n  \"rows\": 40"));
    }

    #[test]
    fn test_emit_to_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("summary.json");
        let path = path.to_str().unwrap();
        let sink = JsonSink {
            compact: true,
            file: Some(path),
        };
        assert_eq!(sink.emit(&vec![1, 2, 3]), exit_codes::SUCCESS);
        assert_eq!(std::fs::read_to_string(path).unwrap(), "[1,2,3]");
    }

    #[test]
    fn test_unwritable_file_is_execution_error() {
        let sink = JsonSink {
            compact: false,
            file: Some("/nonexistent/dir/summary.json"),
        };
        assert_eq!(sink.emit(&"x"), exit_codes::EXECUTION_ERROR);
    }
}
