//! Structured Output Parser
//!
//! Best-effort conversion of tool stdout into JSON records. Tried in order:
//! 1. the whole output as one JSON document
//! 2. JSON lines (object lines only)
//! 3. a per-tool parser keyed by executable name
//! 4. one `{"line": ...}` record per non-empty line

use std::collections::HashMap;
use std::path::Path;

use log::debug;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{json, Value};

/// Parses a tool's stdout into records.
pub type ToolParser = fn(&str) -> Vec<Value>;

/// Records extracted from stdout, with the name of the parser that won.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedOutput {
    pub parser: String,
    pub records: Vec<Value>,
}

static NMAP_PORT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(\d+)/(tcp|udp)\s+(open|closed|filtered)\s+(\S+)(?:\s+(.+))?")
        .expect("nmap port pattern is valid")
});

/// Dispatches stdout to the JSON detectors and per-tool parsers.
#[derive(Debug, Clone)]
pub struct OutputParser {
    tools: HashMap<String, ToolParser>,
}

impl Default for OutputParser {
    fn default() -> Self {
        let mut parser = Self {
            tools: HashMap::new(),
        };
        parser.register_parser("subfinder", parse_subfinder);
        parser.register_parser("nmap", parse_nmap);
        parser.register_parser("naabu", parse_naabu);
        parser.register_parser("httpx", parse_url_lines);
        parser.register_parser("nuclei", parse_url_lines);
        parser
    }
}

impl OutputParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers (or replaces) the parser for a tool name.
    pub fn register_parser(&mut self, tool: impl Into<String>, parser: ToolParser) {
        self.tools.insert(tool.into(), parser);
    }

    pub fn has_parser(&self, tool: &str) -> bool {
        self.tools.contains_key(tool_name(tool))
    }

    /// Parses `stdout` produced by `tool`.
    pub fn parse(&self, tool: &str, stdout: &str) -> ParsedOutput {
        let trimmed = stdout.trim();
        if trimmed.is_empty() {
            return ParsedOutput {
                parser: "lines".to_string(),
                records: Vec::new(),
            };
        }

        if let Ok(document) = serde_json::from_str::<Value>(trimmed) {
            let records = match document {
                Value::Array(items) => items,
                Value::Object(_) => vec![document],
                scalar => vec![json!({ "value": scalar })],
            };
            return ParsedOutput {
                parser: "json".to_string(),
                records,
            };
        }

        let objects = json_object_lines(trimmed);
        if !objects.is_empty() {
            return ParsedOutput {
                parser: "jsonl".to_string(),
                records: objects,
            };
        }

        let name = tool_name(tool);
        if let Some(parser) = self.tools.get(name) {
            let records = parser(stdout);
            if !records.is_empty() {
                debug!("Parsed {} record(s) with builtin '{}' parser", records.len(), name);
                return ParsedOutput {
                    parser: format!("builtin:{}", name),
                    records,
                };
            }
        }

        ParsedOutput {
            parser: "lines".to_string(),
            records: non_empty_lines(stdout)
                .map(|line| json!({ "line": line }))
                .collect(),
        }
    }
}

/// Executable base name, so `/opt/bin/nmap` finds the `nmap` parser.
fn tool_name(tool: &str) -> &str {
    Path::new(tool.trim())
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or(tool)
}

fn non_empty_lines(text: &str) -> impl Iterator<Item = &str> {
    text.lines().map(str::trim).filter(|line| !line.is_empty())
}

fn json_object_lines(text: &str) -> Vec<Value> {
    non_empty_lines(text)
        .filter_map(|line| serde_json::from_str::<Value>(line).ok())
        .filter(Value::is_object)
        .collect()
}

fn parse_subfinder(stdout: &str) -> Vec<Value> {
    non_empty_lines(stdout)
        .map(|line| json!({ "subdomain": line }))
        .collect()
}

fn parse_nmap(stdout: &str) -> Vec<Value> {
    stdout
        .lines()
        .filter_map(|line| NMAP_PORT.captures(line.trim()))
        .filter_map(|caps| {
            let port: u32 = caps.get(1)?.as_str().parse().ok()?;
            let mut record = json!({
                "port": port,
                "protocol": caps.get(2)?.as_str(),
                "state": caps.get(3)?.as_str(),
                "service": caps.get(4)?.as_str(),
            });
            if let Some(version) = caps.get(5) {
                record["version"] = Value::String(version.as_str().trim().to_string());
            }
            Some(record)
        })
        .collect()
}

fn parse_naabu(stdout: &str) -> Vec<Value> {
    non_empty_lines(stdout)
        .filter_map(|line| {
            let (host, port) = line.rsplit_once(':')?;
            let port: u32 = port.trim().parse().ok()?;
            Some(json!({ "host": host, "port": port }))
        })
        .collect()
}

fn parse_url_lines(stdout: &str) -> Vec<Value> {
    non_empty_lines(stdout)
        .map(|line| match serde_json::from_str::<Value>(line) {
            Ok(value) if value.is_object() => value,
            _ => json!({ "url": line }),
        })
        .collect()
}
