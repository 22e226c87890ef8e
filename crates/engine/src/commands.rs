//! Workflow command protocol: the `GITHUB_OUTPUT` / `GITHUB_ENV` side
//! channel files and `::level::message` annotation lines.

use std::collections::BTreeMap;
use std::path::Path;

use once_cell::sync::Lazy;
use regex::Regex;

use crate::annotation::{Annotation, AnnotationLevel};
use crate::error::EngineResult;

/// Matches `::notice file=a.rs,line=3::message` and the bare
/// `::warning::message` form. Properties end at the first `::`.
static ANNOTATION_LINE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^::(notice|warning|error)(?:\s+(.*?))?::(.*)$").expect("valid regex")
});

struct OpenHeredoc {
    key: String,
    delimiter: String,
    value: String,
}

impl OpenHeredoc {
    fn commit(mut self, values: &mut BTreeMap<String, String>) {
        if self.value.ends_with('\n') {
            self.value.pop();
            if self.value.ends_with('\r') {
                self.value.pop();
            }
        }
        values.insert(self.key, self.value);
    }
}

/// Parse a side channel file written by a step.
///
/// Lines are `key=value` or open a heredoc with `key<<DELIM`. Heredoc lines
/// are kept verbatim until a line equal to `DELIM`; an unterminated heredoc
/// keeps whatever was read before end of file.
pub fn parse_file_commands(text: &str) -> BTreeMap<String, String> {
    let mut values = BTreeMap::new();
    let mut open: Option<OpenHeredoc> = None;

    for line in text.split_inclusive('\n') {
        let bare = line.trim_end_matches('\n').trim_end_matches('\r');

        if let Some(heredoc) = open.as_mut() {
            if bare == heredoc.delimiter {
                if let Some(heredoc) = open.take() {
                    heredoc.commit(&mut values);
                }
            } else {
                heredoc.value.push_str(line);
            }
            continue;
        }

        if bare.is_empty() {
            continue;
        }

        match (bare.find('='), bare.find("<<")) {
            (Some(eq), Some(hd)) if hd < eq => {
                open = Some(open_heredoc(bare, hd));
            }
            (None, Some(hd)) => {
                open = Some(open_heredoc(bare, hd));
            }
            (Some(eq), _) => {
                values.insert(bare[..eq].to_string(), bare[eq + 1..].to_string());
            }
            (None, None) => {
                tracing::warn!(line = %bare, "Ignoring malformed workflow command line");
            }
        }
    }

    if let Some(heredoc) = open {
        tracing::warn!(key = %heredoc.key, "Heredoc not terminated before end of file");
        heredoc.commit(&mut values);
    }

    values
}

fn open_heredoc(line: &str, at: usize) -> OpenHeredoc {
    OpenHeredoc {
        key: line[..at].to_string(),
        delimiter: line[at + 2..].to_string(),
        value: String::new(),
    }
}

/// Read and parse a side channel file. A missing file yields no values.
pub async fn read_file_commands(path: &Path) -> EngineResult<BTreeMap<String, String>> {
    match tokio::fs::read_to_string(path).await {
        Ok(text) => Ok(parse_file_commands(&text)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(BTreeMap::new()),
        Err(e) => Err(e.into()),
    }
}

/// Extract annotations from captured console output.
pub fn parse_annotations(console: &str) -> Vec<Annotation> {
    console
        .lines()
        .filter_map(|line| {
            let captures = ANNOTATION_LINE.captures(line.trim_end_matches('\r'))?;
            let level = AnnotationLevel::from_command(&captures[1])?;
            let mut annotation = Annotation::new(level, unescape_data(&captures[3]));
            if let Some(properties) = captures.get(2) {
                for property in properties.as_str().split(',') {
                    if let Some((key, value)) = property.split_once('=') {
                        apply_property(&mut annotation, key.trim(), &unescape_property(value));
                    }
                }
            }
            Some(annotation)
        })
        .collect()
}

fn apply_property(annotation: &mut Annotation, key: &str, value: &str) {
    match camel_to_snake(key).as_str() {
        "file" | "path" => annotation.path = value.to_string(),
        "title" => annotation.title = value.to_string(),
        "line" => annotation.line = value.parse().ok(),
        "end_line" => annotation.end_line = value.parse().ok(),
        "col" => annotation.col = value.parse().ok(),
        "end_column" => annotation.end_column = value.parse().ok(),
        other => tracing::debug!(property = %other, "Ignoring unknown annotation property"),
    }
}

/// `endLine` → `end_line`.
pub fn camel_to_snake(name: &str) -> String {
    let mut out = String::with_capacity(name.len() + 4);
    for (i, c) in name.chars().enumerate() {
        if c.is_ascii_uppercase() {
            if i > 0 {
                out.push('_');
            }
            out.push(c.to_ascii_lowercase());
        } else {
            out.push(c);
        }
    }
    out
}

fn unescape_data(message: &str) -> String {
    message
        .replace("%0D", "\r")
        .replace("%0A", "\n")
        .replace("%25", "%")
}

fn unescape_property(value: &str) -> String {
    value
        .replace("%0D", "\r")
        .replace("%0A", "\n")
        .replace("%3A", ":")
        .replace("%2C", ",")
        .replace("%25", "%")
}
