//! `${{ ... }}` template expansion.
//!
//! A template is scanned for `${{` markers; the text up to the next `}}` is
//! parsed as an expression, evaluated against [`Bindings`], and its string
//! form replaces the whole region. Scanning is not brace-aware, so an
//! expression cannot itself contain `}}`.

mod eval;
mod parser;

use std::collections::BTreeMap;

use serde_json::Value;

use crate::error::{EngineError, EngineResult};

pub use eval::{is_truthy, to_display_string};
pub use parser::{parse, Expr};

const OPEN: &str = "${{";
const CLOSE: &str = "}}";

/// Job state visible to the status functions (`success()`, `failure()`,
/// `cancelled()`, `always()`).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JobStatus {
    pub failed: bool,
    pub cancelled: bool,
}

impl JobStatus {
    pub fn success(&self) -> bool {
        !self.failed && !self.cancelled
    }
}

/// Named values an expression may reference.
#[derive(Debug, Clone, Default)]
pub struct Bindings {
    contexts: BTreeMap<String, Value>,
    pub status: JobStatus,
}

impl Bindings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a top-level context such as `github` or `steps`.
    pub fn with_context(mut self, name: impl Into<String>, value: Value) -> Self {
        self.contexts.insert(name.into().to_ascii_lowercase(), value);
        self
    }

    pub fn with_status(mut self, status: JobStatus) -> Self {
        self.status = status;
        self
    }

    pub fn context(&self, name: &str) -> Option<&Value> {
        self.contexts.get(&name.to_ascii_lowercase())
    }
}

/// Expression bodies of every `${{ }}` region in `template`.
pub fn expression_regions(template: &str) -> EngineResult<Vec<&str>> {
    let mut regions = Vec::new();
    let mut rest = template;
    while let Some(start) = rest.find(OPEN) {
        let after = &rest[start + OPEN.len()..];
        let end = after.find(CLOSE).ok_or_else(|| {
            EngineError::Expression(format!("unterminated '{}' in '{}'", OPEN, template))
        })?;
        regions.push(after[..end].trim());
        rest = &after[end + CLOSE.len()..];
    }
    Ok(regions)
}

/// Evaluate a single expression body.
pub fn evaluate_expression(bindings: &Bindings, source: &str) -> EngineResult<Value> {
    eval::eval(&parser::parse(source)?, bindings)
}

/// Expand every `${{ }}` region in `template`.
///
/// A template without markers is returned unchanged.
pub fn evaluate(bindings: &Bindings, template: &str) -> EngineResult<String> {
    if !template.contains(OPEN) {
        return Ok(template.to_string());
    }

    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find(OPEN) {
        out.push_str(&rest[..start]);
        let after = &rest[start + OPEN.len()..];
        let end = after.find(CLOSE).ok_or_else(|| {
            EngineError::Expression(format!("unterminated '{}' in '{}'", OPEN, template))
        })?;
        let value = evaluate_expression(bindings, after[..end].trim())?;
        out.push_str(&to_display_string(&value));
        rest = &after[end + CLOSE.len()..];
    }
    out.push_str(rest);
    Ok(out)
}

/// Like [`evaluate`], coercing non-string values (numbers, booleans from
/// YAML) to their string form first.
pub fn evaluate_value(bindings: &Bindings, template: &Value) -> EngineResult<String> {
    match template {
        Value::String(s) => evaluate(bindings, s),
        other => Ok(to_display_string(other)),
    }
}

/// Boolean reading of a rendered condition.
///
/// `true` is true; `false`, `0`, `null` and the empty string are false;
/// anything else is true.
pub fn parse_bool(rendered: &str) -> bool {
    let trimmed = rendered.trim();
    !(trimmed.is_empty()
        || trimmed.eq_ignore_ascii_case("false")
        || trimmed == "0"
        || trimmed.eq_ignore_ascii_case("null"))
}

/// Evaluate a step `if:` condition.
///
/// Bare expressions are wrapped in `${{ }}`. A condition that does not call
/// a status function only passes while the job is still succeeding.
pub fn evaluate_condition(bindings: &Bindings, condition: &str) -> EngineResult<bool> {
    let template = if condition.contains(OPEN) {
        condition.to_string()
    } else {
        format!("{} {} {}", OPEN, condition, CLOSE)
    };

    let mut checks_status = false;
    for region in expression_regions(&template)? {
        checks_status |= parser::parse(region)?.calls_status_function();
    }

    let result = parse_bool(&evaluate(bindings, &template)?);
    Ok(if checks_status {
        result
    } else {
        bindings.status.success() && result
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn github_bindings() -> Bindings {
        Bindings::new()
            .with_context(
                "github",
                json!({"actor": "aliceoa", "actor_id": "1234567", "event": {"inputs": {}}}),
            )
            .with_context(
                "steps",
                json!({"greeting-step": {"outputs": {"hello": "Hello World"}}}),
            )
            .with_context("runner", json!({"debug": ""}))
    }

    #[test]
    fn test_commit_author_concatenation() {
        let template = "${{ github.actor }} <${{ github.actor_id }}+${{ github.actor }}@users.noreply.github.com>";
        assert_eq!(
            evaluate(&github_bindings(), template).unwrap(),
            "aliceoa <1234567+aliceoa@users.noreply.github.com>"
        );
    }

    #[test]
    fn test_expression_with_string_literal_concatenation() {
        let template = "${{ github.actor_id + \" https://github.com/\" + github.actor }}";
        assert_eq!(
            evaluate(&github_bindings(), template).unwrap(),
            "1234567 https://github.com/aliceoa"
        );
    }

    #[test]
    fn test_plain_text_is_returned_unchanged() {
        let bindings = github_bindings();
        assert_eq!(evaluate(&bindings, "echo hi").unwrap(), "echo hi");
        let once = evaluate(&bindings, "${{ github.actor }}").unwrap();
        assert_eq!(evaluate(&bindings, &once).unwrap(), once);
    }

    #[test]
    fn test_hyphenated_step_ids() {
        assert_eq!(
            evaluate(
                &github_bindings(),
                "echo ${{ steps.greeting-step.outputs.hello }}!"
            )
            .unwrap(),
            "echo Hello World!"
        );
    }

    #[test]
    fn test_missing_values_render_empty() {
        assert_eq!(
            evaluate(&github_bindings(), "[${{ github.nothing }}]").unwrap(),
            "[]"
        );
    }

    #[test]
    fn test_unterminated_region_is_error() {
        assert!(evaluate(&github_bindings(), "${{ github.actor").is_err());
    }

    #[test]
    fn test_evaluate_value_coerces() {
        let bindings = github_bindings();
        assert_eq!(evaluate_value(&bindings, &json!(3)).unwrap(), "3");
        assert_eq!(evaluate_value(&bindings, &json!(true)).unwrap(), "true");
        assert_eq!(evaluate_value(&bindings, &Value::Null).unwrap(), "");
    }

    #[test]
    fn test_parse_bool() {
        assert!(parse_bool("true"));
        assert!(parse_bool("yes"));
        assert!(!parse_bool("false"));
        assert!(!parse_bool(""));
        assert!(!parse_bool("0"));
    }

    #[test]
    fn test_conditions() {
        let bindings = github_bindings();
        assert!(evaluate_condition(&bindings, "github.actor == 'aliceoa'").unwrap());
        assert!(!evaluate_condition(&bindings, "${{ runner.debug == '1' }}").unwrap());
        assert!(evaluate_condition(&bindings, "always()").unwrap());

        let failed = bindings.with_status(JobStatus {
            failed: true,
            cancelled: false,
        });
        assert!(!evaluate_condition(&failed, "github.actor == 'aliceoa'").unwrap());
        assert!(evaluate_condition(&failed, "failure()").unwrap());
        assert!(evaluate_condition(&failed, "always() && github.actor == 'aliceoa'").unwrap());
    }
}
