// Copyright 2022-Present Spyderbat, Inc. https://www.spyderbat.com/
// SPDX-License-Identifier: Apache-2.0

//! Optional record filtering.
//!
//! Two mutually exclusive modes, chosen at config load:
//!
//! - **Regex**: a list of patterns matched against the raw record bytes;
//!   any match emits the record. Cheap, no parsing.
//! - **Expression**: one boolean expression evaluated against the record's
//!   top-level JSON fields (requires a full parse per record, which is
//!   substantially slower than regex matching).
//!
//! Filtering fails open: a record that cannot be evaluated is emitted and
//! the failure logged. Losing an event to a filter bug is worse than
//! forwarding an extra one.

use evalexpr::{ContextWithMutableVariables, HashMapContext, Node, Value as ExprValue};
use serde_json::Value as JsonValue;
use tracing::warn;

use crate::config::{Config, ConfigError};

/// Compiled filter, fixed for the process lifetime.
#[derive(Debug)]
pub enum FilterEngine {
    /// No filter configured: emit everything.
    All,
    /// Emit when any pattern matches the raw bytes.
    Regex(Vec<regex::bytes::Regex>),
    /// Emit when the expression evaluates to true.
    Expr(Node),
}

impl FilterEngine {
    /// Compiles the filter configuration. Invalid patterns or expressions
    /// are config-load errors.
    pub fn from_config(config: &Config) -> Result<Self, ConfigError> {
        let expr = config.expr.as_deref().unwrap_or_default();

        if !config.matching_filters.is_empty() && !expr.is_empty() {
            return Err(ConfigError::ConflictingFilters);
        }

        if !config.matching_filters.is_empty() {
            let mut patterns = Vec::with_capacity(config.matching_filters.len());
            for pattern in &config.matching_filters {
                let compiled = regex::bytes::Regex::new(pattern).map_err(|e| {
                    ConfigError::InvalidRegex {
                        pattern: pattern.clone(),
                        reason: e.to_string(),
                    }
                })?;
                patterns.push(compiled);
            }
            return Ok(FilterEngine::Regex(patterns));
        }

        if !expr.is_empty() {
            let node = evalexpr::build_operator_tree(expr)
                .map_err(|e| ConfigError::InvalidExpression(e.to_string()))?;
            return Ok(FilterEngine::Expr(node));
        }

        Ok(FilterEngine::All)
    }

    /// Decides whether `record` should be emitted.
    #[must_use]
    pub fn emit(&self, record: &[u8]) -> bool {
        match self {
            FilterEngine::All => true,
            FilterEngine::Regex(patterns) => patterns.iter().any(|p| p.is_match(record)),
            FilterEngine::Expr(node) => evaluate(node, record),
        }
    }
}

fn evaluate(node: &Node, record: &[u8]) -> bool {
    let fields: serde_json::Map<String, JsonValue> = match serde_json::from_slice(record) {
        Ok(fields) => fields,
        Err(e) => {
            warn!(error = %e, "error evaluating expression");
            return true;
        }
    };

    let mut context = HashMapContext::new();
    for (key, value) in fields {
        let Some(value) = expr_value(value) else {
            continue;
        };
        if let Err(e) = context.set_value(key, value) {
            warn!(error = %e, "error evaluating expression");
            return true;
        }
    }

    match node.eval_with_context(&context) {
        Ok(ExprValue::Boolean(emit)) => emit,
        Ok(other) => {
            warn!(result = ?other, "expression did not evaluate to a boolean");
            true
        }
        Err(e) => {
            warn!(error = %e, "error evaluating expression");
            true
        }
    }
}

// Top-level scalars and scalar arrays are visible to expressions; nested
// objects are not.
fn expr_value(value: JsonValue) -> Option<ExprValue> {
    match value {
        JsonValue::Null => Some(ExprValue::Empty),
        JsonValue::Bool(b) => Some(ExprValue::Boolean(b)),
        JsonValue::Number(n) => {
            if let Some(i) = n.as_i64() {
                Some(ExprValue::Int(i))
            } else {
                n.as_f64().map(ExprValue::Float)
            }
        }
        JsonValue::String(s) => Some(ExprValue::String(s)),
        JsonValue::Array(items) => Some(ExprValue::Tuple(
            items.into_iter().filter_map(expr_value).collect(),
        )),
        JsonValue::Object(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_with(filters: &[&str], expr: Option<&str>) -> Config {
        Config {
            matching_filters: filters.iter().map(ToString::to_string).collect(),
            expr: expr.map(ToString::to_string),
            ..Config::default()
        }
    }

    #[test]
    fn test_no_filter_emits_everything() {
        let engine = FilterEngine::from_config(&Config::default()).unwrap();
        assert!(engine.emit(br#"{"id":"x"}"#));
        assert!(engine.emit(b"anything"));
    }

    #[test]
    fn test_regex_any_match() {
        let engine =
            FilterEngine::from_config(&config_with(&["redflag", "bluefla+g"], None)).unwrap();
        assert!(engine.emit(br#"{"schema":"redflag:1.0"}"#));
        assert!(engine.emit(br#"{"schema":"blueflaaag"}"#));
        assert!(!engine.emit(br#"{"schema":"greenflag"}"#));
    }

    #[test]
    fn test_invalid_regex_is_config_error() {
        assert!(matches!(
            FilterEngine::from_config(&config_with(&["("], None)),
            Err(ConfigError::InvalidRegex { .. })
        ));
    }

    #[test]
    fn test_expression_over_top_level_fields() {
        let engine = FilterEngine::from_config(&config_with(
            &[],
            Some(r#"schema == "model_activity:1.0" && severity > 3"#),
        ))
        .unwrap();
        assert!(engine.emit(br#"{"schema":"model_activity:1.0","severity":5}"#));
        assert!(!engine.emit(br#"{"schema":"model_activity:1.0","severity":1}"#));
        assert!(!engine.emit(br#"{"schema":"other","severity":5}"#));
    }

    #[test]
    fn test_invalid_expression_is_config_error() {
        assert!(matches!(
            FilterEngine::from_config(&config_with(&[], Some("=== ((("))),
            Err(ConfigError::InvalidExpression(_))
        ));
    }

    #[test]
    fn test_expression_runtime_error_fails_open() {
        // `severity` is missing from the record: evaluation errors, and
        // the record is emitted anyway.
        let engine =
            FilterEngine::from_config(&config_with(&[], Some("severity > 3"))).unwrap();
        assert!(engine.emit(br#"{"schema":"x"}"#));
    }

    #[test]
    fn test_non_boolean_expression_fails_open() {
        let engine = FilterEngine::from_config(&config_with(&[], Some("severity"))).unwrap();
        assert!(engine.emit(br#"{"severity":7}"#));
    }

    #[test]
    fn test_unparseable_record_fails_open() {
        let engine =
            FilterEngine::from_config(&config_with(&[], Some("severity > 3"))).unwrap();
        assert!(engine.emit(b"not json"));
    }

    #[test]
    fn test_both_modes_rejected() {
        assert!(matches!(
            FilterEngine::from_config(&config_with(&["x"], Some("y == 1"))),
            Err(ConfigError::ConflictingFilters)
        ));
    }
}
