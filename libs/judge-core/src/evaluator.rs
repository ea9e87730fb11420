/// Test Evaluator - Language-Agnostic Comparison and Aggregation
///
/// **Core Responsibility:**
/// Compare the value a candidate returned against the expected value and
/// fold per-test outcomes into a submission verdict.
///
/// **Critical Properties:**
/// - Knows nothing about processes or interpreters
/// - Pure function: (run outputs, expected outputs) → verdict
///
/// **Comparison Rules:**
/// - Arrays: order-sensitive, element-wise
/// - Objects: same key set, values compared recursively, key order ignored
/// - Strings, booleans, null: exact
/// - Numbers: exact by default (`1` and `1.0` are the same number);
///   an opt-in absolute tolerance applies to numeric leaves only
///
/// **Aggregation Rules:**
/// - Every test case is run and reported, there is no early stop
/// - `all_passed` requires every outcome to pass
/// - `first_failing_index` is the earliest failure in test-case order
use judge_common::types::{ExecutionError, ExecutionOutcome, SubmissionVerdict, TestCase};
use serde_json::{Number, Value};
use tracing::debug;

/// Raw result of one sandboxed run, produced by the engine.
#[derive(Debug, Clone)]
pub struct RunOutput {
    pub result: Result<Value, ExecutionError>,
    pub execution_time_ms: u64,
    pub memory_bytes: u64,
}

/// Deep structural equality between an actual and an expected value.
pub fn compare(actual: &Value, expected: &Value, tolerance: Option<f64>) -> bool {
    match (actual, expected) {
        (Value::Null, Value::Null) => true,
        (Value::Bool(a), Value::Bool(b)) => a == b,
        (Value::String(a), Value::String(b)) => a == b,
        (Value::Number(a), Value::Number(b)) => numbers_equal(a, b, tolerance),
        (Value::Array(a), Value::Array(b)) => {
            a.len() == b.len() && a.iter().zip(b).all(|(x, y)| compare(x, y, tolerance))
        }
        (Value::Object(a), Value::Object(b)) => {
            a.len() == b.len()
                && a.iter()
                    .all(|(key, x)| b.get(key).is_some_and(|y| compare(x, y, tolerance)))
        }
        _ => false,
    }
}

fn numbers_equal(a: &Number, b: &Number, tolerance: Option<f64>) -> bool {
    if let Some(eps) = tolerance {
        return match (a.as_f64(), b.as_f64()) {
            (Some(x), Some(y)) => (x - y).abs() <= eps,
            _ => false,
        };
    }
    // Integers are compared as integers so large values do not collide through f64
    if let (Some(x), Some(y)) = (a.as_i64(), b.as_i64()) {
        return x == y;
    }
    if let (Some(x), Some(y)) = (a.as_u64(), b.as_u64()) {
        return x == y;
    }
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => x == y,
        _ => false,
    }
}

/// Canonical text form of a value: object keys sorted, no whitespace.
/// Two values that `compare` equal without tolerance have the same canonical form.
pub fn canonical_string(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(&map[key], out);
            }
            out.push('}');
        }
        Value::Number(n) => match (n.as_i64(), n.as_u64(), n.as_f64()) {
            (Some(i), _, _) => out.push_str(&i.to_string()),
            (None, Some(u), _) => out.push_str(&u.to_string()),
            (None, None, Some(f)) if f.fract() == 0.0 && f.abs() < 9.0e15 => {
                out.push_str(&(f as i64).to_string())
            }
            _ => out.push_str(&n.to_string()),
        },
        other => out.push_str(&other.to_string()),
    }
}

/// Turn one raw run into an outcome.
///
/// A run that errored never passes; a completed run passes iff its value
/// compares equal to the expected output.
pub fn evaluate_test(output: RunOutput, test_case: &TestCase, tolerance: Option<f64>) -> ExecutionOutcome {
    match output.result {
        Ok(actual) => {
            let passed = compare(&actual, &test_case.expected_output, tolerance);
            if !passed {
                debug!(
                    expected = %canonical_string(&test_case.expected_output),
                    actual = %canonical_string(&actual),
                    "Output mismatch"
                );
            }
            ExecutionOutcome::completed(actual, passed, output.execution_time_ms, output.memory_bytes)
        }
        Err(error) => ExecutionOutcome::failed(error, output.execution_time_ms, output.memory_bytes),
    }
}

/// Evaluate all runs against their test cases and build the verdict.
///
/// `outputs[i]` must belong to `test_cases[i]`; the engine guarantees this
/// ordering regardless of how runs were scheduled.
pub fn evaluate(outputs: Vec<RunOutput>, test_cases: &[TestCase], tolerance: Option<f64>) -> SubmissionVerdict {
    debug_assert_eq!(outputs.len(), test_cases.len());

    let outcomes = outputs
        .into_iter()
        .zip(test_cases)
        .map(|(output, test_case)| evaluate_test(output, test_case, tolerance))
        .collect();

    SubmissionVerdict::from_outcomes(outcomes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use judge_common::types::ExecutionErrorKind;
    use serde_json::json;

    fn make_test_case(expected_output: Value) -> TestCase {
        TestCase::new(json!({}), expected_output)
    }

    fn make_output(value: Value, exec_time: u64) -> RunOutput {
        RunOutput {
            result: Ok(value),
            execution_time_ms: exec_time,
            memory_bytes: 4096,
        }
    }

    fn make_error(kind: ExecutionErrorKind, message: &str) -> RunOutput {
        RunOutput {
            result: Err(ExecutionError::new(kind, message)),
            execution_time_ms: 3,
            memory_bytes: 0,
        }
    }

    #[test]
    fn test_array_order_matters() {
        assert!(!compare(&json!([0, 1]), &json!([1, 0]), None));
        assert!(compare(&json!([0, 1]), &json!([0, 1]), None));
        assert!(!compare(&json!([0, 1]), &json!([0, 1, 2]), None));
    }

    #[test]
    fn test_object_key_order_ignored() {
        assert!(compare(&json!({"a": 1, "b": 2}), &json!({"b": 2, "a": 1}), None));
        assert!(!compare(&json!({"a": 1}), &json!({"a": 1, "b": 2}), None));
        assert!(!compare(&json!({"a": 1, "c": 2}), &json!({"a": 1, "b": 2}), None));
    }

    #[test]
    fn test_nested_structures() {
        let a = json!({"grid": [[1, 2], [3, 4]], "meta": {"ok": true, "name": "x"}});
        let b = json!({"meta": {"name": "x", "ok": true}, "grid": [[1, 2], [3, 4]]});
        assert!(compare(&a, &b, None));

        let c = json!({"meta": {"name": "x", "ok": true}, "grid": [[1, 2], [4, 3]]});
        assert!(!compare(&a, &c, None));
    }

    #[test]
    fn test_float_exact_by_default() {
        let sum = json!(0.1 + 0.2);
        assert!(!compare(&sum, &json!(0.3), None));
        assert!(compare(&sum, &json!(0.3), Some(1e-9)));
    }

    #[test]
    fn test_integer_and_float_forms_are_equal() {
        assert!(compare(&json!(1), &json!(1.0), None));
        assert!(!compare(&json!(1), &json!(2), None));
        assert!(compare(&json!(-5), &json!(-5), None));
    }

    #[test]
    fn test_tolerance_does_not_affect_types() {
        assert!(!compare(&json!("1"), &json!(1), Some(0.5)));
        assert!(!compare(&json!(null), &json!(0), Some(0.5)));
        assert!(!compare(&json!(true), &json!(1), Some(0.5)));
    }

    #[test]
    fn test_canonical_string_sorts_keys() {
        assert_eq!(canonical_string(&json!({"b": [1, 2.0], "a": "x"})), r#"{"a":"x","b":[1,2]}"#);
        assert_eq!(
            canonical_string(&json!({"a": 1, "b": 2})),
            canonical_string(&json!({"b": 2, "a": 1}))
        );
    }

    #[test]
    fn test_evaluate_test_match() {
        let outcome = evaluate_test(make_output(json!([0, 1]), 12), &make_test_case(json!([0, 1])), None);
        assert!(outcome.passed);
        assert_eq!(outcome.actual_output, Some(json!([0, 1])));
        assert_eq!(outcome.execution_time_ms, 12);
        assert!(outcome.error.is_none());
    }

    #[test]
    fn test_evaluate_test_mismatch_keeps_output() {
        let outcome = evaluate_test(make_output(json!([1, 1]), 5), &make_test_case(json!([0, 1])), None);
        assert!(!outcome.passed);
        assert_eq!(outcome.actual_output, Some(json!([1, 1])));
        assert!(outcome.error.is_none());
    }

    #[test]
    fn test_evaluate_test_error_never_passes() {
        // Expected output of null must not match a run that produced nothing
        let outcome = evaluate_test(
            make_error(ExecutionErrorKind::Runtime, "Error: boom"),
            &make_test_case(json!(null)),
            None,
        );
        assert!(!outcome.passed);
        assert!(outcome.actual_output.is_none());
        assert!(outcome.error.unwrap().message.contains("boom"));
    }

    #[test]
    fn test_evaluate_mixed_statuses() {
        let test_cases = vec![
            make_test_case(json!("pass")),
            make_test_case(json!("fail")),
            make_test_case(json!("timeout")),
            make_test_case(json!("error")),
        ];
        let outputs = vec![
            make_output(json!("pass"), 10),
            make_output(json!("wrong"), 10),
            RunOutput {
                result: Err(ExecutionError::timeout()),
                execution_time_ms: 1001,
                memory_bytes: 0,
            },
            make_error(ExecutionErrorKind::Syntax, "Unexpected token"),
        ];

        let verdict = evaluate(outputs, &test_cases, None);

        assert!(!verdict.all_passed);
        assert_eq!(verdict.outcomes.len(), 4);
        assert_eq!(verdict.first_failing_index, Some(1));
        assert_eq!(verdict.passed_count, 1);
        assert!(verdict.outcomes[0].passed);
        assert_eq!(verdict.outcomes[2].error.as_ref().unwrap().kind, ExecutionErrorKind::Timeout);
        assert_eq!(verdict.outcomes[3].error.as_ref().unwrap().kind, ExecutionErrorKind::Syntax);
    }

    #[test]
    fn test_evaluate_all_pass() {
        let test_cases = vec![make_test_case(json!(120)), make_test_case(json!(6))];
        let outputs = vec![make_output(json!(120), 42), make_output(json!(6), 38)];

        let verdict = evaluate(outputs, &test_cases, None);

        assert!(verdict.all_passed);
        assert_eq!(verdict.first_failing_index, None);
        assert_eq!(verdict.total_count, 2);
    }
}
