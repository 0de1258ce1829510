//! Metadata filter language: three surface syntaxes compile to the same
//! tagged `FilterExpression` AST, which a single evaluator interprets
//! against a row's JSON metadata. Line-for-line grounded on the original
//! service's `metadata_filter.py`.

use regex::Regex;
use serde_json::Value;

use crate::error::{AidbError, AidbResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    In,
    NotIn,
    Like,
    NotLike,
}

#[derive(Debug, Clone)]
pub enum FilterExpression {
    And(Vec<FilterExpression>),
    Or(Vec<FilterExpression>),
    Not(Box<FilterExpression>),
    Cmp(String, CmpOp, Value),
    Exists(String),
    IsNull(String),
    /// Empty expression: matches everything.
    True,
}

/// Parses any of the three surface syntaxes into a `FilterExpression`.
/// A JSON object is tried first (plain map or structured `$and`/`$or`
/// map); anything else is parsed as the SQL-ish string grammar.
pub fn parse(input: &Value) -> AidbResult<FilterExpression> {
    match input {
        Value::Null => Ok(FilterExpression::True),
        Value::Object(map) if map.is_empty() => Ok(FilterExpression::True),
        Value::Object(_) => parse_dict(input),
        Value::String(s) if s.trim().is_empty() => Ok(FilterExpression::True),
        Value::String(s) => parse_sql(s),
        other => Err(AidbError::InvalidFilter(format!(
            "filter must be an object or string, got {other}"
        ))),
    }
}

fn parse_dict(value: &Value) -> AidbResult<FilterExpression> {
    let map = value
        .as_object()
        .ok_or_else(|| AidbError::InvalidFilter("expected a JSON object".into()))?;

    let mut clauses = Vec::new();
    for (key, val) in map {
        match key.as_str() {
            "$and" => {
                let items = val
                    .as_array()
                    .ok_or_else(|| AidbError::InvalidFilter("$and expects an array".into()))?;
                let parsed: AidbResult<Vec<_>> = items.iter().map(parse_dict).collect();
                clauses.push(FilterExpression::And(parsed?));
            }
            "$or" => {
                let items = val
                    .as_array()
                    .ok_or_else(|| AidbError::InvalidFilter("$or expects an array".into()))?;
                let parsed: AidbResult<Vec<_>> = items.iter().map(parse_dict).collect();
                clauses.push(FilterExpression::Or(parsed?));
            }
            "$not" => {
                clauses.push(FilterExpression::Not(Box::new(parse_dict(val)?)));
            }
            field => {
                clauses.push(parse_field_clause(field, val)?);
            }
        }
    }

    Ok(match clauses.len() {
        0 => FilterExpression::True,
        1 => clauses.into_iter().next().unwrap(),
        _ => FilterExpression::And(clauses),
    })
}

fn parse_field_clause(field: &str, val: &Value) -> AidbResult<FilterExpression> {
    match val {
        Value::Object(ops) if ops.keys().any(|k| k.starts_with('$')) => {
            let mut clauses = Vec::new();
            for (op, operand) in ops {
                let cmp = match op.as_str() {
                    "$eq" => CmpOp::Eq,
                    "$ne" => CmpOp::Ne,
                    "$lt" => CmpOp::Lt,
                    "$le" | "$lte" => CmpOp::Le,
                    "$gt" => CmpOp::Gt,
                    "$ge" | "$gte" => CmpOp::Ge,
                    "$in" => CmpOp::In,
                    "$nin" => CmpOp::NotIn,
                    "$like" | "$regex" => CmpOp::Like,
                    "$exists" => {
                        let want_exists = operand.as_bool().unwrap_or(true);
                        clauses.push(if want_exists {
                            FilterExpression::Exists(field.to_string())
                        } else {
                            FilterExpression::Not(Box::new(FilterExpression::Exists(field.to_string())))
                        });
                        continue;
                    }
                    "$null" => {
                        let want_null = operand.as_bool().unwrap_or(true);
                        clauses.push(if want_null {
                            FilterExpression::IsNull(field.to_string())
                        } else {
                            FilterExpression::Not(Box::new(FilterExpression::IsNull(field.to_string())))
                        });
                        continue;
                    }
                    other => return Err(AidbError::InvalidFilter(format!("unknown operator '{other}'"))),
                };
                clauses.push(FilterExpression::Cmp(field.to_string(), cmp, operand.clone()));
            }
            Ok(match clauses.len() {
                1 => clauses.into_iter().next().unwrap(),
                _ => FilterExpression::And(clauses),
            })
        }
        other => Ok(FilterExpression::Cmp(field.to_string(), CmpOp::Eq, other.clone())),
    }
}

/// Parses the SQL-ish surface syntax: top-level `OR` split first, then
/// `AND` within each disjunct, recursing into parenthesized groups.
fn parse_sql(input: &str) -> AidbResult<FilterExpression> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Ok(FilterExpression::True);
    }
    parse_or(trimmed)
}

fn parse_or(input: &str) -> AidbResult<FilterExpression> {
    let parts = split_top_level(input, " OR ")?;
    if parts.len() == 1 {
        return parse_and(&parts[0]);
    }
    let clauses: AidbResult<Vec<_>> = parts.iter().map(|p| parse_and(p)).collect();
    Ok(FilterExpression::Or(clauses?))
}

fn parse_and(input: &str) -> AidbResult<FilterExpression> {
    let parts = split_top_level(input, " AND ")?;
    if parts.len() == 1 {
        return parse_unary(&parts[0]);
    }
    let clauses: AidbResult<Vec<_>> = parts.iter().map(|p| parse_unary(p)).collect();
    Ok(FilterExpression::And(clauses?))
}

fn parse_unary(input: &str) -> AidbResult<FilterExpression> {
    let trimmed = input.trim();
    if let Some(rest) = strip_keyword(trimmed, "NOT ") {
        return Ok(FilterExpression::Not(Box::new(parse_unary(rest)?)));
    }
    if trimmed.starts_with('(') && trimmed.ends_with(')') && balanced_parens(trimmed) {
        return parse_or(&trimmed[1..trimmed.len() - 1]);
    }
    parse_condition(trimmed)
}

fn strip_keyword<'a>(input: &'a str, keyword: &str) -> Option<&'a str> {
    if input.len() >= keyword.len() && input[..keyword.len()].eq_ignore_ascii_case(keyword) {
        Some(&input[keyword.len()..])
    } else {
        None
    }
}

fn balanced_parens(s: &str) -> bool {
    let mut depth = 0i32;
    for (i, c) in s.chars().enumerate() {
        match c {
            '(' => depth += 1,
            ')' => {
                depth -= 1;
                if depth == 0 && i != s.len() - 1 {
                    return false;
                }
            }
            _ => {}
        }
    }
    depth == 0
}

/// Splits `input` on `sep` at paren-depth 0 only, case-insensitively.
fn split_top_level(input: &str, sep: &str) -> AidbResult<Vec<String>> {
    let upper_sep = sep.to_ascii_uppercase();
    let mut parts = Vec::new();
    let mut depth = 0i32;
    let mut current = String::new();
    let chars: Vec<char> = input.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        match c {
            '(' => {
                depth += 1;
                current.push(c);
                i += 1;
            }
            ')' => {
                depth -= 1;
                current.push(c);
                i += 1;
            }
            _ if depth == 0 && input_has_sep_at(&chars, i, &upper_sep) => {
                parts.push(std::mem::take(&mut current));
                i += upper_sep.len();
            }
            _ => {
                current.push(c);
                i += 1;
            }
        }
    }
    parts.push(current);
    Ok(parts.into_iter().map(|p| p.trim().to_string()).filter(|p| !p.is_empty()).collect())
}

fn input_has_sep_at(chars: &[char], i: usize, upper_sep: &str) -> bool {
    let sep_chars: Vec<char> = upper_sep.chars().collect();
    if i + sep_chars.len() > chars.len() {
        return false;
    }
    chars[i..i + sep_chars.len()]
        .iter()
        .zip(sep_chars.iter())
        .all(|(a, b)| a.to_ascii_uppercase() == *b)
}

fn parse_condition(input: &str) -> AidbResult<FilterExpression> {
    let trimmed = input.trim();
    let upper = trimmed.to_ascii_uppercase();

    if let Some(field) = upper.strip_suffix("IS NOT NULL") {
        return Ok(FilterExpression::Not(Box::new(FilterExpression::IsNull(
            trimmed[..field.len()].trim().to_string(),
        ))));
    }
    if let Some(field) = upper.strip_suffix("IS NULL") {
        return Ok(FilterExpression::IsNull(trimmed[..field.len()].trim().to_string()));
    }
    if let Some(rest) = upper.strip_prefix("NOT EXISTS ") {
        return Ok(FilterExpression::Not(Box::new(FilterExpression::Exists(
            trimmed[trimmed.len() - rest.len()..].trim().to_string(),
        ))));
    }
    if let Some(rest) = upper.strip_prefix("EXISTS ") {
        return Ok(FilterExpression::Exists(
            trimmed[trimmed.len() - rest.len()..].trim().to_string(),
        ));
    }
    if let Some(idx) = find_keyword(&upper, " NOT IN ") {
        let field = trimmed[..idx].trim().to_string();
        let list_str = trimmed[idx + " NOT IN ".len()..].trim();
        let values = parse_value_list(list_str)?;
        return Ok(FilterExpression::Cmp(field, CmpOp::NotIn, Value::Array(values)));
    }
    if let Some(idx) = find_keyword(&upper, " IN ") {
        let field = trimmed[..idx].trim().to_string();
        let list_str = trimmed[idx + " IN ".len()..].trim();
        let values = parse_value_list(list_str)?;
        return Ok(FilterExpression::Cmp(field, CmpOp::In, Value::Array(values)));
    }
    if let Some(idx) = find_keyword(&upper, " NOT LIKE ") {
        let field = trimmed[..idx].trim().to_string();
        let pattern = parse_scalar(trimmed[idx + " NOT LIKE ".len()..].trim());
        return Ok(FilterExpression::Not(Box::new(FilterExpression::Cmp(field, CmpOp::Like, pattern))));
    }
    if let Some(idx) = find_keyword(&upper, " LIKE ") {
        let field = trimmed[..idx].trim().to_string();
        let pattern = parse_scalar(trimmed[idx + " LIKE ".len()..].trim());
        return Ok(FilterExpression::Cmp(field, CmpOp::Like, pattern));
    }

    for (token, op) in [
        ("!=", CmpOp::Ne),
        ("<=", CmpOp::Le),
        (">=", CmpOp::Ge),
        ("=", CmpOp::Eq),
        ("<", CmpOp::Lt),
        (">", CmpOp::Gt),
    ] {
        if let Some(idx) = trimmed.find(token) {
            let field = trimmed[..idx].trim().to_string();
            let value = parse_scalar(trimmed[idx + token.len()..].trim());
            return Ok(FilterExpression::Cmp(field, op, value));
        }
    }

    Err(AidbError::InvalidFilter(format!("could not parse condition '{trimmed}'")))
}

fn find_keyword(upper: &str, keyword: &str) -> Option<usize> {
    upper.find(keyword)
}

fn parse_value_list(input: &str) -> AidbResult<Vec<Value>> {
    let inner = input
        .trim()
        .strip_prefix('(')
        .and_then(|s| s.strip_suffix(')'))
        .ok_or_else(|| AidbError::InvalidFilter("expected a parenthesized list".into()))?;
    Ok(inner.split(',').map(|s| parse_scalar(s.trim())).collect())
}

/// Coerces a literal token to int → float → bool → string, matching the
/// original parser's type-guessing order (no ISO-date special case here:
/// dates arrive pre-parsed as strings and are compared lexicographically).
fn parse_scalar(token: &str) -> Value {
    let unquoted = token
        .strip_prefix('\'')
        .and_then(|s| s.strip_suffix('\''))
        .or_else(|| token.strip_prefix('"').and_then(|s| s.strip_suffix('"')));
    if let Some(s) = unquoted {
        return Value::String(s.to_string());
    }
    if let Ok(i) = token.parse::<i64>() {
        return Value::from(i);
    }
    if let Ok(f) = token.parse::<f64>() {
        return Value::from(f);
    }
    match token.to_ascii_lowercase().as_str() {
        "true" => return Value::Bool(true),
        "false" => return Value::Bool(false),
        _ => {}
    }
    Value::String(token.to_string())
}

/// Evaluates `expr` against a row's metadata object. An empty expression
/// matches everything; evaluation never fails — malformed comparisons
/// fall back to "does not match" so one bad row doesn't sink the query.
pub fn evaluate(expr: &FilterExpression, metadata: &Value) -> bool {
    match expr {
        FilterExpression::True => true,
        FilterExpression::And(clauses) => clauses.iter().all(|c| evaluate(c, metadata)),
        FilterExpression::Or(clauses) => clauses.iter().any(|c| evaluate(c, metadata)),
        FilterExpression::Not(inner) => !evaluate(inner, metadata),
        FilterExpression::Exists(field) => get_nested(metadata, field).is_some(),
        FilterExpression::IsNull(field) => match get_nested(metadata, field) {
            None => true,
            Some(v) => v.is_null(),
        },
        FilterExpression::Cmp(field, op, operand) => {
            let Some(actual) = get_nested(metadata, field) else {
                return false;
            };
            evaluate_cmp(actual, *op, operand)
        }
    }
}

fn get_nested<'a>(value: &'a Value, dotted_path: &str) -> Option<&'a Value> {
    let mut current = value;
    for segment in dotted_path.split('.') {
        current = current.as_object()?.get(segment)?;
    }
    Some(current)
}

fn evaluate_cmp(actual: &Value, op: CmpOp, operand: &Value) -> bool {
    match op {
        CmpOp::Eq => values_equal(actual, operand),
        CmpOp::Ne => !values_equal(actual, operand),
        CmpOp::Lt => compare_numeric(actual, operand).map(|o| o.is_lt()).unwrap_or(false),
        CmpOp::Le => compare_numeric(actual, operand).map(|o| o.is_le()).unwrap_or(false),
        CmpOp::Gt => compare_numeric(actual, operand).map(|o| o.is_gt()).unwrap_or(false),
        CmpOp::Ge => compare_numeric(actual, operand).map(|o| o.is_ge()).unwrap_or(false),
        CmpOp::In => operand
            .as_array()
            .map(|items| items.iter().any(|v| values_equal(actual, v)))
            .unwrap_or(false),
        CmpOp::NotIn => operand
            .as_array()
            .map(|items| !items.iter().any(|v| values_equal(actual, v)))
            .unwrap_or(true),
        CmpOp::Like => match (actual.as_str(), operand.as_str()) {
            (Some(a), Some(p)) => like_match(a, p),
            _ => false,
        },
        CmpOp::NotLike => match (actual.as_str(), operand.as_str()) {
            (Some(a), Some(p)) => !like_match(a, p),
            _ => true,
        },
    }
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        (Value::String(x), Value::String(y)) => x == y,
        _ => a == b,
    }
}

fn compare_numeric(a: &Value, b: &Value) -> Option<std::cmp::Ordering> {
    if let (Some(x), Some(y)) = (a.as_f64(), b.as_f64()) {
        return x.partial_cmp(&y);
    }
    if let (Some(x), Some(y)) = (a.as_str(), b.as_str()) {
        return Some(x.cmp(y));
    }
    None
}

/// `%` → any run, `_` → any single char, case-insensitive, anchored.
fn like_match(value: &str, pattern: &str) -> bool {
    let mut regex_str = String::from("(?i)^");
    for c in pattern.chars() {
        match c {
            '%' => regex_str.push_str(".*"),
            '_' => regex_str.push('.'),
            other => regex_str.push_str(&regex::escape(&other.to_string())),
        }
    }
    regex_str.push('$');
    Regex::new(&regex_str).map(|re| re.is_match(value)).unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn plain_map_is_conjunction_of_equalities() {
        let filter = parse(&json!({"category": "tech", "priority": 2})).unwrap();
        assert!(evaluate(&filter, &json!({"category": "tech", "priority": 2})));
        assert!(!evaluate(&filter, &json!({"category": "tech", "priority": 3})));
    }

    #[test]
    fn structured_and_or_not() {
        let filter = parse(&json!({
            "$and": [
                {"category": "tech"},
                {"priority": {"$gt": 1}}
            ]
        }))
        .unwrap();
        assert!(evaluate(&filter, &json!({"category": "tech", "priority": 2})));
        assert!(!evaluate(&filter, &json!({"category": "tech", "priority": 1})));
    }

    #[test]
    fn sql_and_or_precedence() {
        let filter = parse_sql("category = 'tech' AND priority > 1").unwrap();
        assert!(evaluate(&filter, &json!({"category": "tech", "priority": 2})));
        assert!(!evaluate(&filter, &json!({"category": "art", "priority": 2})));
    }

    #[test]
    fn unknown_field_semantics() {
        assert!(!evaluate(&FilterExpression::Exists("missing".into()), &json!({})));
        assert!(evaluate(&FilterExpression::IsNull("missing".into()), &json!({})));
        let cmp = FilterExpression::Cmp("missing".into(), CmpOp::Eq, json!(1));
        assert!(!evaluate(&cmp, &json!({})));
    }

    #[test]
    fn like_wildcards_are_case_insensitive() {
        assert!(like_match("Hello World", "hello%"));
        assert!(like_match("cat", "c_t"));
        assert!(!like_match("dog", "c_t"));
    }

    #[test]
    fn dotted_path_reaches_nested_metadata() {
        let filter = parse_sql("owner.name = 'ana'").unwrap();
        assert!(evaluate(&filter, &json!({"owner": {"name": "ana"}})));
    }

    #[test]
    fn parenthesized_sql_groups_respect_or_inside_and() {
        let filter = parse_sql("(category = 'tech' OR category = 'art') AND priority > 1").unwrap();
        assert!(evaluate(&filter, &json!({"category": "art", "priority": 5})));
        assert!(!evaluate(&filter, &json!({"category": "news", "priority": 5})));
    }
}
