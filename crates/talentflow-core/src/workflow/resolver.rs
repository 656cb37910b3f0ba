//! `{{path}}` placeholder substitution against an instance's variables and context.
//!
//! Resolution walks strings, objects, and arrays recursively. A string that is
//! exactly one placeholder keeps the referenced value's JSON type; placeholders
//! embedded in longer text are stringified. Unknown references are left as
//! written, so resolving twice gives the same result as resolving once.

use serde_json::{Map, Value};

/// Read-only view used to resolve placeholders.
#[derive(Debug, Clone, Copy)]
pub struct VariableResolver<'a> {
    variables: &'a Map<String, Value>,
    context: &'a Value,
}

/// A `{{path}}` occurrence inside a string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Placeholder<'s> {
    /// Byte offset of the opening `{{`.
    pub start: usize,
    /// Byte offset one past the closing `}}`.
    pub end: usize,
    /// Trimmed path between the braces.
    pub path: &'s str,
}

impl<'a> VariableResolver<'a> {
    pub fn new(variables: &'a Map<String, Value>, context: &'a Value) -> Self {
        Self { variables, context }
    }

    /// Look up a dotted path.
    ///
    /// `variables.x` and `context.x` select a source explicitly; a bare path is
    /// tried against variables first, then context.
    pub fn lookup(&self, path: &str) -> Option<&'a Value> {
        if let Some(rest) = path.strip_prefix("variables.") {
            return lookup_in_map(self.variables, rest);
        }
        if let Some(rest) = path.strip_prefix("context.") {
            return lookup_path(self.context, rest);
        }
        lookup_in_map(self.variables, path).or_else(|| lookup_path(self.context, path))
    }

    /// Resolve every placeholder in `value`, recursing into objects and arrays.
    pub fn resolve(&self, value: &Value) -> Value {
        match value {
            Value::String(s) => self.resolve_str(s),
            Value::Array(items) => Value::Array(items.iter().map(|v| self.resolve(v)).collect()),
            Value::Object(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), self.resolve(v)))
                    .collect(),
            ),
            other => other.clone(),
        }
    }

    /// Resolve one string. See the module docs for typing rules.
    pub fn resolve_str(&self, input: &str) -> Value {
        let placeholders = placeholders(input);
        if let [only] = placeholders.as_slice() {
            if only.start == 0 && only.end == input.len() {
                return match self.lookup(only.path) {
                    Some(v) => v.clone(),
                    None => Value::String(input.to_string()),
                };
            }
        }
        Value::String(self.render(input))
    }

    /// Resolve placeholders inside `input` as text.
    pub fn render(&self, input: &str) -> String {
        let mut out = String::with_capacity(input.len());
        let mut cursor = 0;
        for ph in placeholders(input) {
            out.push_str(&input[cursor..ph.start]);
            match self.lookup(ph.path) {
                Some(v) => out.push_str(&value_to_string(v)),
                None => out.push_str(&input[ph.start..ph.end]),
            }
            cursor = ph.end;
        }
        out.push_str(&input[cursor..]);
        out
    }
}

/// Find all well-formed placeholders in `input`, in order.
///
/// A placeholder is `{{`, an optional run of spaces, a path made of ASCII
/// alphanumerics, `_`, `-` and `.`, optional spaces, then `}}`.
pub fn placeholders(input: &str) -> Vec<Placeholder<'_>> {
    let mut found = Vec::new();
    let mut offset = 0;
    while let Some(rel) = input[offset..].find("{{") {
        let start = offset + rel;
        let Some(close) = input[start + 2..].find("}}") else {
            break;
        };
        let end = start + 2 + close + 2;
        let path = input[start + 2..end - 2].trim();
        if is_valid_path(path) {
            found.push(Placeholder { start, end, path });
            offset = end;
        } else {
            offset = start + 1;
        }
    }
    found
}

fn is_valid_path(path: &str) -> bool {
    !path.is_empty()
        && !path.starts_with('.')
        && !path.ends_with('.')
        && path
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.')
}

fn lookup_in_map<'v>(map: &'v Map<String, Value>, path: &str) -> Option<&'v Value> {
    let (head, rest) = match path.split_once('.') {
        Some((head, rest)) => (head, Some(rest)),
        None => (path, None),
    };
    let value = map.get(head)?;
    match rest {
        Some(rest) => lookup_path(value, rest),
        None => Some(value),
    }
}

fn lookup_path<'v>(root: &'v Value, path: &str) -> Option<&'v Value> {
    path.split('.').try_fold(root, |current, segment| match current {
        Value::Object(map) => map.get(segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

/// Convert a JSON value to its text form for embedding in a larger string.
pub fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => "null".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        _ => serde_json::to_string(value).unwrap_or_default(),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn vars() -> Map<String, Value> {
        json!({
            "employee": { "name": "Dana", "email": "dana@example.com" },
            "amount": 1200,
            "tags": ["remote", "engineering"],
            "region": "emea"
        })
        .as_object()
        .cloned()
        .unwrap()
    }

    fn ctx() -> Value {
        json!({
            "region": "apac",
            "candidate": { "id": "c-42", "start_date": "2026-11-02T09:00:00Z" }
        })
    }

    #[test]
    fn test_whole_string_placeholder_keeps_type() {
        let (v, c) = (vars(), ctx());
        let r = VariableResolver::new(&v, &c);
        assert_eq!(r.resolve_str("{{amount}}"), json!(1200));
        assert_eq!(r.resolve_str("{{ employee }}"), json!({"name": "Dana", "email": "dana@example.com"}));
        assert_eq!(r.resolve_str("{{tags}}"), json!(["remote", "engineering"]));
    }

    #[test]
    fn test_embedded_placeholders_are_stringified() {
        let (v, c) = (vars(), ctx());
        let r = VariableResolver::new(&v, &c);
        assert_eq!(
            r.resolve_str("Welcome {{employee.name}}, budget {{amount}}"),
            json!("Welcome Dana, budget 1200")
        );
        assert_eq!(r.render("tags={{tags}}"), r#"tags=["remote","engineering"]"#);
    }

    #[test]
    fn test_variables_shadow_context() {
        let (v, c) = (vars(), ctx());
        let r = VariableResolver::new(&v, &c);
        assert_eq!(r.lookup("region"), Some(&json!("emea")));
        assert_eq!(r.lookup("context.region"), Some(&json!("apac")));
        assert_eq!(r.lookup("variables.region"), Some(&json!("emea")));
        assert_eq!(r.lookup("candidate.id"), Some(&json!("c-42")));
    }

    #[test]
    fn test_array_index_segments() {
        let (v, c) = (vars(), ctx());
        let r = VariableResolver::new(&v, &c);
        assert_eq!(r.lookup("tags.1"), Some(&json!("engineering")));
        assert_eq!(r.lookup("tags.7"), None);
        assert_eq!(r.lookup("tags.first"), None);
    }

    #[test]
    fn test_unknown_reference_left_verbatim() {
        let (v, c) = (vars(), ctx());
        let r = VariableResolver::new(&v, &c);
        assert_eq!(r.resolve_str("{{missing.value}}"), json!("{{missing.value}}"));
        assert_eq!(
            r.resolve_str("Hi {{ nobody }} and {{employee.name}}"),
            json!("Hi {{ nobody }} and Dana")
        );
    }

    #[test]
    fn test_resolution_is_idempotent() {
        let (v, c) = (vars(), ctx());
        let r = VariableResolver::new(&v, &c);
        let input = json!({
            "to": "{{employee.email}}",
            "subject": "Start date {{candidate.start_date}} {{unknown}}",
            "lines": ["{{amount}}", { "nested": "{{tags.0}}" }],
            "count": 3
        });
        let once = r.resolve(&input);
        let twice = r.resolve(&once);
        assert_eq!(once, twice);
        assert_eq!(once["lines"][0], json!(1200));
        assert_eq!(once["lines"][1]["nested"], json!("remote"));
        assert_eq!(once["count"], json!(3));
    }

    #[test]
    fn test_malformed_placeholders_ignored() {
        let (v, c) = (vars(), ctx());
        let r = VariableResolver::new(&v, &c);
        assert_eq!(r.render("{{}} {{ a b }} {{amount"), "{{}} {{ a b }} {{amount");
        assert_eq!(r.render("{{{amount}}"), "{1200");
    }

    #[test]
    fn test_placeholders_positions() {
        let found = placeholders("a {{x}} b {{ y.z }}");
        assert_eq!(found.len(), 2);
        assert_eq!(found[0].path, "x");
        assert_eq!(&"a {{x}} b {{ y.z }}"[found[1].start..found[1].end], "{{ y.z }}");
    }
}
