//! # Patch Requests
//!
//! A [`PatchRequest`] is a small script plus named parameter values. The
//! script is compiled once, before a bulk patch starts, so a malformed script
//! fails the job before any document is touched. The compiled form is then
//! applied to each document inside the writer's transaction.
//!
//! ## Script Language
//!
//! Statements are separated by `;` or newlines. Paths always start at `this`
//! (the document body) and use dotted property names.
//!
//! ```text
//! this.Status = "Shipped";          set a property (creates parents)
//! this.Freight += $extra;           add to a number (missing counts as 0)
//! this.Tags.push("bulk");           append to an array (missing creates one)
//! delete this.Notes;                remove a property
//! ```
//!
//! Right-hand sides are JSON literals or `$name` references to the request's
//! parameter values.
//!
//! ## Not Modified
//!
//! Applying a patch reports whether the body actually changed. A patch that
//! leaves a document as it was is not written back, and the document keeps
//! its etag.

use serde_json::{Map, Number, Value};

use crate::error::{Error, Result};

// =============================================================================
// Patch Request
// =============================================================================

/// A patch script and its parameter values.
#[derive(Debug, Clone, PartialEq)]
pub struct PatchRequest {
    script: String,
    values: Map<String, Value>,
}

impl PatchRequest {
    /// Creates a patch request without parameters.
    pub fn new(script: impl Into<String>) -> Self {
        Self {
            script: script.into(),
            values: Map::new(),
        }
    }

    /// Adds a parameter, referenced from the script as `$name`.
    pub fn with_value(mut self, name: impl Into<String>, value: Value) -> Self {
        self.values.insert(name.into(), value);
        self
    }

    /// Returns the script text.
    pub fn script(&self) -> &str {
        &self.script
    }

    /// Compiles the script, resolving every parameter reference.
    pub fn compile(&self) -> Result<CompiledPatch> {
        let mut statements = Vec::new();

        for raw in split_statements(&self.script) {
            let stmt = raw.trim();
            if stmt.is_empty() {
                continue;
            }
            statements.push(self.parse_statement(stmt)?);
        }

        if statements.is_empty() {
            return Err(Error::InvalidPatch("script contains no statements".into()));
        }

        Ok(CompiledPatch { statements })
    }

    fn parse_statement(&self, stmt: &str) -> Result<Statement> {
        if let Some(rest) = stmt.strip_prefix("delete ") {
            return Ok(Statement::Unset {
                path: parse_path(rest.trim())?,
            });
        }

        if let Some(idx) = stmt.find(".push(") {
            if let Ok(path) = parse_path(&stmt[..idx]) {
                let arg = stmt[idx + ".push(".len()..]
                    .strip_suffix(')')
                    .ok_or_else(|| Error::InvalidPatch(format!("unterminated push in '{stmt}'")))?;
                return Ok(Statement::Push {
                    path,
                    value: self.parse_expr(arg)?,
                });
            }
        }

        let eq = stmt
            .find('=')
            .ok_or_else(|| Error::InvalidPatch(format!("unrecognized statement '{stmt}'")))?;
        let (lhs, rhs) = (&stmt[..eq], &stmt[eq + 1..]);

        match lhs.strip_suffix('+') {
            Some(target) => {
                let by = self.parse_expr(rhs)?;
                if !by.is_number() {
                    return Err(Error::InvalidPatch(format!(
                        "increment of '{}' requires a number, got {by}",
                        target.trim()
                    )));
                }
                Ok(Statement::Increment {
                    path: parse_path(target)?,
                    by,
                })
            }
            None => Ok(Statement::Set {
                path: parse_path(lhs)?,
                value: self.parse_expr(rhs)?,
            }),
        }
    }

    fn parse_expr(&self, expr: &str) -> Result<Value> {
        let expr = expr.trim();

        if let Some(name) = expr.strip_prefix('$') {
            return self
                .values
                .get(name)
                .cloned()
                .ok_or_else(|| Error::InvalidPatch(format!("missing value for parameter '${name}'")));
        }

        serde_json::from_str(expr)
            .map_err(|e| Error::InvalidPatch(format!("invalid literal '{expr}': {e}")))
    }
}

/// Splits a script on `;` and newlines that are outside string literals and
/// brackets.
fn split_statements(script: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut start = 0;
    let mut depth = 0i32;
    let mut in_string = false;
    let mut escaped = false;

    for (i, c) in script.char_indices() {
        if in_string {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }

        match c {
            '"' => in_string = true,
            '[' | '{' | '(' => depth += 1,
            ']' | '}' | ')' => depth -= 1,
            ';' | '\n' if depth == 0 => {
                parts.push(&script[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }

    parts.push(&script[start..]);
    parts
}

fn parse_path(text: &str) -> Result<Vec<String>> {
    let text = text.trim();
    let rest = text
        .strip_prefix("this.")
        .ok_or_else(|| Error::InvalidPatch(format!("path '{text}' must start with 'this.'")))?;

    let segments: Vec<String> = rest.split('.').map(str::to_string).collect();
    for segment in &segments {
        let valid = !segment.is_empty()
            && segment
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
        if !valid {
            return Err(Error::InvalidPatch(format!("invalid property name in path '{text}'")));
        }
    }

    Ok(segments)
}

// =============================================================================
// Compiled Patch
// =============================================================================

#[derive(Debug, Clone, PartialEq)]
enum Statement {
    Set { path: Vec<String>, value: Value },
    Unset { path: Vec<String> },
    Increment { path: Vec<String>, by: Value },
    Push { path: Vec<String>, value: Value },
}

/// A patch ready to be applied to document bodies.
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledPatch {
    statements: Vec<Statement>,
}

impl CompiledPatch {
    /// Applies every statement in order.
    ///
    /// Returns `true` if the body changed. On error the body may be partially
    /// modified; callers discard it (the writer rolls the command back).
    pub fn apply(&self, body: &mut Value) -> Result<bool> {
        let mut modified = false;

        for statement in &self.statements {
            modified |= match statement {
                Statement::Set { path, value } => {
                    let (parent, name) = parent_mut(body, path, true)?;
                    match parent {
                        Some(map) => map.insert(name.to_string(), value.clone()).as_ref() != Some(value),
                        None => false,
                    }
                }
                Statement::Unset { path } => {
                    let (parent, name) = parent_mut(body, path, false)?;
                    parent.and_then(|map| map.remove(name)).is_some()
                }
                Statement::Increment { path, by } => {
                    let (parent, name) = parent_mut(body, path, true)?;
                    match parent {
                        Some(map) => {
                            let current = map.get(name).cloned().unwrap_or(Value::Null);
                            let next = add_numbers(&current, by, path)?;
                            let changed = current != next;
                            map.insert(name.to_string(), next);
                            changed
                        }
                        None => false,
                    }
                }
                Statement::Push { path, value } => {
                    let (parent, name) = parent_mut(body, path, true)?;
                    match parent {
                        Some(map) => {
                            let slot = map
                                .entry(name.to_string())
                                .or_insert_with(|| Value::Array(Vec::new()));
                            match slot {
                                Value::Array(items) => {
                                    items.push(value.clone());
                                    true
                                }
                                other => {
                                    return Err(Error::InvalidPatch(format!(
                                        "cannot push to 'this.{}': not an array ({other})",
                                        path.join(".")
                                    )))
                                }
                            }
                        }
                        None => false,
                    }
                }
            };
        }

        Ok(modified)
    }
}

/// Walks to the object holding the last path segment.
///
/// With `create`, missing intermediate objects are created; without it, a
/// missing intermediate yields `None`.
fn parent_mut<'a, 'p>(
    body: &'a mut Value,
    path: &'p [String],
    create: bool,
) -> Result<(Option<&'a mut Map<String, Value>>, &'p str)> {
    let (name, parents) = path
        .split_last()
        .ok_or_else(|| Error::InvalidPatch("empty path".into()))?;

    let mut current = match body {
        Value::Object(map) => map,
        _ => return Err(Error::InvalidPatch("document body is not an object".into())),
    };

    for segment in parents {
        if !current.contains_key(segment.as_str()) {
            if !create {
                return Ok((None, name));
            }
            current.insert(segment.clone(), Value::Object(Map::new()));
        }

        current = match current.get_mut(segment.as_str()) {
            Some(Value::Object(map)) => map,
            _ => {
                return Err(Error::InvalidPatch(format!(
                    "'{segment}' in path 'this.{}' is not an object",
                    path.join(".")
                )))
            }
        };
    }

    Ok((Some(current), name))
}

fn add_numbers(current: &Value, by: &Value, path: &[String]) -> Result<Value> {
    let not_a_number = || {
        Error::InvalidPatch(format!(
            "cannot increment 'this.{}': current value {current} is not a number",
            path.join(".")
        ))
    };

    let zero = Value::from(0);
    let current = match current {
        Value::Null => &zero,
        Value::Number(_) => current,
        _ => return Err(not_a_number()),
    };

    if let (Some(a), Some(b)) = (current.as_i64(), by.as_i64()) {
        if let Some(sum) = a.checked_add(b) {
            return Ok(Value::from(sum));
        }
    }

    let a = current.as_f64().ok_or_else(not_a_number)?;
    let b = by.as_f64().ok_or_else(not_a_number)?;
    Number::from_f64(a + b)
        .map(Value::Number)
        .ok_or_else(|| Error::InvalidPatch(format!("increment of 'this.{}' overflowed", path.join("."))))
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_set_and_increment() {
        let patch = PatchRequest::new("this.Status = \"Shipped\"; this.Freight += $extra")
            .with_value("extra", json!(5))
            .compile()
            .unwrap();

        let mut body = json!({"Status": "New", "Freight": 10});
        assert!(patch.apply(&mut body).unwrap());
        assert_eq!(body, json!({"Status": "Shipped", "Freight": 15}));
    }

    #[test]
    fn test_nested_set_creates_parents() {
        let patch = PatchRequest::new("this.Address.City = \"Oslo\"").compile().unwrap();

        let mut body = json!({});
        assert!(patch.apply(&mut body).unwrap());
        assert_eq!(body, json!({"Address": {"City": "Oslo"}}));
    }

    #[test]
    fn test_push_and_delete() {
        let patch = PatchRequest::new("this.Tags.push(\"bulk;tag\")\ndelete this.Notes")
            .compile()
            .unwrap();

        let mut body = json!({"Notes": "x"});
        assert!(patch.apply(&mut body).unwrap());
        assert_eq!(body, json!({"Tags": ["bulk;tag"]}));
    }

    #[test]
    fn test_unchanged_document_reports_not_modified() {
        let patch = PatchRequest::new("this.Status = \"Shipped\"; delete this.Missing.Deep")
            .compile()
            .unwrap();

        let mut body = json!({"Status": "Shipped"});
        assert!(!patch.apply(&mut body).unwrap());
    }

    #[test]
    fn test_compile_errors() {
        assert!(matches!(
            PatchRequest::new("this.A = $missing").compile(),
            Err(Error::InvalidPatch(_))
        ));
        assert!(matches!(
            PatchRequest::new("A = 1").compile(),
            Err(Error::InvalidPatch(_))
        ));
        assert!(matches!(
            PatchRequest::new("this.A = not-json").compile(),
            Err(Error::InvalidPatch(_))
        ));
        assert!(matches!(
            PatchRequest::new("this.A += \"x\"").compile(),
            Err(Error::InvalidPatch(_))
        ));
        assert!(matches!(PatchRequest::new("  ;  ").compile(), Err(Error::InvalidPatch(_))));
    }

    #[test]
    fn test_increment_of_string_fails_at_apply() {
        let patch = PatchRequest::new("this.Name += 1").compile().unwrap();
        let mut body = json!({"Name": "Alice"});
        assert!(matches!(patch.apply(&mut body), Err(Error::InvalidPatch(_))));
    }

    #[test]
    fn test_float_increment() {
        let patch = PatchRequest::new("this.Price += 0.5").compile().unwrap();
        let mut body = json!({"Price": 1});
        patch.apply(&mut body).unwrap();
        assert_eq!(body, json!({"Price": 1.5}));
    }
}
