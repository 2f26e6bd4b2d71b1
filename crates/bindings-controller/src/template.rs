//! Mapping templates
//!
//! Mapping values use `{{ ... }}` templates rendered against the data of the
//! projected secret. The Go-style leading dot (`{{ .username }}`) that
//! existing bindings use is accepted and stripped before rendering.
//!
//! Undefined keys are errors, never empty strings.

use std::collections::BTreeMap;
use std::fmt;

use minijinja::{Environment, UndefinedBehavior};

/// Errors raised while rendering a mapping template
#[derive(Debug)]
pub enum TemplateError {
    /// Parsing or rendering failed
    Render(minijinja::Error),
}

impl fmt::Display for TemplateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Render(e) => write!(f, "template render error: {}", e),
        }
    }
}

impl std::error::Error for TemplateError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Render(e) => Some(e),
        }
    }
}

impl From<minijinja::Error> for TemplateError {
    fn from(err: minijinja::Error) -> Self {
        Self::Render(err)
    }
}

/// Strict template engine for mapping values
pub struct TemplateEngine {
    env: Environment<'static>,
}

impl Default for TemplateEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl TemplateEngine {
    /// Create an engine with strict undefined handling
    pub fn new() -> Self {
        let mut env = Environment::new();
        env.set_undefined_behavior(UndefinedBehavior::Strict);
        env.set_keep_trailing_newline(true);
        Self { env }
    }

    /// Render `template` against `values`.
    ///
    /// Keys containing `-` are also reachable with `_` in their place.
    pub fn render(
        &self,
        template: &str,
        values: &BTreeMap<String, String>,
    ) -> Result<String, TemplateError> {
        let mut ctx = values.clone();
        for (key, value) in values {
            if key.contains('-') {
                ctx.entry(key.replace('-', "_"))
                    .or_insert_with(|| value.clone());
            }
        }

        let normalized = normalize_field_access(template);
        Ok(self.env.render_str(&normalized, ctx)?)
    }

    /// Check if a string contains any template syntax
    pub fn has_template_syntax(s: &str) -> bool {
        s.contains("{{") || s.contains("{%") || s.contains("{#")
    }
}

/// Strip Go-style leading dots inside `{{ ... }}` expressions.
///
/// `{{ .username }}` becomes `{{ username }}` and `{{ .my-key }}` becomes
/// `{{ my_key }}`. Attribute access (`a.b`), numbers and quoted strings are
/// left untouched.
fn normalize_field_access(template: &str) -> String {
    let mut result = String::with_capacity(template.len());
    let mut remaining = template;

    while let Some(start) = remaining.find("{{") {
        result.push_str(&remaining[..start + 2]);
        remaining = &remaining[start + 2..];

        if let Some(end) = remaining.find("}}") {
            result.push_str(&normalize_expression(&remaining[..end]));
            result.push_str("}}");
            remaining = &remaining[end + 2..];
        } else {
            result.push_str(remaining);
            remaining = "";
        }
    }

    result.push_str(remaining);
    result
}

fn continues_operand(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '_' | ')' | ']')
}

fn starts_identifier(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '_'
}

fn normalize_expression(expression: &str) -> String {
    let mut out = String::with_capacity(expression.len());
    let mut chars = expression.chars().peekable();
    let mut prev: Option<char> = None;
    let mut quote: Option<char> = None;

    while let Some(c) = chars.next() {
        if let Some(q) = quote {
            out.push(c);
            if c == q {
                quote = None;
            }
            prev = Some(c);
            continue;
        }

        match c {
            '"' | '\'' => {
                quote = Some(c);
                out.push(c);
                prev = Some(c);
            }
            '.' if !prev.is_some_and(continues_operand)
                && chars.peek().is_some_and(|n| starts_identifier(*n)) =>
            {
                while let Some(&n) = chars.peek() {
                    if n.is_ascii_alphanumeric() || n == '_' {
                        out.push(n);
                    } else if n == '-' {
                        out.push('_');
                    } else {
                        break;
                    }
                    prev = Some(n);
                    chars.next();
                }
            }
            _ => {
                out.push(c);
                prev = Some(c);
            }
        }
    }

    out
}
