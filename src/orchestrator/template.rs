//! Parameter templating (§4.6.3, §9 "Dynamic 'sandbox' evaluation"). Renders
//! `{{ name.field }}` placeholders against a flat context of named JSON
//! values. Deliberately narrower than a general template language: dotted
//! field access and literal substitution only, no user code, no access to
//! process globals, the filesystem, the network, or process control.
//!
//! Grounded in the regex-based substitution the original tool used for the
//! same job (`template_pattern = r'\{\{\s*(\w+)\.(\w+)\s*\}\}'` with
//! `re.sub`), rather than its Jinja2 `SandboxedEnvironment` path, which pulls
//! in a far larger expression grammar than dotted field access needs.

use std::collections::HashMap;

use regex::Regex;
use serde_json::Value;

fn placeholder_pattern() -> Regex {
    Regex::new(r"\{\{\s*([A-Za-z_][A-Za-z0-9_]*)\.([A-Za-z_][A-Za-z0-9_]*)\s*\}\}").unwrap()
}

#[derive(Debug, thiserror::Error)]
pub enum TemplateError {
    #[error("unresolved template reference {name}.{field}")]
    UnresolvedReference { name: String, field: String },
}

/// Render every `{{ name.field }}` occurrence in `template` by looking up
/// `name` in `context` and then `field` within that value (object keys only;
/// arrays and scalars have no resolvable fields). The whole placeholder is
/// replaced with the field's value formatted as a bare string (JSON string
/// contents unquoted, other JSON scalars via their plain `Display`).
///
/// A template containing no placeholders passes through unchanged. A
/// placeholder whose name or field cannot be resolved is an error, never a
/// silent empty substitution — callers surface this as a node failure
/// (§4.6.3: "must not propagate uncaught").
pub fn render(template: &str, context: &HashMap<String, Value>) -> Result<String, TemplateError> {
    let mut err: Option<TemplateError> = None;
    let pattern = placeholder_pattern();
    let rendered = pattern.replace_all(template, |caps: &regex::Captures| {
        if err.is_some() {
            return String::new();
        }
        let name = &caps[1];
        let field = &caps[2];
        match resolve(context, name, field) {
            Some(value) => scalar_to_string(value),
            None => {
                err = Some(TemplateError::UnresolvedReference {
                    name: name.to_string(),
                    field: field.to_string(),
                });
                String::new()
            }
        }
    });

    match err {
        Some(e) => Err(e),
        None => Ok(rendered.into_owned()),
    }
}

/// Every `name.field` pair a template references, without requiring a
/// context to resolve them against. Used by workflow registration to confirm
/// every referenced name is a declared predecessor or the literal
/// `global_parameters` bucket (§4.6.1 "template reference confinement").
pub fn referenced_names(template: &str) -> Vec<(String, String)> {
    let pattern = placeholder_pattern();
    pattern
        .captures_iter(template)
        .map(|caps| (caps[1].to_string(), caps[2].to_string()))
        .collect()
}

fn resolve<'a>(context: &'a HashMap<String, Value>, name: &str, field: &str) -> Option<&'a Value> {
    context.get(name)?.as_object()?.get(field)
}

fn scalar_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx() -> HashMap<String, Value> {
        let mut c = HashMap::new();
        c.insert("opt".to_string(), json!({"energy": -75.432, "label": "relaxed"}));
        c
    }

    #[test]
    fn renders_known_placeholder() {
        let out = render("geometry from {{ opt.label }} run", &ctx()).unwrap();
        assert_eq!(out, "geometry from relaxed run");
    }

    #[test]
    fn renders_numeric_field_without_quotes() {
        let out = render("E0 = {{ opt.energy }}", &ctx()).unwrap();
        assert_eq!(out, "E0 = -75.432");
    }

    #[test]
    fn passes_through_template_with_no_placeholders() {
        let out = render("plain text, no refs", &ctx()).unwrap();
        assert_eq!(out, "plain text, no refs");
    }

    #[test]
    fn errors_on_unknown_name() {
        let err = render("{{ missing.field }}", &ctx()).unwrap_err();
        assert!(matches!(err, TemplateError::UnresolvedReference { name, .. } if name == "missing"));
    }

    #[test]
    fn errors_on_unknown_field() {
        let err = render("{{ opt.nonexistent }}", &ctx()).unwrap_err();
        assert!(matches!(err, TemplateError::UnresolvedReference { field, .. } if field == "nonexistent"));
    }

    #[test]
    fn referenced_names_collects_all_pairs_even_duplicates() {
        let refs = referenced_names("{{ a.x }} and {{ b.y }} and {{ a.x }}");
        assert_eq!(
            refs,
            vec![
                ("a".to_string(), "x".to_string()),
                ("b".to_string(), "y".to_string()),
                ("a".to_string(), "x".to_string()),
            ]
        );
    }

    #[test]
    fn no_code_execution_surface_only_dotted_field_syntax_is_recognized() {
        let refs = referenced_names("{{ os.system('rm -rf') }} {{ a.b }}");
        assert_eq!(refs, vec![("a".to_string(), "b".to_string())]);
    }
}
