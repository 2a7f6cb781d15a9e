//! Rendering of credential headers from token payloads

use std::{borrow::Cow, collections::BTreeMap};

use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use serde_json::Value;

/// Concrete credential headers, keyed by header name
pub type AuthHeaders = BTreeMap<String, String>;

static PLACEHOLDER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{\{\s*([^{}]*?)\s*\}\}").expect("placeholder pattern is valid"));

/// Renders header templates such as `Bearer {{ token }}` against a context
///
/// Placeholders name a value in the context, optionally as a dotted path
/// (`{{ user.id }}`). Placeholders that do not resolve render as an empty
/// string.
#[derive(Clone, Debug, Default)]
pub struct HeaderFormatter {
    templates: BTreeMap<String, String>,
}

impl HeaderFormatter {
    /// Constructs a formatter from header templates
    pub fn new(templates: BTreeMap<String, String>) -> Self {
        Self { templates }
    }

    /// Renders every template against `context`
    pub fn format(&self, context: &Value) -> AuthHeaders {
        self.templates
            .iter()
            .map(|(name, template)| (name.clone(), render(template, context)))
            .collect()
    }
}

/// Renders a single template against `context`
pub fn render(template: &str, context: &Value) -> String {
    PLACEHOLDER
        .replace_all(template, |caps: &Captures| {
            lookup(context, &caps[1])
                .map(stringify)
                .unwrap_or_default()
        })
        .into_owned()
}

fn lookup<'a>(context: &'a Value, path: &str) -> Option<&'a Value> {
    if path.is_empty() {
        return None;
    }

    path.split('.').try_fold(context, |value, segment| match value {
        Value::Object(map) => map.get(segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

fn stringify(value: &Value) -> Cow<'_, str> {
    match value {
        Value::Null => Cow::Borrowed(""),
        Value::String(s) => Cow::Borrowed(s),
        other => Cow::Owned(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn bearer() -> HeaderFormatter {
        let mut templates = BTreeMap::new();
        templates.insert("Authorization".to_owned(), "Bearer {{ token }}".to_owned());
        HeaderFormatter::new(templates)
    }

    #[test]
    fn renders_the_default_bearer_template() {
        let headers = bearer().format(&json!({ "token": "abc" }));
        assert_eq!(headers.get("Authorization").map(String::as_str), Some("Bearer abc"));
        assert_eq!(headers.len(), 1);
    }

    #[test]
    fn unknown_placeholders_render_empty() {
        assert_eq!(render("Bearer {{ missing }}", &json!({ "token": "abc" })), "Bearer ");
        assert_eq!(render("{{}}x", &json!({})), "x");
    }

    #[test]
    fn whitespace_inside_braces_is_optional() {
        let context = json!({ "token": "abc" });
        assert_eq!(render("{{token}}|{{   token   }}", &context), "abc|abc");
    }

    #[test]
    fn dotted_paths_walk_nested_values() {
        let context = json!({ "user": { "id": 42, "roles": ["admin", "dev"] } });
        assert_eq!(render("{{ user.id }}", &context), "42");
        assert_eq!(render("{{ user.roles.1 }}", &context), "dev");
        assert_eq!(render("{{ user.roles }}", &context), r#"["admin","dev"]"#);
    }

    #[test]
    fn scalars_render_as_json_text_and_null_as_empty() {
        let context = json!({ "flag": true, "ratio": 1.5, "nothing": null });
        assert_eq!(render("{{ flag }}/{{ ratio }}/{{ nothing }}", &context), "true/1.5/");
    }

    #[test]
    fn unterminated_placeholders_are_left_alone() {
        assert_eq!(render("Bearer {{ token", &json!({ "token": "abc" })), "Bearer {{ token");
    }

    #[test]
    fn every_template_is_rendered() {
        let mut templates = BTreeMap::new();
        templates.insert("access-token".to_owned(), "{{ token }}".to_owned());
        templates.insert("client".to_owned(), "{{ client }}".to_owned());
        templates.insert("token-type".to_owned(), "Bearer".to_owned());

        let headers = HeaderFormatter::new(templates).format(&json!({ "token": "t", "client": "c" }));

        assert_eq!(headers.get("access-token").map(String::as_str), Some("t"));
        assert_eq!(headers.get("client").map(String::as_str), Some("c"));
        assert_eq!(headers.get("token-type").map(String::as_str), Some("Bearer"));
    }
}
