//! Row-to-text templating.
//!
//! A handlebars template renders one decoded JSON record to the string that
//! gets embedded. Values are HTML-escaped as in standard handlebars; use
//! triple braces (`{{{field}}}`) for raw output. Missing fields render empty.

use eyre::WrapErr as _;

const TEMPLATE_NAME: &str = "row";

pub struct RowTemplate {
    registry: handlebars::Handlebars<'static>,
}

impl RowTemplate {
    pub fn compile(source: &str) -> eyre::Result<Self> {
        let mut registry = handlebars::Handlebars::new();
        registry
            .register_template_string(TEMPLATE_NAME, source)
            .wrap_err("failed to compile row template")?;
        Ok(Self { registry })
    }

    pub fn render(&self, row: &serde_json::Value) -> eyre::Result<String> {
        self.registry
            .render(TEMPLATE_NAME, row)
            .wrap_err("failed to render row template")
    }
}

impl std::fmt::Debug for RowTemplate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RowTemplate").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_renders_fields() {
        let template = RowTemplate::compile("{{name}} lives at {{address.street}}").unwrap();
        let row = serde_json::json!({"name": "Ada", "address": {"street": "Elm St"}});
        assert_eq!(template.render(&row).unwrap(), "Ada lives at Elm St");
    }

    #[test]
    fn test_missing_field_renders_empty() {
        let template = RowTemplate::compile("[{{missing}}]").unwrap();
        assert_eq!(template.render(&serde_json::json!({})).unwrap(), "[]");
    }

    #[test]
    fn test_escaping() {
        let template = RowTemplate::compile("{{v}}|{{{v}}}").unwrap();
        let row = serde_json::json!({"v": "a&b"});
        assert_eq!(template.render(&row).unwrap(), "a&amp;b|a&b");
    }

    #[test]
    fn test_invalid_template() {
        assert!(RowTemplate::compile("{{#if x}}unclosed").is_err());
    }
}
