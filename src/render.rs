use std::sync::Arc;

use askama::Template;
use serde_json::{Map, Value};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RenderError {
    #[error("unknown template {0}")]
    UnknownTemplate(String),
    #[error("failed to render page: {0}")]
    Template(#[from] askama::Error),
}

/// PageRenderer
///
/// The page-rendering collaborator. Handlers hand it a template name and the data
/// accumulated on the request context; what the page looks like is its business.
pub trait PageRenderer: Send + Sync {
    fn render(&self, template: &str, data: &Map<String, Value>) -> Result<String, RenderError>;
}

pub type RendererState = Arc<dyn PageRenderer>;

/// HtmlRenderer
///
/// Minimal renderer: an HTML document naming the template, with the data as a
/// definition list. Enough for browsers and for tests to assert on.
#[derive(Debug, Default, Clone)]
pub struct HtmlRenderer;

#[derive(Template)]
#[template(path = "page.html")]
struct PageTemplate<'a> {
    title: String,
    template_name: &'a str,
    entries: Vec<(&'a str, String)>,
}

fn display(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

impl PageRenderer for HtmlRenderer {
    fn render(&self, template: &str, data: &Map<String, Value>) -> Result<String, RenderError> {
        if template.is_empty() {
            return Err(RenderError::UnknownTemplate(template.to_owned()));
        }
        let page = PageTemplate {
            title: data
                .get("Title")
                .map(display)
                .unwrap_or_else(|| template.to_owned()),
            template_name: template,
            entries: data
                .iter()
                .map(|(key, value)| (key.as_str(), display(value)))
                .collect(),
        };
        Ok(page.render()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn values_are_escaped() {
        let mut data = Map::new();
        data.insert("Title".into(), Value::from("<script>"));
        let html = HtmlRenderer.render("repo/home", &data).unwrap();
        assert!(html.contains("data-template=\"repo/home\""));
        assert!(html.contains("<dt>Title</dt><dd>"));
        assert!(!html.contains("<script>"));
    }

    #[test]
    fn every_entry_is_listed() {
        let mut data = Map::new();
        data.insert("NumUsers".into(), Value::from(4));
        data.insert("Link".into(), Value::from("/a?b=1&c=2"));
        let html = HtmlRenderer.render("admin/dashboard", &data).unwrap();
        assert!(html.contains("<title>admin/dashboard</title>"));
        assert!(html.contains("<dt>NumUsers</dt><dd>4</dd>"));
        assert!(html.contains("<dd>/a?b=1&"));
        assert!(!html.contains("b=1&c=2"));
    }
}
