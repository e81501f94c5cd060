//! HTML page templates with `{{ path }}` placeholders.
//!
//! A placeholder names a dotted path into a JSON context (`ip`,
//! `ip_details.asn.autonomous_system_organization`, `links.0.url`). Values
//! are HTML-escaped; unknown paths and `null` render as an empty string.

use std::collections::HashMap;
use std::path::Path;
use std::sync::LazyLock;

use regex::{Captures, Regex};
use serde_json::Value;
use tracing::{debug, warn};

static PLACEHOLDER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{\{\s*([A-Za-z0-9_.]+)\s*\}\}").expect("placeholder pattern is valid")
});

static ANSI_SGR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\x1b\[[0-9;]*m").expect("SGR pattern is valid"));

/// Removes ANSI colour sequences, for embedding terminal output in HTML.
pub fn strip_ansi(text: &str) -> String {
    ANSI_SGR.replace_all(text, "").into_owned()
}

/// Escapes the five HTML-significant characters.
pub fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            c => out.push(c),
        }
    }
    out
}

fn lookup<'a>(context: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(context, |value, segment| match value {
        Value::Object(map) => map.get(segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

fn display(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// A single page template.
#[derive(Debug, Clone)]
pub struct Template {
    source: String,
}

impl Template {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
        }
    }

    /// Substitutes every placeholder from `context`.
    pub fn render(&self, context: &Value) -> String {
        PLACEHOLDER
            .replace_all(&self.source, |caps: &Captures<'_>| {
                lookup(context, &caps[1])
                    .map(|v| escape_html(&display(v)))
                    .unwrap_or_default()
            })
            .into_owned()
    }
}

/// Named templates, keyed by file stem (`index`, `share`).
#[derive(Debug, Clone, Default)]
pub struct Templates {
    pages: HashMap<String, Template>,
}

impl Templates {
    /// Loads every `*.html` file directly inside `dir`.
    ///
    /// A missing directory yields no templates; callers fall back to other
    /// representations.
    pub fn load(dir: &Path) -> Self {
        let mut templates = Self::default();
        let entries = match std::fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) => {
                warn!(dir = %dir.display(), error = %e, "templates directory not readable");
                return templates;
            }
        };

        for path in entries.filter_map(|e| e.ok()).map(|e| e.path()) {
            let is_html = path
                .extension()
                .is_some_and(|ext| ext.eq_ignore_ascii_case("html"));
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            if !is_html || !path.is_file() {
                continue;
            }
            match std::fs::read_to_string(&path) {
                Ok(source) => {
                    debug!(template = stem, "loaded template");
                    templates.insert(stem, source);
                }
                Err(e) => warn!(path = %path.display(), error = %e, "failed to read template"),
            }
        }
        templates
    }

    pub fn insert(&mut self, name: impl Into<String>, source: impl Into<String>) {
        self.pages.insert(name.into(), Template::new(source));
    }

    pub fn get(&self, name: &str) -> Option<&Template> {
        self.pages.get(name)
    }

    pub fn len(&self) -> usize {
        self.pages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn substitutes_nested_paths() {
        let tpl = Template::new("<p>{{ip}}</p><a href=\"{{ links.0.url }}\">{{links.0.name}}</a>");
        let ctx = json!({
            "ip": "10.0.0.1",
            "links": [{"name": "Wiki", "url": "https://example.org/wiki"}],
        });
        assert_eq!(
            tpl.render(&ctx),
            "<p>10.0.0.1</p><a href=\"https://example.org/wiki\">Wiki</a>"
        );
    }

    #[test]
    fn escapes_values() {
        let tpl = Template::new("{{ comment }}");
        let ctx = json!({"comment": "<script>alert('x') & \"y\"</script>"});
        assert_eq!(
            tpl.render(&ctx),
            "&lt;script&gt;alert(&#39;x&#39;) &amp; &quot;y&quot;&lt;/script&gt;"
        );
    }

    #[test]
    fn unknown_and_null_paths_are_empty() {
        let tpl = Template::new("[{{ missing.path }}][{{ nothing }}][{{ is_ip4 }}]");
        let ctx = json!({"nothing": null, "is_ip4": true});
        assert_eq!(tpl.render(&ctx), "[][][true]");
    }

    #[test]
    fn strips_sgr_sequences() {
        assert_eq!(strip_ansi("\x1b[1;32mIPv4\x1b[0m ok"), "IPv4 ok");
    }

    #[test]
    fn loads_html_files_by_stem() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("index.html"), "<h1>{{ ip }}</h1>").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let templates = Templates::load(dir.path());
        assert_eq!(templates.len(), 1);
        let page = templates.get("index").unwrap().render(&json!({"ip": "::1"}));
        assert_eq!(page, "<h1>::1</h1>");
    }
}
