//! SQL template references: `{CUBE}`, `{CUBE.member}`, `{member}`,
//! `{Cube}` and `{Cube.member}`. A leading `$` is accepted as well.

use once_cell::sync::Lazy;
use regex::Regex;

static REFERENCE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\$?\{([A-Za-z_][A-Za-z0-9_]*)(?:\.([A-Za-z_][A-Za-z0-9_]*))?\}")
        .expect("valid template regex")
});

pub const SELF_REFERENCE: &str = "CUBE";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TemplatePart {
    Text(String),
    Reference { head: String, member: Option<String> },
}

pub fn parse(template: &str) -> Vec<TemplatePart> {
    let mut parts = Vec::new();
    let mut last = 0;
    for cap in REFERENCE.captures_iter(template) {
        let Some(whole) = cap.get(0) else { continue };
        if whole.start() > last {
            parts.push(TemplatePart::Text(template[last..whole.start()].to_string()));
        }
        parts.push(TemplatePart::Reference {
            head: cap[1].to_string(),
            member: cap.get(2).map(|m| m.as_str().to_string()),
        });
        last = whole.end();
    }
    if last < template.len() {
        parts.push(TemplatePart::Text(template[last..].to_string()));
    }
    parts
}

pub fn has_references(template: &str) -> bool {
    REFERENCE.is_match(template)
}
