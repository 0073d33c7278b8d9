//! `{{ placeholder }}` rendering for message steps and agent instructions

use crate::property::Values;
use serde_json::Value;

/// Placeholder names in order of first appearance
pub fn variables(template: &str) -> Vec<String> {
    let mut names: Vec<String> = Vec::new();
    for segment in parse(template) {
        if let Segment::Var(name) = segment {
            if !names.iter().any(|n| n == name) {
                names.push(name.to_string());
            }
        }
    }
    names
}

/// Substitute placeholders. Strings are inserted verbatim, other values as
/// JSON; missing values are reported by name.
pub fn render(template: &str, values: &Values) -> Result<String, String> {
    let mut out = String::with_capacity(template.len());
    for segment in parse(template) {
        match segment {
            Segment::Text(text) => out.push_str(text),
            Segment::Var(name) => match values.get(name) {
                Some(Value::String(s)) => out.push_str(s),
                Some(other) => out.push_str(&other.to_string()),
                None => return Err(format!("no value for template variable `{name}`")),
            },
        }
    }
    Ok(out)
}

enum Segment<'a> {
    Text(&'a str),
    Var(&'a str),
}

fn parse(template: &str) -> Vec<Segment<'_>> {
    let mut segments = Vec::new();
    let mut rest = template;
    while let Some(open) = rest.find("{{") {
        let Some(close) = rest[open + 2..].find("}}") else {
            break;
        };
        let name = rest[open + 2..open + 2 + close].trim();
        if is_identifier(name) {
            segments.push(Segment::Text(&rest[..open]));
            segments.push(Segment::Var(name));
        } else {
            segments.push(Segment::Text(&rest[..open + 4 + close]));
        }
        rest = &rest[open + 4 + close..];
    }
    segments.push(Segment::Text(rest));
    segments
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}
