//! Markdown + YAML frontmatter serialization.
//!
//! An item file looks like:
//!
//! ```text
//! ---
//! title: Reading list
//! keywords:
//! - books
//! ---
//! Free-form Markdown body.
//! ```
//!
//! A file without a leading `---` line has empty frontmatter and is all body.

use anyhow::{bail, Context, Result};

use crate::models::Frontmatter;

const FENCE: &str = "---";

pub fn parse(text: &str) -> Result<(Frontmatter, String)> {
    let text = text.strip_prefix('\u{feff}').unwrap_or(text);
    let mut lines = text.split_inclusive('\n');

    let first = match lines.next() {
        Some(line) if line.trim_end() == FENCE => line,
        _ => return Ok((Frontmatter::default(), text.to_string())),
    };

    let yaml_start = first.len();
    let mut offset = yaml_start;
    for line in lines {
        if line.trim_end() == FENCE {
            let yaml = &text[yaml_start..offset];
            let body = &text[offset + line.len()..];
            let meta = if yaml.trim().is_empty() {
                Frontmatter::default()
            } else {
                serde_yaml::from_str(yaml).context("invalid YAML frontmatter")?
            };
            return Ok((meta, body.to_string()));
        }
        offset += line.len();
    }

    bail!("unterminated frontmatter: missing closing '---' line")
}

pub fn render(meta: &Frontmatter, body: &str) -> Result<String> {
    let yaml = serde_yaml::to_string(meta).context("failed to serialize frontmatter")?;
    Ok(format!("{FENCE}\n{yaml}{FENCE}\n{body}"))
}
