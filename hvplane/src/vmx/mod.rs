//! Guest configuration directives.
//!
//! A guest's configuration is a flat list of `key = "value"` lines. A
//! directive is located by its key followed by `=`, with or without
//! surrounding whitespace. Applying a directive rewrites the existing line
//! in place, or appends one when the key is absent; duplicates of the key
//! are collapsed so every key appears once.

use hvplane_shared::errors::{HvError, HvResult};
use serde::Serialize;

use crate::channel::HostFiles;
use crate::runtime::layout::DatastoreLayout;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Directive {
    pub key: String,
    pub value: String,
}

/// Ordered set of directives applied as one edit.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DirectiveSet {
    entries: Vec<Directive>,
}

impl DirectiveSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.push(key, value);
        self
    }

    pub fn push(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.entries.push(Directive {
            key: key.into(),
            value: value.into(),
        });
    }

    pub fn extend(&mut self, other: DirectiveSet) {
        self.entries.extend(other.entries);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Directive> {
        self.entries.iter()
    }

    /// Value of the last directive with `key`.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .rev()
            .find(|d| d.key == key)
            .map(|d| d.value.as_str())
    }

    /// Parse configuration text. Comments and lines without `=` are skipped.
    pub fn parse(text: &str) -> Self {
        let entries = text
            .lines()
            .filter_map(parse_line)
            .map(|(key, value)| Directive {
                key: key.to_string(),
                value,
            })
            .collect();
        Self { entries }
    }

    /// Apply every directive to `text`, in order.
    ///
    /// # Errors
    ///
    /// Returns [`HvError::Config`] for keys or values that cannot be
    /// represented on a single quoted line.
    pub fn apply_to(&self, text: &str) -> HvResult<String> {
        let mut lines: Vec<String> = text.lines().map(String::from).collect();

        for directive in &self.entries {
            validate(directive)?;
            let line = format_line(&directive.key, &directive.value);
            let positions: Vec<usize> = lines
                .iter()
                .enumerate()
                .filter(|(_, l)| line_key(l) == Some(directive.key.as_str()))
                .map(|(i, _)| i)
                .collect();

            match positions.split_first() {
                None => lines.push(line),
                Some((first, rest)) => {
                    lines[*first] = line;
                    for idx in rest.iter().rev() {
                        lines.remove(*idx);
                    }
                }
            }
        }

        Ok(join_lines(&lines))
    }
}

/// Drop every line whose key is in `keys`.
pub fn strip_keys(text: &str, keys: &[&str]) -> String {
    let kept: Vec<String> = text
        .lines()
        .filter(|l| !line_key(l).is_some_and(|k| keys.contains(&k)))
        .map(String::from)
        .collect();
    join_lines(&kept)
}

/// Drop every line whose key starts with one of `prefixes`.
pub fn strip_prefixed(text: &str, prefixes: &[String]) -> String {
    let kept: Vec<String> = text
        .lines()
        .filter(|l| !line_key(l).is_some_and(|k| prefixes.iter().any(|p| k.starts_with(p.as_str()))))
        .map(String::from)
        .collect();
    join_lines(&kept)
}

pub fn format_line(key: &str, value: &str) -> String {
    format!("{} = \"{}\"", key, value)
}

fn join_lines(lines: &[String]) -> String {
    if lines.is_empty() {
        String::new()
    } else {
        let mut out = lines.join("\n");
        out.push('\n');
        out
    }
}

fn line_key(line: &str) -> Option<&str> {
    let trimmed = line.trim_start();
    if trimmed.starts_with('#') {
        return None;
    }
    let (key, _) = trimmed.split_once('=')?;
    let key = key.trim();
    if key.is_empty() { None } else { Some(key) }
}

fn parse_line(line: &str) -> Option<(&str, String)> {
    let key = line_key(line)?;
    let (_, value) = line.split_once('=')?;
    let value = value.trim();
    let value = value
        .strip_prefix('"')
        .and_then(|v| v.strip_suffix('"'))
        .unwrap_or(value);
    Some((key, value.to_string()))
}

fn validate(directive: &Directive) -> HvResult<()> {
    let bad_key = directive.key.is_empty()
        || directive
            .key
            .chars()
            .any(|c| c.is_whitespace() || c == '=' || c == '"');
    let bad_value = directive.value.contains(['"', '\n', '\r']);
    if bad_key || bad_value {
        return Err(HvError::Config(format!(
            "unrepresentable directive {:?} = {:?}",
            directive.key, directive.value
        )));
    }
    Ok(())
}

/// Reads and edits a guest's configuration file on the host.
#[derive(Clone)]
pub struct GuestConfigEditor {
    files: HostFiles,
    layout: DatastoreLayout,
}

impl GuestConfigEditor {
    pub fn new(files: HostFiles, layout: DatastoreLayout) -> Self {
        Self { files, layout }
    }

    pub async fn read(&self, guest: &str) -> HvResult<DirectiveSet> {
        let text = self.files.read(&self.layout.vmx_path(guest)).await?;
        Ok(DirectiveSet::parse(&text))
    }

    pub async fn apply(&self, guest: &str, directives: &DirectiveSet) -> HvResult<()> {
        let path = self.layout.vmx_path(guest);
        let text = self.files.read(&path).await?;
        let updated = directives.apply_to(&text)?;
        tracing::debug!(guest, count = directives.len(), "Applying configuration directives");
        self.files.write(&path, &updated).await
    }

    /// Drop every key under `prefixes`, then apply `directives`, in one write.
    pub async fn replace_prefixed(
        &self,
        guest: &str,
        prefixes: &[String],
        directives: &DirectiveSet,
    ) -> HvResult<()> {
        let path = self.layout.vmx_path(guest);
        let text = self.files.read(&path).await?;
        let updated = directives.apply_to(&strip_prefixed(&text, prefixes))?;
        tracing::debug!(guest, cleared = ?prefixes, count = directives.len(), "Replacing configuration directives");
        self.files.write(&path, &updated).await
    }
}
