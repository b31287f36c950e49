//! Prompt templates with `{variable}` placeholders.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::errors::TemplateError;

/// Variables substituted into a template.
pub type Variables = BTreeMap<String, String>;

/// A system/user prompt pair.
///
/// A placeholder is `{name}` where `name` is made of ASCII letters, digits and
/// underscores. Any other brace is literal, so JSON examples can be embedded
/// as-is.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromptTemplate {
    /// Template name, for errors and logs.
    pub name: String,
    /// System prompt.
    pub system: String,
    /// User prompt.
    pub user: String,
}

/// A template after substitution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenderedPrompt {
    /// System prompt.
    pub system: String,
    /// User prompt.
    pub user: String,
}

impl PromptTemplate {
    /// Creates a template.
    #[must_use]
    pub fn new(name: impl Into<String>, system: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            system: system.into(),
            user: user.into(),
        }
    }

    /// Substitutes every placeholder. Fails on the first undefined variable.
    pub fn render(&self, variables: &Variables) -> Result<RenderedPrompt, TemplateError> {
        Ok(RenderedPrompt {
            system: self.render_part(&self.system, variables)?,
            user: self.render_part(&self.user, variables)?,
        })
    }

    /// Placeholder names used by the template, sorted and deduplicated.
    #[must_use]
    pub fn placeholders(&self) -> Vec<String> {
        let mut names: Vec<String> = scan(&self.system)
            .chain(scan(&self.user))
            .filter_map(|piece| match piece {
                Piece::Placeholder(name) => Some(name.to_string()),
                Piece::Text(_) => None,
            })
            .collect();
        names.sort();
        names.dedup();
        names
    }

    fn render_part(&self, text: &str, variables: &Variables) -> Result<String, TemplateError> {
        let mut out = String::with_capacity(text.len());
        for piece in scan(text) {
            match piece {
                Piece::Text(t) => out.push_str(t),
                Piece::Placeholder(name) => {
                    let value = variables.get(name).ok_or_else(|| TemplateError {
                        template: self.name.clone(),
                        variable: name.to_string(),
                    })?;
                    out.push_str(value);
                }
            }
        }
        Ok(out)
    }
}

enum Piece<'a> {
    Text(&'a str),
    Placeholder(&'a str),
}

fn is_ident(name: &str) -> bool {
    !name.is_empty() && name.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'_')
}

fn scan(text: &str) -> impl Iterator<Item = Piece<'_>> {
    let mut pieces = Vec::new();
    let mut rest = text;
    while let Some(pos) = rest.find('{') {
        let (before, tail) = rest.split_at(pos);
        if !before.is_empty() {
            pieces.push(Piece::Text(before));
        }
        match tail[1..].find(&['{', '}'][..]) {
            Some(end) if tail[1 + end..].starts_with('}') && is_ident(&tail[1..=end]) => {
                pieces.push(Piece::Placeholder(&tail[1..=end]));
                rest = &tail[end + 2..];
            }
            _ => {
                pieces.push(Piece::Text("{"));
                rest = &tail[1..];
            }
        }
    }
    if !rest.is_empty() {
        pieces.push(Piece::Text(rest));
    }
    pieces.into_iter()
}

/// Builds a [`Variables`] map from pairs.
#[must_use]
pub fn variables<K, V, I>(pairs: I) -> Variables
where
    I: IntoIterator<Item = (K, V)>,
    K: Into<String>,
    V: Into<String>,
{
    pairs.into_iter().map(|(k, v)| (k.into(), v.into())).collect()
}
