//! Resource patterns, group templates, and name validation.
//!
//! A resource pattern is a `.`-separated sequence of tokens:
//!
//! - `book` matches the literal segment `book`
//! - `$id` matches any single segment and binds it as path parameter `id`
//! - `*` matches any single segment without binding it
//! - `>` matches one or more trailing segments; only legal as the last token
//!
//! A group template such as `shelf.${shelf}` renders a concurrency group key
//! from the bound path parameters.

use std::collections::{HashMap, HashSet};
use std::fmt;

use crate::error::PatternError;

/// Separator between tokens of resource names and patterns.
pub const SEPARATOR: char = '.';
/// Marker that starts a placeholder token.
pub const PLACEHOLDER_MARKER: char = '$';
/// Single-segment anonymous wildcard.
pub const WILDCARD: &str = "*";
/// Trailing multi-segment wildcard.
pub const FULL_WILDCARD: &str = ">";

/// Path parameters bound by placeholder tokens.
pub type PathParams = HashMap<String, String>;

// =============================================================================
// ResourcePattern
// =============================================================================

/// A single token of a [`ResourcePattern`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PatternToken {
    /// Matches exactly this segment.
    Literal(String),
    /// Matches any segment and binds it under the given name.
    Placeholder(String),
    /// Matches any single segment.
    Wildcard,
    /// Matches one or more trailing segments.
    FullWildcard,
}

impl fmt::Display for PatternToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Literal(s) => f.write_str(s),
            Self::Placeholder(name) => write!(f, "{PLACEHOLDER_MARKER}{name}"),
            Self::Wildcard => f.write_str(WILDCARD),
            Self::FullWildcard => f.write_str(FULL_WILDCARD),
        }
    }
}

/// A parsed, validated resource pattern.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResourcePattern {
    raw: String,
    tokens: Vec<PatternToken>,
}

impl ResourcePattern {
    /// Parses a pattern such as `library.book.$id`.
    pub fn parse(pattern: &str) -> Result<Self, PatternError> {
        if pattern.is_empty() {
            return Err(PatternError::Empty);
        }

        let segments: Vec<&str> = pattern.split(SEPARATOR).collect();
        let last = segments.len() - 1;
        let mut seen = HashSet::new();
        let mut tokens = Vec::with_capacity(segments.len());

        for (i, segment) in segments.into_iter().enumerate() {
            let token = match segment {
                "" => {
                    return Err(PatternError::EmptyToken {
                        pattern: pattern.to_string(),
                    });
                }
                FULL_WILDCARD if i != last => {
                    return Err(PatternError::MisplacedFullWildcard {
                        pattern: pattern.to_string(),
                    });
                }
                FULL_WILDCARD => PatternToken::FullWildcard,
                WILDCARD => PatternToken::Wildcard,
                s if s.starts_with(PLACEHOLDER_MARKER) => {
                    let name = &s[PLACEHOLDER_MARKER.len_utf8()..];
                    if name.is_empty() || has_reserved_char(name) {
                        return Err(invalid_token(pattern, s));
                    }
                    if !seen.insert(name.to_string()) {
                        return Err(PatternError::DuplicatePlaceholder {
                            pattern: pattern.to_string(),
                            name: name.to_string(),
                        });
                    }
                    PatternToken::Placeholder(name.to_string())
                }
                s if has_reserved_char(s) => return Err(invalid_token(pattern, s)),
                s => PatternToken::Literal(s.to_string()),
            };
            tokens.push(token);
        }

        Ok(Self {
            raw: pattern.to_string(),
            tokens,
        })
    }

    /// Returns the pattern as written.
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Returns the parsed tokens.
    pub fn tokens(&self) -> &[PatternToken] {
        &self.tokens
    }

    /// Iterates over the placeholder names in order.
    pub fn placeholders(&self) -> impl Iterator<Item = &str> {
        self.tokens.iter().filter_map(|t| match t {
            PatternToken::Placeholder(name) => Some(name.as_str()),
            _ => None,
        })
    }

    /// Returns `true` if the pattern ends with a full wildcard.
    pub fn has_full_wildcard(&self) -> bool {
        matches!(self.tokens.last(), Some(PatternToken::FullWildcard))
    }

    /// Returns this pattern mounted under `prefix`.
    ///
    /// An empty prefix returns the pattern unchanged.
    pub fn prefixed(&self, prefix: &str) -> Result<Self, PatternError> {
        if prefix.is_empty() {
            return Ok(self.clone());
        }
        Self::parse(&format!("{prefix}{SEPARATOR}{}", self.raw))
    }
}

impl fmt::Display for ResourcePattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

fn has_reserved_char(s: &str) -> bool {
    s.contains(['*', '>', PLACEHOLDER_MARKER, ' ', '\t', '\n', '\r'])
}

fn invalid_token(pattern: &str, token: &str) -> PatternError {
    PatternError::InvalidToken {
        pattern: pattern.to_string(),
        token: token.to_string(),
    }
}

// =============================================================================
// GroupTemplate
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
enum GroupPart {
    Text(String),
    Tag(String),
}

/// A group key template with `${tag}` substitutions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupTemplate {
    raw: String,
    parts: Vec<GroupPart>,
}

impl GroupTemplate {
    /// Parses a template such as `library.shelf.${shelf}`.
    pub fn parse(template: &str) -> Result<Self, PatternError> {
        let invalid = |reason: &str| PatternError::InvalidGroup {
            template: template.to_string(),
            reason: reason.to_string(),
        };

        if template.is_empty() {
            return Err(invalid("template is empty"));
        }

        let mut parts = Vec::new();
        let mut rest = template;
        while let Some(start) = rest.find("${") {
            if start > 0 {
                parts.push(GroupPart::Text(rest[..start].to_string()));
            }
            let after = &rest[start + 2..];
            let end = after.find('}').ok_or_else(|| invalid("unclosed '${'"))?;
            let tag = &after[..end];
            if tag.is_empty() {
                return Err(invalid("empty tag"));
            }
            parts.push(GroupPart::Tag(tag.to_string()));
            rest = &after[end + 1..];
        }
        if !rest.is_empty() {
            parts.push(GroupPart::Text(rest.to_string()));
        }

        Ok(Self {
            raw: template.to_string(),
            parts,
        })
    }

    /// Returns the template as written.
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Iterates over the tag names referenced by the template.
    pub fn tags(&self) -> impl Iterator<Item = &str> {
        self.parts.iter().filter_map(|p| match p {
            GroupPart::Tag(tag) => Some(tag.as_str()),
            GroupPart::Text(_) => None,
        })
    }

    /// Renders the group key. Unbound tags render as empty strings.
    pub fn render(&self, params: &PathParams) -> String {
        let mut out = String::with_capacity(self.raw.len());
        for part in &self.parts {
            match part {
                GroupPart::Text(text) => out.push_str(text),
                GroupPart::Tag(tag) => {
                    if let Some(value) = params.get(tag) {
                        out.push_str(value);
                    }
                }
            }
        }
        out
    }
}

impl fmt::Display for GroupTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

// =============================================================================
// Name validation
// =============================================================================

/// Checks that `name` is a concrete resource name.
pub fn validate_resource_name(name: &str) -> Result<(), String> {
    if name.is_empty() {
        return Err("resource name is empty".to_string());
    }
    for segment in name.split(SEPARATOR) {
        if segment.is_empty() {
            return Err(format!("resource name '{name}' contains an empty token"));
        }
        if segment.contains(['*', '>', ' ', '\t', '\n', '\r']) {
            return Err(format!("resource name '{name}' contains a wildcard or whitespace"));
        }
    }
    Ok(())
}

/// Checks that `pattern` is a valid bus subject pattern (`*` and `>` tokens).
pub fn validate_subject_pattern(pattern: &str) -> Result<(), String> {
    if pattern.is_empty() {
        return Err("subject pattern is empty".to_string());
    }
    let segments: Vec<&str> = pattern.split(SEPARATOR).collect();
    let last = segments.len() - 1;
    for (i, segment) in segments.iter().enumerate() {
        match *segment {
            "" => return Err(format!("subject pattern '{pattern}' contains an empty token")),
            FULL_WILDCARD if i != last => {
                return Err(format!("subject pattern '{pattern}' has '>' before the end"));
            }
            FULL_WILDCARD | WILDCARD => {}
            s if s.contains(['*', '>', ' ']) => {
                return Err(format!("subject pattern '{pattern}' has invalid token '{s}'"));
            }
            _ => {}
        }
    }
    Ok(())
}
