/*!
 * Identifier extraction from naming templates
 *
 * A template is literal text with `{Field}` placeholders (`{{` and `}}`
 * escape braces). Templates are resolved strictly: a placeholder that has
 * no value is an error, never an empty string.
 */

use std::cmp::Ordering;
use std::fmt;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::metadata::FieldSource;
use crate::error::{IngestError, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Field(String),
}

/// A parsed naming template
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Template {
    source: String,
    segments: Vec<Segment>,
}

/// The placeholder that had no value during rendering
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnresolvedField(pub String);

impl Template {
    pub fn parse(source: &str) -> Result<Self> {
        let mut segments = Vec::new();
        let mut literal = String::new();
        let mut chars = source.chars().peekable();

        while let Some(c) = chars.next() {
            match c {
                '{' if chars.peek() == Some(&'{') => {
                    chars.next();
                    literal.push('{');
                }
                '}' if chars.peek() == Some(&'}') => {
                    chars.next();
                    literal.push('}');
                }
                '{' => {
                    let mut name = String::new();
                    loop {
                        match chars.next() {
                            Some('}') => break,
                            Some(c) => name.push(c),
                            None => {
                                return Err(IngestError::Config(format!(
                                    "unterminated placeholder in template '{}'",
                                    source
                                )))
                            }
                        }
                    }
                    let name = name.trim();
                    if name.is_empty() || name.contains('{') {
                        return Err(IngestError::Config(format!(
                            "empty or malformed placeholder in template '{}'",
                            source
                        )));
                    }
                    if !literal.is_empty() {
                        segments.push(Segment::Literal(std::mem::take(&mut literal)));
                    }
                    segments.push(Segment::Field(name.to_string()));
                }
                '}' => {
                    return Err(IngestError::Config(format!(
                        "unmatched '}}' in template '{}'",
                        source
                    )))
                }
                c => literal.push(c),
            }
        }
        if !literal.is_empty() {
            segments.push(Segment::Literal(literal));
        }

        Ok(Self {
            source: source.to_string(),
            segments,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    pub fn placeholders(&self) -> impl Iterator<Item = &str> {
        self.segments.iter().filter_map(|s| match s {
            Segment::Field(name) => Some(name.as_str()),
            Segment::Literal(_) => None,
        })
    }

    pub fn has_placeholders(&self) -> bool {
        self.placeholders().next().is_some()
    }

    /// Render the template, failing on the first placeholder without a value
    pub fn render(&self, fields: &dyn FieldSource) -> std::result::Result<String, UnresolvedField> {
        self.render_with(fields, |value| value.to_string())
    }

    /// Render with each resolved value passed through `escape` (used for globs)
    pub fn render_with<F>(
        &self,
        fields: &dyn FieldSource,
        escape: F,
    ) -> std::result::Result<String, UnresolvedField>
    where
        F: Fn(&str) -> String,
    {
        let mut out = String::new();
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => out.push_str(text),
                Segment::Field(name) => {
                    let value = fields
                        .field(name)
                        .ok_or_else(|| UnresolvedField(name.clone()))?;
                    out.push_str(&escape(&value));
                }
            }
        }
        Ok(out)
    }
}

impl FromStr for Template {
    type Err = IngestError;

    fn from_str(s: &str) -> Result<Self> {
        Template::parse(s)
    }
}

impl fmt::Display for Template {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.source)
    }
}

/// Identity of one clinical encounter
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SessionKey {
    pub subject: String,
    pub session: String,
}

impl SessionKey {
    pub fn new(subject: impl Into<String>, session: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            session: session.into(),
        }
    }

    /// Directory name of the staged bundle for this session
    pub fn dir_name(&self) -> String {
        format!("{}_{}", sanitize(&self.subject), sanitize(&self.session))
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.subject, self.session)
    }
}

/// Replace characters that cannot appear in a single path component
pub fn sanitize(value: &str) -> String {
    value
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_whitespace() => '_',
            c => c,
        })
        .collect()
}

/// Ordering key of an acquisition, usually a date and time
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SortKey(pub String);

impl SortKey {
    /// Numeric distance between two keys using only their digits, when both
    /// are comparable (same digit count, fits in 128 bits)
    pub fn distance(&self, other: &SortKey) -> Option<u128> {
        let a = digits(&self.0)?;
        let b = digits(&other.0)?;
        if a.len() != b.len() {
            return None;
        }
        let a: u128 = a.parse().ok()?;
        let b: u128 = b.parse().ok()?;
        Some(a.abs_diff(b))
    }
}

fn digits(value: &str) -> Option<String> {
    let digits: String = value.chars().filter(char::is_ascii_digit).collect();
    if digits.is_empty() {
        None
    } else {
        Some(digits)
    }
}

impl fmt::Display for SortKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Compare optional sort keys, placing items without one last
pub fn compare_sort_keys(a: &Option<SortKey>, b: &Option<SortKey>) -> Ordering {
    match (a, b) {
        (Some(a), Some(b)) => a.cmp(b),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

/// Recovers session keys, sort keys and correlation keys from file fields
#[derive(Debug, Clone)]
pub struct IdentifierExtractor {
    subject: Template,
    session: Template,
    sort_keys: Vec<Template>,
    correlation: Option<Template>,
}

impl IdentifierExtractor {
    pub fn new(subject: Template, session: Template) -> Self {
        Self {
            subject,
            session,
            sort_keys: Vec::new(),
            correlation: None,
        }
    }

    /// Sort key templates are tried in order; the first that resolves wins
    pub fn with_sort_keys(mut self, templates: Vec<Template>) -> Self {
        self.sort_keys = templates;
        self
    }

    pub fn with_correlation(mut self, template: Template) -> Self {
        self.correlation = Some(template);
        self
    }

    pub fn session_key(&self, path: &Path, fields: &dyn FieldSource) -> Result<SessionKey> {
        let subject = resolve(&self.subject, path, fields)?;
        let session = resolve(&self.session, path, fields)?;
        Ok(SessionKey { subject, session })
    }

    pub fn sort_key(&self, fields: &dyn FieldSource) -> Option<SortKey> {
        self.sort_keys
            .iter()
            .find_map(|t| t.render(fields).ok())
            .map(SortKey)
    }

    /// Extract both the session key and the (optional) sort key
    pub fn extract(
        &self,
        path: &Path,
        fields: &dyn FieldSource,
    ) -> Result<(SessionKey, Option<SortKey>)> {
        let key = self.session_key(path, fields)?;
        Ok((key, self.sort_key(fields)))
    }

    /// Correlation key used to match auxiliary files, if a template is set
    pub fn correlation_key(
        &self,
        path: &Path,
        fields: &dyn FieldSource,
    ) -> Option<Result<String>> {
        self.correlation
            .as_ref()
            .map(|template| resolve(template, path, fields))
    }
}

fn resolve(template: &Template, path: &Path, fields: &dyn FieldSource) -> Result<String> {
    let value = template
        .render(fields)
        .map_err(|UnresolvedField(placeholder)| IngestError::UnresolvedIdentifier {
            path: path.to_path_buf(),
            placeholder,
        })?;
    let value = value.trim();
    if value.is_empty() {
        return Err(IngestError::UnresolvedIdentifier {
            path: path.to_path_buf(),
            placeholder: template.to_string(),
        });
    }
    Ok(value.to_string())
}
