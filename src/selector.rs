use crate::page::Anchor;
use regex::Regex;
use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

pub const OUTBOUND_SELECTOR: &str = r#"a[href^="http"]"#;
pub const DOWNLOAD_SELECTOR: &str = r#"a[href*="file_link"]"#;

const SELECTOR_PATTERN: &str = r#"^\s*a\[\s*([A-Za-z_][A-Za-z0-9_-]*)\s*(?:([\^*$]?=)\s*(?:"([^"]*)"|'([^']*)'|([^\]\s"']+))\s*)?\]\s*$"#;

static SELECTOR_REGEX: OnceLock<Result<Regex, regex::Error>> = OnceLock::new();

fn selector_regex() -> Result<&'static Regex, SelectorError> {
    SELECTOR_REGEX
        .get_or_init(|| Regex::new(SELECTOR_PATTERN))
        .as_ref()
        .map_err(|error| SelectorError::Pattern(error.clone()))
}

#[derive(Debug, thiserror::Error)]
pub enum SelectorError {
    #[error("unsupported selector '{0}': expected a[attr], a[attr=\"v\"], a[attr^=\"v\"], a[attr*=\"v\"] or a[attr$=\"v\"]")]
    Unsupported(String),
    #[error("selector pattern failed to compile: {0}")]
    Pattern(regex::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttrMatch {
    Present,
    Exact,
    Prefix,
    Contains,
    Suffix,
}

/// A single anchor attribute selector such as `a[href^="http"]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkSelector {
    attribute: String,
    op: AttrMatch,
    value: String,
}

impl LinkSelector {
    pub fn new(attribute: &str, op: AttrMatch, value: &str) -> Self {
        Self {
            attribute: attribute.to_string(),
            op,
            value: value.to_string(),
        }
    }

    pub fn outbound() -> Self {
        Self::new("href", AttrMatch::Prefix, "http")
    }

    pub fn download() -> Self {
        Self::new("href", AttrMatch::Contains, "file_link")
    }

    pub fn parse(input: &str) -> Result<Self, SelectorError> {
        let captures = selector_regex()?
            .captures(input)
            .ok_or_else(|| SelectorError::Unsupported(input.to_string()))?;

        let attribute = &captures[1];
        let op = match captures.get(2).map(|m| m.as_str()) {
            None => AttrMatch::Present,
            Some("=") => AttrMatch::Exact,
            Some("^=") => AttrMatch::Prefix,
            Some("*=") => AttrMatch::Contains,
            Some("$=") => AttrMatch::Suffix,
            Some(_) => return Err(SelectorError::Unsupported(input.to_string())),
        };
        let value = captures
            .get(3)
            .or_else(|| captures.get(4))
            .or_else(|| captures.get(5))
            .map_or("", |m| m.as_str());

        Ok(Self::new(attribute, op, value))
    }

    /// Substring operators with an empty value match nothing, as in CSS.
    pub fn matches(&self, anchor: &Anchor) -> bool {
        let Some(actual) = anchor.attribute(&self.attribute) else {
            return false;
        };

        match self.op {
            AttrMatch::Present => true,
            AttrMatch::Exact => actual == self.value,
            AttrMatch::Prefix => !self.value.is_empty() && actual.starts_with(&self.value),
            AttrMatch::Contains => !self.value.is_empty() && actual.contains(&self.value),
            AttrMatch::Suffix => !self.value.is_empty() && actual.ends_with(&self.value),
        }
    }
}

impl FromStr for LinkSelector {
    type Err = SelectorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for LinkSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let op = match self.op {
            AttrMatch::Present => return write!(f, "a[{}]", self.attribute),
            AttrMatch::Exact => "=",
            AttrMatch::Prefix => "^=",
            AttrMatch::Contains => "*=",
            AttrMatch::Suffix => "$=",
        };
        write!(f, "a[{}{}\"{}\"]", self.attribute, op, self.value)
    }
}

/// The two anchor classes the tracker instruments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkSelectors {
    pub outbound: LinkSelector,
    pub download: LinkSelector,
}

impl Default for LinkSelectors {
    fn default() -> Self {
        Self {
            outbound: LinkSelector::outbound(),
            download: LinkSelector::download(),
        }
    }
}
