//! SPF record parsing (RFC 4408 Sections 4.5 and 12).
//!
//! A record keeps one ordered list of terms so re-serialization
//! reproduces the published text; `redirect`/`exp` are additionally
//! resolved once at parse time because each may appear at most once.

use std::collections::HashSet;
use std::fmt;

use crate::macros::MacroString;
use crate::mechanism::Directive;
use crate::request::Scope;
use crate::result::SyntaxError;

/// SPF record versions: `v=spf1` and `spf2.0/<scopes>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Version {
    V1,
    V2,
}

/// A modifier term. Unknown modifiers parse and are retained, but have
/// no effect on evaluation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Modifier {
    Redirect(MacroString),
    Exp(MacroString),
    Unknown { name: String, value: String },
}

impl Modifier {
    pub fn name(&self) -> &str {
        match self {
            Modifier::Redirect(_) => "redirect",
            Modifier::Exp(_) => "exp",
            Modifier::Unknown { name, .. } => name,
        }
    }
}

impl fmt::Display for Modifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Modifier::Redirect(d) => write!(f, "redirect={d}"),
            Modifier::Exp(d) => write!(f, "exp={d}"),
            Modifier::Unknown { name, value } => write!(f, "{name}={value}"),
        }
    }
}

/// One term of a record, in declaration order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Term {
    Directive(Directive),
    Modifier(Modifier),
}

impl fmt::Display for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Term::Directive(d) => write!(f, "{d}"),
            Term::Modifier(m) => write!(f, "{m}"),
        }
    }
}

/// A parsed sender policy. Immutable once constructed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    version: Version,
    scopes: Vec<Scope>,
    terms: Vec<Term>,
}

impl Record {
    /// Parse a policy text, version tag included.
    pub fn parse(text: &str) -> Result<Self, SyntaxError> {
        let text = text.trim();
        let (version, scopes, body) = match split_version_tag(text) {
            Some(parts) => parts,
            None => {
                let tag = text.split_whitespace().next().unwrap_or("");
                return Err(SyntaxError::InvalidVersion(tag.to_string()));
            }
        };

        let mut terms = Vec::new();
        let mut seen_modifiers: HashSet<String> = HashSet::new();

        for token in body.split_whitespace() {
            if let Some((name, value)) = split_modifier(token) {
                let name_lower = name.to_ascii_lowercase();
                if !seen_modifiers.insert(name_lower.clone()) {
                    return Err(SyntaxError::DuplicateModifier(name_lower));
                }
                let modifier = match name_lower.as_str() {
                    "redirect" => {
                        if value.is_empty() {
                            return Err(SyntaxError::MissingArgument("redirect"));
                        }
                        Modifier::Redirect(MacroString::parse(value)?)
                    }
                    "exp" => {
                        if value.is_empty() {
                            return Err(SyntaxError::MissingArgument("exp"));
                        }
                        Modifier::Exp(MacroString::parse(value)?)
                    }
                    _ => Modifier::Unknown {
                        name: name.to_string(),
                        value: value.to_string(),
                    },
                };
                terms.push(Term::Modifier(modifier));
            } else {
                terms.push(Term::Directive(Directive::parse(token)?));
            }
        }

        Ok(Record {
            version,
            scopes,
            terms,
        })
    }

    /// Detect the record version from a policy text, without parsing
    /// the body. Texts with no acceptable version tag are not SPF
    /// records at all.
    pub fn version_tag(text: &str) -> Option<Version> {
        split_version_tag(text.trim()).map(|(version, _, _)| version)
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub fn scopes(&self) -> &[Scope] {
        &self.scopes
    }

    pub fn covers(&self, scope: Scope) -> bool {
        self.scopes.contains(&scope)
    }

    pub fn terms(&self) -> &[Term] {
        &self.terms
    }

    pub fn directives(&self) -> impl Iterator<Item = &Directive> {
        self.terms.iter().filter_map(|t| match t {
            Term::Directive(d) => Some(d),
            Term::Modifier(_) => None,
        })
    }

    pub fn redirect(&self) -> Option<&MacroString> {
        self.terms.iter().find_map(|t| match t {
            Term::Modifier(Modifier::Redirect(d)) => Some(d),
            _ => None,
        })
    }

    pub fn exp(&self) -> Option<&MacroString> {
        self.terms.iter().find_map(|t| match t {
            Term::Modifier(Modifier::Exp(d)) => Some(d),
            _ => None,
        })
    }
}

impl fmt::Display for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.version {
            Version::V1 => write!(f, "v=spf1")?,
            Version::V2 => {
                write!(f, "spf2.0/")?;
                for (i, scope) in self.scopes.iter().enumerate() {
                    if i > 0 {
                        write!(f, ",")?;
                    }
                    write!(f, "{scope}")?;
                }
            }
        }
        for term in &self.terms {
            write!(f, " {term}")?;
        }
        Ok(())
    }
}

/// Split off the version tag. Returns the version, the scopes it
/// covers, and the term body. `None` means the text is not an SPF
/// record of any version.
fn split_version_tag(text: &str) -> Option<(Version, Vec<Scope>, &str)> {
    let lower = text.to_ascii_lowercase();

    if lower == "v=spf1" {
        return Some((Version::V1, vec![Scope::Helo, Scope::MailFrom], ""));
    }
    if lower.starts_with("v=spf1 ") {
        return Some((Version::V1, vec![Scope::Helo, Scope::MailFrom], &text[7..]));
    }

    if let Some(rest) = lower.strip_prefix("spf2.0/") {
        let scope_list = rest.split(' ').next().unwrap_or("");
        if scope_list.is_empty() {
            return None;
        }
        let mut scopes = Vec::new();
        for name in scope_list.split(',') {
            let scope = match name {
                "mfrom" => Scope::MailFrom,
                "pra" => Scope::Pra,
                _ => return None,
            };
            if !scopes.contains(&scope) {
                scopes.push(scope);
            }
        }
        let tag_len = "spf2.0/".len() + scope_list.len();
        let body = text[tag_len..].trim_start();
        return Some((Version::V2, scopes, body));
    }

    None
}

/// A token is a modifier iff it is `NAME=VALUE` with NAME a letter
/// followed by letters, digits, `-`, `_`, or `.`.
fn split_modifier(token: &str) -> Option<(&str, &str)> {
    let (name, value) = token.split_once('=')?;
    let mut chars = name.chars();
    let first = chars.next()?;
    if !first.is_ascii_alphabetic() {
        return None;
    }
    if !chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.')) {
        return None;
    }
    Some((name, value))
}
