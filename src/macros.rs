//! Macro strings (RFC 4408 Section 8).
//!
//! A `MacroString` keeps its raw text plus a token stream precomputed
//! at parse time, so malformed macros in a record surface as syntax
//! errors when the record is parsed, not when a term happens to be
//! evaluated. Expansion is a pure function of the tokens and a
//! `MacroContext`; the `%{p}` value is resolved by the engine before
//! expansion and handed in through the context.

use std::fmt;
use std::net::IpAddr;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::net;
use crate::result::SyntaxError;

/// Delimiter characters permitted in a macro expression.
const DELIMITERS: &[char] = &['.', '-', '+', ',', '/', '_', '='];

/// Values a macro expression draws from, supplied by the engine.
#[derive(Debug, Clone)]
pub struct MacroContext<'a> {
    /// Full sender identity (local-part@domain), `%{s}`.
    pub sender: &'a str,
    /// Local part of the sender, `%{l}`.
    pub local_part: &'a str,
    /// Domain part of the sender, `%{o}`.
    pub sender_domain: &'a str,
    /// Domain currently under evaluation, `%{d}`; rebound by
    /// include/redirect.
    pub domain: &'a str,
    /// Connecting client address, `%{i}` / `%{v}` / `%{c}`.
    pub client_ip: IpAddr,
    /// HELO identity, `%{h}`.
    pub helo: &'a str,
    /// Receiving host name, `%{r}` (explanation only).
    pub receiver: &'a str,
    /// Validated PTR name, `%{p}`; `None` expands to `unknown`.
    pub ptr_name: Option<&'a str>,
    /// Whether explanation-only macros are permitted.
    pub in_explanation: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Literal(String),
    /// `%%`
    Percent,
    /// `%_`
    Space,
    /// `%-`
    UrlSpace,
    Expand(MacroExpr),
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct MacroExpr {
    /// Lowercased macro letter.
    letter: char,
    /// Uppercase source letter: URL-encode the expansion.
    url_encode: bool,
    /// Keep only the rightmost N labels (1..=128).
    keep: Option<usize>,
    reverse: bool,
    /// Split delimiters; empty means the default `.`.
    delimiters: String,
}

impl MacroExpr {
    fn parse(body: &str) -> Result<Self, SyntaxError> {
        let mut chars = body.chars().peekable();
        let source_letter = chars
            .next()
            .ok_or_else(|| SyntaxError::InvalidMacro("empty macro expression".into()))?;
        let url_encode = source_letter.is_ascii_uppercase();
        let letter = source_letter.to_ascii_lowercase();
        if !matches!(letter, 's' | 'l' | 'o' | 'd' | 'i' | 'p' | 'v' | 'h' | 'c' | 'r' | 't') {
            return Err(SyntaxError::InvalidMacro(format!(
                "unknown macro letter {source_letter}"
            )));
        }

        let mut digits = String::new();
        while let Some(&c) = chars.peek() {
            if c.is_ascii_digit() {
                digits.push(c);
                chars.next();
            } else {
                break;
            }
        }
        let keep = if digits.is_empty() {
            None
        } else {
            let n: usize = digits
                .parse()
                .map_err(|_| SyntaxError::InvalidMacro(format!("invalid label count {digits}")))?;
            if !(1..=128).contains(&n) {
                return Err(SyntaxError::InvalidMacro(format!(
                    "label count {n} out of range"
                )));
            }
            Some(n)
        };

        let mut reverse = false;
        if let Some(&c) = chars.peek() {
            if c == 'r' || c == 'R' {
                reverse = true;
                chars.next();
            }
        }

        let mut delimiters = String::new();
        for c in chars {
            if DELIMITERS.contains(&c) {
                delimiters.push(c);
            } else {
                return Err(SyntaxError::InvalidMacro(format!("invalid delimiter {c}")));
            }
        }

        Ok(MacroExpr {
            letter,
            url_encode,
            keep,
            reverse,
            delimiters,
        })
    }

    fn value(&self, ctx: &MacroContext<'_>) -> Result<String, SyntaxError> {
        Ok(match self.letter {
            's' => ctx.sender.to_string(),
            'l' => ctx.local_part.to_string(),
            'o' => ctx.sender_domain.to_string(),
            'd' => ctx.domain.to_string(),
            'i' => match macro_ip(ctx.client_ip) {
                IpAddr::V4(v4) => v4.to_string(),
                IpAddr::V6(v6) => net::ipv6_nibbles(v6),
            },
            'p' => ctx.ptr_name.unwrap_or("unknown").to_string(),
            'v' => match macro_ip(ctx.client_ip) {
                IpAddr::V4(_) => "in-addr".to_string(),
                IpAddr::V6(_) => "ip6".to_string(),
            },
            'h' => ctx.helo.to_string(),
            'c' if ctx.in_explanation => macro_ip(ctx.client_ip).to_string(),
            'r' if ctx.in_explanation => ctx.receiver.to_string(),
            't' if ctx.in_explanation => SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs().to_string())
                .unwrap_or_else(|_| "0".into()),
            'c' | 'r' | 't' => return Err(SyntaxError::ExplanationOnlyMacro(self.letter)),
            other => {
                return Err(SyntaxError::InvalidMacro(format!(
                    "unknown macro letter {other}"
                )))
            }
        })
    }

    fn expand(&self, ctx: &MacroContext<'_>) -> Result<String, SyntaxError> {
        let value = self.value(ctx)?;
        let delimiters: &str = if self.delimiters.is_empty() {
            "."
        } else {
            &self.delimiters
        };

        let transformed = if self.keep.is_none() && !self.reverse && delimiters == "." {
            value
        } else {
            let delim_chars: Vec<char> = delimiters.chars().collect();
            let mut parts: Vec<&str> = value.split(|c: char| delim_chars.contains(&c)).collect();
            if self.reverse {
                parts.reverse();
            }
            if let Some(n) = self.keep {
                if parts.len() > n {
                    parts.drain(..parts.len() - n);
                }
            }
            parts.join(".")
        };

        Ok(if self.url_encode {
            url_encode(&transformed)
        } else {
            transformed
        })
    }
}

/// An IPv4-mapped IPv6 client expands in its IPv4 form.
fn macro_ip(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => IpAddr::V4(v4),
            None => ip,
        },
        IpAddr::V4(_) => ip,
    }
}

/// Percent-encode everything outside the RFC 3986 unreserved set.
fn url_encode(s: &str) -> String {
    let mut encoded = String::with_capacity(s.len());
    for byte in s.bytes() {
        if byte.is_ascii_alphanumeric() || matches!(byte, b'-' | b'_' | b'.' | b'~') {
            encoded.push(byte as char);
        } else {
            encoded.push_str(&format!("%{byte:02X}"));
        }
    }
    encoded
}

/// A domain-spec or explanation template with `%{...}` expansions.
///
/// Equality is textual: two macro strings with the same raw text are
/// equal.
#[derive(Debug, Clone)]
pub struct MacroString {
    raw: String,
    tokens: Vec<Token>,
}

impl MacroString {
    pub fn parse(raw: &str) -> Result<Self, SyntaxError> {
        let mut tokens = Vec::new();
        let mut literal = String::new();
        let mut chars = raw.chars().peekable();

        while let Some(c) = chars.next() {
            if c != '%' {
                literal.push(c);
                continue;
            }
            if !literal.is_empty() {
                tokens.push(Token::Literal(std::mem::take(&mut literal)));
            }
            match chars.next() {
                Some('%') => tokens.push(Token::Percent),
                Some('_') => tokens.push(Token::Space),
                Some('-') => tokens.push(Token::UrlSpace),
                Some('{') => {
                    let mut body = String::new();
                    loop {
                        match chars.next() {
                            Some('}') => break,
                            Some(ch) => body.push(ch),
                            None => {
                                return Err(SyntaxError::InvalidMacro(
                                    "unterminated macro expression".into(),
                                ))
                            }
                        }
                    }
                    tokens.push(Token::Expand(MacroExpr::parse(&body)?));
                }
                Some(other) => {
                    return Err(SyntaxError::InvalidMacro(format!("invalid escape %{other}")))
                }
                None => {
                    return Err(SyntaxError::InvalidMacro(
                        "trailing % at end of macro string".into(),
                    ))
                }
            }
        }
        if !literal.is_empty() {
            tokens.push(Token::Literal(literal));
        }

        Ok(MacroString {
            raw: raw.to_string(),
            tokens,
        })
    }

    /// Expand against a context. Pure except for `%{t}` reading the
    /// clock; the validated PTR name must already be in the context.
    pub fn expand(&self, ctx: &MacroContext<'_>) -> Result<String, SyntaxError> {
        let mut out = String::with_capacity(self.raw.len());
        for token in &self.tokens {
            match token {
                Token::Literal(s) => out.push_str(s),
                Token::Percent => out.push('%'),
                Token::Space => out.push(' '),
                Token::UrlSpace => out.push_str("%20"),
                Token::Expand(expr) => out.push_str(&expr.expand(ctx)?),
            }
        }
        Ok(out)
    }

    /// Whether expansion needs a validated PTR name (`%{p}` present).
    pub fn references_ptr(&self) -> bool {
        self.tokens
            .iter()
            .any(|t| matches!(t, Token::Expand(expr) if expr.letter == 'p'))
    }

    pub fn raw(&self) -> &str {
        &self.raw
    }
}

impl fmt::Display for MacroString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl PartialEq for MacroString {
    fn eq(&self, other: &Self) -> bool {
        self.raw == other.raw
    }
}

impl Eq for MacroString {}
