//! Mechanism and directive types (RFC 4408 Section 5).

use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};

use crate::macros::MacroString;
use crate::result::SyntaxError;

/// Qualifier prefix on a directive. Defaults to Pass if omitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Qualifier {
    Pass,     // +
    Fail,     // -
    SoftFail, // ~
    Neutral,  // ?
}

impl Qualifier {
    pub fn from_char(c: char) -> Option<Self> {
        match c {
            '+' => Some(Qualifier::Pass),
            '-' => Some(Qualifier::Fail),
            '~' => Some(Qualifier::SoftFail),
            '?' => Some(Qualifier::Neutral),
            _ => None,
        }
    }
}

impl fmt::Display for Qualifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Qualifier::Pass => write!(f, "+"),
            Qualifier::Fail => write!(f, "-"),
            Qualifier::SoftFail => write!(f, "~"),
            Qualifier::Neutral => write!(f, "?"),
        }
    }
}

/// CIDR prefix length pair for the `a` and `mx` mechanisms.
/// Defaults to 32/128 when not spelled out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DualCidr {
    pub v4: u8,
    pub v6: u8,
}

impl Default for DualCidr {
    fn default() -> Self {
        Self { v4: 32, v6: 128 }
    }
}

/// SPF mechanism (RFC 4408 Section 5). Domain-specs stay unexpanded
/// macro strings until evaluation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mechanism {
    /// `all`
    All,
    /// `include:<domain-spec>`
    Include(MacroString),
    /// `a[:<domain-spec>][/cidr4][//cidr6]`
    A {
        domain: Option<MacroString>,
        cidr: DualCidr,
    },
    /// `mx[:<domain-spec>][/cidr4][//cidr6]`
    Mx {
        domain: Option<MacroString>,
        cidr: DualCidr,
    },
    /// `ptr[:<domain-spec>]`
    Ptr(Option<MacroString>),
    /// `ip4:<network>[/cidr]`
    Ip4 { addr: Ipv4Addr, prefix_len: u8 },
    /// `ip6:<network>[/cidr]`
    Ip6 { addr: Ipv6Addr, prefix_len: u8 },
    /// `exists:<domain-spec>`
    Exists(MacroString),
}

impl Mechanism {
    pub fn name(&self) -> &'static str {
        match self {
            Mechanism::All => "all",
            Mechanism::Include(_) => "include",
            Mechanism::A { .. } => "a",
            Mechanism::Mx { .. } => "mx",
            Mechanism::Ptr(_) => "ptr",
            Mechanism::Ip4 { .. } => "ip4",
            Mechanism::Ip6 { .. } => "ip6",
            Mechanism::Exists(_) => "exists",
        }
    }

    /// Parse a mechanism term without its qualifier prefix.
    pub fn parse(term: &str) -> Result<Self, SyntaxError> {
        let name_end = term.find([':', '/']).unwrap_or(term.len());
        let name = &term[..name_end];
        let suffix = &term[name_end..];

        match name.to_ascii_lowercase().as_str() {
            "all" => {
                if suffix.is_empty() {
                    Ok(Mechanism::All)
                } else {
                    Err(SyntaxError::JunkInTerm(term.to_string()))
                }
            }
            "include" => Ok(Mechanism::Include(required_domain("include", suffix)?)),
            "exists" => Ok(Mechanism::Exists(required_domain("exists", suffix)?)),
            "ptr" => match suffix.strip_prefix(':') {
                Some(d) if !d.is_empty() => Ok(Mechanism::Ptr(Some(MacroString::parse(d)?))),
                Some(_) => Err(SyntaxError::MissingArgument("ptr")),
                None if suffix.is_empty() => Ok(Mechanism::Ptr(None)),
                None => Err(SyntaxError::JunkInTerm(term.to_string())),
            },
            "a" => {
                let (domain, cidr) = domain_and_cidr("a", suffix)?;
                Ok(Mechanism::A { domain, cidr })
            }
            "mx" => {
                let (domain, cidr) = domain_and_cidr("mx", suffix)?;
                Ok(Mechanism::Mx { domain, cidr })
            }
            "ip4" => parse_ip4(suffix),
            "ip6" => parse_ip6(suffix),
            other => Err(SyntaxError::UnknownMechanism(other.to_string())),
        }
    }
}

fn required_domain(name: &'static str, suffix: &str) -> Result<MacroString, SyntaxError> {
    match suffix.strip_prefix(':') {
        Some(d) if !d.is_empty() => MacroString::parse(d),
        _ => Err(SyntaxError::MissingArgument(name)),
    }
}

/// Strip a `[/cidr4][//cidr6]` suffix. Only all-digit suffixes are
/// consumed, so `/` delimiters inside macro expressions survive.
fn split_dual_cidr(s: &str) -> Result<(&str, DualCidr), SyntaxError> {
    let mut head = s;
    let mut cidr = DualCidr::default();

    if let Some(pos) = head.rfind("//") {
        let digits = &head[pos + 2..];
        if !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit()) {
            cidr.v6 = digits
                .parse()
                .map_err(|_| SyntaxError::InvalidCidr(digits.to_string()))?;
            if cidr.v6 > 128 {
                return Err(SyntaxError::InvalidCidr(digits.to_string()));
            }
            head = &head[..pos];
        }
    }
    if let Some(pos) = head.rfind('/') {
        let digits = &head[pos + 1..];
        if !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit()) {
            cidr.v4 = digits
                .parse()
                .map_err(|_| SyntaxError::InvalidCidr(digits.to_string()))?;
            if cidr.v4 > 32 {
                return Err(SyntaxError::InvalidCidr(digits.to_string()));
            }
            head = &head[..pos];
        }
    }
    Ok((head, cidr))
}

fn domain_and_cidr(
    name: &'static str,
    suffix: &str,
) -> Result<(Option<MacroString>, DualCidr), SyntaxError> {
    let (head, cidr) = split_dual_cidr(suffix)?;
    let domain = match head.strip_prefix(':') {
        Some(d) if !d.is_empty() => Some(MacroString::parse(d)?),
        Some(_) => return Err(SyntaxError::MissingArgument(name)),
        None if head.is_empty() => None,
        None => return Err(SyntaxError::JunkInTerm(suffix.to_string())),
    };
    Ok((domain, cidr))
}

fn parse_ip4(suffix: &str) -> Result<Mechanism, SyntaxError> {
    let arg = match suffix.strip_prefix(':') {
        Some(a) if !a.is_empty() => a,
        _ => return Err(SyntaxError::MissingArgument("ip4")),
    };
    let (addr_str, prefix_len) = match arg.split_once('/') {
        Some((a, p)) => {
            let prefix: u8 = p
                .parse()
                .map_err(|_| SyntaxError::InvalidCidr(p.to_string()))?;
            if prefix > 32 {
                return Err(SyntaxError::InvalidCidr(p.to_string()));
            }
            (a, prefix)
        }
        None => (arg, 32),
    };
    let addr: Ipv4Addr = addr_str
        .parse()
        .map_err(|_| SyntaxError::InvalidIp4(addr_str.to_string()))?;
    Ok(Mechanism::Ip4 { addr, prefix_len })
}

fn parse_ip6(suffix: &str) -> Result<Mechanism, SyntaxError> {
    let arg = match suffix.strip_prefix(':') {
        Some(a) if !a.is_empty() => a,
        _ => return Err(SyntaxError::MissingArgument("ip6")),
    };
    // The address itself contains colons; the prefix is the trailing
    // all-digit run after the last '/'.
    if let Some(pos) = arg.rfind('/') {
        let p = &arg[pos + 1..];
        if !p.is_empty() && p.bytes().all(|b| b.is_ascii_digit()) {
            let prefix_len: u8 = p
                .parse()
                .map_err(|_| SyntaxError::InvalidCidr(p.to_string()))?;
            if prefix_len > 128 {
                return Err(SyntaxError::InvalidCidr(p.to_string()));
            }
            let addr: Ipv6Addr = arg[..pos]
                .parse()
                .map_err(|_| SyntaxError::InvalidIp6(arg[..pos].to_string()))?;
            return Ok(Mechanism::Ip6 { addr, prefix_len });
        }
    }
    let addr: Ipv6Addr = arg
        .parse()
        .map_err(|_| SyntaxError::InvalidIp6(arg.to_string()))?;
    Ok(Mechanism::Ip6 {
        addr,
        prefix_len: 128,
    })
}

/// A directive is a qualifier + mechanism pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Directive {
    pub qualifier: Qualifier,
    pub mechanism: Mechanism,
}

impl Directive {
    pub fn parse(term: &str) -> Result<Self, SyntaxError> {
        let first = match term.chars().next() {
            Some(c) => c,
            None => return Err(SyntaxError::UnknownMechanism(String::new())),
        };
        let (qualifier, rest) = match Qualifier::from_char(first) {
            Some(q) => (q, &term[1..]),
            None => (Qualifier::Pass, term),
        };
        if rest.is_empty() {
            return Err(SyntaxError::InvalidQualifier(first));
        }
        let mechanism = Mechanism::parse(rest)?;
        Ok(Directive {
            qualifier,
            mechanism,
        })
    }
}

impl fmt::Display for Mechanism {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mechanism::All => write!(f, "all"),
            Mechanism::Include(d) => write!(f, "include:{d}"),
            Mechanism::A { domain, cidr } | Mechanism::Mx { domain, cidr } => {
                write!(f, "{}", self.name())?;
                if let Some(d) = domain {
                    write!(f, ":{d}")?;
                }
                if cidr.v4 != 32 {
                    write!(f, "/{}", cidr.v4)?;
                }
                if cidr.v6 != 128 {
                    write!(f, "//{}", cidr.v6)?;
                }
                Ok(())
            }
            Mechanism::Ptr(domain) => {
                write!(f, "ptr")?;
                if let Some(d) = domain {
                    write!(f, ":{d}")?;
                }
                Ok(())
            }
            Mechanism::Ip4 { addr, prefix_len } => {
                write!(f, "ip4:{addr}")?;
                if *prefix_len != 32 {
                    write!(f, "/{prefix_len}")?;
                }
                Ok(())
            }
            Mechanism::Ip6 { addr, prefix_len } => {
                write!(f, "ip6:{addr}")?;
                if *prefix_len != 128 {
                    write!(f, "/{prefix_len}")?;
                }
                Ok(())
            }
            Mechanism::Exists(d) => write!(f, "exists:{d}"),
        }
    }
}

impl fmt::Display for Directive {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // The + qualifier is the default and is left implicit.
        if self.qualifier != Qualifier::Pass {
            write!(f, "{}", self.qualifier)?;
        }
        write!(f, "{}", self.mechanism)
    }
}
