//! Evaluation requests: the identity under test plus the connection
//! facts the policy is checked against.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use crate::domain;
use crate::record::Version;

/// Which mail identity a policy applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scope {
    /// The HELO/EHLO host name.
    Helo,
    /// The envelope sender (MAIL FROM).
    MailFrom,
    /// The Purported Responsible Address.
    Pra,
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Scope::Helo => "helo",
            Scope::MailFrom => "mfrom",
            Scope::Pra => "pra",
        })
    }
}

/// The record versions a scope accepts by default: v2 records never
/// cover `helo`, and `pra` exists only in v2.
fn default_versions(scope: Scope) -> Vec<Version> {
    match scope {
        Scope::Helo => vec![Version::V1],
        Scope::MailFrom => vec![Version::V1, Version::V2],
        Scope::Pra => vec![Version::V2],
    }
}

/// An SPF evaluation request. Immutable; the engine keeps its own
/// per-evaluation state, so one request may be evaluated repeatedly.
#[derive(Debug, Clone)]
pub struct Request {
    scope: Scope,
    identity: String,
    ip: IpAddr,
    helo: Option<String>,
    receiver: Option<String>,
    versions: Vec<Version>,
}

impl Request {
    pub fn new(scope: Scope, identity: impl Into<String>, ip: IpAddr) -> Self {
        Self {
            scope,
            identity: identity.into(),
            ip,
            helo: None,
            receiver: None,
            versions: default_versions(scope),
        }
    }

    /// Request for an envelope-sender identity like `alice@example.com`.
    pub fn mfrom(identity: impl Into<String>, ip: IpAddr) -> Self {
        Self::new(Scope::MailFrom, identity, ip)
    }

    /// Request for a HELO host name.
    pub fn helo(identity: impl Into<String>, ip: IpAddr) -> Self {
        Self::new(Scope::Helo, identity, ip)
    }

    /// Request for a Purported Responsible Address.
    pub fn pra(identity: impl Into<String>, ip: IpAddr) -> Self {
        Self::new(Scope::Pra, identity, ip)
    }

    /// Set the secondary HELO identity used by the `%{h}` macro.
    pub fn with_helo(mut self, helo: impl Into<String>) -> Self {
        self.helo = Some(helo.into());
        self
    }

    /// Set the receiving host name used by the `%{r}` macro.
    pub fn with_receiver(mut self, receiver: impl Into<String>) -> Self {
        self.receiver = Some(receiver.into());
        self
    }

    /// Override the set of acceptable record versions.
    pub fn with_versions(mut self, versions: &[Version]) -> Self {
        self.versions = versions.to_vec();
        self
    }

    pub fn scope(&self) -> Scope {
        self.scope
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn ip(&self) -> IpAddr {
        self.ip
    }

    pub fn versions(&self) -> &[Version] {
        &self.versions
    }

    /// The domain whose policy is consulted: the identity itself for
    /// `helo`, otherwise the part after the last `@` (or the whole
    /// identity when no `@` is present).
    pub fn authority_domain(&self) -> &str {
        match self.scope {
            Scope::Helo => &self.identity,
            Scope::MailFrom | Scope::Pra => {
                domain::domain_from_identity(&self.identity).unwrap_or(&self.identity)
            }
        }
    }

    /// The local part of the identity, `postmaster` when absent.
    pub fn local_part(&self) -> &str {
        match self.scope {
            Scope::Helo => "postmaster",
            Scope::MailFrom | Scope::Pra => domain::local_part_from_identity(&self.identity),
        }
    }

    /// The full sender identity for `%{s}`: `local-part@domain`, with
    /// `postmaster` filling in for a missing local part.
    pub fn sender(&self) -> String {
        format!("{}@{}", self.local_part(), self.authority_domain())
    }

    /// The HELO identity for `%{h}`: the explicit secondary identity,
    /// or the identity itself for `helo`-scope requests.
    pub fn helo_identity(&self) -> Option<&str> {
        match (&self.helo, self.scope) {
            (Some(h), _) => Some(h),
            (None, Scope::Helo) => Some(&self.identity),
            (None, _) => None,
        }
    }

    pub fn receiver(&self) -> Option<&str> {
        self.receiver.as_deref()
    }

    /// The client address as IPv4, including the IPv4-mapped IPv6 form.
    pub fn ipv4(&self) -> Option<Ipv4Addr> {
        match self.ip {
            IpAddr::V4(a) => Some(a),
            IpAddr::V6(a) => a.to_ipv4_mapped(),
        }
    }

    /// The client address as IPv6; IPv4 clients appear in their
    /// IPv4-mapped form.
    pub fn ipv6(&self) -> Ipv6Addr {
        match self.ip {
            IpAddr::V4(a) => a.to_ipv6_mapped(),
            IpAddr::V6(a) => a,
        }
    }
}
