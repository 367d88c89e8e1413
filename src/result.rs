//! Evaluation results and the internal error taxonomy.
//!
//! `SpfResult` is the only outcome a caller ever sees. Everything in
//! `EvalError` stays inside the engine and is folded into `PermError`
//! or `TempError` at the `process` boundary.

use std::fmt;

use thiserror::Error;

use crate::dns::DnsError;

/// SPF evaluation result (RFC 4408 Section 2.5).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SpfResult {
    /// Sender is authorized.
    Pass,
    /// Sender is NOT authorized. Carries the macro-expanded authority
    /// explanation when one could be produced.
    Fail { explanation: Option<String> },
    /// Weak assertion that the sender is probably not authorized.
    SoftFail,
    /// The policy makes no assertion about the sender.
    Neutral,
    /// No applicable SPF record was found.
    None,
    /// Transient error, typically DNS.
    TempError,
    /// Permanent error: bad record syntax, processing limits, loops.
    PermError,
}

impl SpfResult {
    /// The lowercase result code as used in Received-SPF headers.
    pub fn code(&self) -> &'static str {
        match self {
            SpfResult::Pass => "pass",
            SpfResult::Fail { .. } => "fail",
            SpfResult::SoftFail => "softfail",
            SpfResult::Neutral => "neutral",
            SpfResult::None => "none",
            SpfResult::TempError => "temperror",
            SpfResult::PermError => "permerror",
        }
    }

    /// The explanation attached to a `Fail` result, if any.
    pub fn explanation(&self) -> Option<&str> {
        match self {
            SpfResult::Fail { explanation } => explanation.as_deref(),
            _ => Option::None,
        }
    }
}

impl fmt::Display for SpfResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// Record and term syntax errors. All of these map to `PermError` when
/// they surface during an evaluation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyntaxError {
    #[error("unrecognized record version: {0}")]
    InvalidVersion(String),
    #[error("unknown mechanism: {0}")]
    UnknownMechanism(String),
    #[error("invalid qualifier: {0}")]
    InvalidQualifier(char),
    #[error("duplicate modifier: {0}")]
    DuplicateModifier(String),
    #[error("{0} requires a domain argument")]
    MissingArgument(&'static str),
    #[error("junk in term: {0}")]
    JunkInTerm(String),
    #[error("invalid IPv4 network: {0}")]
    InvalidIp4(String),
    #[error("invalid IPv6 network: {0}")]
    InvalidIp6(String),
    #[error("network prefix out of range: {0}")]
    InvalidCidr(String),
    #[error("malformed macro string: {0}")]
    InvalidMacro(String),
    #[error("macro %{{{0}}} is only valid in an explanation")]
    ExplanationOnlyMacro(char),
}

/// Internal evaluation errors. Never returned to callers; `process`
/// maps each variant to its final result kind.
#[derive(Debug, Clone, Error)]
pub(crate) enum EvalError {
    #[error(transparent)]
    Syntax(#[from] SyntaxError),
    #[error("DNS timeout while querying {domain}")]
    DnsTimeout { domain: String },
    #[error("DNS failure while querying {domain}: {source}")]
    Dns { domain: String, source: DnsError },
    #[error("maximum of {0} DNS-interactive terms exceeded")]
    TooManyDnsTerms(usize),
    #[error("include loop through {0}")]
    IncludeLoop(String),
    #[error("redundant applicable records")]
    RedundantRecords,
    #[error("{0} has no applicable sender policy")]
    NoApplicablePolicy(String),
}

impl EvalError {
    /// Fold an internal error into the result mandated by RFC 4408:
    /// syntax, limit, and loop errors are permanent; DNS errors are
    /// transient.
    pub(crate) fn into_result(self) -> SpfResult {
        match self {
            EvalError::Syntax(_)
            | EvalError::TooManyDnsTerms(_)
            | EvalError::IncludeLoop(_)
            | EvalError::RedundantRecords
            | EvalError::NoApplicablePolicy(_) => SpfResult::PermError,
            EvalError::DnsTimeout { .. } | EvalError::Dns { .. } => SpfResult::TempError,
        }
    }
}
