//! The policy engine: record retrieval and selection, mechanism
//! evaluation, processing limits, and explanation binding.

use std::sync::Arc;

use tracing::{debug, trace};

use crate::dns::{DnsError, DnsResolver, MxHost};
use crate::domain;
use crate::macros::{MacroContext, MacroString};
use crate::mechanism::{DualCidr, Mechanism, Qualifier};
use crate::net;
use crate::record::{Record, Version};
use crate::request::Request;
use crate::result::{EvalError, SpfResult, SyntaxError};

/// Explanation used when the policy's domain publishes none.
pub const DEFAULT_EXPLANATION: &str =
    "Please see http://www.openspf.org/why.html?sender=%{S}&ip=%{I}&receiver=%{R}";

/// Engine configuration. The limits default to the RFC 4408
/// Section 10.1 values.
#[derive(Debug, Clone)]
pub struct ServerOptions {
    /// Ceiling on DNS-interactive terms per evaluation.
    pub max_dns_interactive_terms: usize,
    /// Default ceiling on name lookups within a single term.
    pub max_name_lookups_per_term: usize,
    /// Override for `mx`; falls back to `max_name_lookups_per_term`.
    pub max_name_lookups_per_mx_mech: Option<usize>,
    /// Override for `ptr`; falls back to `max_name_lookups_per_term`.
    pub max_name_lookups_per_ptr_mech: Option<usize>,
    /// Explanation template bound before any `exp` modifier runs.
    pub default_explanation: String,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            max_dns_interactive_terms: 10,
            max_name_lookups_per_term: 10,
            max_name_lookups_per_mx_mech: None,
            max_name_lookups_per_ptr_mech: None,
            default_explanation: DEFAULT_EXPLANATION.to_string(),
        }
    }
}

/// Internal short-circuit: either a final result thrown from deep in
/// the evaluation, or an internal error folded into a result at the
/// `process` boundary.
enum Interrupt {
    Result(SpfResult),
    Error(EvalError),
}

impl From<EvalError> for Interrupt {
    fn from(e: EvalError) -> Self {
        Interrupt::Error(e)
    }
}

impl From<SyntaxError> for Interrupt {
    fn from(e: SyntaxError) -> Self {
        Interrupt::Error(EvalError::Syntax(e))
    }
}

/// Mutable per-evaluation state, shared by a root request and every
/// include/redirect frame derived from it so the limits stay global.
struct EvalState {
    dns_interactive_terms: usize,
    include_stack: Vec<String>,
    explanation: MacroString,
    /// Validated PTR names, computed at most once per evaluation.
    ptr_names: Option<Vec<String>>,
}

/// The SPF policy engine.
pub struct Server<R> {
    resolver: Arc<R>,
    max_dns_interactive_terms: usize,
    max_name_lookups_per_mx_mech: usize,
    max_name_lookups_per_ptr_mech: usize,
    default_explanation: MacroString,
}

impl<R: DnsResolver> Server<R> {
    /// Engine with the default limits and explanation.
    pub fn new(resolver: Arc<R>) -> Self {
        Self::with_options(resolver, ServerOptions::default())
            .expect("built-in default explanation is a valid macro string")
    }

    /// Engine with explicit options. Fails if the configured default
    /// explanation is not a valid macro string.
    pub fn with_options(resolver: Arc<R>, options: ServerOptions) -> Result<Self, SyntaxError> {
        let default_explanation = MacroString::parse(&options.default_explanation)?;
        Ok(Self {
            resolver,
            max_dns_interactive_terms: options.max_dns_interactive_terms,
            max_name_lookups_per_mx_mech: options
                .max_name_lookups_per_mx_mech
                .unwrap_or(options.max_name_lookups_per_term),
            max_name_lookups_per_ptr_mech: options
                .max_name_lookups_per_ptr_mech
                .unwrap_or(options.max_name_lookups_per_term),
            default_explanation,
        })
    }

    /// Evaluate the request against its authority domain's policy.
    pub async fn process(&self, request: &Request) -> SpfResult {
        let authority = domain::normalize(request.authority_domain());
        debug!(
            domain = %authority,
            scope = %request.scope(),
            ip = %request.ip(),
            "evaluating sender policy"
        );
        let mut state = EvalState {
            dns_interactive_terms: 0,
            include_stack: Vec::new(),
            explanation: self.default_explanation.clone(),
            ptr_names: None,
        };
        let result = match self.check_domain(request, &authority, &mut state).await {
            Ok(result) => result,
            Err(Interrupt::Result(result)) => result,
            Err(Interrupt::Error(e)) => {
                debug!(error = %e, "evaluation aborted");
                e.into_result()
            }
        };
        debug!(result = %result, "sender policy evaluated");
        result
    }

    /// Select and evaluate the policy of one domain. Re-entered with a
    /// rebound domain for include and redirect.
    async fn check_domain(
        &self,
        request: &Request,
        domain: &str,
        state: &mut EvalState,
    ) -> Result<SpfResult, Interrupt> {
        let record = match self.select_record(request, domain).await? {
            Some(record) => record,
            None => return Ok(SpfResult::None),
        };
        debug!(domain = %domain, record = %record, "selected record");
        self.eval_record(&record, request, domain, state).await
    }

    /// Fetch the acceptable record for a domain: SPF RR-type first,
    /// then TXT; prefer the highest acceptable version; more than one
    /// record of that version is a permanent error.
    async fn select_record(
        &self,
        request: &Request,
        domain: &str,
    ) -> Result<Option<Record>, Interrupt> {
        // Timeouts on the SPF RR-type are common resolver breakage and
        // are treated as an empty answer rather than a temperror.
        let texts = match self
            .resolver
            .query_spf(&domain::normalize_lookup_name(domain))
            .await
        {
            Ok(texts) => texts,
            Err(DnsError::NxDomain) | Err(DnsError::Timeout) => Vec::new(),
            Err(source) => {
                return Err(EvalError::Dns {
                    domain: domain.to_string(),
                    source,
                }
                .into())
            }
        };
        let mut candidates = collect_records(&texts, request)?;
        if candidates.is_empty() {
            let texts = self.lookup_txt(domain).await?;
            candidates = collect_records(&texts, request)?;
        }

        for version in [Version::V2, Version::V1] {
            let mut matching: Vec<Record> = candidates
                .iter()
                .filter(|r| r.version() == version)
                .cloned()
                .collect();
            match matching.len() {
                0 => continue,
                1 => return Ok(matching.pop()),
                _ => return Err(EvalError::RedundantRecords.into()),
            }
        }
        Ok(None)
    }

    async fn eval_record(
        &self,
        record: &Record,
        request: &Request,
        domain: &str,
        state: &mut EvalState,
    ) -> Result<SpfResult, Interrupt> {
        for directive in record.directives() {
            let matched = self
                .match_mechanism(&directive.mechanism, request, domain, state)
                .await?;
            trace!(mechanism = %directive.mechanism, matched, "mechanism evaluated");
            if matched {
                return self
                    .qualified_result(directive.qualifier, record, request, domain, state)
                    .await;
            }
        }

        // No mechanism matched. Bind this record's explanation before
        // following a redirect, so a fail at the target inherits it.
        self.process_exp(record, request, domain, state).await;

        if let Some(target) = record.redirect() {
            self.count_dns_interactive_term(state)?;
            let target =
                domain::normalize(&self.expand(target, request, domain, state, false).await?);
            trace!(target = %target, "following redirect");
            let result = Box::pin(self.check_domain(request, &target, state)).await?;
            return match result {
                SpfResult::None => Err(EvalError::NoApplicablePolicy(target).into()),
                other => Ok(other),
            };
        }

        Ok(SpfResult::Neutral)
    }

    /// Turn a matched directive's qualifier into the final result,
    /// capturing the authority explanation for `fail`.
    async fn qualified_result(
        &self,
        qualifier: Qualifier,
        record: &Record,
        request: &Request,
        domain: &str,
        state: &mut EvalState,
    ) -> Result<SpfResult, Interrupt> {
        Ok(match qualifier {
            Qualifier::Pass => SpfResult::Pass,
            Qualifier::Neutral => SpfResult::Neutral,
            Qualifier::SoftFail => SpfResult::SoftFail,
            Qualifier::Fail => {
                self.process_exp(record, request, domain, state).await;
                let explanation = self.authority_explanation(request, domain, state).await;
                SpfResult::Fail { explanation }
            }
        })
    }

    /// Process an `exp` modifier: expand its target, fetch the TXT
    /// explanation, and bind it. Failures of any kind leave the
    /// current binding untouched; explanation handling never alters
    /// the result and is exempt from the processing limits.
    async fn process_exp(
        &self,
        record: &Record,
        request: &Request,
        domain: &str,
        state: &mut EvalState,
    ) {
        let spec = match record.exp() {
            Some(spec) => spec,
            None => return,
        };
        let target = match self.expand(spec, request, domain, state, false).await {
            Ok(target) => target,
            Err(_) => return,
        };
        let texts = match self
            .resolver
            .query_txt(&domain::normalize_lookup_name(&target))
            .await
        {
            Ok(texts) => texts,
            Err(_) => return,
        };
        if texts.len() != 1 {
            return;
        }
        if let Ok(explanation) = MacroString::parse(&texts[0]) {
            trace!(target = %target, "bound authority explanation");
            state.explanation = explanation;
        }
    }

    async fn authority_explanation(
        &self,
        request: &Request,
        domain: &str,
        state: &mut EvalState,
    ) -> Option<String> {
        let explanation = state.explanation.clone();
        match self.expand(&explanation, request, domain, state, true).await {
            Ok(text) => Some(text),
            Err(_) => None,
        }
    }

    /// Account for one DNS-interactive term. Called exactly once by
    /// `include`, `a`, `mx`, `ptr`, `exists`, and `redirect`, before
    /// any DNS work.
    fn count_dns_interactive_term(&self, state: &mut EvalState) -> Result<(), Interrupt> {
        state.dns_interactive_terms += 1;
        if state.dns_interactive_terms > self.max_dns_interactive_terms {
            Err(EvalError::TooManyDnsTerms(self.max_dns_interactive_terms).into())
        } else {
            Ok(())
        }
    }

    async fn match_mechanism(
        &self,
        mechanism: &Mechanism,
        request: &Request,
        domain: &str,
        state: &mut EvalState,
    ) -> Result<bool, Interrupt> {
        match mechanism {
            Mechanism::All => Ok(true),

            Mechanism::Ip4 { addr, prefix_len } => Ok(match request.ipv4() {
                Some(client) => net::ip4_in_network(client, *addr, *prefix_len),
                None => false,
            }),

            Mechanism::Ip6 { addr, prefix_len } => {
                Ok(net::ip6_in_network(request.ipv6(), *addr, *prefix_len))
            }

            Mechanism::A { domain: spec, cidr } => {
                self.count_dns_interactive_term(state)?;
                let target = self
                    .target_domain(spec.as_ref(), request, domain, state)
                    .await?;
                self.any_address_matches(&target, request, *cidr).await
            }

            Mechanism::Mx { domain: spec, cidr } => {
                self.count_dns_interactive_term(state)?;
                let target = self
                    .target_domain(spec.as_ref(), request, domain, state)
                    .await?;
                let mut hosts = self.lookup_mx(&target).await?;
                hosts.sort_by_key(|host| host.preference);
                // Exchanges beyond the cap are silently not considered.
                for host in hosts.iter().take(self.max_name_lookups_per_mx_mech) {
                    if self
                        .any_address_matches(&host.exchange, request, *cidr)
                        .await?
                    {
                        return Ok(true);
                    }
                }
                Ok(false)
            }

            Mechanism::Ptr(spec) => {
                self.count_dns_interactive_term(state)?;
                let target = self
                    .target_domain(spec.as_ref(), request, domain, state)
                    .await?;
                let validated = self.validated_ptr_names(request, state).await;
                Ok(validated.iter().any(|name| {
                    domain::domains_equal(name, &target) || domain::is_subdomain_of(name, &target)
                }))
            }

            Mechanism::Exists(spec) => {
                self.count_dns_interactive_term(state)?;
                let target = self.expand(spec, request, domain, state, false).await?;
                // Existence only; always an A query, even for IPv6
                // clients, and the addresses themselves are ignored.
                let addrs = self.lookup_a(&target).await?;
                Ok(!addrs.is_empty())
            }

            Mechanism::Include(spec) => {
                self.count_dns_interactive_term(state)?;
                let target =
                    domain::normalize(&self.expand(spec, request, domain, state, false).await?);
                if target == domain::normalize(domain) || state.include_stack.contains(&target) {
                    return Err(EvalError::IncludeLoop(target).into());
                }
                state.include_stack.push(target.clone());
                // An explanation bound inside the include applies only
                // to the sub-result consumed right here; the limits are
                // the only state that stays global.
                let saved_explanation = state.explanation.clone();
                trace!(target = %target, "evaluating include");
                let sub = Box::pin(self.check_domain(request, &target, state)).await;
                state.include_stack.pop();
                state.explanation = saved_explanation;
                // RFC 4408 Section 5.2 result mapping.
                match sub? {
                    SpfResult::Pass => Ok(true),
                    SpfResult::Fail { .. } | SpfResult::SoftFail | SpfResult::Neutral => Ok(false),
                    SpfResult::TempError => Err(Interrupt::Result(SpfResult::TempError)),
                    SpfResult::PermError => Err(Interrupt::Result(SpfResult::PermError)),
                    SpfResult::None => Err(EvalError::NoApplicablePolicy(target).into()),
                }
            }
        }
    }

    /// The effective domain of a mechanism: its expanded domain-spec,
    /// or the domain currently under evaluation.
    async fn target_domain(
        &self,
        spec: Option<&MacroString>,
        request: &Request,
        domain: &str,
        state: &mut EvalState,
    ) -> Result<String, Interrupt> {
        match spec {
            Some(spec) => self.expand(spec, request, domain, state, false).await,
            None => Ok(domain.to_string()),
        }
    }

    /// Address comparison shared by `a` and `mx`: look up A or AAAA
    /// depending on the client's IP version and test prefix
    /// containment against every returned address.
    async fn any_address_matches(
        &self,
        name: &str,
        request: &Request,
        cidr: DualCidr,
    ) -> Result<bool, Interrupt> {
        match request.ipv4() {
            Some(client) => {
                let addrs = self.lookup_a(name).await?;
                Ok(addrs
                    .into_iter()
                    .any(|a| net::ip4_in_network(client, a, cidr.v4)))
            }
            None => {
                let client = request.ipv6();
                let addrs = self.lookup_aaaa(name).await?;
                Ok(addrs
                    .into_iter()
                    .any(|a| net::ip6_in_network(client, a, cidr.v6)))
            }
        }
    }

    /// Validated PTR names for the client address, shared by the `ptr`
    /// mechanism and the `%{p}` macro and computed at most once per
    /// evaluation. DNS failures shrink the set; they never abort the
    /// evaluation.
    async fn validated_ptr_names(&self, request: &Request, state: &mut EvalState) -> Vec<String> {
        if let Some(names) = &state.ptr_names {
            return names.clone();
        }
        let names = self.compute_validated_ptr_names(request).await;
        state.ptr_names = Some(names.clone());
        names
    }

    async fn compute_validated_ptr_names(&self, request: &Request) -> Vec<String> {
        let reverse = net::reverse_name(request.ip());
        let names = match self.resolver.query_ptr(&reverse).await {
            Ok(names) => names,
            Err(_) => return Vec::new(),
        };
        let mut validated = Vec::new();
        for name in names.iter().take(self.max_name_lookups_per_ptr_mech) {
            let lookup_name = domain::normalize_lookup_name(name);
            let confirmed = match request.ipv4() {
                Some(client) => match self.resolver.query_a(&lookup_name).await {
                    Ok(addrs) => addrs.contains(&client),
                    Err(_) => false,
                },
                None => match self.resolver.query_aaaa(&lookup_name).await {
                    Ok(addrs) => addrs.contains(&request.ipv6()),
                    Err(_) => false,
                },
            };
            if confirmed {
                validated.push(domain::normalize(name));
            }
        }
        validated
    }

    /// The `%{p}` value: prefer a validated name equal to the current
    /// domain, then a sub-domain of it, then any validated name.
    async fn macro_ptr_name(
        &self,
        request: &Request,
        domain: &str,
        state: &mut EvalState,
    ) -> Option<String> {
        let names = self.validated_ptr_names(request, state).await;
        if let Some(exact) = names.iter().find(|n| domain::domains_equal(n, domain)) {
            return Some(exact.clone());
        }
        if let Some(sub) = names.iter().find(|n| domain::is_subdomain_of(n, domain)) {
            return Some(sub.clone());
        }
        names.first().cloned()
    }

    /// Expand a macro string against this evaluation. Resolves the
    /// validated PTR name first when `%{p}` is referenced.
    async fn expand(
        &self,
        spec: &MacroString,
        request: &Request,
        domain: &str,
        state: &mut EvalState,
        in_explanation: bool,
    ) -> Result<String, Interrupt> {
        let ptr_name = if spec.references_ptr() {
            self.macro_ptr_name(request, domain, state).await
        } else {
            None
        };
        let sender = request.sender();
        let ctx = MacroContext {
            sender: &sender,
            local_part: request.local_part(),
            sender_domain: request.authority_domain(),
            domain,
            client_ip: request.ip(),
            helo: request.helo_identity().unwrap_or("unknown"),
            receiver: request.receiver().unwrap_or("unknown"),
            ptr_name: ptr_name.as_deref(),
            in_explanation,
        };
        spec.expand(&ctx).map_err(Interrupt::from)
    }

    // -- DNS plumbing --------------------------------------------------

    async fn lookup_txt(&self, name: &str) -> Result<Vec<String>, Interrupt> {
        let result = self
            .resolver
            .query_txt(&domain::normalize_lookup_name(name))
            .await;
        dns_answer(name, result)
    }

    async fn lookup_a(&self, name: &str) -> Result<Vec<std::net::Ipv4Addr>, Interrupt> {
        let result = self
            .resolver
            .query_a(&domain::normalize_lookup_name(name))
            .await;
        dns_answer(name, result)
    }

    async fn lookup_aaaa(&self, name: &str) -> Result<Vec<std::net::Ipv6Addr>, Interrupt> {
        let result = self
            .resolver
            .query_aaaa(&domain::normalize_lookup_name(name))
            .await;
        dns_answer(name, result)
    }

    async fn lookup_mx(&self, name: &str) -> Result<Vec<MxHost>, Interrupt> {
        let result = self
            .resolver
            .query_mx(&domain::normalize_lookup_name(name))
            .await;
        dns_answer(name, result)
    }
}

/// NXDOMAIN is a successful empty answer; a timeout and every other
/// DNS failure surface as transient errors.
fn dns_answer<T>(name: &str, result: Result<Vec<T>, DnsError>) -> Result<Vec<T>, Interrupt> {
    match result {
        Ok(values) => Ok(values),
        Err(DnsError::NxDomain) => Ok(Vec::new()),
        Err(DnsError::Timeout) => Err(EvalError::DnsTimeout {
            domain: name.to_string(),
        }
        .into()),
        Err(source) => Err(EvalError::Dns {
            domain: name.to_string(),
            source,
        }
        .into()),
    }
}

/// Parse every acceptable record out of a set of answer texts. Texts
/// that are not SPF records of an accepted version are skipped; a text
/// that claims an accepted version but fails to parse is a syntax
/// error.
fn collect_records(texts: &[String], request: &Request) -> Result<Vec<Record>, Interrupt> {
    let mut records = Vec::new();
    for text in texts {
        let version = match Record::version_tag(text) {
            Some(version) => version,
            None => continue,
        };
        if !request.versions().contains(&version) {
            continue;
        }
        let record = Record::parse(text).map_err(EvalError::Syntax)?;
        if record.covers(request.scope()) {
            records.push(record);
        }
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dns::MockResolver;
    use crate::request::Scope;
    use std::net::IpAddr;

    fn server(resolver: &MockResolver) -> Server<MockResolver> {
        Server::new(Arc::new(resolver.clone()))
    }

    fn req(ip: &str) -> Request {
        Request::mfrom("alice@example.com", ip.parse::<IpAddr>().unwrap())
    }

    async fn run(resolver: &MockResolver, request: &Request) -> SpfResult {
        server(resolver).process(request).await
    }

    fn fail_with(explanation: &str) -> SpfResult {
        SpfResult::Fail {
            explanation: Some(explanation.to_string()),
        }
    }

    // ---- record retrieval and selection ----

    #[tokio::test]
    async fn no_record_at_all_is_none() {
        let resolver = MockResolver::new();
        assert_eq!(run(&resolver, &req("192.0.2.5")).await, SpfResult::None);
    }

    #[tokio::test]
    async fn unrelated_txt_records_are_none() {
        let resolver = MockResolver::new();
        resolver.add_txt("example.com", &["google-site-verification=abc", "hello"]);
        assert_eq!(run(&resolver, &req("192.0.2.5")).await, SpfResult::None);
    }

    #[tokio::test]
    async fn redundant_records_are_permerror() {
        let resolver = MockResolver::new();
        resolver.add_txt("example.com", &["v=spf1 +all", "v=spf1 -all"]);
        assert_eq!(run(&resolver, &req("192.0.2.5")).await, SpfResult::PermError);
    }

    #[tokio::test]
    async fn spf_rrtype_preferred_over_txt() {
        let resolver = MockResolver::new();
        resolver.add_spf("example.com", &["v=spf1 ip4:192.0.2.0/24 -all"]);
        resolver.add_txt("example.com", &["v=spf1 -all"]);
        assert_eq!(run(&resolver, &req("192.0.2.5")).await, SpfResult::Pass);
    }

    #[tokio::test]
    async fn spf_rrtype_timeout_falls_back_to_txt() {
        let resolver = MockResolver::new();
        resolver.fail_spf("example.com", DnsError::Timeout);
        resolver.add_txt("example.com", &["v=spf1 ip4:192.0.2.0/24 -all"]);
        assert_eq!(run(&resolver, &req("192.0.2.5")).await, SpfResult::Pass);
    }

    #[tokio::test]
    async fn spf_rrtype_failure_is_temperror() {
        let resolver = MockResolver::new();
        resolver.fail_spf("example.com", DnsError::Failure("servfail".into()));
        resolver.add_txt("example.com", &["v=spf1 -all"]);
        assert_eq!(run(&resolver, &req("192.0.2.5")).await, SpfResult::TempError);
    }

    #[tokio::test]
    async fn txt_failure_is_temperror() {
        let resolver = MockResolver::new();
        resolver.fail_txt("example.com", DnsError::Failure("servfail".into()));
        assert_eq!(run(&resolver, &req("192.0.2.5")).await, SpfResult::TempError);
    }

    #[tokio::test]
    async fn invalid_record_body_is_permerror() {
        let resolver = MockResolver::new();
        resolver.add_txt("example.com", &["v=spf1 badmech:foo -all"]);
        assert_eq!(run(&resolver, &req("192.0.2.5")).await, SpfResult::PermError);
    }

    #[tokio::test]
    async fn v2_record_preferred_over_v1() {
        let resolver = MockResolver::new();
        resolver.add_txt(
            "example.com",
            &["v=spf1 -all", "spf2.0/mfrom ip4:192.0.2.0/24 -all"],
        );
        assert_eq!(run(&resolver, &req("192.0.2.5")).await, SpfResult::Pass);
    }

    #[tokio::test]
    async fn pra_scope_needs_a_v2_record() {
        let resolver = MockResolver::new();
        resolver.add_txt("example.com", &["v=spf1 ip4:192.0.2.0/24 -all"]);
        let request = Request::pra("alice@example.com", "192.0.2.5".parse().unwrap());
        assert_eq!(run(&resolver, &request).await, SpfResult::None);

        resolver.add_txt(
            "example.com",
            &["v=spf1 -all", "spf2.0/pra ip4:192.0.2.0/24 -all"],
        );
        let request = Request::pra("alice@example.com", "192.0.2.5".parse().unwrap());
        assert_eq!(run(&resolver, &request).await, SpfResult::Pass);
    }

    #[tokio::test]
    async fn helo_scope_checks_the_helo_domain() {
        let resolver = MockResolver::new();
        resolver.add_txt("mail.example.com", &["v=spf1 ip4:192.0.2.0/24 -all"]);
        let request = Request::helo("mail.example.com", "192.0.2.5".parse().unwrap());
        assert_eq!(run(&resolver, &request).await, SpfResult::Pass);
        assert_eq!(request.scope(), Scope::Helo);
    }

    // ---- ip4 / ip6 ----

    #[tokio::test]
    async fn ip4_pass_and_fail() {
        let resolver = MockResolver::new();
        resolver.add_txt("example.com", &["v=spf1 ip4:192.0.2.0/24 -all"]);
        assert_eq!(run(&resolver, &req("192.0.2.5")).await, SpfResult::Pass);
        let result = run(&resolver, &req("198.51.100.7")).await;
        assert_eq!(result.code(), "fail");
    }

    #[tokio::test]
    async fn ip4_never_matches_a_native_ipv6_client() {
        let resolver = MockResolver::new();
        resolver.add_txt("example.com", &["v=spf1 ip4:0.0.0.0/0 -all"]);
        let result = run(&resolver, &req("2001:db8::1")).await;
        assert_eq!(result.code(), "fail");
    }

    #[tokio::test]
    async fn ip4_matches_a_v4_mapped_ipv6_client() {
        let resolver = MockResolver::new();
        resolver.add_txt("example.com", &["v=spf1 ip4:192.0.2.0/24 -all"]);
        assert_eq!(
            run(&resolver, &req("::ffff:192.0.2.5")).await,
            SpfResult::Pass
        );
    }

    #[tokio::test]
    async fn ip6_pass_and_fail() {
        let resolver = MockResolver::new();
        resolver.add_txt("example.com", &["v=spf1 ip6:2001:db8::/32 -all"]);
        assert_eq!(run(&resolver, &req("2001:db8::1")).await, SpfResult::Pass);
        let result = run(&resolver, &req("2001:db9::1")).await;
        assert_eq!(result.code(), "fail");
    }

    #[tokio::test]
    async fn ip6_mapped_network_matches_v4_client() {
        let resolver = MockResolver::new();
        resolver.add_txt("example.com", &["v=spf1 ip6:::ffff:192.0.2.0/120 -all"]);
        assert_eq!(run(&resolver, &req("192.0.2.5")).await, SpfResult::Pass);
    }

    // ---- a / mx ----

    #[tokio::test]
    async fn a_mechanism_matches_own_domain() {
        let resolver = MockResolver::new();
        resolver.add_txt("example.com", &["v=spf1 a -all"]);
        resolver.add_a("example.com", &["192.0.2.10".parse().unwrap()]);
        assert_eq!(run(&resolver, &req("192.0.2.10")).await, SpfResult::Pass);
        assert_eq!(run(&resolver, &req("192.0.2.11")).await.code(), "fail");
    }

    #[tokio::test]
    async fn a_mechanism_with_cidr_and_domain() {
        let resolver = MockResolver::new();
        resolver.add_txt("example.com", &["v=spf1 a:mail.example.com/24 -all"]);
        resolver.add_a("mail.example.com", &["192.0.2.10".parse().unwrap()]);
        assert_eq!(run(&resolver, &req("192.0.2.99")).await, SpfResult::Pass);
    }

    #[tokio::test]
    async fn a_mechanism_uses_aaaa_for_ipv6_clients() {
        let resolver = MockResolver::new();
        resolver.add_txt("example.com", &["v=spf1 a -all"]);
        resolver.add_aaaa("example.com", &["2001:db8::10".parse().unwrap()]);
        assert_eq!(run(&resolver, &req("2001:db8::10")).await, SpfResult::Pass);
    }

    #[tokio::test]
    async fn mx_mechanism_in_preference_order() {
        let resolver = MockResolver::new();
        resolver.add_txt("example.com", &["v=spf1 mx -all"]);
        resolver.add_mx(
            "example.com",
            &[(20, "backup.example.com"), (10, "mail.example.com")],
        );
        resolver.add_a("backup.example.com", &["192.0.2.20".parse().unwrap()]);
        resolver.add_a("mail.example.com", &["192.0.2.10".parse().unwrap()]);
        assert_eq!(run(&resolver, &req("192.0.2.20")).await, SpfResult::Pass);
        assert_eq!(run(&resolver, &req("192.0.2.10")).await, SpfResult::Pass);
        assert_eq!(run(&resolver, &req("192.0.2.30")).await.code(), "fail");
    }

    #[tokio::test]
    async fn mx_lookup_cap_terminates_without_match() {
        let resolver = MockResolver::new();
        resolver.add_txt("example.com", &["v=spf1 mx -all"]);
        resolver.add_mx(
            "example.com",
            &[(10, "a.example.com"), (20, "b.example.com")],
        );
        resolver.add_a("a.example.com", &["203.0.113.1".parse().unwrap()]);
        resolver.add_a("b.example.com", &["192.0.2.20".parse().unwrap()]);
        let server = Server::with_options(
            Arc::new(resolver.clone()),
            ServerOptions {
                max_name_lookups_per_mx_mech: Some(1),
                ..Default::default()
            },
        )
        .unwrap();
        // The matching exchange is second by preference, past the cap.
        let result = server.process(&req("192.0.2.20")).await;
        assert_eq!(result.code(), "fail");
    }

    // ---- ptr ----

    #[tokio::test]
    async fn ptr_mechanism_validates_forward_lookup() {
        let resolver = MockResolver::new();
        let ip: IpAddr = "192.0.2.5".parse().unwrap();
        resolver.add_txt("example.com", &["v=spf1 ptr -all"]);
        resolver.add_ptr(ip, &["mail.example.com", "spoof.attacker.net"]);
        resolver.add_a("mail.example.com", &["192.0.2.5".parse().unwrap()]);
        // The attacker name forward-resolves elsewhere.
        resolver.add_a("spoof.attacker.net", &["203.0.113.9".parse().unwrap()]);
        assert_eq!(run(&resolver, &req("192.0.2.5")).await, SpfResult::Pass);
    }

    #[tokio::test]
    async fn ptr_mechanism_requires_subdomain_of_target() {
        let resolver = MockResolver::new();
        let ip: IpAddr = "192.0.2.5".parse().unwrap();
        resolver.add_txt("example.com", &["v=spf1 ptr -all"]);
        resolver.add_ptr(ip, &["mail.other.net"]);
        resolver.add_a("mail.other.net", &["192.0.2.5".parse().unwrap()]);
        assert_eq!(run(&resolver, &req("192.0.2.5")).await.code(), "fail");
    }

    #[tokio::test]
    async fn ptr_lookup_error_is_no_match_not_temperror() {
        let resolver = MockResolver::new();
        let ip: IpAddr = "192.0.2.5".parse().unwrap();
        resolver.add_txt("example.com", &["v=spf1 ptr ~all"]);
        resolver.fail_ptr(ip, DnsError::Failure("servfail".into()));
        assert_eq!(run(&resolver, &req("192.0.2.5")).await, SpfResult::SoftFail);
    }

    // ---- exists ----

    #[tokio::test]
    async fn exists_with_reversed_ip_macro() {
        let resolver = MockResolver::new();
        resolver.add_txt("example.com", &["v=spf1 exists:%{ir}.sbl.example.com -all"]);
        resolver.add_a("1.2.0.192.sbl.example.com", &["127.0.0.2".parse().unwrap()]);
        assert_eq!(run(&resolver, &req("192.0.2.1")).await, SpfResult::Pass);
        assert_eq!(run(&resolver, &req("192.0.2.2")).await.code(), "fail");
    }

    // ---- include ----

    #[tokio::test]
    async fn include_pass_matches_with_parent_qualifier() {
        let resolver = MockResolver::new();
        resolver.add_txt("example.com", &["v=spf1 ?include:partner.example -all"]);
        resolver.add_txt("partner.example", &["v=spf1 ip4:192.0.2.0/24 -all"]);
        assert_eq!(run(&resolver, &req("192.0.2.5")).await, SpfResult::Neutral);
    }

    #[tokio::test]
    async fn include_fail_continues_to_next_mechanism() {
        let resolver = MockResolver::new();
        resolver.add_txt("example.com", &["v=spf1 include:partner.example ~all"]);
        resolver.add_txt("partner.example", &["v=spf1 ip4:203.0.113.0/24 -all"]);
        assert_eq!(
            run(&resolver, &req("198.51.100.9")).await,
            SpfResult::SoftFail
        );
    }

    #[tokio::test]
    async fn include_none_is_permerror() {
        let resolver = MockResolver::new();
        resolver.add_txt("example.com", &["v=spf1 include:missing.example -all"]);
        assert_eq!(run(&resolver, &req("192.0.2.5")).await, SpfResult::PermError);
    }

    #[tokio::test]
    async fn include_temperror_short_circuits() {
        let resolver = MockResolver::new();
        resolver.add_txt("example.com", &["v=spf1 include:partner.example +all"]);
        resolver.fail_txt("partner.example", DnsError::Failure("servfail".into()));
        assert_eq!(run(&resolver, &req("192.0.2.5")).await, SpfResult::TempError);
    }

    #[tokio::test]
    async fn include_loop_is_permerror() {
        let resolver = MockResolver::new();
        resolver.add_txt("example.com", &["v=spf1 include:loop.example -all"]);
        resolver.add_txt("loop.example", &["v=spf1 include:example.com -all"]);
        assert_eq!(run(&resolver, &req("192.0.2.5")).await, SpfResult::PermError);
    }

    #[tokio::test]
    async fn direct_self_include_is_permerror() {
        let resolver = MockResolver::new();
        resolver.add_txt("example.com", &["v=spf1 include:example.com -all"]);
        assert_eq!(run(&resolver, &req("192.0.2.5")).await, SpfResult::PermError);
    }

    // ---- processing limits ----

    #[tokio::test]
    async fn eleven_chained_includes_exceed_the_limit() {
        let resolver = MockResolver::new();
        resolver.add_txt("example.com", &["v=spf1 include:i1.example -all"]);
        for i in 1..11 {
            resolver.add_txt(
                &format!("i{i}.example"),
                &[&format!("v=spf1 include:i{}.example -all", i + 1)],
            );
        }
        assert_eq!(run(&resolver, &req("192.0.2.5")).await, SpfResult::PermError);
    }

    #[tokio::test]
    async fn ten_chained_includes_stay_within_the_limit() {
        let resolver = MockResolver::new();
        resolver.add_txt("example.com", &["v=spf1 include:i1.example -all"]);
        for i in 1..10 {
            resolver.add_txt(
                &format!("i{i}.example"),
                &[&format!("v=spf1 include:i{}.example -all", i + 1)],
            );
        }
        resolver.add_txt("i10.example", &["v=spf1 +all"]);
        assert_eq!(run(&resolver, &req("192.0.2.5")).await, SpfResult::Pass);
    }

    #[tokio::test]
    async fn non_dns_mechanisms_are_not_counted() {
        let resolver = MockResolver::new();
        // 20 ip4 terms, no DNS-interactive term at all.
        let mut record = String::from("v=spf1");
        for i in 0..20 {
            record.push_str(&format!(" ip4:203.0.113.{i}"));
        }
        record.push_str(" ip4:192.0.2.5 -all");
        resolver.add_txt("example.com", &[&record]);
        assert_eq!(run(&resolver, &req("192.0.2.5")).await, SpfResult::Pass);
    }

    // ---- redirect ----

    #[tokio::test]
    async fn redirect_returns_target_result() {
        let resolver = MockResolver::new();
        resolver.add_txt("example.com", &["v=spf1 redirect=other.example"]);
        resolver.add_txt("other.example", &["v=spf1 ip4:192.0.2.1 -all"]);
        assert_eq!(run(&resolver, &req("192.0.2.1")).await, SpfResult::Pass);
        assert_eq!(run(&resolver, &req("10.0.0.1")).await.code(), "fail");
    }

    #[tokio::test]
    async fn redirect_to_missing_policy_is_permerror() {
        let resolver = MockResolver::new();
        resolver.add_txt("example.com", &["v=spf1 redirect=missing.example"]);
        assert_eq!(run(&resolver, &req("192.0.2.5")).await, SpfResult::PermError);
    }

    #[tokio::test]
    async fn redirect_ignored_when_a_mechanism_matches() {
        let resolver = MockResolver::new();
        resolver.add_txt(
            "example.com",
            &["v=spf1 ip4:192.0.2.0/24 redirect=missing.example"],
        );
        assert_eq!(run(&resolver, &req("192.0.2.5")).await, SpfResult::Pass);
    }

    // ---- neutral default ----

    #[tokio::test]
    async fn empty_record_is_neutral() {
        let resolver = MockResolver::new();
        resolver.add_txt("example.com", &["v=spf1"]);
        assert_eq!(run(&resolver, &req("192.0.2.5")).await, SpfResult::Neutral);
    }

    #[tokio::test]
    async fn no_match_without_all_is_neutral() {
        let resolver = MockResolver::new();
        resolver.add_txt("example.com", &["v=spf1 ip4:203.0.113.0/24"]);
        assert_eq!(run(&resolver, &req("192.0.2.5")).await, SpfResult::Neutral);
    }

    // ---- explanations ----

    #[tokio::test]
    async fn fail_carries_the_exp_explanation() {
        let resolver = MockResolver::new();
        resolver.add_txt("example.com", &["v=spf1 -all exp=why.example.com"]);
        resolver.add_txt("why.example.com", &["denied for %{i}"]);
        assert_eq!(
            run(&resolver, &req("198.51.100.7")).await,
            fail_with("denied for 198.51.100.7")
        );
    }

    #[tokio::test]
    async fn fail_without_exp_uses_the_default_explanation() {
        let resolver = MockResolver::new();
        resolver.add_txt("example.com", &["v=spf1 -all"]);
        let request = req("192.0.2.5").with_receiver("mx.receiver.example");
        let result = run(&resolver, &request).await;
        let explanation = result.explanation().unwrap();
        assert!(explanation.contains("openspf.org"));
        assert!(explanation.contains("sender=alice%40example.com"));
        assert!(explanation.contains("ip=192.0.2.5"));
        assert!(explanation.contains("receiver=mx.receiver.example"));
    }

    #[tokio::test]
    async fn exp_failures_fall_back_to_the_default() {
        let resolver = MockResolver::new();
        resolver.add_txt("example.com", &["v=spf1 -all exp=why.example.com"]);
        // No TXT at why.example.com at all.
        let result = run(&resolver, &req("192.0.2.5")).await;
        assert!(result.explanation().unwrap().contains("openspf.org"));

        // Multiple TXT strings are ambiguous and ignored.
        resolver.add_txt("why.example.com", &["one", "two"]);
        let result = run(&resolver, &req("192.0.2.5")).await;
        assert!(result.explanation().unwrap().contains("openspf.org"));
    }

    #[tokio::test]
    async fn include_exp_does_not_leak_into_the_parent_fail() {
        let resolver = MockResolver::new();
        resolver.add_txt("example.com", &["v=spf1 include:inner.example -all"]);
        resolver.add_txt("inner.example", &["v=spf1 -all exp=inner-explain.example.com"]);
        resolver.add_txt("inner-explain.example.com", &["inner says no"]);
        // The include's internal fail (and its explanation binding) is
        // discarded; the parent's own -all must fail with the default.
        let result = run(&resolver, &req("192.0.2.5")).await;
        assert_eq!(result.code(), "fail");
        let explanation = result.explanation().unwrap();
        assert!(
            explanation.contains("openspf.org"),
            "leaked inner explanation: {explanation}"
        );
    }

    #[tokio::test]
    async fn redirect_target_fail_inherits_parent_explanation() {
        let resolver = MockResolver::new();
        resolver.add_txt(
            "example.com",
            &["v=spf1 redirect=other.example exp=why.example.com"],
        );
        resolver.add_txt("other.example", &["v=spf1 -all"]);
        resolver.add_txt("why.example.com", &["blocked: %{i}"]);
        assert_eq!(
            run(&resolver, &req("198.51.100.7")).await,
            fail_with("blocked: 198.51.100.7")
        );
    }

    #[tokio::test]
    async fn explanation_can_use_the_p_macro() {
        let resolver = MockResolver::new();
        let ip: IpAddr = "192.0.2.5".parse().unwrap();
        resolver.add_txt("example.com", &["v=spf1 -all exp=why.example.com"]);
        resolver.add_txt("why.example.com", &["%{p} is not allowed"]);
        resolver.add_ptr(ip, &["mail.example.com"]);
        resolver.add_a("mail.example.com", &["192.0.2.5".parse().unwrap()]);
        assert_eq!(
            run(&resolver, &req("192.0.2.5")).await,
            fail_with("mail.example.com is not allowed")
        );
    }

    // ---- macro errors ----

    #[tokio::test]
    async fn explanation_only_macro_in_mechanism_is_permerror() {
        let resolver = MockResolver::new();
        resolver.add_txt("example.com", &["v=spf1 exists:%{c}.example.com -all"]);
        assert_eq!(run(&resolver, &req("192.0.2.5")).await, SpfResult::PermError);
    }

    #[tokio::test]
    async fn malformed_macro_in_record_is_permerror() {
        let resolver = MockResolver::new();
        resolver.add_txt("example.com", &["v=spf1 include:%{q}.example.com -all"]);
        assert_eq!(run(&resolver, &req("192.0.2.5")).await, SpfResult::PermError);
    }

    // ---- modifiers ----

    #[tokio::test]
    async fn unknown_modifiers_are_ignored() {
        let resolver = MockResolver::new();
        resolver.add_txt(
            "example.com",
            &["v=spf1 tracking=on ip4:192.0.2.0/24 other.mod=x -all"],
        );
        assert_eq!(run(&resolver, &req("192.0.2.5")).await, SpfResult::Pass);
    }
}
