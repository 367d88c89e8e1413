//! DNS resolver seam.
//!
//! The engine consumes exactly six RR-types: TXT, SPF (type 99), A,
//! AAAA, MX, and PTR. `DnsResolver` exposes one typed query per type;
//! NXDOMAIN is reported as an error variant and normalized to an empty
//! answer by the engine. DNS caching is the resolver's responsibility.

use std::collections::HashMap;
use std::future::Future;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::{Arc, RwLock};

use hickory_resolver::config::ResolverConfig;
use hickory_resolver::name_server::TokioConnectionProvider;
use hickory_resolver::proto::rr::{RData, RecordType};
use hickory_resolver::proto::ProtoErrorKind;
use hickory_resolver::{ResolveError, ResolveErrorKind, TokioResolver};
use thiserror::Error;

/// The SPF RR-type (99) has no dedicated hickory representation.
const SPF_RRTYPE: u16 = 99;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DnsError {
    #[error("domain does not exist")]
    NxDomain,
    #[error("query timed out")]
    Timeout,
    #[error("{0}")]
    Failure(String),
}

/// One MX answer record. Preference order is applied by the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MxHost {
    pub preference: u16,
    pub exchange: String,
}

pub trait DnsResolver: Send + Sync {
    fn query_txt(&self, name: &str) -> impl Future<Output = Result<Vec<String>, DnsError>> + Send;
    fn query_spf(&self, name: &str) -> impl Future<Output = Result<Vec<String>, DnsError>> + Send;
    fn query_a(&self, name: &str) -> impl Future<Output = Result<Vec<Ipv4Addr>, DnsError>> + Send;
    fn query_aaaa(&self, name: &str)
        -> impl Future<Output = Result<Vec<Ipv6Addr>, DnsError>> + Send;
    fn query_mx(&self, name: &str) -> impl Future<Output = Result<Vec<MxHost>, DnsError>> + Send;
    fn query_ptr(&self, name: &str) -> impl Future<Output = Result<Vec<String>, DnsError>> + Send;
}

// ---------------------------------------------------------------------------
// HickoryResolver
// ---------------------------------------------------------------------------

/// Production resolver backed by hickory-dns.
#[derive(Clone)]
pub struct HickoryResolver {
    resolver: TokioResolver,
}

impl HickoryResolver {
    pub fn new() -> Self {
        let resolver = TokioResolver::builder_with_config(
            ResolverConfig::cloudflare(),
            TokioConnectionProvider::default(),
        )
        .build();
        Self { resolver }
    }

    /// Wrap an already-configured resolver.
    pub fn from_resolver(resolver: TokioResolver) -> Self {
        Self { resolver }
    }
}

impl Default for HickoryResolver {
    fn default() -> Self {
        Self::new()
    }
}

fn map_error(e: ResolveError) -> DnsError {
    if e.is_nx_domain() {
        return DnsError::NxDomain;
    }
    match e.kind() {
        ResolveErrorKind::Proto(p) if matches!(p.kind(), ProtoErrorKind::Timeout) => {
            DnsError::Timeout
        }
        _ => DnsError::Failure(e.to_string()),
    }
}

/// A name that exists but has no records of the requested type is a
/// successful empty answer, not an error.
fn empty_or_fail<T>(e: ResolveError) -> Result<Vec<T>, DnsError> {
    if e.is_nx_domain() {
        return Err(DnsError::NxDomain);
    }
    if e.is_no_records_found() {
        return Ok(Vec::new());
    }
    Err(map_error(e))
}

/// Decode the concatenation of DNS character-strings from raw RDATA,
/// as used by the SPF (99) record type.
fn decode_character_strings(rdata: &[u8]) -> Option<String> {
    let mut out = String::new();
    let mut i = 0;
    while i < rdata.len() {
        let len = rdata[i] as usize;
        i += 1;
        if i + len > rdata.len() {
            return None;
        }
        out.push_str(&String::from_utf8_lossy(&rdata[i..i + len]));
        i += len;
    }
    Some(out)
}

impl DnsResolver for HickoryResolver {
    async fn query_txt(&self, name: &str) -> Result<Vec<String>, DnsError> {
        match self.resolver.txt_lookup(name).await {
            Ok(lookup) => Ok(lookup.iter().map(|txt| txt.to_string()).collect()),
            Err(e) => empty_or_fail(e),
        }
    }

    async fn query_spf(&self, name: &str) -> Result<Vec<String>, DnsError> {
        match self
            .resolver
            .lookup(name, RecordType::Unknown(SPF_RRTYPE))
            .await
        {
            Ok(lookup) => Ok(lookup
                .iter()
                .filter_map(|rdata| match rdata {
                    RData::Unknown { rdata, .. } => decode_character_strings(rdata.anything()),
                    _ => None,
                })
                .collect()),
            Err(e) => empty_or_fail(e),
        }
    }

    async fn query_a(&self, name: &str) -> Result<Vec<Ipv4Addr>, DnsError> {
        match self.resolver.ipv4_lookup(name).await {
            Ok(lookup) => Ok(lookup.iter().map(|a| a.0).collect()),
            Err(e) => empty_or_fail(e),
        }
    }

    async fn query_aaaa(&self, name: &str) -> Result<Vec<Ipv6Addr>, DnsError> {
        match self.resolver.ipv6_lookup(name).await {
            Ok(lookup) => Ok(lookup.iter().map(|a| a.0).collect()),
            Err(e) => empty_or_fail(e),
        }
    }

    async fn query_mx(&self, name: &str) -> Result<Vec<MxHost>, DnsError> {
        match self.resolver.mx_lookup(name).await {
            Ok(lookup) => Ok(lookup
                .iter()
                .map(|mx| MxHost {
                    preference: mx.preference(),
                    exchange: mx.exchange().to_string(),
                })
                .collect()),
            Err(e) => empty_or_fail(e),
        }
    }

    async fn query_ptr(&self, name: &str) -> Result<Vec<String>, DnsError> {
        match self.resolver.lookup(name, RecordType::PTR).await {
            Ok(lookup) => Ok(lookup
                .iter()
                .filter_map(|rdata| match rdata {
                    RData::PTR(ptr) => Some(ptr.0.to_string()),
                    _ => None,
                })
                .collect()),
            Err(e) => empty_or_fail(e),
        }
    }
}

// ---------------------------------------------------------------------------
// MockResolver
// ---------------------------------------------------------------------------

type Store<T> = Arc<RwLock<HashMap<String, Result<Vec<T>, DnsError>>>>;

fn store_get<T: Clone>(store: &Store<T>, name: &str) -> Result<Vec<T>, DnsError> {
    store
        .read()
        .unwrap()
        .get(&name.to_ascii_lowercase())
        .cloned()
        .unwrap_or(Err(DnsError::NxDomain))
}

fn store_put<T>(store: &Store<T>, name: &str, value: Result<Vec<T>, DnsError>) {
    store
        .write()
        .unwrap()
        .insert(name.to_ascii_lowercase(), value);
}

/// In-memory resolver for tests. Unknown names answer NXDOMAIN;
/// `fail_*` setters inject error conditions per name and RR-type.
#[derive(Clone, Default)]
pub struct MockResolver {
    txt: Store<String>,
    spf: Store<String>,
    a: Store<Ipv4Addr>,
    aaaa: Store<Ipv6Addr>,
    mx: Store<MxHost>,
    ptr: Store<String>,
}

impl MockResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_txt(&self, name: &str, texts: &[&str]) {
        store_put(&self.txt, name, Ok(texts.iter().map(|s| s.to_string()).collect()));
    }

    pub fn fail_txt(&self, name: &str, err: DnsError) {
        store_put(&self.txt, name, Err(err));
    }

    pub fn add_spf(&self, name: &str, texts: &[&str]) {
        store_put(&self.spf, name, Ok(texts.iter().map(|s| s.to_string()).collect()));
    }

    pub fn fail_spf(&self, name: &str, err: DnsError) {
        store_put(&self.spf, name, Err(err));
    }

    pub fn add_a(&self, name: &str, addrs: &[Ipv4Addr]) {
        store_put(&self.a, name, Ok(addrs.to_vec()));
    }

    pub fn fail_a(&self, name: &str, err: DnsError) {
        store_put(&self.a, name, Err(err));
    }

    pub fn add_aaaa(&self, name: &str, addrs: &[Ipv6Addr]) {
        store_put(&self.aaaa, name, Ok(addrs.to_vec()));
    }

    pub fn fail_aaaa(&self, name: &str, err: DnsError) {
        store_put(&self.aaaa, name, Err(err));
    }

    pub fn add_mx(&self, name: &str, exchanges: &[(u16, &str)]) {
        let hosts = exchanges
            .iter()
            .map(|(preference, exchange)| MxHost {
                preference: *preference,
                exchange: exchange.to_string(),
            })
            .collect();
        store_put(&self.mx, name, Ok(hosts));
    }

    pub fn fail_mx(&self, name: &str, err: DnsError) {
        store_put(&self.mx, name, Err(err));
    }

    /// Register PTR names for an address, keyed by its reverse-DNS name.
    pub fn add_ptr(&self, ip: IpAddr, names: &[&str]) {
        store_put(
            &self.ptr,
            &crate::net::reverse_name(ip),
            Ok(names.iter().map(|s| s.to_string()).collect()),
        );
    }

    pub fn fail_ptr(&self, ip: IpAddr, err: DnsError) {
        store_put(&self.ptr, &crate::net::reverse_name(ip), Err(err));
    }
}

impl DnsResolver for MockResolver {
    async fn query_txt(&self, name: &str) -> Result<Vec<String>, DnsError> {
        store_get(&self.txt, name)
    }

    async fn query_spf(&self, name: &str) -> Result<Vec<String>, DnsError> {
        store_get(&self.spf, name)
    }

    async fn query_a(&self, name: &str) -> Result<Vec<Ipv4Addr>, DnsError> {
        store_get(&self.a, name)
    }

    async fn query_aaaa(&self, name: &str) -> Result<Vec<Ipv6Addr>, DnsError> {
        store_get(&self.aaaa, name)
    }

    async fn query_mx(&self, name: &str) -> Result<Vec<MxHost>, DnsError> {
        store_get(&self.mx, name)
    }

    async fn query_ptr(&self, name: &str) -> Result<Vec<String>, DnsError> {
        store_get(&self.ptr, name)
    }
}
