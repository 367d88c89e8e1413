//! Domain name utilities shared by the evaluator and the mechanisms.

/// Canonical form of a DNS name for comparisons: ASCII-lowercased,
/// root dot removed.
pub fn normalize(name: &str) -> String {
    let mut name = name.to_ascii_lowercase();
    if name.ends_with('.') {
        name.pop();
    }
    name
}

/// Name equality up to case and the root dot.
pub fn domains_equal(a: &str, b: &str) -> bool {
    normalize(a) == normalize(b)
}

/// True when `name` sits strictly below `ancestor` in the DNS tree.
/// Equal names do not count, and the shared suffix must start at a
/// label boundary (`notexample.com` is not below `example.com`).
pub fn is_subdomain_of(name: &str, ancestor: &str) -> bool {
    let name = normalize(name);
    let ancestor = normalize(ancestor);
    name.len() > ancestor.len()
        && name.ends_with(&ancestor)
        && name.as_bytes()[name.len() - ancestor.len() - 1] == b'.'
}

/// Prepare a name for a DNS query: normalize, then drop leading labels
/// while the name exceeds the 253-byte wire limit.
pub fn normalize_lookup_name(name: &str) -> String {
    let mut name = normalize(name);
    while name.len() > 253 {
        match name.find('.') {
            Some(pos) => name = name[pos + 1..].to_string(),
            None => break,
        }
    }
    name
}

/// The domain part of a mail identity: everything after the last `@`,
/// or `None` for an identity with no `@` at all.
pub fn domain_from_identity(identity: &str) -> Option<&str> {
    identity.rsplit_once('@').map(|(_, domain)| domain)
}

/// Extract the local part of a mail identity (before the last `@`).
/// Defaults to `postmaster` when absent or empty.
pub fn local_part_from_identity(identity: &str) -> &str {
    match identity.rsplit_once('@') {
        Some((local, _)) if !local.is_empty() => local,
        _ => "postmaster",
    }
}
