//! Server identity matching against certificate subject and alternative names
//! (RFC 2818 section 3.1, and the leftmost-wildcard variant of RFC 2830).

use std::net::IpAddr;

use x509_parser::extensions::GeneralName;

use super::session::Certificate;
use super::{EndpointIdentification, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchMode {
    /// Wildcards may appear in any label, as whole label or fragment.
    Tls,
    /// Wildcards only in the leftmost label; all other labels must be equal.
    Ldap,
}

impl From<EndpointIdentification> for MatchMode {
    fn from(mode: EndpointIdentification) -> Self {
        match mode {
            EndpointIdentification::Https => MatchMode::Tls,
            EndpointIdentification::Ldaps => MatchMode::Ldap,
        }
    }
}

/// Removes the brackets around an IPv6 literal, `[::1]` becomes `::1`.
pub fn strip_ipv6_brackets(host: &str) -> &str {
    host.strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host)
}

pub fn matches_certificate(host: &str, cert: &Certificate, mode: MatchMode) -> Result<bool> {
    let host = strip_ipv6_brackets(host);
    let parsed = cert.parse()?;

    let alt_names: Vec<GeneralName<'_>> = match parsed.subject_alternative_name() {
        Ok(Some(ext)) => ext.value.general_names.clone(),
        _ => Vec::new(),
    };

    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(alt_names.iter().any(|name| match name {
            GeneralName::IPAddress(bytes) => ip_matches(&ip, bytes),
            _ => false,
        }));
    }

    let dns_names: Vec<&str> = alt_names
        .iter()
        .filter_map(|name| match name {
            GeneralName::DNSName(dns) => Some(*dns),
            _ => None,
        })
        .collect();

    if !dns_names.is_empty() {
        return Ok(dns_names.iter().any(|template| matches_name(host, template, mode)));
    }

    // No dNSName present: fall back to the most specific common name.
    let common_name = parsed
        .subject()
        .iter_common_name()
        .last()
        .and_then(|cn| cn.as_str().ok());
    Ok(common_name.map_or(false, |cn| matches_name(host, cn, mode)))
}

fn ip_matches(ip: &IpAddr, bytes: &[u8]) -> bool {
    match ip {
        IpAddr::V4(v4) => bytes == v4.octets(),
        IpAddr::V6(v6) => bytes == v6.octets(),
    }
}

pub fn matches_name(host: &str, template: &str, mode: MatchMode) -> bool {
    let host = host.trim_end_matches('.').to_ascii_lowercase();
    let template = template.trim_end_matches('.').to_ascii_lowercase();
    if host.is_empty() || template.is_empty() {
        return false;
    }
    if !template.contains('*') {
        return host == template;
    }

    let host_labels: Vec<&str> = host.split('.').collect();
    let template_labels: Vec<&str> = template.split('.').collect();
    if host_labels.len() != template_labels.len() || has_illegal_wildcard(&template_labels) {
        return false;
    }

    match mode {
        MatchMode::Tls => host_labels
            .iter()
            .zip(template_labels.iter())
            .all(|(h, t)| matches_label(h, t)),
        MatchMode::Ldap => {
            matches_label(host_labels[0], template_labels[0])
                && host_labels[1..] == template_labels[1..]
        }
    }
}

/// A wildcard in the top level label, or a template that is a bare `*`,
/// would match whole registries.
fn has_illegal_wildcard(labels: &[&str]) -> bool {
    labels.len() < 2 || labels.last().map_or(true, |tld| tld.contains('*'))
}

fn matches_label(host: &str, pattern: &str) -> bool {
    let parts: Vec<&str> = pattern.split('*').collect();
    if parts.len() == 1 {
        return host == pattern;
    }
    if host.is_empty() {
        return false;
    }

    let first = parts[0];
    let last = parts[parts.len() - 1];
    if host.len() < first.len() + last.len() || !host.starts_with(first) || !host.ends_with(last) {
        return false;
    }

    let mut rest = &host[first.len()..host.len() - last.len()];
    for part in &parts[1..parts.len() - 1] {
        match rest.find(part) {
            Some(idx) => rest = &rest[idx + part.len()..],
            None => return false,
        }
    }
    true
}
