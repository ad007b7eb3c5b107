use std::{net::IpAddr, str::FromStr, sync::Arc};

use cidr::IpCidr;
use easy_error::{Error, ResultExt, bail};
use serde::Deserialize;
use tracing::trace;

/// Decides whether a destination must not be proxied.
pub trait Bypass: Send + Sync {
    /// `addr` is `host:port` or a bare host.
    fn contains(&self, addr: &str) -> bool;
}

pub type BypassRef = Arc<dyn Bypass>;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Matcher {
    Cidr(IpCidr),
    Ip(IpAddr),
    /// `.example.com`: the domain itself and every subdomain.
    Suffix(String),
    /// `*.example.com`: subdomains only.
    Subdomain(String),
    Exact(String),
}

impl Matcher {
    fn matches(&self, host: &Host) -> bool {
        match (self, host) {
            (Self::Cidr(c), Host::Ip(ip)) => c.contains(ip),
            (Self::Ip(a), Host::Ip(ip)) => a == ip,
            (Self::Suffix(s), Host::Domain(d)) => d == &s[1..] || d.ends_with(s.as_str()),
            (Self::Subdomain(s), Host::Domain(d)) => d.len() > s.len() && d.ends_with(s.as_str()),
            (Self::Exact(s), Host::Domain(d)) => s == d,
            _ => false,
        }
    }
}

impl FromStr for Matcher {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim().to_ascii_lowercase();
        if s.is_empty() {
            bail!("empty bypass pattern");
        }
        if let Ok(ip) = s.parse::<IpAddr>() {
            return Ok(Self::Ip(ip));
        }
        if s.contains('/') {
            let c = s
                .parse::<IpCidr>()
                .with_context(|| format!("bad cidr: {}", s))?;
            return Ok(Self::Cidr(c));
        }
        if let Some(rest) = s.strip_prefix("*.") {
            if rest.is_empty() {
                bail!("bad domain pattern: {}", s);
            }
            return Ok(Self::Subdomain(format!(".{}", rest)));
        }
        if s.starts_with('.') {
            if s.len() == 1 {
                bail!("bad domain pattern: {}", s);
            }
            return Ok(Self::Suffix(s));
        }
        Ok(Self::Exact(s))
    }
}

enum Host {
    Ip(IpAddr),
    Domain(String),
}

fn split_host(addr: &str) -> Host {
    let addr = addr.trim();
    if let Ok(sa) = addr.parse::<std::net::SocketAddr>() {
        return Host::Ip(sa.ip());
    }
    let host = addr.trim_start_matches('[').trim_end_matches(']');
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Host::Ip(ip);
    }
    let host = match addr.rsplit_once(':') {
        Some((h, p)) if p.parse::<u16>().is_ok() => h,
        _ => addr,
    };
    Host::Domain(host.trim_end_matches('.').to_ascii_lowercase())
}

/// Pattern list bypass. In reverse mode only matching destinations are
/// proxied.
#[derive(Debug, Clone)]
pub struct MatcherBypass {
    matchers: Vec<Matcher>,
    reverse: bool,
}

impl MatcherBypass {
    pub fn new<S: AsRef<str>>(patterns: &[S], reverse: bool) -> Result<Self, Error> {
        let matchers = patterns
            .iter()
            .map(|p| p.as_ref().parse())
            .collect::<Result<Vec<Matcher>, Error>>()?;
        Ok(Self { matchers, reverse })
    }
}

impl Bypass for MatcherBypass {
    fn contains(&self, addr: &str) -> bool {
        let host = split_host(addr);
        let matched = self.matchers.iter().any(|m| m.matches(&host));
        trace!("bypass {}: matched={} reverse={}", addr, matched, self.reverse);
        matched != self.reverse
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct BypassConfig {
    pub name: String,
    #[serde(default)]
    pub reverse: bool,
    #[serde(default)]
    pub matchers: Vec<String>,
}

impl BypassConfig {
    pub fn build(&self) -> Result<BypassRef, Error> {
        let b = MatcherBypass::new(&self.matchers, self.reverse)
            .with_context(|| format!("bypass {}", self.name))?;
        Ok(Arc::new(b))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bypass(patterns: &[&str], reverse: bool) -> MatcherBypass {
        MatcherBypass::new(patterns, reverse).unwrap()
    }

    #[test]
    fn domain_patterns() {
        let b = bypass(&["*.example.com", ".corp.net", "exact.org"], false);
        assert!(b.contains("www.example.com:443"));
        assert!(!b.contains("example.com:443"));
        assert!(b.contains("corp.net:80"));
        assert!(b.contains("a.b.corp.net"));
        assert!(!b.contains("notcorp.net:80"));
        assert!(b.contains("EXACT.org:1"));
        assert!(!b.contains("sub.exact.org:1"));
    }

    #[test]
    fn ip_patterns() {
        let b = bypass(&["10.0.0.0/8", "192.168.1.1", "fd00::/8"], false);
        assert!(b.contains("10.0.0.5:443"));
        assert!(b.contains("192.168.1.1:22"));
        assert!(!b.contains("192.168.1.2:22"));
        assert!(b.contains("[fd00::1]:80"));
        assert!(!b.contains("[2001:db8::1]:80"));
        assert!(!b.contains("10.example.com:80"));
    }

    #[test]
    fn reverse_mode() {
        let b = bypass(&["*.allowed.io"], true);
        assert!(!b.contains("api.allowed.io:443"));
        assert!(b.contains("other.io:443"));
    }

    #[test]
    fn empty_list_bypasses_nothing() {
        let b = bypass(&[], false);
        assert!(!b.contains("example.com:80"));
    }

    #[test]
    fn bad_patterns() {
        assert!(MatcherBypass::new(&["10.0.0.0/99"], false).is_err());
        assert!(MatcherBypass::new(&["*."], false).is_err());
        assert!(MatcherBypass::new(&[""], false).is_err());
    }
}
