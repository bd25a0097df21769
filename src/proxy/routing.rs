//! Host based backend selection

use crate::config::RoutingConfig;

use super::google::{GOOGLE_HTTPS_NAME, GOOGLE_HTTP_NAME};

/// Backend alias resolving to one of the two Google variants
pub const GOOGLE_ALIAS: &str = "Google";

#[derive(Debug, Clone, PartialEq, Eq)]
enum HostPattern {
    Any,
    /// `*.example.com`, also matching `example.com`
    Suffix(String),
    Exact(String),
}

impl HostPattern {
    fn parse(raw: &str) -> Self {
        let raw = raw.trim().to_ascii_lowercase();
        if raw == "*" {
            HostPattern::Any
        } else if let Some(domain) = raw.strip_prefix("*.") {
            HostPattern::Suffix(domain.to_string())
        } else {
            HostPattern::Exact(raw)
        }
    }

    fn matches(&self, host: &str) -> bool {
        match self {
            HostPattern::Any => true,
            HostPattern::Suffix(domain) => {
                host == domain
                    || (host.len() > domain.len()
                        && host.ends_with(domain.as_str())
                        && host.as_bytes()[host.len() - domain.len() - 1] == b'.')
            }
            HostPattern::Exact(exact) => host == exact,
        }
    }
}

/// Ordered `pattern -> backend` rules with a fallback backend
#[derive(Debug, Clone)]
pub struct Router {
    rules: Vec<(HostPattern, String)>,
    default_backend: String,
}

impl Router {
    pub fn new(config: &RoutingConfig) -> Self {
        Self {
            rules: config
                .rules
                .iter()
                .map(|(pattern, backend)| (HostPattern::parse(pattern), backend.clone()))
                .collect(),
            default_backend: config.default_backend.clone(),
        }
    }

    /// Name of the manager that should serve `host` (port ignored). The first matching rule
    /// wins.
    pub fn select(&self, host: &str, tunnel: bool) -> &str {
        let host = strip_port(host).to_ascii_lowercase();
        let backend = self
            .rules
            .iter()
            .find(|(pattern, _)| pattern.matches(&host))
            .map(|(_, backend)| backend.as_str())
            .unwrap_or(self.default_backend.as_str());

        if backend.eq_ignore_ascii_case(GOOGLE_ALIAS) {
            if tunnel {
                GOOGLE_HTTPS_NAME
            } else {
                GOOGLE_HTTP_NAME
            }
        } else {
            backend
        }
    }

    /// Every backend name the rules can resolve to, aliases expanded
    pub fn backend_names(&self) -> Vec<&str> {
        let mut names = Vec::new();
        for backend in self
            .rules
            .iter()
            .map(|(_, backend)| backend.as_str())
            .chain(std::iter::once(self.default_backend.as_str()))
        {
            if backend.eq_ignore_ascii_case(GOOGLE_ALIAS) {
                names.extend([GOOGLE_HTTP_NAME, GOOGLE_HTTPS_NAME]);
            } else {
                names.push(backend);
            }
        }
        names.sort_unstable();
        names.dedup();
        names
    }
}

fn strip_port(host: &str) -> &str {
    if let Some(rest) = host.strip_prefix('[') {
        return rest.split(']').next().unwrap_or(rest);
    }
    match host.rsplit_once(':') {
        Some((name, port)) if !name.contains(':') && port.bytes().all(|b| b.is_ascii_digit()) => {
            name
        }
        _ => host,
    }
}
