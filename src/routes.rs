use std::fmt::Write;

use crate::service::Service;

/// One routable service: a backend descriptor plus a host rule.
#[derive(Debug, Clone, PartialEq)]
pub struct RouteEntry {
    pub id: String,
    pub backend: String,
    pub domain: String,
    pub port: u16,
    /// Bypass the cache for this host.
    pub pass: bool,
}

/// Deterministic reverse-proxy (VCL) configuration derived from registry
/// state. Entries are sorted by service id so repeated generation over the
/// same registry produces identical, diff-friendly output.
#[derive(Debug, Clone)]
pub struct RouteConfig {
    entries: Vec<RouteEntry>,
}

impl RouteConfig {
    pub fn new(mut entries: Vec<RouteEntry>) -> Self {
        entries.sort_by(|a, b| a.id.cmp(&b.id));
        Self { entries }
    }

    /// Services without a port aren't routable and are skipped.
    pub fn from_services(services: &[Service]) -> Self {
        let entries = services
            .iter()
            .filter(|service| service.port() != 0)
            .map(|service| RouteEntry {
                id: service.id().to_string(),
                backend: backend_name(service.id()),
                domain: service.domain(),
                port: service.port(),
                pass: service.disable_caching(),
            })
            .collect();
        Self::new(entries)
    }

    pub fn entries(&self) -> &[RouteEntry] {
        &self.entries
    }

    pub fn render(&self) -> String {
        let mut output = String::from("vcl 4.0;\n\n");

        for entry in &self.entries {
            let _ = write!(
                output,
                "backend {} {{\n    .host = \"127.0.0.1\";\n    .port = \"{}\";\n}}\n\n",
                entry.backend, entry.port
            );
        }

        output.push_str("sub vcl_recv {\n");
        for (index, entry) in self.entries.iter().enumerate() {
            let keyword = if index == 0 { "if" } else { "} else if" };
            let _ = write!(
                output,
                "    {keyword} (req.http.host == \"{}\") {{\n        set req.backend_hint = {};\n",
                entry.domain, entry.backend
            );
            if entry.pass {
                output.push_str("        return (pass);\n");
            }
        }
        if !self.entries.is_empty() {
            output.push_str("    }\n");
        }
        output.push_str("}\n");

        output
    }
}

/// Derives a VCL identifier from a service id: leading alphabetic prefix,
/// anything outside [A-Za-z0-9_] replaced.
pub fn backend_name(id: &str) -> String {
    let mut name = String::from("svc_");
    for c in id.chars() {
        if c.is_ascii_alphanumeric() || c == '_' {
            name.push(c);
        } else {
            name.push('_');
        }
    }
    name
}
