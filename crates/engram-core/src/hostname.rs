//! Hostname tagging policy.
//!
//! When enabled, every store call gains a `source:<host>` tag and a
//! `hostname` metadata entry. Resolution precedence: explicit caller value,
//! then a transport-layer hint, then the process-local hostname. Disabled
//! by default; when disabled no tag is added even if the caller passed one.

use crate::error::{MemoryError, Result};
use crate::memory::{meta_keys, Metadata, MetaValue};

/// Longest hostname accepted, per RFC 1123.
const MAX_HOSTNAME_LEN: usize = 253;

/// The tagging policy, frozen at open.
#[derive(Debug, Clone, Copy, Default)]
pub struct HostnamePolicy {
    enabled: bool,
}

impl HostnamePolicy {
    pub fn new(enabled: bool) -> Self {
        Self { enabled }
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// Resolve the hostname to record, if the policy applies.
    ///
    /// `client_hostname` is the caller's explicit value; `transport_hint`
    /// is a value the transport layer passed through.
    pub fn resolve(
        &self,
        client_hostname: Option<&str>,
        transport_hint: Option<&str>,
    ) -> Result<Option<String>> {
        if !self.enabled {
            return Ok(None);
        }

        if let Some(explicit) = client_hostname.filter(|h| !h.is_empty()) {
            validate_hostname(explicit)?;
            return Ok(Some(explicit.to_string()));
        }

        if let Some(hint) = transport_hint.filter(|h| !h.is_empty()) {
            if validate_hostname(hint).is_ok() {
                return Ok(Some(hint.to_string()));
            }
            tracing::warn!(hint, "ignoring malformed transport hostname hint");
        }

        Ok(process_hostname())
    }

    /// Apply the policy to a pending store: add the `source:` tag and the
    /// `hostname` metadata entry before dedup/merge.
    pub fn apply(
        &self,
        tags: &mut Vec<String>,
        metadata: &mut Metadata,
        client_hostname: Option<&str>,
        transport_hint: Option<&str>,
    ) -> Result<()> {
        let Some(host) = self.resolve(client_hostname, transport_hint)? else {
            return Ok(());
        };
        let tag = format!("source:{host}");
        if !tags.contains(&tag) {
            tags.push(tag);
        }
        metadata.insert(meta_keys::HOSTNAME.to_string(), MetaValue::String(host));
        Ok(())
    }
}

/// RFC-1123 hostname subset: dot-separated labels of alphanumerics and
/// hyphens, no label starting or ending with a hyphen, ≤ 253 chars total.
pub fn validate_hostname(host: &str) -> Result<()> {
    if host.is_empty() || host.len() > MAX_HOSTNAME_LEN {
        return Err(MemoryError::Invalid(format!(
            "hostname must be 1..={MAX_HOSTNAME_LEN} chars"
        )));
    }
    for label in host.split('.') {
        let ok = !label.is_empty()
            && label.len() <= 63
            && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
            && !label.starts_with('-')
            && !label.ends_with('-');
        if !ok {
            return Err(MemoryError::Invalid(format!(
                "malformed hostname label '{label}'"
            )));
        }
    }
    Ok(())
}

fn process_hostname() -> Option<String> {
    match hostname::get() {
        Ok(name) => {
            let name = name.to_string_lossy().to_string();
            validate_hostname(&name).ok().map(|_| name)
        }
        Err(e) => {
            tracing::warn!("could not resolve process hostname: {e}");
            None
        }
    }
}
