//! Recipient validation - syntax, disposable domains, MX liveness

mod cache;

pub use cache::{DomainCache, DomainVerdict};

use async_trait::async_trait;
use mailburst_common::types::InvalidReason;
use regex::Regex;
use std::collections::HashSet;
use std::sync::{Arc, OnceLock};
use tracing::{debug, warn};

/// Outcome of validating one recipient
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Valid,
    Invalid(InvalidReason),
}

impl Verdict {
    pub fn is_valid(&self) -> bool {
        matches!(self, Verdict::Valid)
    }
}

/// MX lookup failure, distinct from an authoritative empty answer
#[derive(Debug, thiserror::Error)]
#[error("MX lookup failed: {0}")]
pub struct LookupFailure(pub String);

/// Seam over DNS so validation is testable without the network
#[async_trait]
pub trait MxLookup: Send + Sync {
    /// `Ok(true)` when the domain publishes at least one MX record,
    /// `Ok(false)` on NXDOMAIN or an authoritative empty answer,
    /// `Err` for any other resolver failure.
    async fn has_mx(&self, domain: &str) -> Result<bool, LookupFailure>;
}

/// Production resolver backed by trust-dns
pub struct DnsMxLookup {
    resolver: trust_dns_resolver::TokioAsyncResolver,
}

impl DnsMxLookup {
    pub fn new() -> Self {
        use trust_dns_resolver::config::{ResolverConfig, ResolverOpts};
        use trust_dns_resolver::TokioAsyncResolver;

        let resolver = TokioAsyncResolver::tokio(ResolverConfig::default(), ResolverOpts::default());
        Self { resolver }
    }
}

impl Default for DnsMxLookup {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MxLookup for DnsMxLookup {
    async fn has_mx(&self, domain: &str) -> Result<bool, LookupFailure> {
        use trust_dns_resolver::error::ResolveErrorKind;

        match self.resolver.mx_lookup(domain).await {
            Ok(mx) => Ok(mx.iter().next().is_some()),
            Err(e) => match e.kind() {
                ResolveErrorKind::NoRecordsFound { .. } => Ok(false),
                _ => Err(LookupFailure(e.to_string())),
            },
        }
    }
}

/// Domains that hand out throwaway inboxes; matched case-insensitively.
const DISPOSABLE_DOMAINS: &[&str] = &["temp-mail.org", "tempmail.com", "throwawaymail.com"];

fn syntax_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}$")
            .expect("email syntax pattern is valid")
    })
}

/// Validates recipients before any network send is attempted.
///
/// Checks run in order and short-circuit on the first failure: syntax,
/// disposable-domain block list, then MX liveness through the shared
/// 24-hour cache. The validator itself never retries sends; only a failed
/// MX *lookup* is retried once before being reported as `lookup_error`.
pub struct RecipientValidator {
    disposable: HashSet<String>,
    cache: DomainCache,
    resolver: Arc<dyn MxLookup>,
}

impl RecipientValidator {
    pub fn new(cache: DomainCache, resolver: Arc<dyn MxLookup>) -> Self {
        Self {
            disposable: DISPOSABLE_DOMAINS
                .iter()
                .map(|d| d.to_string())
                .collect(),
            cache,
            resolver,
        }
    }

    /// Add domains to the disposable block list (case-insensitive).
    pub fn block_domains<I: IntoIterator<Item = String>>(mut self, domains: I) -> Self {
        self.disposable
            .extend(domains.into_iter().map(|d| d.to_ascii_lowercase()));
        self
    }

    pub async fn verify(&self, recipient: &str) -> Verdict {
        if !syntax_pattern().is_match(recipient) {
            debug!("invalid email format: {}", recipient);
            return Verdict::Invalid(InvalidReason::BadFormat);
        }

        // Syntax check guarantees a local part and a domain
        let domain = match recipient.rsplit_once('@') {
            Some((_, domain)) => domain.to_ascii_lowercase(),
            None => return Verdict::Invalid(InvalidReason::BadFormat),
        };

        if self.disposable.contains(&domain) {
            warn!("disposable email domain detected: {}", domain);
            return Verdict::Invalid(InvalidReason::DisposableDomain);
        }

        if let Some(verdict) = self.cache.get(&domain).await {
            return match verdict {
                DomainVerdict::HasMx => Verdict::Valid,
                DomainVerdict::NoMx => Verdict::Invalid(InvalidReason::NoMxRecord),
            };
        }

        match self.lookup_with_retry(&domain).await {
            Ok(true) => {
                self.cache.insert(&domain, DomainVerdict::HasMx).await;
                debug!("MX records found for domain {}", domain);
                Verdict::Valid
            }
            Ok(false) => {
                self.cache.insert(&domain, DomainVerdict::NoMx).await;
                debug!("no MX records for domain {}", domain);
                Verdict::Invalid(InvalidReason::NoMxRecord)
            }
            Err(e) => {
                // Logged distinctly so callers can tell transient resolver
                // trouble apart from genuinely bad addresses. Not cached.
                warn!("MX lookup error for domain {}: {}", domain, e);
                Verdict::Invalid(InvalidReason::LookupError)
            }
        }
    }

    /// One retry on resolver failure; an authoritative answer is final.
    async fn lookup_with_retry(&self, domain: &str) -> Result<bool, LookupFailure> {
        match self.resolver.has_mx(domain).await {
            Ok(answer) => Ok(answer),
            Err(first) => {
                debug!("retrying MX lookup for {} after: {}", domain, first);
                self.resolver.has_mx(domain).await
            }
        }
    }
}
