//! Narrow DNS surface used by the mail authentication crates: TXT lookups
//! for DKIM/ARC key records and DMARC policy records, plus the SPF
//! evaluation service that feeds Authentication-Results composition.

use async_trait::async_trait;
use hickory_resolver::proto::ProtoErrorKind;
use hickory_resolver::{ResolveError, TokioResolver};
use std::collections::{BTreeMap, BTreeSet};
use std::net::IpAddr;
use thiserror::Error;

#[derive(Clone, Debug, Error, PartialEq)]
pub enum DnsError {
    /// The query failed in a way that may succeed on retry.
    #[error("temporary DNS failure: {0}")]
    Temporary(String),
    /// The query can not succeed without operator intervention.
    #[error("permanent DNS failure: {0}")]
    Permanent(String),
}

impl DnsError {
    pub fn is_temporary(&self) -> bool {
        matches!(self, Self::Temporary(_))
    }
}

/// TXT resolution as needed by key and policy record fetches.
///
/// `lookup_txt` returns every TXT string found at `name`, with the
/// character-strings of each record joined together. An empty vec means
/// the name exists but holds no TXT records, or does not exist at all;
/// callers that need exactly one record take the first entry.
#[async_trait]
pub trait Lookup: Send + Sync {
    async fn lookup_txt(&self, name: &str) -> Result<Vec<String>, DnsError>;
}

#[async_trait]
impl Lookup for TokioResolver {
    async fn lookup_txt(&self, name: &str) -> Result<Vec<String>, DnsError> {
        match self.txt_lookup(name).await {
            Ok(answer) => Ok(answer
                .iter()
                .map(|txt| {
                    txt.iter()
                        .map(|data| String::from_utf8_lossy(data))
                        .collect()
                })
                .collect()),
            Err(err) => match classify_resolve_error(&err) {
                ErrorClass::NoRecords => Ok(vec![]),
                ErrorClass::Other => {
                    tracing::debug!("TXT lookup for {name} failed: {err}");
                    Err(DnsError::Temporary(format!(
                        "failed to query TXT for {name}: {err}"
                    )))
                }
            },
        }
    }
}

enum ErrorClass {
    NoRecords,
    Other,
}

fn classify_resolve_error(err: &ResolveError) -> ErrorClass {
    match err.proto().map(|err| err.kind()) {
        Some(ProtoErrorKind::NoRecordsFound { .. }) => ErrorClass::NoRecords,
        _ => ErrorClass::Other,
    }
}

/// SPF evaluation, treated as an opaque service: the returned line is the
/// text that will be embedded in the Authentication-Results header, eg
/// `pass smtp.mailfrom=sender.example`.
#[async_trait]
pub trait SpfEval: Send + Sync {
    async fn eval_spf(
        &self,
        helo: &str,
        mail_from: &str,
        client_ip: IpAddr,
    ) -> Result<String, DnsError>;
}

/// In-memory resolver for tests: answers are seeded with `with_txt`,
/// unknown names resolve to no records, and names registered through
/// `with_temp_fail` produce a temporary error.
#[derive(Debug, Default)]
pub struct TestLookup {
    txt: BTreeMap<String, Vec<String>>,
    temp_fail: BTreeSet<String>,
}

impl TestLookup {
    pub fn with_txt<S: Into<String>>(mut self, name: &str, value: S) -> Self {
        self.txt
            .entry(name.to_ascii_lowercase())
            .or_default()
            .push(value.into());
        self
    }

    pub fn with_temp_fail(mut self, name: &str) -> Self {
        self.temp_fail.insert(name.to_ascii_lowercase());
        self
    }
}

#[async_trait]
impl Lookup for TestLookup {
    async fn lookup_txt(&self, name: &str) -> Result<Vec<String>, DnsError> {
        let name = name.to_ascii_lowercase();
        if self.temp_fail.contains(&name) {
            return Err(DnsError::Temporary(format!("simulated timeout for {name}")));
        }
        Ok(self.txt.get(&name).cloned().unwrap_or_default())
    }
}

/// Fixed-answer SPF service for tests.
#[derive(Debug, Clone)]
pub struct StaticSpf {
    pub line: String,
}

impl StaticSpf {
    pub fn new<S: Into<String>>(line: S) -> Self {
        Self { line: line.into() }
    }
}

#[async_trait]
impl SpfEval for StaticSpf {
    async fn eval_spf(
        &self,
        _helo: &str,
        _mail_from: &str,
        _client_ip: IpAddr,
    ) -> Result<String, DnsError> {
        Ok(self.line.clone())
    }
}
