//! DMARC policy discovery and alignment evaluation (RFC 7489), using the
//! Public Suffix List to compute organisational domains for relaxed
//! alignment.

pub mod psl;
mod types;


use mailhop_dns::{DnsError, Lookup};
use mailparse::MailAddr;
use std::str::FromStr;
use thiserror::Error;

pub use crate::psl::PslIndex;
pub use crate::types::mode::Mode;
pub use crate::types::policy::Policy;
pub use crate::types::record::Record;
pub use crate::types::results::{DmarcOutcome, DmarcResult};

#[derive(Debug, Error)]
pub enum DmarcError {
    /// The From header did not yield exactly one mailbox
    #[error("unusable From header: {0}")]
    FromHeader(String),
    #[error("invalid DMARC record: {0}")]
    Record(String),
    #[error(transparent)]
    Dns(#[from] DnsError),
}

/// The per-message authentication inputs to alignment evaluation.
pub struct DmarcParams<'a> {
    /// Raw value of the message's From header
    pub from_header: &'a str,
    /// SPF result line; the leading token is the SPF result
    pub spf_line: &'a str,
    /// Domain whose authorization SPF checked (MAIL FROM, or HELO)
    pub spf_domain: &'a str,
    /// DKIM verification result ("pass", "fail", ...)
    pub dkim_result: &'a str,
    /// Signing domain (`d=`) of the DKIM signature that was evaluated
    pub dkim_domain: &'a str,
}

/// Evaluate DMARC for a message.
///
/// Looks up the policy record for the From domain and tests SPF and DKIM
/// identifier alignment against it. The overall result is `pass` when
/// either mechanism both passed and aligned.
pub async fn evaluate(
    params: &DmarcParams<'_>,
    psl: &PslIndex,
    resolver: &dyn Lookup,
) -> Result<DmarcOutcome, DmarcError> {
    let from_domain = extract_from_domain(params.from_header)?;

    let name = format!("_dmarc.{from_domain}");
    let answers = resolver.lookup_txt(&name).await?;

    // TXT records can contain all sorts of stuff; take the first answer
    // that announces itself as a DMARC record
    let record = match answers
        .iter()
        .find(|txt| txt.trim_start().starts_with("v=DMARC1"))
    {
        Some(txt) => Record::from_str(txt).map_err(DmarcError::Record)?,
        None => {
            return Ok(DmarcOutcome {
                result: DmarcResult::None,
                policy: None,
                from_domain,
            });
        }
    };

    let spf_aligned = aligned(
        record.align_spf,
        params.spf_line,
        params.spf_domain,
        &from_domain,
        psl,
    );
    let dkim_aligned = aligned(
        record.align_dkim,
        params.dkim_result,
        params.dkim_domain,
        &from_domain,
        psl,
    );

    let result = if spf_aligned || dkim_aligned {
        DmarcResult::Pass
    } else {
        DmarcResult::Fail
    };
    tracing::debug!(
        "dmarc {result} for {from_domain}: spf_aligned={spf_aligned} dkim_aligned={dkim_aligned}"
    );

    Ok(DmarcOutcome {
        result,
        policy: Some(record.policy),
        from_domain,
    })
}

/// An identifier is aligned when its mechanism produced `pass` and its
/// domain matches the From domain under the record's alignment mode:
/// organisational domains for relaxed, whole domains for strict.
fn aligned(mode: Mode, result_line: &str, received: &str, expected: &str, psl: &PslIndex) -> bool {
    let result = result_line.split_whitespace().next().unwrap_or("");
    if !result.eq_ignore_ascii_case("pass") {
        return false;
    }
    if received.is_empty() || expected.is_empty() {
        return false;
    }

    match mode {
        Mode::Relaxed => psl
            .org_domain(received)
            .eq_ignore_ascii_case(&psl.org_domain(expected)),
        Mode::Strict => received.eq_ignore_ascii_case(expected),
    }
}

/// Pull the single author domain out of a raw From header value.
/// Multi-mailbox and empty From headers are unusable for DMARC.
fn extract_from_domain(from_header: &str) -> Result<String, DmarcError> {
    let parsed = mailparse::addrparse(from_header)
        .map_err(|err| DmarcError::FromHeader(format!("{err}")))?;

    let mut addresses = vec![];
    for addr in parsed.iter() {
        match addr {
            MailAddr::Single(single) => addresses.push(single.addr.clone()),
            MailAddr::Group(group) => {
                addresses.extend(group.addrs.iter().map(|single| single.addr.clone()))
            }
        }
    }

    let addr = match addresses.as_slice() {
        [addr] => addr,
        [] => return Err(DmarcError::FromHeader("no mailbox present".to_string())),
        _ => {
            return Err(DmarcError::FromHeader(format!(
                "expected exactly one mailbox, found {}",
                addresses.len()
            )));
        }
    };

    match addr.rsplit_once('@') {
        Some((_, domain)) if !domain.is_empty() => Ok(domain.to_string()),
        _ => Err(DmarcError::FromHeader(format!(
            "mailbox {addr:?} has no domain"
        ))),
    }
}
