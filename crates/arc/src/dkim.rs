use crate::canonicalization;
use crate::errors::{AuthError, Status};
use crate::hash;
use crate::header::{clear_b_tag, DkimSignature, TaggedHeader, DKIM_SIGNATURE_HEADER_NAME};
use crate::parsed_email::ParsedEmail;
use crate::public_key::retrieve_public_key;
use crate::{decode_signature, verify_signature};
use mailhop_dns::Lookup;

/// Outcome of verifying one DKIM-Signature header, carrying the
/// properties reported in Authentication-Results.
#[derive(Debug, Clone)]
pub struct DkimVerifyResult {
    /// "pass", "permerror" or "temperror"
    pub result: String,
    pub reason: Option<String>,
    /// The signing domain (`d=`)
    pub domain: Option<String>,
    /// The selector (`s=`)
    pub selector: Option<String>,
    /// The agent or user identifier (`i=`), `@{d}` when the signature
    /// does not carry one
    pub auid: Option<String>,
    /// The first eight characters of the `b=` value
    /// <https://datatracker.ietf.org/doc/html/rfc6008>
    pub signature_prefix: Option<String>,
}

impl DkimVerifyResult {
    pub fn passed(&self) -> bool {
        self.result == "pass"
    }
}

/// Verify a signature header that follows the DKIM signing data rules:
/// the selected `h=` headers, then the signature header itself with an
/// empty `b=` value and no trailing CRLF. Used for DKIM-Signature and
/// ARC-Message-Signature alike; the two differ only in their default
/// canonicalization and in the validation their parse methods apply.
pub(crate) async fn verify_signature_header(
    resolver: &dyn Lookup,
    header_name: &str,
    signature: &TaggedHeader,
    default_canon: canonicalization::Type,
    email: &ParsedEmail<'_>,
) -> Result<(), AuthError> {
    let public_key = retrieve_public_key(
        resolver,
        signature.get_required_tag("d"),
        signature.get_required_tag("s"),
    )
    .await?;

    let (header_canon, body_canon) =
        hash::parse_canonicalization(signature.get_tag("c"), default_canon)?;
    let hash_algo = hash::parse_hash_algo(signature.get_required_tag("a"))?;

    let computed_body_hash = hash::compute_body_hash(
        body_canon,
        signature.get_tag("l"),
        hash_algo,
        email.get_body_bytes(),
    )?;
    if signature.get_required_tag("bh") != computed_body_hash {
        return Err(AuthError::BodyHashDidNotVerify);
    }
    tracing::debug!("body hash verified: {computed_body_hash}");

    let signed_headers = signature.signed_header_names()?.join(":");
    let unsigned_value = clear_b_tag(signature.raw());
    let header_pairs = email.header_pairs();
    let digest = hash::compute_headers_hash(
        header_canon,
        &signed_headers,
        hash_algo,
        header_name,
        &unsigned_value,
        &header_pairs,
    )?;

    let sig_bytes = decode_signature(signature.get_required_tag("b"))?;
    if !verify_signature(&public_key, &digest, &sig_bytes) {
        return Err(AuthError::SignatureDidNotVerify);
    }

    Ok(())
}

/// Run DKIM verification over every DKIM-Signature header of the
/// message, yielding one result per signature.
pub async fn verify_dkim(
    email: &ParsedEmail<'_>,
    resolver: &dyn Lookup,
) -> Result<Vec<DkimVerifyResult>, AuthError> {
    let mut results = vec![];

    for header in email.headers_named(DKIM_SIGNATURE_HEADER_NAME) {
        if results.len() >= 10 {
            // Limit DoS impact if a malicious message is filled
            // with signatures
            break;
        }

        let value = String::from_utf8_lossy(header.get_value_raw());
        let parsed = match DkimSignature::parse(&value) {
            Ok(parsed) => parsed,
            Err(err) => {
                results.push(DkimVerifyResult {
                    result: "permerror".to_string(),
                    reason: Some(format!("{err}")),
                    domain: None,
                    selector: None,
                    auid: None,
                    signature_prefix: None,
                });
                continue;
            }
        };

        let domain = parsed.get_required_tag("d").to_string();
        let auid = match parsed.get_tag("i") {
            Some(auid) => auid.to_string(),
            None => format!("@{domain}"),
        };
        let b_tag = parsed.get_required_tag("b");
        let signature_prefix = b_tag.chars().take(8).collect::<String>();

        let mut reason = None;
        let result = match verify_signature_header(
            resolver,
            DKIM_SIGNATURE_HEADER_NAME,
            &parsed,
            canonicalization::Type::Simple,
            email,
        )
        .await
        {
            Ok(()) => "pass",
            Err(err) => {
                reason.replace(format!("{err}"));
                match err.status() {
                    Status::Tempfail => "temperror",
                    Status::Permfail => "permerror",
                }
            }
        };

        results.push(DkimVerifyResult {
            result: result.to_string(),
            reason,
            domain: Some(domain),
            selector: Some(parsed.get_required_tag("s").to_string()),
            auid: Some(auid),
            signature_prefix: Some(signature_prefix),
        });
    }

    Ok(results)
}
