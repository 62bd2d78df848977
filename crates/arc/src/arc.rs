use crate::canonicalization;
use crate::dkim::verify_signature_header;
use crate::errors::{AuthError, Status};
use crate::hash;
use crate::header::{clear_b_tag, ArcMessageSignature, ArcSeal};
use crate::parsed_email::ParsedEmail;
use crate::public_key::retrieve_public_key;
use crate::{decode_signature, verify_signature};
use mailhop_dns::Lookup;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

pub const MAX_ARC_INSTANCE: u8 = 50;
pub const ARC_MESSAGE_SIGNATURE_HEADER_NAME: &str = "ARC-Message-Signature";
pub const ARC_SEAL_HEADER_NAME: &str = "ARC-Seal";
pub const ARC_AUTHENTICATION_RESULTS_HEADER_NAME: &str = "ARC-Authentication-Results";

/// Chain validity, as recorded in the `cv=` tag of the next Seal.
/// <https://datatracker.ietf.org/doc/html/rfc8617#section-4.1.3>
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainValidity {
    /// There is no prior chain
    None,
    Pass,
    Fail,
}

impl ChainValidity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Pass => "pass",
            Self::Fail => "fail",
        }
    }
}

impl fmt::Display for ChainValidity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ChainValidity {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Ok(match value {
            "none" => Self::None,
            "pass" => Self::Pass,
            "fail" => Self::Fail,
            _ => return Err(format!("invalid cv value {value:?}")),
        })
    }
}

/// An ARC-Authentication-Results header: the instance tag followed by
/// the Authentication-Results payload recorded by that hop.
/// <https://datatracker.ietf.org/doc/html/rfc8617#section-4.1.1>
#[derive(Debug, Clone)]
pub struct ArcAuthenticationResults {
    pub instance: u8,
    raw: String,
}

impl ArcAuthenticationResults {
    pub fn parse(value: &str) -> Result<Self, AuthError> {
        let rest = value.trim_start();
        let rest = rest
            .strip_prefix('i')
            .ok_or(AuthError::MissingRequiredTag("i"))?
            .trim_start();
        let rest = rest
            .strip_prefix('=')
            .ok_or(AuthError::MissingRequiredTag("i"))?
            .trim_start();

        let digits: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
        let instance = digits
            .parse::<u8>()
            .map_err(|_| AuthError::InvalidInstance)?;
        if instance == 0 || instance > MAX_ARC_INSTANCE {
            return Err(AuthError::InvalidInstance);
        }

        if !rest[digits.len()..].trim_start().starts_with(';') {
            return Err(AuthError::TagSyntax(
                "expected ';' after the instance tag".to_string(),
            ));
        }

        Ok(Self {
            instance,
            raw: value.to_owned(),
        })
    }

    /// The header value as seen on the wire, instance tag included.
    pub fn raw(&self) -> &str {
        &self.raw
    }
}

/// The three headers one hop contributed to the chain.
#[derive(Debug)]
pub struct ArcSet {
    pub aar: ArcAuthenticationResults,
    pub sig: ArcMessageSignature,
    pub seal: ArcSeal,
}

impl ArcSet {
    pub fn instance(&self) -> u8 {
        self.aar.instance
    }
}

/// Validate the ARC chain carried by a message.
///
/// Returns the chain validity that the next hop records in its Seal:
/// `none` when the message carries no ARC sets, `pass` when the chain
/// is structurally sound and the most recent hop's AMS and Seal verify,
/// and `fail` otherwise. Only DNS trouble surfaces as an error; every
/// protocol or cryptographic defect is expressed through the returned
/// validity.
pub async fn validate_chain(
    email: &ParsedEmail<'_>,
    resolver: &dyn Lookup,
) -> Result<ChainValidity, AuthError> {
    let sets = match collect_sets(email) {
        Ok(sets) => sets,
        Err(err) => {
            tracing::debug!("ARC chain is malformed: {err}");
            return Ok(ChainValidity::Fail);
        }
    };

    if sets.is_empty() {
        return Ok(ChainValidity::None);
    }

    let chain_length = *sets.keys().next_back().expect("sets is non-empty");

    // Every Seal must record the validity the chain had when it was
    // added: none at the first hop, pass at every later one
    for set in sets.values() {
        let expected = if set.instance() == 1 {
            ChainValidity::None
        } else {
            ChainValidity::Pass
        };
        match set.seal.parse_tag::<ChainValidity>("cv") {
            Ok(Some(cv)) if cv == expected => {}
            _ => {
                tracing::debug!("bad cv tag at instance {}", set.instance());
                return Ok(ChainValidity::Fail);
            }
        }
    }

    // Cryptographic checks only apply to the most recent hop; older
    // message signatures are expected to be broken by later mediation
    let newest = &sets[&chain_length];
    if let Err(err) = verify_signature_header(
        resolver,
        ARC_MESSAGE_SIGNATURE_HEADER_NAME,
        &newest.sig,
        canonicalization::Type::Relaxed,
        email,
    )
    .await
    {
        if err.status() == Status::Tempfail {
            return Err(err);
        }
        tracing::debug!("AMS at instance {chain_length} did not verify: {err}");
        return Ok(ChainValidity::Fail);
    }

    if let Err(err) = verify_seal(resolver, &sets, chain_length).await {
        if err.status() == Status::Tempfail {
            return Err(err);
        }
        tracing::debug!("Seal at instance {chain_length} did not verify: {err}");
        return Ok(ChainValidity::Fail);
    }

    Ok(ChainValidity::Pass)
}

/// Group the ARC headers into per-instance sets, insisting that the
/// instances present are exactly 1..=L with one of each header apiece.
pub(crate) fn collect_sets(
    email: &ParsedEmail<'_>,
) -> Result<BTreeMap<u8, ArcSet>, AuthError> {
    let mut seals: BTreeMap<u8, Vec<ArcSeal>> = BTreeMap::new();
    let mut sigs: BTreeMap<u8, Vec<ArcMessageSignature>> = BTreeMap::new();
    let mut aars: BTreeMap<u8, Vec<ArcAuthenticationResults>> = BTreeMap::new();

    for hdr in email.headers_named(ARC_SEAL_HEADER_NAME) {
        let seal = ArcSeal::parse(&String::from_utf8_lossy(hdr.get_value_raw()))?;
        let instance = seal.arc_instance()?;
        seals.entry(instance).or_default().push(seal);
    }

    for hdr in email.headers_named(ARC_MESSAGE_SIGNATURE_HEADER_NAME) {
        let sig = ArcMessageSignature::parse(&String::from_utf8_lossy(hdr.get_value_raw()))?;
        let instance = sig.arc_instance()?;
        sigs.entry(instance).or_default().push(sig);
    }

    for hdr in email.headers_named(ARC_AUTHENTICATION_RESULTS_HEADER_NAME) {
        let aar = ArcAuthenticationResults::parse(&String::from_utf8_lossy(hdr.get_value_raw()))?;
        aars.entry(aar.instance).or_default().push(aar);
    }

    let max = seals
        .keys()
        .chain(sigs.keys())
        .chain(aars.keys())
        .max()
        .copied()
        .unwrap_or(0);

    let mut sets = BTreeMap::new();
    for instance in 1..=max {
        match (
            seals.remove(&instance),
            sigs.remove(&instance),
            aars.remove(&instance),
        ) {
            (Some(mut seal), Some(mut sig), Some(mut aar)) => {
                if seal.len() > 1 || sig.len() > 1 || aar.len() > 1 {
                    return Err(AuthError::DuplicateInstance(instance));
                }
                sets.insert(
                    instance,
                    ArcSet {
                        seal: seal.pop().expect("checked length"),
                        sig: sig.pop().expect("checked length"),
                        aar: aar.pop().expect("checked length"),
                    },
                );
            }
            _ => {
                // A gap, or one or more members missing at this instance
                return Err(AuthError::MissingInstance(instance));
            }
        }
    }

    Ok(sets)
}

async fn verify_seal(
    resolver: &dyn Lookup,
    sets: &BTreeMap<u8, ArcSet>,
    target: u8,
) -> Result<(), AuthError> {
    let seal = &sets[&target].seal;

    let public_key = retrieve_public_key(
        resolver,
        seal.get_required_tag("d"),
        seal.get_required_tag("s"),
    )
    .await?;
    hash::parse_hash_algo(seal.get_required_tag("a"))?;

    let data = seal_signing_data(sets, target);
    let digest = Sha256::digest(&data).to_vec();

    let sig_bytes = decode_signature(seal.get_required_tag("b"))?;
    if !verify_signature(&public_key, &digest, &sig_bytes) {
        return Err(AuthError::SignatureDidNotVerify);
    }

    Ok(())
}

/// The text covered by the Seal at `target`: every hop's AAR, AMS and
/// Seal in ascending instance order, with the target Seal itself
/// appearing last, `b=` cleared and the final CRLF dropped.
pub(crate) fn seal_signing_data(sets: &BTreeMap<u8, ArcSet>, target: u8) -> Vec<u8> {
    let mut data = seal_data_prior_hops(sets, target.saturating_sub(1));

    let set = &sets[&target];
    push_seal_entry(
        &mut data,
        ARC_AUTHENTICATION_RESULTS_HEADER_NAME,
        set.aar.raw().as_bytes(),
    );
    push_seal_entry(
        &mut data,
        ARC_MESSAGE_SIGNATURE_HEADER_NAME,
        set.sig.raw().as_bytes(),
    );
    push_seal_entry(
        &mut data,
        ARC_SEAL_HEADER_NAME,
        clear_b_tag(set.seal.raw()).as_bytes(),
    );
    trim_final_crlf(&mut data);

    data
}

/// Seal-data entries for complete hops 1..=upto, each CRLF-terminated.
pub(crate) fn seal_data_prior_hops(sets: &BTreeMap<u8, ArcSet>, upto: u8) -> Vec<u8> {
    let mut data = vec![];
    if upto == 0 {
        return data;
    }
    for set in sets.range(1..=upto).map(|(_, set)| set) {
        push_seal_entry(
            &mut data,
            ARC_AUTHENTICATION_RESULTS_HEADER_NAME,
            set.aar.raw().as_bytes(),
        );
        push_seal_entry(
            &mut data,
            ARC_MESSAGE_SIGNATURE_HEADER_NAME,
            set.sig.raw().as_bytes(),
        );
        push_seal_entry(&mut data, ARC_SEAL_HEADER_NAME, set.seal.raw().as_bytes());
    }
    data
}

/// One seal-data entry: the lowercased header name, a colon, and the
/// header value passed through the relaxed *body* canonicalization.
/// Sealing and verification must build these entries identically.
pub(crate) fn push_seal_entry(out: &mut Vec<u8>, name: &str, value: &[u8]) {
    out.extend_from_slice(name.to_ascii_lowercase().as_bytes());
    out.push(b':');
    canonicalization::body_relaxed(value, out);
}

pub(crate) fn trim_final_crlf(data: &mut Vec<u8>) {
    if data.ends_with(b"\r\n") {
        data.truncate(data.len() - 2);
    }
}
