use crate::arc::{
    self, ArcAuthenticationResults, ChainValidity, ARC_AUTHENTICATION_RESULTS_HEADER_NAME,
    ARC_MESSAGE_SIGNATURE_HEADER_NAME, ARC_SEAL_HEADER_NAME, MAX_ARC_INSTANCE,
};
use crate::canonicalization;
use crate::dkim::verify_dkim;
use crate::errors::AuthError;
use crate::hash::{self, HashAlgo};
use crate::header::{ArcMessageSignature, ArcSeal, TaggedHeader};
use crate::parsed_email::ParsedEmail;
use crate::PrivateKey;
use base64::engine::general_purpose;
use base64::Engine;
use mailhop_dmarc::{DmarcParams, PslIndex};
use mailhop_dns::{Lookup, SpfEval};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::net::IpAddr;

/// What the SMTP session told us about the peer, as needed for SPF and
/// Authentication-Results composition.
pub struct SessionParams {
    pub helo: String,
    pub mail_from: String,
    pub client_ip: IpAddr,
}

/// The header values produced by sealing one hop. Values carry no
/// header name prefix.
#[derive(Debug)]
pub struct SealedHeaders {
    pub authentication_results: String,
    pub arc_authentication_results: String,
    pub arc_message_signature: String,
    pub arc_seal: String,
}

impl SealedHeaders {
    pub fn as_map(&self) -> BTreeMap<&'static str, &str> {
        BTreeMap::from([
            (
                "Authentication-Results",
                self.authentication_results.as_str(),
            ),
            (
                ARC_AUTHENTICATION_RESULTS_HEADER_NAME,
                self.arc_authentication_results.as_str(),
            ),
            (
                ARC_MESSAGE_SIGNATURE_HEADER_NAME,
                self.arc_message_signature.as_str(),
            ),
            (ARC_SEAL_HEADER_NAME, self.arc_seal.as_str()),
        ])
    }

    /// The four headers as a block ready to prepend to the message,
    /// newest hop outermost.
    pub fn header_block(&self) -> String {
        format!(
            "{ARC_SEAL_HEADER_NAME}: {}\r\n\
             {ARC_MESSAGE_SIGNATURE_HEADER_NAME}: {}\r\n\
             {ARC_AUTHENTICATION_RESULTS_HEADER_NAME}: {}\r\n\
             Authentication-Results: {}\r\n",
            self.arc_seal,
            self.arc_message_signature,
            self.arc_authentication_results,
            self.authentication_results
        )
    }
}

/// Builder for the ArcSealer
pub struct ArcSealerBuilder {
    private_key: Option<PrivateKey>,
    selector: Option<String>,
    signing_domain: Option<String>,
    authserv_id: Option<String>,
    time: Option<chrono::DateTime<chrono::offset::Utc>>,
    ams_template: Option<String>,
    seal_template: Option<String>,
}

impl ArcSealerBuilder {
    pub fn new() -> Self {
        Self {
            private_key: None,
            selector: None,
            signing_domain: None,
            authserv_id: None,
            time: None,
            ams_template: None,
            seal_template: None,
        }
    }

    pub fn with_private_key(mut self, key: PrivateKey) -> Self {
        self.private_key = Some(key);
        self
    }

    pub fn with_selector(mut self, value: impl Into<String>) -> Self {
        self.selector = Some(value.into());
        self
    }

    pub fn with_signing_domain(mut self, value: impl Into<String>) -> Self {
        self.signing_domain = Some(value.into());
        self
    }

    /// The authserv-id that leads the Authentication-Results value,
    /// usually the host name of this system
    pub fn with_authserv_id(mut self, value: impl Into<String>) -> Self {
        self.authserv_id = Some(value.into());
        self
    }

    /// Specify the current time. Mostly used for testing
    pub fn with_time(mut self, value: chrono::DateTime<chrono::offset::Utc>) -> Self {
        self.time = Some(value);
        self
    }

    /// Replace the stock ARC-Message-Signature template. The template
    /// fixes the emitted tag order; `i=`, `t=`, `bh=` and `b=` are
    /// filled at sealing time.
    pub fn with_ams_template(mut self, value: impl Into<String>) -> Self {
        self.ams_template = Some(value.into());
        self
    }

    /// Replace the stock ARC-Seal template; `i=`, `cv=`, `t=` and `b=`
    /// are filled at sealing time.
    pub fn with_seal_template(mut self, value: impl Into<String>) -> Self {
        self.seal_template = Some(value.into());
        self
    }

    pub fn build(self) -> Result<ArcSealer, AuthError> {
        use AuthError::BuilderError;

        let private_key = self
            .private_key
            .ok_or(BuilderError("missing required private key"))?;
        let selector = self
            .selector
            .ok_or(BuilderError("missing required selector"))?;
        let signing_domain = self
            .signing_domain
            .ok_or(BuilderError("missing required signing domain"))?;
        let authserv_id = self
            .authserv_id
            .ok_or(BuilderError("missing required authserv id"))?;

        let ams_template = self.ams_template.unwrap_or_else(|| {
            format!(
                "i=; a=rsa-sha256; c=relaxed/relaxed; d={signing_domain}; s={selector}; t=; h=Subject:From:To; bh=; b="
            )
        });
        let seal_template = self.seal_template.unwrap_or_else(|| {
            format!("i=; cv=; a=rsa-sha256; d={signing_domain}; s={selector}; t=; b=")
        });

        // Catch template typos up front rather than at sealing time
        let ams_check = TaggedHeader::parse(&ams_template)?;
        for tag in ["i", "a", "d", "s", "t", "h", "bh", "b"] {
            if ams_check.get_tag(tag).is_none() {
                return Err(BuilderError("AMS template is missing a required tag"));
            }
        }
        let seal_check = TaggedHeader::parse(&seal_template)?;
        for tag in ["i", "cv", "a", "d", "s", "t", "b"] {
            if seal_check.get_tag(tag).is_none() {
                return Err(BuilderError("seal template is missing a required tag"));
            }
        }

        Ok(ArcSealer {
            private_key,
            authserv_id,
            time: self.time,
            ams_template,
            seal_template,
        })
    }
}

impl Default for ArcSealerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Seals outgoing messages: validates the chain as received, composes
/// the Authentication-Results for this hop, and produces the hop's
/// three ARC headers. Use the [ArcSealerBuilder] to build an instance.
pub struct ArcSealer {
    private_key: PrivateKey,
    authserv_id: String,
    time: Option<chrono::DateTime<chrono::offset::Utc>>,
    ams_template: String,
    seal_template: String,
}

impl ArcSealer {
    /// Seal one outgoing message.
    ///
    /// The steps run in a fixed order: chain validation over the
    /// message as received, Authentication-Results composition (SPF,
    /// DKIM, DMARC), AMS generation over the message with the new AAR
    /// attached, and finally the Seal over this hop's three headers
    /// (plus every prior hop when the chain verified).
    pub async fn seal(
        &self,
        email: &ParsedEmail<'_>,
        session: &SessionParams,
        resolver: &dyn Lookup,
        spf: &dyn SpfEval,
        psl: &PslIndex,
    ) -> Result<SealedHeaders, AuthError> {
        let cv = arc::validate_chain(email, resolver).await?;

        let instance = match cv {
            ChainValidity::None => 1,
            _ => {
                let highest = highest_instance(email);
                if highest >= MAX_ARC_INSTANCE {
                    return Err(AuthError::ChainLimitExceeded);
                }
                highest + 1
            }
        };

        let authentication_results =
            compose_results(email, session, resolver, spf, psl, &self.authserv_id).await?;
        let aar_value = format!("i={instance}; {}", authentication_results.trim());

        // The AAR participates in AMS signing as the newest header of
        // the message
        let mut signing_headers: Vec<(String, &[u8])> = vec![(
            ARC_AUTHENTICATION_RESULTS_HEADER_NAME.to_string(),
            aar_value.as_bytes(),
        )];
        signing_headers.extend(email.header_pairs());

        let timestamp = self
            .time
            .unwrap_or_else(chrono::offset::Utc::now)
            .timestamp()
            .to_string();

        let ams_value = self.generate_ams(email, &signing_headers, instance, &timestamp)?;
        let seal_value =
            self.generate_seal(email, cv, instance, &timestamp, &aar_value, &ams_value)?;

        Ok(SealedHeaders {
            authentication_results,
            arc_authentication_results: aar_value,
            arc_message_signature: ams_value,
            arc_seal: seal_value,
        })
    }

    fn generate_ams(
        &self,
        email: &ParsedEmail<'_>,
        signing_headers: &[(String, &[u8])],
        instance: u8,
        timestamp: &str,
    ) -> Result<String, AuthError> {
        let mut ams = ArcMessageSignature::from_template(&self.ams_template)?;
        ams.set_tag("i", instance.to_string());
        ams.set_tag("t", timestamp);

        let (header_canon, body_canon) =
            hash::parse_canonicalization(ams.get_tag("c"), canonicalization::Type::Relaxed)?;

        let body_hash = hash::compute_body_hash(
            body_canon,
            None,
            HashAlgo::RsaSha256,
            email.get_body_bytes(),
        )?;
        ams.set_tag("bh", body_hash);

        let signed_headers = ams.signed_header_names()?.join(":");
        let digest = hash::compute_headers_hash(
            header_canon,
            &signed_headers,
            HashAlgo::RsaSha256,
            ARC_MESSAGE_SIGNATURE_HEADER_NAME,
            &ams.to_unsigned_string(),
            signing_headers,
        )?;

        let signature = self.private_key.sign_digest(&digest)?;
        ams.set_tag("b", general_purpose::STANDARD.encode(signature));

        Ok(ams.to_signature_string())
    }

    fn generate_seal(
        &self,
        email: &ParsedEmail<'_>,
        cv: ChainValidity,
        instance: u8,
        timestamp: &str,
        aar_value: &str,
        ams_value: &str,
    ) -> Result<String, AuthError> {
        let mut seal = ArcSeal::from_template(&self.seal_template)?;
        seal.set_tag("i", instance.to_string());
        seal.set_tag("cv", cv.as_str());
        seal.set_tag("t", timestamp);

        // A verified chain is covered in full; a broken or absent one
        // is not walkable, so the seal covers this hop's set alone
        let mut data = match cv {
            ChainValidity::Pass => {
                let sets = arc::collect_sets(email)?;
                arc::seal_data_prior_hops(&sets, instance - 1)
            }
            _ => Vec::new(),
        };

        arc::push_seal_entry(
            &mut data,
            ARC_AUTHENTICATION_RESULTS_HEADER_NAME,
            aar_value.as_bytes(),
        );
        arc::push_seal_entry(
            &mut data,
            ARC_MESSAGE_SIGNATURE_HEADER_NAME,
            ams_value.as_bytes(),
        );
        arc::push_seal_entry(
            &mut data,
            ARC_SEAL_HEADER_NAME,
            seal.to_unsigned_string().as_bytes(),
        );
        arc::trim_final_crlf(&mut data);

        let digest = Sha256::digest(&data).to_vec();
        let signature = self.private_key.sign_digest(&digest)?;
        seal.set_tag("b", general_purpose::STANDARD.encode(signature));

        Ok(seal.to_signature_string())
    }
}

/// The highest instance number claimed by any ARC header of the
/// message. Unparseable headers contribute nothing; the chain they are
/// part of has already failed validation.
fn highest_instance(email: &ParsedEmail<'_>) -> u8 {
    let mut highest = 0;

    for hdr in email
        .headers_named(ARC_SEAL_HEADER_NAME)
        .chain(email.headers_named(ARC_MESSAGE_SIGNATURE_HEADER_NAME))
    {
        if let Ok(tagged) = TaggedHeader::parse(&String::from_utf8_lossy(hdr.get_value_raw())) {
            if let Some(instance) = tagged.get_tag("i").and_then(|v| v.parse::<u8>().ok()) {
                highest = highest.max(instance);
            }
        }
    }

    for hdr in email.headers_named(ARC_AUTHENTICATION_RESULTS_HEADER_NAME) {
        if let Ok(aar) =
            ArcAuthenticationResults::parse(&String::from_utf8_lossy(hdr.get_value_raw()))
        {
            highest = highest.max(aar.instance);
        }
    }

    highest
}

/// Compose the Authentication-Results value for this hop:
/// `{authserv_id}; spf=...; dkim=...; dmarc=...`.
pub(crate) async fn compose_results(
    email: &ParsedEmail<'_>,
    session: &SessionParams,
    resolver: &dyn Lookup,
    spf: &dyn SpfEval,
    psl: &PslIndex,
    authserv_id: &str,
) -> Result<String, AuthError> {
    let spf_line = spf
        .eval_spf(&session.helo, &session.mail_from, session.client_ip)
        .await?;
    // Semicolons would terminate the clause early
    let spf_line = spf_line.replace(';', "");

    let spf_domain = match session.mail_from.rsplit_once('@') {
        Some((_, domain)) if !domain.is_empty() => domain.to_string(),
        _ => session.helo.clone(),
    };

    let dkim_results = verify_dkim(email, resolver).await?;
    let passing = dkim_results.iter().find(|r| r.passed());
    let (dkim_full, dkim_result, dkim_domain) = match passing {
        Some(result) => {
            let auid = result.auid.as_deref().unwrap_or_default();
            let auid = auid.strip_prefix('@').unwrap_or(auid);
            (
                format!(
                    "pass header.i={auid} header.s={} header.b={}",
                    result.selector.as_deref().unwrap_or_default(),
                    result.signature_prefix.as_deref().unwrap_or_default()
                ),
                "pass",
                result.domain.clone().unwrap_or_default(),
            )
        }
        None => (
            "fail (no valid signature records)".to_string(),
            "fail",
            String::new(),
        ),
    };

    let from_header = email
        .first_header_value("From")
        .ok_or_else(|| AuthError::FromHeader("missing From header".to_string()))?;

    let outcome = mailhop_dmarc::evaluate(
        &DmarcParams {
            from_header: &from_header,
            spf_line: &spf_line,
            spf_domain: &spf_domain,
            dkim_result,
            dkim_domain: &dkim_domain,
        },
        psl,
        resolver,
    )
    .await?;

    let dmarc_clause = match outcome.policy {
        Some(policy) => format!(
            "{} (p={policy}) header.from={}",
            outcome.result, outcome.from_domain
        ),
        None => format!("{} header.from={}", outcome.result, outcome.from_domain),
    };

    Ok(format!(
        "{authserv_id}; spf={spf_line}; dkim={dkim_full}; dmarc={dmarc_clause}"
    ))
}
