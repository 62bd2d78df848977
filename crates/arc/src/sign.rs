use crate::canonicalization;
use crate::errors::AuthError;
use crate::hash::{self, HashAlgo};
use crate::header::{TaggedHeader, DKIM_SIGNATURE_HEADER_NAME};
use crate::parsed_email::ParsedEmail;
use crate::PrivateKey;
use base64::engine::general_purpose;
use base64::Engine;

/// Builder for the Signer
#[derive(Debug)]
pub struct SignerBuilder {
    signed_headers: Option<Vec<String>>,
    private_key: Option<PrivateKey>,
    selector: Option<String>,
    signing_domain: Option<String>,
    time: Option<chrono::DateTime<chrono::offset::Utc>>,
    header_canonicalization: canonicalization::Type,
    body_canonicalization: canonicalization::Type,
    expiry: Option<chrono::Duration>,
}

impl SignerBuilder {
    pub fn new() -> Self {
        Self {
            signed_headers: None,
            private_key: None,
            selector: None,
            signing_domain: None,
            expiry: None,
            time: None,

            header_canonicalization: canonicalization::Type::Simple,
            body_canonicalization: canonicalization::Type::Simple,
        }
    }

    /// Specify headers to be used in the DKIM signature.
    /// The From: header is required.
    pub fn with_signed_headers(
        mut self,
        headers: impl IntoIterator<Item = impl Into<String>>,
    ) -> Result<Self, AuthError> {
        let headers: Vec<String> = headers
            .into_iter()
            .map(|h| h.into().to_lowercase())
            .collect();

        if !headers.iter().any(|h| h.eq_ignore_ascii_case("from")) {
            return Err(AuthError::BuilderError("missing From in signed headers"));
        }

        self.signed_headers = Some(headers);
        Ok(self)
    }

    /// Specify the private key used to sign the email
    pub fn with_private_key(mut self, key: PrivateKey) -> Self {
        self.private_key = Some(key);
        self
    }

    pub fn with_selector(mut self, value: impl Into<String>) -> Self {
        self.selector = Some(value.into());
        self
    }

    /// Specify for which domain the email should be signed
    pub fn with_signing_domain(mut self, value: impl Into<String>) -> Self {
        self.signing_domain = Some(value.into());
        self
    }

    pub fn with_header_canonicalization(mut self, value: canonicalization::Type) -> Self {
        self.header_canonicalization = value;
        self
    }

    pub fn with_body_canonicalization(mut self, value: canonicalization::Type) -> Self {
        self.body_canonicalization = value;
        self
    }

    /// Specify the current time. Mostly used for testing
    pub fn with_time(mut self, value: chrono::DateTime<chrono::offset::Utc>) -> Self {
        self.time = Some(value);
        self
    }

    /// Specify an expiry duration for the signature validity
    pub fn with_expiry(mut self, value: chrono::Duration) -> Self {
        self.expiry = Some(value);
        self
    }

    /// Build an instance of the Signer.
    /// Must be provided: signed_headers, private_key, selector and
    /// signing_domain.
    pub fn build(self) -> Result<Signer, AuthError> {
        use AuthError::BuilderError;

        Ok(Signer {
            signed_headers: self
                .signed_headers
                .ok_or(BuilderError("missing required signed headers"))?,
            private_key: self
                .private_key
                .ok_or(BuilderError("missing required private key"))?,
            selector: self
                .selector
                .ok_or(BuilderError("missing required selector"))?,
            signing_domain: self
                .signing_domain
                .ok_or(BuilderError("missing required signing domain"))?,
            header_canonicalization: self.header_canonicalization,
            body_canonicalization: self.body_canonicalization,
            expiry: self.expiry,
            time: self.time,
        })
    }
}

impl Default for SignerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// DKIM signer. Use the [SignerBuilder] to build an instance.
#[derive(Debug)]
pub struct Signer {
    signed_headers: Vec<String>,
    private_key: PrivateKey,
    selector: String,
    signing_domain: String,
    header_canonicalization: canonicalization::Type,
    body_canonicalization: canonicalization::Type,
    expiry: Option<chrono::Duration>,
    time: Option<chrono::DateTime<chrono::offset::Utc>>,
}

impl Signer {
    /// Sign a message, returning the complete DKIM-Signature header
    /// (name and value).
    /// As specified in <https://datatracker.ietf.org/doc/html/rfc6376#section-5>
    pub fn sign(&self, email: &ParsedEmail) -> Result<String, AuthError> {
        let body_hash = hash::compute_body_hash(
            self.body_canonicalization,
            None,
            HashAlgo::RsaSha256,
            email.get_body_bytes(),
        )?;

        let time = self.time.unwrap_or_else(chrono::offset::Utc::now);

        let mut header = TaggedHeader::default();
        header.set_tag("v", "1");
        header.set_tag("a", HashAlgo::RsaSha256.algo_name());
        header.set_tag("d", &self.signing_domain);
        header.set_tag("s", &self.selector);
        header.set_tag(
            "c",
            format!(
                "{}/{}",
                self.header_canonicalization.canon_name(),
                self.body_canonicalization.canon_name()
            ),
        );
        header.set_tag("h", self.signed_headers.join(":"));
        header.set_tag("t", time.timestamp().to_string());
        if let Some(expiry) = self.expiry {
            header.set_tag("x", (time + expiry).timestamp().to_string());
        }
        header.set_tag("bh", body_hash);
        header.set_tag("b", "");

        let header_pairs = email.header_pairs();
        let digest = hash::compute_headers_hash(
            self.header_canonicalization,
            &self.signed_headers.join(":"),
            HashAlgo::RsaSha256,
            DKIM_SIGNATURE_HEADER_NAME,
            &header.to_unsigned_string(),
            &header_pairs,
        )?;

        let signature = self.private_key.sign_digest(&digest)?;
        header.set_tag("b", general_purpose::STANDARD.encode(signature));

        Ok(format!(
            "{DKIM_SIGNATURE_HEADER_NAME}: {}",
            header.to_signature_string()
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::generate_key;
    use chrono::TimeZone;

    #[test]
    fn test_sign_emits_fixed_tag_order() {
        let raw_email = "From: Joe SixPack <joe@football.example.com>\r\nSubject: Is dinner ready?\r\n\r\nHi.\r\n";
        let email = ParsedEmail::parse_bytes(raw_email.as_bytes()).unwrap();

        let (key, _record) = generate_key();
        let time = chrono::Utc.with_ymd_and_hms(2021, 1, 1, 0, 0, 1).unwrap();

        let signer = SignerBuilder::new()
            .with_signed_headers(["From", "Subject"])
            .unwrap()
            .with_private_key(key)
            .with_selector("s20")
            .with_signing_domain("example.com")
            .with_body_canonicalization(canonicalization::Type::Relaxed)
            .with_header_canonicalization(canonicalization::Type::Relaxed)
            .with_time(time)
            .build()
            .unwrap();
        let header = signer.sign(&email).unwrap();

        assert!(header.starts_with(
            "DKIM-Signature: v=1; a=rsa-sha256; d=example.com; s=s20; \
             c=relaxed/relaxed; h=from : subject; t=1609459201; bh="
        ));
        assert!(!header.ends_with("b="));
    }

    #[test]
    fn test_sign_requires_from() {
        let err = SignerBuilder::new()
            .with_signed_headers(["Subject", "To"])
            .unwrap_err();
        k9::assert_equal!(
            err,
            AuthError::BuilderError("missing From in signed headers")
        );
    }

    #[test]
    fn test_builder_requires_key() {
        let err = SignerBuilder::new()
            .with_signed_headers(["From"])
            .unwrap()
            .with_selector("sel")
            .with_signing_domain("example.com")
            .build()
            .unwrap_err();
        k9::assert_equal!(
            err,
            AuthError::BuilderError("missing required private key")
        );
    }

    #[test]
    fn test_sign_with_expiry() {
        let raw_email = "From: a@example.com\r\n\r\nbody\r\n";
        let email = ParsedEmail::parse_bytes(raw_email.as_bytes()).unwrap();

        let (key, _record) = generate_key();
        let time = chrono::Utc.with_ymd_and_hms(2021, 1, 1, 0, 0, 1).unwrap();

        let signer = SignerBuilder::new()
            .with_signed_headers(["From"])
            .unwrap()
            .with_private_key(key)
            .with_selector("s20")
            .with_signing_domain("example.com")
            .with_time(time)
            .with_expiry(chrono::Duration::try_hours(3).expect("3 hours ok"))
            .build()
            .unwrap();
        let header = signer.sign(&email).unwrap();

        assert!(header.contains("t=1609459201; x=1609470001;"));
    }
}
