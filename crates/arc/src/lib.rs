// Implementation of ARC (https://datatracker.ietf.org/doc/html/rfc8617)
// sealing and chain validation, with the DKIM (RFC 6376) verification and
// DMARC alignment results that feed the sealed Authentication-Results.

use base64::engine::general_purpose;
use base64::Engine;
use rsa::pkcs1::DecodeRsaPrivateKey;
use rsa::pkcs8::DecodePrivateKey;
use rsa::{Pkcs1v15Sign, RsaPrivateKey, RsaPublicKey};
use sha2::Sha256;

#[macro_use]
extern crate quick_error;

pub mod arc;
pub mod canonicalization;
mod dkim;
mod errors;
mod hash;
mod header;
mod parsed_email;
mod parser;
mod public_key;
mod seal;
mod sign;

pub use arc::{validate_chain, ArcAuthenticationResults, ArcSet, ChainValidity, MAX_ARC_INSTANCE};
pub use dkim::{verify_dkim, DkimVerifyResult};
pub use errors::{AuthError, Status};
pub use header::{ArcMessageSignature, ArcSeal, DkimSignature, TaggedHeader};
pub use parsed_email::ParsedEmail;
pub use parser::{tag_list as parse_tag_list, Tag};
pub use seal::{ArcSealer, ArcSealerBuilder, SealedHeaders, SessionParams};
pub use sign::{Signer, SignerBuilder};

const DNS_NAMESPACE: &str = "_domainkey";

/// A private key usable for DKIM signing and ARC sealing.
#[derive(Debug)]
pub enum PrivateKey {
    Rsa(RsaPrivateKey),
}

impl PrivateKey {
    /// Parse RSA key data into a PrivateKey.
    /// PKCS#1 and PKCS#8 are accepted, in either DER or PEM form.
    pub fn rsa_key(data: &[u8]) -> Result<Self, AuthError> {
        let mut errors = vec![];

        match RsaPrivateKey::from_pkcs1_der(data) {
            Ok(key) => return Ok(Self::Rsa(key)),
            Err(err) => errors.push(format!("from_pkcs1_der: {err:#}")),
        }
        match RsaPrivateKey::from_pkcs8_der(data) {
            Ok(key) => return Ok(Self::Rsa(key)),
            Err(err) => errors.push(format!("from_pkcs8_der: {err:#}")),
        }

        match std::str::from_utf8(data) {
            Ok(s) => {
                match RsaPrivateKey::from_pkcs1_pem(s) {
                    Ok(key) => return Ok(Self::Rsa(key)),
                    Err(err) => errors.push(format!("from_pkcs1_pem: {err:#}")),
                }
                match RsaPrivateKey::from_pkcs8_pem(s) {
                    Ok(key) => return Ok(Self::Rsa(key)),
                    Err(err) => errors.push(format!("from_pkcs8_pem: {err:#}")),
                }
            }
            Err(err) => errors.push(format!("from_pkcs1_pem: data is not UTF-8: {err:#}")),
        }

        Err(AuthError::PrivateKeyLoadError(errors.join(". ")))
    }

    /// Load RSA key data from a file and parse it into a PrivateKey
    pub fn rsa_key_file<P: AsRef<std::path::Path>>(path: P) -> Result<Self, AuthError> {
        let path = path.as_ref();
        let data = std::fs::read(path).map_err(|err| {
            AuthError::PrivateKeyLoadError(format!(
                "rsa_key_file: failed to read file {path:?}: {err:#}"
            ))
        })?;
        Self::rsa_key(&data)
    }

    pub(crate) fn sign_digest(&self, digest: &[u8]) -> Result<Vec<u8>, AuthError> {
        match self {
            Self::Rsa(private_key) => private_key
                .sign(Pkcs1v15Sign::new::<Sha256>(), digest)
                .map_err(|err| AuthError::FailedToSign(err.to_string())),
        }
    }
}

// https://datatracker.ietf.org/doc/html/rfc6376#section-6.1.3 Step 4
pub(crate) fn verify_signature(
    public_key: &RsaPublicKey,
    header_hash: &[u8],
    signature: &[u8],
) -> bool {
    public_key
        .verify(Pkcs1v15Sign::new::<Sha256>(), header_hash, signature)
        .is_ok()
}

pub(crate) fn decode_signature(b_tag: &str) -> Result<Vec<u8>, AuthError> {
    general_purpose::STANDARD
        .decode(b_tag)
        .map_err(|err| AuthError::TagSyntax(format!("failed to decode signature: {err}")))
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use rsa::pkcs8::EncodePublicKey;

    /// A fresh signing key plus the TXT record text that publishes its
    /// public half.
    pub fn generate_key() -> (PrivateKey, String) {
        let mut rng = rand::thread_rng();
        let private = RsaPrivateKey::new(&mut rng, 2048).expect("key generation to work");
        let spki = private
            .to_public_key()
            .to_public_key_der()
            .expect("SPKI encoding to work");
        let record = format!(
            "v=DKIM1; k=rsa; p={}",
            general_purpose::STANDARD.encode(spki.as_bytes())
        );
        (PrivateKey::Rsa(private), record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rsa::pkcs8::DecodePublicKey;
    use sha2::Digest;

    #[test]
    fn test_sign_and_verify_digest() {
        let (key, record) = test_support::generate_key();
        let digest = Sha256::digest(b"covered data").to_vec();

        let signature = key.sign_digest(&digest).unwrap();

        let p = record.split_once("; p=").unwrap().1;
        let spki = general_purpose::STANDARD.decode(p).unwrap();
        let public = RsaPublicKey::from_public_key_der(&spki).unwrap();
        assert!(verify_signature(&public, &digest, &signature));

        let wrong = Sha256::digest(b"other data").to_vec();
        assert!(!verify_signature(&public, &wrong, &signature));
    }

    #[test]
    fn test_rsa_key_loading() {
        use rsa::pkcs1::EncodeRsaPrivateKey;

        let mut rng = rand::thread_rng();
        let private = RsaPrivateKey::new(&mut rng, 2048).unwrap();

        let pem = private.to_pkcs1_pem(rsa::pkcs8::LineEnding::LF).unwrap();
        assert!(PrivateKey::rsa_key(pem.as_bytes()).is_ok());

        let der = private.to_pkcs1_der().unwrap();
        assert!(PrivateKey::rsa_key(der.as_bytes()).is_ok());

        assert!(matches!(
            PrivateKey::rsa_key(b"not a key"),
            Err(AuthError::PrivateKeyLoadError(_))
        ));
    }
}
