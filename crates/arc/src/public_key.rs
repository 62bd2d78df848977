use crate::errors::AuthError;
use crate::parser;
use crate::DNS_NAMESPACE;
use base64::engine::general_purpose;
use base64::Engine;
use mailhop_dns::{DnsError, Lookup};
use rsa::{pkcs1, pkcs8, RsaPublicKey};
use std::collections::HashMap;

const RSA_KEY_TYPE: &str = "rsa";

/// Fetch and decode the signer's public key record.
/// https://datatracker.ietf.org/doc/html/rfc6376#section-6.1.2
///
/// When the name holds more than one TXT record the first is used;
/// publishing multiple key records at one selector is not supported.
pub(crate) async fn retrieve_public_key(
    resolver: &dyn Lookup,
    domain: &str,
    selector: &str,
) -> Result<RsaPublicKey, AuthError> {
    let dns_name = format!("{selector}.{DNS_NAMESPACE}.{domain}");
    let answers = resolver.lookup_txt(&dns_name).await.map_err(|err| match err {
        DnsError::Temporary(reason) => AuthError::KeyUnavailable(reason),
        DnsError::Permanent(reason) => AuthError::DnsPerm(reason),
    })?;
    let txt = answers.first().ok_or(AuthError::NoKeyForSignature)?;
    tracing::debug!("key record for {dns_name}: {txt:?}");

    let (_, tags) = parser::tag_list(txt).map_err(|err| {
        tracing::warn!("key syntax error: {err}");
        AuthError::KeySyntaxError
    })?;

    let mut tags_map = HashMap::new();
    for tag in &tags {
        tags_map.insert(tag.name.clone(), tag.clone());
    }

    if let Some(version) = tags_map.get("v") {
        if version.value != "DKIM1" {
            return Err(AuthError::KeyIncompatibleVersion);
        }
    }

    // An absent "k=" tag means rsa; anything other than rsa is not
    // usable here
    if let Some(key_type) = tags_map.get("k") {
        if key_type.value != RSA_KEY_TYPE {
            return Err(AuthError::InappropriateKeyAlgorithm);
        }
    }

    let tag = tags_map.get("p").ok_or(AuthError::NoKeyForSignature)?;
    if tag.value.is_empty() {
        // An empty p= means the key has been revoked
        return Err(AuthError::NoKeyForSignature);
    }

    let bytes = general_purpose::STANDARD.decode(&tag.value).map_err(|err| {
        AuthError::KeyUnavailable(format!("failed to decode public key: {err}"))
    })?;

    pkcs8::DecodePublicKey::from_public_key_der(&bytes)
        .or_else(|_| pkcs1::DecodeRsaPublicKey::from_pkcs1_der(&bytes))
        .map_err(|err| AuthError::KeyUnavailable(format!("failed to parse public key: {err}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use mailhop_dns::TestLookup;

    const SAMPLE_RSA_SPKI: &str = "MIIBIjANBgkqhkiG9w0BAQEFAAOCAQ8AMIIBCgKCAQEA3TntGwdEtmIx+H8Etk1IgA2gLzy9v22TO+BcTUmUFaURWSG413g+VItm86ntW1bfbgFk/ArrTVAzQxgynoCQky3VXMXl2qEKgGSrLv+QaNvbebVDZI6VZX8D5+aJIN3sCSVY1eXA4x6LbPZ8pAqIAuAhtfXc7rVKbELqlEaUMrQ+ovyjF4R6gfL621BKdLeTF89/kbqJhLwmgtzok6UBUzexDDBhZ0gfGw331J+7aqdJLWUCQv6iE3zkI4myyEcMrgWxRjdZ861x374pNzady/B688A5i4BHoVnBJBuLEYfS1gTCC/7SB6U5AdEin3P0/+DqSH36cu8+MvAZ1C7E2wIDAQAB";

    #[tokio::test]
    async fn test_retrieve_public_key() {
        let resolver = TestLookup::default().with_txt(
            "arc._domainkey.sealer.example",
            format!("v=DKIM1; k=rsa; p={SAMPLE_RSA_SPKI}"),
        );
        retrieve_public_key(&resolver, "sealer.example", "arc")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_retrieve_public_key_missing() {
        let resolver = TestLookup::default();
        let err = retrieve_public_key(&resolver, "sealer.example", "arc")
            .await
            .unwrap_err();
        k9::assert_equal!(err, AuthError::NoKeyForSignature);
    }

    #[tokio::test]
    async fn test_retrieve_public_key_incompatible_version() {
        let resolver = TestLookup::default()
            .with_txt("arc._domainkey.sealer.example", "v=DKIM6; p=key");
        let err = retrieve_public_key(&resolver, "sealer.example", "arc")
            .await
            .unwrap_err();
        k9::assert_equal!(err, AuthError::KeyIncompatibleVersion);
    }

    #[tokio::test]
    async fn test_retrieve_public_key_inappropriate_algorithm() {
        let resolver = TestLookup::default()
            .with_txt("arc._domainkey.sealer.example", "v=DKIM1; p=key; k=ed25519");
        let err = retrieve_public_key(&resolver, "sealer.example", "arc")
            .await
            .unwrap_err();
        k9::assert_equal!(err, AuthError::InappropriateKeyAlgorithm);
    }

    #[tokio::test]
    async fn test_retrieve_public_key_revoked() {
        let resolver =
            TestLookup::default().with_txt("arc._domainkey.sealer.example", "v=DKIM1; k=rsa; p=");
        let err = retrieve_public_key(&resolver, "sealer.example", "arc")
            .await
            .unwrap_err();
        k9::assert_equal!(err, AuthError::NoKeyForSignature);
    }

    #[tokio::test]
    async fn test_retrieve_public_key_temp_failure() {
        let resolver = TestLookup::default().with_temp_fail("arc._domainkey.sealer.example");
        let err = retrieve_public_key(&resolver, "sealer.example", "arc")
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::KeyUnavailable(_)));
    }
}
