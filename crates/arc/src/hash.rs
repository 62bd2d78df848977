use crate::canonicalization::{self, CanonSink};
use crate::errors::AuthError;
use base64::engine::general_purpose;
use base64::Engine;
use sha2::{Digest as _, Sha256};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy)]
pub enum HashAlgo {
    RsaSha256,
}

impl HashAlgo {
    pub fn algo_name(&self) -> &'static str {
        match self {
            Self::RsaSha256 => "rsa-sha256",
        }
    }
}

pub(crate) fn parse_hash_algo(value: &str) -> Result<HashAlgo, AuthError> {
    match value {
        "rsa-sha256" => Ok(HashAlgo::RsaSha256),
        e => Err(AuthError::UnsupportedHashAlgorithm(e.to_string())),
    }
}

/// Parses the canonicalization value (passed in c=) and returns the
/// canonicalization for (Header, Body)
pub(crate) fn parse_canonicalization(
    value: Option<&str>,
    default: canonicalization::Type,
) -> Result<(canonicalization::Type, canonicalization::Type), AuthError> {
    use canonicalization::Type::{Relaxed, Simple};
    match value {
        None => Ok((default, default)),
        Some(s) => match s {
            "simple/simple" => Ok((Simple, Simple)),
            "relaxed/simple" => Ok((Relaxed, Simple)),
            "simple/relaxed" => Ok((Simple, Relaxed)),
            "relaxed/relaxed" => Ok((Relaxed, Relaxed)),
            "relaxed" => Ok((Relaxed, Simple)),
            "simple" => Ok((Simple, Simple)),
            v => Err(AuthError::UnsupportedCanonicalizationType(v.to_owned())),
        },
    }
}

/// Hashes up to `limit` bytes of the canonicalized body, to honor the
/// `l=` signature tag.
pub(crate) struct LimitHasher {
    pub limit: usize,
    pub hashed: usize,
    pub hasher: HashImpl,
}

impl LimitHasher {
    pub fn finalize(self) -> String {
        self.hasher.finalize()
    }
}

impl CanonSink for LimitHasher {
    fn put(&mut self, bytes: &[u8]) {
        let remain = self.limit - self.hashed;
        let len = bytes.len().min(remain);
        self.hasher.hash(&bytes[..len]);
        self.hashed += len;
    }
}

pub(crate) enum HashImpl {
    Sha256(Sha256),
}

impl HashImpl {
    pub fn from_algo(algo: HashAlgo) -> Self {
        match algo {
            HashAlgo::RsaSha256 => Self::Sha256(Sha256::new()),
        }
    }

    pub fn hash(&mut self, bytes: &[u8]) {
        match self {
            Self::Sha256(hasher) => hasher.update(bytes),
        }
    }

    pub fn finalize(self) -> String {
        match self {
            Self::Sha256(hasher) => general_purpose::STANDARD.encode(hasher.finalize()),
        }
    }

    pub fn finalize_bytes(self) -> Vec<u8> {
        match self {
            Self::Sha256(hasher) => hasher.finalize().to_vec(),
        }
    }
}

/// Returns the base64 hash of the canonicalized message body.
/// https://datatracker.ietf.org/doc/html/rfc6376#section-3.7
pub(crate) fn compute_body_hash(
    canonicalization_type: canonicalization::Type,
    length: Option<&str>,
    hash_algo: HashAlgo,
    body: &[u8],
) -> Result<String, AuthError> {
    let limit = if let Some(length) = length {
        length
            .parse::<usize>()
            .map_err(|err| AuthError::TagSyntax(format!("invalid length: {err}")))?
    } else {
        usize::MAX
    };

    let mut hasher = LimitHasher {
        hasher: HashImpl::from_algo(hash_algo),
        limit,
        hashed: 0,
    };

    canonicalization_type.canon_body(body, &mut hasher);

    Ok(hasher.finalize())
}

/// Select the header occurrences covered by an `h=` list, from the
/// bottom of the header block upwards, consuming one occurrence per
/// mention as required by
/// https://datatracker.ietf.org/doc/html/rfc6376#section-5.4.2
pub(crate) fn select_headers<'a>(
    signed_headers: &str,
    headers: &[(String, &'a [u8])],
) -> Vec<(String, &'a [u8])> {
    let mut selected = vec![];

    let num_headers = headers.len();
    let mut last_index: HashMap<&str, usize> = HashMap::new();

    'outer: for name in signed_headers.split(':').map(|h| h.trim()) {
        let index = last_index.get(&name).unwrap_or(&num_headers);
        for (header_index, (key, value)) in headers
            .iter()
            .enumerate()
            .rev()
            .skip(num_headers - index)
        {
            if key.eq_ignore_ascii_case(name) {
                selected.push((key.clone(), *value));
                last_index.insert(name, header_index);
                continue 'outer;
            }
        }

        last_index.insert(name, 0);
    }

    selected
}

/// Compute the header hash for a DKIM-style signature: the canonicalized
/// `h=` headers followed by the canonicalized signature header itself,
/// with its `b=` value empty and no trailing CRLF.
pub(crate) fn compute_headers_hash(
    canonicalization_type: canonicalization::Type,
    signed_headers: &str,
    hash_algo: HashAlgo,
    sig_header_name: &str,
    unsigned_sig_value: &str,
    headers: &[(String, &[u8])],
) -> Result<Vec<u8>, AuthError> {
    let mut input = Vec::new();
    let mut hasher = HashImpl::from_algo(hash_algo);

    for (key, value) in select_headers(signed_headers, headers) {
        canonicalization_type.canon_header_into(&key, value, &mut input);
    }

    {
        let mut canonicalized_value = vec![];
        canonicalization_type.canon_header_into(
            sig_header_name,
            unsigned_sig_value.as_bytes(),
            &mut canonicalized_value,
        );

        // remove trailing "\r\n"
        canonicalized_value.truncate(canonicalized_value.len() - 2);

        input.extend_from_slice(&canonicalized_value);
    }
    tracing::debug!("headers to hash: {:?}", String::from_utf8_lossy(&input));

    hasher.hash(&input);
    Ok(hasher.finalize_bytes())
}
