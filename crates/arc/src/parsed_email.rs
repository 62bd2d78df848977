use crate::errors::AuthError;
use mailparse::MailHeader;

/// Read-only view over a message: the ordered header block plus the raw
/// body bytes after the separating blank line. The message bytes are
/// borrowed from the caller.
pub struct ParsedEmail<'a> {
    headers: Vec<MailHeader<'a>>,
    bytes: &'a [u8],
    body_offset: usize,
}

impl<'a> ParsedEmail<'a> {
    pub fn parse_bytes(bytes: &'a [u8]) -> Result<Self, AuthError> {
        let (headers, body_offset) = mailparse::parse_headers(bytes).map_err(|err| {
            tracing::debug!("message parse failed: {err}");
            AuthError::MalformedBody
        })?;
        Ok(Self {
            headers,
            bytes,
            body_offset,
        })
    }

    /// The raw body bytes, exactly as they appear on the wire.
    pub fn get_body_bytes(&self) -> &'a [u8] {
        &self.bytes[self.body_offset.min(self.bytes.len())..]
    }

    pub fn headers(&self) -> &[MailHeader<'a>] {
        &self.headers
    }

    /// Ordered `(name, raw value)` pairs for canonicalization and
    /// header selection.
    pub fn header_pairs(&self) -> Vec<(String, &[u8])> {
        self.headers
            .iter()
            .map(|h| (h.get_key(), h.get_value_raw()))
            .collect()
    }

    pub fn headers_named<'s>(
        &'s self,
        name: &'s str,
    ) -> impl Iterator<Item = &'s MailHeader<'a>> + 's {
        self.headers
            .iter()
            .filter(move |h| h.get_key_ref().eq_ignore_ascii_case(name))
    }

    /// Unfolded value of the first header with the given name.
    pub fn first_header_value(&self, name: &str) -> Option<String> {
        self.headers_named(name).next().map(|h| h.get_value())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_body() {
        let email =
            ParsedEmail::parse_bytes("Subject: A\r\n\r\nContent\n.hi\n.hello..".as_bytes())
                .unwrap();
        assert_eq!(
            String::from_utf8_lossy(email.get_body_bytes()),
            "Content\n.hi\n.hello..".to_owned()
        );
    }

    #[test]
    fn test_header_order_preserved() {
        let email = ParsedEmail::parse_bytes(
            b"From: a@x\r\nTo: b@y\r\nFrom: c@z\r\n\r\nbody",
        )
        .unwrap();
        let pairs = email.header_pairs();
        assert_eq!(
            pairs,
            vec![
                ("From".to_string(), &b"a@x"[..]),
                ("To".to_string(), &b"b@y"[..]),
                ("From".to_string(), &b"c@z"[..]),
            ]
        );
        assert_eq!(email.headers_named("from").count(), 2);
    }

    #[test]
    fn test_first_header_value_unfolds() {
        let email = ParsedEmail::parse_bytes(
            b"Subject: folded\r\n subject line\r\n\r\nbody",
        )
        .unwrap();
        k9::assert_equal!(
            email.first_header_value("subject").unwrap(),
            "folded subject line"
        );
    }
}
