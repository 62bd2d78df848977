use crate::arc::MAX_ARC_INSTANCE;
use crate::errors::AuthError;
use crate::parser::{self, Tag};
use indexmap::map::IndexMap;
use std::str::FromStr;

pub(crate) const DKIM_SIGNATURE_HEADER_NAME: &str = "DKIM-Signature";
const SIGN_EXPIRATION_DRIFT_MINS: i64 = 15;

/// An ordered `tag=value` header body, as used by DKIM-Signature,
/// ARC-Message-Signature and ARC-Seal.
///
/// Tag order is preserved from the parsed text (or template) and is the
/// order used on emission; updating a tag's value through [`set_tag`]
/// never moves it. Output is always rebuilt from the ordered entries,
/// never from a by-name map.
///
/// [`set_tag`]: TaggedHeader::set_tag
#[derive(Clone, Debug, Default)]
pub struct TaggedHeader {
    tags: IndexMap<String, Tag>,
    raw_bytes: String,
}

impl TaggedHeader {
    pub fn parse(value: &str) -> Result<Self, AuthError> {
        let (_, tags) =
            parser::tag_list(value).map_err(|err| AuthError::TagSyntax(err.to_string()))?;

        let mut tags_map = IndexMap::new();
        for tag in tags {
            let name = tag.name.clone();
            if tags_map.insert(name.clone(), tag).is_some() {
                return Err(AuthError::DuplicateTag(name));
            }
        }
        Ok(Self {
            tags: tags_map,
            raw_bytes: value.to_owned(),
        })
    }

    pub fn get_tag(&self, name: &str) -> Option<&str> {
        self.tags.get(name).map(|v| v.value.as_str())
    }

    /// Get the named tag and attempt to parse it into an `R`
    pub fn parse_tag<R>(&self, name: &str) -> Result<Option<R>, AuthError>
    where
        R: FromStr,
        <R as FromStr>::Err: std::fmt::Display,
    {
        match self.get_tag(name) {
            None => Ok(None),
            Some(value) => {
                let value: R = value.parse().map_err(|err| {
                    AuthError::TagSyntax(format!("invalid \"{name}\" tag value: {err:#}"))
                })?;
                Ok(Some(value))
            }
        }
    }

    pub fn get_raw_tag(&self, name: &str) -> Option<&str> {
        self.tags.get(name).map(|v| v.raw_value.as_str())
    }

    pub fn get_required_tag(&self, name: &str) -> &str {
        // Required tags are guaranteed present by the wrapper types'
        // parse methods, so it is safe to assert here
        match self.get_tag(name) {
            Some(value) => value,
            None => panic!("required tag {name} is not present"),
        }
    }

    /// The header text as parsed, before any mutation.
    pub fn raw(&self) -> &str {
        &self.raw_bytes
    }

    /// Replace the value of an existing tag, or append a new one.
    /// An existing tag keeps its position.
    pub fn set_tag(&mut self, name: &str, value: impl Into<String>) {
        let value = value.into();
        match self.tags.get_mut(name) {
            Some(tag) => {
                tag.raw_value = value.clone();
                tag.value = value;
            }
            None => {
                self.tags.insert(
                    name.to_owned(),
                    Tag {
                        name: name.to_owned(),
                        raw_value: value.clone(),
                        value,
                    },
                );
            }
        }
    }

    pub fn arc_instance(&self) -> Result<u8, AuthError> {
        let instance = self
            .get_tag("i")
            .ok_or(AuthError::MissingRequiredTag("i"))?
            .parse::<u8>()
            .map_err(|_| AuthError::InvalidInstance)?;

        if instance == 0 || instance > MAX_ARC_INSTANCE {
            return Err(AuthError::InvalidInstance);
        }

        Ok(instance)
    }

    /// Emit the header value with every tag populated, in the original
    /// tag order.
    pub fn to_signature_string(&self) -> String {
        self.serialize_tags(false)
    }

    /// Emit the header value with the `b=` value cleared, which is the
    /// form covered by the signature itself.
    pub fn to_unsigned_string(&self) -> String {
        self.serialize_tags(true)
    }

    fn serialize_tags(&self, clear_b: bool) -> String {
        let mut out = String::new();
        for (idx, (key, tag)) in self.tags.iter().enumerate() {
            if idx > 0 {
                out.push_str("; ");
            }
            out.push_str(key);
            out.push('=');
            if clear_b && key == "b" {
                continue;
            }
            if key == "h" {
                out.push_str(&signed_header_list(&tag.value));
            } else {
                out.push_str(&tag.value);
            }
        }
        out
    }

    /// Check things common to DKIM-Signature and ARC-Message-Signature
    fn check_common_tags(&self) -> Result<(), AuthError> {
        // Check that the "h=" tag includes the From header
        if !self
            .get_required_tag("h")
            .split(':')
            .any(|h| h.trim().eq_ignore_ascii_case("from"))
        {
            return Err(AuthError::FromFieldNotSigned);
        }

        if let Some(query_method) = self.get_tag("q") {
            if query_method != "dns/txt" {
                return Err(AuthError::UnsupportedQueryMethod);
            }
        }

        self.check_expiration()
    }

    /// Check that the "x=" tag, if present, is not in the past
    fn check_expiration(&self) -> Result<(), AuthError> {
        if let Some(expiration) = self.get_tag("x") {
            let mut expiration =
                chrono::DateTime::from_timestamp(expiration.parse::<i64>().unwrap_or_default(), 0)
                    .ok_or(AuthError::SignatureExpired)?;
            expiration += chrono::Duration::try_minutes(SIGN_EXPIRATION_DRIFT_MINS)
                .expect("drift to be in-range");
            if chrono::Utc::now() > expiration {
                return Err(AuthError::SignatureExpired);
            }
        }
        Ok(())
    }

    /// The names listed in `h=`, lowercased and checked against the
    /// field-name syntax.
    pub fn signed_header_names(&self) -> Result<Vec<String>, AuthError> {
        let mut names = vec![];
        for name in self.get_required_tag("h").split(':') {
            let name = name.trim().to_ascii_lowercase();
            if name.is_empty() || !name.bytes().all(is_ftext) {
                return Err(AuthError::TagSyntax(format!(
                    "invalid header name {name:?} in h tag"
                )));
            }
            names.push(name);
        }
        Ok(names)
    }
}

/// The signed emission form of an `h=` list: lowercased names joined
/// with colons surrounded by single spaces.
fn signed_header_list(value: &str) -> String {
    value
        .split(':')
        .map(|name| name.trim().to_ascii_lowercase())
        .collect::<Vec<_>>()
        .join(" : ")
}

// field names are printable US-ASCII except colon
// https://datatracker.ietf.org/doc/html/rfc5322#section-3.6.8
fn is_ftext(c: u8) -> bool {
    (33..=57).contains(&c) || (59..=126).contains(&c)
}

/// Clear the value of the `b=` tag in raw header text, leaving every
/// other byte untouched. Only a `b` at a tag boundary counts; `b=` runs
/// inside base64 values are left alone.
pub(crate) fn clear_b_tag(raw: &str) -> String {
    let bytes = raw.as_bytes();
    let mut i = 0;
    let mut at_boundary = true;
    while i < bytes.len() {
        match bytes[i] {
            b';' => {
                at_boundary = true;
                i += 1;
            }
            b' ' | b'\t' | b'\r' | b'\n' => {
                i += 1;
            }
            b'b' if at_boundary => {
                let mut j = i + 1;
                while j < bytes.len() && matches!(bytes[j], b' ' | b'\t' | b'\r' | b'\n') {
                    j += 1;
                }
                if j < bytes.len() && bytes[j] == b'=' {
                    let mut k = j + 1;
                    while k < bytes.len() && bytes[k] != b';' {
                        k += 1;
                    }
                    let mut out = String::with_capacity(raw.len());
                    out.push_str(&raw[..j + 1]);
                    out.push_str(&raw[k..]);
                    return out;
                }
                at_boundary = false;
                i += 1;
            }
            _ => {
                at_boundary = false;
                i += 1;
            }
        }
    }
    raw.to_string()
}

/// A DKIM-Signature header.
/// <https://datatracker.ietf.org/doc/html/rfc6376#section-6.1.1>
#[derive(Debug, Clone, Default)]
pub struct DkimSignature {
    tagged: TaggedHeader,
}

impl std::ops::Deref for DkimSignature {
    type Target = TaggedHeader;
    fn deref(&self) -> &TaggedHeader {
        &self.tagged
    }
}

impl DkimSignature {
    pub fn parse(value: &str) -> Result<Self, AuthError> {
        let tagged = TaggedHeader::parse(value)?;
        let header = Self { tagged };

        header.validate_required_tags()?;

        if header.get_required_tag("v") != "1" {
            return Err(AuthError::IncompatibleVersion);
        }

        // The "d=" domain must be the same as, or a parent of, the
        // domain in the "i=" tag
        if let Some(user) = header.get_tag("i") {
            let signing_domain = header.get_required_tag("d");
            let Some((_local, domain)) = user.split_once('@') else {
                return Err(AuthError::DomainMismatch);
            };
            if !domain_is_subdomain_of(domain, signing_domain) {
                return Err(AuthError::DomainMismatch);
            }
        }

        header.check_common_tags()?;

        Ok(header)
    }

    fn validate_required_tags(&self) -> Result<(), AuthError> {
        const REQUIRED_TAGS: &[&str] = &["v", "a", "b", "bh", "d", "h", "s"];
        for required in REQUIRED_TAGS {
            if self.get_tag(required).is_none() {
                return Err(AuthError::MissingRequiredTag(required));
            }
        }
        Ok(())
    }
}

fn domain_is_subdomain_of(domain: &str, parent: &str) -> bool {
    let domain = domain.trim_end_matches('.');
    let parent = parent.trim_end_matches('.');
    if domain.eq_ignore_ascii_case(parent) {
        return true;
    }
    domain.len() > parent.len()
        && domain.as_bytes()[domain.len() - parent.len() - 1] == b'.'
        && domain[domain.len() - parent.len()..].eq_ignore_ascii_case(parent)
}

/// An ARC-Message-Signature header.
///
/// <https://datatracker.ietf.org/doc/html/rfc8617#section-4.1.2> says
/// the AMS header field has the same syntax and semantics as the
/// DKIM-Signature field, with three differences:
/// * the name of the header field itself;
/// * no version tag ("v") is defined, and one MUST be ignored if seen;
/// * the "i" tag holds the ARC instance rather than an AUID.
#[derive(Debug, Clone, Default)]
pub struct ArcMessageSignature {
    tagged: TaggedHeader,
}

impl std::ops::Deref for ArcMessageSignature {
    type Target = TaggedHeader;
    fn deref(&self) -> &TaggedHeader {
        &self.tagged
    }
}

impl std::ops::DerefMut for ArcMessageSignature {
    fn deref_mut(&mut self) -> &mut TaggedHeader {
        &mut self.tagged
    }
}

impl ArcMessageSignature {
    pub fn parse(value: &str) -> Result<Self, AuthError> {
        let tagged = TaggedHeader::parse(value)?;
        let header = Self { tagged };

        header.validate_required_tags()?;
        header.check_common_tags()?;
        header.arc_instance()?;

        Ok(header)
    }

    pub(crate) fn from_template(template: &str) -> Result<Self, AuthError> {
        Ok(Self {
            tagged: TaggedHeader::parse(template)?,
        })
    }

    fn validate_required_tags(&self) -> Result<(), AuthError> {
        const REQUIRED_TAGS: &[&str] = &["a", "b", "bh", "d", "h", "s", "i"];
        for required in REQUIRED_TAGS {
            if self.get_tag(required).is_none() {
                return Err(AuthError::MissingRequiredTag(required));
            }
        }
        Ok(())
    }
}

/// An ARC-Seal header.
/// <https://datatracker.ietf.org/doc/html/rfc8617#section-4.1.3>
#[derive(Debug, Clone, Default)]
pub struct ArcSeal {
    tagged: TaggedHeader,
}

impl std::ops::Deref for ArcSeal {
    type Target = TaggedHeader;
    fn deref(&self) -> &TaggedHeader {
        &self.tagged
    }
}

impl std::ops::DerefMut for ArcSeal {
    fn deref_mut(&mut self) -> &mut TaggedHeader {
        &mut self.tagged
    }
}

impl ArcSeal {
    pub fn parse(value: &str) -> Result<Self, AuthError> {
        let tagged = TaggedHeader::parse(value)?;
        let header = Self { tagged };

        header.validate_required_tags()?;
        header.arc_instance()?;
        header.check_expiration()?;

        // A seal never covers a header list; one MUST produce a cv
        // status of fail, see RFC 8617 section 5.1.1
        if header.get_tag("h").is_some() {
            return Err(AuthError::StructureViolation(
                "ARC-Seal must not carry an h tag".to_string(),
            ));
        }

        Ok(header)
    }

    pub(crate) fn from_template(template: &str) -> Result<Self, AuthError> {
        Ok(Self {
            tagged: TaggedHeader::parse(template)?,
        })
    }

    fn validate_required_tags(&self) -> Result<(), AuthError> {
        const REQUIRED_TAGS: &[&str] = &["a", "b", "d", "s", "i", "cv"];
        for required in REQUIRED_TAGS {
            if self.get_tag(required).is_none() {
                return Err(AuthError::MissingRequiredTag(required));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duplicate_tag_rejected() {
        k9::assert_equal!(
            TaggedHeader::parse("a=1; b=x; a=2").unwrap_err(),
            AuthError::DuplicateTag("a".to_string())
        );
    }

    #[test]
    fn test_template_order_survives_substitution() {
        let mut header =
            TaggedHeader::parse("i=; cv=; a=rsa-sha256; d=sealer.example; s=arc; t=; b=")
                .unwrap();
        header.set_tag("t", "1755918846");
        header.set_tag("i", "1");
        header.set_tag("cv", "none");
        header.set_tag("b", "c2ln");

        k9::snapshot!(
            header.to_signature_string(),
            "i=1; cv=none; a=rsa-sha256; d=sealer.example; s=arc; t=1755918846; b=c2ln"
        );
        k9::snapshot!(
            header.to_unsigned_string(),
            "i=1; cv=none; a=rsa-sha256; d=sealer.example; s=arc; t=1755918846; b="
        );
    }

    #[test]
    fn test_signed_h_list_form() {
        let mut header = TaggedHeader::parse(
            "i=; a=rsa-sha256; c=relaxed/relaxed; d=sealer.example; s=arc; t=; h=Subject:From:To; bh=; b=",
        )
        .unwrap();
        header.set_tag("i", "1");

        assert!(header
            .to_signature_string()
            .contains("h=subject : from : to;"));
    }

    #[test]
    fn test_clear_b_tag_trailing() {
        k9::assert_equal!(
            clear_b_tag("i=1; s=sel; b=AAAA"),
            "i=1; s=sel; b=".to_string()
        );
    }

    #[test]
    fn test_clear_b_tag_mid_list() {
        k9::assert_equal!(
            clear_b_tag("i=1; b=AAAA; s=sel"),
            "i=1; b=; s=sel".to_string()
        );
    }

    #[test]
    fn test_clear_b_tag_ignores_base64_runs() {
        // The bh value happens to contain the bytes `b=`; only the real
        // b tag may be cleared
        k9::assert_equal!(
            clear_b_tag("bh=xb=; b=sig"),
            "bh=xb=; b=".to_string()
        );
    }

    #[test]
    fn test_clear_b_tag_folded() {
        k9::assert_equal!(
            clear_b_tag("i=1;\r\n\tb = AAAA\r\n\tBBBB"),
            "i=1;\r\n\tb =".to_string()
        );
    }

    #[test]
    fn test_arc_instance_bounds() {
        for (value, ok) in [("0", false), ("1", true), ("50", true), ("51", false)] {
            let header = TaggedHeader::parse(&format!("i={value}; d=x")).unwrap();
            k9::assert_equal!(header.arc_instance().is_ok(), ok, "i={value}");
        }
    }

    #[test]
    fn test_dkim_header_missing_tag() {
        k9::assert_equal!(
            DkimSignature::parse("v=1; a=rsa-sha256; bh=a; b=b").unwrap_err(),
            AuthError::MissingRequiredTag("d")
        );
    }

    #[test]
    fn test_dkim_header_incompatible_version() {
        let header =
            "v=3; a=rsa-sha256; d=example.net; s=brisbane; h=From:B; bh=hash; b=hash";
        k9::assert_equal!(
            DkimSignature::parse(header).unwrap_err(),
            AuthError::IncompatibleVersion
        );
    }

    #[test]
    fn test_dkim_header_domain_mismatch() {
        let header =
            "v=1; a=rsa-sha256; d=example.net; s=brisbane; i=foo@hein.com; h=From:B; bh=hash; b=hash";
        k9::assert_equal!(
            DkimSignature::parse(header).unwrap_err(),
            AuthError::DomainMismatch
        );
    }

    #[test]
    fn test_dkim_header_subdomain_auid_accepted() {
        let header =
            "v=1; a=rsa-sha256; d=example.net; s=brisbane; i=foo@eng.example.net; h=From:B; bh=hash; b=hash";
        assert!(DkimSignature::parse(header).is_ok());
    }

    #[test]
    fn test_missing_from_in_signed_headers() {
        let header =
            "v=1; a=rsa-sha256; d=example.net; s=brisbane; h=Subject:A:B; bh=hash; b=hash";
        k9::assert_equal!(
            DkimSignature::parse(header).unwrap_err(),
            AuthError::FromFieldNotSigned
        );
    }

    #[test]
    fn test_expired_signature() {
        let mut now = chrono::Utc::now();
        now -= chrono::Duration::try_hours(3).unwrap();

        let header = format!(
            "v=1; a=rsa-sha256; d=example.net; s=brisbane; h=From:B; bh=hash; b=hash; x={}",
            now.timestamp()
        );
        k9::assert_equal!(
            DkimSignature::parse(&header).unwrap_err(),
            AuthError::SignatureExpired
        );
    }

    #[test]
    fn test_expired_within_drift_accepted() {
        let mut now = chrono::Utc::now();
        now -= chrono::Duration::try_seconds(1).unwrap();

        let header = format!(
            "v=1; a=rsa-sha256; d=example.net; s=brisbane; h=From:B; bh=hash; b=hash; x={}",
            now.timestamp()
        );
        assert!(DkimSignature::parse(&header).is_ok());
    }

    #[test]
    fn test_parse_ams() {
        let sig = "i=1; a=rsa-sha256; c=relaxed/relaxed; d=
    messagingengine.com; h=date:from:reply-to:to:message-id:subject
    :mime-version:content-type:content-transfer-encoding; s=fm3; t=
    1761717439; bh=+BM/Umiva3F0xjsh9a2BcwzO1nr0Ru6oGRmgkMy9T3M=; b=I
    M7xjn2qSjOx5fDFvQY+pEPJ74+w3h/UOZUKvdAt7gRP8rAe9C+Tz72izVJyY82xw
    7LT7CBXnwk2DQpg9erhq1yYept4M5CKWLXoQHHUJam8mV4RMUnHgTLVlColIVUtY
    hNAomZdsGNiG1iRGX0C4y81zYANJ11TXKOTvfuMLhG2uDIa8768O5jBa4jlBtGHd
    Dn/87/T/J+plO/ZPiSwWKa+ZttR6yjwm0fdpXf+4y8u0+I8iYSw2EN0vgWMYEEMp
    R1xuhMKD+bSlx130Rz2/5jFsVgLS7CfbTKK5CtqS3hl6EaLw/REBZeCYCHltzRWF
    wt38/NIzJ3ykCswwds2YQ==";
        ArcMessageSignature::parse(sig).unwrap();
    }

    #[test]
    fn test_parse_seal() {
        let seal = "i=1; a=rsa-sha256; cv=none; d=messagingengine.com; s=fm3; t=
    1761717439; b=Q1E9HuR4H0paxIiz15H8P3tGfzDp0XmYKhvyzGsPEBHr2xg610
    ZV1nU6gLWmUl693usMKVxWGrIXbSZb13ICRK0gp1MfVJSQ/4IGM0VD9P5d9Vv7aL
    Q/lx/a8Ar1ks1yEHeBRuZ6Q5GdYur8rgYr7UoOTJGwOOPTJ4C2TWGoHHIRoVECJv
    mMa6jpcJ6SE6iK/76elugk65BheumbQ1YEnbjitchUsLAwSXMuO+mhLYGtmvBhOn
    v3ewYQvD2jZzl2W+O73A08dQ/oeODDPqt6Fpv3XK572cTYPHhzmSbsxh9Lp7Z9MV
    x2TACmO51Adnp3C1CcEw8K9ajAgyjNMW4ELA==";
        ArcSeal::parse(seal).unwrap();
    }

    #[test]
    fn test_seal_with_h_rejected() {
        let seal = "i=1; a=rsa-sha256; cv=none; d=x.example; s=s; h=from; b=sig";
        assert!(matches!(
            ArcSeal::parse(seal).unwrap_err(),
            AuthError::StructureViolation(_)
        ));
    }

    #[test]
    fn test_signed_header_names_validation() {
        let header = TaggedHeader::parse("h=From : To:Subject; d=x").unwrap();
        k9::assert_equal!(
            header.signed_header_names().unwrap(),
            vec!["from".to_string(), "to".to_string(), "subject".to_string()]
        );

        let bad = TaggedHeader::parse("h=From:; d=x").unwrap();
        assert!(bad.signed_header_names().is_err());
    }
}
