/// Error status, distinguishing failures that may clear on retry from
/// those that will not.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Status {
    Permfail,
    Tempfail,
}

quick_error! {
    #[derive(Debug, PartialEq, Clone)]
    /// Mail authentication errors
    pub enum AuthError {
        TagSyntax(err: String) {
            display("tag list syntax error: {}", err)
        }
        DuplicateTag(name: String) {
            display("duplicate tag ({})", name)
        }
        MissingRequiredTag(name: &'static str) {
            display("signature missing required tag ({})", name)
        }
        IncompatibleVersion {
            display("incompatible version")
        }
        DomainMismatch {
            display("domain mismatch")
        }
        FromFieldNotSigned {
            display("From field not signed")
        }
        SignatureExpired {
            display("signature expired")
        }
        UnsupportedQueryMethod {
            display("unsupported query method")
        }
        UnsupportedHashAlgorithm(value: String) {
            display("unsupported hash algorithm: {}", value)
        }
        UnsupportedCanonicalizationType(value: String) {
            display("unsupported canonicalization: {}", value)
        }
        InvalidInstance {
            display("invalid ARC instance")
        }
        DuplicateInstance(i: u8) {
            display("duplicate ARC set for instance {}", i)
        }
        MissingInstance(i: u8) {
            display("incomplete ARC set for instance {}", i)
        }
        StructureViolation(err: String) {
            display("broken ARC set structure: {}", err)
        }
        ChainLimitExceeded {
            display("ARC chain is at maximum length")
        }
        KeyUnavailable(err: String) {
            display("key unavailable: {}", err)
        }
        NoKeyForSignature {
            display("no key for signature")
        }
        KeySyntaxError {
            display("key syntax error")
        }
        KeyIncompatibleVersion {
            display("key incompatible version")
        }
        InappropriateKeyAlgorithm {
            display("inappropriate key algorithm")
        }
        SignatureDidNotVerify {
            display("signature did not verify")
        }
        BodyHashDidNotVerify {
            display("body hash did not verify")
        }
        MalformedBody {
            display("malformed email body")
        }
        FromHeader(err: String) {
            display("unusable From header: {}", err)
        }
        Dmarc(err: String) {
            display("DMARC evaluation failed: {}", err)
        }
        DnsTemp(err: String) {
            display("temporary DNS failure: {}", err)
        }
        DnsPerm(err: String) {
            display("permanent DNS failure: {}", err)
        }
        FailedToSign(err: String) {
            display("failed to sign: {}", err)
        }
        PrivateKeyLoadError(err: String) {
            display("failed to load private key: {}", err)
        }
        BuilderError(err: &'static str) {
            display("failed to build object: {}", err)
        }
        Io(err: String) {
            display("i/o error: {}", err)
        }
    }
}

impl AuthError {
    pub fn status(&self) -> Status {
        use AuthError::*;
        match self {
            TagSyntax(_)
            | DuplicateTag(_)
            | MissingRequiredTag(_)
            | IncompatibleVersion
            | DomainMismatch
            | FromFieldNotSigned
            | SignatureExpired
            | UnsupportedQueryMethod
            | UnsupportedHashAlgorithm(_)
            | UnsupportedCanonicalizationType(_)
            | InvalidInstance
            | DuplicateInstance(_)
            | MissingInstance(_)
            | StructureViolation(_)
            | ChainLimitExceeded
            | NoKeyForSignature
            | KeySyntaxError
            | KeyIncompatibleVersion
            | InappropriateKeyAlgorithm
            | SignatureDidNotVerify
            | BodyHashDidNotVerify
            | MalformedBody
            | FromHeader(_)
            | Dmarc(_)
            | DnsPerm(_) => Status::Permfail,
            KeyUnavailable(_)
            | DnsTemp(_)
            | FailedToSign(_)
            | PrivateKeyLoadError(_)
            | BuilderError(_)
            | Io(_) => Status::Tempfail,
        }
    }
}

impl From<mailhop_dns::DnsError> for AuthError {
    fn from(err: mailhop_dns::DnsError) -> Self {
        match err {
            mailhop_dns::DnsError::Temporary(err) => AuthError::DnsTemp(err),
            mailhop_dns::DnsError::Permanent(err) => AuthError::DnsPerm(err),
        }
    }
}

impl From<mailhop_dmarc::DmarcError> for AuthError {
    fn from(err: mailhop_dmarc::DmarcError) -> Self {
        match err {
            mailhop_dmarc::DmarcError::FromHeader(err) => AuthError::FromHeader(err),
            mailhop_dmarc::DmarcError::Dns(err) => err.into(),
            other => AuthError::Dmarc(other.to_string()),
        }
    }
}
