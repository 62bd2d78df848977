use crate::types::policy::Policy;
use std::fmt;

/// Outcome of DMARC evaluation for a message.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DmarcResult {
    /// No DMARC record is published for the From domain
    None,
    Pass,
    Fail,
}

impl DmarcResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Pass => "pass",
            Self::Fail => "fail",
        }
    }
}

impl fmt::Display for DmarcResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// The evaluation result together with the policy the domain owner
/// published (when a record was found) and the From domain it applies to.
#[derive(Debug)]
pub struct DmarcOutcome {
    pub result: DmarcResult,
    pub policy: Option<Policy>,
    pub from_domain: String,
}
