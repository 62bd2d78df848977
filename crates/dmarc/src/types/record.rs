use crate::types::mode::Mode;
use crate::types::policy::Policy;
use std::str::FromStr;

/// A published DMARC record, from the TXT data at `_dmarc.{domain}`.
///
/// Only the tags that drive policy evaluation are modelled; reporting
/// tags and tags this evaluator does not understand are skipped.
#[derive(Debug)]
pub struct Record {
    pub align_dkim: Mode,
    pub align_spf: Mode,
    pub policy: Policy,
    pub subdomain_policy: Policy,
    pub rate: u8,
}

impl FromStr for Record {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut new = Self {
            align_dkim: Mode::Relaxed,
            align_spf: Mode::Relaxed,
            policy: Policy::None,
            subdomain_policy: Policy::None,
            rate: 100,
        };

        let mut version = false;
        for part in s.split(';') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            let Some((key, value)) = part.split_once('=') else {
                return Err(format!("invalid part {part:?}"));
            };

            let (key, value) = (key.trim(), value.trim());
            if !version {
                // The version tag is required to lead the record
                match (key, value) {
                    ("v", "DMARC1") => {
                        version = true;
                        continue;
                    }
                    _ => return Err(format!("expected v=DMARC1, got {part:?}")),
                }
            }

            match key {
                "p" => {
                    new.policy = Policy::from_str(value)?;
                    new.subdomain_policy = new.policy;
                }
                "sp" => new.subdomain_policy = Policy::from_str(value)?,
                "adkim" => new.align_dkim = Mode::from_str(value)?,
                "aspf" => new.align_spf = Mode::from_str(value)?,
                "pct" => {
                    new.rate = u8::from_str(value)
                        .map_err(|_| format!("invalid value {value:?} for pct"))?
                }
                _ => {
                    // rua/ruf/fo/rf/ri and future extensions
                    tracing::debug!("ignoring DMARC tag {key}={value}");
                }
            }
        }

        if version {
            Ok(new)
        } else {
            Err(format!("missing v=DMARC1 in {s:?}"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_minimal() {
        let record = Record::from_str("v=DMARC1; p=none").unwrap();
        k9::assert_equal!(record.policy, Policy::None);
        k9::assert_equal!(record.align_dkim, Mode::Relaxed);
        k9::assert_equal!(record.align_spf, Mode::Relaxed);
        k9::assert_equal!(record.rate, 100);
    }

    #[test]
    fn parse_with_alignment() {
        let record = Record::from_str("v=DMARC1; p=reject; aspf=s; adkim=r; pct=25").unwrap();
        k9::assert_equal!(record.policy, Policy::Reject);
        k9::assert_equal!(record.align_spf, Mode::Strict);
        k9::assert_equal!(record.align_dkim, Mode::Relaxed);
        k9::assert_equal!(record.rate, 25);
    }

    #[test]
    fn parse_ignores_reporting_tags() {
        // https://www.rfc-editor.org/rfc/rfc7489#appendix-B.2.2
        let record = Record::from_str(
            "v=DMARC1; p=quarantine; rua=mailto:dmarc-feedback@example.com; \
             ruf=mailto:auth-reports@example.com",
        )
        .unwrap();
        k9::assert_equal!(record.policy, Policy::Quarantine);
        k9::assert_equal!(record.subdomain_policy, Policy::Quarantine);
    }

    #[test]
    fn parse_subdomain_policy() {
        let record = Record::from_str("v=DMARC1; p=reject; sp=none").unwrap();
        k9::assert_equal!(record.policy, Policy::Reject);
        k9::assert_equal!(record.subdomain_policy, Policy::None);
    }

    #[test]
    fn parse_rejects_bad_alignment_flag() {
        assert!(Record::from_str("v=DMARC1; p=none; aspf=x").is_err());
    }

    #[test]
    fn parse_requires_leading_version() {
        assert!(Record::from_str("p=none; v=DMARC1").is_err());
        assert!(Record::from_str("p=none").is_err());
    }
}
