//! OP code parsing and zone prefix matching
//!
//! An OP code is the hierarchical geographic address used to route delivery
//! tasks, e.g. `PKU-A1-03` (school `PKU`, zone `A1`, building `03`). Zones
//! nest by segment: a courier responsible for `PKU-A1` covers every address
//! whose code starts with those segments.
//!
//! Well-formedness is checked locally; whether a code resolves to a real
//! zone is owned by an external authority, reached through [`OpCodeAuthority`].

use crate::{Error, Result};
use serde::{Deserialize, Serialize};

/// Maximum number of hierarchical segments (city → school → zone → building)
const MAX_SEGMENTS: usize = 4;

/// Maximum length of a single segment
const MAX_SEGMENT_LEN: usize = 8;

/// A validated hierarchical OP code
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OpCode(String);

impl OpCode {
    /// Parse and validate an OP code string.
    ///
    /// Accepts 1-4 dash-separated segments of uppercase alphanumerics.
    pub fn parse(raw: &str) -> Result<Self> {
        let segments: Vec<&str> = raw.split('-').collect();
        if segments.is_empty() || segments.len() > MAX_SEGMENTS {
            return Err(Error::InvalidOpCode(format!(
                "{} has {} segments (expected 1-{})",
                raw,
                segments.len(),
                MAX_SEGMENTS
            )));
        }
        for seg in &segments {
            if seg.is_empty() || seg.len() > MAX_SEGMENT_LEN {
                return Err(Error::InvalidOpCode(format!("{} has a bad segment length", raw)));
            }
            if !seg.chars().all(|c| c.is_ascii_uppercase() || c.is_ascii_digit()) {
                return Err(Error::InvalidOpCode(format!(
                    "{} contains characters outside [A-Z0-9-]",
                    raw
                )));
            }
        }
        Ok(OpCode(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Number of hierarchical segments
    pub fn depth(&self) -> usize {
        self.0.split('-').count()
    }

    /// Segment-wise prefix test: `PKU-A1` covers `PKU-A1-03` but `PKU-A`
    /// does not cover `PKU-A1`.
    pub fn is_prefix_of(&self, other: &OpCode) -> bool {
        let mine: Vec<&str> = self.0.split('-').collect();
        let theirs: Vec<&str> = other.0.split('-').collect();
        mine.len() <= theirs.len() && mine.iter().zip(theirs.iter()).all(|(a, b)| a == b)
    }

    /// True when `self` strictly extends `parent` by at least one segment.
    /// Used to validate subordinate zone assignments.
    pub fn extends(&self, parent: &OpCode) -> bool {
        parent.is_prefix_of(self) && self.depth() > parent.depth()
    }
}

impl std::fmt::Display for OpCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Segment-wise prefix test over raw strings, for SQL-loaded zone codes.
pub fn zone_covers(zone: &str, op_code: &str) -> bool {
    let zone_segs: Vec<&str> = zone.split('-').collect();
    let code_segs: Vec<&str> = op_code.split('-').collect();
    zone_segs.len() <= code_segs.len()
        && zone_segs.iter().zip(code_segs.iter()).all(|(a, b)| a == b)
}

/// External OP code authority client
///
/// The authority confirms that a well-formed code resolves to a real zone.
/// The hub calls it at bind time but does not own its rules. The `Permissive`
/// variant accepts any well-formed code and is used in tests and standalone
/// deployments without an authority service.
#[derive(Clone)]
pub enum OpCodeAuthority {
    /// Accept every well-formed code (local / test deployments)
    Permissive,
    /// Accept only codes from a fixed set (seeded deployments)
    Static(std::collections::HashSet<String>),
    /// Query a remote authority service
    Remote {
        base_url: String,
        client: reqwest::Client,
    },
}

impl OpCodeAuthority {
    pub fn remote(base_url: impl Into<String>) -> Self {
        OpCodeAuthority::Remote {
            base_url: base_url.into(),
            client: reqwest::Client::new(),
        }
    }

    /// Check that `code` is well-formed and resolves to a real zone.
    pub async fn resolve(&self, code: &str) -> Result<OpCode> {
        let parsed = OpCode::parse(code)?;
        match self {
            OpCodeAuthority::Permissive => Ok(parsed),
            OpCodeAuthority::Static(known) => {
                // A code resolves if any known zone covers it
                if known.contains(code) || known.iter().any(|z| zone_covers(z, code)) {
                    Ok(parsed)
                } else {
                    Err(Error::InvalidOpCode(format!("{} does not resolve to a known zone", code)))
                }
            }
            OpCodeAuthority::Remote { base_url, client } => {
                let url = format!("{}/resolve/{}", base_url.trim_end_matches('/'), code);
                let resp = client
                    .get(&url)
                    .send()
                    .await
                    .map_err(|e| Error::Internal(format!("OP code authority unreachable: {}", e)))?;
                if resp.status().is_success() {
                    Ok(parsed)
                } else {
                    Err(Error::InvalidOpCode(format!(
                        "{} rejected by authority ({})",
                        code,
                        resp.status()
                    )))
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_valid_codes() {
        assert!(OpCode::parse("PKU").is_ok());
        assert!(OpCode::parse("PKU-A1").is_ok());
        assert!(OpCode::parse("PKU-A1-03").is_ok());
        assert!(OpCode::parse("BJ-PKU-A1-03").is_ok());
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert!(OpCode::parse("").is_err());
        assert!(OpCode::parse("pku-a1").is_err());
        assert!(OpCode::parse("PKU--03").is_err());
        assert!(OpCode::parse("PKU-A1-03-XX-YY").is_err());
        assert!(OpCode::parse("PKU_A1").is_err());
        assert!(OpCode::parse("TOOLONGSEG9").is_err());
    }

    #[test]
    fn test_prefix_is_segment_wise() {
        let zone = OpCode::parse("PKU-A1").unwrap();
        let building = OpCode::parse("PKU-A1-03").unwrap();
        let sibling = OpCode::parse("PKU-A2-03").unwrap();

        assert!(zone.is_prefix_of(&building));
        assert!(zone.is_prefix_of(&zone));
        assert!(!zone.is_prefix_of(&sibling));

        // "PKU-A" is not a segment prefix of "PKU-A1"
        let partial = OpCode::parse("PKU-A").unwrap();
        assert!(!partial.is_prefix_of(&zone));
    }

    #[test]
    fn test_extends_requires_strictly_deeper() {
        let parent = OpCode::parse("PKU").unwrap();
        let child = OpCode::parse("PKU-A1").unwrap();
        assert!(child.extends(&parent));
        assert!(!parent.extends(&child));
        assert!(!parent.extends(&parent));
    }

    #[test]
    fn test_zone_covers_raw() {
        assert!(zone_covers("PKU-A1", "PKU-A1-03"));
        assert!(zone_covers("PKU", "PKU-A1-03"));
        assert!(!zone_covers("PKU-A1-03", "PKU-A1"));
        assert!(!zone_covers("PKU-A2", "PKU-A1-03"));
    }

    #[tokio::test]
    async fn test_permissive_authority_accepts_well_formed() {
        let authority = OpCodeAuthority::Permissive;
        assert!(authority.resolve("PKU-A1-03").await.is_ok());
        assert!(authority.resolve("pku").await.is_err());
    }

    #[tokio::test]
    async fn test_static_authority_requires_known_zone() {
        let mut known = std::collections::HashSet::new();
        known.insert("PKU-A1".to_string());
        let authority = OpCodeAuthority::Static(known);

        assert!(authority.resolve("PKU-A1-03").await.is_ok());
        assert!(authority.resolve("PKU-A1").await.is_ok());
        assert!(authority.resolve("THU-B2").await.is_err());
    }
}
