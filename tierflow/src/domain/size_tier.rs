//! Size tiers and the byte-size classifier.

use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::Error;

/// One mebibyte.
pub const MIB: u64 = 1024 * 1024;

/// Coarse bucket selecting how much remote compute a file is allocated.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum SizeTier {
    #[default]
    #[serde(alias = "lambda")]
    Small,
    Medium,
    Large,
    Xlarge,
}

impl SizeTier {
    /// Every tier, smallest first.
    pub const ALL: [SizeTier; 4] = [Self::Small, Self::Medium, Self::Large, Self::Xlarge];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Small => "small",
            Self::Medium => "medium",
            Self::Large => "large",
            Self::Xlarge => "xlarge",
        }
    }
}

impl std::fmt::Display for SizeTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for SizeTier {
    type Err = Error;

    /// Accepts the tier names case-insensitively, plus `lambda` which older
    /// producers used for the small tier.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "small" | "lambda" => Ok(Self::Small),
            "medium" => Ok(Self::Medium),
            "large" => Ok(Self::Large),
            "xlarge" => Ok(Self::Xlarge),
            other => Err(Error::config(format!("unknown size tier '{other}'"))),
        }
    }
}

/// Lower bounds (inclusive) of the three upper tiers, in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierThresholds {
    #[serde(default = "default_medium_min_bytes")]
    pub medium_min_bytes: u64,
    #[serde(default = "default_large_min_bytes")]
    pub large_min_bytes: u64,
    #[serde(default = "default_xlarge_min_bytes")]
    pub xlarge_min_bytes: u64,
}

fn default_medium_min_bytes() -> u64 {
    50 * MIB
}

fn default_large_min_bytes() -> u64 {
    200 * MIB
}

fn default_xlarge_min_bytes() -> u64 {
    500 * MIB
}

impl Default for TierThresholds {
    fn default() -> Self {
        Self {
            medium_min_bytes: default_medium_min_bytes(),
            large_min_bytes: default_large_min_bytes(),
            xlarge_min_bytes: default_xlarge_min_bytes(),
        }
    }
}

impl TierThresholds {
    /// Thresholds must be strictly increasing and non-zero.
    pub fn validate(&self) -> crate::Result<()> {
        if self.medium_min_bytes == 0
            || self.medium_min_bytes >= self.large_min_bytes
            || self.large_min_bytes >= self.xlarge_min_bytes
        {
            return Err(Error::config(format!(
                "tier thresholds must be strictly increasing and non-zero (got {}, {}, {})",
                self.medium_min_bytes, self.large_min_bytes, self.xlarge_min_bytes
            )));
        }
        Ok(())
    }
}

/// Maps a byte size to a [`SizeTier`] using half-open `[lower, upper)` intervals.
#[derive(Debug, Clone, Copy, Default)]
pub struct SizeClassifier {
    thresholds: TierThresholds,
}

impl SizeClassifier {
    pub fn new(thresholds: TierThresholds) -> Self {
        Self { thresholds }
    }

    pub fn thresholds(&self) -> &TierThresholds {
        &self.thresholds
    }

    pub fn classify(&self, size_bytes: u64) -> SizeTier {
        let t = &self.thresholds;
        if size_bytes >= t.xlarge_min_bytes {
            SizeTier::Xlarge
        } else if size_bytes >= t.large_min_bytes {
            SizeTier::Large
        } else if size_bytes >= t.medium_min_bytes {
            SizeTier::Medium
        } else {
            SizeTier::Small
        }
    }

    /// An explicit tier wins over the size-based classification.
    pub fn resolve(&self, size_bytes: u64, explicit: Option<SizeTier>) -> SizeTier {
        explicit.unwrap_or_else(|| self.classify(size_bytes))
    }
}

/// Classify with the default 50/200/500 MiB thresholds.
pub fn classify(size_bytes: u64) -> SizeTier {
    SizeClassifier::default().classify(size_bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(0, SizeTier::Small)]
    #[case(30 * 1000 * 1000, SizeTier::Small)]
    #[case(50 * MIB - 1, SizeTier::Small)]
    #[case(50 * MIB, SizeTier::Medium)]
    #[case(200 * MIB - 1, SizeTier::Medium)]
    #[case(200 * MIB, SizeTier::Large)]
    #[case(500 * MIB - 1, SizeTier::Large)]
    #[case(500 * MIB, SizeTier::Xlarge)]
    #[case(u64::MAX, SizeTier::Xlarge)]
    fn test_classify_boundaries(#[case] size: u64, #[case] expected: SizeTier) {
        assert_eq!(classify(size), expected);
    }

    #[test]
    fn test_classify_is_monotonic() {
        let mut previous = SizeTier::Small;
        let mut size = 0u64;
        while size <= 600 * MIB {
            let tier = classify(size);
            assert!(tier >= previous, "tier went down at {size}");
            previous = tier;
            size += MIB / 4;
        }
        assert_eq!(previous, SizeTier::Xlarge);
    }

    #[test]
    fn test_explicit_tier_wins() {
        let classifier = SizeClassifier::default();
        assert_eq!(classifier.resolve(10, Some(SizeTier::Large)), SizeTier::Large);
        assert_eq!(classifier.resolve(600 * MIB, None), SizeTier::Xlarge);
    }

    #[test]
    fn test_custom_thresholds() {
        let classifier = SizeClassifier::new(TierThresholds {
            medium_min_bytes: 10,
            large_min_bytes: 20,
            xlarge_min_bytes: 30,
        });
        assert_eq!(classifier.classify(9), SizeTier::Small);
        assert_eq!(classifier.classify(10), SizeTier::Medium);
        assert_eq!(classifier.classify(29), SizeTier::Large);
        assert_eq!(classifier.classify(30), SizeTier::Xlarge);
    }

    #[test]
    fn test_threshold_validation() {
        assert!(TierThresholds::default().validate().is_ok());
        let bad = TierThresholds {
            medium_min_bytes: 200,
            large_min_bytes: 200,
            xlarge_min_bytes: 500,
        };
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_tier_parsing() {
        assert_eq!("XLarge".parse::<SizeTier>().unwrap(), SizeTier::Xlarge);
        assert_eq!("lambda".parse::<SizeTier>().unwrap(), SizeTier::Small);
        assert!("huge".parse::<SizeTier>().is_err());

        let tier: SizeTier = serde_json::from_str("\"medium\"").unwrap();
        assert_eq!(tier, SizeTier::Medium);
        assert_eq!(serde_json::to_string(&SizeTier::Xlarge).unwrap(), "\"xlarge\"");
    }
}
