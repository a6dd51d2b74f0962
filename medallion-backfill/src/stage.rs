//! The static stage registry.
//!
//! Each pipeline stage maps to a fixed external executable identity: a
//! container image tag and the sub-command the image is launched with. The
//! mapping is defined at compile time so the command set is auditable and
//! testable without any filesystem discovery.

use std::fmt;
use std::str::FromStr;

/// A pipeline stage in medallion order.
///
/// Stages are expected to be backfilled in declaration order:
/// ingestors -> processors -> indicators -> publishers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    /// Raw market/economic data into the landing zone and bronze tier.
    Ingestors,
    /// Rolling features from bronze into silver.
    Processors,
    /// Cross-asset ratios derived into silver.
    Indicators,
    /// Final rows upserted into the operational gold table.
    Publishers,
}

impl Stage {
    /// All stages, in pipeline order.
    pub const ALL: [Self; 4] = [
        Self::Ingestors,
        Self::Processors,
        Self::Indicators,
        Self::Publishers,
    ];

    /// Returns the canonical stage name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ingestors => "ingestors",
            Self::Processors => "processors",
            Self::Indicators => "indicators",
            Self::Publishers => "publishers",
        }
    }

    /// Returns the container image tag for this stage.
    #[must_use]
    pub fn image_tag(self) -> &'static str {
        match self {
            Self::Ingestors => "pipeline-ingestors",
            Self::Processors => "pipeline-processors",
            Self::Indicators => "pipeline-indicators",
            Self::Publishers => "pipeline-publishers",
        }
    }

    /// Returns the fixed sub-command the stage container is launched with.
    #[must_use]
    pub fn command(self) -> &'static [&'static str] {
        match self {
            Self::Ingestors => &["ingestors", "massive"],
            Self::Processors => &["processors", "stock_features_daily"],
            Self::Indicators => &["indicators", "spx_gold_daily"],
            Self::Publishers => &["publishers", "spx_gold_trend"],
        }
    }

    /// Returns true if this stage accepts a series identifier.
    ///
    /// Only the ingestors stage forwards `--series-id` to its runner; the
    /// option is ignored everywhere else.
    #[must_use]
    pub fn accepts_series_id(self) -> bool {
        matches!(self, Self::Ingestors)
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ingestors" => Ok(Self::Ingestors),
            "processors" => Ok(Self::Processors),
            "indicators" => Ok(Self::Indicators),
            "publishers" => Ok(Self::Publishers),
            other => Err(format!(
                "unknown stage '{other}' (expected one of: ingestors, processors, indicators, publishers)"
            )),
        }
    }
}
