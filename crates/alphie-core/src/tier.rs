use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Complexity class of a task. Parameterizes critique iteration limits,
/// score thresholds, soft timeouts, and the default model.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Scout,
    Builder,
    Architect,
}

impl Tier {
    pub const ALL: [Tier; 3] = [Tier::Scout, Tier::Builder, Tier::Architect];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Scout => "scout",
            Self::Builder => "builder",
            Self::Architect => "architect",
        }
    }

    /// Case-insensitive lookup. Unknown names yield `None` so callers can
    /// apply their own fallback.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "scout" => Some(Self::Scout),
            "builder" => Some(Self::Builder),
            "architect" => Some(Self::Architect),
            _ => None,
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown tier: {0}")]
pub struct UnknownTier(pub String);

impl FromStr for Tier {
    type Err = UnknownTier;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s).ok_or_else(|| UnknownTier(s.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_is_case_insensitive() {
        assert_eq!(Tier::parse("Builder"), Some(Tier::Builder));
        assert_eq!(Tier::parse(" ARCHITECT "), Some(Tier::Architect));
        assert_eq!(Tier::parse("wizard"), None);
    }

    #[test]
    fn from_str_reports_unknown() {
        let err = "wizard".parse::<Tier>().unwrap_err();
        assert_eq!(err.to_string(), "unknown tier: wizard");
    }

    #[test]
    fn serde_snake_case() {
        assert_eq!(serde_json::to_string(&Tier::Scout).unwrap(), "\"scout\"");
    }
}
