use serde::{Deserialize, Serialize};

/// Execution channel a task is routed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Lane {
    High,
    Default,
    Low,
}

impl Lane {
    pub const ALL: [Lane; 3] = [Lane::High, Lane::Default, Lane::Low];

    /// `>= 8` high, `4..=7` default, everything below low. Total over `i64`.
    pub fn for_priority(priority: i64) -> Self {
        if priority >= 8 {
            Lane::High
        } else if priority >= 4 {
            Lane::Default
        } else {
            Lane::Low
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Lane::High => "high",
            Lane::Default => "default",
            Lane::Low => "low",
        }
    }
}

impl std::fmt::Display for Lane {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Lane {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "high" => Ok(Lane::High),
            "default" => Ok(Lane::Default),
            "low" => Ok(Lane::Low),
            other => Err(format!("unknown lane: {other}")),
        }
    }
}
