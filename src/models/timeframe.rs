use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Timeframe {
    #[serde(rename = "M1")]
    M1,
    #[serde(rename = "M5")]
    M5,
    #[serde(rename = "M15")]
    M15,
    #[serde(rename = "H1")]
    H1,
    #[serde(rename = "H4")]
    H4,
    #[serde(rename = "D1")]
    D1,
}

impl Timeframe {
    pub fn as_str(&self) -> &'static str {
        match self {
            Timeframe::M1 => "M1",
            Timeframe::M5 => "M5",
            Timeframe::M15 => "M15",
            Timeframe::H1 => "H1",
            Timeframe::H4 => "H4",
            Timeframe::D1 => "D1",
        }
    }

    pub fn as_duration(&self) -> Duration {
        match self {
            Timeframe::M1 => Duration::from_secs(60),
            Timeframe::M5 => Duration::from_secs(300),
            Timeframe::M15 => Duration::from_secs(900),
            Timeframe::H1 => Duration::from_secs(3600),
            Timeframe::H4 => Duration::from_secs(14400),
            Timeframe::D1 => Duration::from_secs(86400),
        }
    }

    /// Accepts both terminal codes ("H1") and short forms ("1h").
    pub fn from_str_loose(s: &str) -> Option<Timeframe> {
        match s.trim().to_uppercase().as_str() {
            "M1" | "1M" => Some(Timeframe::M1),
            "M5" | "5M" => Some(Timeframe::M5),
            "M15" | "15M" => Some(Timeframe::M15),
            "H1" | "1H" => Some(Timeframe::H1),
            "H4" | "4H" => Some(Timeframe::H4),
            "D1" | "1D" => Some(Timeframe::D1),
            _ => None,
        }
    }

    /// Parse a comma separated list, skipping unknown entries.
    pub fn parse_list(s: &str) -> Vec<Timeframe> {
        let mut tfs: Vec<Timeframe> = s.split(',').filter_map(Timeframe::from_str_loose).collect();
        tfs.sort();
        tfs.dedup();
        tfs
    }

    pub fn as_seconds(&self) -> u64 {
        self.as_duration().as_secs()
    }
}

impl fmt::Display for Timeframe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
