//! Calibration Strata
//!
//! A stratum `(propertyType, ageBin, region)` partitions calibration data and
//! coverage accounting. Strata form a three-level hierarchy used for Mondrian
//! fallback: leaf -> parent (region dropped) -> global (age and region dropped).

use serde::{Deserialize, Serialize};
use std::fmt;

/// Wildcard used for dropped components at broader levels
pub const ANY: &str = "*";

/// Property age bucket
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgeBin {
    /// 0-20 years
    New,
    /// 20-50 years
    Established,
    /// 50-100 years
    Old,
    /// 100+ years
    Historic,
}

impl AgeBin {
    pub fn from_age(age_years: f64) -> Self {
        let age = if age_years.is_finite() { age_years.max(0.0) } else { 0.0 };
        if age < 20.0 {
            Self::New
        } else if age < 50.0 {
            Self::Established
        } else if age < 100.0 {
            Self::Old
        } else {
            Self::Historic
        }
    }

    /// Encoded value used in the context vector
    pub fn encoded(&self) -> f64 {
        match self {
            Self::New => 0.1,
            Self::Established => 0.3,
            Self::Old => 0.6,
            Self::Historic => 0.9,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::New => "0-20",
            Self::Established => "20-50",
            Self::Old => "50-100",
            Self::Historic => "100+",
        }
    }
}

/// Level within the stratum hierarchy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StratumLevel {
    Leaf,
    Parent,
    Global,
}

/// Calibration partition key
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Stratum {
    pub property_type: String,
    /// `None` at the global level
    pub age_bin: Option<AgeBin>,
    /// `None` at the parent and global levels
    pub region: Option<String>,
}

impl Stratum {
    pub fn leaf(property_type: impl Into<String>, age_bin: AgeBin, region: impl Into<String>) -> Self {
        Self {
            property_type: normalize(property_type.into()),
            age_bin: Some(age_bin),
            region: Some(normalize(region.into())),
        }
    }

    pub fn level(&self) -> StratumLevel {
        match (&self.age_bin, &self.region) {
            (Some(_), Some(_)) => StratumLevel::Leaf,
            (Some(_), None) => StratumLevel::Parent,
            _ => StratumLevel::Global,
        }
    }

    /// Drop region
    pub fn parent(&self) -> Self {
        Self {
            property_type: self.property_type.clone(),
            age_bin: self.age_bin,
            region: None,
        }
    }

    /// Drop age bin and region
    pub fn global(&self) -> Self {
        Self {
            property_type: self.property_type.clone(),
            age_bin: None,
            region: None,
        }
    }

    /// Most specific first: leaf, parent, global
    pub fn hierarchy(&self) -> [Stratum; 3] {
        let leaf = Self {
            property_type: self.property_type.clone(),
            age_bin: self.age_bin,
            region: self.region.clone(),
        };
        [leaf, self.parent(), self.global()]
    }

    /// Whether a point recorded under `leaf` belongs to this (possibly broader) stratum
    pub fn contains(&self, leaf: &Stratum) -> bool {
        if self.property_type != leaf.property_type {
            return false;
        }
        if let Some(bin) = self.age_bin {
            if leaf.age_bin != Some(bin) {
                return false;
            }
        }
        if let Some(region) = &self.region {
            if leaf.region.as_deref() != Some(region.as_str()) {
                return false;
            }
        }
        true
    }

    /// Stable string key for maps and storage
    pub fn key(&self) -> String {
        format!(
            "{}|{}|{}",
            self.property_type,
            self.age_bin.map(|b| b.as_str()).unwrap_or(ANY),
            self.region.as_deref().unwrap_or(ANY)
        )
    }
}

impl fmt::Display for Stratum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key())
    }
}

fn normalize(s: String) -> String {
    let trimmed = s.trim().to_lowercase();
    if trimmed.is_empty() {
        "unknown".to_string()
    } else {
        trimmed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_age_bins() {
        assert_eq!(AgeBin::from_age(5.0), AgeBin::New);
        assert_eq!(AgeBin::from_age(20.0), AgeBin::Established);
        assert_eq!(AgeBin::from_age(75.0), AgeBin::Old);
        assert_eq!(AgeBin::from_age(140.0), AgeBin::Historic);
        assert_eq!(AgeBin::from_age(f64::NAN), AgeBin::New);
        assert_eq!(AgeBin::Old.encoded(), 0.6);
    }

    #[test]
    fn test_hierarchy_drops_components() {
        let leaf = Stratum::leaf("Residential", AgeBin::Old, "London");
        let [l, p, g] = leaf.hierarchy();
        assert_eq!(l.level(), StratumLevel::Leaf);
        assert_eq!(p.level(), StratumLevel::Parent);
        assert_eq!(g.level(), StratumLevel::Global);
        assert_eq!(p.key(), "residential|50-100|*");
        assert_eq!(g.key(), "residential|*|*");
    }

    #[test]
    fn test_contains() {
        let a = Stratum::leaf("residential", AgeBin::Old, "london");
        let b = Stratum::leaf("residential", AgeBin::Old, "leeds");
        let c = Stratum::leaf("residential", AgeBin::New, "london");

        assert!(a.contains(&a));
        assert!(!a.contains(&b));
        assert!(a.parent().contains(&b));
        assert!(!a.parent().contains(&c));
        assert!(a.global().contains(&c));
        assert!(!a.global().contains(&Stratum::leaf("commercial", AgeBin::Old, "london")));
    }
}
