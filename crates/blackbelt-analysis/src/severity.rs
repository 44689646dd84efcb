//! Issue and report severity levels.

use serde::{Deserialize, Serialize};

/// Severity of one parameter group or a whole report.
///
/// Ordering is by operational urgency, `Critical` highest, so reports
/// can sort with plain comparisons.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Severity {
    #[serde(rename = "NORMAL")]
    Normal,
    #[serde(rename = "WARNING")]
    Warning,
    #[serde(rename = "HIGH")]
    High,
    #[serde(rename = "CRITICAL")]
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Normal => "NORMAL",
            Self::Warning => "WARNING",
            Self::High => "HIGH",
            Self::Critical => "CRITICAL",
        }
    }
}

/// Classify a parameter group from its SPC outcome.
///
/// The out-of-control status dominates; capability bands follow.
pub fn classify(process_status: &str, cpk: Option<f64>, violation_count: usize) -> Severity {
    if process_status == "失控" {
        return Severity::Critical;
    }
    match cpk {
        Some(cpk) if cpk < 0.8 => Severity::Critical,
        Some(cpk) if cpk < 1.0 => Severity::High,
        Some(cpk) if cpk < 1.33 => Severity::Warning,
        _ if violation_count > 0 => Severity::Warning,
        _ => Severity::Normal,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn out_of_control_dominates_capability() {
        assert_eq!(classify("失控", Some(2.0), 0), Severity::Critical);
    }

    #[test]
    fn capability_bands_classify_in_control_groups() {
        assert_eq!(classify("受控", Some(0.7), 0), Severity::Critical);
        assert_eq!(classify("警告", Some(0.9), 0), Severity::High);
        assert_eq!(classify("警告", Some(1.2), 0), Severity::Warning);
        assert_eq!(classify("受控", Some(1.5), 0), Severity::Normal);
    }

    #[test]
    fn violations_without_cpk_are_a_warning() {
        assert_eq!(classify("受控", None, 2), Severity::Warning);
        assert_eq!(classify("受控", None, 0), Severity::Normal);
    }

    #[test]
    fn ordering_matches_urgency() {
        assert!(Severity::Critical > Severity::High);
        assert!(Severity::High > Severity::Warning);
        assert!(Severity::Warning > Severity::Normal);
    }
}
