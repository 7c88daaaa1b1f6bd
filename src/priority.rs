use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

/// Priority of a recommendation as assigned by the producer.
/// Higher values sort first in a batch wave.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum Priority {
    /// No or unrecognised priority (0)
    #[default]
    Normal = 0,
    /// "low" (1)
    Low = 1,
    /// "medium" (2)
    Medium = 2,
    /// "high" (3)
    High = 3,
    /// "critical" (10)
    Critical = 10,
}

impl Priority {
    /// Parse a priority leniently: accepts names in any case, `p0`..`p3`
    /// style tags, and bare numbers 1 (highest) to 4 (lowest).
    pub fn parse_lenient(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "critical" | "urgent" | "p0" | "1" => Priority::Critical,
            "high" | "p1" | "2" => Priority::High,
            "medium" | "med" | "normal-high" | "p2" | "3" => Priority::Medium,
            "low" | "p3" | "4" => Priority::Low,
            _ => Priority::Normal,
        }
    }

    /// Get the numeric priority value
    pub fn value(self) -> u32 {
        self as u32
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Priority::Critical => "critical",
            Priority::High => "high",
            Priority::Medium => "medium",
            Priority::Low => "low",
            Priority::Normal => "normal",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Priority::Critical => "CRITICAL",
            Priority::High => "HIGH",
            Priority::Medium => "MEDIUM",
            Priority::Low => "LOW",
            Priority::Normal => "NORMAL",
        };
        write!(f, "{}", label)
    }
}

impl Serialize for Priority {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Priority {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = serde_json::Value::deserialize(deserializer)?;
        Ok(match value {
            serde_json::Value::String(s) => Priority::parse_lenient(&s),
            serde_json::Value::Number(n) => Priority::parse_lenient(&n.to_string()),
            _ => Priority::Normal,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_parse_lenient() {
        assert_eq!(Priority::parse_lenient("CRITICAL"), Priority::Critical);
        assert_eq!(Priority::parse_lenient("p1"), Priority::High);
        assert_eq!(Priority::parse_lenient(" Medium "), Priority::Medium);
        assert_eq!(Priority::parse_lenient("4"), Priority::Low);
        assert_eq!(Priority::parse_lenient("whenever"), Priority::Normal);
        assert_eq!(Priority::parse_lenient(""), Priority::Normal);
    }

    #[test]
    fn test_priority_ordering() {
        assert!(Priority::Critical > Priority::High);
        assert!(Priority::High > Priority::Medium);
        assert!(Priority::Medium > Priority::Low);
        assert!(Priority::Low > Priority::Normal);
    }

    #[test]
    fn test_priority_serde() {
        let p: Priority = serde_json::from_str("\"High\"").unwrap();
        assert_eq!(p, Priority::High);
        let p: Priority = serde_json::from_str("1").unwrap();
        assert_eq!(p, Priority::Critical);
        assert_eq!(serde_json::to_string(&Priority::Low).unwrap(), "\"low\"");
    }

    #[test]
    fn test_priority_display() {
        assert_eq!(Priority::Critical.to_string(), "CRITICAL");
        assert_eq!(Priority::Normal.to_string(), "NORMAL");
    }
}
