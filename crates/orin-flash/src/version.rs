use std::fmt;

use crate::error::{Error, Result};

/// A Jetson Linux release version (e.g. `36.4.4`), used to derive the
/// download path and artifact names of a BSP release.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReleaseVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl ReleaseVersion {
    /// Parses a dotted release version. The string must contain only digits
    /// and dots, and must split into exactly three numeric components.
    /// Strings like `36.4.4a` fail on the non-digit, and `1.2.3.4` fails on
    /// the component count rather than silently dropping the extra token.
    pub fn parse(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(Error::msg("release version is empty"));
        }

        let squashed: String = raw.chars().filter(|c| *c != '.').collect();
        if squashed.is_empty() || !squashed.chars().all(|c| c.is_ascii_digit()) {
            return Err(Error::msg(format!(
                "invalid release version '{raw}' (only digits and dots are allowed)"
            )));
        }

        let parts: Vec<&str> = raw.split('.').collect();
        if parts.len() != 3 || parts.iter().any(|p| p.is_empty()) {
            return Err(Error::msg(format!(
                "invalid release version '{raw}' (expected MAJOR.MINOR.PATCH)"
            )));
        }

        let num = |s: &str| -> Result<u32> {
            s.parse::<u32>()
                .map_err(|e| Error::msg(format!("invalid release version '{raw}': {e}")))
        };

        Ok(Self {
            major: num(parts[0])?,
            minor: num(parts[1])?,
            patch: num(parts[2])?,
        })
    }
}

impl fmt::Display for ReleaseVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

#[cfg(test)]
mod tests {
    use super::ReleaseVersion;

    #[test]
    fn parses_three_numeric_components() {
        let v = ReleaseVersion::parse("36.4.4").expect("valid version");
        assert_eq!((v.major, v.minor, v.patch), (36, 4, 4));
        assert_eq!(v.to_string(), "36.4.4");
    }

    #[test]
    fn rejects_non_digit_characters() {
        assert!(ReleaseVersion::parse("36.4.4a").is_err());
        assert!(ReleaseVersion::parse("r36.4.4").is_err());
        assert!(ReleaseVersion::parse("36.4-4").is_err());
    }

    #[test]
    fn rejects_wrong_component_counts() {
        assert!(ReleaseVersion::parse("1.2").is_err());
        assert!(ReleaseVersion::parse("1.2.3.4").is_err());
        assert!(ReleaseVersion::parse("1..3").is_err());
        assert!(ReleaseVersion::parse(".1.2").is_err());
        assert!(ReleaseVersion::parse("").is_err());
    }
}
