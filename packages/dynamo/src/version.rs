//! Semantic engine versions.

use std::fmt;
use std::str::FromStr;

use lazy_static::lazy_static;
use regex::Regex;

use crate::error::IngressError;

lazy_static! {
    static ref VERSION_PATTERN: Regex = Regex::new(r"^(\d+)\.(\d+)\.(\d+)$").unwrap();
}

/// A `major.minor.patch` version number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Version {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl Version {
    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

impl FromStr for Version {
    type Err = IngressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bad = || IngressError::BadArguments(format!("invalid version string '{s}'"));
        let captures = VERSION_PATTERN.captures(s.trim()).ok_or_else(bad)?;
        let component = |index: usize| -> Result<u32, IngressError> {
            captures[index].parse().map_err(|_| bad())
        };
        Ok(Self::new(component(1)?, component(2)?, component(3)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_parse() {
        assert_eq!("0.1.0".parse::<Version>().unwrap(), Version::new(0, 1, 0));
        assert_eq!(" 12.3.45 ".parse::<Version>().unwrap(), Version::new(12, 3, 45));
    }

    #[test]
    fn version_parse_rejects_garbage() {
        for text in ["", "1", "1.2", "1.2.x", "1.2.3.4", "v1.2.3", "99999999999.0.0"] {
            assert!(
                matches!(text.parse::<Version>(), Err(IngressError::BadArguments(_))),
                "{text} should not parse"
            );
        }
    }

    #[test]
    fn version_ordering() {
        assert!(Version::new(0, 1, 0) < Version::new(0, 1, 1));
        assert!(Version::new(0, 9, 9) < Version::new(1, 0, 0));
        assert!(Version::new(2, 0, 0) > Version::new(1, 99, 99));
    }

    #[test]
    fn version_display() {
        assert_eq!(Version::new(1, 2, 3).to_string(), "1.2.3");
    }
}
