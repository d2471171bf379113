use std::error::Error;
use std::fmt::{Display, Formatter, Result as FmtResult};
use std::str::FromStr;

use serde::de::{self, Deserialize, Deserializer};
use serde::Serialize;

/// Optional variant selector on a port.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
pub struct Flavor(String);

impl Flavor {
    pub fn new<S: Into<String>>(flavor: S) -> Result<Flavor, InvalidFlavor> {
        let s = flavor.into();
        if s.is_empty() {
            return Err(InvalidFlavor(s));
        }

        let allowed_chars = s
            .chars()
            .all(|c| c.is_alphanumeric() || c == '-' || c == '_' || c == '.');

        if !allowed_chars {
            return Err(InvalidFlavor(s));
        }

        Ok(Flavor(s))
    }

    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for Flavor {
    fn fmt(&self, fmt: &mut Formatter) -> FmtResult {
        write!(fmt, "{}", self.0)
    }
}

impl FromStr for Flavor {
    type Err = InvalidFlavor;

    #[inline]
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Flavor::new(s)
    }
}

impl<'de> Deserialize<'de> for Flavor {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s: String = Deserialize::deserialize(deserializer)?;
        Flavor::new(s).map_err(de::Error::custom)
    }
}

/// Text form was not a valid flavor name.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct InvalidFlavor(pub String);

impl Display for InvalidFlavor {
    fn fmt(&self, fmt: &mut Formatter) -> FmtResult {
        write!(fmt, "invalid port flavor `{}`", self.0)
    }
}

impl Error for InvalidFlavor {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_valid_flavors() {
        Flavor::new("py39").expect("Failed to parse alphanumeric flavor");
        Flavor::new("no_x11").expect("Failed to parse flavor with underscore");
    }

    #[test]
    fn reject_invalid_flavors() {
        Flavor::new("").expect_err("Failed to reject empty flavor");
        Flavor::new("py 39").expect_err("Failed to reject flavor with space");
        Flavor::new("a@b").expect_err("Failed to reject flavor with separator char");
    }
}
