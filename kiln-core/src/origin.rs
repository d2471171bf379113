use std::error::Error;
use std::fmt::{Display, Formatter, Result as FmtResult};
use std::str::FromStr;

use serde::de::{self, Deserialize, Deserializer};
use serde::Serialize;

/// `category/name` path identifying one port in the tree.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
#[serde(into = "String")]
pub struct Origin {
    category: String,
    name: String,
}

impl Origin {
    /// Creates an origin from separate category and name components.
    pub fn new<S: Into<String>>(category: S, name: S) -> Result<Origin, InvalidOrigin> {
        let category = category.into();
        let name = name.into();

        if !is_valid_component(&category) || !is_valid_component(&name) {
            return Err(InvalidOrigin(format!("{}/{}", category, name)));
        }

        Ok(Origin { category, name })
    }

    #[inline]
    pub fn category(&self) -> &str {
        &self.category
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Filesystem-safe form used to name per-port log files.
    pub fn as_log_stem(&self) -> String {
        format!("{}___{}", self.category, self.name)
    }
}

fn is_valid_component(s: &str) -> bool {
    let allowed_chars = s
        .chars()
        .all(|c| c.is_alphanumeric() || c == '-' || c == '_' || c == '.' || c == '+');

    let reserved = match s {
        "" | "." | ".." => true,
        _ => false,
    };

    allowed_chars && !reserved
}

impl Display for Origin {
    fn fmt(&self, fmt: &mut Formatter) -> FmtResult {
        write!(fmt, "{}/{}", self.category, self.name)
    }
}

impl From<Origin> for String {
    fn from(origin: Origin) -> String {
        origin.to_string()
    }
}

impl FromStr for Origin {
    type Err = InvalidOrigin;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut tokens = s.splitn(2, '/');
        let category = tokens.next().ok_or_else(|| InvalidOrigin(s.to_string()))?;
        let name = tokens.next().ok_or_else(|| InvalidOrigin(s.to_string()))?;
        Origin::new(category, name)
    }
}

impl<'de> Deserialize<'de> for Origin {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s: String = Deserialize::deserialize(deserializer)?;
        Origin::from_str(&s).map_err(de::Error::custom)
    }
}

/// Text form was not a valid `category/name` origin.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct InvalidOrigin(pub String);

impl Display for InvalidOrigin {
    fn fmt(&self, fmt: &mut Formatter) -> FmtResult {
        write!(fmt, "invalid port origin `{}`", self.0)
    }
}

impl Error for InvalidOrigin {}
