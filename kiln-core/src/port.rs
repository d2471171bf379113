use std::error::Error;
use std::fmt::{Display, Formatter, Result as FmtResult};
use std::str::FromStr;

use serde::de::{self, Deserialize, Deserializer};
use serde::ser::{Serialize, Serializer};

use crate::flavor::{Flavor, InvalidFlavor};
use crate::origin::{InvalidOrigin, Origin};

/// Stable identity of one build target: an origin plus an optional flavor.
///
/// Two `PortId`s are equal iff both fields match byte-for-byte. The textual
/// form is `category/name` or `category/name@flavor`.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct PortId {
    origin: Origin,
    flavor: Option<Flavor>,
}

impl PortId {
    pub fn new(origin: Origin, flavor: Option<Flavor>) -> Self {
        PortId { origin, flavor }
    }

    #[inline]
    pub fn origin(&self) -> &Origin {
        &self.origin
    }

    #[inline]
    pub fn flavor(&self) -> Option<&Flavor> {
        self.flavor.as_ref()
    }

    /// Filesystem-safe form used to name per-port log files.
    pub fn as_log_stem(&self) -> String {
        match self.flavor {
            Some(ref flavor) => format!("{}@{}", self.origin.as_log_stem(), flavor),
            None => self.origin.as_log_stem(),
        }
    }
}

impl Display for PortId {
    fn fmt(&self, fmt: &mut Formatter) -> FmtResult {
        match self.flavor {
            Some(ref flavor) => write!(fmt, "{}@{}", self.origin, flavor),
            None => write!(fmt, "{}", self.origin),
        }
    }
}

impl From<Origin> for PortId {
    fn from(origin: Origin) -> Self {
        PortId::new(origin, None)
    }
}

impl FromStr for PortId {
    type Err = InvalidPortId;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut tokens = s.splitn(2, '@');
        let origin = tokens.next().unwrap_or("").parse()?;
        let flavor = match tokens.next() {
            Some(flavor) => Some(flavor.parse()?),
            None => None,
        };
        Ok(PortId::new(origin, flavor))
    }
}

impl<'de> Deserialize<'de> for PortId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s: String = Deserialize::deserialize(deserializer)?;
        PortId::from_str(&s).map_err(de::Error::custom)
    }
}

impl Serialize for PortId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

/// Text form was not a valid `category/name[@flavor]` identifier.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum InvalidPortId {
    Origin(InvalidOrigin),
    Flavor(InvalidFlavor),
}

impl Display for InvalidPortId {
    fn fmt(&self, fmt: &mut Formatter) -> FmtResult {
        match *self {
            InvalidPortId::Origin(ref e) => write!(fmt, "{}", e),
            InvalidPortId::Flavor(ref e) => write!(fmt, "{}", e),
        }
    }
}

impl Error for InvalidPortId {}

impl From<InvalidOrigin> for InvalidPortId {
    fn from(err: InvalidOrigin) -> Self {
        InvalidPortId::Origin(err)
    }
}

impl From<InvalidFlavor> for InvalidPortId {
    fn from(err: InvalidFlavor) -> Self {
        InvalidPortId::Flavor(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn is_send_and_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<PortId>();
    }

    #[test]
    fn parse_roundtrip() {
        for text in &["editors/joe", "devel/py-six@py39"] {
            let id: PortId = text.parse().expect("Failed to parse port id");
            assert_eq!(id.to_string(), *text);
        }
    }

    #[test]
    fn flavored_and_unflavored_differ() {
        let plain: PortId = "devel/py-six".parse().expect("Failed to parse port id");
        let flavored: PortId = "devel/py-six@py39".parse().expect("Failed to parse port id");
        assert_ne!(plain, flavored);
        assert_eq!(plain.origin(), flavored.origin());
    }

    #[test]
    fn reject_invalid_port_ids() {
        PortId::from_str("joe").expect_err("Failed to reject missing category");
        PortId::from_str("editors/joe@").expect_err("Failed to reject empty flavor");
        PortId::from_str("editors/joe@a@b").expect_err("Failed to reject double flavor");
    }

    #[test]
    fn ordering_is_lexicographic_by_origin() {
        let mut ids: Vec<PortId> = vec![
            "x11/xterm".parse().expect("Failed to parse port id"),
            "devel/gettext".parse().expect("Failed to parse port id"),
            "editors/joe".parse().expect("Failed to parse port id"),
        ];
        ids.sort();
        let shown: Vec<String> = ids.iter().map(|id| id.to_string()).collect();
        assert_eq!(shown, ["devel/gettext", "editors/joe", "x11/xterm"]);
    }
}
