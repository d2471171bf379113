use std::error::Error;
use std::fmt::{Debug, Display, Formatter, Result as FmtResult};
use std::str::FromStr;

use blake2::digest::{Input, VariableOutput};
use blake2::VarBlake2b;
use data_encoding::BASE32_NOPAD;
use rand::RngCore;
use serde::de::{self, Deserialize, Deserializer, Visitor};
use serde::ser::{Serialize, Serializer};

const FINGERPRINT_LENGTH: usize = 20;

/// Content hash pinning a built package to the inputs that produced it.
///
/// A fingerprint is computed from the port version, the fingerprints of its
/// build-time and run-time dependencies, and the build options in effect.
/// Identical inputs always produce identical fingerprints, which is what
/// makes already-built detection across runs deterministic.
#[derive(Clone, Copy, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct Fingerprint([u8; FINGERPRINT_LENGTH]);

impl Fingerprint {
    /// Starts recording inputs for a new fingerprint.
    #[inline]
    pub fn record() -> FingerprintRecorder {
        FingerprintRecorder::new()
    }

    /// Returns a fingerprint over random input bytes.
    pub fn random() -> Self {
        let mut buffer = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut buffer);
        Fingerprint::record().raw(&buffer).finish()
    }
}

impl Display for Fingerprint {
    fn fmt(&self, fmt: &mut Formatter) -> FmtResult {
        let encoded = BASE32_NOPAD.encode(&self.0);
        write!(fmt, "{}", encoded.to_lowercase())
    }
}

impl Debug for Fingerprint {
    fn fmt(&self, fmt: &mut Formatter) -> FmtResult {
        fmt.debug_tuple(stringify!(Fingerprint))
            .field(&self.to_string())
            .finish()
    }
}

impl FromStr for Fingerprint {
    type Err = InvalidFingerprint;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let decoded = BASE32_NOPAD
            .decode(s.to_uppercase().as_bytes())
            .map_err(|_| InvalidFingerprint)?;

        if s.len() == BASE32_NOPAD.encode_len(FINGERPRINT_LENGTH) {
            let mut buffer = [0u8; FINGERPRINT_LENGTH];
            buffer.copy_from_slice(decoded.as_slice());
            Ok(Fingerprint(buffer))
        } else {
            Err(InvalidFingerprint)
        }
    }
}

impl<'de> Deserialize<'de> for Fingerprint {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct FingerprintVisitor;

        impl<'de> Visitor<'de> for FingerprintVisitor {
            type Value = Fingerprint;

            fn expecting(&self, fmt: &mut Formatter) -> FmtResult {
                fmt.write_str("a 20-byte Blake2b fingerprint encoded in base32 format")
            }

            fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
            where
                E: de::Error,
            {
                Fingerprint::from_str(value).map_err(E::custom)
            }
        }

        deserializer.deserialize_str(FingerprintVisitor)
    }
}

impl Serialize for Fingerprint {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

/// Accumulates the inputs of a fingerprint in a fixed, injective encoding.
///
/// Every record is framed with a tag byte and a length so that no two
/// distinct input sequences collapse onto the same byte stream.
#[derive(Debug)]
pub struct FingerprintRecorder {
    hasher: VarBlake2b,
}

impl FingerprintRecorder {
    fn new() -> Self {
        FingerprintRecorder {
            hasher: VarBlake2b::new(FINGERPRINT_LENGTH)
                .expect("FINGERPRINT_LENGTH is an invalid value"),
        }
    }

    /// Records the port version string.
    pub fn version(self, version: &str) -> Self {
        self.frame(b'V', version.as_bytes())
    }

    /// Records the fingerprint of one dependency.
    ///
    /// Callers must feed dependencies in a canonical order for the result
    /// to be stable.
    pub fn dependency(self, fingerprint: &Fingerprint) -> Self {
        self.frame(b'D', &fingerprint.0)
    }

    /// Records one build option as a key/value pair.
    pub fn option(self, key: &str, value: &str) -> Self {
        self.frame(b'K', key.as_bytes()).frame(b'O', value.as_bytes())
    }

    fn raw(self, bytes: &[u8]) -> Self {
        self.frame(b'R', bytes)
    }

    fn frame(mut self, tag: u8, bytes: &[u8]) -> Self {
        self.hasher.input([tag]);
        self.hasher.input((bytes.len() as u64).to_le_bytes());
        self.hasher.input(bytes);
        self
    }

    pub fn finish(self) -> Fingerprint {
        let mut output = [0u8; FINGERPRINT_LENGTH];
        self.hasher.variable_result(|b| output.copy_from_slice(b));
        Fingerprint(output)
    }
}

/// Text form did not decode to a valid fingerprint.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct InvalidFingerprint;

impl Display for InvalidFingerprint {
    fn fmt(&self, fmt: &mut Formatter) -> FmtResult {
        fmt.write_str("invalid base32 fingerprint")
    }
}

impl Error for InvalidFingerprint {}
