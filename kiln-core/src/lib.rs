#![deny(missing_debug_implementations)]
#![forbid(unsafe_code)]

pub use self::fingerprint::{Fingerprint, FingerprintRecorder, InvalidFingerprint};
pub use self::flavor::{Flavor, InvalidFlavor};
pub use self::origin::{InvalidOrigin, Origin};
pub use self::phase::{BuildPhase, DepPhase};
pub use self::port::{InvalidPortId, PortId};

mod fingerprint;
mod flavor;
mod origin;
mod phase;
mod port;
