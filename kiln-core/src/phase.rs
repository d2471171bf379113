use std::fmt::{Display, Formatter, Result as FmtResult};

use serde::{Deserialize, Serialize};

/// Dependency class a port declares against other ports.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
pub enum DepPhase {
    Extract,
    Patch,
    Build,
    Run,
    Test,
}

impl DepPhase {
    /// All dependency classes, in declaration order.
    pub const ALL: [DepPhase; 5] = [
        DepPhase::Extract,
        DepPhase::Patch,
        DepPhase::Build,
        DepPhase::Run,
        DepPhase::Test,
    ];

    pub fn as_str(&self) -> &'static str {
        match *self {
            DepPhase::Extract => "extract",
            DepPhase::Patch => "patch",
            DepPhase::Build => "build",
            DepPhase::Run => "run",
            DepPhase::Test => "test",
        }
    }
}

impl Display for DepPhase {
    fn fmt(&self, fmt: &mut Formatter) -> FmtResult {
        fmt.write_str(self.as_str())
    }
}

/// One named step of a port's build recipe, in execution order.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
pub enum BuildPhase {
    CheckSanity,
    PkgDepends,
    FetchDepends,
    Fetch,
    Checksum,
    ExtractDepends,
    Extract,
    PatchDepends,
    Patch,
    BuildDepends,
    LibDepends,
    Configure,
    Build,
    Stage,
    Package,
}

impl BuildPhase {
    /// The standard entry points of the ports build system, in the order a
    /// worker runs them.
    pub const SEQUENCE: [BuildPhase; 15] = [
        BuildPhase::CheckSanity,
        BuildPhase::PkgDepends,
        BuildPhase::FetchDepends,
        BuildPhase::Fetch,
        BuildPhase::Checksum,
        BuildPhase::ExtractDepends,
        BuildPhase::Extract,
        BuildPhase::PatchDepends,
        BuildPhase::Patch,
        BuildPhase::BuildDepends,
        BuildPhase::LibDepends,
        BuildPhase::Configure,
        BuildPhase::Build,
        BuildPhase::Stage,
        BuildPhase::Package,
    ];

    /// The make target this phase corresponds to.
    pub fn as_str(&self) -> &'static str {
        match *self {
            BuildPhase::CheckSanity => "check-sanity",
            BuildPhase::PkgDepends => "pkg-depends",
            BuildPhase::FetchDepends => "fetch-depends",
            BuildPhase::Fetch => "fetch",
            BuildPhase::Checksum => "checksum",
            BuildPhase::ExtractDepends => "extract-depends",
            BuildPhase::Extract => "extract",
            BuildPhase::PatchDepends => "patch-depends",
            BuildPhase::Patch => "patch",
            BuildPhase::BuildDepends => "build-depends",
            BuildPhase::LibDepends => "lib-depends",
            BuildPhase::Configure => "configure",
            BuildPhase::Build => "build",
            BuildPhase::Stage => "stage",
            BuildPhase::Package => "package",
        }
    }
}

impl Display for BuildPhase {
    fn fmt(&self, fmt: &mut Formatter) -> FmtResult {
        fmt.write_str(self.as_str())
    }
}
