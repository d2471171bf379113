//! Port metadata extraction.
//!
//! Metadata comes out of the ports tree itself, by running its `make` with
//! `-V` variable queries. Results are memoized per port for the lifetime of
//! a run, so the rest of the engine can treat the loader as a pure function
//! of the port id.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::PathBuf;
use std::process::Command;
use std::sync::Arc;

use failure::Fail;
use log::debug;

use kiln_core::{DepPhase, PortId};

/// Variables queried from the port makefile, in output order.
const QUERY_VARS: &[&str] = &[
    "PKGNAME",
    "PKGVERSION",
    "EXTRACT_DEPENDS",
    "PATCH_DEPENDS",
    "FETCH_DEPENDS",
    "BUILD_DEPENDS",
    "LIB_DEPENDS",
    "RUN_DEPENDS",
    "TEST_DEPENDS",
    "FLAVORS",
    "ALLFILES",
    "DIST_SUBDIR",
    "SELECTED_OPTIONS",
];

/// Everything the engine needs to know about one port.
#[derive(Clone, Debug)]
pub struct PortMetadata {
    pub id: PortId,
    /// Full package name including the version, e.g. `joe-4.6_1`.
    pub pkgname: String,
    pub version: String,
    pub deps: BTreeMap<DepPhase, BTreeSet<PortId>>,
    /// Source distribution files, relative to the distfiles directory.
    pub distfiles: Vec<String>,
    /// Option selections that participate in the package fingerprint.
    pub options: Vec<String>,
}

impl PortMetadata {
    /// Dependencies of one class, empty when none were declared.
    pub fn deps(&self, phase: DepPhase) -> impl Iterator<Item = &PortId> {
        self.deps.get(&phase).into_iter().flatten()
    }
}

/// Failure to extract metadata for one port. Recoverable: the port is
/// ignored and its dependents are skipped.
#[derive(Clone, Debug, Fail)]
#[fail(display = "failed to extract metadata for {}: {}", port, reason)]
pub struct MetadataError {
    pub port: PortId,
    pub reason: String,
}

/// Source of port metadata, memoized per run.
pub trait PortMetadataSource {
    fn metadata(&mut self, id: &PortId) -> Result<Arc<PortMetadata>, MetadataError>;
}

/// Loader that shells out to the ports tree's `make`.
#[derive(Debug)]
pub struct MakeLoader {
    portsdir: PathBuf,
    cache: HashMap<PortId, Result<Arc<PortMetadata>, MetadataError>>,
}

impl MakeLoader {
    pub fn new(portsdir: PathBuf) -> Self {
        MakeLoader {
            portsdir,
            cache: HashMap::new(),
        }
    }

    fn query(&self, id: &PortId) -> Result<Arc<PortMetadata>, MetadataError> {
        let port_dir = self
            .portsdir
            .join(id.origin().category())
            .join(id.origin().name());
        if !port_dir.join("Makefile").is_file() {
            return Err(MetadataError {
                port: id.clone(),
                reason: format!("no port at {}", port_dir.display()),
            });
        }

        let mut command = Command::new("make");
        command
            .arg("-C")
            .arg(&port_dir)
            .env("PORTSDIR", &self.portsdir)
            .env("BATCH", "yes");
        if let Some(flavor) = id.flavor() {
            command.env("FLAVOR", flavor.as_str());
        }
        for var in QUERY_VARS {
            command.arg("-V").arg(var);
        }

        debug!("extracting metadata for {}", id);
        let output = command.output().map_err(|err| MetadataError {
            port: id.clone(),
            reason: format!("unable to run make: {}", err),
        })?;

        if !output.status.success() {
            return Err(MetadataError {
                port: id.clone(),
                reason: format!("make exited with {}", output.status),
            });
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        parse_query_output(id, &stdout).map(Arc::new)
    }
}

impl PortMetadataSource for MakeLoader {
    fn metadata(&mut self, id: &PortId) -> Result<Arc<PortMetadata>, MetadataError> {
        if let Some(cached) = self.cache.get(id) {
            return cached.clone();
        }

        let result = self.query(id);
        self.cache.insert(id.clone(), result.clone());
        result
    }
}

/// Parses the `-V` answer lines, one per queried variable.
fn parse_query_output(id: &PortId, stdout: &str) -> Result<PortMetadata, MetadataError> {
    let mut lines = stdout.lines();
    let mut next = |var: &str| -> Result<String, MetadataError> {
        lines
            .next()
            .map(|line| line.trim().to_string())
            .ok_or_else(|| MetadataError {
                port: id.clone(),
                reason: format!("make produced no value for {}", var),
            })
    };

    let pkgname = next("PKGNAME")?;
    let version = next("PKGVERSION")?;
    if pkgname.is_empty() || version.is_empty() {
        return Err(MetadataError {
            port: id.clone(),
            reason: "port reports an empty package name".to_string(),
        });
    }

    let extract = next("EXTRACT_DEPENDS")?;
    let patch = next("PATCH_DEPENDS")?;
    let fetch = next("FETCH_DEPENDS")?;
    let build = next("BUILD_DEPENDS")?;
    let lib = next("LIB_DEPENDS")?;
    let run = next("RUN_DEPENDS")?;
    let test = next("TEST_DEPENDS")?;
    let _flavors = next("FLAVORS")?;
    let allfiles = next("ALLFILES")?;
    let dist_subdir = next("DIST_SUBDIR")?;
    let options = next("SELECTED_OPTIONS")?;

    let mut deps: BTreeMap<DepPhase, BTreeSet<PortId>> = BTreeMap::new();
    let mut insert = |phase: DepPhase, raw: &str| -> Result<(), MetadataError> {
        for spec in raw.split_whitespace() {
            let dep = parse_depend_spec(spec).ok_or_else(|| MetadataError {
                port: id.clone(),
                reason: format!("unparseable dependency `{}`", spec),
            })?;
            // Self edges are kept; the graph treats them as one-node cycles.
            deps.entry(phase).or_default().insert(dep);
        }
        Ok(())
    };

    insert(DepPhase::Extract, &extract)?;
    insert(DepPhase::Extract, &fetch)?;
    insert(DepPhase::Patch, &patch)?;
    insert(DepPhase::Build, &build)?;
    insert(DepPhase::Build, &lib)?;
    insert(DepPhase::Run, &run)?;
    insert(DepPhase::Test, &test)?;

    let distfiles = allfiles
        .split_whitespace()
        .map(|file| {
            if dist_subdir.is_empty() {
                file.to_string()
            } else {
                format!("{}/{}", dist_subdir, file)
            }
        })
        .collect();

    Ok(PortMetadata {
        id: id.clone(),
        pkgname,
        version,
        deps,
        distfiles,
        options: options.split_whitespace().map(str::to_string).collect(),
    })
}

/// Reduces a ports dependency spec to the target port id.
///
/// Specs look like `gettext>=0.21:devel/gettext`,
/// `${LOCALBASE}/bin/perl:lang/perl5:build`, or carry an `@flavor` on the
/// origin. The origin is the second colon-separated field.
fn parse_depend_spec(spec: &str) -> Option<PortId> {
    let mut fields = spec.split(':');
    let _pkgspec = fields.next()?;
    let origin = fields.next()?;
    origin.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn port(s: &str) -> PortId {
        s.parse().expect("Failed to parse port id")
    }

    #[test]
    fn depend_specs_reduce_to_origins() {
        let dep = parse_depend_spec("gettext>=0.21:devel/gettext")
            .expect("Failed to parse plain spec");
        assert_eq!(dep, port("devel/gettext"));

        let dep = parse_depend_spec("${LOCALBASE}/bin/perl:lang/perl5:patch")
            .expect("Failed to parse spec with target suffix");
        assert_eq!(dep, port("lang/perl5"));

        let dep = parse_depend_spec("py-six>=1.0:devel/py-six@py39")
            .expect("Failed to parse flavored spec");
        assert_eq!(dep, port("devel/py-six@py39"));
    }

    #[test]
    fn malformed_depend_specs_are_rejected() {
        assert!(parse_depend_spec("no-colon-anywhere").is_none());
        assert!(parse_depend_spec("x:not a valid origin").is_none());
    }

    #[test]
    fn query_output_maps_into_phases() {
        let id = port("editors/joe");
        let stdout = "\
joe-4.6_1
4.6_1

x:devel/patchdep
y:devel/fetchdep
gettext>=0.21:devel/gettext
libiconv.so:converters/libiconv
z:devel/rundep


joe-4.6.tar.gz

DEVELOPER=off
";
        let meta = parse_query_output(&id, stdout).expect("Failed to parse query output");
        assert_eq!(meta.pkgname, "joe-4.6_1");
        assert_eq!(meta.version, "4.6_1");

        let build: Vec<String> = meta.deps(DepPhase::Build).map(|d| d.to_string()).collect();
        assert_eq!(build, ["converters/libiconv", "devel/gettext"]);

        let extract: Vec<String> = meta
            .deps(DepPhase::Extract)
            .map(|d| d.to_string())
            .collect();
        assert_eq!(extract, ["devel/fetchdep"]);

        let run: Vec<String> = meta.deps(DepPhase::Run).map(|d| d.to_string()).collect();
        assert_eq!(run, ["devel/rundep"]);

        assert_eq!(meta.distfiles, ["joe-4.6.tar.gz"]);
        assert_eq!(meta.options, ["DEVELOPER=off"]);
    }

    #[test]
    fn short_output_is_a_metadata_error() {
        let id = port("editors/joe");
        parse_query_output(&id, "joe-4.6_1\n4.6_1\n")
            .expect_err("Failed to reject truncated output");
    }

    #[test]
    fn dist_subdir_prefixes_distfiles() {
        let id = port("www/big");
        let stdout = "big-1.0\n1.0\n\n\n\n\n\n\n\n\nbig-1.0.tar.xz extra.tgz\nbig\n\n";
        let meta = parse_query_output(&id, stdout).expect("Failed to parse query output");
        assert_eq!(meta.distfiles, ["big/big-1.0.tar.xz", "big/extra.tgz"]);
    }
}
