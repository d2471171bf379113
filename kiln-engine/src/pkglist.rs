//! Ingestion of the port list a run operates on.
//!
//! Lists come from command-line arguments (either origins or a file of
//! origins), from the host's installed package set, or from a walk of the
//! whole ports tree for `everything` runs.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use log::warn;

use kiln_core::PortId;

use crate::error::EngineError;

/// Parses `<ports…>` arguments: each word is an origin, or a path to a
/// file with one origin per line (`#` starts a comment).
///
/// Duplicates are dropped, first occurrence wins.
pub fn ingest_args(args: &[String]) -> Result<Vec<PortId>, EngineError> {
    let mut ports = Vec::new();

    for arg in args {
        if Path::new(arg).is_file() {
            let text = fs::read_to_string(arg)
                .map_err(|err| EngineError::io(&PathBuf::from(arg), err))?;
            for line in text.lines() {
                let line = line.trim();
                if line.is_empty() || line.starts_with('#') {
                    continue;
                }
                push_origin(&mut ports, line)?;
            }
        } else {
            push_origin(&mut ports, arg)?;
        }
    }

    Ok(ports)
}

fn push_origin(ports: &mut Vec<PortId>, text: &str) -> Result<(), EngineError> {
    let port: PortId = text
        .parse()
        .map_err(|err| EngineError::Config(format!("{}", err)))?;
    if !ports.contains(&port) {
        ports.push(port);
    }
    Ok(())
}

/// The origins of every package installed on the host, via the system
/// package query.
pub fn local_system_list() -> Result<Vec<PortId>, EngineError> {
    let output = Command::new("pkg")
        .arg("query")
        .arg("%o")
        .output()
        .map_err(|err| EngineError::Config(format!("unable to run pkg query: {}", err)))?;

    if !output.status.success() {
        return Err(EngineError::Config(format!(
            "pkg query exited with {}",
            output.status
        )));
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    let mut ports = Vec::new();
    for line in stdout.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match line.parse::<PortId>() {
            Ok(port) => {
                if !ports.contains(&port) {
                    ports.push(port);
                }
            }
            Err(err) => warn!("skipping installed package with odd origin: {}", err),
        }
    }
    Ok(ports)
}

/// Infrastructure directories that are not categories.
const NON_CATEGORY_DIRS: &[&str] = &[
    "Mk",
    "Templates",
    "Tools",
    "Keywords",
    "distfiles",
    "packages",
];

/// Every port in the tree, for `everything` runs: each
/// `<category>/<name>` directory that carries a Makefile.
pub fn full_tree_list(portsdir: &Path) -> Result<Vec<PortId>, EngineError> {
    let mut ports = Vec::new();

    let categories = fs::read_dir(portsdir)
        .map_err(|err| EngineError::io(&portsdir.to_path_buf(), err))?;
    let mut category_names = Vec::new();
    for entry in categories {
        let entry = entry.map_err(|err| EngineError::io(&portsdir.to_path_buf(), err))?;
        let name = entry.file_name().to_string_lossy().to_string();
        if !entry.path().is_dir()
            || name.starts_with('.')
            || NON_CATEGORY_DIRS.contains(&name.as_str())
        {
            continue;
        }
        category_names.push(name);
    }
    category_names.sort();

    for category in category_names {
        let category_dir = portsdir.join(&category);
        let entries = fs::read_dir(&category_dir)
            .map_err(|err| EngineError::io(&category_dir, err))?;
        let mut names = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|err| EngineError::io(&category_dir, err))?;
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with('.') || !entry.path().join("Makefile").is_file() {
                continue;
            }
            names.push(name);
        }
        names.sort();

        for name in names {
            match format!("{}/{}", category, name).parse::<PortId>() {
                Ok(port) => ports.push(port),
                Err(err) => warn!("skipping odd port directory: {}", err),
            }
        }
    }

    Ok(ports)
}
