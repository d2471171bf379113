//! Build profile configuration.
//!
//! The configuration file is INI-style: a `[Global Configuration]` section
//! selects the active profile, and each profile section carries a fixed set
//! of recognized options. Unknown keys are warned about and skipped so a
//! hand-edited file does not brick the tool.

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use log::warn;

use kiln_core::PortId;

use crate::error::EngineError;

const GLOBAL_SECTION: &str = "Global Configuration";

const RECOGNIZED_KEYS: &[&str] = &[
    "Operating_system",
    "Directory_packages",
    "Directory_repository",
    "Directory_portsdir",
    "Directory_options",
    "Directory_distfiles",
    "Directory_buildbase",
    "Directory_logs",
    "Directory_ccache",
    "Directory_system",
    "Number_of_builders",
    "Max_jobs_per_builder",
    "Tmpfs_workdir",
    "Tmpfs_localbase",
    "Display_with_ncurses",
    "leverage_prebuilt",
];

/// Resolved configuration for one run; immutable once constructed.
#[derive(Clone, Debug)]
pub struct Config {
    pub profile: String,
    pub config_path: PathBuf,
    pub operating_system: String,
    pub dir_packages: PathBuf,
    pub dir_repository: PathBuf,
    pub dir_portsdir: PathBuf,
    pub dir_options: PathBuf,
    pub dir_distfiles: PathBuf,
    pub dir_buildbase: PathBuf,
    pub dir_logs: PathBuf,
    /// `None` when the profile sets the ccache directory to `disabled`.
    pub dir_ccache: Option<PathBuf>,
    pub dir_system: PathBuf,
    /// Worker slot count, already resolved: 0 in the file means CPU-derived.
    pub num_builders: usize,
    /// Per-builder make job cap, already resolved the same way.
    pub max_jobs: usize,
    pub tmpfs_workdir: bool,
    pub tmpfs_localbase: bool,
    pub display_ncurses: bool,
    pub leverage_prebuilt: bool,
}

impl Config {
    /// Loads the profile selected by `[Global Configuration]`, or
    /// `profile_override` when given.
    pub fn load(path: &Path, profile_override: Option<&str>) -> Result<Config, EngineError> {
        let text = fs::read_to_string(path)
            .map_err(|err| EngineError::Config(format!("{}: {}", path.display(), err)))?;
        let sections = parse_ini(&text);

        let profile = match profile_override {
            Some(name) => name.to_string(),
            None => sections
                .get(GLOBAL_SECTION)
                .and_then(|s| s.get("profile_selected"))
                .cloned()
                .ok_or_else(|| {
                    EngineError::Config(format!(
                        "{}: no profile_selected in [{}]",
                        path.display(),
                        GLOBAL_SECTION
                    ))
                })?,
        };

        let section = sections.get(&profile).ok_or_else(|| {
            EngineError::Config(format!("{}: no [{}] section", path.display(), profile))
        })?;

        for key in section.keys() {
            if !RECOGNIZED_KEYS.contains(&key.as_str()) {
                warn!("{}: unrecognized option {} in [{}]", path.display(), key, profile);
            }
        }

        let lookup = |key: &str| -> Result<&String, EngineError> {
            section.get(key).ok_or_else(|| {
                EngineError::Config(format!(
                    "{}: [{}] is missing {}",
                    path.display(),
                    profile,
                    key
                ))
            })
        };

        let parse_count = |key: &str| -> Result<usize, EngineError> {
            lookup(key)?.parse::<usize>().map_err(|_| {
                EngineError::Config(format!("{}: {} must be a number", path.display(), key))
            })
        };

        let parse_bool = |key: &str| -> Result<bool, EngineError> {
            match lookup(key)?.to_lowercase().as_str() {
                "true" | "yes" | "1" => Ok(true),
                "false" | "no" | "0" => Ok(false),
                other => Err(EngineError::Config(format!(
                    "{}: {} must be a boolean, not `{}`",
                    path.display(),
                    key,
                    other
                ))),
            }
        };

        let ccache = lookup("Directory_ccache")?;
        let dir_ccache = if ccache.eq_ignore_ascii_case("disabled") {
            None
        } else {
            Some(PathBuf::from(ccache))
        };

        let num_builders = match parse_count("Number_of_builders")? {
            0 => default_builders(num_cpus::get()),
            n => n,
        };
        let max_jobs = match parse_count("Max_jobs_per_builder")? {
            0 => default_max_jobs(num_cpus::get(), num_builders),
            n => n,
        };

        Ok(Config {
            operating_system: lookup("Operating_system")?.clone(),
            dir_packages: PathBuf::from(lookup("Directory_packages")?),
            dir_repository: PathBuf::from(lookup("Directory_repository")?),
            dir_portsdir: PathBuf::from(lookup("Directory_portsdir")?),
            dir_options: PathBuf::from(lookup("Directory_options")?),
            dir_distfiles: PathBuf::from(lookup("Directory_distfiles")?),
            dir_buildbase: PathBuf::from(lookup("Directory_buildbase")?),
            dir_logs: PathBuf::from(lookup("Directory_logs")?),
            dir_ccache,
            dir_system: PathBuf::from(lookup("Directory_system")?),
            num_builders,
            max_jobs,
            tmpfs_workdir: parse_bool("Tmpfs_workdir")?,
            tmpfs_localbase: parse_bool("Tmpfs_localbase")?,
            display_ncurses: parse_bool("Display_with_ncurses")?,
            leverage_prebuilt: parse_bool("leverage_prebuilt")?,
            profile,
            config_path: path.to_path_buf(),
        })
    }

    /// Path of the profile's make.conf overlay, beside the config file.
    pub fn make_conf_path(&self) -> PathBuf {
        let name = format!("{}-make.conf", self.profile);
        match self.config_path.parent() {
            Some(dir) => dir.join(name),
            None => PathBuf::from(name),
        }
    }

    /// Per-port build log location.
    pub fn log_path(&self, port: &PortId) -> PathBuf {
        self.dir_logs.join(format!("{}.log", port.as_log_stem()))
    }

    pub fn summary_log_path(&self) -> PathBuf {
        self.dir_logs.join("Summary.log")
    }

    /// Root directory of one worker slot's sandbox.
    pub fn slot_root(&self, slot_id: u32) -> PathBuf {
        self.dir_buildbase.join(format!("SL{:02}", slot_id))
    }
}

/// CPU-derived builder count: half the cores, at least one, capped at 8.
fn default_builders(cpus: usize) -> usize {
    (cpus / 2).max(1).min(8)
}

/// CPU-derived per-builder job cap.
fn default_max_jobs(cpus: usize, builders: usize) -> usize {
    (cpus / builders).max(1)
}

fn parse_ini(text: &str) -> BTreeMap<String, BTreeMap<String, String>> {
    let mut sections = BTreeMap::new();
    let mut current: Option<String> = None;

    for raw in text.lines() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with(';') || line.starts_with('#') {
            continue;
        }

        if line.starts_with('[') && line.ends_with(']') {
            let name = line[1..line.len() - 1].trim().to_string();
            sections.entry(name.clone()).or_insert_with(BTreeMap::new);
            current = Some(name);
            continue;
        }

        if let Some(eq) = line.find('=') {
            if let Some(ref section) = current {
                let key = line[..eq].trim().to_string();
                let value = line[eq + 1..].trim().to_string();
                if let Some(entries) = sections.get_mut(section) {
                    entries.insert(key, value);
                }
            }
        }
    }

    sections
}

/// Configuration template written by the `init` directive.
pub const CONFIG_TEMPLATE: &str = "\
; This kiln configuration file is automatically generated
; Take care when hand editing!

[Global Configuration]
profile_selected= LiveSystem

[LiveSystem]
Operating_system= FreeBSD
Directory_packages= /build/kiln/live_packages
Directory_repository= /build/kiln/live_packages/All
Directory_portsdir= /build/kiln/ports
Directory_options= /build/kiln/options
Directory_distfiles= /build/kiln/distfiles
Directory_buildbase= /build/kiln/build
Directory_logs= /build/kiln/logs
Directory_ccache= disabled
Directory_system= /
Number_of_builders= 0
Max_jobs_per_builder= 0
Tmpfs_workdir= true
Tmpfs_localbase= true
Display_with_ncurses= true
leverage_prebuilt= false
";

/// make.conf template written beside the configuration by `init`.
pub const MAKE_CONF_TEMPLATE: &str = "\
#
# Various ports options that might be of interest
#
#LICENSES_ACCEPTED=      NONE
#DISABLE_LICENSES=       yes
#DEFAULT_VERSIONS=       ssl=openssl
#FORCE_PACKAGE=          yes
#
# Turn these on to generate debug binaries.  However, these
# options will seriously bloat memory use and storage use,
# do not use lightly
#
#STRIP=
#WITH_DEBUG=yes
";

/// Writes the configuration template for `init`. Refuses to overwrite.
pub fn write_template(config_dir: &Path) -> Result<PathBuf, EngineError> {
    let config_path = config_dir.join("kiln.ini");
    if config_path.exists() {
        return Err(EngineError::Config(format!(
            "init will not overwrite {}",
            config_path.display()
        )));
    }

    fs::create_dir_all(config_dir).map_err(|err| EngineError::io(&config_dir.to_path_buf(), err))?;

    let mut file =
        fs::File::create(&config_path).map_err(|err| EngineError::io(&config_path, err))?;
    file.write_all(CONFIG_TEMPLATE.as_bytes())
        .map_err(|err| EngineError::io(&config_path, err))?;

    let make_conf = config_dir.join("LiveSystem-make.conf");
    let mut file = fs::File::create(&make_conf).map_err(|err| EngineError::io(&make_conf, err))?;
    file.write_all(MAKE_CONF_TEMPLATE.as_bytes())
        .map_err(|err| EngineError::io(&make_conf, err))?;

    Ok(config_path)
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::fs;

    fn write_config(dir: &Path, contents: &str) -> PathBuf {
        let path = dir.join("kiln.ini");
        fs::write(&path, contents).expect("Failed to write config fixture");
        path
    }

    #[test]
    fn template_loads_back() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let path = write_config(dir.path(), CONFIG_TEMPLATE);

        let config = Config::load(&path, None).expect("Failed to load template config");
        assert_eq!(config.profile, "LiveSystem");
        assert_eq!(config.dir_repository, PathBuf::from("/build/kiln/live_packages/All"));
        assert!(config.dir_ccache.is_none());
        assert!(config.tmpfs_workdir);
        assert!(!config.leverage_prebuilt);
        // 0 in the file resolves to at least one builder.
        assert!(config.num_builders >= 1);
        assert!(config.max_jobs >= 1);
    }

    #[test]
    fn profile_override_selects_other_section() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let other = CONFIG_TEMPLATE.replace("[LiveSystem]", "[Testing]");
        let both = format!("{}\n{}", CONFIG_TEMPLATE, other);
        let path = write_config(dir.path(), &both);

        let config =
            Config::load(&path, Some("Testing")).expect("Failed to load overridden profile");
        assert_eq!(config.profile, "Testing");
    }

    #[test]
    fn missing_profile_section_is_a_config_error() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let path = write_config(
            dir.path(),
            "[Global Configuration]\nprofile_selected= Nope\n",
        );

        Config::load(&path, None).expect_err("Failed to reject missing profile section");
    }

    #[test]
    fn missing_option_is_a_config_error() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let truncated = CONFIG_TEMPLATE.replace("Directory_logs= /build/kiln/logs\n", "");
        let path = write_config(dir.path(), &truncated);

        Config::load(&path, None).expect_err("Failed to reject missing option");
    }

    #[test]
    fn explicit_builder_count_is_kept() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let fixed = CONFIG_TEMPLATE.replace("Number_of_builders= 0", "Number_of_builders= 3");
        let path = write_config(dir.path(), &fixed);

        let config = Config::load(&path, None).expect("Failed to load config");
        assert_eq!(config.num_builders, 3);
    }

    #[test]
    fn log_paths_are_filesystem_safe() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let path = write_config(dir.path(), CONFIG_TEMPLATE);
        let config = Config::load(&path, None).expect("Failed to load config");

        let port: PortId = "editors/joe".parse().expect("Failed to parse port id");
        let log = config.log_path(&port);
        assert_eq!(log, PathBuf::from("/build/kiln/logs/editors___joe.log"));
    }

    #[test]
    fn init_refuses_to_overwrite() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        write_template(dir.path()).expect("Failed to write template");
        write_template(dir.path()).expect_err("Failed to refuse second init");
    }

    #[test]
    fn slot_roots_are_zero_padded() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let path = write_config(dir.path(), CONFIG_TEMPLATE);
        let config = Config::load(&path, None).expect("Failed to load config");
        assert_eq!(config.slot_root(2), PathBuf::from("/build/kiln/build/SL02"));
    }
}
