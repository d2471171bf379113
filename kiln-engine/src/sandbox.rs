//! Per-slot sandbox construction and the multi-phase build.
//!
//! Every worker slot owns one root directory under the build base. The
//! skeleton of mounts is built once per worker lifetime and only the
//! overlayed work areas are recycled between tasks, which keeps the
//! per-task cost down to a tmpfs remount.
//!
//! Mount and unmount are delegated to the host's mount tooling; phases run
//! through chroot into the slot root.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus, Stdio};

use log::{debug, warn};

use kiln_core::BuildPhase;

use crate::config::Config;
use crate::error::EngineError;
use crate::ipc::BuildTask;
use crate::repo::Repository;

/// Directory, relative to the slot root, where the ports tree appears.
const PORTS_MOUNT: &str = "xports";
/// Work area for port builds; recycled between tasks.
const WORK_MOUNT: &str = "construction";
/// Where the `package` phase drops its result inside the sandbox.
const PKG_STAGE: &str = "pkgstage";

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum MountSource {
    /// Loopback mount of a host directory.
    Nullfs { from: PathBuf, writable: bool },
    /// Fresh in-memory filesystem.
    Tmpfs,
    /// Device filesystem.
    Devfs,
}

/// One mount in the sandbox, target relative to the slot root.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct MountPoint {
    pub source: MountSource,
    pub target: PathBuf,
}

impl MountPoint {
    fn nullfs(from: &Path, target: &str, writable: bool) -> Self {
        MountPoint {
            source: MountSource::Nullfs {
                from: from.to_path_buf(),
                writable,
            },
            target: PathBuf::from(target),
        }
    }

    fn tmpfs(target: &str) -> Self {
        MountPoint {
            source: MountSource::Tmpfs,
            target: PathBuf::from(target),
        }
    }

    /// Arguments to the host `mount` command for this entry.
    fn mount_argv(&self, root: &Path) -> Vec<String> {
        let target = root.join(&self.target).display().to_string();
        match self.source {
            MountSource::Nullfs { ref from, writable } => vec![
                "-t".to_string(),
                "nullfs".to_string(),
                "-o".to_string(),
                if writable { "rw" } else { "ro" }.to_string(),
                from.display().to_string(),
                target,
            ],
            MountSource::Tmpfs => vec![
                "-t".to_string(),
                "tmpfs".to_string(),
                "tmpfs".to_string(),
                target,
            ],
            MountSource::Devfs => vec![
                "-t".to_string(),
                "devfs".to_string(),
                "devfs".to_string(),
                target,
            ],
        }
    }
}

/// Read-only system directories null-mounted from the configured base
/// system into every sandbox.
const SYSTEM_DIRS: &[&str] = &[
    "bin",
    "sbin",
    "lib",
    "libexec",
    "usr/bin",
    "usr/sbin",
    "usr/lib",
    "usr/libexec",
    "usr/include",
    "usr/share",
];

/// Computes the mount plan for one slot. Order matters: the base tmpfs
/// comes first and unmounting happens in exact reverse.
pub fn mount_plan(config: &Config) -> Vec<MountPoint> {
    let mut plan = vec![MountPoint::tmpfs("")];

    plan.push(MountPoint {
        source: MountSource::Devfs,
        target: PathBuf::from("dev"),
    });

    for dir in SYSTEM_DIRS {
        plan.push(MountPoint::nullfs(&config.dir_system.join(dir), dir, false));
    }

    plan.push(MountPoint::nullfs(&config.dir_portsdir, PORTS_MOUNT, false));
    plan.push(MountPoint::nullfs(&config.dir_options, "options", false));
    plan.push(MountPoint::nullfs(&config.dir_distfiles, "distfiles", true));
    plan.push(MountPoint::nullfs(&config.dir_packages, "packages", false));
    if let Some(ref ccache) = config.dir_ccache {
        plan.push(MountPoint::nullfs(ccache, "ccache", true));
    }

    if config.tmpfs_workdir {
        plan.push(MountPoint::tmpfs(WORK_MOUNT));
    }
    if config.tmpfs_localbase {
        plan.push(MountPoint::tmpfs("usr/local"));
    }

    plan
}

/// One worker slot's sandbox.
#[derive(Debug)]
pub struct Sandbox {
    slot_id: u32,
    root: PathBuf,
    plan: Vec<MountPoint>,
    /// Tracks which plan entries are currently mounted, by index.
    mounted: Vec<bool>,
    make_conf: PathBuf,
    tmpfs_workdir: bool,
    tmpfs_localbase: bool,
}

impl Sandbox {
    pub fn new(config: &Config, slot_id: u32) -> Self {
        let plan = mount_plan(config);
        let mounted = vec![false; plan.len()];
        Sandbox {
            slot_id,
            root: config.slot_root(slot_id),
            plan,
            mounted,
            make_conf: config.make_conf_path(),
            tmpfs_workdir: config.tmpfs_workdir,
            tmpfs_localbase: config.tmpfs_localbase,
        }
    }

    #[inline]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Builds the mount skeleton. Any leftovers from a previous worker
    /// incarnation are unmounted first so the slot starts clean.
    pub fn prepare(&mut self) -> Result<(), EngineError> {
        fs::create_dir_all(&self.root).map_err(|err| EngineError::io(&self.root, err))?;
        self.unmount_stale();

        for idx in 0..self.plan.len() {
            let target = self.root.join(&self.plan[idx].target);
            fs::create_dir_all(&target).map_err(|err| EngineError::io(&target, err))?;
            self.mount(idx)?;
        }

        for dir in &["etc", PKG_STAGE, "tmp", "var/run", "usr/local"] {
            let path = self.root.join(dir);
            fs::create_dir_all(&path).map_err(|err| EngineError::io(&path, err))?;
        }

        debug!("slot {:02} sandbox ready at {}", self.slot_id, self.root.display());
        Ok(())
    }

    fn mount(&mut self, idx: usize) -> Result<(), EngineError> {
        let argv = self.plan[idx].mount_argv(&self.root);
        let status = Command::new("mount")
            .args(&argv)
            .stdin(Stdio::null())
            .status()
            .map_err(|err| EngineError::Sandbox(format!("unable to run mount: {}", err)))?;
        if !status.success() {
            return Err(EngineError::Sandbox(format!(
                "mount {} failed with {}",
                self.root.join(&self.plan[idx].target).display(),
                status
            )));
        }
        self.mounted[idx] = true;
        Ok(())
    }

    fn unmount(&mut self, idx: usize) -> Result<(), EngineError> {
        if !self.mounted[idx] {
            return Ok(());
        }
        let target = self.root.join(&self.plan[idx].target);
        let status = Command::new("umount")
            .arg(&target)
            .stdin(Stdio::null())
            .status()
            .map_err(|err| EngineError::Sandbox(format!("unable to run umount: {}", err)))?;
        if !status.success() {
            return Err(EngineError::Sandbox(format!(
                "umount {} failed with {}",
                target.display(),
                status
            )));
        }
        self.mounted[idx] = false;
        Ok(())
    }

    /// Best-effort cleanup of stale mounts, for the `cleanup` directive and
    /// for workers inheriting a dirty slot root.
    pub fn scrub(&self) {
        self.unmount_stale();
    }

    /// Best-effort unmount of whatever an earlier incarnation left behind.
    fn unmount_stale(&self) {
        for entry in self.plan.iter().rev() {
            let target = self.root.join(&entry.target);
            let _ = Command::new("umount")
                .arg(&target)
                .stdin(Stdio::null())
                .stderr(Stdio::null())
                .status();
        }
    }

    /// Recycles the overlayed work areas between tasks; the rest of the
    /// skeleton stays mounted.
    pub fn reset(&mut self) -> Result<(), EngineError> {
        for target in &[WORK_MOUNT, "usr/local"] {
            let uses_tmpfs = match *target {
                WORK_MOUNT => self.tmpfs_workdir,
                _ => self.tmpfs_localbase,
            };
            if uses_tmpfs {
                if let Some(idx) = self
                    .plan
                    .iter()
                    .position(|entry| entry.target == Path::new(target))
                {
                    self.unmount(idx)?;
                    self.mount(idx)?;
                    continue;
                }
            }
            let path = self.root.join(target);
            if path.exists() {
                fs::remove_dir_all(&path).map_err(|err| EngineError::io(&path, err))?;
            }
            fs::create_dir_all(&path).map_err(|err| EngineError::io(&path, err))?;
        }

        let stage = self.root.join(PKG_STAGE);
        if stage.exists() {
            fs::remove_dir_all(&stage).map_err(|err| EngineError::io(&stage, err))?;
        }
        fs::create_dir_all(&stage).map_err(|err| EngineError::io(&stage, err))?;
        Ok(())
    }

    /// Writes the sandbox build profile: the profile's make.conf overlay
    /// followed by the engine's own knobs and the task's overrides.
    pub fn write_build_profile(&self, task: &BuildTask) -> Result<(), EngineError> {
        let etc = self.root.join("etc");
        fs::create_dir_all(&etc).map_err(|err| EngineError::io(&etc, err))?;
        let path = etc.join("make.conf");
        let mut file = File::create(&path).map_err(|err| EngineError::io(&path, err))?;

        if self.make_conf.is_file() {
            let overlay = fs::read_to_string(&self.make_conf)
                .map_err(|err| EngineError::io(&self.make_conf, err))?;
            writeln!(file, "{}", overlay.trim_end()).map_err(|err| EngineError::io(&path, err))?;
        }

        let mut lines = vec![
            format!("PORTSDIR=/{}", PORTS_MOUNT),
            "BATCH=yes".to_string(),
            "DISTDIR=/distfiles".to_string(),
            format!("WRKDIRPREFIX=/{}", WORK_MOUNT),
            format!("PACKAGES=/{}", PKG_STAGE),
            "PORT_DBDIR=/options".to_string(),
        ];
        if self.plan.iter().any(|m| m.target == Path::new("ccache")) {
            lines.push("CCACHE_DIR=/ccache".to_string());
        }
        for (key, value) in &task.env {
            lines.push(format!("{}={}", key, value));
        }

        for line in lines {
            writeln!(file, "{}", line).map_err(|err| EngineError::io(&path, err))?;
        }
        Ok(())
    }

    /// Installs the pre-built dependency packages into the sandbox.
    ///
    /// Returns `false` when the installer rejected a package; the task then
    /// fails in its dependency-staging step.
    pub fn stage_packages(&self, task: &BuildTask, log: &File) -> Result<bool, EngineError> {
        for host_path in &task.stage_packages {
            let name = match host_path.file_name() {
                Some(name) => name.to_string_lossy().to_string(),
                None => {
                    return Err(EngineError::Sandbox(format!(
                        "bad staged package path {}",
                        host_path.display()
                    )))
                }
            };
            let sandbox_path = format!("/packages/All/{}", name);

            let status = Command::new("pkg")
                .arg("-c")
                .arg(&self.root)
                .arg("add")
                .arg("-q")
                .arg(&sandbox_path)
                .stdin(Stdio::null())
                .stdout(Stdio::from(
                    log.try_clone()
                        .map_err(|err| EngineError::io(&task.log_path, err))?,
                ))
                .stderr(Stdio::from(
                    log.try_clone()
                        .map_err(|err| EngineError::io(&task.log_path, err))?,
                ))
                .status()
                .map_err(|err| EngineError::Sandbox(format!("unable to run pkg add: {}", err)))?;

            if !status.success() {
                warn!("staging {} into slot {:02} failed", name, self.slot_id);
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Command line for one build phase, chrooted into the slot root.
    pub fn phase_argv(&self, task: &BuildTask, phase: BuildPhase) -> Vec<String> {
        let mut argv = vec![
            self.root.display().to_string(),
            "make".to_string(),
            "-C".to_string(),
            format!("/{}/{}", PORTS_MOUNT, task.port.origin()),
        ];
        if let Some(flavor) = task.port.flavor() {
            argv.push(format!("FLAVOR={}", flavor));
        }
        argv.push(phase.as_str().to_string());
        argv
    }

    /// Runs one phase with all output appended to the per-port log.
    pub fn run_phase(
        &self,
        task: &BuildTask,
        phase: BuildPhase,
        log: &File,
    ) -> Result<ExitStatus, EngineError> {
        let argv = self.phase_argv(task, phase);
        let mut command = Command::new("chroot");
        command
            .args(&argv)
            .env("PORTSDIR", format!("/{}", PORTS_MOUNT))
            .env("BATCH", "yes")
            .stdin(Stdio::null())
            .stdout(Stdio::from(
                log.try_clone()
                    .map_err(|err| EngineError::io(&task.log_path, err))?,
            ))
            .stderr(Stdio::from(
                log.try_clone()
                    .map_err(|err| EngineError::io(&task.log_path, err))?,
            ));
        for (key, value) in &task.env {
            command.env(key, value);
        }

        command
            .status()
            .map_err(|err| EngineError::Sandbox(format!("unable to run chroot: {}", err)))
    }

    /// Expected location of the package the `package` phase produced.
    pub fn staged_package_path(&self, pkgname: &str) -> PathBuf {
        self.root
            .join(PKG_STAGE)
            .join("All")
            .join(format!("{}.pkg", pkgname))
    }

    /// Copies the produced package out of the sandbox into the repository.
    pub fn capture_package(
        &self,
        task: &BuildTask,
        repo: &Repository,
    ) -> Result<PathBuf, EngineError> {
        let staged = self.staged_package_path(&task.pkgname);
        if !staged.is_file() {
            return Err(EngineError::Sandbox(format!(
                "package phase produced no {}",
                staged.display()
            )));
        }
        repo.publish(&staged, &task.pkgname, &task.fingerprint)
    }

    /// Unmounts everything in reverse mount order. Idempotent; a failure
    /// leaves the remaining entries mounted and must retire the slot.
    pub fn teardown(&mut self) -> Result<(), EngineError> {
        for idx in (0..self.plan.len()).rev() {
            self.unmount(idx)?;
        }
        Ok(())
    }
}

/// Appends a phase banner to the build log.
pub fn log_phase_banner(log: &mut File, phase: BuildPhase) -> std::io::Result<()> {
    writeln!(log, "--------------------------------------------------")?;
    writeln!(log, "--  phase: {}", phase)?;
    writeln!(log, "--------------------------------------------------")?;
    log.flush()
}

/// Opens (truncating) the per-port build log.
pub fn open_build_log(path: &Path) -> std::io::Result<File> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::collections::BTreeMap;

    use kiln_core::Fingerprint;

    use crate::config::CONFIG_TEMPLATE;

    fn test_config(dir: &Path) -> Config {
        let path = dir.join("kiln.ini");
        let contents = CONFIG_TEMPLATE.replace("/build/kiln", &dir.display().to_string());
        fs::write(&path, contents).expect("Failed to write config fixture");
        Config::load(&path, None).expect("Failed to load config fixture")
    }

    fn sample_task(dir: &Path) -> BuildTask {
        BuildTask {
            port: "editors/joe".parse().expect("Failed to parse port id"),
            version: "4.6_1".to_string(),
            pkgname: "joe-4.6_1".to_string(),
            fingerprint: Fingerprint::random(),
            stage_packages: Vec::new(),
            env: {
                let mut env = BTreeMap::new();
                env.insert("DEVELOPER".to_string(), "yes".to_string());
                env
            },
            log_path: dir.join("editors___joe.log"),
        }
    }

    #[test]
    fn plan_starts_with_base_tmpfs_and_mounts_ports_read_only() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let config = test_config(dir.path());
        let plan = mount_plan(&config);

        assert_eq!(plan[0], MountPoint::tmpfs(""));

        let ports = plan
            .iter()
            .find(|m| m.target == Path::new(PORTS_MOUNT))
            .expect("ports mount missing from plan");
        match ports.source {
            MountSource::Nullfs { writable, .. } => assert!(!writable),
            ref other => panic!("unexpected ports mount source: {:?}", other),
        }

        let distfiles = plan
            .iter()
            .find(|m| m.target == Path::new("distfiles"))
            .expect("distfiles mount missing from plan");
        match distfiles.source {
            MountSource::Nullfs { writable, .. } => assert!(writable),
            ref other => panic!("unexpected distfiles mount source: {:?}", other),
        }
    }

    #[test]
    fn disabled_ccache_is_not_mounted() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let config = test_config(dir.path());
        let plan = mount_plan(&config);
        assert!(plan.iter().all(|m| m.target != Path::new("ccache")));
    }

    #[test]
    fn tmpfs_work_areas_follow_the_config() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let mut config = test_config(dir.path());
        config.tmpfs_workdir = false;
        config.tmpfs_localbase = false;
        let plan = mount_plan(&config);
        assert!(plan.iter().all(|m| m.target != Path::new(WORK_MOUNT)));
        assert!(plan.iter().all(|m| m.target != Path::new("usr/local")));
    }

    #[test]
    fn nullfs_mount_argv_is_well_formed() {
        let mount = MountPoint::nullfs(Path::new("/usr/ports"), PORTS_MOUNT, false);
        let argv = mount.mount_argv(Path::new("/build/SL00"));
        assert_eq!(
            argv,
            ["-t", "nullfs", "-o", "ro", "/usr/ports", "/build/SL00/xports"]
        );
    }

    #[test]
    fn phase_argv_chroots_into_the_port_directory() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let config = test_config(dir.path());
        let sandbox = Sandbox::new(&config, 2);
        let task = sample_task(dir.path());

        let argv = sandbox.phase_argv(&task, BuildPhase::Configure);
        assert_eq!(argv[0], config.slot_root(2).display().to_string());
        assert_eq!(argv[1..], ["make", "-C", "/xports/editors/joe", "configure"]);
    }

    #[test]
    fn flavored_ports_get_a_flavor_assignment() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let config = test_config(dir.path());
        let sandbox = Sandbox::new(&config, 0);
        let mut task = sample_task(dir.path());
        task.port = "devel/py-six@py39".parse().expect("Failed to parse port id");

        let argv = sandbox.phase_argv(&task, BuildPhase::Build);
        assert!(argv.contains(&"FLAVOR=py39".to_string()));
        assert!(argv.contains(&"-C".to_string()));
        assert_eq!(argv.last(), Some(&"build".to_string()));
    }

    #[test]
    fn build_profile_carries_engine_knobs_and_task_env() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let config = test_config(dir.path());
        let mut sandbox = Sandbox::new(&config, 1);
        // Point the sandbox root into the temp dir; no mounts needed for
        // profile writing.
        sandbox.root = dir.path().join("SL01");
        let task = sample_task(dir.path());

        sandbox
            .write_build_profile(&task)
            .expect("Failed to write build profile");

        let contents = fs::read_to_string(sandbox.root.join("etc/make.conf"))
            .expect("Failed to read make.conf");
        assert!(contents.contains("PORTSDIR=/xports"));
        assert!(contents.contains("BATCH=yes"));
        assert!(contents.contains("PACKAGES=/pkgstage"));
        assert!(contents.contains("DEVELOPER=yes"));
    }

    #[test]
    fn build_profile_prepends_the_profile_overlay() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let config = test_config(dir.path());
        fs::write(config.make_conf_path(), "OPTIONS_UNSET=X11\n")
            .expect("Failed to write overlay");

        let mut sandbox = Sandbox::new(&config, 1);
        sandbox.root = dir.path().join("SL01");
        let task = sample_task(dir.path());
        sandbox
            .write_build_profile(&task)
            .expect("Failed to write build profile");

        let contents = fs::read_to_string(sandbox.root.join("etc/make.conf"))
            .expect("Failed to read make.conf");
        let overlay_at = contents
            .find("OPTIONS_UNSET=X11")
            .expect("overlay missing from make.conf");
        let knob_at = contents
            .find("PORTSDIR=")
            .expect("engine knob missing from make.conf");
        assert!(overlay_at < knob_at);
    }

    #[test]
    fn capture_publishes_the_staged_package() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let config = test_config(dir.path());
        let mut sandbox = Sandbox::new(&config, 0);
        sandbox.root = dir.path().join("SL00");
        let task = sample_task(dir.path());

        let staged_dir = sandbox.root.join(PKG_STAGE).join("All");
        fs::create_dir_all(&staged_dir).expect("Failed to create stage dir");
        fs::write(staged_dir.join("joe-4.6_1.pkg"), b"pkg payload")
            .expect("Failed to write staged package");

        let repo =
            Repository::open(&dir.path().join("All")).expect("Failed to open repository");
        let published = sandbox
            .capture_package(&task, &repo)
            .expect("Failed to capture package");
        assert!(published.is_file());
        assert!(repo.is_built("joe-4.6_1", &task.fingerprint));
    }

    #[test]
    fn capture_without_a_package_is_an_error() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let config = test_config(dir.path());
        let mut sandbox = Sandbox::new(&config, 0);
        sandbox.root = dir.path().join("SL00");
        let task = sample_task(dir.path());

        let repo =
            Repository::open(&dir.path().join("All")).expect("Failed to open repository");
        sandbox
            .capture_package(&task, &repo)
            .expect_err("Failed to reject missing package");
    }

    #[test]
    fn teardown_without_mounts_is_a_no_op() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let config = test_config(dir.path());
        let mut sandbox = Sandbox::new(&config, 0);
        sandbox.teardown().expect("Failed to tear down");
        sandbox.teardown().expect("Failed to tear down twice");
    }
}
