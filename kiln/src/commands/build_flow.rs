//! The shared build pipeline behind most directives.
//!
//! Every building directive is the same skeleton with different toggles:
//! ingest a port list, resolve it, run the scheduler, then optionally
//! rebuild the repository database and upgrade the host.

use std::collections::BTreeSet;
use std::fs::{self, File};
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::process::Command;
use std::time::Duration;

use failure::{bail, format_err, Error};
use fs2::FileExt;
use log::{info, warn};

use kiln_core::PortId;
use kiln_engine::config::{self, Config};
use kiln_engine::graph::PortState;
use kiln_engine::metadata::{MakeLoader, PortMetadataSource};
use kiln_engine::pkglist;
use kiln_engine::repo::{self, Repository};
use kiln_engine::resolver::{resolve, ResolveOptions};
use kiln_engine::sandbox::Sandbox;
use kiln_engine::scheduler::{watch_signals, Scheduler, SchedulerOptions};
use kiln_engine::slot::ProcessLauncher;
use kiln_engine::status::{StatusBus, SummaryLog};

use super::CommonFlags;
use crate::ui;

/// Where the configuration is looked for, in order.
const CONFIG_DIRS: &[&str] = &["/etc/kiln", "/usr/local/etc/kiln"];

#[derive(Clone, Debug)]
pub enum ListSource {
    Args(Vec<String>),
    LocalSystem,
    Everything,
}

#[derive(Debug)]
pub struct BuildFlow {
    list: ListSource,
    dry_run: bool,
    delete_first: bool,
    developer_mode: bool,
    rebuild_repo: bool,
    upgrade_host: bool,
    ask_before_post_steps: bool,
}

impl BuildFlow {
    pub fn new(list: ListSource) -> Self {
        BuildFlow {
            list,
            dry_run: false,
            delete_first: false,
            developer_mode: false,
            rebuild_repo: false,
            upgrade_host: false,
            ask_before_post_steps: false,
        }
    }

    pub fn dry_run(list: ListSource) -> Self {
        let mut flow = BuildFlow::new(list);
        flow.dry_run = true;
        flow
    }

    pub fn delete_first(mut self) -> Self {
        self.delete_first = true;
        self
    }

    pub fn developer_mode(mut self) -> Self {
        self.developer_mode = true;
        self
    }

    pub fn rebuild_repo(mut self) -> Self {
        self.rebuild_repo = true;
        self
    }

    pub fn upgrade_host(mut self) -> Self {
        self.upgrade_host = true;
        self
    }

    pub fn ask_before_post_steps(mut self) -> Self {
        self.ask_before_post_steps = true;
        self
    }

    pub fn run(self, flags: &CommonFlags) -> Result<i32, Error> {
        let config = load_config()?;
        fs::create_dir_all(&config.dir_logs)?;
        fs::create_dir_all(&config.dir_buildbase)?;
        let _lock = lock_build_base(&config)?;

        let seeds = self.collect_seeds(&config)?;
        let repo = Repository::open(&config.dir_repository)?;
        let mut loader = MakeLoader::new(config.dir_portsdir.clone());

        if self.delete_first {
            for seed in &seeds {
                match loader.metadata(seed) {
                    Ok(meta) => repo.remove(&meta.pkgname)?,
                    Err(err) => warn!("{}", err),
                }
            }
        }

        let mut options = ResolveOptions::default();
        if self.developer_mode {
            options.include_test_deps = true;
            options
                .build_env
                .insert("DEVELOPER".to_string(), "yes".to_string());
        }

        let graph = resolve(&mut loader, &repo, &config, &seeds, &options)?;

        if self.dry_run {
            return Ok(print_status(&graph));
        }

        let mut bus = StatusBus::new();
        let summary_log = SummaryLog::spawn(&config.summary_log_path(), bus.subscribe())?;
        // Without the full-screen display, the console prints phase detail.
        let verbose = flags.debug || !config.display_ncurses;
        let console = ui::spawn_console(bus.subscribe(), verbose);

        let exec_path = std::env::current_exe()?;
        let launcher = ProcessLauncher::new(
            exec_path,
            config.config_path.clone(),
            config.profile.clone(),
        );

        let scheduler_options = SchedulerOptions {
            slow_start: flags.slow_start.unwrap_or(1),
            slow_start_step: Duration::from_secs(30),
            grace_period: Duration::from_secs(30),
            build_env: options.build_env.clone(),
        };
        let scheduler = Scheduler::new(
            graph,
            &config,
            repo.clone(),
            Box::new(launcher),
            bus,
            scheduler_options,
        );
        watch_signals(scheduler.event_sender())?;

        let summary = scheduler.run()?;
        summary_log.join();
        console.join();

        let tally = summary.tally;
        println!(
            "Run complete: built {} failed {} skipped {} ignored {}",
            tally.succeeded, tally.failed, tally.skipped, tally.ignored
        );
        for (port, reason) in &summary.failed_ports {
            println!("  failed: {} ({})", port, reason);
        }

        if summary.interrupted {
            return Ok(summary.exit_code());
        }

        let post_ok = !self.ask_before_post_steps
            || confirm("Rebuild repository and apply post-build steps?", flags.yes)?;
        if post_ok {
            if self.rebuild_repo {
                repo.rebuild_database(&config.dir_packages)?;
            }
            if self.upgrade_host {
                upgrade_host(flags.yes)?;
            }
        }

        Ok(summary.exit_code())
    }

    fn collect_seeds(&self, config: &Config) -> Result<Vec<PortId>, Error> {
        let seeds = match self.list {
            ListSource::Args(ref args) => {
                if args.is_empty() {
                    bail!("no ports specified; pass origins or a list file");
                }
                pkglist::ingest_args(args)?
            }
            ListSource::LocalSystem => pkglist::local_system_list()?,
            ListSource::Everything => pkglist::full_tree_list(&config.dir_portsdir)?,
        };
        info!("operating on {} ports", seeds.len());
        Ok(seeds)
    }
}

/// Prints the dry-run report and returns the exit code.
fn print_status(graph: &kiln_engine::graph::BuildGraph) -> i32 {
    let mut would_build = Vec::new();
    let mut prebuilt = 0usize;
    let mut unbuildable = Vec::new();

    for (_, node) in graph.iter() {
        match node.state() {
            PortState::Pending | PortState::Ready => would_build.push(node.id().to_string()),
            PortState::Succeeded => prebuilt += 1,
            PortState::Ignored | PortState::Skipped => unbuildable.push(format!(
                "{} ({})",
                node.id(),
                node.failure_reason()
                    .map(|r| r.to_string())
                    .unwrap_or_default()
            )),
            _ => {}
        }
    }

    would_build.sort();
    println!("Would build {} ports:", would_build.len());
    for port in &would_build {
        println!("  {}", port);
    }
    if prebuilt > 0 {
        println!("Up to date: {}", prebuilt);
    }
    if !unbuildable.is_empty() {
        println!("Not buildable:");
        for line in &unbuildable {
            println!("  {}", line);
        }
    }
    0
}

pub fn init() -> Result<i32, Error> {
    let config_dir = PathBuf::from(CONFIG_DIRS[0]);
    for dir in CONFIG_DIRS {
        if PathBuf::from(dir).join("kiln.ini").exists() {
            bail!("init will not overwrite {}/kiln.ini", dir);
        }
    }
    let path = config::write_template(&config_dir)?;
    println!("Wrote {}", path.display());
    Ok(0)
}

pub fn configure() -> Result<i32, Error> {
    let config = load_config()?;
    println!(
        "Edit {} (profile [{}]) to configure kiln",
        config.config_path.display(),
        config.profile
    );
    Ok(0)
}

/// Unmounts whatever stale sandboxes a crashed run left behind.
pub fn cleanup() -> Result<i32, Error> {
    let config = load_config()?;
    let entries = match fs::read_dir(&config.dir_buildbase) {
        Ok(entries) => entries,
        Err(_) => return Ok(0),
    };

    for entry in entries {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().to_string();
        if !name.starts_with("SL") {
            continue;
        }
        if let Ok(slot_id) = name[2..].parse::<u32>() {
            info!("scrubbing stale sandbox {}", name);
            Sandbox::new(&config, slot_id).scrub();
        }
    }
    Ok(0)
}

pub fn rebuild_repository() -> Result<i32, Error> {
    let config = load_config()?;
    let repo = Repository::open(&config.dir_repository)?;
    repo.rebuild_database(&config.dir_packages)?;
    Ok(0)
}

pub fn purge_distfiles() -> Result<i32, Error> {
    let config = load_config()?;
    let ports = pkglist::full_tree_list(&config.dir_portsdir)?;
    let mut loader = MakeLoader::new(config.dir_portsdir.clone());

    let mut referenced = BTreeSet::new();
    for port in &ports {
        match loader.metadata(port) {
            Ok(meta) => referenced.extend(meta.distfiles.iter().cloned()),
            Err(err) => warn!("{}", err),
        }
    }

    let removed = repo::purge_distfiles(&config.dir_distfiles, &referenced)?;
    println!("Purged {} obsolete distfiles", removed);
    Ok(0)
}

fn load_config() -> Result<Config, Error> {
    for dir in CONFIG_DIRS {
        let path = PathBuf::from(dir).join("kiln.ini");
        if path.is_file() {
            return Ok(Config::load(&path, None)?);
        }
    }
    Err(format_err!(
        "no configuration found; run 'kiln init' to create {}/kiln.ini",
        CONFIG_DIRS[0]
    ))
}

/// Holds the build-base lock for the lifetime of the run.
fn lock_build_base(config: &Config) -> Result<File, Error> {
    let path = config.dir_buildbase.join(".lock");
    let file = File::create(&path)?;
    file.try_lock_exclusive()
        .map_err(|_| format_err!("another kiln run holds {}", path.display()))?;
    Ok(file)
}

fn confirm(prompt: &str, yes: bool) -> Result<bool, Error> {
    if yes {
        return Ok(true);
    }
    print!("{} [y/N] ", prompt);
    io::stdout().flush()?;

    let stdin = io::stdin();
    let mut answer = String::new();
    stdin.lock().read_line(&mut answer)?;
    let answer = answer.trim().to_lowercase();
    Ok(answer == "y" || answer == "yes")
}

fn upgrade_host(yes: bool) -> Result<(), Error> {
    let mut command = Command::new("pkg");
    command.arg("upgrade");
    if yes {
        command.arg("-y");
    }
    let status = command.status()?;
    if !status.success() {
        bail!("pkg upgrade exited with {}", status);
    }
    Ok(())
}
