use std::path::PathBuf;

use failure::Error;
use structopt::clap::AppSettings;
use structopt::StructOpt;

use self::build_flow::{BuildFlow, ListSource};

mod build_flow;
mod worker;

/// Flags accepted by every directive.
#[derive(Debug, StructOpt)]
pub struct CommonFlags {
    /// Automatically answer yes to confirmation prompts
    #[structopt(short = "y", global = true)]
    pub yes: bool,
    /// Debugging output; forces the plain-text display
    #[structopt(short = "d", global = true)]
    pub debug: bool,
    /// Initial slow-start parallelism
    #[structopt(short = "s", global = true)]
    pub slow_start: Option<u32>,
    /// Display version info and exit
    #[structopt(short = "v", global = true)]
    pub version: bool,
}

#[derive(Debug, StructOpt)]
pub enum Directive {
    /// Initialize the configuration directory
    #[structopt(name = "init")]
    Init,
    /// Dry-run: resolve and report what would be built
    #[structopt(name = "status")]
    Status { ports: Vec<String> },
    /// Clean up stale sandbox mounts
    #[structopt(name = "cleanup")]
    Cleanup,
    /// Point at the configuration file to edit
    #[structopt(name = "configure")]
    Configure,
    /// Build the locally installed set, rebuild the repo, upgrade the host
    #[structopt(name = "upgrade-system")]
    UpgradeSystem,
    /// Same as upgrade-system but stops after building
    #[structopt(name = "prepare-system")]
    PrepareSystem,
    /// Rebuild the repository database only
    #[structopt(name = "rebuild-repository")]
    RebuildRepository,
    /// Delete source distfiles no port references any more
    #[structopt(name = "purge-distfiles")]
    PurgeDistfiles,
    /// Dry-run of everything
    #[structopt(name = "status-everything")]
    StatusEverything,
    /// Build the whole ports tree
    #[structopt(name = "everything")]
    Everything,
    /// Display version info and exit
    #[structopt(name = "version")]
    Version,
    /// Build the listed ports, then rebuild the repo and ask to upgrade
    #[structopt(name = "build")]
    Build { ports: Vec<String> },
    /// Build the listed ports and nothing else
    #[structopt(name = "just-build")]
    JustBuild { ports: Vec<String> },
    /// Build the listed ports and upgrade the host without asking
    #[structopt(name = "install")]
    Install { ports: Vec<String> },
    /// Delete existing packages for the listed ports, then build
    #[structopt(name = "force")]
    Force { ports: Vec<String> },
    /// Delete and rebuild the listed ports with DEVELOPER=yes
    #[structopt(name = "test")]
    Test { ports: Vec<String> },
    /// Like just-build, kept for compatibility with scripted runs
    #[structopt(name = "debug", setting = AppSettings::Hidden)]
    Debug { ports: Vec<String> },
    /// Internal: run as a worker slot
    #[structopt(name = "WORKER", setting = AppSettings::Hidden)]
    Worker {
        slot_id: u32,
        config: PathBuf,
        profile: String,
    },
}

impl Directive {
    pub fn run(self, flags: CommonFlags) -> Result<i32, Error> {
        match self {
            Directive::Init => build_flow::init(),
            Directive::Status { ports } => {
                // With no list this is a dry run of upgrade-system.
                let list = if ports.is_empty() {
                    ListSource::LocalSystem
                } else {
                    ListSource::Args(ports)
                };
                BuildFlow::dry_run(list).run(&flags)
            }
            Directive::Cleanup => build_flow::cleanup(),
            Directive::Configure => build_flow::configure(),
            Directive::UpgradeSystem => BuildFlow::new(ListSource::LocalSystem)
                .rebuild_repo()
                .upgrade_host()
                .run(&flags),
            Directive::PrepareSystem => BuildFlow::new(ListSource::LocalSystem)
                .rebuild_repo()
                .run(&flags),
            Directive::RebuildRepository => build_flow::rebuild_repository(),
            Directive::PurgeDistfiles => build_flow::purge_distfiles(),
            Directive::StatusEverything => BuildFlow::dry_run(ListSource::Everything).run(&flags),
            Directive::Everything => BuildFlow::new(ListSource::Everything)
                .rebuild_repo()
                .run(&flags),
            Directive::Version => {
                println!("kiln {}", env!("CARGO_PKG_VERSION"));
                Ok(0)
            }
            Directive::Build { ports } => BuildFlow::new(ListSource::Args(ports))
                .rebuild_repo()
                .upgrade_host()
                .ask_before_post_steps()
                .run(&flags),
            Directive::JustBuild { ports } | Directive::Debug { ports } => {
                BuildFlow::new(ListSource::Args(ports)).run(&flags)
            }
            Directive::Install { ports } => BuildFlow::new(ListSource::Args(ports))
                .rebuild_repo()
                .upgrade_host()
                .run(&flags),
            Directive::Force { ports } => BuildFlow::new(ListSource::Args(ports))
                .delete_first()
                .rebuild_repo()
                .upgrade_host()
                .ask_before_post_steps()
                .run(&flags),
            Directive::Test { ports } => BuildFlow::new(ListSource::Args(ports))
                .delete_first()
                .developer_mode()
                .run(&flags),
            Directive::Worker {
                slot_id,
                config,
                profile,
            } => worker::run(slot_id, &config, &profile),
        }
    }
}
