//! Expansion of a seed set into a frozen build graph.
//!
//! Resolution walks the dependency edges reported by the metadata loader,
//! freezes the graph, assigns fingerprints bottom-up, and finally folds in
//! packages that already exist in the repository so they are never
//! scheduled again.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Arc;

use log::{debug, info};

use kiln_core::{DepPhase, Fingerprint, PortId};

use crate::config::Config;
use crate::error::EngineError;
use crate::graph::{BuildGraph, FailureReason, NodeId, PortState};
use crate::metadata::{PortMetadata, PortMetadataSource};
use crate::repo::Repository;

/// Knobs that vary between directives.
#[derive(Clone, Debug, Default)]
pub struct ResolveOptions {
    /// Follow TEST dependency edges (the `test` directive).
    pub include_test_deps: bool,
    /// Environment overrides that change what gets built, folded into every
    /// fingerprint (e.g. `DEVELOPER=yes`).
    pub build_env: BTreeMap<String, String>,
}

/// Resolves `seeds` into a frozen `BuildGraph` ready for scheduling.
pub fn resolve(
    source: &mut dyn PortMetadataSource,
    repo: &Repository,
    config: &Config,
    seeds: &[PortId],
    options: &ResolveOptions,
) -> Result<BuildGraph, EngineError> {
    let mut phases = vec![
        DepPhase::Extract,
        DepPhase::Patch,
        DepPhase::Build,
        DepPhase::Run,
    ];
    if options.include_test_deps {
        phases.push(DepPhase::Test);
    }

    // Worklist expansion across the selected phases.
    let mut metadata: BTreeMap<PortId, Option<Arc<PortMetadata>>> = BTreeMap::new();
    let mut failures: BTreeMap<PortId, String> = BTreeMap::new();
    let mut queue: VecDeque<PortId> = seeds.iter().cloned().collect();

    while let Some(port) = queue.pop_front() {
        if metadata.contains_key(&port) {
            continue;
        }

        match source.metadata(&port) {
            Ok(meta) => {
                for phase in &phases {
                    for dep in meta.deps(*phase) {
                        if !metadata.contains_key(dep) {
                            queue.push_back(dep.clone());
                        }
                    }
                }
                metadata.insert(port, Some(meta));
            }
            Err(err) => {
                info!("{}", err);
                failures.insert(port.clone(), err.reason);
                metadata.insert(port, None);
            }
        }
    }

    // Node creation. BTreeMap iteration keeps ids deterministic across runs.
    let mut graph = BuildGraph::new();
    let mut ids: BTreeMap<PortId, NodeId> = BTreeMap::new();
    for (port, meta) in &metadata {
        let (version, pkgname) = match meta {
            Some(meta) => (meta.version.clone(), meta.pkgname.clone()),
            None => ("unknown".to_string(), format!("{}-unknown", port.origin().name())),
        };
        let node = graph.add_node(port.clone(), version, pkgname, config.log_path(port));
        ids.insert(port.clone(), node);
    }

    for (port, meta) in &metadata {
        let node = ids[port];
        match meta {
            Some(meta) => {
                for phase in &phases {
                    let deps: Vec<NodeId> =
                        meta.deps(*phase).map(|dep| ids[dep]).collect();
                    graph.add_deps(node, *phase, &deps);
                }
            }
            None => {
                let reason = failures
                    .get(port)
                    .cloned()
                    .unwrap_or_else(|| "metadata extraction failed".to_string());
                graph.ignore_node(node, FailureReason::Metadata(reason));
            }
        }
    }

    graph.freeze();
    assign_fingerprints(&mut graph, &metadata, options);
    fold_in_built_packages(&mut graph, repo, config.leverage_prebuilt);

    debug!(
        "resolved {} ports from {} seeds",
        graph.len(),
        seeds.len()
    );
    Ok(graph)
}

/// Bottom-up fingerprint assignment over BUILD and RUN dependencies.
fn assign_fingerprints(
    graph: &mut BuildGraph,
    metadata: &BTreeMap<PortId, Option<Arc<PortMetadata>>>,
    options: &ResolveOptions,
) {
    for node in graph.topo_order() {
        let meta = match metadata.get(graph.node(node).id()) {
            Some(Some(meta)) => meta.clone(),
            _ => continue,
        };

        let mut inputs: Vec<(PortId, Fingerprint)> = Vec::new();
        let mut missing_dep = false;
        {
            let entry = graph.node(node);
            let mut dep_ids = BTreeSet::new();
            for dep in entry.deps(DepPhase::Build).chain(entry.deps(DepPhase::Run)) {
                dep_ids.insert(dep);
            }
            for dep in dep_ids {
                let dep_node = graph.node(dep);
                if dep == node {
                    continue;
                }
                match dep_node.fingerprint() {
                    Some(fp) => inputs.push((dep_node.id().clone(), *fp)),
                    // Dependency on an ignored node; this node is skipped
                    // anyway and needs no fingerprint.
                    None => missing_dep = true,
                }
            }
        }
        if missing_dep {
            continue;
        }

        inputs.sort_by(|a, b| a.0.cmp(&b.0));
        let mut recorder = Fingerprint::record().version(&meta.version);
        for (_, fp) in &inputs {
            recorder = recorder.dependency(fp);
        }
        for option in &meta.options {
            recorder = recorder.option("port", option);
        }
        for (key, value) in &options.build_env {
            recorder = recorder.option(key, value);
        }
        graph.set_fingerprint(node, recorder.finish());
    }
}

/// Marks nodes whose package already exists with a matching fingerprint as
/// `Succeeded` so the scheduler never dispatches them.
///
/// With `leverage_prebuilt`, a package file dropped into the repository by
/// some other producer (no recorded fingerprint) is trusted too.
fn fold_in_built_packages(graph: &mut BuildGraph, repo: &Repository, leverage_prebuilt: bool) {
    for node in graph.topo_order() {
        let built = {
            let entry = graph.node(node);
            if entry.state() != PortState::Pending && entry.state() != PortState::Ready {
                continue;
            }
            match entry.fingerprint() {
                Some(fp) => {
                    repo.is_built(entry.pkgname(), fp)
                        || (leverage_prebuilt
                            && repo.recorded_fingerprint(entry.pkgname()).is_none()
                            && repo.package_path(entry.pkgname()).is_file())
                }
                None => false,
            }
        };

        if built {
            debug!("{} is already built", graph.node(node).id());
            graph.mark_succeeded(node);
        }
    }
}

/// Scripted fixtures shared by resolver and scheduler tests.
#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    use std::collections::HashMap;
    use std::path::Path;

    use crate::config::CONFIG_TEMPLATE;
    use crate::metadata::MetadataError;

    /// In-memory metadata source used to script resolution scenarios.
    #[derive(Debug, Default)]
    pub struct StaticSource {
        ports: HashMap<PortId, PortMetadata>,
        broken: BTreeSet<PortId>,
    }

    impl StaticSource {
        pub fn new() -> Self {
            StaticSource::default()
        }

        pub fn add(&mut self, origin: &str, version: &str, deps: &[(DepPhase, &str)]) {
            let id: PortId = origin.parse().expect("Failed to parse port id");
            let mut dep_map: BTreeMap<DepPhase, BTreeSet<PortId>> = BTreeMap::new();
            for (phase, dep) in deps {
                dep_map
                    .entry(*phase)
                    .or_default()
                    .insert(dep.parse().expect("Failed to parse dep id"));
            }
            let meta = PortMetadata {
                id: id.clone(),
                pkgname: format!("{}-{}", id.origin().name(), version),
                version: version.to_string(),
                deps: dep_map,
                distfiles: Vec::new(),
                options: Vec::new(),
            };
            self.ports.insert(id, meta);
        }

        pub fn add_broken(&mut self, origin: &str) {
            self.broken
                .insert(origin.parse().expect("Failed to parse port id"));
        }
    }

    impl PortMetadataSource for StaticSource {
        fn metadata(&mut self, id: &PortId) -> Result<Arc<PortMetadata>, MetadataError> {
            if self.broken.contains(id) {
                return Err(MetadataError {
                    port: id.clone(),
                    reason: "scripted failure".to_string(),
                });
            }
            self.ports
                .get(id)
                .cloned()
                .map(Arc::new)
                .ok_or_else(|| MetadataError {
                    port: id.clone(),
                    reason: "unknown port".to_string(),
                })
        }
    }

    pub fn test_config(dir: &Path) -> Config {
        let path = dir.join("kiln.ini");
        std::fs::write(&path, CONFIG_TEMPLATE).expect("Failed to write config fixture");
        Config::load(&path, None).expect("Failed to load config fixture")
    }

    pub fn seeds(list: &[&str]) -> Vec<PortId> {
        list.iter()
            .map(|s| s.parse().expect("Failed to parse seed"))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::testing::{seeds, test_config, StaticSource};
    use super::*;

    use crate::config::CONFIG_TEMPLATE;

    fn joe_tree() -> StaticSource {
        let mut source = StaticSource::new();
        source.add("editors/joe", "4.6_1", &[(DepPhase::Build, "devel/gettext")]);
        source.add("devel/gettext", "0.21", &[]);
        source
    }

    #[test]
    fn closure_contains_transitive_deps() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let config = test_config(dir.path());
        let repo = Repository::open(&dir.path().join("All")).expect("Failed to open repo");
        let mut source = joe_tree();

        let graph = resolve(
            &mut source,
            &repo,
            &config,
            &seeds(&["editors/joe"]),
            &ResolveOptions::default(),
        )
        .expect("Failed to resolve");

        assert_eq!(graph.len(), 2);
        let joe = graph
            .node_id(&"editors/joe".parse().expect("Failed to parse"))
            .expect("joe missing from graph");
        let gettext = graph
            .node_id(&"devel/gettext".parse().expect("Failed to parse"))
            .expect("gettext missing from graph");
        assert_eq!(graph.node(joe).state(), PortState::Pending);
        assert_eq!(graph.node(gettext).state(), PortState::Ready);
    }

    #[test]
    fn resolution_is_deterministic() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let config = test_config(dir.path());
        let repo = Repository::open(&dir.path().join("All")).expect("Failed to open repo");

        let run = || {
            let mut source = joe_tree();
            let graph = resolve(
                &mut source,
                &repo,
                &config,
                &seeds(&["editors/joe"]),
                &ResolveOptions::default(),
            )
            .expect("Failed to resolve");
            let mut view: Vec<(String, String)> = graph
                .iter()
                .map(|(_, node)| {
                    (
                        node.id().to_string(),
                        node.fingerprint()
                            .map(|fp| fp.to_string())
                            .unwrap_or_default(),
                    )
                })
                .collect();
            view.sort();
            view
        };

        assert_eq!(run(), run());
    }

    #[test]
    fn fingerprints_chain_through_dependencies() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let config = test_config(dir.path());
        let repo = Repository::open(&dir.path().join("All")).expect("Failed to open repo");

        let fingerprint_of = |gettext_version: &str| {
            let mut source = StaticSource::new();
            source.add("editors/joe", "4.6_1", &[(DepPhase::Build, "devel/gettext")]);
            source.add("devel/gettext", gettext_version, &[]);
            let graph = resolve(
                &mut source,
                &repo,
                &config,
                &seeds(&["editors/joe"]),
                &ResolveOptions::default(),
            )
            .expect("Failed to resolve");
            let joe = graph
                .node_id(&"editors/joe".parse().expect("Failed to parse"))
                .expect("joe missing");
            *graph.node(joe).fingerprint().expect("joe has no fingerprint")
        };

        // Bumping a dependency changes the dependent's fingerprint too.
        assert_ne!(fingerprint_of("0.21"), fingerprint_of("0.22"));
    }

    #[test]
    fn build_env_changes_fingerprints() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let config = test_config(dir.path());
        let repo = Repository::open(&dir.path().join("All")).expect("Failed to open repo");

        let fingerprint_with = |env: &[(&str, &str)]| {
            let mut source = joe_tree();
            let mut options = ResolveOptions::default();
            for (k, v) in env {
                options.build_env.insert(k.to_string(), v.to_string());
            }
            let graph = resolve(
                &mut source,
                &repo,
                &config,
                &seeds(&["editors/joe"]),
                &options,
            )
            .expect("Failed to resolve");
            let joe = graph
                .node_id(&"editors/joe".parse().expect("Failed to parse"))
                .expect("joe missing");
            *graph.node(joe).fingerprint().expect("joe has no fingerprint")
        };

        assert_ne!(
            fingerprint_with(&[]),
            fingerprint_with(&[("DEVELOPER", "yes")])
        );
    }

    #[test]
    fn metadata_failure_ignores_port_and_skips_dependents() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let config = test_config(dir.path());
        let repo = Repository::open(&dir.path().join("All")).expect("Failed to open repo");

        let mut source = StaticSource::new();
        source.add("editors/joe", "4.6_1", &[(DepPhase::Build, "devel/lost")]);
        source.add_broken("devel/lost");

        let graph = resolve(
            &mut source,
            &repo,
            &config,
            &seeds(&["editors/joe"]),
            &ResolveOptions::default(),
        )
        .expect("Failed to resolve");

        let lost = graph
            .node_id(&"devel/lost".parse().expect("Failed to parse"))
            .expect("lost missing");
        let joe = graph
            .node_id(&"editors/joe".parse().expect("Failed to parse"))
            .expect("joe missing");
        assert_eq!(graph.node(lost).state(), PortState::Ignored);
        assert_eq!(graph.node(joe).state(), PortState::Skipped);
        assert_eq!(
            graph.node(joe).failure_reason().map(|r| r.to_string()),
            Some("upstream ignored".to_string())
        );
    }

    #[test]
    fn two_node_cycle_is_ignored_with_dependent_skipped() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let config = test_config(dir.path());
        let repo = Repository::open(&dir.path().join("All")).expect("Failed to open repo");

        let mut source = StaticSource::new();
        source.add("devel/a", "1.0", &[(DepPhase::Build, "devel/b")]);
        source.add("devel/b", "1.0", &[(DepPhase::Build, "devel/a")]);
        source.add("www/c", "1.0", &[(DepPhase::Build, "devel/a")]);

        let graph = resolve(
            &mut source,
            &repo,
            &config,
            &seeds(&["www/c"]),
            &ResolveOptions::default(),
        )
        .expect("Failed to resolve");

        let tally = graph.tally();
        assert_eq!(tally.ignored, 2);
        assert_eq!(tally.skipped, 1);
        assert!(graph.is_complete());
    }

    #[test]
    fn already_built_packages_start_succeeded() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let config = test_config(dir.path());
        let repo = Repository::open(&dir.path().join("All")).expect("Failed to open repo");

        // First resolution computes the fingerprints we publish under.
        let mut source = joe_tree();
        let graph = resolve(
            &mut source,
            &repo,
            &config,
            &seeds(&["editors/joe"]),
            &ResolveOptions::default(),
        )
        .expect("Failed to resolve");

        let staged = dir.path().join("staged.pkg");
        std::fs::write(&staged, b"pkg").expect("Failed to write staged package");
        for (_, node) in graph.iter() {
            repo.publish(
                &staged,
                node.pkgname(),
                node.fingerprint().expect("node has no fingerprint"),
            )
            .expect("Failed to publish");
        }

        // Second resolution finds everything already built.
        let mut source = joe_tree();
        let graph = resolve(
            &mut source,
            &repo,
            &config,
            &seeds(&["editors/joe"]),
            &ResolveOptions::default(),
        )
        .expect("Failed to resolve again");

        assert!(graph.is_complete());
        assert_eq!(graph.tally().succeeded, 2);
        assert!(graph.ready_nodes_ordered().is_empty());
    }

    #[test]
    fn leverage_prebuilt_trusts_foreign_packages() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let repo = Repository::open(&dir.path().join("All")).expect("Failed to open repo");

        // A package dropped in by some other producer: no fingerprint
        // recorded beside it.
        std::fs::write(repo.package_path("gettext-0.21"), b"foreign pkg")
            .expect("Failed to write foreign package");

        let resolve_with = |leverage: bool| {
            let path = dir.path().join(if leverage { "lev.ini" } else { "plain.ini" });
            let contents = if leverage {
                CONFIG_TEMPLATE.replace("leverage_prebuilt= false", "leverage_prebuilt= true")
            } else {
                CONFIG_TEMPLATE.to_string()
            };
            std::fs::write(&path, contents).expect("Failed to write config fixture");
            let config = Config::load(&path, None).expect("Failed to load config fixture");

            let mut source = joe_tree();
            resolve(
                &mut source,
                &repo,
                &config,
                &seeds(&["editors/joe"]),
                &ResolveOptions::default(),
            )
            .expect("Failed to resolve")
        };

        let graph = resolve_with(false);
        let gettext = graph
            .node_id(&"devel/gettext".parse().expect("Failed to parse"))
            .expect("gettext missing");
        assert_eq!(graph.node(gettext).state(), PortState::Ready);

        let graph = resolve_with(true);
        let gettext = graph
            .node_id(&"devel/gettext".parse().expect("Failed to parse"))
            .expect("gettext missing");
        assert_eq!(graph.node(gettext).state(), PortState::Succeeded);
    }

    #[test]
    fn test_deps_are_only_followed_when_asked() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let config = test_config(dir.path());
        let repo = Repository::open(&dir.path().join("All")).expect("Failed to open repo");

        let build = |include_test_deps: bool| {
            let mut source = StaticSource::new();
            source.add("editors/joe", "4.6_1", &[(DepPhase::Test, "devel/check")]);
            source.add("devel/check", "0.15", &[]);
            let options = ResolveOptions {
                include_test_deps,
                ..ResolveOptions::default()
            };
            let graph = resolve(
                &mut source,
                &repo,
                &config,
                &seeds(&["editors/joe"]),
                &options,
            )
            .expect("Failed to resolve");
            graph.len()
        };

        assert_eq!(build(false), 1);
        assert_eq!(build(true), 2);
    }
}
