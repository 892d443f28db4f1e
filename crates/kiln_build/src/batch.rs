//! Grouping units into compiler invocations, and generating their code.

use std::collections::BTreeMap;

use kiln_common::{HashCombiner, VirtualFileSystem, VirtualPath};
use kiln_config::{KilnConfig, ParseErrorPolicy};
use kiln_diagnostics::Diagnostic;
use rayon::prelude::*;
use tracing::debug;

use crate::scope::CompilationScope;
use crate::toolchain::{CodeGenerator, GeneratedCode};
use crate::unit::BuildUnit;

/// Units compiled into one assembly.
#[derive(Debug, Clone)]
pub struct BatchGroup {
    /// The scope every member belongs to.
    pub scope: CompilationScope,
    /// Members, sorted by virtual path.
    pub units: Vec<BuildUnit>,
    /// Deterministic output name.
    pub assembly_name: String,
}

impl BatchGroup {
    /// Returns `true` if `path` is a member.
    pub fn contains(&self, path: &VirtualPath) -> bool {
        self.units.iter().any(|u| u.path == *path)
    }

    /// Total source size of the members.
    pub fn size(&self) -> u64 {
        self.units.iter().map(|u| u.size).sum()
    }
}

/// Syntax-tree generation failed for some members of a group.
#[derive(Debug, Clone)]
pub struct GenerationFailure {
    /// Each failed unit with its diagnostics, in batch order.
    pub failed: Vec<(VirtualPath, Vec<Diagnostic>)>,
}

impl GenerationFailure {
    /// All diagnostics, in batch order.
    pub fn diagnostics(&self) -> Vec<Diagnostic> {
        self.failed.iter().flat_map(|(_, d)| d.iter().cloned()).collect()
    }

    /// Returns `true` if `path` failed.
    pub fn contains(&self, path: &VirtualPath) -> bool {
        self.failed.iter().any(|(p, _)| p == path)
    }
}

/// Groups units by scope under size and count limits.
#[derive(Debug, Clone)]
pub struct CompilationBatcher {
    enabled: bool,
    max_units: usize,
    max_source_size: u64,
    policy: ParseErrorPolicy,
}

impl CompilationBatcher {
    /// A batcher following `config`.
    pub fn new(config: &KilnConfig) -> Self {
        Self {
            enabled: config.batching_enabled(),
            max_units: config.batch.max_units.max(1),
            max_source_size: config.batch.max_source_size,
            policy: config.compilation.parse_errors,
        }
    }

    /// Returns `true` if siblings may share an assembly.
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Splits `units` into groups.
    ///
    /// Scopes never mix. Within a scope, units are taken in path order and
    /// packed until the next cluster would break a limit. A unit and its
    /// companions form one cluster that is never split. Units that compile
    /// separately, and every unit when batching is off, become singletons.
    pub fn batch(&self, units: Vec<BuildUnit>) -> Vec<BatchGroup> {
        let mut by_scope: BTreeMap<CompilationScope, Vec<BuildUnit>> = BTreeMap::new();
        for unit in units {
            by_scope.entry(unit.scope.clone()).or_default().push(unit);
        }

        let mut groups = Vec::new();
        for (scope, mut members) in by_scope {
            members.sort_by(|a, b| a.path.cmp(&b.path));
            members.dedup_by(|a, b| a.path == b.path);
            for cluster in clusters(members) {
                let alone = !self.enabled || (cluster.len() == 1 && cluster[0].compile_separately);
                if alone {
                    groups.push(self.finish(scope.clone(), cluster));
                } else {
                    groups.push(BatchGroup {
                        scope: scope.clone(),
                        units: cluster,
                        assembly_name: String::new(),
                    });
                }
            }
        }
        merge_open_groups(groups, self)
    }

    /// A group holding only `unit`.
    pub fn singleton(&self, unit: BuildUnit) -> BatchGroup {
        self.finish(unit.scope.clone(), vec![unit])
    }

    fn fits(&self, group: &BatchGroup, cluster: &BatchGroup) -> bool {
        group.units.len() + cluster.units.len() <= self.max_units
            && group.size() + cluster.size() <= self.max_source_size
    }

    fn finish(&self, scope: CompilationScope, units: Vec<BuildUnit>) -> BatchGroup {
        let assembly_name = assembly_name(&scope, &units);
        BatchGroup {
            scope,
            units,
            assembly_name,
        }
    }

    /// Generates syntax trees for every member of `group` in parallel.
    ///
    /// Under fail-fast the first failure stops the batch; under collect every
    /// member is generated and all failures are returned together.
    pub fn generate(
        &self,
        group: &BatchGroup,
        generator: &dyn CodeGenerator,
        vfs: &dyn VirtualFileSystem,
    ) -> Result<Vec<GeneratedCode>, GenerationFailure> {
        match self.policy {
            ParseErrorPolicy::FailFast => group
                .units
                .par_iter()
                .map(|unit| {
                    generator.generate(unit, vfs).map_err(|diagnostics| GenerationFailure {
                        failed: vec![(unit.path.clone(), diagnostics)],
                    })
                })
                .collect(),
            ParseErrorPolicy::Collect => {
                let outcomes: Vec<_> = group
                    .units
                    .par_iter()
                    .map(|unit| generator.generate(unit, vfs))
                    .collect();
                let mut generated = Vec::with_capacity(outcomes.len());
                let mut failed = Vec::new();
                for (unit, outcome) in group.units.iter().zip(outcomes) {
                    match outcome {
                        Ok(code) => generated.push(code),
                        Err(diagnostics) => failed.push((unit.path.clone(), diagnostics)),
                    }
                }
                if failed.is_empty() {
                    Ok(generated)
                } else {
                    Err(GenerationFailure { failed })
                }
            }
        }
    }
}

/// Splits sorted members into companion-linked clusters, in path order.
fn clusters(members: Vec<BuildUnit>) -> Vec<Vec<BuildUnit>> {
    let n = members.len();
    let mut parent: Vec<usize> = (0..n).collect();

    fn find(parent: &mut [usize], mut i: usize) -> usize {
        while parent[i] != i {
            parent[i] = parent[parent[i]];
            i = parent[i];
        }
        i
    }

    for i in 0..n {
        for companion in &members[i].companions {
            if let Some(j) = members.iter().position(|m| m.path == *companion) {
                let (a, b) = (find(&mut parent, i), find(&mut parent, j));
                if a != b {
                    parent[a.max(b)] = a.min(b);
                }
            }
        }
    }

    let mut by_root: BTreeMap<usize, Vec<BuildUnit>> = BTreeMap::new();
    for (i, unit) in members.into_iter().enumerate() {
        let root = find(&mut parent, i);
        by_root.entry(root).or_default().push(unit);
    }
    by_root.into_values().collect()
}

/// Packs consecutive unnamed clusters of one scope into batches under the
/// limits, then names them. Already named groups pass through.
fn merge_open_groups(groups: Vec<BatchGroup>, batcher: &CompilationBatcher) -> Vec<BatchGroup> {
    let mut out: Vec<BatchGroup> = Vec::new();
    let mut open: Option<BatchGroup> = None;

    for group in groups {
        if !group.assembly_name.is_empty() {
            out.push(group);
            continue;
        }
        open = match open.take() {
            Some(mut current) if current.scope == group.scope && batcher.fits(&current, &group) => {
                current.units.extend(group.units);
                Some(current)
            }
            Some(done) => {
                out.push(batcher.finish(done.scope, done.units));
                Some(group)
            }
            None => Some(group),
        };
    }
    if let Some(done) = open {
        out.push(batcher.finish(done.scope, done.units));
    }

    for group in &out {
        debug!(
            assembly = %group.assembly_name,
            scope = %group.scope,
            units = group.units.len(),
            "formed batch"
        );
    }
    out
}

fn assembly_name(scope: &CompilationScope, units: &[BuildUnit]) -> String {
    if let Some(fixed) = scope.fixed_assembly_name() {
        return fixed;
    }
    if let [only] = units {
        return format!("{}_{}", scope.assembly_prefix(), only.cache_key());
    }
    let mut h = HashCombiner::new();
    scope.hash_into(&mut h);
    for unit in units {
        h.add_str(unit.path.key());
    }
    let hex = h.finish().to_string();
    format!("{}_{}", scope.assembly_prefix(), &hex[..8])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::unit::SourceKind;

    fn unit(path: &str, scope: CompilationScope, size: u64) -> BuildUnit {
        let mut u = BuildUnit::new(VirtualPath::parse(path).unwrap(), SourceKind::Page, scope);
        u.size = size;
        u
    }

    fn web(dir: &str) -> CompilationScope {
        CompilationScope::WebDirectory(VirtualPath::directory(dir).unwrap())
    }

    fn batcher(tweak: impl FnOnce(&mut KilnConfig)) -> CompilationBatcher {
        let mut config = KilnConfig::default_for("app");
        tweak(&mut config);
        CompilationBatcher::new(&config)
    }

    #[test]
    fn one_group_per_directory() {
        let groups = batcher(|_| {}).batch(vec![
            unit("~/b.aspx", web("~/"), 10),
            unit("~/shop/c.aspx", web("~/shop"), 10),
            unit("~/a.aspx", web("~/"), 10),
        ]);
        assert_eq!(groups.len(), 2);
        let root = groups.iter().find(|g| g.scope == web("~/")).unwrap();
        let paths: Vec<&str> = root.units.iter().map(|u| u.path.as_str()).collect();
        assert_eq!(paths, vec!["~/a.aspx", "~/b.aspx"]);
        assert!(root.assembly_name.starts_with("App_Web_"));
    }

    #[test]
    fn scopes_never_mix() {
        let groups = batcher(|_| {}).batch(vec![
            unit("~/App_Code/Vb/a.vb", CompilationScope::SubCode("Vb".into()), 1),
            unit(
                "~/App_GlobalResources/s.resx",
                CompilationScope::GlobalResources,
                1,
            ),
        ]);
        assert_eq!(groups.len(), 2);
        assert!(groups.iter().all(|g| g.units.len() == 1));
    }

    #[test]
    fn limits_split_batches() {
        let b = batcher(|c| c.batch.max_units = 2);
        let groups = b.batch(vec![
            unit("~/a.aspx", web("~/"), 1),
            unit("~/b.aspx", web("~/"), 1),
            unit("~/c.aspx", web("~/"), 1),
        ]);
        assert_eq!(groups.iter().map(|g| g.units.len()).collect::<Vec<_>>(), vec![2, 1]);

        let b = batcher(|c| c.batch.max_source_size = 15);
        let groups = b.batch(vec![
            unit("~/a.aspx", web("~/"), 10),
            unit("~/b.aspx", web("~/"), 10),
        ]);
        assert_eq!(groups.len(), 2);
    }

    #[test]
    fn companions_stay_together() {
        let b = batcher(|c| c.batch.max_units = 1);
        let mut a = unit("~/a.aspx", web("~/"), 1);
        a.companions.push(VirtualPath::parse("~/z.ascx").unwrap());
        let groups = b.batch(vec![a, unit("~/m.aspx", web("~/"), 1), unit("~/z.ascx", web("~/"), 1)]);
        let with_a = groups
            .iter()
            .find(|g| g.contains(&VirtualPath::parse("~/a.aspx").unwrap()))
            .unwrap();
        assert!(with_a.contains(&VirtualPath::parse("~/z.ascx").unwrap()));
    }

    #[test]
    fn separate_units_get_stable_names() {
        let b = batcher(|c| c.compilation.fixed_names = true);
        let groups = b.batch(vec![unit("~/a.aspx", web("~/"), 1), unit("~/b.aspx", web("~/"), 1)]);
        assert_eq!(groups.len(), 2);
        let key = VirtualPath::parse("~/a.aspx").unwrap().cache_key();
        assert_eq!(groups[0].assembly_name, format!("App_Web_{key}"));

        let again = b.batch(vec![unit("~/a.aspx", web("~/"), 1)]);
        assert_eq!(again[0].assembly_name, groups[0].assembly_name);
    }

    #[test]
    fn compile_separately_is_a_singleton() {
        let mut lonely = unit("~/b.aspx", web("~/"), 1);
        lonely.compile_separately = true;
        let groups = batcher(|_| {}).batch(vec![
            unit("~/a.aspx", web("~/"), 1),
            lonely,
            unit("~/c.aspx", web("~/"), 1),
        ]);
        let b = groups
            .iter()
            .find(|g| g.contains(&VirtualPath::parse("~/b.aspx").unwrap()))
            .unwrap();
        assert_eq!(b.units.len(), 1);
    }

    #[test]
    fn batch_names_are_deterministic() {
        let b = batcher(|_| {});
        let first = b.batch(vec![unit("~/a.aspx", web("~/"), 1), unit("~/b.aspx", web("~/"), 1)]);
        let second = b.batch(vec![unit("~/b.aspx", web("~/"), 1), unit("~/a.aspx", web("~/"), 1)]);
        assert_eq!(first[0].assembly_name, second[0].assembly_name);
    }

    struct FailingOn(&'static str);

    impl CodeGenerator for FailingOn {
        fn generate(
            &self,
            unit: &BuildUnit,
            _vfs: &dyn VirtualFileSystem,
        ) -> Result<GeneratedCode, Vec<Diagnostic>> {
            if unit.path.as_str().contains(self.0) {
                return Err(vec![Diagnostic::error(
                    kiln_diagnostics::DiagnosticCode::new(kiln_diagnostics::Category::Parse, 1),
                    format!("cannot parse {}", unit.path),
                )]);
            }
            Ok(GeneratedCode::new(crate::toolchain::SyntaxTree {
                unit: unit.path.clone(),
                text: String::new(),
            }))
        }
    }

    #[test]
    fn collect_policy_reports_every_failure() {
        let vfs = kiln_common::MemoryFileSystem::new();
        let units = vec![
            unit("~/bad1.aspx", web("~/"), 1),
            unit("~/good.aspx", web("~/"), 1),
            unit("~/bad2.aspx", web("~/"), 1),
        ];
        let group = batcher(|c| c.compilation.parse_errors = ParseErrorPolicy::Collect)
            .batch(units.clone())
            .remove(0);
        let failure = batcher(|c| c.compilation.parse_errors = ParseErrorPolicy::Collect)
            .generate(&group, &FailingOn("bad"), &vfs)
            .unwrap_err();
        assert_eq!(failure.failed.len(), 2);
        assert_eq!(failure.diagnostics().len(), 2);

        let failure = batcher(|_| {})
            .generate(&group, &FailingOn("bad"), &vfs)
            .unwrap_err();
        assert_eq!(failure.failed.len(), 1);

        let ok = batcher(|_| {}).generate(&group, &FailingOn("none"), &vfs).unwrap();
        let order: Vec<&str> = ok.iter().map(|g| g.tree.unit.as_str()).collect();
        assert_eq!(order, vec!["~/bad1.aspx", "~/bad2.aspx", "~/good.aspx"]);
    }
}
