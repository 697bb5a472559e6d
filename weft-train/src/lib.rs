//! Offline aggregation of training artifacts into selection models.
//!
//! Generating workers dump one artifact per session: derivation trees, a
//! statement-to-node map, and per-statement outcome labels. This crate
//! folds a directory tree of those files into the invalid-context model
//! through three ordered passes, each resumable from its checkpoint:
//!
//! 1. `collect-ids` assigns a stable [`weft::model::RuleId`] to every
//!    rule text reachable from a feedback record.
//! 2. `merge-stats` bumps (total, success) counters per (rule, ancestor
//!    chain prefix) pair.
//! 3. `build-tree` extracts the invalid-context trie from the counters.
//!
//! Checkpoints carry the set of already-folded files, so a rerun over a
//! grown artifact directory only touches the new ones.

pub mod pool;

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use rustc_hash::FxHashSet;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use weft::artifact::{TrainingArtifact, ARTIFACT_EXT};
use weft::driver::{is_scaffolding, is_semantic_error};
use weft::model::{
    ChainStats, InvalidTree, InvalidTreeFile, RuleTable, RuleTableFile, StatsFile, CHAIN_DEPTH,
};
use weft::tree::{DerivationTree, NodeId, NodeKind};

use crate::pool::{map_merge, write_atomic, Checkpointer, PoolConfig};

/// Tuning knobs shared by the passes.
#[derive(Debug, Clone, Copy)]
pub struct PassConfig {
    /// Worker thread count.
    pub jobs: usize,
    /// Artifact files per work unit.
    pub group_size: usize,
    /// Merged work units between checkpoint attempts.
    pub checkpoint_interval: usize,
}

impl Default for PassConfig {
    fn default() -> Self {
        PassConfig {
            jobs: 4,
            group_size: 32,
            checkpoint_interval: 8,
        }
    }
}

impl PassConfig {
    fn pool(&self) -> PoolConfig {
        PoolConfig {
            jobs: self.jobs,
            group_size: self.group_size,
        }
    }
}

/// All artifact files under `dir`, in a stable order.
pub fn scan_artifacts(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in WalkDir::new(dir) {
        let entry = entry.with_context(|| format!("failed to scan {}", dir.display()))?;
        if entry.file_type().is_file()
            && entry.path().extension().and_then(|e| e.to_str()) == Some(ARTIFACT_EXT)
        {
            files.push(entry.into_path());
        }
    }
    files.sort();
    Ok(files)
}

/// Name a file is tracked under in a pass's visited set: its path
/// relative to the artifact root.
fn visited_key(root: &Path, path: &Path) -> String {
    path.strip_prefix(root)
        .unwrap_or(path)
        .to_string_lossy()
        .into_owned()
}

/// Drop files an earlier run of this pass has already folded in.
fn unvisited(root: &Path, files: Vec<PathBuf>, visited: &[String]) -> Vec<PathBuf> {
    let seen: FxHashSet<&str> = visited.iter().map(String::as_str).collect();
    files
        .into_iter()
        .filter(|path| !seen.contains(visited_key(root, path).as_str()))
        .collect()
}

/// Corrupt or unreadable artifacts are skipped, never fatal. They still
/// count as visited; a truncated dump will not parse on a rerun either.
fn load_artifact(path: &Path) -> Option<TrainingArtifact> {
    match TrainingArtifact::load(path) {
        Ok(artifact) => Some(artifact),
        Err(err) => {
            warn!(path = %path.display(), %err, "skipping unreadable artifact");
            None
        }
    }
}

/// Statement validity from an outcome label. Semantic rejections count
/// against the grammar choice; any other label (clean runs included, but
/// also unrelated exception types) counts as a success.
fn classify(label: &str) -> bool {
    !is_semantic_error(label)
}

#[derive(Default)]
struct IdsDelta {
    table: RuleTable,
    files: Vec<String>,
}

/// Pass 1: intern every rule text reachable from a feedback record, in
/// first-seen order.
pub fn collect_ids(artifacts: &Path, table_path: &Path, config: &PassConfig) -> Result<()> {
    let mut state = if table_path.exists() {
        RuleTableFile::load(table_path)
            .with_context(|| format!("failed to load rule table {}", table_path.display()))?
    } else {
        RuleTableFile::default()
    };
    let files = unvisited(artifacts, scan_artifacts(artifacts)?, &state.visited);
    info!(
        pending = files.len(),
        known_rules = state.table.len(),
        "collect-ids pass"
    );

    let mut checkpointer = Checkpointer::new();
    let mut merged = 0usize;
    map_merge(
        &files,
        config.pool(),
        |group| {
            let mut delta = IdsDelta::default();
            for path in group {
                if let Some(artifact) = load_artifact(path) {
                    for record in &artifact.feedback {
                        if let Some((tree, node)) = artifact.resolve(&record.statement) {
                            intern_lineage(&mut delta.table, tree, node);
                        }
                    }
                }
                delta.files.push(visited_key(artifacts, path));
            }
            delta
        },
        |delta| {
            state.table.merge(&delta.table);
            state.visited.extend(delta.files);
            merged += 1;
            if merged % config.checkpoint_interval.max(1) == 0 {
                let snapshot = state.clone();
                let path = table_path.to_path_buf();
                checkpointer.submit(move || write_atomic(&path, |tmp| snapshot.save(tmp)));
            }
            Ok(())
        },
    )?;
    checkpointer.finish();
    write_atomic(table_path, |tmp| state.save(tmp))
        .with_context(|| format!("failed to write rule table {}", table_path.display()))?;
    info!(
        rules = state.table.len(),
        files = state.visited.len(),
        deferred_checkpoints = checkpointer.deferred(),
        "collect-ids complete"
    );
    Ok(())
}

/// Intern every rule in the statement's derivation subtree. Pass 2
/// chains are anchored at the statement node, so the subtree covers all
/// texts they can mention.
fn intern_lineage(table: &mut RuleTable, tree: &DerivationTree, node: NodeId) {
    if let NodeKind::Rule { rule } = &tree.node(node).kind {
        table.intern(rule);
    }
    for desc in tree.descendants(node) {
        if let NodeKind::Rule { rule } = &tree.node(desc).kind {
            table.intern(rule);
        }
    }
}

#[derive(Default)]
struct StatsDelta {
    stats: ChainStats,
    files: Vec<String>,
}

/// Pass 2: fold per-statement outcomes into ancestor-chain counters,
/// keyed by the ids assigned in `collect-ids`.
pub fn merge_stats(
    artifacts: &Path,
    table_path: &Path,
    stats_path: &Path,
    config: &PassConfig,
) -> Result<()> {
    let table = RuleTableFile::load(table_path)
        .with_context(|| format!("failed to load rule table {}", table_path.display()))?
        .table;
    let mut state = if stats_path.exists() {
        StatsFile::load(stats_path)
            .with_context(|| format!("failed to load statistics {}", stats_path.display()))?
    } else {
        StatsFile::default()
    };
    let files = unvisited(artifacts, scan_artifacts(artifacts)?, &state.visited);
    info!(pending = files.len(), "merge-stats pass");

    let mut checkpointer = Checkpointer::new();
    let mut merged = 0usize;
    map_merge(
        &files,
        config.pool(),
        |group| {
            let mut delta = StatsDelta::default();
            for path in group {
                if let Some(artifact) = load_artifact(path) {
                    for record in &artifact.feedback {
                        if is_scaffolding(&record.statement) {
                            continue;
                        }
                        if let Some((tree, node)) = artifact.resolve(&record.statement) {
                            record_chains(
                                &mut delta.stats,
                                &table,
                                tree,
                                node,
                                classify(&record.label),
                            );
                        }
                    }
                }
                delta.files.push(visited_key(artifacts, path));
            }
            delta
        },
        |delta| {
            state.stats.merge(&delta.stats);
            state.visited.extend(delta.files);
            merged += 1;
            if merged % config.checkpoint_interval.max(1) == 0 {
                let snapshot = state.clone();
                let path = stats_path.to_path_buf();
                checkpointer.submit(move || write_atomic(&path, |tmp| snapshot.save(tmp)));
            }
            Ok(())
        },
    )?;
    checkpointer.finish();
    write_atomic(stats_path, |tmp| state.save(tmp))
        .with_context(|| format!("failed to write statistics {}", stats_path.display()))?;
    info!(
        rules = state.stats.rule_count(),
        files = state.visited.len(),
        deferred_checkpoints = checkpointer.deferred(),
        "merge-stats complete"
    );
    Ok(())
}

/// Record one statement outcome across its derivation subtree: every
/// rule node below the statement gets a counter per ancestor-chain
/// prefix, with chains anchored at the statement node. A text missing
/// from the id table means the id pass has not covered this file; the
/// subtree is pruned at that node.
fn record_chains(
    stats: &mut ChainStats,
    table: &RuleTable,
    tree: &DerivationTree,
    node: NodeId,
    success: bool,
) {
    let NodeKind::Rule { rule } = &tree.node(node).kind else {
        return;
    };
    if table.get(rule).is_none() {
        debug!(rule = %rule, "rule text missing from id table, skipping");
        return;
    }
    let mut stack: Vec<NodeId> = tree.node(node).children.iter().flatten().copied().collect();
    while let Some(desc) = stack.pop() {
        let NodeKind::Rule { rule } = &tree.node(desc).kind else {
            continue;
        };
        let Some(rule_id) = table.get(rule) else {
            debug!(rule = %rule, "rule text missing from id table, pruning subtree");
            continue;
        };
        let mut chain = Vec::new();
        for text in tree.chain_within(desc, node, CHAIN_DEPTH) {
            match table.get(text) {
                Some(id) => chain.push(id),
                None => break,
            }
        }
        for len in 1..=chain.len() {
            stats.record(rule_id, &chain[..len], success);
        }
        stack.extend(tree.node(desc).children.iter().flatten().copied());
    }
}

/// Pass 3: extract the invalid-context trie from the merged statistics.
pub fn build_tree(table_path: &Path, stats_path: &Path, out_path: &Path) -> Result<()> {
    let table = RuleTableFile::load(table_path)
        .with_context(|| format!("failed to load rule table {}", table_path.display()))?
        .table;
    let stats = StatsFile::load(stats_path)
        .with_context(|| format!("failed to load statistics {}", stats_path.display()))?
        .stats;

    let file = InvalidTreeFile {
        tree: InvalidTree::from_stats(&stats, &table),
    };
    write_atomic(out_path, |tmp| file.save(tmp))
        .with_context(|| format!("failed to write invalid tree {}", out_path.display()))?;
    info!(
        pruned_rules = file.tree.rule_count(),
        observed_rules = stats.rule_count(),
        "build-tree complete"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use weft::artifact::StmtRef;
    use weft::model::InvalidModel;
    use weft::tree::DerivationTree;

    /// One artifact whose single statement node carries `stmt_rule` with
    /// one nested `inner_rule` expansion, labelled `label` by the target.
    fn artifact(stmt_rule: &str, inner_rule: &str, statement: &str, label: &str) -> TrainingArtifact {
        let mut tree = DerivationTree::new();
        let stmt = tree.add_rule_node(DerivationTree::ROOT, 0, stmt_rule, 1);
        tree.add_rule_node(stmt, 0, inner_rule, 0);
        let mut art = TrainingArtifact {
            trees: vec![tree],
            ..Default::default()
        };
        art.statements
            .insert(statement.to_string(), StmtRef { tree: 0, node: stmt });
        art.push_feedback(statement, label);
        art
    }

    fn run_all(dir: &Path, out: &Path, config: &PassConfig) {
        let table = out.join("rules.bin");
        let stats = out.join("stats.bin");
        let tree = out.join("tree.bin");
        collect_ids(dir, &table, config).unwrap();
        merge_stats(dir, &table, &stats, config).unwrap();
        build_tree(&table, &stats, &tree).unwrap();
    }

    #[test]
    fn three_passes_extract_failing_context() {
        // "bad" always fails inside obj.method but works under the other
        // call site, so only the failing (rule, chain) pair is extracted.
        let dir = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        for i in 0..4 {
            artifact("obj.method(<a>)", "bad = <a>;", &format!("s{i}"), "TypeError")
                .save_new(dir.path())
                .unwrap();
            artifact("other.keep(<a>)", "bad = <a>;", &format!("k{i}"), "Valid")
                .save_new(dir.path())
                .unwrap();
            artifact("obj.method(<a>)", "good = <a>;", &format!("g{i}"), "Valid")
                .save_new(dir.path())
                .unwrap();
        }
        let config = PassConfig {
            jobs: 2,
            group_size: 3,
            checkpoint_interval: 1,
        };
        run_all(dir.path(), out.path(), &config);

        let model =
            InvalidModel::load(&out.path().join("rules.bin"), &out.path().join("tree.bin"))
                .unwrap();
        assert!(!model.is_valid("bad = <a>;", &["obj.method(<a>)"]));
        assert!(model.is_valid("bad = <a>;", &["other.keep(<a>)"]));
        assert!(model.is_valid("good = <a>;", &["obj.method(<a>)"]));
    }

    #[test]
    fn rerun_skips_visited_files() {
        let dir = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        artifact("parent()", "child", "s", "Valid")
            .save_new(dir.path())
            .unwrap();
        let table = out.path().join("rules.bin");
        let config = PassConfig::default();

        collect_ids(dir.path(), &table, &config).unwrap();
        let first = RuleTableFile::load(&table).unwrap();
        collect_ids(dir.path(), &table, &config).unwrap();
        let second = RuleTableFile::load(&table).unwrap();
        assert_eq!(first.visited, second.visited);
        assert_eq!(first.table.len(), second.table.len());
    }

    #[test]
    fn corrupt_artifacts_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("junk.wft"), b"not an artifact").unwrap();
        artifact("parent()", "child", "s", "Valid")
            .save_new(dir.path())
            .unwrap();
        run_all(dir.path(), out.path(), &PassConfig::default());

        let table = RuleTableFile::load(&out.path().join("rules.bin")).unwrap();
        assert_eq!(table.visited.len(), 2);
        assert!(table.table.get("child").is_some());
    }

    #[test]
    fn unrelated_errors_count_as_successes() {
        // RangeError says nothing against the grammar choice; the chain
        // is recorded as healthy and never extracted.
        let dir = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        for i in 0..4 {
            artifact("obj.method(<a>)", "odd = <a>;", &format!("s{i}"), "RangeError")
                .save_new(dir.path())
                .unwrap();
        }
        run_all(dir.path(), out.path(), &PassConfig::default());

        let stats = StatsFile::load(&out.path().join("stats.bin")).unwrap();
        assert_eq!(stats.stats.rule_count(), 1);

        let model =
            InvalidModel::load(&out.path().join("rules.bin"), &out.path().join("tree.bin"))
                .unwrap();
        assert!(model.is_valid("odd = <a>;", &["obj.method(<a>)"]));
    }
}
