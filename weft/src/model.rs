//! Trained selection models and their on-disk formats.
//!
//! Three artifacts come out of the offline statistics job:
//!
//! * [`RuleTable`]: a bijection between canonical rule text and a compact
//!   [`RuleId`], so ancestor chains stay small and hashable.
//! * [`ChainStats`]: per rule, per ancestor-chain, (total, success)
//!   attempt counters. Merging is plain addition, so partial tables from
//!   parallel workers combine in any order.
//! * [`InvalidTree`]: a trie of ancestor chains with near-certain failure,
//!   consulted by the selector to steer generation away from them.
//!
//! Every artifact is persisted as a postcard payload behind a 4-byte magic
//! and a format version, so a stale or foreign file fails loudly instead
//! of decoding into garbage.

use std::fs;
use std::path::Path;

use indexmap::IndexSet;
use rustc_hash::FxHashMap;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::ModelError;
use crate::tree::{DerivationTree, NodeId, NodeKind};

/// Maximum ancestor-chain length recorded and consulted.
pub const CHAIN_DEPTH: usize = 5;

const FORMAT_VERSION: u16 = 1;

pub const RULE_TABLE_MAGIC: [u8; 4] = *b"WFRT";
pub const STATS_MAGIC: [u8; 4] = *b"WFCS";
pub const INVALID_MAGIC: [u8; 4] = *b"WFIT";

/// Compact rule identity, valid only relative to one [`RuleTable`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RuleId(pub u32);

/// First-seen-order bijection between rule text and [`RuleId`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuleTable {
    rules: IndexSet<String>,
}

impl RuleTable {
    /// Id for `text`, assigning the next free id on first sight.
    pub fn intern(&mut self, text: &str) -> RuleId {
        if let Some(i) = self.rules.get_index_of(text) {
            return RuleId(i as u32);
        }
        let (i, _) = self.rules.insert_full(text.to_string());
        RuleId(i as u32)
    }

    pub fn get(&self, text: &str) -> Option<RuleId> {
        self.rules.get_index_of(text).map(|i| RuleId(i as u32))
    }

    pub fn text(&self, id: RuleId) -> Option<&str> {
        self.rules.get_index(id.0 as usize).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Intern all of `other`'s texts in their first-seen order. Ids from
    /// `other` are not preserved; callers re-resolve through `self`.
    pub fn merge(&mut self, other: &RuleTable) {
        for text in &other.rules {
            self.intern(text);
        }
    }
}

/// (total attempts, successful attempts) for one (rule, chain) pair.
pub type Counter = (u64, u64);

/// Global ancestor-chain outcome table. Chains are keyed nearest ancestor
/// first, so a key's length is the ancestor distance it covers.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChainStats {
    per_rule: FxHashMap<RuleId, FxHashMap<Vec<RuleId>, Counter>>,
}

impl ChainStats {
    pub fn record(&mut self, rule: RuleId, chain: &[RuleId], success: bool) {
        let counter = self
            .per_rule
            .entry(rule)
            .or_default()
            .entry(chain.to_vec())
            .or_insert((0, 0));
        counter.0 += 1;
        if success {
            counter.1 += 1;
        }
    }

    /// Record one feedback outcome for the statement generated at `node`.
    /// The statement's whole derivation subtree is walked: every rule
    /// node below `node` gets a counter increment per ancestor-chain
    /// prefix of length 1 to [`CHAIN_DEPTH`], with chains anchored at
    /// `node` itself so one statement's context never bleeds into
    /// another's. The statement node has no chain of its own and records
    /// nothing; neither does a statement without nonterminal expansions.
    pub fn record_feedback(
        &mut self,
        table: &mut RuleTable,
        tree: &DerivationTree,
        node: NodeId,
        success: bool,
    ) {
        for desc in tree.descendants(node) {
            let NodeKind::Rule { rule } = &tree.node(desc).kind else {
                continue;
            };
            let rule_id = table.intern(rule);
            let chain: Vec<RuleId> = tree
                .chain_within(desc, node, CHAIN_DEPTH)
                .into_iter()
                .map(|text| table.intern(text))
                .collect();
            for len in 1..=chain.len() {
                self.record(rule_id, &chain[..len], success);
            }
        }
    }

    /// Add all of `other`'s counters into `self`. Commutative and
    /// associative, so worker partials merge in arrival order.
    pub fn merge(&mut self, other: &ChainStats) {
        for (rule, chains) in &other.per_rule {
            let into = self.per_rule.entry(*rule).or_default();
            for (chain, (total, success)) in chains {
                let counter = into.entry(chain.clone()).or_insert((0, 0));
                counter.0 += total;
                counter.1 += success;
            }
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (RuleId, &FxHashMap<Vec<RuleId>, Counter>)> {
        self.per_rule.iter().map(|(rule, chains)| (*rule, chains))
    }

    pub fn rule_count(&self) -> usize {
        self.per_rule.len()
    }
}

/// Strictly below a 10% success ratio, with enough observations to trust.
fn low_success((total, success): Counter) -> bool {
    total > 2 && success * 10 < total
}

/// Whether rule text looks like it invokes an API (method call, property
/// access or indexing) rather than plain value syntax.
pub fn is_api_invocation(text: &str) -> bool {
    text.contains('.') || text.contains('(') || text.contains('[')
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
struct TrieNode {
    children: FxHashMap<RuleId, TrieNode>,
}

/// Trie of (rule, ancestor chain) pairs known to fail. Trie depth equals
/// ancestor distance: the first level under a rule's root entry is its
/// nearest ancestor.
///
/// Lookup is conservative. A rule or chain entry the trie has never seen
/// means "no information", which reads as valid; only a fully matched
/// recorded chain (a childless node reached) reads as invalid.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InvalidTree {
    roots: FxHashMap<RuleId, TrieNode>,
}

impl InvalidTree {
    /// Mark one (rule, chain) pair invalid; `chain` is nearest first.
    pub fn insert(&mut self, rule: RuleId, chain: &[RuleId]) {
        let mut node = self.roots.entry(rule).or_default();
        for entry in chain {
            node = node.children.entry(*entry).or_default();
        }
    }

    /// Mark a rule invalid in every context.
    pub fn insert_wholly_invalid(&mut self, rule: RuleId) {
        self.roots.insert(rule, TrieNode::default());
    }

    /// Whether `rule` may be used under `chain` (nearest ancestor first).
    pub fn is_valid(&self, rule: RuleId, chain: &[RuleId]) -> bool {
        self.is_valid_path(rule, chain.iter().map(|id| Some(*id)))
    }

    /// Like [`is_valid`](Self::is_valid), but a `None` chain entry means
    /// the ancestor was never interned and therefore cannot match.
    pub fn is_valid_path(
        &self,
        rule: RuleId,
        chain: impl IntoIterator<Item = Option<RuleId>>,
    ) -> bool {
        let Some(mut node) = self.roots.get(&rule) else {
            return true;
        };
        for entry in chain {
            if node.children.is_empty() {
                // A recorded chain matched in full.
                return false;
            }
            match entry.and_then(|id| node.children.get(&id)) {
                Some(child) => node = child,
                None => return true,
            }
        }
        !node.children.is_empty()
    }

    pub fn is_empty(&self) -> bool {
        self.roots.is_empty()
    }

    pub fn rule_count(&self) -> usize {
        self.roots.len()
    }

    /// Extract the invalid tree from merged chain statistics.
    ///
    /// A (rule, chain) pair is inserted when it has a trusted low success
    /// ratio and the nearest ancestor's text looks like an API invocation.
    /// A rule whose every recorded chain has a trusted low success ratio
    /// is marked wholly invalid instead, pruning it in all contexts.
    pub fn from_stats(stats: &ChainStats, table: &RuleTable) -> InvalidTree {
        let mut out = InvalidTree::default();
        for (rule, chains) in stats.iter() {
            if !chains.is_empty() && chains.values().all(|c| low_success(*c)) {
                out.insert_wholly_invalid(rule);
                continue;
            }
            for (chain, counter) in chains {
                if !low_success(*counter) {
                    continue;
                }
                let api = chain
                    .first()
                    .and_then(|id| table.text(*id))
                    .is_some_and(is_api_invocation);
                if api {
                    out.insert(rule, chain);
                }
            }
        }
        out
    }
}

// --- persistence -------------------------------------------------------

pub(crate) fn save_envelope<T: Serialize>(
    path: &Path,
    magic: [u8; 4],
    value: &T,
) -> Result<(), ModelError> {
    let mut bytes = magic.to_vec();
    bytes.extend(postcard::to_allocvec(&(FORMAT_VERSION, value))?);
    fs::write(path, bytes).map_err(|source| ModelError::Io {
        path: path.to_path_buf(),
        source,
    })
}

pub(crate) fn load_envelope<T: DeserializeOwned>(
    path: &Path,
    magic: [u8; 4],
) -> Result<T, ModelError> {
    let bytes = fs::read(path).map_err(|source| ModelError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    if bytes.len() < 4 || bytes[..4] != magic {
        return Err(ModelError::Magic {
            path: path.to_path_buf(),
            expected: magic,
        });
    }
    let (version, rest) = postcard::take_from_bytes::<u16>(&bytes[4..])?;
    if version != FORMAT_VERSION {
        return Err(ModelError::Version {
            path: path.to_path_buf(),
            found: version,
            expected: FORMAT_VERSION,
        });
    }
    Ok(postcard::from_bytes(rest)?)
}

/// Checkpointed rule-identity pass state: the bijection plus the artifact
/// files already folded in.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuleTableFile {
    pub table: RuleTable,
    pub visited: Vec<String>,
}

impl RuleTableFile {
    pub fn save(&self, path: &Path) -> Result<(), ModelError> {
        save_envelope(path, RULE_TABLE_MAGIC, self)
    }

    pub fn load(path: &Path) -> Result<Self, ModelError> {
        load_envelope(path, RULE_TABLE_MAGIC)
    }
}

/// Checkpointed chain-statistics pass state.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StatsFile {
    pub stats: ChainStats,
    pub visited: Vec<String>,
}

impl StatsFile {
    pub fn save(&self, path: &Path) -> Result<(), ModelError> {
        save_envelope(path, STATS_MAGIC, self)
    }

    pub fn load(path: &Path) -> Result<Self, ModelError> {
        load_envelope(path, STATS_MAGIC)
    }
}

/// Final extraction output, loaded by generating workers.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InvalidTreeFile {
    pub tree: InvalidTree,
}

impl InvalidTreeFile {
    pub fn save(&self, path: &Path) -> Result<(), ModelError> {
        save_envelope(path, INVALID_MAGIC, self)
    }

    pub fn load(path: &Path) -> Result<Self, ModelError> {
        load_envelope(path, INVALID_MAGIC)
    }
}

/// The pair a generating worker loads at startup: the trie plus the rule
/// table its ids refer to.
#[derive(Debug, Clone, Default)]
pub struct InvalidModel {
    pub table: RuleTable,
    pub tree: InvalidTree,
}

impl InvalidModel {
    pub fn load(table_path: &Path, tree_path: &Path) -> Result<Self, ModelError> {
        let table = RuleTableFile::load(table_path)?.table;
        let tree = InvalidTreeFile::load(tree_path)?.tree;
        Ok(InvalidModel { table, tree })
    }

    /// Whether `rule_text` may fill a slot under the given ancestor chain
    /// (nearest first, canonical rule texts).
    pub fn is_valid(&self, rule_text: &str, chain: &[&str]) -> bool {
        let Some(rule) = self.table.get(rule_text) else {
            return true;
        };
        self.tree
            .is_valid_path(rule, chain.iter().map(|text| self.table.get(text)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn table_with(texts: &[&str]) -> RuleTable {
        let mut t = RuleTable::default();
        for text in texts {
            t.intern(text);
        }
        t
    }

    #[test]
    fn intern_is_a_bijection() {
        let mut t = RuleTable::default();
        let a = t.intern("<a> = 1");
        let b = t.intern("<b> = 2");
        assert_ne!(a, b);
        assert_eq!(t.intern("<a> = 1"), a);
        assert_eq!(t.text(a), Some("<a> = 1"));
        assert_eq!(t.get("<b> = 2"), Some(b));
        assert_eq!(t.len(), 2);
    }

    #[test]
    fn merge_keeps_existing_ids_stable() {
        let mut base = table_with(&["x", "y"]);
        let other = table_with(&["y", "z"]);
        base.merge(&other);
        assert_eq!(base.get("x"), Some(RuleId(0)));
        assert_eq!(base.get("y"), Some(RuleId(1)));
        assert_eq!(base.get("z"), Some(RuleId(2)));
    }

    #[test]
    fn stats_merge_is_commutative() {
        let r = RuleId(0);
        let chain = [RuleId(1), RuleId(2)];
        let mut a = ChainStats::default();
        a.record(r, &chain, true);
        a.record(r, &chain[..1], false);
        let mut b = ChainStats::default();
        b.record(r, &chain, false);
        b.record(r, &chain, false);

        let mut ab = a.clone();
        ab.merge(&b);
        let mut ba = b.clone();
        ba.merge(&a);
        for (rule, chains) in ab.iter() {
            for (chain, counter) in chains {
                let other = ba
                    .iter()
                    .find(|(r, _)| *r == rule)
                    .and_then(|(_, c)| c.get(chain));
                assert_eq!(other, Some(counter));
            }
        }
    }

    #[test]
    fn feedback_descends_the_statement_subtree() {
        // A statement sitting directly under the root still yields
        // statistics: every expansion below it records its chain back up
        // to the statement, with all prefixes.
        let mut tree = DerivationTree::new();
        let stmt = tree.add_rule_node(DerivationTree::ROOT, 0, "obj.use(<a>)", 1);
        let mid = tree.add_rule_node(stmt, 0, "<a> = <b>", 1);
        tree.add_rule_node(mid, 0, "<b> = obj.make()", 0);

        let mut table = RuleTable::default();
        let mut stats = ChainStats::default();
        stats.record_feedback(&mut table, &tree, stmt, false);

        let stmt_id = table.get("obj.use(<a>)").unwrap();
        let mid_id = table.get("<a> = <b>").unwrap();
        let leaf_id = table.get("<b> = obj.make()").unwrap();

        let mid_chains = stats.iter().find(|(r, _)| *r == mid_id).unwrap().1;
        assert_eq!(mid_chains.get(&vec![stmt_id]), Some(&(1, 0)));
        assert_eq!(mid_chains.len(), 1);

        let leaf_chains = stats.iter().find(|(r, _)| *r == leaf_id).unwrap().1;
        assert_eq!(leaf_chains.get(&vec![mid_id]), Some(&(1, 0)));
        assert_eq!(leaf_chains.get(&vec![mid_id, stmt_id]), Some(&(1, 0)));
        assert_eq!(leaf_chains.len(), 2);
    }

    #[test]
    fn chains_stay_inside_the_statement_subtree() {
        // A nested statement resolves at its own node; its expansions
        // must not pick up the enclosing statement as context.
        let mut tree = DerivationTree::new();
        let outer = tree.add_rule_node(DerivationTree::ROOT, 0, "use(<x>)", 1);
        let inner = tree.add_rule_node(outer, 0, "<new x> = make(<y>)", 1);
        tree.add_rule_node(inner, 0, "<y> = 1", 0);

        let mut table = RuleTable::default();
        let mut stats = ChainStats::default();
        stats.record_feedback(&mut table, &tree, inner, true);

        assert!(table.get("use(<x>)").is_none());
        let arg_id = table.get("<y> = 1").unwrap();
        let inner_id = table.get("<new x> = make(<y>)").unwrap();
        let chains = stats.iter().find(|(r, _)| *r == arg_id).unwrap().1;
        assert_eq!(chains.get(&vec![inner_id]), Some(&(1, 1)));
        assert_eq!(chains.len(), 1);
    }

    #[test]
    fn childless_statement_records_nothing() {
        let mut tree = DerivationTree::new();
        let line = tree.add_rule_node(DerivationTree::ROOT, 0, "top", 0);
        let mut table = RuleTable::default();
        let mut stats = ChainStats::default();
        stats.record_feedback(&mut table, &tree, line, true);
        assert_eq!(stats.rule_count(), 0);
    }

    #[test]
    fn extraction_thresholds() {
        // Nearest ancestor must look like an API invocation.
        let table = table_with(&["victim", "obj.method()"]);
        let rule = RuleId(0);
        let api = RuleId(1);

        let mut stats = ChainStats::default();
        for i in 0..20 {
            stats.record(rule, &[api], i == 0); // 1/20: invalid
        }
        let tree = InvalidTree::from_stats(&stats, &table);
        assert!(!tree.is_valid(rule, &[api]));

        let mut stats = ChainStats::default();
        for i in 0..20 {
            stats.record(rule, &[api], i < 3); // 3/20 = 15%: kept
        }
        let tree = InvalidTree::from_stats(&stats, &table);
        assert!(tree.is_valid(rule, &[api]));

        let mut stats = ChainStats::default();
        stats.record(rule, &[api], false); // 0/2: below minimum count
        stats.record(rule, &[api], false);
        let tree = InvalidTree::from_stats(&stats, &table);
        assert!(tree.is_valid(rule, &[api]));
    }

    #[test]
    fn non_api_ancestor_is_never_extracted() {
        let table = table_with(&["victim", "plainword", "other"]);
        let rule = RuleId(0);
        let mut stats = ChainStats::default();
        for _ in 0..20 {
            stats.record(rule, &[RuleId(1)], false);
        }
        // A second healthy chain keeps the rule off the wholly-invalid path.
        for _ in 0..20 {
            stats.record(rule, &[RuleId(2)], true);
        }
        let tree = InvalidTree::from_stats(&stats, &table);
        assert!(tree.is_valid(rule, &[RuleId(1)]));
    }

    #[test]
    fn wholly_invalid_rule_fails_every_context() {
        let table = table_with(&["victim", "plainword"]);
        let rule = RuleId(0);
        let mut stats = ChainStats::default();
        for _ in 0..20 {
            stats.record(rule, &[RuleId(1)], false);
        }
        let tree = InvalidTree::from_stats(&stats, &table);
        assert!(!tree.is_valid(rule, &[RuleId(1)]));
        assert!(!tree.is_valid(rule, &[]));
        assert!(!tree.is_valid(rule, &[RuleId(7)]));
    }

    #[test]
    fn lookup_is_conservative() {
        let mut tree = InvalidTree::default();
        tree.insert(RuleId(0), &[RuleId(1), RuleId(2)]);

        // Unknown rule, diverging chain, or a shorter chain that stops
        // before the recorded one ends: all valid.
        assert!(tree.is_valid(RuleId(9), &[RuleId(1), RuleId(2)]));
        assert!(tree.is_valid(RuleId(0), &[RuleId(1), RuleId(9)]));
        assert!(tree.is_valid(RuleId(0), &[RuleId(1)]));
        // The exact recorded chain, or a longer one extending past it.
        assert!(!tree.is_valid(RuleId(0), &[RuleId(1), RuleId(2)]));
        assert!(!tree.is_valid(RuleId(0), &[RuleId(1), RuleId(2), RuleId(3)]));
    }

    #[test]
    fn envelope_round_trip_and_magic_check() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rules.bin");

        let file = RuleTableFile {
            table: table_with(&["a", "b"]),
            visited: vec!["art-0.wft".into()],
        };
        file.save(&path).unwrap();
        let loaded = RuleTableFile::load(&path).unwrap();
        assert_eq!(loaded.table.get("b"), Some(RuleId(1)));
        assert_eq!(loaded.visited, file.visited);

        // Same bytes under the wrong magic must fail loudly.
        assert!(matches!(
            StatsFile::load(&path),
            Err(ModelError::Magic { .. })
        ));
    }

    #[test]
    fn wrong_format_version_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rules.bin");

        let mut bytes = RULE_TABLE_MAGIC.to_vec();
        bytes
            .extend(postcard::to_allocvec(&(FORMAT_VERSION + 1, RuleTableFile::default())).unwrap());
        std::fs::write(&path, bytes).unwrap();

        assert!(matches!(
            RuleTableFile::load(&path),
            Err(ModelError::Version { found, .. }) if found == FORMAT_VERSION + 1
        ));
    }

    #[test]
    fn invalid_model_resolves_texts() {
        let mut table = RuleTable::default();
        let rule = table.intern("victim");
        let api = table.intern("obj.method()");
        let mut tree = InvalidTree::default();
        tree.insert(rule, &[api]);
        let model = InvalidModel { table, tree };

        assert!(!model.is_valid("victim", &["obj.method()"]));
        assert!(model.is_valid("victim", &["neverseen"]));
        assert!(model.is_valid("neverseen", &["obj.method()"]));
    }
}
