//! Reachability and cycle pruning.
//!
//! Run at freeze time when [`GrammarOptions::prune`] is set. Two passes:
//!
//! * [`remove_unreachable`] drops rules that reference a symbol with no
//!   remaining creator, to a fixed point (dropping a rule can empty a
//!   creator list and doom further rules).
//! * [`remove_cyclic`] drops every creator of a symbol that cannot reach a
//!   terminating expansion, i.e. one where every derivation path loops
//!   back into itself. Such symbols can only hit the recursion limit.
//!
//! `<call>` and `<import>` tags are structural and never count as symbol
//! references here.

use rustc_hash::{FxHashMap, FxHashSet};
use tracing::debug;

use crate::grammar::builtins;
use crate::grammar::rules::{Rule, RuleIdx, RuleKind, RulePart};
use crate::grammar::GrammarStore;

/// Symbols a rule needs creators for before it can be fully expanded.
fn referenced_symbols(rule: &Rule) -> impl Iterator<Item = &str> {
    rule.parts.iter().filter_map(move |part| {
        let RulePart::Tag(tag) = part else { return None };
        if rule.kind == RuleKind::Code && tag.creates_new {
            return None;
        }
        if builtins::is_builtin_or_constant(&tag.name) {
            return None;
        }
        if tag.name == "call" || tag.name == "import" {
            return None;
        }
        Some(tag.name.as_str())
    })
}

fn has_creators(store: &GrammarStore, symbol: &str) -> bool {
    builtins::is_builtin_or_constant(symbol)
        || store.creators.get(symbol).is_some_and(|v| !v.is_empty())
}

/// Drop `doomed` rule indices from every creator list, then clear out
/// symbols left with no creators.
fn remove_rules(store: &mut GrammarStore, doomed: &FxHashSet<RuleIdx>) {
    store
        .creators
        .retain(|_, idxs| {
            idxs.retain(|idx| !doomed.contains(idx));
            !idxs.is_empty()
        });
    store.nonrecursive.retain(|_, idxs| {
        idxs.retain(|idx| !doomed.contains(idx));
        !idxs.is_empty()
    });
}

pub(crate) fn remove_unreachable(store: &mut GrammarStore) {
    let mut total = 0usize;
    loop {
        let mut doomed: FxHashSet<RuleIdx> = FxHashSet::default();
        for idxs in store.creators.values() {
            for &idx in idxs {
                if referenced_symbols(&store.rules[idx]).any(|s| !has_creators(store, s)) {
                    doomed.insert(idx);
                }
            }
        }
        if doomed.is_empty() {
            break;
        }
        total += doomed.len();
        remove_rules(store, &doomed);
    }
    if total > 0 {
        debug!(removed = total, "pruned rules with undefined references");
    }
}

/// Whether `symbol` has at least one derivation that bottoms out, with
/// `visited` guarding the current path against cycles.
fn can_terminate(
    store: &GrammarStore,
    symbol: &str,
    visited: &mut FxHashSet<String>,
    memo: &mut FxHashMap<String, bool>,
) -> bool {
    if builtins::is_builtin_or_constant(symbol) {
        return true;
    }
    if let Some(&known) = memo.get(symbol) {
        return known;
    }
    if !visited.insert(symbol.to_string()) {
        // On the current path already; treating it as non-terminating
        // here is what breaks the cycle.
        return false;
    }
    let ok = store
        .creators
        .get(symbol)
        .is_some_and(|idxs| {
            idxs.iter().any(|&idx| {
                referenced_symbols(&store.rules[idx])
                    .all(|s| can_terminate(store, s, visited, memo))
            })
        });
    visited.remove(symbol);
    // A negative answer depends on what was on the path, so only positive
    // results are safe to memoize.
    if ok {
        memo.insert(symbol.to_string(), true);
    }
    ok
}

pub(crate) fn remove_cyclic(store: &mut GrammarStore) {
    let symbols: Vec<String> = store.creators.keys().cloned().collect();
    let mut dead: FxHashSet<String> = FxHashSet::default();
    for symbol in &symbols {
        let mut visited = FxHashSet::default();
        let mut memo = FxHashMap::default();
        if !can_terminate(store, symbol, &mut visited, &mut memo) {
            dead.insert(symbol.clone());
        }
    }
    if dead.is_empty() {
        return;
    }

    let mut doomed: FxHashSet<RuleIdx> = FxHashSet::default();
    for (symbol, idxs) in &store.creators {
        if dead.contains(symbol) {
            doomed.extend(idxs.iter().copied());
            continue;
        }
        for &idx in idxs {
            if referenced_symbols(&store.rules[idx]).any(|s| dead.contains(s)) {
                doomed.insert(idx);
            }
        }
    }
    debug!(
        symbols = dead.len(),
        rules = doomed.len(),
        "pruned symbols that can never terminate"
    );
    remove_rules(store, &doomed);
}
