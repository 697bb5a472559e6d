//! Candidate-rule selection: baseline sampling plus two learned layers.
//!
//! Baseline selection draws from the grammar's per-symbol CDF (or
//! uniformly when no probabilities are declared). On top of that sit two
//! independent mechanisms, either of which may be absent:
//!
//! * **Online weights**: one weight per (parent rule, slot) candidate,
//!   updated from execution feedback between batches. A candidate that
//!   only ever failed in a batch decays by 10x; one success restores it
//!   to 1.0. Weights bias the draw but never exclude a candidate.
//! * **Invalid-tree pruning**: a trained [`InvalidModel`] rejects
//!   candidates whose (rule, ancestor chain) pair is known to fail; the
//!   draw is resampled uniformly, bounded, then escalated as
//!   [`GenError::OracleExhausted`].

use rand::rngs::StdRng;
use rand::Rng;
use rustc_hash::FxHashMap;
use tracing::debug;

use crate::error::GenError;
use crate::grammar::{GrammarStore, RuleIdx};
use crate::model::InvalidModel;
use crate::tree::{DerivationTree, NodeId, NodeKind};

/// Resample bound before a slot is declared unsatisfiable.
const MAX_RESAMPLE: usize = 100;

/// One weight table key: (parent rule text, slot position).
type SlotKey = (String, u32);

/// Everything the selector needs to know about the slot being filled.
pub struct SlotContext<'a> {
    pub symbol: &'a str,
    /// Canonical text of the rule owning the slot; `None` at tree roots.
    pub parent_rule: Option<&'a str>,
    pub slot: u32,
    /// Ancestor chain, nearest first, capped at the model's depth.
    pub chain: &'a [&'a str],
    /// Restrict the draw to nonrecursive-eligible creators.
    pub force_nonrecursive: bool,
}

/// Per-slot candidate weights learned from execution feedback.
///
/// Weight vectors are aligned with the store's sorted creator lists and
/// created lazily the first time a slot is observed or drawn from.
#[derive(Debug, Default)]
pub struct OnlineWeights {
    weights: FxHashMap<SlotKey, Vec<f64>>,
    /// (attempts, successes) per candidate for the batch in flight.
    batch: FxHashMap<SlotKey, Vec<(u64, u64)>>,
}

impl OnlineWeights {
    /// Fold one statement outcome into the current batch: every parent
    /// slot to child rule edge in the statement's subtree counts as an
    /// attempt for that candidate.
    pub fn observe(
        &mut self,
        store: &GrammarStore,
        tree: &DerivationTree,
        node: NodeId,
        success: bool,
    ) {
        let mut stack = vec![node];
        while let Some(id) = stack.pop() {
            let parent = tree.node(id);
            let NodeKind::Rule { rule } = &parent.kind else {
                continue;
            };
            let Some(rule_idx) = store.rule_by_text(rule) else {
                continue;
            };
            let symbols = store.rule(rule_idx).slot_symbols();
            for (slot, child) in parent.children.iter().enumerate() {
                let Some(child_id) = child else { continue };
                stack.push(*child_id);
                let NodeKind::Rule { rule: child_rule } = &tree.node(*child_id).kind else {
                    continue;
                };
                let Some(&symbol) = symbols.get(slot) else {
                    continue;
                };
                let (Some(pos), Some(creators)) = (
                    store.creator_position(symbol, child_rule),
                    store.creators_for(symbol),
                ) else {
                    continue;
                };
                let counts = self
                    .batch
                    .entry((rule.clone(), slot as u32))
                    .or_insert_with(|| vec![(0, 0); creators.len()]);
                counts[pos].0 += 1;
                if success {
                    counts[pos].1 += 1;
                }
            }
        }
    }

    /// Apply the in-flight batch: all-failure candidates decay by 10x,
    /// any success resets to 1.0, unobserved candidates keep their weight.
    pub fn finish_batch(&mut self) {
        for (key, counts) in self.batch.drain() {
            let weights = self
                .weights
                .entry(key)
                .or_insert_with(|| vec![1.0; counts.len()]);
            for (w, (attempts, successes)) in weights.iter_mut().zip(&counts) {
                if *attempts == 0 {
                    continue;
                }
                if *successes == 0 {
                    *w /= 10.0;
                } else {
                    *w = 1.0;
                }
            }
        }
        debug!(slots = self.weights.len(), "online weights updated");
    }

    /// Current weight for one candidate; 1.0 when never observed.
    pub fn weight(&self, parent_rule: &str, slot: u32, pos: usize) -> f64 {
        self.weights
            .get(&(parent_rule.to_string(), slot))
            .and_then(|w| w.get(pos))
            .copied()
            .unwrap_or(1.0)
    }

    fn weights_for(&self, parent_rule: &str, slot: u32) -> Option<&[f64]> {
        self.weights
            .get(&(parent_rule.to_string(), slot))
            .map(Vec::as_slice)
    }
}

/// The composed selection oracle. Both layers are optional; with neither,
/// selection is plain CDF or uniform sampling.
#[derive(Default)]
pub struct Selector {
    online: Option<OnlineWeights>,
    invalid: Option<InvalidModel>,
}

impl Selector {
    pub fn new(online: bool, invalid: Option<InvalidModel>) -> Self {
        Selector {
            online: online.then(OnlineWeights::default),
            invalid,
        }
    }

    pub fn online_mut(&mut self) -> Option<&mut OnlineWeights> {
        self.online.as_mut()
    }

    pub fn has_invalid_model(&self) -> bool {
        self.invalid.is_some()
    }

    /// Pick a creator rule for the slot described by `ctx`.
    pub fn select(
        &self,
        store: &GrammarStore,
        ctx: &SlotContext<'_>,
        rng: &mut StdRng,
    ) -> Result<RuleIdx, GenError> {
        // Without a nonrecursive subset the full creator list is used even
        // under forced-nonrecursive retries; the recursion limit still
        // bounds the retry.
        let (candidates, cdf) = match store.nonrecursive_for(ctx.symbol) {
            Some(nr) if ctx.force_nonrecursive && !nr.is_empty() => {
                (Some(nr), store.nonrec_cdf_for(ctx.symbol))
            }
            _ => (store.creators_for(ctx.symbol), store.cdf_for(ctx.symbol)),
        };
        let candidates = candidates.filter(|c| !c.is_empty()).ok_or_else(|| {
            GenError::NoCreators {
                symbol: ctx.symbol.to_string(),
            }
        })?;

        let mut choice = self.initial_draw(ctx, candidates.len(), cdf, rng);

        if let Some(model) = &self.invalid {
            let mut attempts = 0;
            while !model.is_valid(&store.rule(candidates[choice]).text, ctx.chain) {
                attempts += 1;
                if attempts >= MAX_RESAMPLE {
                    return Err(GenError::OracleExhausted {
                        symbol: ctx.symbol.to_string(),
                        attempts,
                    });
                }
                choice = rng.gen_range(0..candidates.len());
            }
        }
        Ok(candidates[choice])
    }

    fn initial_draw(
        &self,
        ctx: &SlotContext<'_>,
        n: usize,
        cdf: Option<&[f64]>,
        rng: &mut StdRng,
    ) -> usize {
        if !ctx.force_nonrecursive {
            if let (Some(online), Some(parent)) = (&self.online, ctx.parent_rule) {
                if let Some(weights) = online.weights_for(parent, ctx.slot) {
                    if weights.len() == n {
                        return weighted_draw(weights, rng);
                    }
                }
            }
        }
        match cdf {
            Some(cdf) => cdf_draw(cdf, rng),
            None => rng.gen_range(0..n),
        }
    }
}

fn cdf_draw(cdf: &[f64], rng: &mut StdRng) -> usize {
    let r: f64 = rng.gen();
    cdf.iter()
        .position(|&c| r < c)
        .unwrap_or(cdf.len().saturating_sub(1))
}

fn weighted_draw(weights: &[f64], rng: &mut StdRng) -> usize {
    let total: f64 = weights.iter().sum();
    if total <= 0.0 {
        return rng.gen_range(0..weights.len());
    }
    let mut r: f64 = rng.gen::<f64>() * total;
    for (i, w) in weights.iter().enumerate() {
        r -= w;
        if r < 0.0 {
            return i;
        }
    }
    weights.len() - 1
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grammar::GrammarOptions;
    use crate::model::{InvalidTree, RuleTable};
    use rand::SeedableRng;

    fn store() -> GrammarStore {
        GrammarStore::from_str(
            "<a> = good(<b>)\n<a> = bad(<b>)\n<b> = 1\n<b> = 2\n",
            GrammarOptions::default(),
        )
        .unwrap()
    }

    fn ctx<'a>(symbol: &'a str, chain: &'a [&'a str]) -> SlotContext<'a> {
        SlotContext {
            symbol,
            parent_rule: None,
            slot: 0,
            chain,
            force_nonrecursive: false,
        }
    }

    #[test]
    fn plain_selection_draws_a_creator() {
        let g = store();
        let sel = Selector::default();
        let mut rng = StdRng::seed_from_u64(1);
        for _ in 0..32 {
            let idx = sel.select(&g, &ctx("a", &[]), &mut rng).unwrap();
            assert!(g.creators_for("a").unwrap().contains(&idx));
        }
    }

    #[test]
    fn missing_symbol_is_no_creators() {
        let g = store();
        let sel = Selector::default();
        let mut rng = StdRng::seed_from_u64(1);
        assert!(matches!(
            sel.select(&g, &ctx("nosuch", &[]), &mut rng),
            Err(GenError::NoCreators { .. })
        ));
    }

    #[test]
    fn invalid_model_resamples_around_bad_candidate() {
        let g = store();
        let mut table = RuleTable::default();
        let bad = table.intern("<a> = bad(<b>)");
        let api = table.intern("outer.call()");
        let mut tree = InvalidTree::default();
        tree.insert(bad, &[api]);
        let sel = Selector::new(false, Some(InvalidModel { table, tree }));

        let mut rng = StdRng::seed_from_u64(1);
        let chain = ["outer.call()"];
        let good = g.rule_by_text("<a> = good(<b>)").unwrap();
        for _ in 0..64 {
            let idx = sel.select(&g, &ctx("a", &chain), &mut rng).unwrap();
            assert_eq!(idx, good);
        }
        // A different chain leaves both candidates usable.
        let other = ["unrelated"];
        let drew_bad = (0..64).any(|_| {
            sel.select(&g, &ctx("a", &other), &mut rng).unwrap()
                == g.rule_by_text("<a> = bad(<b>)").unwrap()
        });
        assert!(drew_bad);
    }

    #[test]
    fn exhausted_resampling_escalates() {
        let g = store();
        let mut table = RuleTable::default();
        let good = table.intern("<a> = good(<b>)");
        let bad = table.intern("<a> = bad(<b>)");
        let api = table.intern("outer.call()");
        let mut tree = InvalidTree::default();
        tree.insert(good, &[api]);
        tree.insert(bad, &[api]);
        let sel = Selector::new(false, Some(InvalidModel { table, tree }));

        let mut rng = StdRng::seed_from_u64(1);
        let chain = ["outer.call()"];
        assert!(matches!(
            sel.select(&g, &ctx("a", &chain), &mut rng),
            Err(GenError::OracleExhausted { .. })
        ));
    }

    #[test]
    fn all_failure_batch_decays_and_success_resets() {
        let g = store();
        let mut w = OnlineWeights::default();

        // One statement whose subtree chose "<b> = 1" in slot 0 of
        // "<a> = bad(<b>)", reported as a failure.
        let mut t = DerivationTree::new();
        let a = t.add_rule_node(DerivationTree::ROOT, 0, "<a> = bad(<b>)", 1);
        t.add_rule_node(a, 0, "<b> = 1", 0);
        w.observe(&g, &t, a, false);
        w.finish_batch();

        let pos = g.creator_position("b", "<b> = 1").unwrap();
        assert!((w.weight("<a> = bad(<b>)", 0, pos) - 0.1).abs() < 1e-12);
        // Compounding across a second failing batch.
        w.observe(&g, &t, a, false);
        w.finish_batch();
        assert!((w.weight("<a> = bad(<b>)", 0, pos) - 0.01).abs() < 1e-12);
        // One success restores the full weight.
        w.observe(&g, &t, a, true);
        w.finish_batch();
        assert!((w.weight("<a> = bad(<b>)", 0, pos) - 1.0).abs() < 1e-12);
    }

    #[test]
    fn unobserved_candidates_keep_their_weight() {
        let g = store();
        let mut w = OnlineWeights::default();
        let mut t = DerivationTree::new();
        let a = t.add_rule_node(DerivationTree::ROOT, 0, "<a> = bad(<b>)", 1);
        t.add_rule_node(a, 0, "<b> = 1", 0);
        w.observe(&g, &t, a, false);
        w.finish_batch();

        let other = g.creator_position("b", "<b> = 2").unwrap();
        assert!((w.weight("<a> = bad(<b>)", 0, other) - 1.0).abs() < 1e-12);
    }

    #[test]
    fn decayed_candidate_is_still_drawable() {
        let weights = [0.001, 1.0];
        let mut rng = StdRng::seed_from_u64(3);
        let mut seen_first = false;
        for _ in 0..100_000 {
            if weighted_draw(&weights, &mut rng) == 0 {
                seen_first = true;
                break;
            }
        }
        assert!(seen_first);
    }
}
