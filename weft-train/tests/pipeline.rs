//! End-to-end loop: generate cases with tree collection on, feed the
//! harness labels back, aggregate the dumped artifacts through all three
//! passes, and generate again with the trained model loaded.

use std::path::Path;

use weft::artifact::FeedbackRecord;
use weft::document::DocumentSpec;
use weft::driver::{GrammarSet, Outcome, Session};
use weft::grammar::{GrammarOptions, GrammarStore};
use weft::model::{InvalidModel, InvalidTreeFile, RuleTableFile, StatsFile};
use weft::selector::Selector;

/// Top-level statements call into an object; the variable they need
/// comes from a helper rule, so creation statements nest under the calls
/// and accumulate ancestor-chain statistics. Two call sites give the
/// creation rule one failing and one healthy context. Reuse is off to
/// keep fresh creations coming.
const JS_GRAMMAR: &str = "!var_reuse_prob 0.0\n\
                          !begin lines\n\
                          use(<Obj>);\n\
                          keep(<Obj>);\n\
                          !end lines\n\
                          !begin helperlines\n\
                          <new Obj> = obj.create();\n\
                          !end helperlines\n";

fn grammars() -> GrammarSet {
    let js_options = GrammarOptions {
        script_harness: true,
        prune: true,
    };
    GrammarSet {
        css: GrammarStore::from_str("<rules root> = .a { }\n", GrammarOptions::default()).unwrap(),
        html: GrammarStore::from_str("!begin lines\nmarkup\n!end lines\n", GrammarOptions::default())
            .unwrap(),
        js: GrammarStore::from_str(JS_GRAMMAR, js_options).unwrap(),
    }
}

fn small_spec() -> DocumentSpec {
    DocumentSpec {
        main_lines: 16,
        handler_lines: 2,
        html_lines: 1,
        extra_element_vars: 0,
        ..Default::default()
    }
}

fn session(seed: u64, selector: Selector) -> Session {
    Session::new(
        grammars(),
        "<cssfuzzer>|<htmlfuzzer>|<jsfuzzer>".to_string(),
        selector,
        seed,
    )
    .with_spec(small_spec())
}

/// Pull the harnessed statement texts out of a generated case, the way
/// the in-page harness reports them back.
fn harnessed_statements(case: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut rest = case;
    while let Some(start) = rest.find("String.raw`") {
        rest = &rest[start + "String.raw`".len()..];
        let Some(end) = rest.find('`') else { break };
        out.push(rest[..end].to_string());
        rest = &rest[end..];
    }
    // The try and catch arms carry the same text back to back.
    out.dedup();
    out
}

/// Play the target: every `use(...)` call rejects its argument, every
/// other statement runs cleanly.
fn label(statement: &str) -> &'static str {
    if statement.starts_with("use(") {
        "TypeError"
    } else {
        "Valid"
    }
}

fn run_passes(artifacts: &Path, out: &Path) {
    let config = weft_train::PassConfig {
        jobs: 2,
        group_size: 2,
        checkpoint_interval: 1,
    };
    weft_train::collect_ids(artifacts, &out.join("rules.bin"), &config).unwrap();
    weft_train::merge_stats(
        artifacts,
        &out.join("rules.bin"),
        &out.join("stats.bin"),
        &config,
    )
    .unwrap();
    weft_train::build_tree(&out.join("rules.bin"), &out.join("stats.bin"), &out.join("tree.bin"))
        .unwrap();
}

#[test]
fn train_and_regenerate() {
    let artifacts = tempfile::tempdir().unwrap();
    let models = tempfile::tempdir().unwrap();

    let mut session =
        session(7, Selector::default()).with_artifact_dir(artifacts.path().to_path_buf());
    for _ in 0..4 {
        let case = session.generate_case().unwrap();
        let feedback = harnessed_statements(&case)
            .into_iter()
            .map(|statement| {
                let label = label(&statement).to_string();
                FeedbackRecord { statement, label }
            })
            .collect();
        session
            .submit_feedback(&Outcome {
                success: true,
                crash_log: None,
                feedback: Some(feedback),
            })
            .unwrap();
    }

    run_passes(artifacts.path(), models.path());

    let table = RuleTableFile::load(&models.path().join("rules.bin")).unwrap();
    assert!(!table.table.is_empty(), "feedback subtrees should intern rules");
    assert_eq!(table.visited.len(), 4, "one artifact per case");

    let stats = StatsFile::load(&models.path().join("stats.bin")).unwrap();
    assert!(stats.stats.rule_count() > 0, "nested creations should record chains");

    // Creations under the rejecting call site fail every time; the same
    // rule under the other call site stays healthy.
    let tree = InvalidTreeFile::load(&models.path().join("tree.bin")).unwrap();
    assert!(tree.tree.rule_count() > 0);
    let model =
        InvalidModel::load(&models.path().join("rules.bin"), &models.path().join("tree.bin"))
            .unwrap();
    assert!(!model.is_valid("<new Obj> = obj.create();", &["use(<Obj>);"]));
    assert!(model.is_valid("<new Obj> = obj.create();", &["keep(<Obj>);"]));

    // A session running with the trained model still generates: the
    // selection oracle steers, it never wedges the generator.
    let mut pruned = self::session(11, Selector::new(false, Some(model)));
    let case = pruned.generate_case().unwrap();
    assert!(case.contains("use(") || case.contains("keep("));
}

#[test]
fn resumed_passes_only_touch_new_artifacts() {
    let artifacts = tempfile::tempdir().unwrap();
    let models = tempfile::tempdir().unwrap();

    let mut session =
        session(3, Selector::default()).with_artifact_dir(artifacts.path().to_path_buf());
    let case = session.generate_case().unwrap();
    let feedback = harnessed_statements(&case)
        .into_iter()
        .map(|statement| {
            let label = label(&statement).to_string();
            FeedbackRecord { statement, label }
        })
        .collect();
    session
        .submit_feedback(&Outcome {
            success: true,
            crash_log: None,
            feedback: Some(feedback),
        })
        .unwrap();

    run_passes(artifacts.path(), models.path());
    let first = StatsFile::load(&models.path().join("stats.bin")).unwrap();

    // No new artifacts: reruns are no-ops.
    run_passes(artifacts.path(), models.path());
    let second = StatsFile::load(&models.path().join("stats.bin")).unwrap();
    assert_eq!(first.visited, second.visited);
    assert_eq!(first.stats.rule_count(), second.stats.rule_count());
}
