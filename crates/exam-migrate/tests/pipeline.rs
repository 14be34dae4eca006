//! End-to-end runs of the four stages against the in-memory stores.

use exam_migrate::config::{RatioCheck, ReconcileConfig, TransformConfig};
use exam_migrate::core::record::row;
use exam_migrate::extract::SOURCE_TABLES;
use exam_migrate::load::triggers::SUSPENDED_TRIGGERS;
use exam_migrate::load::USER_TEST_MAP_FILE;
use exam_migrate::store::{PASS_ANSWER_CORRECTNESS, PASS_FINALIZE_USER_TESTS};
use exam_migrate::transform::{classify, outputs};
use exam_migrate::{
    ArtifactStore, CheckStatus, Config, IdentifierMap, MemorySource, MemoryTarget, MigrateError,
    Pipeline, Reconciler, Row, RowExt, Transformer,
};
use serde_json::json;
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

fn config(dir: &Path, extra: &str) -> Config {
    Config::from_yaml(&format!(
        r#"
source: {{ host: old-db, database: legacy, user: reader }}
target: {{ host: new-db, database: platform, user: writer }}
migration:
  data_dir: {}
{}
"#,
        dir.display(),
        extra
    ))
    .unwrap()
}

fn source_rows() -> Vec<(&'static str, Vec<Row>)> {
    vec![
        ("categories", vec![row([("id", json!(1)), ("name", json!("Temario"))])]),
        (
            "topics",
            vec![
                row([
                    ("id", json!(3)),
                    ("name", json!("Tema 3")),
                    ("number", json!(3)),
                    ("category", json!(1)),
                ]),
                row([
                    ("id", json!(4)),
                    ("name", json!("Especial")),
                    ("isSpecial", json!(true)),
                    ("number", json!(10)),
                ]),
            ],
        ),
        (
            "questions",
            vec![
                row([
                    ("id", json!(7)),
                    ("topic", json!(3)),
                    ("question", json!("Capital of Spain?")),
                    ("answer1", json!("Sevilla")),
                    ("answer2", json!("Madrid")),
                    ("answer3", json!("Bilbao")),
                    ("answer4", serde_json::Value::Null),
                    ("solution", json!(2)),
                ]),
                row([
                    ("id", json!(8)),
                    ("topic", json!(4)),
                    ("question", json!("2 + 2?")),
                    ("answer1", json!("4")),
                    ("answer2", json!("5")),
                    ("answer3", json!("22")),
                    ("solution", json!(1)),
                ]),
            ],
        ),
        (
            "users",
            vec![
                row([("id", json!(1)), ("username", json!("ana"))]),
                row([("id", json!(2)), ("username", json!("luis"))]),
            ],
        ),
        (
            "user_tests",
            vec![
                row([("id", json!(56)), ("userId", json!(1)), ("score", json!(8.5))]),
                row([("id", json!(57)), ("userId", json!(2))]),
            ],
        ),
        (
            "user_test_answers",
            vec![
                row([
                    ("id", json!(1)),
                    ("userTestId", json!(56)),
                    ("question", json!(7)),
                    ("answer", json!(2)),
                ]),
                row([
                    ("id", json!(2)),
                    ("userTestId", json!(57)),
                    ("question", json!(8)),
                    ("answer", json!(3)),
                ]),
            ],
        ),
        (
            "users_favorite_questions",
            vec![row([("userId", json!(1)), ("questionId", json!(7))])],
        ),
    ]
}

/// Every catalog table exists; the given ones carry rows.
fn source(tables: Vec<(&'static str, Vec<Row>)>) -> MemorySource {
    let seeded: HashSet<&str> = tables.iter().map(|(name, _)| *name).collect();
    let empty = SOURCE_TABLES
        .iter()
        .filter(|t| !seeded.contains(t.name))
        .fold(MemorySource::new(), |s, t| s.with_table(t.name, Vec::new()));
    tables
        .into_iter()
        .fold(empty, |s, (name, rows)| s.with_table(name, rows))
}

fn push(tables: &mut [(&'static str, Vec<Row>)], name: &str, extra: Row) {
    if let Some((_, rows)) = tables.iter_mut().find(|(n, _)| *n == name) {
        rows.push(extra);
    }
}

#[tokio::test]
async fn test_full_run_loads_and_reconciles() {
    let dir = tempfile::tempdir().unwrap();
    let memory = Arc::new(MemoryTarget::exam_schema());
    let result = Pipeline::with_stores(
        config(dir.path(), "  suspend_triggers: true"),
        Arc::new(source(source_rows())),
        memory.clone(),
    )
    .run()
    .await
    .unwrap();

    assert_eq!(result.status, "completed");
    assert!(result.success(), "unexpected failure: {:?}", result.failure());
    assert!(result.failed_tables.is_empty());

    // Dense ordering and classification
    let topics = memory.rows("topic");
    let special = topics.iter().find(|t| t.get_i64("id") == Some(4)).unwrap();
    assert_eq!(special["topic_type_id"], json!(classify::SPECIAL));
    assert_eq!(special["order"], json!(1));

    // Question 7 has three answers: three slots, each filled, no fourth.
    let options: Vec<Row> = memory
        .rows("question_options")
        .into_iter()
        .filter(|o| o.get_i64("question_id") == Some(7))
        .collect();
    assert_eq!(options.len(), 3);
    assert!(options.iter().all(|o| o.get_str("answer") != Some("")));
    let correct: Vec<i64> = options
        .iter()
        .filter(|o| o.get_bool("is_correct") == Some(true))
        .filter_map(|o| o.get_i64("option_order"))
        .collect();
    assert_eq!(correct, vec![2]);

    // Answers point at the new user test ids and the resolved option slots.
    let answers = memory.rows("user_test_answers");
    assert_eq!(answers.len(), 2);
    let test_ids: HashSet<i64> = memory
        .rows("user_tests")
        .iter()
        .filter_map(|t| t.get_i64("id"))
        .collect();
    assert!(answers
        .iter()
        .all(|a| test_ids.contains(&a.get_i64("user_test_id").unwrap())));
    let by_question = |q: i64| answers.iter().find(|a| a.get_i64("question_id") == Some(q)).unwrap();
    assert_eq!(by_question(7)["correct"], json!(true));
    assert_eq!(by_question(8)["correct"], json!(false));

    // Triggers were suspended and restored, then the recompute passes ran.
    assert!(SUSPENDED_TRIGGERS
        .iter()
        .all(|(table, trigger)| memory.trigger_enabled(table, trigger)));
    assert_eq!(
        memory.passes(),
        vec![PASS_FINALIZE_USER_TESTS.to_string(), PASS_ANSWER_CORRECTNESS.to_string()]
    );
    let finalized: Vec<bool> = memory
        .rows("user_tests")
        .iter()
        .map(|t| t.get_bool("finalized").unwrap_or(false))
        .collect();
    assert_eq!(finalized.iter().filter(|f| **f).count(), 1);

    let report = result.reconcile.unwrap();
    assert!(report.success());
    assert_eq!(report.get("question_options").unwrap().ratio, Some(3.0));
    assert_eq!(report.get("topic_type").unwrap().status, CheckStatus::Pass);
}

#[tokio::test]
async fn test_answers_of_unmapped_user_test_are_skipped() {
    let dir = tempfile::tempdir().unwrap();
    let mut tables = source_rows();
    // Test 55 belongs to a user that does not exist.
    push(&mut tables, "user_tests", row([("id", json!(55)), ("userId", json!(99))]));
    push(
        &mut tables,
        "user_test_answers",
        row([
            ("id", json!(3)),
            ("userTestId", json!(55)),
            ("question", json!(7)),
            ("answer", json!(1)),
        ]),
    );

    let memory = Arc::new(MemoryTarget::exam_schema());
    let result = Pipeline::with_stores(config(dir.path(), ""), Arc::new(source(tables)), memory.clone())
        .run()
        .await
        .unwrap();

    let transform = result.transform.as_ref().unwrap();
    assert_eq!(
        transform.table(outputs::USER_TESTS).unwrap().skipped.count("unknown_user"),
        1
    );

    let load = result.load.as_ref().unwrap();
    let answers = load.get("user_test_answers").unwrap();
    assert_eq!(answers.inserted, 2);
    assert_eq!(answers.skipped.count("unmapped_user_test"), 1);
    assert_eq!(memory.rows("user_test_answers").len(), 2);

    // The persisted map has no entry for 55.
    let transformed = ArtifactStore::new(dir.path().join("transformed"));
    let map =
        IdentifierMap::load("user_tests", transformed.table_path(USER_TEST_MAP_FILE)).unwrap();
    assert_eq!(map.len(), 2);
    assert!(map.get(55).is_none());

    // Reconciliation flags the shortfall; the load itself was clean.
    assert!(result.failed_tables.is_empty());
    let report = result.reconcile.as_ref().unwrap();
    let tests = report.get("user_tests").unwrap();
    assert_eq!(tests.status, CheckStatus::Fail);
    assert_eq!(tests.message.as_deref(), Some("Ratio 0.67 != 1.00"));
    assert!(matches!(
        result.failure(),
        Some(MigrateError::ReconciliationMismatch(_))
    ));
}

#[tokio::test]
async fn test_failed_bulk_load_still_restores_triggers() {
    let dir = tempfile::tempdir().unwrap();
    let memory = Arc::new(MemoryTarget::exam_schema().fail_bulk("user_test_answers"));
    let result = Pipeline::with_stores(
        config(dir.path(), "  suspend_triggers: true"),
        Arc::new(source(source_rows())),
        memory.clone(),
    )
    .run()
    .await
    .unwrap();

    assert_eq!(result.status, "failed");
    assert_eq!(result.failed_tables, vec!["user_test_answers".to_string()]);
    assert!(matches!(result.failure(), Some(MigrateError::Load { .. })));

    // Every disabled trigger was re-enabled exactly once.
    let log = memory.trigger_log();
    let disabled = log.iter().filter(|(_, _, enabled)| !enabled).count();
    let enabled = log.iter().filter(|(_, _, enabled)| *enabled).count();
    assert_eq!(disabled, SUSPENDED_TRIGGERS.len());
    assert_eq!(enabled, SUSPENDED_TRIGGERS.len());
    assert!(log[..disabled].iter().all(|(_, _, e)| !e));

    // User tests loaded, so finalize still ran after the restore.
    assert_eq!(memory.passes()[0], PASS_FINALIZE_USER_TESTS);

    let report = result.reconcile.unwrap();
    assert_eq!(report.get("user_test_answers").unwrap().status, CheckStatus::Fail);
}

#[tokio::test]
async fn test_flashcards_use_offset_ids_and_new_topic_type() {
    let dir = tempfile::tempdir().unwrap();
    let mut tables = source_rows();
    tables.push((
        "flash_cards_stack",
        vec![row([("id", json!(2)), ("name", json!("Verbos"))])],
    ));
    tables.push((
        "flashcards",
        vec![row([
            ("id", json!(7)),
            ("flash_card_stack", json!(2)),
            ("flash_card_question", json!("ser")),
            ("flash_card_answer", json!("to be")),
        ])],
    ));

    let memory = Arc::new(MemoryTarget::exam_schema());
    let result = Pipeline::with_stores(
        config(dir.path(), "  stages: { reconcile: false }"),
        Arc::new(source(tables)),
        memory.clone(),
    )
    .run()
    .await
    .unwrap();
    assert!(result.success(), "unexpected failure: {:?}", result.failure());

    // The sixth topic type is created by the store.
    let flashcard_type = memory
        .rows("topic_type")
        .into_iter()
        .find(|t| t.get_str("topic_type_name") == Some("Flashcards"))
        .unwrap();
    assert_eq!(flashcard_type.get_i64("id"), Some(6));

    let stack_topic = memory
        .rows("topic")
        .into_iter()
        .find(|t| t.get_i64("topic_type_id") == Some(6))
        .unwrap();
    let stack_topic_id = stack_topic.get_i64("id").unwrap();
    assert!(![3, 4].contains(&stack_topic_id));

    // Question 7 and flashcard 7 coexist.
    let questions = memory.rows("questions");
    let ids: HashSet<i64> = questions.iter().filter_map(|q| q.get_i64("id")).collect();
    assert!(ids.contains(&7));
    assert!(ids.contains(&30_000_007));
    let card = questions
        .iter()
        .find(|q| q.get_i64("id") == Some(30_000_007))
        .unwrap();
    assert_eq!(card.get_i64("topic"), Some(stack_topic_id));
}

#[test]
fn test_transform_is_independent_of_source_order() {
    let dir = tempfile::tempdir().unwrap();
    let topics = vec![
        row([("id", json!(12)), ("number", json!(2))]),
        row([("id", json!(3)), ("number", json!(1))]),
        row([("id", json!(9)), ("number", json!(60))]),
        row([("id", json!(5)), ("number", json!(5))]),
    ];
    let mut reversed = topics.clone();
    reversed.reverse();

    let run = |name: &str, rows: &[Row]| {
        let raw = ArtifactStore::new(dir.path().join(name).join("raw"));
        let out = ArtifactStore::new(dir.path().join(name).join("out"));
        raw.write_table("topics", rows).unwrap();
        Transformer::new(raw, out.clone(), TransformConfig::default(), 1)
            .with_timestamp("2024-05-01T00:00:00Z")
            .transform_all()
            .unwrap();
        let mut rows = out.read_table_or_empty(outputs::TOPICS).unwrap();
        rows.sort_by_key(|r| r.get_i64("id"));
        rows
    };

    let first = run("a", &topics);
    let second = run("b", &reversed);
    assert_eq!(first, second);

    // Study blocks 3, 5, 12 are ranked by id within their type.
    let order: Vec<(i64, i64)> = first
        .iter()
        .filter(|t| t.get_i64("topic_type_id") == Some(classify::STUDY_BLOCK))
        .map(|t| (t.get_i64("id").unwrap(), t.get_i64("order").unwrap()))
        .collect();
    assert_eq!(order, vec![(3, 1), (5, 2), (12, 3)]);
}

#[tokio::test]
async fn test_reconciler_flags_option_shortfall() {
    let questions: Vec<Row> = (1..=100).map(|id| row([("id", json!(id))])).collect();
    let options: Vec<Row> = (1..=305).map(|id| row([("id", json!(id))])).collect();
    let reconciler = Reconciler::new(
        Arc::new(MemorySource::new().with_table("questions", questions)),
        Arc::new(MemoryTarget::new().with_rows("question_options", options)),
        ReconcileConfig {
            tolerance: 0.01,
            checks: vec![RatioCheck {
                source: "questions".to_string(),
                target: "question_options".to_string(),
                ratio: 3.0,
            }],
            literal_checks: Vec::new(),
        },
    );

    let report = reconciler.reconcile_all().await.unwrap();
    let check = report.get("question_options").unwrap();
    assert_eq!(check.status, CheckStatus::Fail);
    assert_eq!(check.message.as_deref(), Some("Ratio 3.05 != 3.00"));
    assert!(matches!(
        report.mismatch(),
        Some(MigrateError::ReconciliationMismatch(_))
    ));
}
