//! Per-entity transformation policies.
//!
//! Every function here is pure: source rows in, target rows out. Records
//! failing required-field validation are left out and counted in the ledger.

use super::classify::{classify, STUDY_BLOCK, TOPIC_TYPES};
use super::ordering::dense_order;
use crate::config::TransformConfig;
use crate::core::{Row, RowExt, SkipLedger};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashSet};

/// Column carrying the source id of rows whose target id is store-assigned.
pub const OLD_ID: &str = "_old_id";

/// Content of one option slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OptionTuple {
    /// 1-based ordinal of the slot.
    pub order: i64,
    pub answer: String,
    pub is_correct: bool,
}

/// Option contents keyed by the stringified question id.
pub type OptionsTable = BTreeMap<String, Vec<OptionTuple>>;

/// Values shared by every policy in one transform run.
#[derive(Debug, Clone)]
pub struct EntityContext<'a> {
    pub academy_id: i64,
    pub timestamp: &'a str,
    pub config: &'a TransformConfig,
}

fn text_or(src: &Row, key: &str, default: &str) -> Value {
    src.value_or(key, json!(default))
}

fn zero_or(src: &Row, key: &str) -> Value {
    src.value_or(key, json!(0))
}

fn flag_or(src: &Row, key: &str, default: bool) -> Value {
    json!(src.get_bool(key).unwrap_or(default))
}

fn label(src: &Row) -> String {
    src.field("id")
        .map(|v| v.to_string())
        .unwrap_or_else(|| "?".to_string())
}

pub fn topic_types(timestamp: &str) -> Vec<Row> {
    TOPIC_TYPES.iter().map(|t| t.to_row(timestamp)).collect()
}

pub fn categories(src: &[Row], ctx: &EntityContext<'_>, ledger: &mut SkipLedger) -> Vec<Row> {
    src.iter()
        .filter_map(|cat| {
            let Some(id) = cat.get_i64("id") else {
                ledger.skip("missing_id", "category without id");
                return None;
            };
            Some(Row::from_iter([
                ("id".to_string(), json!(id)),
                ("name".to_string(), cat.value("name")),
                ("topic_type".to_string(), json!(STUDY_BLOCK)),
                ("created_at".to_string(), json!(ctx.timestamp)),
                ("updated_at".to_string(), json!(ctx.timestamp)),
            ]))
        })
        .collect()
}

pub fn topics(src: &[Row], ctx: &EntityContext<'_>, ledger: &mut SkipLedger) -> Vec<Row> {
    let cfg = ctx.config;
    let mut out: Vec<Row> = Vec::with_capacity(src.len());

    for topic in src {
        let Some(id) = topic.get_i64("id") else {
            ledger.skip("missing_id", "topic without id");
            continue;
        };
        let hidden = topic.get_bool("isHidden").unwrap_or(false);
        let premium = topic.get_bool("isPremium").unwrap_or(false);
        let topic_type_id = classify(topic, &cfg.category_priority, cfg.mock_threshold);

        let mut row = Row::new();
        row.insert("id".into(), json!(id));
        row.insert("topic_type_id".into(), json!(topic_type_id));
        row.insert("topic_name".into(), topic.value("name"));
        row.insert("description".into(), Value::Null);
        row.insert("enabled".into(), json!(!hidden));
        row.insert("is_premium".into(), json!(premium));
        row.insert("is_hidden_but_premium".into(), json!(hidden && premium));
        row.insert("published_at".into(), json!(ctx.timestamp));
        row.insert("total_participants".into(), json!(0));
        row.insert("total_questions".into(), zero_or(topic, "questions"));
        row.insert("total_score".into(), json!(0));
        row.insert("options".into(), topic.value_or("options", json!(3)));
        row.insert("max_score".into(), json!(0));
        row.insert("min_score".into(), json!(0));
        row.insert("academy_id".into(), json!(ctx.academy_id));
        row.insert(
            "duration_seconds".into(),
            json!(topic.get_i64("minutes").unwrap_or(0) * 60),
        );
        row.insert("image_url".into(), Value::Null);
        row.insert("category_id".into(), topic.value("category"));
        row.insert("specialty_id".into(), Value::Null);
        row.insert("topic_group_id".into(), Value::Null);
        row.insert("group_order".into(), Value::Null);
        row.insert("created_at".into(), json!(ctx.timestamp));
        row.insert("updated_at".into(), json!(ctx.timestamp));
        out.push(row);
    }

    let order = dense_order(out.iter().filter_map(|t| {
        Some((t.get_i64("topic_type_id")?, t.get_i64("id")?))
    }));
    for row in &mut out {
        if let Some(n) = row.get_i64("id").and_then(|id| order.get(&id)) {
            row.insert("order".into(), json!(n));
        }
    }
    out
}

/// Option tuples for a question: 4 when `answer4` is non-empty, else 3.
fn question_options(q: &Row) -> Vec<OptionTuple> {
    let solution = q.get_i64("solution").unwrap_or(1);
    let count = if q.is_truthy("answer4") { 4 } else { 3 };
    (1..=count)
        .map(|ordinal| OptionTuple {
            order: ordinal,
            answer: q
                .get_str(&format!("answer{}", ordinal))
                .unwrap_or("")
                .to_string(),
            is_correct: solution == ordinal,
        })
        .collect()
}

/// Questions plus their options side-table.
pub fn questions(
    src: &[Row],
    ctx: &EntityContext<'_>,
    ledger: &mut SkipLedger,
) -> (Vec<Row>, OptionsTable) {
    let valid: Vec<&Row> = src
        .iter()
        .filter(|q| match (q.get_i64("id"), q.get_i64("topic")) {
            (None, _) => {
                ledger.skip("missing_id", "question without id");
                false
            }
            (Some(id), None) => {
                ledger.skip("missing_topic", format!("question {} has no topic", id));
                false
            }
            _ => true,
        })
        .collect();

    let order = dense_order(
        valid
            .iter()
            .filter_map(|q| Some((q.get_i64("topic")?, q.get_i64("id")?))),
    );

    let mut out = Vec::with_capacity(valid.len());
    let mut options = OptionsTable::new();
    for q in valid {
        let Some(id) = q.get_i64("id") else { continue };
        let mut row = Row::new();
        row.insert("id".into(), json!(id));
        row.insert("question".into(), q.value("question"));
        row.insert("tip".into(), text_or(q, "tip", ""));
        row.insert("topic".into(), q.value("topic"));
        row.insert("article".into(), q.value("article"));
        row.insert("question_image_url".into(), json!(""));
        row.insert("retro_image_url".into(), json!(""));
        row.insert("retro_audio_enable".into(), flag_or(q, "retro_audio", false));
        row.insert("retro_audio_text".into(), text_or(q, "retro_text", ""));
        row.insert("retro_audio_url".into(), json!(""));
        row.insert("order".into(), json!(order.get(&id).copied().unwrap_or(0)));
        // The legacy column name is misspelled.
        row.insert("published".into(), flag_or(q, "publised", true));
        row.insert("shuffled".into(), flag_or(q, "shuffled", false));
        row.insert("num_answered".into(), zero_or(q, "num_answered"));
        row.insert("num_fails".into(), zero_or(q, "num_fails"));
        row.insert("num_empty".into(), zero_or(q, "num_empty"));
        row.insert(
            "challenge_by_tutor".into(),
            flag_or(q, "challenge_by_tutor", false),
        );
        row.insert("challenge_reason".into(), q.value("challenge_reason"));
        row.insert("academy_id".into(), json!(ctx.academy_id));
        row.insert("created_by".into(), Value::Null);

        options.insert(id.to_string(), question_options(q));
        out.push(row);
    }
    (out, options)
}

pub fn users(src: &[Row], ctx: &EntityContext<'_>, ledger: &mut SkipLedger) -> Vec<Row> {
    let mut out = Vec::with_capacity(src.len());
    for user in src {
        let Some(id) = user.get_i64("id") else {
            ledger.skip("missing_id", "user without id");
            continue;
        };
        let Some(username) = user.get_str("username").filter(|u| !u.is_empty()) else {
            ledger.skip("missing_username", format!("user {} has no username", id));
            continue;
        };

        let mut row = Row::new();
        row.insert("id".into(), json!(id));
        row.insert("username".into(), json!(username));
        for empty in ["email", "first_name", "last_name", "phone"] {
            row.insert(empty.into(), Value::Null);
        }
        row.insert("totalQuestions".into(), zero_or(user, "totalQuestions"));
        row.insert("rightQuestions".into(), zero_or(user, "rightQuestions"));
        row.insert("wrongQuestions".into(), zero_or(user, "wrongQuestions"));
        row.insert("enabled".into(), flag_or(user, "enabled", true));
        row.insert("createdAt".into(), user.value("createdAt"));
        row.insert("updatedAt".into(), user.value("updatedAt"));
        row.insert("academy_id".into(), json!(ctx.academy_id));
        row.insert("specialty_id".into(), Value::Null);
        row.insert("question_goal".into(), user.value_or("goal", json!(50)));
        row.insert("deleted".into(), json!(false));
        out.push(row);
    }
    out
}

/// Topic list for a test; empty lists fall back to the special topic, else `[-1]`.
fn topic_ids(test: &Row) -> Value {
    match test.field("topics") {
        Some(Value::Array(topics)) if !topics.is_empty() => Value::Array(topics.clone()),
        _ => match test.get_i64("specialTopic") {
            Some(special) if special > 0 => json!([special]),
            _ => json!([-1]),
        },
    }
}

/// User tests. The target id is store-assigned; the source id travels in `_old_id`.
pub fn user_tests(src: &[Row], valid_users: &HashSet<i64>, ledger: &mut SkipLedger) -> Vec<Row> {
    let mut out = Vec::with_capacity(src.len());
    for test in src {
        let Some(old_id) = test.get_i64("id") else {
            ledger.skip("missing_id", "user test without id");
            continue;
        };
        let user_id = match test.get_i64("userId") {
            Some(u) if valid_users.contains(&u) => u,
            Some(u) => {
                ledger.skip("unknown_user", format!("test {}: user_id {} does not exist", old_id, u));
                continue;
            }
            None => {
                ledger.skip("missing_user", format!("test {}: no user_id", old_id));
                continue;
            }
        };

        let right = test.get_i64("rightQuestions").unwrap_or(0);
        let wrong = test.get_i64("wrongQuestions").unwrap_or(0);
        let question_count = match test.field("questions") {
            Some(Value::Array(q)) if !q.is_empty() => json!(q.len()),
            _ => zero_or(test, "question_count"),
        };

        let mut row = Row::new();
        row.insert("user_id".into(), json!(user_id));
        row.insert("topic_ids".into(), topic_ids(test));
        row.insert("options".into(), test.value_or("options", json!(4)));
        row.insert("right_questions".into(), json!(right));
        row.insert("wrong_questions".into(), json!(wrong));
        row.insert("question_count".into(), question_count);
        row.insert("total_answered".into(), json!(right + wrong));
        row.insert("score".into(), test.value("score"));
        row.insert("finalized".into(), flag_or(test, "finalized", false));
        row.insert("visible".into(), flag_or(test, "visible", true));
        row.insert("study_mode".into(), flag_or(test, "studyMode", false));
        row.insert("study_failed".into(), flag_or(test, "studyFailed", false));
        row.insert("study_white".into(), flag_or(test, "studyWhite", false));
        row.insert("mock".into(), test.value("isMock"));
        row.insert("survival".into(), flag_or(test, "isSurvival", false));
        row.insert("mark_collection".into(), test.value("markCollection"));
        row.insert("minutes".into(), test.value("minutes"));
        row.insert("time_spent_millis".into(), test.value("timeSpentMillis"));
        row.insert("special_topic".into(), test.value("specialTopic"));
        row.insert("special_topic_title".into(), test.value("specialTopicTitle"));
        row.insert("difficulty_end".into(), test.value("difficulty_end"));
        row.insert("number_of_lives".into(), zero_or(test, "number_of_lives"));
        row.insert("created_at".into(), test.value("updatedAt"));
        row.insert("updated_at".into(), test.value("updatedAt"));
        row.insert("is_flashcard_mode".into(), json!(false));
        row.insert("duration_seconds".into(), Value::Null);
        row.insert("topic_group_id".into(), Value::Null);
        row.insert("total_time_seconds".into(), json!(0));
        row.insert("survival_session_id".into(), Value::Null);
        row.insert("time_attack_session_id".into(), Value::Null);
        row.insert(OLD_ID.into(), json!(old_id));
        out.push(row);
    }
    out
}

pub fn favorites(src: &[Row], ctx: &EntityContext<'_>, ledger: &mut SkipLedger) -> Vec<Row> {
    src.iter()
        .filter_map(|fav| {
            let (Some(user_id), Some(question_id)) =
                (fav.get_i64("userId"), fav.get_i64("questionId"))
            else {
                ledger.skip("missing_link", format!("favorite {} lacks user or question", label(fav)));
                return None;
            };
            Some(Row::from_iter([
                ("user_id".to_string(), json!(user_id)),
                ("question_id".to_string(), json!(question_id)),
                ("created_at".to_string(), fav.value_or("createdAt", json!(ctx.timestamp))),
            ]))
        })
        .collect()
}

/// Collapse legacy challenge states into `pendiente`, `resuelta` or `rechazada`.
pub fn normalize_state(state: Option<&str>) -> &'static str {
    let Some(state) = state.filter(|s| !s.is_empty()) else {
        return "pendiente";
    };
    match state.to_lowercase().as_str() {
        "pendiente" | "pending" => "pendiente",
        "aceptada" | "accepted" | "aprobada" | "resuelta" | "resolved" => "resuelta",
        "rechazada" | "rejected" | "denegada" => "rechazada",
        _ => "pendiente",
    }
}

pub fn challenges(src: &[Row], ctx: &EntityContext<'_>, ledger: &mut SkipLedger) -> Vec<Row> {
    let mut out = Vec::with_capacity(src.len());
    for ch in src {
        let Some(question_id) = ch.get_i64("questionId") else {
            ledger.skip("missing_question", format!("challenge {}: no question_id", label(ch)));
            continue;
        };
        let Some(user_id) = ch.get_i64("user_id") else {
            ledger.skip("missing_user", format!("challenge {}: no user_id", label(ch)));
            continue;
        };

        let mut row = Row::new();
        row.insert("user_id".into(), json!(user_id));
        row.insert("question_id".into(), json!(question_id));
        row.insert("topic_id".into(), ch.value("topicId"));
        row.insert("reason".into(), text_or(ch, "reason", ""));
        row.insert("state".into(), json!(normalize_state(ch.get_str("state"))));
        row.insert("reply".into(), text_or(ch, "replay", ""));
        row.insert("editor_id".into(), Value::Null);
        row.insert("open".into(), flag_or(ch, "open", true));
        row.insert("tutor_uuid".into(), ch.value("tutor"));
        row.insert("academy_id".into(), json!(ctx.academy_id));
        row.insert("specialty_id".into(), Value::Null);
        row.insert("created_at".into(), ch.value("created_at"));
        out.push(row);
    }
    out
}

/// URL slug: lowercase name with spaces as dashes, or `academy-{id}`.
pub fn slugify(name: Option<&str>, id: i64) -> String {
    match name.filter(|n| !n.is_empty()) {
        Some(name) => name.to_lowercase().replace(' ', "-"),
        None => format!("academy-{}", id),
    }
}

pub fn academies(src: &[Row], ctx: &EntityContext<'_>, ledger: &mut SkipLedger) -> Vec<Row> {
    let mut out = Vec::with_capacity(src.len());
    for academy in src {
        let Some(id) = academy.get_i64("id") else {
            ledger.skip("missing_id", "academy without id");
            continue;
        };
        let mut row = Row::new();
        row.insert("id".into(), json!(id));
        row.insert("name".into(), academy.value("name"));
        row.insert("slug".into(), json!(slugify(academy.get_str("name"), id)));
        for col in [
            "description",
            "logo_url",
            "website",
            "contact_email",
            "contact_phone",
            "address",
        ] {
            row.insert(col.into(), academy.value(col));
        }
        row.insert("is_active".into(), flag_or(academy, "is_active", true));
        row.insert(
            "created_at".into(),
            academy.value_or("created_at", json!(ctx.timestamp)),
        );
        out.push(row);
    }
    out
}

/// Flashcard stacks become topics with store-assigned ids, ordered by stack id.
/// `topic_type_id` is filled in at load time.
pub fn flashcard_stacks(src: &[Row], ctx: &EntityContext<'_>, ledger: &mut SkipLedger) -> Vec<Row> {
    let mut stacks: Vec<(i64, &Row)> = Vec::with_capacity(src.len());
    for stack in src {
        match stack.get_i64("id") {
            Some(id) => stacks.push((id, stack)),
            None => ledger.skip("missing_id", "flashcard stack without id"),
        }
    }
    stacks.sort_by_key(|(id, _)| *id);

    stacks
        .into_iter()
        .enumerate()
        .map(|(idx, (id, stack))| {
            let mut row = Row::new();
            row.insert(OLD_ID.into(), json!(id));
            row.insert("topic_type_id".into(), Value::Null);
            row.insert(
                "topic_name".into(),
                text_or(stack, "name", &format!("Flashcard Stack {}", id)),
            );
            row.insert("description".into(), json!(""));
            row.insert("enabled".into(), json!(true));
            row.insert("is_premium".into(), json!(false));
            row.insert("is_hidden_but_premium".into(), json!(false));
            row.insert("published_at".into(), json!(ctx.timestamp));
            row.insert("total_participants".into(), json!(0));
            row.insert("total_questions".into(), zero_or(stack, "num_cards"));
            row.insert("total_score".into(), json!(0));
            row.insert("options".into(), json!(2));
            row.insert("max_score".into(), json!(0));
            row.insert("min_score".into(), json!(0));
            row.insert(
                "academy_id".into(),
                stack.value_or("academy", json!(ctx.academy_id)),
            );
            row.insert("duration_seconds".into(), json!(0));
            row.insert("image_url".into(), Value::Null);
            row.insert("order".into(), json!(idx + 1));
            for col in ["category_id", "specialty_id", "topic_group_id", "group_order"] {
                row.insert(col.into(), Value::Null);
            }
            row.insert(
                "created_at".into(),
                stack.value_or("created_at", json!(ctx.timestamp)),
            );
            row.insert("updated_at".into(), json!(ctx.timestamp));
            row
        })
        .collect()
}

/// Flashcards become two-sided questions in the offset id range.
/// `topic` holds the source stack id until load remaps it. A card whose
/// offset id is already taken by a source question is skipped.
pub fn flashcards(
    src: &[Row],
    known_stacks: &HashSet<i64>,
    question_ids: &HashSet<i64>,
    ctx: &EntityContext<'_>,
    ledger: &mut SkipLedger,
) -> (Vec<Row>, OptionsTable) {
    let offset = ctx.config.flashcard_id_offset;
    let mut out = Vec::with_capacity(src.len());
    let mut options = OptionsTable::new();

    for card in src {
        let Some(id) = card.get_i64("id") else {
            ledger.skip("missing_id", "flashcard without id");
            continue;
        };
        let stack = card.get_i64("flash_card_stack");
        let Some(stack) = stack.filter(|s| known_stacks.contains(s)) else {
            ledger.skip("unknown_stack", format!("flashcard {}: stack {:?} unknown", id, stack));
            continue;
        };

        let Some(question_id) = offset.checked_add(id).filter(|q| !question_ids.contains(q)) else {
            ledger.skip(
                "id_collision",
                format!("flashcard {}: id {} + offset {} is taken by a question", id, id, offset),
            );
            continue;
        };
        let front = card.get_str("flash_card_question").unwrap_or("").to_string();
        let back = card.get_str("flash_card_answer").unwrap_or("").to_string();

        let mut row = Row::new();
        row.insert("id".into(), json!(question_id));
        row.insert("question".into(), json!(front));
        row.insert("tip".into(), json!(""));
        row.insert("topic".into(), json!(stack));
        row.insert("article".into(), Value::Null);
        row.insert("question_image_url".into(), json!(""));
        row.insert("retro_image_url".into(), json!(""));
        row.insert("retro_audio_enable".into(), json!(false));
        row.insert("retro_audio_text".into(), json!(""));
        row.insert("retro_audio_url".into(), json!(""));
        row.insert("order".into(), zero_or(card, "order"));
        row.insert("published".into(), json!(true));
        row.insert("shuffled".into(), json!(false));
        row.insert("num_answered".into(), json!(0));
        row.insert("num_fails".into(), json!(0));
        row.insert("num_empty".into(), json!(0));
        row.insert("challenge_by_tutor".into(), json!(false));
        row.insert("challenge_reason".into(), Value::Null);
        row.insert("academy_id".into(), json!(ctx.academy_id));
        row.insert("created_by".into(), Value::Null);

        options.insert(
            question_id.to_string(),
            vec![
                OptionTuple {
                    order: 1,
                    answer: front,
                    is_correct: false,
                },
                OptionTuple {
                    order: 2,
                    answer: back,
                    is_correct: false,
                },
            ],
        );
        out.push(row);
    }
    (out, options)
}
