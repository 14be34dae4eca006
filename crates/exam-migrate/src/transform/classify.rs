//! Topic type catalog and topic classification.

use crate::config::ClassificationRule;
use crate::core::{Row, RowExt};
use serde_json::{json, Value};

/// A topic type created by policy rather than extracted.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TopicTypeSpec {
    pub id: i64,
    pub name: &'static str,
    pub description: &'static str,
    pub level: &'static str,
    pub default_number_options: i64,
    pub penalty: f64,
    pub time_by_question: f64,
}

pub const STUDY_BLOCK: i64 = 1;
pub const MOCK: i64 = 2;
pub const PSYCHOTECHNICAL: i64 = 3;
pub const OFFICIAL: i64 = 4;
pub const SPECIAL: i64 = 5;

/// The five policy topic types, ids 1..=5.
pub const TOPIC_TYPES: [TopicTypeSpec; 5] = [
    TopicTypeSpec {
        id: STUDY_BLOCK,
        name: "Bloque de Temario",
        description: "Bloques de temario para estudio secuencial",
        level: "Study",
        default_number_options: 3,
        penalty: 0.5,
        time_by_question: 0.5,
    },
    TopicTypeSpec {
        id: MOCK,
        name: "Simulacros",
        description: "Simulacros de examen completo",
        level: "Mock",
        default_number_options: 3,
        penalty: 0.5,
        time_by_question: 0.5,
    },
    TopicTypeSpec {
        id: PSYCHOTECHNICAL,
        name: "Psicotécnicos",
        description: "Test psicotécnicos y de aptitudes",
        level: "Mock",
        default_number_options: 4,
        penalty: 0.5,
        time_by_question: 0.5,
    },
    TopicTypeSpec {
        id: OFFICIAL,
        name: "Exámenes Oficiales",
        description: "Exámenes oficiales de convocatorias anteriores",
        level: "Mock",
        default_number_options: 3,
        penalty: 0.5,
        time_by_question: 0.5,
    },
    TopicTypeSpec {
        id: SPECIAL,
        name: "Test Especiales",
        description: "Test especiales y de repaso",
        level: "Mock",
        default_number_options: 3,
        penalty: 0.5,
        time_by_question: 0.5,
    },
];

/// Topic type holding flashcard stacks. Looked up or created at load time.
pub const FLASHCARD_TOPIC_TYPE: TopicTypeSpec = TopicTypeSpec {
    id: 0,
    name: "Flashcards",
    description: "Tarjetas de estudio con dos caras",
    level: "Flashcard",
    default_number_options: 2,
    penalty: 0.0,
    time_by_question: 1.0,
};

impl TopicTypeSpec {
    /// Target row. The id is omitted for store-assigned types.
    pub fn to_row(&self, timestamp: &str) -> Row {
        let mut row = Row::new();
        if self.id > 0 {
            row.insert("id".into(), json!(self.id));
            row.insert("order_of_appearance".into(), json!(self.id));
        }
        row.insert("topic_type_name".into(), json!(self.name));
        row.insert("description".into(), json!(self.description));
        row.insert("level".into(), json!(self.level));
        row.insert(
            "default_number_options".into(),
            json!(self.default_number_options),
        );
        row.insert("penalty".into(), json!(self.penalty));
        row.insert("time_by_question".into(), json!(self.time_by_question));
        row.insert("created_at".into(), Value::from(timestamp));
        row.insert("updated_at".into(), Value::from(timestamp));
        row
    }
}

fn rule_matches(rule: ClassificationRule, topic: &Row, mock_threshold: i64) -> bool {
    match rule {
        ClassificationRule::Psychotechnical => topic.is_truthy("isPsychoTechnical"),
        ClassificationRule::Official => topic.is_truthy("isOfficial"),
        ClassificationRule::Special => topic.is_truthy("isSpecial"),
        // A missing number counts as 0.
        ClassificationRule::StudyBlock => topic.get_i64("number").unwrap_or(0) <= mock_threshold,
        ClassificationRule::Mock => topic.is_truthy("isMock"),
    }
}

fn rule_topic_type(rule: ClassificationRule) -> i64 {
    match rule {
        ClassificationRule::Psychotechnical => PSYCHOTECHNICAL,
        ClassificationRule::Official => OFFICIAL,
        ClassificationRule::Special => SPECIAL,
        ClassificationRule::StudyBlock => STUDY_BLOCK,
        ClassificationRule::Mock => MOCK,
    }
}

/// Topic type id for a source topic: first matching rule wins, mock otherwise.
pub fn classify(topic: &Row, priority: &[ClassificationRule], mock_threshold: i64) -> i64 {
    priority
        .iter()
        .find(|rule| rule_matches(**rule, topic, mock_threshold))
        .map(|rule| rule_topic_type(*rule))
        .unwrap_or(MOCK)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TransformConfig;
    use crate::core::record::row;

    fn classify_default(topic: &Row) -> i64 {
        let cfg = TransformConfig::default();
        classify(topic, &cfg.category_priority, cfg.mock_threshold)
    }

    #[test]
    fn test_special_wins_over_low_number() {
        let topic = row([
            ("isSpecial", json!(true)),
            ("isOfficial", json!(false)),
            ("number", json!(10)),
        ]);
        assert_eq!(classify_default(&topic), SPECIAL);
    }

    #[test]
    fn test_priority_order() {
        let all = row([
            ("isPsychoTechnical", json!(true)),
            ("isOfficial", json!(true)),
            ("isSpecial", json!(true)),
            ("isMock", json!(true)),
            ("number", json!(1)),
        ]);
        assert_eq!(classify_default(&all), PSYCHOTECHNICAL);

        let official = row([("isOfficial", json!(true)), ("isSpecial", json!(true))]);
        assert_eq!(classify_default(&official), OFFICIAL);
    }

    #[test]
    fn test_number_threshold_and_defaults() {
        assert_eq!(classify_default(&row([("number", json!(45))])), STUDY_BLOCK);
        assert_eq!(classify_default(&row([("number", json!(46))])), MOCK);
        assert_eq!(
            classify_default(&row([("number", json!(46)), ("isMock", json!(true))])),
            MOCK
        );
        // no number at all counts as 0
        assert_eq!(classify_default(&Row::new()), STUDY_BLOCK);
    }

    #[test]
    fn test_custom_priority() {
        let topic = row([("isSpecial", json!(true)), ("isMock", json!(true)), ("number", json!(99))]);
        let priority = [ClassificationRule::Mock, ClassificationRule::Special];
        assert_eq!(classify(&topic, &priority, 45), MOCK);
    }

    #[test]
    fn test_topic_type_rows() {
        let rows: Vec<Row> = TOPIC_TYPES.iter().map(|t| t.to_row("2024-01-01T00:00:00")).collect();
        assert_eq!(rows[2]["default_number_options"], json!(4));
        assert_eq!(rows[4]["order_of_appearance"], json!(5));
        assert!(FLASHCARD_TOPIC_TYPE.to_row("now").get("id").is_none());
    }
}
