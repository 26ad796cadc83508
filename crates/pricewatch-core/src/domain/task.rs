use serde::{Deserialize, Serialize};
use std::fmt;

/// 1 件のスクレイピング作業単位（brand + part）。
///
/// `attempts` は失敗した実行回数。identity は (part_number, brand_name) のみで、
/// attempts は含まない。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub brand_name: String,
    pub part_number: String,
    #[serde(default)]
    pub attempts: u32,
}

impl Task {
    pub fn new(brand_name: impl Into<String>, part_number: impl Into<String>) -> Self {
        Self {
            brand_name: brand_name.into(),
            part_number: part_number.into(),
            attempts: 0,
        }
    }

    pub fn key(&self) -> TaskKey {
        TaskKey {
            part_number: self.part_number.clone(),
            brand_name: self.brand_name.clone(),
        }
    }
}

impl fmt::Display for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} / {}", self.brand_name, self.part_number)
    }
}

/// Task identity: (part_number, brand_name).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskKey {
    pub part_number: String,
    pub brand_name: String,
}

/// 入力アダプタが正規化した 1 行。core はこれ以外の入力形式を知らない。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputRow {
    pub part_number: String,
    pub brand_name: String,
}

impl InputRow {
    pub fn new(part_number: impl Into<String>, brand_name: impl Into<String>) -> Self {
        Self {
            part_number: part_number.into(),
            brand_name: brand_name.into(),
        }
    }

    /// Trimmed copy, or `None` when either column is blank.
    pub fn normalized(&self) -> Option<InputRow> {
        let part = self.part_number.trim();
        let brand = self.brand_name.trim();
        if part.is_empty() || brand.is_empty() {
            return None;
        }
        Some(InputRow::new(part, brand))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_serializes_camel_case() {
        let task = Task {
            brand_name: "CLAAS".into(),
            part_number: "0001".into(),
            attempts: 2,
        };
        let json = serde_json::to_value(&task).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"brandName": "CLAAS", "partNumber": "0001", "attempts": 2})
        );
    }

    #[test]
    fn missing_attempts_defaults_to_zero() {
        let task: Task =
            serde_json::from_str(r#"{"brandName":"MANITOU","partNumber":"X-1"}"#).unwrap();
        assert_eq!(task.attempts, 0);
    }

    #[test]
    fn key_ignores_attempts() {
        let mut a = Task::new("CLAAS", "1");
        let b = Task::new("CLAAS", "1");
        a.attempts = 4;
        assert_eq!(a.key(), b.key());
    }

    #[test]
    fn normalized_drops_blank_rows() {
        assert_eq!(InputRow::new("  ", "CLAAS").normalized(), None);
        assert_eq!(
            InputRow::new(" RE1 ", " JOHN DEERE ").normalized(),
            Some(InputRow::new("RE1", "JOHN DEERE"))
        );
    }
}
