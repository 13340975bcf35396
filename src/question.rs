//! Question input and answer shapes
//!
//! Questions arrive as JSONL records with an optional `format_hint`
//! describing the payload the caller expects back. The hint grammar is
//! small: scalar names (`int`, `float`, `str`), `list[...]`, or an
//! object sketch such as `{category:str, quantity:int}`. Anything
//! unrecognized degrades to free text rather than failing the question.

use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::Result;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Question {
    pub id: String,
    pub question: String,
    #[serde(default)]
    pub format_hint: String,
}

impl Question {
    pub fn new(id: impl Into<String>, question: impl Into<String>, format_hint: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            question: question.into(),
            format_hint: format_hint.into(),
        }
    }
}

/// Load questions from a JSONL file, skipping blank lines.
pub fn load_questions(path: &Path) -> Result<Vec<Question>> {
    let content = std::fs::read_to_string(path)?;
    let mut questions = Vec::new();
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        questions.push(serde_json::from_str(line)?);
    }
    Ok(questions)
}

/// Primitive type of one field inside an object-shaped answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Int,
    Float,
    Text,
}

impl FieldKind {
    fn parse(token: &str) -> FieldKind {
        match token.trim().to_lowercase().as_str() {
            "int" | "integer" => FieldKind::Int,
            "float" | "number" | "double" => FieldKind::Float,
            _ => FieldKind::Text,
        }
    }

    pub fn zero_value(&self) -> Value {
        match self {
            FieldKind::Int => json!(0),
            FieldKind::Float => json!(0.0),
            FieldKind::Text => json!(""),
        }
    }
}

/// Parsed form of a `format_hint`.
///
/// Shapes drive two things downstream: how result rows are coerced into
/// the final payload, and which typed zero value stands in when no
/// evidence was found.
#[derive(Debug, Clone, PartialEq)]
pub enum AnswerShape {
    Int,
    Float,
    Text,
    List,
    Object(Vec<(String, FieldKind)>),
}

impl AnswerShape {
    pub fn parse(hint: &str) -> AnswerShape {
        let hint = hint.trim();
        if hint.is_empty() {
            return AnswerShape::Text;
        }
        let lower = hint.to_lowercase();
        match lower.as_str() {
            "int" | "integer" => AnswerShape::Int,
            "float" | "number" | "double" => AnswerShape::Float,
            "str" | "string" | "text" => AnswerShape::Text,
            _ => {
                if lower == "list" || lower.starts_with("list[") {
                    AnswerShape::List
                } else if hint.starts_with('{') && hint.ends_with('}') {
                    Self::parse_object(&hint[1..hint.len() - 1])
                } else {
                    AnswerShape::Text
                }
            }
        }
    }

    fn parse_object(inner: &str) -> AnswerShape {
        let mut fields = Vec::new();
        for part in inner.split(',') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            let (key, kind) = match part.split_once(':') {
                Some((key, token)) => (key.trim(), FieldKind::parse(token)),
                None => (part, FieldKind::Text),
            };
            fields.push((key.to_string(), kind));
        }
        if fields.is_empty() {
            AnswerShape::Text
        } else {
            AnswerShape::Object(fields)
        }
    }

    /// The typed default used whenever no evidence supports an answer.
    pub fn zero_value(&self) -> Value {
        match self {
            AnswerShape::Int => json!(0),
            AnswerShape::Float => json!(0.0),
            AnswerShape::Text => json!(""),
            AnswerShape::List => json!([]),
            AnswerShape::Object(fields) => {
                let map: serde_json::Map<String, Value> = fields
                    .iter()
                    .map(|(key, kind)| (key.clone(), kind.zero_value()))
                    .collect();
                Value::Object(map)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scalar_hints() {
        println!("🧪 Testing scalar format hints...");
        assert_eq!(AnswerShape::parse("int"), AnswerShape::Int);
        assert_eq!(AnswerShape::parse(" Float "), AnswerShape::Float);
        assert_eq!(AnswerShape::parse("str"), AnswerShape::Text);
        assert_eq!(AnswerShape::parse(""), AnswerShape::Text);
        assert_eq!(AnswerShape::parse("mystery"), AnswerShape::Text);
        println!("✅ Scalar hints parsed");
    }

    #[test]
    fn test_list_and_object_hints() {
        println!("🧪 Testing structured format hints...");
        assert_eq!(AnswerShape::parse("list[{product:str, revenue:float}]"), AnswerShape::List);
        assert_eq!(AnswerShape::parse("list"), AnswerShape::List);

        let shape = AnswerShape::parse("{category:str, quantity:int}");
        match &shape {
            AnswerShape::Object(fields) => {
                assert_eq!(fields.len(), 2);
                assert_eq!(fields[0], ("category".to_string(), FieldKind::Text));
                assert_eq!(fields[1], ("quantity".to_string(), FieldKind::Int));
            }
            other => panic!("expected object shape, got {:?}", other),
        }
        println!("✅ Structured hints parsed");
    }

    #[test]
    fn test_zero_values() {
        println!("🧪 Testing typed zero values...");
        assert_eq!(AnswerShape::Int.zero_value(), json!(0));
        assert_eq!(AnswerShape::Float.zero_value(), json!(0.0));
        assert_eq!(AnswerShape::Text.zero_value(), json!(""));
        assert_eq!(AnswerShape::List.zero_value(), json!([]));

        let shape = AnswerShape::parse("{customer:str, margin:float}");
        assert_eq!(shape.zero_value(), json!({"customer": "", "margin": 0.0}));
        println!("✅ Zero values match shapes");
    }

    #[test]
    fn test_load_questions_skips_blank_lines() -> std::result::Result<(), Box<dyn std::error::Error>> {
        println!("🧪 Testing JSONL question loading...");
        let path = std::env::temp_dir().join(format!("questions_{}.jsonl", uuid::Uuid::new_v4()));
        std::fs::write(
            &path,
            "{\"id\": \"q1\", \"question\": \"How many orders?\", \"format_hint\": \"int\"}\n\n{\"id\": \"q2\", \"question\": \"Top products?\"}\n",
        )?;

        let questions = load_questions(&path)?;
        assert_eq!(questions.len(), 2);
        assert_eq!(questions[0].id, "q1");
        assert_eq!(questions[1].format_hint, "");

        std::fs::remove_file(&path)?;
        println!("✅ Loaded {} questions", questions.len());
        Ok(())
    }
}
