// Answer records and the last-write-wins-by-batch merge into the cache.

use std::collections::HashSet;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

/// An identifier-keyed record returned by a suggester. Everything besides
/// `id` is kept as an opaque JSON object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Answer {
    #[serde(deserialize_with = "id_from_string_or_number")]
    pub id: String,
    #[serde(flatten)]
    pub payload: Map<String, Value>,
}

impl Answer {
    pub fn new(id: impl Into<String>, payload: Map<String, Value>) -> Self {
        Self {
            id: id.into(),
            payload,
        }
    }
}

/// Suggesters may send either one answer or a list of them.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum AnswerBatch {
    Many(Vec<Answer>),
    One(Answer),
}

impl AnswerBatch {
    pub fn into_vec(self) -> Vec<Answer> {
        match self {
            AnswerBatch::Many(answers) => answers,
            AnswerBatch::One(answer) => vec![answer],
        }
    }
}

impl From<Vec<Answer>> for AnswerBatch {
    fn from(answers: Vec<Answer>) -> Self {
        AnswerBatch::Many(answers)
    }
}

impl From<Answer> for AnswerBatch {
    fn from(answer: Answer) -> Self {
        AnswerBatch::One(answer)
    }
}

fn id_from_string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!(
            "answer id must be a string or number, got {other}"
        ))),
    }
}

/// Merge `incoming` over `current`: the incoming answers first, in their
/// given order, then every prior answer whose id the batch does not carry,
/// in prior order.
pub fn merge_answers(current: &[Answer], incoming: Vec<Answer>) -> Vec<Answer> {
    let incoming_ids: HashSet<&str> = incoming.iter().map(|a| a.id.as_str()).collect();
    let retained: Vec<Answer> = current
        .iter()
        .filter(|a| !incoming_ids.contains(a.id.as_str()))
        .cloned()
        .collect();

    let mut merged = incoming;
    merged.extend(retained);
    merged
}

/// In-memory answer cache. Each ingest computes the full new sequence
/// before replacing the old one.
#[derive(Debug, Default, Clone)]
pub struct AnswerCache {
    answers: Vec<Answer>,
}

impl AnswerCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ingest(&mut self, batch: impl Into<AnswerBatch>) {
        let merged = merge_answers(&self.answers, batch.into().into_vec());
        self.answers = merged;
    }

    pub fn answers(&self) -> &[Answer] {
        &self.answers
    }

    pub fn get(&self, id: &str) -> Option<&Answer> {
        self.answers.iter().find(|a| a.id == id)
    }

    pub fn len(&self) -> usize {
        self.answers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.answers.is_empty()
    }
}
