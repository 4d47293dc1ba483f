//! Injected capabilities: answer generation and similarity matching
//!
//! The answer generator and the semantic matcher are external
//! collaborators. The hubs only ever see these two traits; tests and
//! deployments plug in whatever sits behind them.

use async_trait::async_trait;
use dashmap::DashMap;

use capmesh_core::{ApplicationError, normalize_question, question_hash};

/// An answer produced by the generator
#[derive(Debug, Clone, PartialEq)]
pub struct GeneratedAnswer {
    /// The answer text
    pub text: String,
    /// Generator confidence in `[0, 1]`
    pub confidence: f32,
}

/// The opaque `Answer(question) -> text` collaborator
#[async_trait]
pub trait AnswerProvider: Send + Sync {
    /// Produce an answer for a question
    async fn answer(&self, question: &str) -> Result<GeneratedAnswer, ApplicationError>;
}

/// The opaque `Similarity(q1, q2) -> [0, 1]` collaborator
pub trait SimilarityScorer: Send + Sync {
    /// Score how close a cached candidate question is to the asked one
    fn score(&self, question: &str, candidate: &str) -> f64;
}

/// Table-driven answer provider
///
/// Answers are keyed by normalized question hash. Useful for seeding
/// deterministic knowledge in tests and demos; a missing question fails
/// with `ANSWER_FAIL` unless a default is set.
#[derive(Debug, Default)]
pub struct StaticAnswers {
    answers: DashMap<String, String>,
    default_answer: Option<String>,
}

impl StaticAnswers {
    /// Create an empty provider that fails every question
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a provider that answers every unknown question the same way
    pub fn with_default(default_answer: &str) -> Self {
        Self {
            answers: DashMap::new(),
            default_answer: Some(default_answer.to_string()),
        }
    }

    /// Register an answer for a question
    pub fn insert(&self, question: &str, answer: &str) {
        self.answers
            .insert(question_hash(question), answer.to_string());
    }

    /// Builder-style registration
    pub fn with_answer(self, question: &str, answer: &str) -> Self {
        self.insert(question, answer);
        self
    }
}

#[async_trait]
impl AnswerProvider for StaticAnswers {
    async fn answer(&self, question: &str) -> Result<GeneratedAnswer, ApplicationError> {
        if let Some(text) = self.answers.get(&question_hash(question)) {
            return Ok(GeneratedAnswer {
                text: text.clone(),
                confidence: 0.95,
            });
        }
        match &self.default_answer {
            Some(text) => Ok(GeneratedAnswer {
                text: text.clone(),
                confidence: 0.5,
            }),
            None => Err(ApplicationError::AnswerFailed(format!(
                "no knowledge for question ({} bytes)",
                question.len()
            ))),
        }
    }
}

/// Exact-match scorer: 1.0 when the normalized questions are equal
///
/// The deterministic hash path already covers this case; the scorer exists
/// as the default stand-in for a real semantic matcher.
#[derive(Debug, Clone, Copy, Default)]
pub struct NormalizedEquality;

impl SimilarityScorer for NormalizedEquality {
    fn score(&self, question: &str, candidate: &str) -> f64 {
        if normalize_question(question) == normalize_question(candidate) {
            1.0
        } else {
            0.0
        }
    }
}
