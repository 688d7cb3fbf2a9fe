//! Operator confirmation of plans and policy overrides.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

/// Question id asked before applying a plan
pub const APPROVE: &str = "approve";
/// Question id asked before overriding a failed policy check
pub const OVERRIDE: &str = "override";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Answer {
    Yes,
    No,
    Abort,
}

impl Answer {
    /// Only an explicit "yes" approves; "abort" cancels; anything else declines.
    pub fn parse(input: &str) -> Self {
        match input.trim().to_ascii_lowercase().as_str() {
            "yes" => Answer::Yes,
            "abort" => Answer::Abort,
            _ => Answer::No,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Question {
    pub id: String,
    pub query: String,
    pub description: String,
}

impl Question {
    pub fn approve(description: impl Into<String>) -> Self {
        Self {
            id: APPROVE.to_string(),
            query: "Do you want to perform these actions?".to_string(),
            description: description.into(),
        }
    }

    pub fn override_policy(description: impl Into<String>) -> Self {
        Self {
            id: OVERRIDE.to_string(),
            query: "Do you want to override the soft failed policy check?".to_string(),
            description: description.into(),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfirmError {
    #[error("no answer provided for question {id}")]
    MissingAnswer { id: String },
    #[error("failed to read confirmation: {0}")]
    Io(String),
    #[error("input closed before an answer was given")]
    Closed,
}

#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait Confirmer: Send + Sync {
    async fn ask(&self, question: &Question) -> Result<Answer, ConfirmError>;
}

/// Pre-set answers keyed by question id
#[derive(Debug, Default)]
pub struct AnswerMap {
    answers: HashMap<String, String>,
    asked: Mutex<Vec<String>>,
}

impl AnswerMap {
    pub fn new(answers: HashMap<String, String>) -> Self {
        Self {
            answers,
            asked: Mutex::new(Vec::new()),
        }
    }

    pub fn with(mut self, id: &str, answer: &str) -> Self {
        self.answers.insert(id.to_string(), answer.to_string());
        self
    }

    /// Ids of every question asked so far, in order
    pub fn asked(&self) -> Vec<String> {
        self.asked.lock().map(|a| a.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl Confirmer for AnswerMap {
    async fn ask(&self, question: &Question) -> Result<Answer, ConfirmError> {
        if let Ok(mut asked) = self.asked.lock() {
            asked.push(question.id.clone());
        }
        self.answers
            .get(&question.id)
            .map(|a| Answer::parse(a))
            .ok_or_else(|| ConfirmError::MissingAnswer {
                id: question.id.clone(),
            })
    }
}

/// Prompts on stdout and reads one line from stdin
#[derive(Debug, Default, Clone, Copy)]
pub struct TerminalConfirmer;

#[async_trait]
impl Confirmer for TerminalConfirmer {
    async fn ask(&self, question: &Question) -> Result<Answer, ConfirmError> {
        let prompt = format!(
            "\n{}\n  {}\n  Only 'yes' will be accepted to approve.\n\n  Enter a value: ",
            question.query, question.description
        );
        let mut stdout = tokio::io::stdout();
        stdout
            .write_all(prompt.as_bytes())
            .await
            .map_err(|e| ConfirmError::Io(e.to_string()))?;
        stdout
            .flush()
            .await
            .map_err(|e| ConfirmError::Io(e.to_string()))?;

        let mut line = String::new();
        let read = BufReader::new(tokio::io::stdin())
            .read_line(&mut line)
            .await
            .map_err(|e| ConfirmError::Io(e.to_string()))?;
        if read == 0 {
            return Err(ConfirmError::Closed);
        }
        Ok(Answer::parse(&line))
    }
}

/// Approves every question without asking
#[derive(Debug, Default, Clone, Copy)]
pub struct AutoApprove;

#[async_trait]
impl Confirmer for AutoApprove {
    async fn ask(&self, _question: &Question) -> Result<Answer, ConfirmError> {
        Ok(Answer::Yes)
    }
}
