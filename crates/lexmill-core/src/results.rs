//! Structured provider results, one variant per job type.
//!
//! Each variant mirrors the strict JSON schema requested from the provider
//! for that job type. Parsing picks the variant from the job's type, never
//! from the payload itself.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::models::JobType;

/// Parsed result of one work item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "job_type", content = "result", rename_all = "snake_case")]
pub enum JobResult {
    Flag(FlagResult),
    Edit(EditResult),
    Reallocate(ReallocateResult),
    Allocate(AllocateResult),
    Split(SplitResult),
    Review(ReviewResult),
}

impl JobResult {
    /// Parse raw provider output as the result schema of `job_type`.
    ///
    /// Surrounding whitespace and a Markdown code fence are tolerated.
    pub fn parse(job_type: JobType, raw: &str) -> Result<Self> {
        let body = strip_code_fence(raw);
        let parsed = match job_type {
            JobType::Flag => JobResult::Flag(serde_json::from_str(body)?),
            JobType::Edit => JobResult::Edit(serde_json::from_str(body)?),
            JobType::Reallocate => JobResult::Reallocate(serde_json::from_str(body)?),
            JobType::Allocate => JobResult::Allocate(serde_json::from_str(body)?),
            JobType::Split => JobResult::Split(serde_json::from_str(body)?),
            JobType::Review => JobResult::Review(serde_json::from_str(body)?),
        };
        parsed.validate()?;
        Ok(parsed)
    }

    pub fn job_type(&self) -> JobType {
        match self {
            JobResult::Flag(_) => JobType::Flag,
            JobResult::Edit(_) => JobType::Edit,
            JobResult::Reallocate(_) => JobType::Reallocate,
            JobResult::Allocate(_) => JobType::Allocate,
            JobResult::Split(_) => JobType::Split,
            JobResult::Review(_) => JobType::Review,
        }
    }

    pub fn confidence(&self) -> Option<f64> {
        match self {
            JobResult::Flag(r) => Some(r.confidence),
            JobResult::Edit(r) => Some(r.confidence),
            JobResult::Reallocate(r) => Some(r.confidence),
            JobResult::Allocate(r) => Some(r.confidence),
            JobResult::Split(r) => r.confidence,
            JobResult::Review(r) => Some(r.confidence),
        }
    }

    /// Free-text reasoning that accompanies the result, if any.
    pub fn notes(&self) -> Option<&str> {
        let notes = match self {
            JobResult::Flag(r) => r.notes.as_deref(),
            JobResult::Edit(r) => r.notes.as_deref(),
            JobResult::Reallocate(r) => r.notes.as_deref(),
            JobResult::Allocate(r) => r.notes.as_deref(),
            JobResult::Split(r) => r.summary.as_deref(),
            JobResult::Review(r) => r.notes.as_deref(),
        };
        notes.map(str::trim).filter(|n| !n.is_empty())
    }

    /// True when the result flags its target.
    pub fn is_flagged(&self) -> bool {
        matches!(self, JobResult::Flag(r) if r.flagged)
    }

    fn validate(&self) -> Result<()> {
        if let Some(c) = self.confidence() {
            if !(0.0..=1.0).contains(&c) {
                return Err(Error::InvalidInput(format!(
                    "confidence {c} is outside [0, 1]"
                )));
            }
        }
        Ok(())
    }
}

fn strip_code_fence(raw: &str) -> &str {
    let trimmed = raw.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let rest = rest.strip_prefix("json").unwrap_or(rest);
    rest.strip_suffix("```").unwrap_or(rest).trim()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlagResult {
    pub flagged: bool,
    #[serde(default)]
    pub flagged_reason: Option<String>,
    pub confidence: f64,
    #[serde(default)]
    pub notes: Option<String>,
}

/// One proposed field value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldEdit {
    pub field: String,
    pub value: String,
}

/// A relation the model proposes between the target and another entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelationProposal {
    pub relation_type: String,
    pub target_code: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EditResult {
    #[serde(default)]
    pub edits: Vec<FieldEdit>,
    /// Frame the target should move to, if any.
    #[serde(default)]
    pub new_frame_code: Option<String>,
    #[serde(default)]
    pub relations: Vec<RelationProposal>,
    pub confidence: f64,
    #[serde(default)]
    pub notes: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntryMove {
    pub entry_code: String,
    pub target_frame_code: String,
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReallocateResult {
    #[serde(default)]
    pub moves: Vec<EntryMove>,
    pub confidence: f64,
    #[serde(default)]
    pub notes: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AllocateResult {
    #[serde(default)]
    pub recommended_frame_code: Option<String>,
    pub confidence: f64,
    #[serde(default)]
    pub notes: Option<String>,
}

/// Summary of a split performed by the provider through tool calls.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SplitResult {
    #[serde(default)]
    pub new_frames_created: u32,
    #[serde(default)]
    pub reallocations: u32,
    #[serde(default)]
    pub original_deleted: bool,
    #[serde(default)]
    pub summary: Option<String>,
    #[serde(default)]
    pub confidence: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewAction {
    Approve,
    Reject,
    Revise,
}

impl ReviewAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReviewAction::Approve => "approve",
            ReviewAction::Reject => "reject",
            ReviewAction::Revise => "revise",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewResult {
    pub action: ReviewAction,
    pub justification: String,
    pub confidence: f64,
    #[serde(default)]
    pub notes: Option<String>,
}
