//! Core data types shared by the sync and evaluation paths.
//!
//! Enum values are stored as their `as_str()` text in SQLite and parsed back
//! with `FromStr`; an unrecognized stored value is an error rather than a
//! silent default.

use anyhow::{anyhow, Error};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::diagnostics::Diagnostics;
use crate::reconcile::CrossValidation;
use crate::scorer::MetricMap;

macro_rules! text_enum {
    ($name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text,)+
                }
            }
        }

        impl FromStr for $name {
            type Err = Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok(Self::$variant),)+
                    other => Err(anyhow!("invalid {} value: '{}'", stringify!($name), other)),
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.pad(self.as_str())
            }
        }
    };
}

/// Which kind of context a raw row carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CategoryType {
    KnowledgeBase,
    SelectedDocuments,
}

text_enum!(CategoryType {
    KnowledgeBase => "knowledge_base",
    SelectedDocuments => "selected_documents",
});

/// How retrieved or selected content reached the generation step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InjectionMode {
    RagRetrieval,
    DirectInjection,
    SelectedDocuments,
    Unknown,
}

text_enum!(InjectionMode {
    RagRetrieval => "rag_retrieval",
    DirectInjection => "direct_injection",
    SelectedDocuments => "selected_documents",
    Unknown => "unknown",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvaluationStatus {
    Pending,
    Completed,
    Failed,
    Skipped,
}

text_enum!(EvaluationStatus {
    Pending => "pending",
    Completed => "completed",
    Failed => "failed",
    Skipped => "skipped",
});

/// Local mirror of one raw source row. One per `source_id`, never deleted.
#[derive(Debug, Clone)]
pub struct ReferenceRow {
    pub id: i64,
    pub source_id: i64,
    pub owner_id: Option<i64>,
    pub actor_id: Option<i64>,
    pub category: CategoryType,
    /// `None` when the payload carried no recognizable mode.
    pub injection_mode: Option<InjectionMode>,
    pub evaluation_status: EvaluationStatus,
    pub evaluation_result_id: Option<i64>,
    pub record_date: Option<NaiveDate>,
    pub evaluated_at: Option<i64>,
    pub created_at: i64,
}

/// Per-mode counts shared by every counter table.
///
/// `Unknown` is not counted, so `total()` is always the sum of the three
/// tracked modes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ModeCounts {
    pub rag_retrieval: i64,
    pub direct_injection: i64,
    pub selected_documents: i64,
}

impl ModeCounts {
    pub fn record(&mut self, mode: InjectionMode) {
        match mode {
            InjectionMode::RagRetrieval => self.rag_retrieval += 1,
            InjectionMode::DirectInjection => self.direct_injection += 1,
            InjectionMode::SelectedDocuments => self.selected_documents += 1,
            InjectionMode::Unknown => {}
        }
    }

    pub fn total(&self) -> i64 {
        self.rag_retrieval + self.direct_injection + self.selected_documents
    }

    pub fn is_empty(&self) -> bool {
        self.total() == 0
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DailyCounter {
    pub date: NaiveDate,
    pub total: i64,
    pub counts: ModeCounts,
    pub active_owners: i64,
    pub active_actors: i64,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HourlyCounter {
    pub date: NaiveDate,
    pub hour: u32,
    pub total: i64,
    pub counts: ModeCounts,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OwnerDailyCounter {
    pub date: NaiveDate,
    pub owner_id: i64,
    pub display_name: Option<String>,
    pub namespace: Option<String>,
    pub total: i64,
    pub counts: ModeCounts,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointStatus {
    Success,
    Failed,
}

text_enum!(CheckpointStatus {
    Success => "success",
    Failed => "failed",
});

/// Durable watermark for one sync channel.
#[derive(Debug, Clone, Serialize)]
pub struct SyncCheckpoint {
    pub channel: String,
    pub last_cursor: i64,
    pub last_run_at: Option<i64>,
    pub last_status: Option<CheckpointStatus>,
    pub last_error: Option<String>,
    pub rows_processed: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Judgment {
    Pass,
    Fail,
    Undetermined,
}

text_enum!(Judgment {
    Pass => "pass",
    Fail => "fail",
    Undetermined => "undetermined",
});

/// Persisted outcome of scoring one reference row.
#[derive(Debug, Clone)]
pub struct EvaluationResult {
    pub id: i64,
    pub reference_row_id: i64,
    /// Scorer name → metric name → value. `None` marks a failed scorer or a
    /// non-finite value.
    pub scorer_metrics: BTreeMap<String, MetricMap>,
    pub scorer_errors: BTreeMap<String, String>,
    pub retrieval_score: Option<f64>,
    pub generation_score: Option<f64>,
    pub total_score: Option<f64>,
    pub judgment: Judgment,
    pub cross_validation: CrossValidation,
    pub has_alert: bool,
    pub diagnostics: Diagnostics,
    pub model: String,
    pub duration_ms: i64,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Started,
    Running,
    Completed,
    Failed,
}

text_enum!(JobStatus {
    Started => "started",
    Running => "running",
    Completed => "completed",
    Failed => "failed",
});

/// Optional narrowing applied on top of the `rag_retrieval` filter.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Selection {
    pub owner_id: Option<i64>,
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
}

/// Ledger entry for one evaluation run.
#[derive(Debug, Clone, Serialize)]
pub struct EvaluationJob {
    pub job_id: String,
    pub status: JobStatus,
    pub total: i64,
    pub completed: i64,
    pub failed: i64,
    pub skipped: i64,
    pub row_ids: Vec<i64>,
    pub selection: Selection,
    pub force: bool,
    pub created_at: i64,
    pub updated_at: i64,
}

impl EvaluationJob {
    pub fn processed(&self) -> i64 {
        self.completed + self.failed + self.skipped
    }
}

/// Format a date the way every table stores it.
pub fn date_key(date: NaiveDate) -> String {
    date.format("%Y-%m-%d").to_string()
}

pub fn parse_date_key(s: &str) -> anyhow::Result<NaiveDate> {
    Ok(NaiveDate::parse_from_str(s, "%Y-%m-%d")?)
}
