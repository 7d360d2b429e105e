//! Classification rules: raw category + payload → injection mode and owner.
//!
//! Pure and non-suspending; the sync engine calls [`classify`] once per row
//! and caches the result on the reference row.

use crate::models::{CategoryType, InjectionMode};
use crate::payload::ContextPayloadV1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Classification {
    pub mode: InjectionMode,
    pub owner_id: Option<i64>,
}

impl Classification {
    /// The mode as stored on a reference row: `Unknown` becomes `None`.
    pub fn stored_mode(&self) -> Option<InjectionMode> {
        match self.mode {
            InjectionMode::Unknown => None,
            mode => Some(mode),
        }
    }
}

pub fn classify(category: CategoryType, payload: &ContextPayloadV1) -> Classification {
    match category {
        CategoryType::SelectedDocuments => Classification {
            mode: InjectionMode::SelectedDocuments,
            owner_id: payload.knowledge_base_id,
        },
        CategoryType::KnowledgeBase => {
            let mode = payload
                .rag_result
                .as_ref()
                .and_then(|r| r.injection_mode.as_deref())
                .map(mode_from_payload)
                .unwrap_or(InjectionMode::Unknown);
            Classification {
                mode,
                owner_id: payload.knowledge_id,
            }
        }
    }
}

fn mode_from_payload(raw: &str) -> InjectionMode {
    match raw {
        "rag_retrieval" => InjectionMode::RagRetrieval,
        "direct_injection" => InjectionMode::DirectInjection,
        _ => InjectionMode::Unknown,
    }
}
