//! Cross-tenant module transfer planning
//!
//! Planning is pure: given the selected source modules, the target tenant's
//! current modules and an action, it decides which target rows to delete and
//! which copies to insert. The repository applies the plan inside a single
//! transaction.

use crate::db::models::{SavedModule, VisualizationType};
use crate::errors::{AppError, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::fmt;
use validator::Validate;

/// How duplicates in the target are handled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferAction {
    Check,
    Replace,
    Ignore,
    Cancel,
}

impl TransferAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransferAction::Check => "check",
            TransferAction::Replace => "replace",
            TransferAction::Ignore => "ignore",
            TransferAction::Cancel => "cancel",
        }
    }
}

impl fmt::Display for TransferAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct TransferRequest {
    #[serde(default)]
    #[validate(length(min = 1, message = "sourceTenantId is required"))]
    pub source_tenant_id: String,

    #[serde(default)]
    #[validate(length(min = 1, message = "targetTenantId is required"))]
    pub target_tenant_id: String,

    #[serde(default)]
    #[validate(length(min = 1, message = "at least one module id is required"))]
    pub module_ids: Vec<i64>,

    pub action: TransferAction,
}

impl TransferRequest {
    /// Shape checks; nothing here touches storage
    pub fn check(&self) -> Result<()> {
        self.validate()?;
        if self.source_tenant_id.trim().is_empty() {
            return Err(AppError::validation("sourceTenantId", "sourceTenantId is required"));
        }
        if self.target_tenant_id.trim().is_empty() {
            return Err(AppError::validation("targetTenantId", "targetTenantId is required"));
        }
        if self.source_tenant_id.trim() == self.target_tenant_id.trim() {
            return Err(AppError::validation(
                "targetTenantId",
                "Source and target tenant must differ",
            ));
        }
        Ok(())
    }

    /// Requested ids, deduplicated, in request order
    pub fn unique_module_ids(&self) -> Vec<i64> {
        let mut seen = HashSet::new();
        self.module_ids
            .iter()
            .copied()
            .filter(|id| seen.insert(*id))
            .collect()
    }
}

/// Duplicate key: SHA-256 over title and SQL text, NUL separated
pub fn fingerprint(title: &str, sql_text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(title.as_bytes());
    hasher.update([0u8]);
    hasher.update(sql_text.as_bytes());
    hex::encode(hasher.finalize())
}

fn module_fingerprint(module: &SavedModule) -> String {
    fingerprint(&module.title, &module.sql_text)
}

/// A source module that already exists in the target
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DuplicateModule {
    pub id: i64,
    pub title: String,
}

/// Content carried over to the target tenant
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleCopy {
    pub source_id: i64,
    pub title: String,
    pub sql_text: String,
    pub visualization_type: VisualizationType,
}

impl From<&SavedModule> for ModuleCopy {
    fn from(module: &SavedModule) -> Self {
        Self {
            source_id: module.id,
            title: module.title.clone(),
            sql_text: module.sql_text.clone(),
            visualization_type: module.visualization(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferOutcome {
    /// `check` found duplicates; nothing was written
    Duplicates(Vec<DuplicateModule>),
    Completed {
        copied: usize,
        replaced: usize,
        skipped: usize,
    },
    Cancelled,
}

impl TransferOutcome {
    pub fn message(&self) -> String {
        match self {
            TransferOutcome::Duplicates(d) => {
                format!("{} module(s) already exist in the target tenant", d.len())
            }
            TransferOutcome::Completed { copied, replaced, skipped } => format!(
                "{} module(s) transferred ({} replaced, {} skipped)",
                copied, replaced, skipped
            ),
            TransferOutcome::Cancelled => "Transfer cancelled".to_string(),
        }
    }
}

/// Wire shape of a transfer result
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferResponse {
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duplicates: Option<Vec<DuplicateModule>>,
}

impl From<TransferOutcome> for TransferResponse {
    fn from(outcome: TransferOutcome) -> Self {
        let message = outcome.message();
        match outcome {
            TransferOutcome::Duplicates(duplicates) => Self {
                success: false,
                message,
                duplicates: Some(duplicates),
            },
            _ => Self {
                success: true,
                message,
                duplicates: None,
            },
        }
    }
}

/// Writes a transfer will perform
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferPlan {
    /// Target module ids removed before copying
    pub deletes: Vec<i64>,
    pub copies: Vec<ModuleCopy>,
    pub outcome: TransferOutcome,
}

impl TransferPlan {
    fn nothing(outcome: TransferOutcome) -> Self {
        Self {
            deletes: Vec::new(),
            copies: Vec::new(),
            outcome,
        }
    }

    pub fn has_writes(&self) -> bool {
        !self.deletes.is_empty() || !self.copies.is_empty()
    }
}

/// Decide deletes and inserts for one transfer
pub fn plan_transfer(
    action: TransferAction,
    source: &[SavedModule],
    target: &[SavedModule],
) -> TransferPlan {
    if action == TransferAction::Cancel {
        return TransferPlan::nothing(TransferOutcome::Cancelled);
    }

    let mut target_index: HashMap<String, Vec<i64>> = HashMap::new();
    for module in target {
        target_index
            .entry(module_fingerprint(module))
            .or_default()
            .push(module.id);
    }

    let (duplicates, fresh): (Vec<&SavedModule>, Vec<&SavedModule>) = source
        .iter()
        .partition(|m| target_index.contains_key(&module_fingerprint(m)));

    match action {
        TransferAction::Check if !duplicates.is_empty() => TransferPlan::nothing(
            TransferOutcome::Duplicates(
                duplicates
                    .iter()
                    .map(|m| DuplicateModule {
                        id: m.id,
                        title: m.title.clone(),
                    })
                    .collect(),
            ),
        ),
        TransferAction::Check => TransferPlan {
            deletes: Vec::new(),
            copies: source.iter().map(ModuleCopy::from).collect(),
            outcome: TransferOutcome::Completed {
                copied: source.len(),
                replaced: 0,
                skipped: 0,
            },
        },
        TransferAction::Replace => {
            let mut deletes: Vec<i64> = duplicates
                .iter()
                .filter_map(|m| target_index.get(&module_fingerprint(m)))
                .flatten()
                .copied()
                .collect();
            deletes.sort_unstable();
            deletes.dedup();

            TransferPlan {
                copies: source.iter().map(ModuleCopy::from).collect(),
                outcome: TransferOutcome::Completed {
                    copied: source.len(),
                    replaced: deletes.len(),
                    skipped: 0,
                },
                deletes,
            }
        }
        TransferAction::Ignore => TransferPlan {
            deletes: Vec::new(),
            copies: fresh.into_iter().map(ModuleCopy::from).collect(),
            outcome: TransferOutcome::Completed {
                copied: source.len() - duplicates.len(),
                replaced: 0,
                skipped: duplicates.len(),
            },
        },
        TransferAction::Cancel => TransferPlan::nothing(TransferOutcome::Cancelled),
    }
}
