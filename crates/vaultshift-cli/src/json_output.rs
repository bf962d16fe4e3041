//! JSON output structures for the vaultshift CLI

use anyhow::Result;
use serde::Serialize;
use std::collections::BTreeMap;
use vaultshift_engine::{
    PoolReport, RunOutcome, RunReport, RunState, SummaryReport, VerificationResult,
};

/// Complete JSON output of a copy run
#[derive(Debug, Serialize)]
pub struct RunResultJson {
    /// Operation metadata
    pub metadata: OperationMetadata,
    /// Final classification
    pub outcome: RunOutcome,
    /// Process exit code
    pub exit_code: i32,
    /// Pool activity
    pub pool: PoolReport,
    /// Credential activity
    pub credentials: CredentialStatsJson,
    /// Summary document
    pub summary: serde_json::Value,
}

/// Operation metadata
#[derive(Debug, Serialize)]
pub struct OperationMetadata {
    /// vaultshift version
    pub version: String,
    /// Operation type
    pub operation: String,
    /// Timestamp when the output was produced
    pub timestamp: String,
    /// Run identity
    pub run_id: String,
    /// State file of the run
    pub state_file: String,
    /// Whether an earlier run was continued
    pub resumed: bool,
}

/// Credential activity in JSON format
#[derive(Debug, Serialize)]
pub struct CredentialStatsJson {
    /// Times the pool was paused
    pub pauses: u64,
    /// Successful reloads
    pub reloads: u64,
    /// Failed reloads
    pub reload_failures: u64,
    /// Operator prompts raised
    pub prompts: u64,
}

impl RunResultJson {
    /// Build the output of a finished run
    pub fn from_report(report: &RunReport) -> Result<Self> {
        Ok(Self {
            metadata: OperationMetadata {
                version: env!("CARGO_PKG_VERSION").to_string(),
                operation: "copy".to_string(),
                timestamp: chrono::Utc::now().to_rfc3339(),
                run_id: report.run_id.to_string(),
                state_file: report.state_path.display().to_string(),
                resumed: report.resumed,
            },
            outcome: report.outcome,
            exit_code: report.outcome.exit_code(),
            pool: report.pool,
            credentials: CredentialStatsJson {
                pauses: report.credentials.pauses,
                reloads: report.credentials.reloads,
                reload_failures: report.credentials.reload_failures,
                prompts: report.credentials.prompts,
            },
            summary: summary_value(&report.summary)?,
        })
    }

    /// Pretty-printed JSON
    pub fn to_pretty(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// JSON output of the status command
#[derive(Debug, Serialize)]
pub struct StatusJson {
    /// Run identity
    pub run_id: String,
    /// Source account
    pub source_account: String,
    /// Source vault
    pub source_vault: String,
    /// Destination vault
    pub dest_vault: String,
    /// Task count per state
    pub states: BTreeMap<String, usize>,
    /// Summary document
    pub summary: serde_json::Value,
}

impl StatusJson {
    /// Build the status output of a loaded state
    pub fn new(state: &RunState, summary: &SummaryReport) -> Result<Self> {
        Ok(Self {
            run_id: state.run_id.to_string(),
            source_account: state.context.source_account.clone(),
            source_vault: state.context.source_vault.clone(),
            dest_vault: state.context.dest_vault.clone(),
            states: state
                .state_counts()
                .into_iter()
                .map(|(task_state, count)| (task_state.to_string(), count))
                .collect(),
            summary: summary_value(summary)?,
        })
    }

    /// Pretty-printed JSON
    pub fn to_pretty(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// JSON output of the verify command
#[derive(Debug, Serialize)]
pub struct VerifyJson<'a> {
    /// Whether every source resource has a copy
    pub complete: bool,
    /// Comparison counts
    #[serde(flatten)]
    pub result: &'a VerificationResult,
}

impl<'a> VerifyJson<'a> {
    /// Wrap a comparison result
    pub fn new(result: &'a VerificationResult) -> Self {
        Self {
            complete: result.is_complete(),
            result,
        }
    }

    /// Pretty-printed JSON
    pub fn to_pretty(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

fn summary_value(summary: &SummaryReport) -> Result<serde_json::Value> {
    Ok(serde_json::from_str(&summary.to_json()?)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use vaultshift_engine::{RunContext, TaskState};
    use vaultshift_types::Item;

    #[test]
    fn test_verify_json() {
        let source = [Item::new("arn:rp:1", "arn:vol:1"), Item::new("arn:rp:2", "arn:vol:2")];
        let dest = [Item::new("dr:arn:rp:1", "arn:vol:1")];
        let result = VerificationResult::compare("prod", "arn:vault:dr", &source, &dest);

        let value: serde_json::Value =
            serde_json::from_str(&VerifyJson::new(&result).to_pretty().unwrap()).unwrap();

        assert_eq!(value["complete"], false);
        assert_eq!(value["matched_count"], 1);
        assert_eq!(value["missing"][0], "arn:vol:2");
        assert_eq!(value["dest_vault"], "arn:vault:dr");
    }

    #[test]
    fn test_status_json() {
        let context = RunContext {
            source_account: "111111111111".to_string(),
            dest_account: "222222222222".to_string(),
            source_vault: "prod".to_string(),
            dest_vault: "arn:vault:dr".to_string(),
        };
        let state = RunState::new(
            context,
            vec![Item::new("arn:rp:1", "arn:vol:1"), Item::new("arn:rp:2", "arn:vol:2")],
        );
        let summary =
            SummaryReport::from_tasks(state.tasks.values(), state.created_at, state.updated_at);

        let json = StatusJson::new(&state, &summary).unwrap();
        assert_eq!(json.states[&TaskState::Pending.to_string()], 2);
        assert_eq!(json.summary["total_items"], 2);

        let text = json.to_pretty().unwrap();
        assert!(text.contains("\"source_vault\": \"prod\""));
    }
}
