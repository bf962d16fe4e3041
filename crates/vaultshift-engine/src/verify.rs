//! Post-migration comparison of source and destination vaults
//!
//! Copies receive new recovery point identities in the destination, so the
//! two listings are matched on the resource each recovery point backs up.

use crate::credentials::CredentialCoordinator;
use crate::inventory::{collect_inventory, recovery_points};
use serde::Serialize;
use std::collections::BTreeSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use vaultshift_types::{BackupClient, Item, Result, RetryConfig};

/// How completely a destination vault mirrors its source
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VerificationResult {
    /// Vault that was copied from
    pub source_vault: String,
    /// Vault that was copied into
    pub dest_vault: String,
    /// Recovery points listed in the source
    pub source_count: usize,
    /// Recovery points listed in the destination
    pub dest_count: usize,
    /// Source resources present in the destination
    pub matched_count: usize,
    /// Source resources absent from the destination
    pub missing_count: usize,
    /// Destination resources with no source counterpart
    pub extra_count: usize,
    /// Resource ARNs absent from the destination, sorted
    pub missing: Vec<String>,
}

impl VerificationResult {
    /// Compare two listings by resource ARN
    pub fn compare(
        source_vault: impl Into<String>,
        dest_vault: impl Into<String>,
        source: &[Item],
        dest: &[Item],
    ) -> Self {
        let source_arns: BTreeSet<&str> = source.iter().map(|i| i.resource_arn.as_str()).collect();
        let dest_arns: BTreeSet<&str> = dest.iter().map(|i| i.resource_arn.as_str()).collect();

        let missing: Vec<String> = source_arns
            .difference(&dest_arns)
            .map(|arn| (*arn).to_string())
            .collect();

        Self {
            source_vault: source_vault.into(),
            dest_vault: dest_vault.into(),
            source_count: source.len(),
            dest_count: dest.len(),
            matched_count: source_arns.intersection(&dest_arns).count(),
            missing_count: missing.len(),
            extra_count: dest_arns.difference(&source_arns).count(),
            missing,
        }
    }

    /// Every source resource has a copy in the destination
    pub fn is_complete(&self) -> bool {
        self.missing_count == 0
    }
}

/// List both vaults and compare them
pub async fn verify_copies(
    client: &dyn BackupClient,
    credentials: &CredentialCoordinator,
    policy: &RetryConfig,
    cancel: &CancellationToken,
    source_vault: &str,
    dest_vault: &str,
) -> Result<VerificationResult> {
    let source =
        collect_inventory(recovery_points(client, credentials, policy, cancel, source_vault)).await?;
    let dest =
        collect_inventory(recovery_points(client, credentials, policy, cancel, dest_vault)).await?;

    let result = VerificationResult::compare(source_vault, dest_vault, &source, &dest);
    if result.is_complete() {
        info!(
            source_vault,
            dest_vault,
            matched = result.matched_count,
            extra = result.extra_count,
            "Verification complete"
        );
    } else {
        warn!(
            source_vault,
            dest_vault,
            matched = result.matched_count,
            missing = result.missing_count,
            "Destination is missing recovery points"
        );
    }
    Ok(result)
}
