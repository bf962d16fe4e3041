//! Inventory listing as a lazy stream over paginated responses

use crate::credentials::CredentialCoordinator;
use crate::retry::call_with_retry;
use futures::stream::{self, Stream, TryStreamExt};
use std::collections::HashSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use vaultshift_types::{BackupClient, Error, Item, Result, RetryConfig};

enum Cursor {
    Start,
    Next(String),
    Done,
}

/// Every recovery point of `vault`, fetched one page at a time
///
/// Pages are requested only as the stream is consumed. Each page request goes
/// through the credential guard and the transient retry policy.
pub fn recovery_points<'a>(
    client: &'a dyn BackupClient,
    credentials: &'a CredentialCoordinator,
    policy: &'a RetryConfig,
    cancel: &'a CancellationToken,
    vault: &'a str,
) -> impl Stream<Item = Result<Item>> + 'a {
    stream::try_unfold(Cursor::Start, move |cursor| async move {
        let token = match cursor {
            Cursor::Start => None,
            Cursor::Next(token) => Some(token),
            Cursor::Done => return Ok::<_, Error>(None),
        };
        let page = call_with_retry(credentials, policy, cancel, "list_recovery_points", || {
            client.list_recovery_points(vault, token.clone())
        })
        .await?;

        debug!(vault, items = page.items.len(), more = page.next_token.is_some(), "Listed page");
        let next = page.next_token.map_or(Cursor::Done, Cursor::Next);
        Ok(Some((stream::iter(page.items.into_iter().map(Ok::<Item, Error>)), next)))
    })
    .try_flatten()
}

/// Drain an inventory stream, keeping the first occurrence of each identity
pub async fn collect_inventory<S>(items: S) -> Result<Vec<Item>>
where
    S: Stream<Item = Result<Item>>,
{
    futures::pin_mut!(items);
    let mut seen = HashSet::new();
    let mut inventory = Vec::new();
    let mut duplicates = 0usize;

    while let Some(item) = items.try_next().await? {
        if seen.insert(item.id.clone()) {
            inventory.push(item);
        } else {
            duplicates += 1;
            warn!(item = %item.id, "Duplicate recovery point in listing ignored");
        }
    }

    info!(items = inventory.len(), duplicates, "Inventory collected");
    Ok(inventory)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::CredentialSettings;
    use crate::simulator::{SimulatedBackupService, SimulatorSettings};
    use futures::StreamExt;
    use std::sync::Arc;

    fn service(items: usize, page_size: usize) -> Arc<SimulatedBackupService> {
        let inventory = (0..items)
            .map(|i| Item::new(format!("arn:rp:{i}"), format!("arn:vol:{i}")))
            .collect();
        Arc::new(SimulatedBackupService::with_settings(
            inventory,
            SimulatorSettings {
                page_size,
                ..SimulatorSettings::default()
            },
        ))
    }

    fn coordinator(service: &Arc<SimulatedBackupService>) -> CredentialCoordinator {
        CredentialCoordinator::new(
            service.clone(),
            service.clone(),
            CredentialSettings::default(),
            CancellationToken::new(),
        )
    }

    #[tokio::test]
    async fn test_follows_page_tokens() {
        let service = service(2500, 1000);
        let credentials = coordinator(&service);
        let policy = RetryConfig::default();
        let cancel = CancellationToken::new();

        let items = collect_inventory(recovery_points(
            service.as_ref(),
            &credentials,
            &policy,
            &cancel,
            "prod",
        ))
        .await
        .unwrap();

        assert_eq!(items.len(), 2500);
        assert_eq!(items[2499].vault_name, "prod");
        assert_eq!(service.remote_calls(), 3);
    }

    #[tokio::test]
    async fn test_stream_is_lazy() {
        let service = service(30, 10);
        let credentials = coordinator(&service);
        let policy = RetryConfig::default();
        let cancel = CancellationToken::new();

        let first: Vec<_> = recovery_points(service.as_ref(), &credentials, &policy, &cancel, "prod")
            .take(5)
            .collect()
            .await;

        assert_eq!(first.len(), 5);
        assert_eq!(service.remote_calls(), 1);
    }

    #[tokio::test]
    async fn test_duplicates_are_dropped() {
        let mut items: Vec<Result<Item>> = vec![
            Ok(Item::new("arn:rp:1", "arn:vol:1")),
            Ok(Item::new("arn:rp:2", "arn:vol:2")),
        ];
        items.push(Ok(Item::new("arn:rp:1", "arn:vol:1")));

        let inventory = collect_inventory(stream::iter(items)).await.unwrap();
        assert_eq!(inventory.len(), 2);
    }

    #[tokio::test]
    async fn test_auth_expiry_during_listing_is_recovered() {
        let service = service(20, 5);
        let credentials = coordinator(&service);
        let policy = RetryConfig::default();
        let cancel = CancellationToken::new();
        service.fail_next_calls_with_auth(1);

        let items = collect_inventory(recovery_points(
            service.as_ref(),
            &credentials,
            &policy,
            &cancel,
            "prod",
        ))
        .await
        .unwrap();

        assert_eq!(items.len(), 20);
        assert_eq!(credentials.stats().pauses, 1);
    }
}
