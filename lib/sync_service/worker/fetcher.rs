use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;

use crate::chain_client::ChainClient;

use super::super::types::{FetchBlockResponse, FetchError, GlobalRateLimiter};
use super::error_mapping::map_chain_error;

/// Fetches one block by height.
///
/// This trait exists so worker logic can be unit-tested against deterministic scripted failures
/// without requiring live network access.
pub trait BlockFetcher: Send + Sync {
    fn fetch_block<'a>(
        &'a self,
        height: i64,
    ) -> BoxFuture<'a, Result<FetchBlockResponse, FetchError>>;
}

impl<T> BlockFetcher for Arc<T>
where
    T: BlockFetcher + ?Sized,
{
    fn fetch_block<'a>(
        &'a self,
        height: i64,
    ) -> BoxFuture<'a, Result<FetchBlockResponse, FetchError>> {
        (**self).fetch_block(height)
    }
}

/// Reports the highest height the source currently offers.
pub trait TipProbe: Send + Sync {
    fn latest_height(&self) -> BoxFuture<'_, Result<i64, FetchError>>;
}

impl<T> TipProbe for Arc<T>
where
    T: TipProbe + ?Sized,
{
    fn latest_height(&self) -> BoxFuture<'_, Result<i64, FetchError>> {
        (**self).latest_height()
    }
}

/// HTTP-backed fetcher implementation used by production runtime.
pub struct HttpBlockFetcher {
    client: ChainClient,
    global_rate_limiter: GlobalRateLimiter,
}

impl HttpBlockFetcher {
    /// Builds a fetcher that shares a single global request budget with all ingest workers.
    ///
    /// The limiter is intentionally injected here (rather than around worker loops) so retries
    /// are also constrained by the same RPS budget.
    pub fn new(
        base_url: String,
        timeout: Duration,
        global_rate_limiter: GlobalRateLimiter,
    ) -> Result<Self, FetchError> {
        let client = ChainClient::new(base_url, timeout).map_err(map_chain_error)?;
        Ok(Self {
            client,
            global_rate_limiter,
        })
    }
}

impl TipProbe for HttpBlockFetcher {
    fn latest_height(&self) -> BoxFuture<'_, Result<i64, FetchError>> {
        Box::pin(async move {
            self.global_rate_limiter.until_ready().await;
            self.client
                .get_latest_height()
                .await
                .map_err(map_chain_error)
        })
    }
}

impl BlockFetcher for HttpBlockFetcher {
    fn fetch_block<'a>(
        &'a self,
        height: i64,
    ) -> BoxFuture<'a, Result<FetchBlockResponse, FetchError>> {
        Box::pin(async move {
            self.global_rate_limiter.until_ready().await;
            match self.client.get_block(height).await {
                Ok(Some(block)) => Ok(FetchBlockResponse::Found(block)),
                Ok(None) => Ok(FetchBlockResponse::NotYetAvailable),
                Err(err) => Err(map_chain_error(err)),
            }
        })
    }
}
