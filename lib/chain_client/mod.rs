use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// One sub-record carried inside a block payload.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
pub struct BlockTransaction {
    pub tx_hash: String,
    #[serde(default)]
    pub payload: serde_json::Value,
}

/// One validated block record as fetched from the source.
///
/// Immutable once fetched; workers pass it by reference between fetch and
/// persistence so storage retries never trigger a re-fetch.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
pub struct BlockRecord {
    pub height: i64,
    pub hash: String,
    pub timestamp: i64,
    #[serde(default)]
    pub transactions: Vec<BlockTransaction>,
}

/// Raw wire shape before boundary validation.
///
/// All fields are optional here so a malformed payload becomes a typed
/// `ParseError` instead of a loosely-shaped value propagating inward.
#[derive(Deserialize, Debug)]
struct RawBlock {
    height: Option<i64>,
    hash: Option<String>,
    timestamp: Option<i64>,
    #[serde(default)]
    transactions: Vec<RawTransaction>,
}

#[derive(Deserialize, Debug)]
struct RawTransaction {
    tx_hash: Option<String>,
    #[serde(default)]
    payload: serde_json::Value,
}

#[derive(Deserialize, Debug)]
struct LatestHeight {
    height: i64,
}

#[derive(Error, Debug)]
pub enum ChainClientErr {
    #[error("connection error: {0}")]
    ConnectError(String),
    #[error("parse error: {0}")]
    ParseError(String),
    #[error("unexpected HTTP status while fetching {resource}: {status}")]
    UnexpectedStatus { resource: String, status: u16 },
    #[error(transparent)]
    RequestError(#[from] reqwest::Error),
}

/// HTTP client for the sequentially-keyed block source.
pub struct ChainClient {
    client: reqwest::Client,
    base_url: String,
}

impl ChainClient {
    pub fn new(base_url: String, timeout: Duration) -> Result<Self, ChainClientErr> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| ChainClientErr::ConnectError(format!("client build failed: {err}")))?;
        Ok(Self { client, base_url })
    }

    /// Fetches one block by height.
    ///
    /// `Ok(None)` means the height is beyond the source's current tip (HTTP 404
    /// or a JSON `null` body). That is a normal wait-and-poll signal, not an
    /// error, and must never be treated as a gap.
    pub async fn get_block(&self, height: i64) -> Result<Option<BlockRecord>, ChainClientErr> {
        let url = format!("{}/blocks/{}", self.base_url, height);
        let response = self.client.get(&url).send().await?;

        if response.status().as_u16() == 404 {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(ChainClientErr::UnexpectedStatus {
                resource: format!("block {height}"),
                status: response.status().as_u16(),
            });
        }

        let raw = response.json::<Option<RawBlock>>().await?;
        match raw {
            None => Ok(None),
            Some(raw) => validate_block(height, raw).map(Some),
        }
    }

    /// Returns the highest height the source currently offers.
    pub async fn get_latest_height(&self) -> Result<i64, ChainClientErr> {
        let url = format!("{}/blocks/latest", self.base_url);
        let response = self.client.get(&url).send().await?;
        if !response.status().is_success() {
            return Err(ChainClientErr::UnexpectedStatus {
                resource: "latest block".to_string(),
                status: response.status().as_u16(),
            });
        }

        let latest = response.json::<LatestHeight>().await?;
        Ok(latest.height)
    }

    /// Lightweight reachability probe used by the health endpoint.
    pub async fn check_health(&self) -> bool {
        self.get_latest_height().await.is_ok()
    }
}

fn validate_block(requested_height: i64, raw: RawBlock) -> Result<BlockRecord, ChainClientErr> {
    let height = raw.height.ok_or_else(|| {
        ChainClientErr::ParseError(format!(
            "block payload for height {requested_height} is missing `height`"
        ))
    })?;
    if height != requested_height {
        return Err(ChainClientErr::ParseError(format!(
            "block payload height mismatch: requested {requested_height}, got {height}"
        )));
    }
    if height < 0 {
        return Err(ChainClientErr::ParseError(format!(
            "block payload has negative height {height}"
        )));
    }

    let hash = match raw.hash {
        Some(hash) if !hash.trim().is_empty() => hash,
        _ => {
            return Err(ChainClientErr::ParseError(format!(
                "block payload for height {height} is missing `hash`"
            )))
        }
    };
    let timestamp = raw.timestamp.ok_or_else(|| {
        ChainClientErr::ParseError(format!(
            "block payload for height {height} is missing `timestamp`"
        ))
    })?;

    let mut transactions = Vec::with_capacity(raw.transactions.len());
    for (idx, tx) in raw.transactions.into_iter().enumerate() {
        let tx_hash = match tx.tx_hash {
            Some(tx_hash) if !tx_hash.trim().is_empty() => tx_hash,
            _ => {
                return Err(ChainClientErr::ParseError(format!(
                    "transaction {idx} in block {height} is missing `tx_hash`"
                )))
            }
        };
        transactions.push(BlockTransaction {
            tx_hash,
            payload: tx.payload,
        });
    }

    Ok(BlockRecord {
        height,
        hash,
        timestamp,
        transactions,
    })
}
