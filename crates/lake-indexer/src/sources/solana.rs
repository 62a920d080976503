//! Solana JSON-RPC transport.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value as Json, json};

use super::{ClusterNode, EpochInfo, SolanaRpc, VoteAccount};
use crate::error::{Error, Result};

const SOURCE: &str = "solana-rpc";

/// Connection settings for [`SolanaJsonRpc`].
#[derive(Debug, Clone)]
pub struct SolanaRpcConfig {
    /// RPC endpoint URL.
    pub url: String,
    /// Per-request timeout.
    pub request_timeout: Duration,
    /// Commitment level sent with every request.
    pub commitment: String,
}

impl SolanaRpcConfig {
    /// Settings for `url` with a 30 second timeout and `finalized` commitment.
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            request_timeout: Duration::from_secs(30),
            commitment: "finalized".to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct RpcResponse<T> {
    result: Option<T>,
    error: Option<RpcError>,
}

#[derive(Debug, Deserialize)]
struct RpcError {
    code: i64,
    message: String,
}

#[derive(Debug, Deserialize)]
struct VoteAccounts {
    current: Vec<VoteAccount>,
    delinquent: Vec<VoteAccount>,
}

/// [`SolanaRpc`] over HTTP JSON-RPC.
#[derive(Debug, Clone)]
pub struct SolanaJsonRpc {
    client: reqwest::Client,
    config: SolanaRpcConfig,
}

impl SolanaJsonRpc {
    /// Creates a client.
    ///
    /// # Errors
    ///
    /// Returns a configuration error for an empty URL or if the HTTP client
    /// cannot be built.
    pub fn new(config: SolanaRpcConfig) -> Result<Self> {
        if config.url.trim().is_empty() {
            return Err(Error::configuration("solana rpc url must not be empty"));
        }
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| Error::configuration(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { client, config })
    }

    async fn call<T: DeserializeOwned>(&self, method: &str, params: Json) -> Result<T> {
        let body = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": method,
            "params": params,
        });
        let response = self
            .client
            .post(&self.config.url)
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::upstream(SOURCE, format!("{method}: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(Error::upstream(SOURCE, format!("{method}: HTTP {status}: {text}")));
        }

        let parsed: RpcResponse<T> = response
            .json()
            .await
            .map_err(|e| Error::upstream(SOURCE, format!("{method}: invalid response: {e}")))?;
        if let Some(err) = parsed.error {
            return Err(Error::upstream(
                SOURCE,
                format!("{method}: rpc error {}: {}", err.code, err.message),
            ));
        }
        parsed
            .result
            .ok_or_else(|| Error::upstream(SOURCE, format!("{method}: response has no result")))
    }

    fn commitment(&self) -> Json {
        json!({ "commitment": self.config.commitment })
    }
}

#[async_trait]
impl SolanaRpc for SolanaJsonRpc {
    async fn epoch_info(&self) -> Result<EpochInfo> {
        self.call("getEpochInfo", json!([self.commitment()])).await
    }

    async fn cluster_nodes(&self) -> Result<Vec<ClusterNode>> {
        self.call("getClusterNodes", json!([])).await
    }

    async fn vote_accounts(&self) -> Result<Vec<VoteAccount>> {
        let accounts: VoteAccounts = self.call("getVoteAccounts", json!([self.commitment()])).await?;
        let delinquent = accounts.delinquent.into_iter().map(|mut a| {
            a.delinquent = true;
            a
        });
        Ok(accounts.current.into_iter().chain(delinquent).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::routing::post;
    use axum::{Json as AxumJson, Router};

    async fn rpc(AxumJson(request): AxumJson<Json>) -> AxumJson<Json> {
        let result = match request["method"].as_str() {
            Some("getEpochInfo") => json!({
                "epoch": 600,
                "slotIndex": 10,
                "slotsInEpoch": 432_000,
                "absoluteSlot": 259_200_010,
                "blockHeight": 1,
            }),
            Some("getClusterNodes") => json!([
                {"pubkey": "A", "gossip": "10.0.0.1:8001", "tpu": null, "rpc": null,
                 "version": "2.0.1", "shredVersion": 50093, "featureSet": 1},
            ]),
            Some("getVoteAccounts") => json!({
                "current": [{
                    "votePubkey": "V1", "nodePubkey": "A", "activatedStake": 5,
                    "commission": 7, "lastVote": 100, "rootSlot": 68,
                    "epochCredits": [[599, 1000, 0], [600, 1500, 1000]],
                    "epochVoteAccount": true,
                }],
                "delinquent": [{
                    "votePubkey": "V2", "nodePubkey": "B", "activatedStake": 1,
                    "commission": 100, "lastVote": 1, "rootSlot": 0,
                    "epochCredits": [], "epochVoteAccount": true,
                }],
            }),
            _ => {
                return AxumJson(json!({
                    "jsonrpc": "2.0", "id": 1,
                    "error": {"code": -32601, "message": "Method not found"},
                }));
            }
        };
        AxumJson(json!({"jsonrpc": "2.0", "id": 1, "result": result}))
    }

    async fn serve() -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = Router::new().route("/", post(rpc));
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}/")
    }

    #[tokio::test]
    async fn decodes_rpc_results() {
        let client = SolanaJsonRpc::new(SolanaRpcConfig::new(serve().await)).unwrap();

        let info = client.epoch_info().await.unwrap();
        assert_eq!(info.epoch, 600);
        assert_eq!(info.slots_in_epoch, 432_000);

        let nodes = client.cluster_nodes().await.unwrap();
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].shred_version, Some(50093));

        let votes = client.vote_accounts().await.unwrap();
        assert_eq!(votes.len(), 2);
        assert!(!votes[0].delinquent);
        assert!(votes[1].delinquent);
        assert_eq!(votes[0].credits_in(600), Some(500));
    }

    #[test]
    fn empty_url_is_rejected() {
        assert!(matches!(
            SolanaJsonRpc::new(SolanaRpcConfig::new(" ")),
            Err(Error::Configuration { .. })
        ));
    }

    #[tokio::test]
    async fn unreachable_endpoint_is_a_source_error() {
        let mut config = SolanaRpcConfig::new("http://127.0.0.1:1/");
        config.request_timeout = Duration::from_secs(2);
        let client = SolanaJsonRpc::new(config).unwrap();
        assert!(matches!(client.epoch_info().await, Err(Error::Source { .. })));
    }
}
