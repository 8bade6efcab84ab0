//! Parallel raw-transaction broadcast across public endpoints.
//!
//! The same signed transaction is posted to every configured endpoint at
//! once; the first accepted hash wins the race. Slower endpoints are left
//! to finish in the background so their round-trip times still feed the
//! per-endpoint EMA used to order the list on the next call.

use alloy::primitives::{keccak256, B256};
use anyhow::{anyhow, Result};
use serde_json::json;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// EMA smoothing factor for endpoint round-trip times.
const EMA_ALPHA: f64 = 0.3;

/// One public submission endpoint with its rolling RTT estimate.
pub struct RaceEndpoint {
    url: String,
    ema_rtt_us: AtomicU64,
}

impl RaceEndpoint {
    fn new(url: String) -> Self {
        Self {
            url,
            ema_rtt_us: AtomicU64::new(0),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn ema_rtt(&self) -> Duration {
        Duration::from_micros(self.ema_rtt_us.load(Ordering::Relaxed))
    }

    fn record_rtt(&self, rtt: Duration) {
        let sample = rtt.as_micros() as f64;
        let old = self.ema_rtt_us.load(Ordering::Relaxed) as f64;
        let new = if old == 0.0 {
            sample
        } else {
            EMA_ALPHA * sample + (1.0 - EMA_ALPHA) * old
        };
        self.ema_rtt_us.store(new as u64, Ordering::Relaxed);
    }
}

/// Result of a won race.
#[derive(Debug, Clone)]
pub struct RaceOutcome {
    pub tx_hash: B256,
    pub endpoint: String,
    pub rtt: Duration,
}

/// Broadcast racer over N public endpoints.
pub struct WriteRacer {
    client: reqwest::Client,
    endpoints: Vec<Arc<RaceEndpoint>>,
    race_timeout: Duration,
}

impl WriteRacer {
    pub fn new(urls: Vec<String>, race_timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoints: urls
                .into_iter()
                .map(|url| Arc::new(RaceEndpoint::new(url)))
                .collect(),
            race_timeout,
        }
    }

    pub fn endpoint_count(&self) -> usize {
        self.endpoints.len()
    }

    /// Endpoints ordered by ascending EMA RTT (never-measured first).
    pub fn ordered_endpoints(&self) -> Vec<Arc<RaceEndpoint>> {
        let mut ordered = self.endpoints.clone();
        ordered.sort_by_key(|e| e.ema_rtt_us.load(Ordering::Relaxed));
        ordered
    }

    /// Broadcast `raw` everywhere and return the first accepted hash.
    ///
    /// Losing posts keep running in the background for RTT bookkeeping but
    /// cannot change the returned value.
    pub async fn race(&self, raw: &[u8]) -> Result<RaceOutcome> {
        anyhow::ensure!(!self.endpoints.is_empty(), "no race endpoints configured");

        let payload = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": "eth_sendRawTransaction",
            "params": [format!("0x{}", hex::encode(raw))],
        });

        let (tx, mut rx) = mpsc::channel::<Result<RaceOutcome>>(self.endpoints.len());
        let started = Instant::now();

        for endpoint in self.ordered_endpoints() {
            let client = self.client.clone();
            let payload = payload.clone();
            let sender = tx.clone();
            tokio::spawn(async move {
                let result = post_raw_tx(&client, &endpoint, payload).await;
                match &result {
                    Ok(outcome) => {
                        metrics::increment_counter!("write_race_accepts_total");
                        debug!(
                            endpoint = %outcome.endpoint,
                            rtt_ms = outcome.rtt.as_millis() as u64,
                            "Endpoint accepted raw tx"
                        );
                    }
                    Err(e) => {
                        metrics::increment_counter!("write_race_rejects_total");
                        debug!(endpoint = %endpoint.url(), error = %e, "Endpoint rejected raw tx");
                    }
                }
                let _ = sender.send(result).await;
            });
        }
        drop(tx);

        let mut last_error = anyhow!("race window elapsed with no acceptance");
        let deadline = tokio::time::sleep(self.race_timeout);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                outcome = rx.recv() => match outcome {
                    Some(Ok(win)) => {
                        info!(
                            tx_hash = %win.tx_hash,
                            endpoint = %win.endpoint,
                            elapsed_ms = started.elapsed().as_millis() as u64,
                            "Write race won"
                        );
                        return Ok(win);
                    }
                    Some(Err(e)) => {
                        last_error = e;
                    }
                    None => return Err(last_error),
                },
                _ = &mut deadline => {
                    warn!(timeout_ms = self.race_timeout.as_millis() as u64, "Write race timed out");
                    return Err(last_error);
                }
            }
        }
    }
}

async fn post_raw_tx(
    client: &reqwest::Client,
    endpoint: &Arc<RaceEndpoint>,
    payload: serde_json::Value,
) -> Result<RaceOutcome> {
    let started = Instant::now();
    let response = client
        .post(endpoint.url())
        .json(&payload)
        .send()
        .await?
        .json::<serde_json::Value>()
        .await?;
    let rtt = started.elapsed();
    endpoint.record_rtt(rtt);

    if let Some(hash_text) = response.get("result").and_then(|v| v.as_str()) {
        let tx_hash: B256 = hash_text
            .parse()
            .map_err(|e| anyhow!("unparseable hash from {}: {e}", endpoint.url()))?;
        return Ok(RaceOutcome {
            tx_hash,
            endpoint: endpoint.url().to_string(),
            rtt,
        });
    }

    let message = response
        .get("error")
        .and_then(|e| e.get("message"))
        .and_then(|m| m.as_str())
        .unwrap_or("no result in response");
    Err(anyhow!("{}: {message}", endpoint.url()))
}

/// Transaction hash of raw signed bytes (keccak of the 2718 envelope).
pub fn raw_tx_hash(raw: &[u8]) -> B256 {
    keccak256(raw)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ema_updates() {
        let endpoint = RaceEndpoint::new("http://localhost:1".to_string());
        assert_eq!(endpoint.ema_rtt(), Duration::ZERO);

        endpoint.record_rtt(Duration::from_micros(1000));
        assert_eq!(endpoint.ema_rtt(), Duration::from_micros(1000));

        // 0.3 * 2000 + 0.7 * 1000 = 1300
        endpoint.record_rtt(Duration::from_micros(2000));
        assert_eq!(endpoint.ema_rtt(), Duration::from_micros(1300));
    }

    #[test]
    fn test_ordering_prefers_fast_endpoints() {
        let racer = WriteRacer::new(
            vec![
                "http://slow".to_string(),
                "http://fast".to_string(),
            ],
            Duration::from_millis(500),
        );
        racer.endpoints[0].record_rtt(Duration::from_micros(9000));
        racer.endpoints[1].record_rtt(Duration::from_micros(100));

        let ordered = racer.ordered_endpoints();
        assert_eq!(ordered[0].url(), "http://fast");
        assert_eq!(ordered[1].url(), "http://slow");
    }

    #[tokio::test]
    async fn test_race_with_no_endpoints_errors() {
        let racer = WriteRacer::new(vec![], Duration::from_millis(10));
        assert!(racer.race(&[0x01]).await.is_err());
    }

    #[test]
    fn test_raw_tx_hash_is_keccak() {
        let raw = vec![0x02, 0xf8, 0x6f];
        assert_eq!(raw_tx_hash(&raw), keccak256(&raw));
    }
}
