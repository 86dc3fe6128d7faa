//! Hourly trading volume from Bitquery
//!
//! Volumes are fetched per token URI and bucketed by hour, which is the
//! resolution the correlation job works at.

use async_trait::async_trait;
use chrono::{DateTime, DurationRound, Utc};
use reqwest::Client;
use serde::{Deserialize, Deserializer};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::db::{Database, VolumeSample};
use crate::error::{Error, Result};

const BITQUERY_ENDPOINT: &str = "https://streaming.bitquery.io/eap";

#[async_trait]
pub trait MarketDataSource: Send + Sync {
    async fn fetch_volumes(&self, token_uris: &[String], since: DateTime<Utc>) -> Result<Vec<VolumeSample>>;
}

const VOLUME_QUERY: &str = r#"
query ($uris: [String!], $since: DateTime) {
  Solana {
    DEXTradeByTokens(
      where: {
        Block: { Time: { since: $since } }
        Trade: { Currency: { Uri: { in: $uris } } }
        Transaction: { Result: { Success: true } }
      }
      orderBy: { ascending: Block_Time }
    ) {
      Block {
        Time(interval: { in: hours, count: 1 })
      }
      Trade {
        Currency {
          Uri
        }
        close: PriceInUSD(maximum: Block_Time)
      }
      volume: sum(of: Trade_Side_AmountInUSD)
    }
  }
}
"#;

pub struct BitqueryClient {
    client: Client,
    api_key: String,
    endpoint: String,
}

impl BitqueryClient {
    pub fn new(api_key: &str) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(60))
            .gzip(true)
            .build()?;

        Ok(Self {
            client,
            api_key: api_key.to_string(),
            endpoint: BITQUERY_ENDPOINT.to_string(),
        })
    }
}

#[async_trait]
impl MarketDataSource for BitqueryClient {
    async fn fetch_volumes(&self, token_uris: &[String], since: DateTime<Utc>) -> Result<Vec<VolumeSample>> {
        if token_uris.is_empty() {
            return Ok(Vec::new());
        }

        let body = serde_json::json!({
            "query": VOLUME_QUERY,
            "variables": { "uris": token_uris, "since": since.to_rfc3339() },
        });

        debug!("Requesting volumes for {} tokens since {}", token_uris.len(), since);
        let response = self
            .client
            .post(&self.endpoint)
            .header("X-API-KEY", &self.api_key)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(Error::Api { status: status.as_u16(), message });
        }

        parse_volume_response(&response.text().await?)
    }
}

#[derive(Debug, Deserialize)]
struct GraphQlResponse {
    data: Option<SolanaData>,
    #[serde(default)]
    errors: Vec<GraphQlError>,
}

#[derive(Debug, Deserialize)]
struct GraphQlError {
    message: String,
}

#[derive(Debug, Deserialize)]
struct SolanaData {
    #[serde(rename = "Solana")]
    solana: TradeBuckets,
}

#[derive(Debug, Deserialize)]
struct TradeBuckets {
    #[serde(rename = "DEXTradeByTokens", default)]
    rows: Vec<TradeBucket>,
}

#[derive(Debug, Deserialize)]
struct TradeBucket {
    #[serde(rename = "Block")]
    block: BlockTime,
    #[serde(rename = "Trade")]
    trade: TradeInfo,
    #[serde(default, deserialize_with = "lenient_f64")]
    volume: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct BlockTime {
    #[serde(rename = "Time")]
    time: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct TradeInfo {
    #[serde(rename = "Currency")]
    currency: CurrencyRef,
    #[serde(default, deserialize_with = "lenient_f64")]
    close: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct CurrencyRef {
    #[serde(rename = "Uri")]
    uri: String,
}

/// Bitquery returns aggregates as strings and prices as numbers
fn lenient_f64<'de, D>(deserializer: D) -> std::result::Result<Option<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum NumOrString {
        Num(f64),
        Str(String),
    }

    Ok(match Option::<NumOrString>::deserialize(deserializer)? {
        Some(NumOrString::Num(n)) => Some(n),
        Some(NumOrString::Str(s)) => s.trim().parse().ok(),
        None => None,
    })
}

fn parse_volume_response(body: &str) -> Result<Vec<VolumeSample>> {
    let response: GraphQlResponse = serde_json::from_str(body)?;

    if !response.errors.is_empty() {
        let message = response.errors.into_iter().map(|e| e.message).collect::<Vec<_>>().join("; ");
        return Err(Error::Api { status: 200, message });
    }

    let rows = response.data.map(|d| d.solana.rows).unwrap_or_default();
    let samples = rows
        .into_iter()
        .filter(|row| !row.trade.currency.uri.is_empty())
        .map(|row| VolumeSample {
            token_uri: row.trade.currency.uri,
            bucket_start: hour_bucket(row.block.time),
            volume_usd: row.volume.unwrap_or(0.0),
            price_usd: row.trade.close,
        })
        .collect();
    Ok(samples)
}

pub fn hour_bucket(t: DateTime<Utc>) -> DateTime<Utc> {
    t.duration_trunc(chrono::Duration::hours(1)).unwrap_or(t)
}

/// Fetch volumes for every known token URI since `since` and store them
pub async fn refresh_volumes<M: MarketDataSource + ?Sized>(
    source: &M,
    db: &Database,
    since: DateTime<Utc>,
) -> Result<usize> {
    let mut uris: Vec<String> = db
        .load_tokens()?
        .into_iter()
        .map(|t| t.uri)
        .filter(|u| !u.is_empty())
        .collect();
    uris.sort();
    uris.dedup();

    if uris.is_empty() {
        warn!("No token URIs to fetch volumes for");
        return Ok(0);
    }

    let samples = source.fetch_volumes(&uris, since).await?;
    let stored = db.upsert_volume_samples(&samples)?;
    info!("Stored {} hourly volume samples for {} tokens", stored, uris.len());
    Ok(stored)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::tests::test_db;

    const RESPONSE: &str = r#"{
      "data": {
        "Solana": {
          "DEXTradeByTokens": [
            {
              "Block": { "Time": "2026-10-18T12:00:00Z" },
              "Trade": { "Currency": { "Uri": "uri:bonk" }, "close": 0.000021 },
              "volume": "15234.5"
            },
            {
              "Block": { "Time": "2026-10-18T13:00:00Z" },
              "Trade": { "Currency": { "Uri": "uri:bonk" }, "close": null },
              "volume": 900
            }
          ]
        }
      }
    }"#;

    struct FixedMarket(Vec<VolumeSample>);

    #[async_trait]
    impl MarketDataSource for FixedMarket {
        async fn fetch_volumes(&self, _uris: &[String], _since: DateTime<Utc>) -> Result<Vec<VolumeSample>> {
            Ok(self.0.clone())
        }
    }

    #[test]
    fn test_parse_volume_response() {
        let samples = parse_volume_response(RESPONSE).unwrap();
        assert_eq!(samples.len(), 2);
        assert_eq!(samples[0].token_uri, "uri:bonk");
        assert_eq!(samples[0].volume_usd, 15234.5);
        assert_eq!(samples[0].price_usd, Some(0.000021));
        assert_eq!(samples[1].volume_usd, 900.0);
        assert_eq!(samples[1].price_usd, None);
    }

    #[test]
    fn test_graphql_errors_surface() {
        let err = parse_volume_response(r#"{"data":null,"errors":[{"message":"quota exceeded"}]}"#).unwrap_err();
        assert!(matches!(err, Error::Api { ref message, .. } if message == "quota exceeded"));
    }

    #[test]
    fn test_hour_bucket() {
        let t: DateTime<Utc> = "2026-10-18T12:34:56Z".parse().unwrap();
        assert_eq!(hour_bucket(t).to_rfc3339(), "2026-10-18T12:00:00+00:00");
    }

    #[tokio::test]
    async fn test_refresh_volumes_stores_samples() {
        let db = test_db();
        db.insert_token("BONK", "Bonk", "uri:bonk").unwrap();
        let samples = parse_volume_response(RESPONSE).unwrap();
        let since: DateTime<Utc> = "2026-10-18T00:00:00Z".parse().unwrap();

        let stored = refresh_volumes(&FixedMarket(samples.clone()), &db, since).await.unwrap();
        assert_eq!(stored, 2);
        // a second refresh overwrites the same buckets
        refresh_volumes(&FixedMarket(samples), &db, since).await.unwrap();
        assert_eq!(db.volume_series("uri:bonk", since).unwrap().len(), 2);
    }
}
