//! Wire types shared by the snapshot fetcher and the stream multiplexer.
//!
//! Price and quantity are kept as the exchange's literal strings all the way
//! through to `BookSide`; parsing to `f64` happens only for sort order, never
//! for equality or storage, so that `"0.10"` and `"0.1"` remain distinct
//! price levels exactly as the exchange intends.

use serde::Deserialize;

/// A `[price, quantity]` pair as delivered on the wire, both strings.
pub type PriceLevel = (String, String);

/// REST snapshot response: `GET /api/v3/depth` (spot) or `GET /fapi/v1/depth`
/// (linear futures).
#[derive(Debug, Clone, Deserialize)]
pub struct OrderBookSnapshot {
    #[serde(rename = "lastUpdateId")]
    pub last_update_id: u64,
    pub bids: Vec<PriceLevel>,
    pub asks: Vec<PriceLevel>,
}

/// One combined-stream envelope as delivered by the multiplexer:
/// `{"stream": "btcusdt@depth@100ms", "data": {...}}`.
#[derive(Debug, Clone, Deserialize)]
pub struct CombinedStreamEnvelope {
    pub stream: String,
    pub data: RawDiffEvent,
}

impl CombinedStreamEnvelope {
    /// The canonical (lowercased) market id, taken from the substring of
    /// `stream` before the first `@`.
    pub fn market(&self) -> String {
        self.stream
            .split('@')
            .next()
            .unwrap_or(&self.stream)
            .to_lowercase()
    }
}

/// The inner `data` object of a diff event. Spot uses `a`/`b`; linear
/// futures uses `asks`/`bids` (`pu` is also futures-only). Both field-name
/// variants are accepted via `alias`.
#[derive(Debug, Clone, Deserialize)]
pub struct RawDiffEvent {
    #[serde(rename = "U")]
    pub start_id: u64,
    #[serde(rename = "u")]
    pub end_id: u64,
    #[serde(rename = "pu")]
    pub prev_end_id: Option<u64>,
    #[serde(rename = "a", alias = "asks")]
    #[serde(default)]
    pub asks: Vec<PriceLevel>,
    #[serde(rename = "b", alias = "bids")]
    #[serde(default)]
    pub bids: Vec<PriceLevel>,
}

impl RawDiffEvent {
    /// Normalize into the internal representation the dispatcher consumes,
    /// independent of which field names the wire envelope used.
    pub fn to_payload(&self) -> DiffPayload {
        DiffPayload {
            start_id: self.start_id,
            end_id: self.end_id,
            prev_end_id: self.prev_end_id,
            asks: self.asks.clone(),
            bids: self.bids.clone(),
        }
    }
}

/// Normalized diff event, independent of wire field-naming differences
/// between spot and linear futures.
#[derive(Debug, Clone)]
pub struct DiffPayload {
    pub start_id: u64,
    pub end_id: u64,
    pub prev_end_id: Option<u64>,
    pub asks: Vec<PriceLevel>,
    pub bids: Vec<PriceLevel>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn market_is_lowercased_stream_prefix() {
        let env = CombinedStreamEnvelope {
            stream: "BTCUSDT@depth@100ms".to_string(),
            data: RawDiffEvent {
                start_id: 1,
                end_id: 2,
                prev_end_id: None,
                asks: vec![],
                bids: vec![],
            },
        };
        assert_eq!(env.market(), "btcusdt");
    }

    #[test]
    fn spot_field_names_deserialize() {
        let json = r#"{"U":1,"u":2,"a":[["10.0","1.0"]],"b":[["9.0","2.0"]]}"#;
        let ev: RawDiffEvent = serde_json::from_str(json).unwrap();
        assert_eq!(ev.start_id, 1);
        assert_eq!(ev.end_id, 2);
        assert_eq!(ev.prev_end_id, None);
        assert_eq!(ev.asks, vec![("10.0".to_string(), "1.0".to_string())]);
        assert_eq!(ev.bids, vec![("9.0".to_string(), "2.0".to_string())]);
    }

    #[test]
    fn futures_field_names_deserialize() {
        let json = r#"{"U":498,"u":505,"pu":497,"asks":[["10.0","1.0"]],"bids":[]}"#;
        let ev: RawDiffEvent = serde_json::from_str(json).unwrap();
        assert_eq!(ev.prev_end_id, Some(497));
        assert_eq!(ev.asks.len(), 1);
        assert!(ev.bids.is_empty());
    }
}
