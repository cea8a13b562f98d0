use serde::Deserialize;
use serde_json::Value;

use crate::core::events::{MarketEvent, OrderBookLevel, OrderBookSnapshot, Timestamp, TradeTick};
use crate::error::FeedError;
use crate::feed::Topic;
use crate::types::{Price, Size, Symbol};

/// Partial book depths the exchange publishes
const PARTIAL_DEPTHS: [usize; 3] = [5, 10, 20];

/// Partial depth message.
///
/// Spot streams send `{lastUpdateId, bids, asks}`; futures streams send
/// `{e:"depthUpdate", E, T, s, U, u, b, a}`. Both decode into this struct.
#[derive(Debug, Clone, Deserialize)]
pub struct DepthMessage {
    #[serde(rename = "lastUpdateId", alias = "u", default)]
    pub last_update_id: u64,
    #[serde(rename = "s", default)]
    pub symbol: Option<String>,
    #[serde(rename = "E", default)]
    pub event_time: Option<u64>,
    #[serde(rename = "T", default)]
    pub transaction_time: Option<u64>,
    #[serde(alias = "b")]
    pub bids: Vec<(Price, Size)>,
    #[serde(alias = "a")]
    pub asks: Vec<(Price, Size)>,
}

/// Trade (or aggregate trade) message
#[derive(Debug, Clone, Deserialize)]
pub struct TradeMessage {
    #[serde(rename = "s")]
    pub symbol: String,
    #[serde(rename = "p")]
    pub price: Price,
    #[serde(rename = "q")]
    pub quantity: Size,
    /// Trade time
    #[serde(rename = "T")]
    pub trade_time: u64,
    /// Is buyer the market maker?
    #[serde(rename = "m")]
    pub is_buyer_maker: bool,
}

#[derive(Debug, Clone)]
pub enum BinanceMessage {
    Depth(DepthMessage),
    Trade(TradeMessage),
}

impl BinanceMessage {
    /// Parse a raw frame, unwrapping the combined-stream `{stream, data}` envelope
    pub fn from_json(json: &str) -> Result<Self, FeedError> {
        let mut value: Value = serde_json::from_str(json)?;
        if let Some(data) = value.get_mut("data").map(Value::take) {
            value = data;
        }

        match value.get("e").and_then(Value::as_str) {
            Some("trade") | Some("aggTrade") => {
                Ok(BinanceMessage::Trade(serde_json::from_value(value)?))
            }
            Some("depthUpdate") => Ok(BinanceMessage::Depth(serde_json::from_value(value)?)),
            Some(other) => Err(FeedError::Parse(format!("unknown event type: {}", other))),
            None if value.get("bids").is_some() => {
                Ok(BinanceMessage::Depth(serde_json::from_value(value)?))
            }
            None => Err(FeedError::Parse(
                "missing event type field 'e'".to_string(),
            )),
        }
    }

    /// Convert into a validated market event.
    ///
    /// `symbol` is used when the payload does not name its instrument and
    /// `received_at` when it carries no exchange time. Depth is truncated to
    /// `depth` levels per side before validation.
    pub fn into_market_event(
        self,
        symbol: &Symbol,
        depth: usize,
        received_at: Timestamp,
    ) -> Result<MarketEvent, FeedError> {
        match self {
            BinanceMessage::Depth(msg) => {
                let symbol = msg.symbol.map(Symbol::new).unwrap_or_else(|| symbol.clone());
                let timestamp = msg
                    .transaction_time
                    .or(msg.event_time)
                    .unwrap_or(received_at);
                let to_levels = |pairs: Vec<(Price, Size)>| {
                    pairs
                        .into_iter()
                        .map(|(price, size)| OrderBookLevel::new(price, size))
                        .collect::<Vec<_>>()
                };
                let mut snapshot =
                    OrderBookSnapshot::new(symbol, to_levels(msg.bids), to_levels(msg.asks), timestamp);
                snapshot.truncate(depth);
                snapshot.validate()?;
                Ok(MarketEvent::Depth(snapshot))
            }
            BinanceMessage::Trade(msg) => Ok(MarketEvent::Trade(TradeTick::from_buyer_maker(
                msg.symbol,
                msg.price,
                msg.quantity,
                msg.is_buyer_maker,
                msg.trade_time,
            ))),
        }
    }
}

/// Decode one frame for `symbol` in a single step
pub fn decode(
    json: &str,
    symbol: &Symbol,
    depth: usize,
    received_at: Timestamp,
) -> Result<MarketEvent, FeedError> {
    BinanceMessage::from_json(json)?.into_market_event(symbol, depth, received_at)
}

/// Smallest published partial depth covering `levels`
pub fn stream_depth(levels: usize) -> usize {
    PARTIAL_DEPTHS
        .iter()
        .copied()
        .find(|d| *d >= levels)
        .unwrap_or(PARTIAL_DEPTHS[PARTIAL_DEPTHS.len() - 1])
}

/// Build the raw stream endpoint for one (instrument, topic)
pub fn endpoint(base: &str, symbol: &Symbol, topic: Topic, levels: usize, update_ms: u64) -> String {
    let base = base.trim_end_matches('/');
    match topic {
        Topic::Depth => format!(
            "{}/{}@depth{}@{}ms",
            base,
            symbol.stream_name(),
            stream_depth(levels),
            update_ms
        ),
        Topic::Trade => format!("{}/{}@trade", base, symbol.stream_name()),
    }
}
