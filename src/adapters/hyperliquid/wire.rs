//! Venue wire format: classification of inbound WebSocket frames
//!
//! The venue sends JSON objects or arrays of objects, with payloads nested
//! under varying keys (`data`, `result`, `payload`) and order-book levels
//! encoded either as `[px, sz]` pairs or `{px|price|p, sz}` objects. This
//! module is the single parsing boundary: everything downstream works with
//! the `VenueMessage` tagged union and never inspects raw maps.
//!
//! Classification order: error envelope → subscription ack → order-book →
//! mark/context → all-mids batch → unclassified. Unclassified frames are
//! never dropped silently; the caller forwards them to the feed health
//! monitor as heartbeat candidates.

use serde_json::Value;

// =============================================================================
// Classified message types
// =============================================================================

/// Normalized order-book payload
#[derive(Debug, Clone, PartialEq)]
pub struct BookPayload {
    /// Venue coin identifier (e.g. "BTC", "@142", "PURR/USDC")
    pub coin: String,
    /// Best bid scanned from raw levels (max price), if any
    pub best_bid: Option<f64>,
    /// Best ask scanned from raw levels (min price), if any
    pub best_ask: Option<f64>,
    /// Whether the bid side carried any levels at all
    pub had_bids: bool,
    /// Whether the ask side carried any levels at all
    pub had_asks: bool,
    /// Venue timestamp in ms when present
    pub time_ms: Option<u64>,
}

/// Normalized mark/context payload
#[derive(Debug, Clone, PartialEq)]
pub struct ContextPayload {
    pub coin: String,
    /// Venue mark price
    pub mark: Option<f64>,
    /// Synthetic spot substitute: mid, else oracle, else first impact price
    pub spot_proxy: Option<f64>,
    pub funding: Option<f64>,
    pub time_ms: Option<u64>,
}

/// One classified inbound message
#[derive(Debug, Clone, PartialEq)]
pub enum VenueMessage {
    /// Venue-reported error envelope
    Error(String),
    /// Subscription acknowledgment; carries the acked coin when parseable
    Ack { coin: Option<String> },
    Book(BookPayload),
    Context(ContextPayload),
    /// Batch of (coin, mid) pairs
    Mids(Vec<(String, f64)>),
    /// Anything else; forwarded to the health monitor as a heartbeat candidate
    Unclassified,
}

// =============================================================================
// Frame handling
// =============================================================================

/// Split a raw frame into its envelope objects.
///
/// Arrays fan out into one envelope per element; a bare object is a single
/// envelope. Non-JSON input yields an empty vec (protocol error, caller logs).
pub fn parse_envelopes(raw: &str) -> Vec<Value> {
    match serde_json::from_str::<Value>(raw) {
        Ok(Value::Array(items)) => items.into_iter().filter(|v| v.is_object()).collect(),
        Ok(v @ Value::Object(_)) => vec![v],
        _ => Vec::new(),
    }
}

/// Classify one envelope into a `VenueMessage`.
pub fn classify(msg: &Value) -> VenueMessage {
    if is_error(msg) {
        let detail = msg
            .get("data")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| msg.to_string());
        return VenueMessage::Error(detail);
    }
    if is_ack(msg) {
        return VenueMessage::Ack {
            coin: ack_coin(msg),
        };
    }
    if is_l2book(msg) {
        if let Some(book) = parse_book(msg) {
            return VenueMessage::Book(book);
        }
        return VenueMessage::Unclassified;
    }
    if is_mark_context(msg) {
        if let Some(ctx) = parse_context(msg) {
            return VenueMessage::Context(ctx);
        }
        return VenueMessage::Unclassified;
    }
    if is_all_mids(msg) {
        return VenueMessage::Mids(parse_mids(msg));
    }
    VenueMessage::Unclassified
}

// =============================================================================
// Envelope predicates
// =============================================================================

fn channel_or_type<'a>(msg: &'a Value) -> Option<&'a str> {
    msg.get("channel")
        .and_then(Value::as_str)
        .or_else(|| msg.get("type").and_then(Value::as_str))
}

fn is_error(msg: &Value) -> bool {
    matches!(channel_or_type(msg), Some("error"))
}

fn is_ack(msg: &Value) -> bool {
    matches!(channel_or_type(msg), Some("subscriptionResponse"))
}

fn is_l2book(msg: &Value) -> bool {
    if matches!(channel_or_type(msg), Some("l2Book") | Some("l2book")) {
        return true;
    }
    if let Some(sub) = msg.get("subscription") {
        if sub.get("type").and_then(Value::as_str) == Some("l2Book") {
            return true;
        }
    }
    matches!(
        payload_type(msg),
        Some("l2Book") | Some("l2book")
    )
}

fn is_mark_context(msg: &Value) -> bool {
    if matches!(
        channel_or_type(msg),
        Some("markContext") | Some("activeAssetCtx") | Some("markPrice") | Some("mark")
    ) {
        return true;
    }
    matches!(
        payload_type(msg),
        Some("markContext") | Some("activeAssetCtx") | Some("markPrice")
    )
}

fn is_all_mids(msg: &Value) -> bool {
    if matches!(channel_or_type(msg), Some("allMids")) {
        return true;
    }
    matches!(payload_type(msg), Some("allMids"))
}

fn payload_type(msg: &Value) -> Option<&str> {
    for key in ["data", "result"] {
        if let Some(t) = msg
            .get(key)
            .and_then(|d| d.get("type"))
            .and_then(Value::as_str)
        {
            return Some(t);
        }
    }
    None
}

// =============================================================================
// Payload extraction
// =============================================================================

/// Unwrap the payload object from its envelope, trying the known nesting keys.
pub fn extract_payload<'a>(msg: &'a Value) -> &'a Value {
    for key in ["data", "result", "payload"] {
        if let Some(val) = msg.get(key) {
            if val.is_object() {
                return val;
            }
        }
    }
    msg
}

fn payload_coin(payload: &Value, msg: &Value) -> Option<String> {
    for src in [payload, msg] {
        for key in ["coin", "asset"] {
            if let Some(c) = src.get(key).and_then(Value::as_str) {
                if !c.is_empty() {
                    return Some(c.to_string());
                }
            }
        }
    }
    None
}

fn payload_time_ms(payload: &Value, msg: &Value) -> Option<u64> {
    for src in [payload, msg] {
        for key in ["time", "ts", "timestamp"] {
            if let Some(t) = src.get(key).and_then(Value::as_u64) {
                return Some(t);
            }
        }
    }
    None
}

/// Parse a numeric field that may arrive as a JSON number or a string.
pub fn parse_float(val: &Value) -> Option<f64> {
    match val {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.parse::<f64>().ok(),
        _ => None,
    }
}

fn field_float(obj: &Value, keys: &[&str]) -> Option<f64> {
    for key in keys {
        if let Some(v) = obj.get(*key).and_then(|v| parse_float(v)) {
            return Some(v);
        }
    }
    None
}

// =============================================================================
// Book parsing
// =============================================================================

/// Scan raw levels for the best price: max over bids, min over asks.
/// Tolerates `[px, sz]` arrays and `{px|price|p, ...}` objects; levels that
/// parse to no price are skipped.
pub fn best_price<'a, I>(levels: I, want_max: bool) -> Option<f64>
where
    I: IntoIterator<Item = &'a Value>,
{
    let mut best: Option<f64> = None;
    for level in levels {
        let price = match level {
            Value::Array(items) => items.first().and_then(parse_float),
            Value::Object(_) => field_float(level, &["px", "price", "p"]),
            _ => None,
        };
        let Some(price) = price else { continue };
        best = Some(match best {
            None => price,
            Some(b) if want_max => b.max(price),
            Some(b) => b.min(price),
        });
    }
    best
}

fn level_sides<'a>(payload: &'a Value) -> (Vec<&'a Value>, Vec<&'a Value>) {
    // levels may be {bids, asks}, [bids, asks], or flat bids/asks on payload
    if let Some(levels) = payload.get("levels") {
        if let Some(arr) = levels.as_array() {
            if arr.len() == 2 && arr[0].is_array() && arr[1].is_array() {
                let bids = arr[0].as_array().map(|v| v.iter().collect()).unwrap_or_default();
                let asks = arr[1].as_array().map(|v| v.iter().collect()).unwrap_or_default();
                return (bids, asks);
            }
        }
        if levels.is_object() {
            let bids = levels
                .get("bids")
                .and_then(Value::as_array)
                .map(|v| v.iter().collect())
                .unwrap_or_default();
            let asks = levels
                .get("asks")
                .and_then(Value::as_array)
                .map(|v| v.iter().collect())
                .unwrap_or_default();
            return (bids, asks);
        }
    }
    let bids = payload
        .get("bids")
        .and_then(Value::as_array)
        .map(|v| v.iter().collect())
        .unwrap_or_default();
    let asks = payload
        .get("asks")
        .and_then(Value::as_array)
        .map(|v| v.iter().collect())
        .unwrap_or_default();
    (bids, asks)
}

/// Parse an l2Book envelope (or REST snapshot payload) into a `BookPayload`.
pub fn parse_book(msg: &Value) -> Option<BookPayload> {
    let payload = extract_payload(msg);
    let coin = payload_coin(payload, msg)?;
    let (bids, asks) = level_sides(payload);
    let best_bid = best_price(bids.iter().copied(), true);
    let best_ask = best_price(asks.iter().copied(), false);
    Some(BookPayload {
        coin,
        best_bid,
        best_ask,
        had_bids: !bids.is_empty(),
        had_asks: !asks.is_empty(),
        time_ms: payload_time_ms(payload, msg),
    })
}

// =============================================================================
// Context parsing
// =============================================================================

/// Parse a mark/context envelope. The context fields may sit directly on the
/// payload or one level deeper under `ctx`.
pub fn parse_context(msg: &Value) -> Option<ContextPayload> {
    let payload = extract_payload(msg);
    let coin = payload_coin(payload, msg)?;
    let ctx = payload.get("ctx").filter(|v| v.is_object()).unwrap_or(payload);

    let mark = field_float(ctx, &["markPx", "mark", "price"]);
    let mid = field_float(ctx, &["midPx", "mid"]);
    let oracle = field_float(ctx, &["oraclePx", "oracle"]);
    let impact = ctx
        .get("impactPxs")
        .and_then(Value::as_array)
        .and_then(|arr| arr.first())
        .and_then(parse_float);
    let spot_proxy = mid.or(oracle).or(impact);
    let funding = field_float(ctx, &["funding", "fundingRate"]);

    Some(ContextPayload {
        coin,
        mark,
        spot_proxy,
        funding,
        time_ms: payload_time_ms(payload, msg),
    })
}

// =============================================================================
// Mids parsing
// =============================================================================

fn parse_mids(msg: &Value) -> Vec<(String, f64)> {
    let payload = extract_payload(msg);
    let mids = payload
        .get("mids")
        .or_else(|| payload.get("allMids"))
        .filter(|v| v.is_object())
        .unwrap_or(payload);
    let Some(map) = mids.as_object() else {
        return Vec::new();
    };
    map.iter()
        .filter_map(|(coin, val)| parse_float(val).map(|mid| (coin.clone(), mid)))
        .collect()
}

fn ack_coin(msg: &Value) -> Option<String> {
    let payload = extract_payload(msg);
    payload
        .get("subscription")
        .and_then(|s| s.get("coin"))
        .and_then(Value::as_str)
        .map(str::to_string)
}

// =============================================================================
// Outbound frames
// =============================================================================

/// Build a subscribe frame for the venue protocol.
pub fn subscribe_frame(sub_type: &str, coin: Option<&str>) -> String {
    let sub = match coin {
        Some(c) => serde_json::json!({"type": sub_type, "coin": c}),
        None => serde_json::json!({"type": sub_type}),
    };
    serde_json::json!({"method": "subscribe", "subscription": sub}).to_string()
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_classify_l2book_levels_pair_encoding() {
        let msg = json!({
            "channel": "l2Book",
            "data": {
                "coin": "BTC",
                "levels": [
                    [{"px": "96500.0", "sz": "1.5", "n": 3}, {"px": "96499.0", "sz": "1.0", "n": 1}],
                    [{"px": "96501.0", "sz": "0.8", "n": 2}]
                ],
                "time": 1700000000000u64
            }
        });
        match classify(&msg) {
            VenueMessage::Book(book) => {
                assert_eq!(book.coin, "BTC");
                assert_eq!(book.best_bid, Some(96500.0));
                assert_eq!(book.best_ask, Some(96501.0));
                assert!(book.had_bids && book.had_asks);
                assert_eq!(book.time_ms, Some(1700000000000));
            }
            other => panic!("Expected Book, got {:?}", other),
        }
    }

    #[test]
    fn test_classify_l2book_dict_levels_and_array_pairs() {
        let msg = json!({
            "type": "l2Book",
            "data": {
                "coin": "@142",
                "levels": {
                    "bids": [["10.5", "3"], ["10.4", "1"]],
                    "asks": [["10.7", "2"], ["10.9", "5"]]
                }
            }
        });
        match classify(&msg) {
            VenueMessage::Book(book) => {
                assert_eq!(book.coin, "@142");
                assert_eq!(book.best_bid, Some(10.5));
                assert_eq!(book.best_ask, Some(10.7));
            }
            other => panic!("Expected Book, got {:?}", other),
        }
    }

    #[test]
    fn test_book_with_empty_ask_side_has_no_finite_ask() {
        let msg = json!({
            "channel": "l2Book",
            "data": {"coin": "BTC", "levels": [[["100.0", "1"]], []]}
        });
        match classify(&msg) {
            VenueMessage::Book(book) => {
                assert_eq!(book.best_bid, Some(100.0));
                assert_eq!(book.best_ask, None);
                assert!(book.had_bids);
                assert!(!book.had_asks);
            }
            other => panic!("Expected Book, got {:?}", other),
        }
    }

    #[test]
    fn test_classify_context_with_nested_ctx() {
        let msg = json!({
            "channel": "markContext",
            "data": {
                "coin": "ETH",
                "ctx": {
                    "markPx": "3000.5",
                    "midPx": "3000.0",
                    "oraclePx": "2999.8",
                    "funding": "0.0000125",
                    "impactPxs": ["2999.9", "3000.1"]
                }
            }
        });
        match classify(&msg) {
            VenueMessage::Context(ctx) => {
                assert_eq!(ctx.coin, "ETH");
                assert_eq!(ctx.mark, Some(3000.5));
                assert_eq!(ctx.spot_proxy, Some(3000.0), "mid takes precedence");
                assert_eq!(ctx.funding, Some(0.0000125));
            }
            other => panic!("Expected Context, got {:?}", other),
        }
    }

    #[test]
    fn test_context_proxy_falls_back_to_oracle_then_impact() {
        let oracle_only = json!({
            "channel": "markContext",
            "data": {"coin": "ETH", "ctx": {"markPx": "3000", "oraclePx": "2999.8"}}
        });
        match classify(&oracle_only) {
            VenueMessage::Context(ctx) => assert_eq!(ctx.spot_proxy, Some(2999.8)),
            other => panic!("Expected Context, got {:?}", other),
        }

        let impact_only = json!({
            "channel": "markContext",
            "data": {"coin": "ETH", "ctx": {"markPx": "3000", "impactPxs": ["2999.5", "3000.5"]}}
        });
        match classify(&impact_only) {
            VenueMessage::Context(ctx) => assert_eq!(ctx.spot_proxy, Some(2999.5)),
            other => panic!("Expected Context, got {:?}", other),
        }
    }

    #[test]
    fn test_classify_all_mids() {
        let msg = json!({
            "channel": "allMids",
            "data": {"mids": {"BTC": "96500.5", "ETH": "3000.25", "BROKEN": "not-a-number"}}
        });
        match classify(&msg) {
            VenueMessage::Mids(mut mids) => {
                mids.sort_by(|a, b| a.0.cmp(&b.0));
                assert_eq!(
                    mids,
                    vec![("BTC".to_string(), 96500.5), ("ETH".to_string(), 3000.25)]
                );
            }
            other => panic!("Expected Mids, got {:?}", other),
        }
    }

    #[test]
    fn test_classify_error_and_ack() {
        let err = json!({"channel": "error", "data": "Invalid subscription"});
        assert_eq!(
            classify(&err),
            VenueMessage::Error("Invalid subscription".to_string())
        );

        let ack = json!({
            "channel": "subscriptionResponse",
            "data": {"method": "subscribe", "subscription": {"type": "l2Book", "coin": "BTC"}}
        });
        assert_eq!(
            classify(&ack),
            VenueMessage::Ack {
                coin: Some("BTC".to_string())
            }
        );
    }

    #[test]
    fn test_unknown_frame_is_unclassified_not_dropped() {
        let msg = json!({"channel": "pong"});
        assert_eq!(classify(&msg), VenueMessage::Unclassified);
    }

    #[test]
    fn test_parse_envelopes_array_fanout() {
        let raw = r#"[{"channel":"pong"},{"channel":"allMids","data":{"mids":{"BTC":"1.0"}}}]"#;
        let envelopes = parse_envelopes(raw);
        assert_eq!(envelopes.len(), 2);
        assert_eq!(classify(&envelopes[0]), VenueMessage::Unclassified);
        assert!(matches!(classify(&envelopes[1]), VenueMessage::Mids(_)));
    }

    #[test]
    fn test_parse_envelopes_garbage_is_empty() {
        assert!(parse_envelopes("not json at all").is_empty());
        assert!(parse_envelopes("42").is_empty());
    }

    #[test]
    fn test_subscribe_frame_shape() {
        let frame = subscribe_frame("l2Book", Some("BTC"));
        let v: Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(v["method"], "subscribe");
        assert_eq!(v["subscription"]["type"], "l2Book");
        assert_eq!(v["subscription"]["coin"], "BTC");

        let frame = subscribe_frame("allMids", None);
        let v: Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(v["subscription"]["type"], "allMids");
        assert!(v["subscription"].get("coin").is_none());
    }

    #[test]
    fn test_best_price_skips_unparseable_levels() {
        let levels = vec![
            json!(["abc", "1"]),
            json!(["100.0", "1"]),
            json!({"px": "101.5"}),
            json!(null),
        ];
        assert_eq!(best_price(&levels, true), Some(101.5));
        assert_eq!(best_price(&levels, false), Some(100.0));
        let empty: Vec<Value> = Vec::new();
        assert_eq!(best_price(&empty, true), None);
    }
}
