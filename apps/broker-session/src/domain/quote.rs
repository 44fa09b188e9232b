//! Price Snapshot
//!
//! Typed view of the price documents returned by the subscription and
//! info-price endpoints and streamed over the WebSocket. Every field is
//! optional: the initial snapshot carries whatever field groups were
//! requested, and streamed updates are sparse deltas carrying only the
//! fields that changed.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Quote field group.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct Quote {
    /// Best bid.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bid: Option<Decimal>,
    /// Best ask.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ask: Option<Decimal>,
    /// Mid price as published by the server.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mid: Option<Decimal>,
    /// Quoted amount.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub amount: Option<Decimal>,
    /// Size at the bid.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bid_size: Option<Decimal>,
    /// Size at the ask.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ask_size: Option<Decimal>,
    /// Market state (e.g. `Open`, `Closed`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub market_state: Option<String>,
    /// Bid price type (e.g. `Tradable`, `Indicative`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub price_type_bid: Option<String>,
    /// Ask price type.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub price_type_ask: Option<String>,
    /// Delay applied to the quote, zero for real-time data.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delayed_by_minutes: Option<u32>,
}

impl Quote {
    fn merge(&mut self, delta: Self) {
        overlay(&mut self.bid, delta.bid);
        overlay(&mut self.ask, delta.ask);
        overlay(&mut self.mid, delta.mid);
        overlay(&mut self.amount, delta.amount);
        overlay(&mut self.bid_size, delta.bid_size);
        overlay(&mut self.ask_size, delta.ask_size);
        overlay(&mut self.market_state, delta.market_state);
        overlay(&mut self.price_type_bid, delta.price_type_bid);
        overlay(&mut self.price_type_ask, delta.price_type_ask);
        overlay(&mut self.delayed_by_minutes, delta.delayed_by_minutes);
    }

    /// Mid price, computed from bid/ask when the server did not publish one.
    #[must_use]
    pub fn mid_price(&self) -> Option<Decimal> {
        self.mid.or_else(|| match (self.bid, self.ask) {
            (Some(bid), Some(ask)) => Some((bid + ask) / Decimal::TWO),
            _ => None,
        })
    }
}

/// Option greeks field group.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct Greeks {
    /// Delta.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delta: Option<Decimal>,
    /// Gamma.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gamma: Option<Decimal>,
    /// Theta.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub theta: Option<Decimal>,
    /// Vega.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vega: Option<Decimal>,
    /// Mid implied volatility.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mid_vol: Option<Decimal>,
}

impl Greeks {
    fn merge(&mut self, delta: Self) {
        overlay(&mut self.delta, delta.delta);
        overlay(&mut self.gamma, delta.gamma);
        overlay(&mut self.theta, delta.theta);
        overlay(&mut self.vega, delta.vega);
        overlay(&mut self.mid_vol, delta.mid_vol);
    }
}

/// Session statistics field group.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct PriceInfo {
    /// Session high.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub high: Option<Decimal>,
    /// Session low.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub low: Option<Decimal>,
    /// Absolute change since previous close.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub net_change: Option<Decimal>,
    /// Percent change since previous close.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub percent_change: Option<Decimal>,
}

impl PriceInfo {
    fn merge(&mut self, delta: Self) {
        overlay(&mut self.high, delta.high);
        overlay(&mut self.low, delta.low);
        overlay(&mut self.net_change, delta.net_change);
        overlay(&mut self.percent_change, delta.percent_change);
    }
}

/// Price document for one instrument.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct PriceSnapshot {
    /// Instrument id.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uic: Option<u64>,
    /// Asset type (e.g. `Stock`, `StockOption`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub asset_type: Option<String>,
    /// Quote group.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quote: Option<Quote>,
    /// Greeks group (options only).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub greeks: Option<Greeks>,
    /// Session statistics group.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub price_info: Option<PriceInfo>,
    /// Server-side timestamp of the last change.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_updated: Option<DateTime<Utc>>,
}

impl PriceSnapshot {
    /// Overlay a sparse delta: fields present in `delta` win, absent fields
    /// keep their previous value.
    pub fn merge(&mut self, delta: Self) {
        overlay(&mut self.uic, delta.uic);
        overlay(&mut self.asset_type, delta.asset_type);
        merge_group(&mut self.quote, delta.quote, Quote::merge);
        merge_group(&mut self.greeks, delta.greeks, Greeks::merge);
        merge_group(&mut self.price_info, delta.price_info, PriceInfo::merge);
        overlay(&mut self.last_updated, delta.last_updated);
    }

    /// Best bid, if quoted.
    #[must_use]
    pub fn bid(&self) -> Option<Decimal> {
        self.quote.as_ref().and_then(|q| q.bid)
    }

    /// Best ask, if quoted.
    #[must_use]
    pub fn ask(&self) -> Option<Decimal> {
        self.quote.as_ref().and_then(|q| q.ask)
    }
}

fn overlay<T>(slot: &mut Option<T>, value: Option<T>) {
    if value.is_some() {
        *slot = value;
    }
}

fn merge_group<T>(slot: &mut Option<T>, delta: Option<T>, merge: fn(&mut T, T)) {
    match (slot.as_mut(), delta) {
        (Some(current), Some(delta)) => merge(current, delta),
        (None, Some(delta)) => *slot = Some(delta),
        (_, None) => {}
    }
}
