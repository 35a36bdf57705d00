//! Translation between bucket state and the store's positional convention.
//!
//! The store script takes its parameters as string-encoded positional
//! arguments and answers with a two-element list `[granted, remaining]`.
//! Over the years the store has answered `granted` as a 0/1 flag, as a
//! granted-token count, as a boolean (RESP3) or as nil (Lua `false` over
//! RESP2), and `remaining` as an integer, a double or a decimal string.
//! [`BucketCodec::decode`] accepts exactly those shapes and nothing else.

use std::collections::HashMap;
use std::fmt;

use crate::error::{Result, TollgateError};

use super::bucket::{BucketConfig, BucketRecord};

/// Default prefix prepended to every rate limit key in the store.
pub const DEFAULT_KEY_PREFIX: &str = "ratelimit:token:bucket:";

/// Hash field holding the token balance.
pub const TOKENS_FIELD: &str = "tokens";
/// Hash field holding the last refill timestamp in epoch milliseconds.
pub const REFILLED_AT_FIELD: &str = "ts";

/// Slack allowed on the capacity bound when a balance round-trips as text.
const CAPACITY_EPSILON: f64 = 1e-9;

/// One value of a store reply, reduced to the kinds the codec cares about.
#[derive(Debug, Clone, PartialEq)]
pub enum ReplyValue {
    /// Absent value. Lua `false` arrives as nil over RESP2.
    Nil,
    /// 64-bit integer reply.
    Int(i64),
    /// Boolean reply (RESP3).
    Bool(bool),
    /// Floating point reply (RESP3).
    Double(f64),
    /// Bulk or simple string reply.
    Text(String),
    /// Positional list reply.
    Array(Vec<ReplyValue>),
    /// Any other reply kind, kept only for error reporting.
    Other(String),
}

impl ReplyValue {
    fn kind(&self) -> &'static str {
        match self {
            ReplyValue::Nil => "nil",
            ReplyValue::Int(_) => "integer",
            ReplyValue::Bool(_) => "boolean",
            ReplyValue::Double(_) => "double",
            ReplyValue::Text(_) => "string",
            ReplyValue::Array(_) => "array",
            ReplyValue::Other(_) => "unsupported",
        }
    }
}

/// Parameters for one execution of the bucket script.
#[derive(Debug, Clone, PartialEq)]
pub struct BucketRequest {
    /// Fully prefixed store key.
    pub key: String,
    /// Tokens per second.
    pub rate: f64,
    /// Bucket capacity.
    pub capacity: i64,
    /// The single instant the whole step is computed at.
    pub now_millis: i64,
    /// Tokens to take. Zero asks for a read-only balance.
    pub requested: i64,
    /// TTL applied to the record after a write.
    pub ttl_millis: u64,
}

impl BucketRequest {
    /// Positional script arguments, in `ARGV` order.
    pub fn args(&self) -> [String; 5] {
        [
            self.rate.to_string(),
            self.capacity.to_string(),
            self.now_millis.to_string(),
            self.requested.to_string(),
            self.ttl_millis.to_string(),
        ]
    }
}

/// Decoded script reply.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScriptOutcome {
    /// Whether the tokens were granted.
    pub granted: bool,
    /// Balance left in the bucket, possibly fractional.
    pub tokens: f64,
}

impl ScriptOutcome {
    /// Remaining tokens as exposed by the public API, truncated toward zero.
    pub fn remaining(&self) -> i64 {
        self.tokens.trunc() as i64
    }
}

/// Maps rate limit keys and bucket parameters onto the store's convention.
#[derive(Debug, Clone)]
pub struct BucketCodec {
    key_prefix: String,
}

impl BucketCodec {
    /// Create a codec that namespaces keys under `key_prefix`.
    pub fn new(key_prefix: impl Into<String>) -> Self {
        Self {
            key_prefix: key_prefix.into(),
        }
    }

    /// The configured key prefix.
    pub fn key_prefix(&self) -> &str {
        &self.key_prefix
    }

    /// Store key for a rate limit key.
    pub fn store_key(&self, key: &str) -> String {
        format!("{}{}", self.key_prefix, key)
    }

    /// Build the script parameters for taking `requested` tokens at `now_millis`.
    pub fn encode(
        &self,
        key: &str,
        config: &BucketConfig,
        now_millis: i64,
        requested: i64,
    ) -> BucketRequest {
        BucketRequest {
            key: self.store_key(key),
            rate: config.rate(),
            capacity: config.capacity(),
            now_millis,
            requested,
            ttl_millis: config.idle_expiration_millis(),
        }
    }

    /// Decode a script reply.
    ///
    /// Fails with [`TollgateError::Protocol`] for anything that is not a
    /// two-element list of accepted shapes, and for balances that are not
    /// finite or fall outside `[0, capacity]`.
    pub fn decode(&self, reply: &ReplyValue, capacity: i64) -> Result<ScriptOutcome> {
        let items = match reply {
            ReplyValue::Array(items) => items,
            other => {
                return Err(TollgateError::Protocol(format!(
                    "expected a 2-element array reply, got {}",
                    other.kind()
                )))
            }
        };

        if items.len() != 2 {
            return Err(TollgateError::Protocol(format!(
                "expected a 2-element array reply, got {} elements",
                items.len()
            )));
        }

        let granted = decode_granted(&items[0])?;
        let tokens = decode_tokens(&items[1])?;

        if !tokens.is_finite() || tokens < 0.0 || tokens > capacity as f64 + CAPACITY_EPSILON {
            return Err(TollgateError::Protocol(format!(
                "remaining tokens {} outside [0, {}]",
                tokens, capacity
            )));
        }

        Ok(ScriptOutcome {
            granted,
            tokens: tokens.min(capacity as f64),
        })
    }

    /// Rebuild a bucket record from its hash fields.
    ///
    /// Returns `Ok(None)` when the record does not exist. A record with only
    /// one of its fields, or with unparsable numbers, is a protocol error.
    pub fn decode_record(fields: &HashMap<String, String>) -> Result<Option<BucketRecord>> {
        let tokens = fields.get(TOKENS_FIELD);
        let refilled_at = fields.get(REFILLED_AT_FIELD);

        match (tokens, refilled_at) {
            (None, None) => Ok(None),
            (Some(tokens), Some(refilled_at)) => {
                let tokens: f64 = tokens.trim().parse().map_err(|_| {
                    TollgateError::Protocol(format!("invalid tokens field {:?}", tokens))
                })?;
                let last_refill_at_millis = parse_millis(refilled_at)?;
                Ok(Some(BucketRecord {
                    tokens,
                    last_refill_at_millis,
                }))
            }
            _ => Err(TollgateError::Protocol(
                "bucket record is missing a field".to_string(),
            )),
        }
    }
}

impl Default for BucketCodec {
    fn default() -> Self {
        Self::new(DEFAULT_KEY_PREFIX)
    }
}

impl fmt::Display for BucketRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} rate={} capacity={} now={} n={}",
            self.key, self.rate, self.capacity, self.now_millis, self.requested
        )
    }
}

fn decode_granted(value: &ReplyValue) -> Result<bool> {
    match value {
        ReplyValue::Bool(granted) => Ok(*granted),
        ReplyValue::Nil => Ok(false),
        // 0/1 flag or the granted token count
        ReplyValue::Int(count) if *count >= 0 => Ok(*count > 0),
        ReplyValue::Int(count) => Err(TollgateError::Protocol(format!(
            "negative granted value {}",
            count
        ))),
        other => Err(TollgateError::Protocol(format!(
            "unexpected {} for granted",
            other.kind()
        ))),
    }
}

fn decode_tokens(value: &ReplyValue) -> Result<f64> {
    match value {
        ReplyValue::Int(tokens) => Ok(*tokens as f64),
        ReplyValue::Double(tokens) => Ok(*tokens),
        ReplyValue::Text(text) => text.trim().parse::<f64>().map_err(|_| {
            TollgateError::Protocol(format!("remaining tokens {:?} is not a number", text))
        }),
        other => Err(TollgateError::Protocol(format!(
            "unexpected {} for remaining tokens",
            other.kind()
        ))),
    }
}

fn parse_millis(text: &str) -> Result<i64> {
    let text = text.trim();
    if let Ok(millis) = text.parse::<i64>() {
        return Ok(millis);
    }

    // Lua may render large integers in float notation
    match text.parse::<f64>() {
        Ok(millis) if millis.is_finite() => Ok(millis as i64),
        _ => Err(TollgateError::Protocol(format!(
            "invalid timestamp field {:?}",
            text
        ))),
    }
}
