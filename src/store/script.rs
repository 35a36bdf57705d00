//! The canonical bucket script run by the shared store.
//!
//! `KEYS[1]` is the bucket hash. `ARGV` is `rate, capacity, now_ms,
//! requested, ttl_ms`, all string encoded. The reply is
//! `{granted (0/1), "<tokens>"}`; the balance travels as text because
//! Lua numbers are truncated to integers on the way out. It is formatted with
//! 17 significant digits so the stored and returned balance parse back to
//! the exact double computed here.

/// Lua source of the refill-then-consume step.
///
/// `requested == 0` returns the refilled balance without writing anything,
/// not even the TTL. Every other call writes the balance and the timestamp,
/// denials included.
pub const TOKEN_BUCKET_SCRIPT: &str = r#"
local key = KEYS[1]
local rate = tonumber(ARGV[1])
local capacity = tonumber(ARGV[2])
local now = tonumber(ARGV[3])
local requested = tonumber(ARGV[4])
local ttl_ms = tonumber(ARGV[5])

local state = redis.call("HMGET", key, "tokens", "ts")
local tokens = tonumber(state[1])
local last = tonumber(state[2])

local function exact(n)
    return string.format("%.17g", n)
end

if tokens == nil or last == nil then
    tokens = capacity
    last = now
end

local elapsed = math.max(0, now - last) / 1000
local refilled = math.min(capacity, tokens + elapsed * rate)

if requested == 0 then
    return {1, exact(refilled)}
end

local granted = 0
if refilled >= requested then
    granted = 1
    refilled = refilled - requested
end

redis.call("HSET", key, "tokens", exact(refilled), "ts", string.format("%d", now))
redis.call("PEXPIRE", key, ttl_ms)

return {granted, exact(refilled)}
"#;
