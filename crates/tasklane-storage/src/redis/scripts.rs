//! Server-side Lua for every multi-key mutation.
//!
//! Each script runs atomically on the server, so the task hash, its context
//! set and the stats counters never disagree after a successful write.
//! Records with a future expiry are also listed in the expiry index, so
//! counters can be corrected once Redis drops an expired hash on its own.
//! Context keys of other records are derived from the prefix passed in
//! `ARGV`, which ties the provider to a single (non-cluster) node.

use ::redis::Script;

/// Shared helpers prepended to the scripts that need them.
///
/// `prune_vanished` walks expiry-index entries due by `now` whose task hash
/// is gone and removes them from their context set and the counters. The
/// decrement only happens when the context set still held the id, so an
/// index sweep that already dropped the member is not counted twice.
const PRELUDE: &str = r#"
local function prune_vanished(expiries, owners, stats, prefix, now)
    local pruned = 0
    local due = redis.call('ZRANGEBYSCORE', expiries, '-inf', now)
    for _, id in ipairs(due) do
        if redis.call('EXISTS', prefix .. 'task:' .. id) == 0 then
            local owner = redis.call('HGET', owners, id)
            if owner then
                local split = string.find(owner, '\n', 1, true)
                if split then
                    local state = string.sub(owner, 1, split - 1)
                    local context_id = string.sub(owner, split + 1)
                    if redis.call('SREM', prefix .. 'context:' .. context_id, id) == 1 then
                        redis.call('HINCRBY', stats, 'totalTasks', -1)
                        redis.call('HINCRBY', stats, 'state:' .. state, -1)
                        pruned = pruned + 1
                    end
                end
            end
            redis.call('HDEL', owners, id)
            redis.call('ZREM', expiries, id)
        end
    end
    return pruned
end

local function track_expiry(expiries, owners, task_id, expires_at, state, context_id)
    redis.call('ZADD', expiries, expires_at, task_id)
    redis.call('HSET', owners, task_id, state .. '\n' .. context_id)
end

local function untrack_expiry(expiries, owners, task_id)
    redis.call('ZREM', expiries, task_id)
    redis.call('HDEL', owners, task_id)
end
"#;

/// Create a record.
///
/// KEYS: task hash, context set, stats hash, expiry index, expiry owners.
/// ARGV: now ms, key prefix, task id, context id, state, expires-at ms or "",
/// max tasks or "", max per context or "", then field/value pairs.
///
/// Returns 1 on success, 0 if a live record exists, -1 when the store is
/// full, -2 when the context is full.
const STORE: &str = r#"
local now = tonumber(ARGV[1])
local prefix = ARGV[2]
local task_id = ARGV[3]
local context_id = ARGV[4]

prune_vanished(KEYS[4], KEYS[5], KEYS[3], prefix, now)

local replaced = redis.call('HMGET', KEYS[1], 'contextId', 'state', 'expiresAt')
local exists = redis.call('EXISTS', KEYS[1]) == 1
if exists then
    local expires_at = replaced[3]
    if not expires_at or expires_at == '' or tonumber(expires_at) > now then
        return 0
    end
end

local stored = tonumber(redis.call('HGET', KEYS[3], 'totalTasks') or '0')
local in_context = redis.call('SCARD', KEYS[2])
if exists then
    stored = stored - 1
    if replaced[1] == context_id then
        in_context = in_context - 1
    end
end
if ARGV[7] ~= '' and stored >= tonumber(ARGV[7]) then
    return -1
end
if ARGV[8] ~= '' and in_context >= tonumber(ARGV[8]) then
    return -2
end

if exists then
    redis.call('SREM', prefix .. 'context:' .. replaced[1], task_id)
    redis.call('HINCRBY', KEYS[3], 'totalTasks', -1)
    redis.call('HINCRBY', KEYS[3], 'state:' .. replaced[2], -1)
    redis.call('DEL', KEYS[1])
end

redis.call('HSET', KEYS[1], unpack(ARGV, 9))
redis.call('SADD', KEYS[2], task_id)
redis.call('HINCRBY', KEYS[3], 'totalTasks', 1)
redis.call('HINCRBY', KEYS[3], 'state:' .. ARGV[5], 1)
if ARGV[6] ~= '' and tonumber(ARGV[6]) > now then
    redis.call('PEXPIREAT', KEYS[1], tonumber(ARGV[6]))
    track_expiry(KEYS[4], KEYS[5], task_id, tonumber(ARGV[6]), ARGV[5], context_id)
else
    untrack_expiry(KEYS[4], KEYS[5], task_id)
end
return 1
"#;

/// Compare-and-swap a live record.
///
/// KEYS: task hash, stats hash, expiry index, expiry owners.
/// ARGV: now ms, expected version, new state, expires-at ms or "", task id,
/// then field/value pairs (including the bumped version).
///
/// Returns 1 on success, 0 on a version mismatch, -1 if the record is
/// missing or expired.
const UPDATE: &str = r#"
local now = tonumber(ARGV[1])
local current = redis.call('HMGET', KEYS[1], 'version', 'state', 'expiresAt', 'contextId')
if not current[1] then
    return -1
end
if current[3] and current[3] ~= '' and tonumber(current[3]) <= now then
    return -1
end
if current[1] ~= ARGV[2] then
    return 0
end

if current[2] ~= ARGV[3] then
    redis.call('HINCRBY', KEYS[2], 'state:' .. current[2], -1)
    redis.call('HINCRBY', KEYS[2], 'state:' .. ARGV[3], 1)
end
redis.call('HSET', KEYS[1], unpack(ARGV, 6))
if ARGV[4] ~= '' and tonumber(ARGV[4]) > now then
    redis.call('PEXPIREAT', KEYS[1], tonumber(ARGV[4]))
    track_expiry(KEYS[3], KEYS[4], ARGV[5], tonumber(ARGV[4]), ARGV[3], current[4])
else
    redis.call('PERSIST', KEYS[1])
    untrack_expiry(KEYS[3], KEYS[4], ARGV[5])
end
return 1
"#;

/// Remove one record with its index entries and counters.
///
/// KEYS: task hash, stats hash, expiry index, expiry owners.
/// ARGV: key prefix, task id, and "" or a now-ms guard that only deletes the
/// record if it is expired at that time.
///
/// Returns 1 if a record was removed.
const DELETE: &str = r#"
local current = redis.call('HMGET', KEYS[1], 'contextId', 'state', 'expiresAt')
if not current[1] then
    return 0
end
if ARGV[3] ~= '' then
    local expires_at = current[3]
    if not expires_at or expires_at == '' or tonumber(expires_at) > tonumber(ARGV[3]) then
        return 0
    end
end

redis.call('DEL', KEYS[1])
redis.call('SREM', ARGV[1] .. 'context:' .. current[1], ARGV[2])
redis.call('HINCRBY', KEYS[2], 'totalTasks', -1)
redis.call('HINCRBY', KEYS[2], 'state:' .. current[2], -1)
untrack_expiry(KEYS[3], KEYS[4], ARGV[2])
return 1
"#;

/// Remove every record in a context.
///
/// KEYS: context set, stats hash, expiry index, expiry owners.
/// ARGV: key prefix, context id, now ms.
///
/// Returns the number of records removed.
const DELETE_CONTEXT: &str = r#"
prune_vanished(KEYS[3], KEYS[4], KEYS[2], ARGV[1], tonumber(ARGV[3]))

local ids = redis.call('SMEMBERS', KEYS[1])
local removed = 0
for _, task_id in ipairs(ids) do
    local key = ARGV[1] .. 'task:' .. task_id
    local current = redis.call('HMGET', key, 'contextId', 'state')
    if current[1] == ARGV[2] then
        redis.call('DEL', key)
        redis.call('HINCRBY', KEYS[2], 'totalTasks', -1)
        redis.call('HINCRBY', KEYS[2], 'state:' .. current[2], -1)
        untrack_expiry(KEYS[3], KEYS[4], task_id)
        removed = removed + 1
    end
end
redis.call('DEL', KEYS[1])
return removed
"#;

/// Correct counters for records Redis expired on its own.
///
/// KEYS: stats hash, expiry index, expiry owners.
/// ARGV: key prefix, now ms.
///
/// Returns the number of records accounted for.
const PRUNE: &str = r#"
return prune_vanished(KEYS[2], KEYS[3], KEYS[1], ARGV[1], tonumber(ARGV[2]))
"#;

/// Replace the stats counters with recounted values.
///
/// KEYS: stats hash.
/// ARGV: field/value pairs.
const RESET_STATS: &str = r#"
redis.call('DEL', KEYS[1])
if #ARGV > 0 then
    redis.call('HSET', KEYS[1], unpack(ARGV))
end
return 1
"#;

fn with_prelude(body: &str) -> Script {
    Script::new(&format!("{PRELUDE}{body}"))
}

/// Compiled scripts, hashed once per provider
pub struct TaskScripts {
    pub store: Script,
    pub update: Script,
    pub delete: Script,
    pub delete_context: Script,
    pub prune: Script,
    pub reset_stats: Script,
}

impl TaskScripts {
    pub fn new() -> Self {
        Self {
            store: with_prelude(STORE),
            update: with_prelude(UPDATE),
            delete: with_prelude(DELETE),
            delete_context: with_prelude(DELETE_CONTEXT),
            prune: with_prelude(PRUNE),
            reset_stats: Script::new(RESET_STATS),
        }
    }
}

impl Default for TaskScripts {
    fn default() -> Self {
        Self::new()
    }
}

/// Outcome codes returned by the store script
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOutcome {
    Stored,
    AlreadyExists,
    StoreFull,
    ContextFull,
}

impl StoreOutcome {
    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            1 => Some(Self::Stored),
            0 => Some(Self::AlreadyExists),
            -1 => Some(Self::StoreFull),
            -2 => Some(Self::ContextFull),
            _ => None,
        }
    }
}

/// Outcome codes returned by the update script
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    Updated,
    VersionMismatch,
    Missing,
}

impl UpdateOutcome {
    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            1 => Some(Self::Updated),
            0 => Some(Self::VersionMismatch),
            -1 => Some(Self::Missing),
            _ => None,
        }
    }
}
