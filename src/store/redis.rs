use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};
use std::collections::HashMap;
use std::sync::Arc;

use super::{ConsumeOutcome, TokenStore};
use crate::errors::StoreError;
use crate::models::token::{Action, CapabilityToken};

/// Insert a batch only if none of its token keys exist yet.
/// KEYS: token_key, pair_key per record. ARGV: 6 fields per record.
const INSERT_SCRIPT: &str = r#"
for i = 1, #KEYS, 2 do
    if redis.call("EXISTS", KEYS[i]) == 1 then
        return 0
    end
end
for i = 1, #KEYS, 2 do
    local base = ((i - 1) / 2) * 6
    redis.call("HSET", KEYS[i],
        "token", ARGV[base + 1],
        "subject_id", ARGV[base + 2],
        "principal_id", ARGV[base + 3],
        "action", ARGV[base + 4],
        "expires_at", ARGV[base + 5],
        "created_at", ARGV[base + 6],
        "pair", KEYS[i + 1])
    redis.call("SADD", KEYS[i + 1], ARGV[base + 1])
end
return 1
"#;

/// KEYS[1]: token key. ARGV: expected action, now (ms), key prefix.
///
/// A consumed opposite-action sibling reports "expired" regardless of the
/// sibling's `expires_at`, which was written with another caller's clock.
const CONSUME_SCRIPT: &str = r#"
local raw = redis.call("HGETALL", KEYS[1])
if #raw == 0 then
    return {"not_found"}
end
local h = {}
for i = 1, #raw, 2 do
    h[raw[i]] = raw[i + 1]
end
if h["consumed_at"] then
    return {"consumed"}
end
if h["action"] ~= ARGV[1] then
    return {"mismatch", h["action"]}
end
local now = tonumber(ARGV[2])
if now >= tonumber(h["expires_at"]) then
    return {"expired"}
end
local siblings = {}
if h["pair"] then
    for _, member in ipairs(redis.call("SMEMBERS", h["pair"])) do
        local key = ARGV[3] .. "token:" .. member
        if key ~= KEYS[1] then
            local s = redis.call("HMGET", key, "action", "expires_at", "consumed_at", "subject_id", "principal_id")
            if s[1] and s[1] ~= h["action"]
                and s[4] == h["subject_id"] and s[5] == h["principal_id"] then
                if s[3] then
                    return {"expired"}
                end
                table.insert(siblings, {key, s[2]})
            end
        end
    end
end
redis.call("HSET", KEYS[1], "consumed_at", ARGV[2])
for _, sibling in ipairs(siblings) do
    if tonumber(sibling[2]) > now then
        redis.call("HSET", sibling[1], "expires_at", ARGV[2])
    end
end
return {"ok", h["subject_id"], h["principal_id"], h["action"], h["expires_at"], h["created_at"]}
"#;

/// KEYS[1]: pair key. ARGV: action to keep ("" for none), now (ms), key
/// prefix, subject id, principal id.
const INVALIDATE_SCRIPT: &str = r#"
local now = tonumber(ARGV[2])
local count = 0
for _, token in ipairs(redis.call("SMEMBERS", KEYS[1])) do
    local key = ARGV[3] .. "token:" .. token
    local s = redis.call("HMGET", key, "action", "expires_at", "consumed_at", "subject_id", "principal_id")
    if s[1] and s[1] ~= ARGV[1] and not s[3] and tonumber(s[2]) > now
        and s[4] == ARGV[4] and s[5] == ARGV[5] then
        redis.call("HSET", key, "expires_at", ARGV[2])
        count = count + 1
    end
end
return count
"#;

/// Redis-backed token store for single-node deployments.
///
/// Each token is a hash under `{prefix}token:{token}`; each reviewer/expense
/// pair keeps a set of its tokens under [`pair_key`], which the token hash
/// also records in its `pair` field.
/// Every mutation is one Lua script, so Redis runs it atomically.
#[derive(Clone)]
pub struct RedisTokenStore {
    redis: ConnectionManager,
    prefix: String,
    scripts: Arc<Scripts>,
}

struct Scripts {
    insert: Script,
    consume: Script,
    invalidate: Script,
}

impl RedisTokenStore {
    pub fn new(redis: ConnectionManager) -> Self {
        Self::with_prefix(redis, "rbox:")
    }

    pub fn with_prefix(redis: ConnectionManager, prefix: &str) -> Self {
        Self {
            redis,
            prefix: prefix.to_string(),
            scripts: Arc::new(Scripts {
                insert: Script::new(INSERT_SCRIPT),
                consume: Script::new(CONSUME_SCRIPT),
                invalidate: Script::new(INVALIDATE_SCRIPT),
            }),
        }
    }

    pub async fn connect(redis_url: &str) -> anyhow::Result<Self> {
        let client = redis::Client::open(redis_url)?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self::new(conn))
    }

    fn token_key(&self, token: &str) -> String {
        format!("{}token:{}", self.prefix, token)
    }

    fn pair_key(&self, subject_id: &str, principal_id: &str) -> String {
        pair_key(&self.prefix, subject_id, principal_id)
    }
}

/// `{prefix}pair:{len(subject)}:{subject}:{principal}`. The length prefix
/// keeps ids containing `:` from sharing a set with another pair.
pub fn pair_key(prefix: &str, subject_id: &str, principal_id: &str) -> String {
    format!(
        "{}pair:{}:{}:{}",
        prefix,
        subject_id.len(),
        subject_id,
        principal_id
    )
}

fn parse_millis(field: &str, raw: Option<&String>) -> Result<DateTime<Utc>, StoreError> {
    raw.and_then(|v| v.parse::<i64>().ok())
        .and_then(DateTime::<Utc>::from_timestamp_millis)
        .ok_or_else(|| StoreError::Corrupt(format!("missing or invalid {}", field)))
}

fn parse_action(raw: Option<&String>) -> Result<Action, StoreError> {
    raw.ok_or_else(|| StoreError::Corrupt("missing action".into()))?
        .parse::<Action>()
        .map_err(StoreError::Corrupt)
}

fn record_from_hash(h: &HashMap<String, String>) -> Result<CapabilityToken, StoreError> {
    let text = |field: &str| {
        h.get(field)
            .cloned()
            .ok_or_else(|| StoreError::Corrupt(format!("missing {}", field)))
    };
    Ok(CapabilityToken {
        token: text("token")?,
        subject_id: text("subject_id")?,
        principal_id: text("principal_id")?,
        action: parse_action(h.get("action"))?,
        expires_at: parse_millis("expires_at", h.get("expires_at"))?,
        consumed_at: match h.get("consumed_at") {
            Some(_) => Some(parse_millis("consumed_at", h.get("consumed_at"))?),
            None => None,
        },
        created_at: parse_millis("created_at", h.get("created_at"))?,
    })
}

#[async_trait]
impl TokenStore for RedisTokenStore {
    async fn insert(&self, records: &[CapabilityToken]) -> Result<(), StoreError> {
        if records.is_empty() {
            return Ok(());
        }

        let mut invocation = self.scripts.insert.prepare_invoke();
        for record in records {
            invocation
                .key(self.token_key(&record.token))
                .key(self.pair_key(&record.subject_id, &record.principal_id));
        }
        for record in records {
            invocation
                .arg(&record.token)
                .arg(&record.subject_id)
                .arg(&record.principal_id)
                .arg(record.action.as_str())
                .arg(record.expires_at.timestamp_millis())
                .arg(record.created_at.timestamp_millis());
        }

        let mut conn = self.redis.clone();
        let inserted: i64 = invocation.invoke_async(&mut conn).await?;
        if inserted == 1 {
            Ok(())
        } else {
            Err(StoreError::DuplicateToken)
        }
    }

    async fn find(&self, token: &str) -> Result<Option<CapabilityToken>, StoreError> {
        let mut conn = self.redis.clone();
        let h: HashMap<String, String> = conn.hgetall(self.token_key(token)).await?;
        if h.is_empty() {
            return Ok(None);
        }
        record_from_hash(&h).map(Some)
    }

    async fn conditional_consume(
        &self,
        token: &str,
        expected: Action,
        now: DateTime<Utc>,
    ) -> Result<ConsumeOutcome, StoreError> {
        let mut conn = self.redis.clone();
        let reply: Vec<String> = self
            .scripts
            .consume
            .key(self.token_key(token))
            .arg(expected.as_str())
            .arg(now.timestamp_millis())
            .arg(&self.prefix)
            .invoke_async(&mut conn)
            .await?;

        match reply.first().map(String::as_str) {
            Some("not_found") => Ok(ConsumeOutcome::NotFound),
            Some("consumed") => Ok(ConsumeOutcome::AlreadyConsumed),
            Some("expired") => Ok(ConsumeOutcome::Expired),
            Some("mismatch") => Ok(ConsumeOutcome::ActionMismatch {
                stored: parse_action(reply.get(1))?,
            }),
            Some("ok") if reply.len() == 6 => Ok(ConsumeOutcome::Consumed(CapabilityToken {
                token: token.to_string(),
                subject_id: reply[1].clone(),
                principal_id: reply[2].clone(),
                action: parse_action(reply.get(3))?,
                expires_at: parse_millis("expires_at", reply.get(4))?,
                consumed_at: Some(now),
                created_at: parse_millis("created_at", reply.get(5))?,
            })),
            other => Err(StoreError::Corrupt(format!(
                "unexpected consume reply: {:?}",
                other
            ))),
        }
    }

    async fn invalidate_sibling(
        &self,
        subject_id: &str,
        principal_id: &str,
        exclude: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let keep_action = match exclude {
            Some(token) => match self.find(token).await? {
                Some(r) if r.subject_id == subject_id && r.principal_id == principal_id => {
                    r.action.as_str()
                }
                _ => return Ok(0),
            },
            None => "",
        };

        let mut conn = self.redis.clone();
        let count: u64 = self
            .scripts
            .invalidate
            .key(self.pair_key(subject_id, principal_id))
            .arg(keep_action)
            .arg(now.timestamp_millis())
            .arg(&self.prefix)
            .arg(subject_id)
            .arg(principal_id)
            .invoke_async(&mut conn)
            .await?;
        Ok(count)
    }
}
