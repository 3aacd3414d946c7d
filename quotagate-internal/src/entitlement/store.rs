use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use redis::{AsyncCommands, Script};
use tokio::time::timeout;
use tracing::info;

use crate::entitlement::{EntitlementRecord, SubscriptionStatus};
use crate::error::{Error, ErrorDetails};

/// Outcome of the atomic free-tier check-and-consume
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanConsumption {
    /// User is on a paid tier; nothing was consumed. Carries the tier the
    /// consume observed, which supersedes any earlier read of the record.
    PaidTier {
        subscription_status: SubscriptionStatus,
    },
    /// A free-tier scan was consumed; `remaining` is what is left of the cap
    Granted { remaining: u32 },
    /// The free-tier cap is spent; nothing was consumed
    Exhausted,
}

/// Durable store for entitlement records.
///
/// Every mutation is an upsert executed atomically at the storage layer (a
/// single command, an entry closure, or a Lua script), never an app-level
/// read-modify-write, so two racing reconcilers can't tear a record and two
/// racing quota checks can't double-consume.
#[derive(Clone)]
pub enum EntitlementStore {
    /// In-memory store for tests and single-process deployments without Redis
    Memory(MemoryEntitlementStore),
    /// Redis-backed store: one hash per user plus a customer-id directory
    Redis(RedisEntitlementStore),
}

impl EntitlementStore {
    pub fn new_memory() -> Self {
        EntitlementStore::Memory(MemoryEntitlementStore::new())
    }

    pub async fn new_redis(url: &str, op_timeout: Duration) -> Result<Self, Error> {
        Ok(EntitlementStore::Redis(
            RedisEntitlementStore::new(url, op_timeout).await?,
        ))
    }

    /// Fetch the record for `user_id`; `None` means the user has never been
    /// written, which readers treat as the implicit free/0 default.
    pub async fn get(&self, user_id: &str) -> Result<Option<EntitlementRecord>, Error> {
        match self {
            EntitlementStore::Memory(store) => Ok(store.get(user_id)),
            EntitlementStore::Redis(store) => store.get(user_id).await,
        }
    }

    /// Idempotent activation upsert: set the tier and reset `scan_count` to 0
    /// so a fresh paid period starts with full quota semantics.
    pub async fn apply_activation(
        &self,
        user_id: &str,
        status: SubscriptionStatus,
    ) -> Result<(), Error> {
        match self {
            EntitlementStore::Memory(store) => {
                store.apply_activation(user_id, status);
                Ok(())
            }
            EntitlementStore::Redis(store) => store.apply_activation(user_id, status).await,
        }
    }

    /// Idempotent downgrade to `free`. Leaves `scan_count` untouched: whatever
    /// quota the user had consumed before subscribing is still consumed.
    pub async fn apply_cancellation(&self, user_id: &str) -> Result<(), Error> {
        match self {
            EntitlementStore::Memory(store) => {
                store.apply_cancellation(user_id);
                Ok(())
            }
            EntitlementStore::Redis(store) => store.apply_cancellation(user_id).await,
        }
    }

    /// Increment `scan_count` for a free-tier user; a no-op that still
    /// succeeds for paid tiers, so callers never branch on tier first.
    pub async fn increment_scan_count(&self, user_id: &str) -> Result<(), Error> {
        match self {
            EntitlementStore::Memory(store) => {
                store.increment_scan_count(user_id);
                Ok(())
            }
            EntitlementStore::Redis(store) => store.increment_scan_count(user_id).await,
        }
    }

    /// Atomic check-and-consume against the free-tier cap. A denial consumes
    /// nothing; a grant consumes exactly one, even under concurrent calls for
    /// the same user.
    pub async fn consume_free_scan(
        &self,
        user_id: &str,
        cap: u32,
    ) -> Result<ScanConsumption, Error> {
        match self {
            EntitlementStore::Memory(store) => Ok(store.consume_free_scan(user_id, cap)),
            EntitlementStore::Redis(store) => store.consume_free_scan(user_id, cap).await,
        }
    }

    /// Remember which provider customer id belongs to which user, so a later
    /// cancellation event (which only carries the customer id) can be
    /// attributed.
    pub async fn record_customer(&self, customer_id: &str, user_id: &str) -> Result<(), Error> {
        match self {
            EntitlementStore::Memory(store) => {
                store.record_customer(customer_id, user_id);
                Ok(())
            }
            EntitlementStore::Redis(store) => store.record_customer(customer_id, user_id).await,
        }
    }

    pub async fn lookup_user_by_customer(
        &self,
        customer_id: &str,
    ) -> Result<Option<String>, Error> {
        match self {
            EntitlementStore::Memory(store) => Ok(store.lookup_user_by_customer(customer_id)),
            EntitlementStore::Redis(store) => store.lookup_user_by_customer(customer_id).await,
        }
    }
}

#[derive(Clone, Default)]
pub struct MemoryEntitlementStore {
    records: Arc<DashMap<String, EntitlementRecord>>,
    customers: Arc<DashMap<String, String>>,
}

impl MemoryEntitlementStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn get(&self, user_id: &str) -> Option<EntitlementRecord> {
        self.records.get(user_id).map(|r| r.clone())
    }

    fn apply_activation(&self, user_id: &str, status: SubscriptionStatus) {
        // The entry holds the shard lock, so the whole upsert is atomic per key
        match self.records.entry(user_id.to_string()) {
            Entry::Occupied(mut occupied) => {
                let record = occupied.get_mut();
                record.subscription_status = status;
                record.scan_count = 0;
                record.updated_at = Utc::now();
            }
            Entry::Vacant(vacant) => {
                vacant.insert(EntitlementRecord {
                    user_id: user_id.to_string(),
                    subscription_status: status,
                    scan_count: 0,
                    updated_at: Utc::now(),
                });
            }
        }
    }

    fn apply_cancellation(&self, user_id: &str) {
        match self.records.entry(user_id.to_string()) {
            Entry::Occupied(mut occupied) => {
                let record = occupied.get_mut();
                record.subscription_status = SubscriptionStatus::Free;
                record.updated_at = Utc::now();
            }
            Entry::Vacant(vacant) => {
                vacant.insert(EntitlementRecord::default_for(user_id));
            }
        }
    }

    fn increment_scan_count(&self, user_id: &str) {
        match self.records.entry(user_id.to_string()) {
            Entry::Occupied(mut occupied) => {
                let record = occupied.get_mut();
                if !record.subscription_status.is_paid() {
                    record.scan_count += 1;
                    record.updated_at = Utc::now();
                }
            }
            Entry::Vacant(vacant) => {
                let mut record = EntitlementRecord::default_for(user_id);
                record.scan_count = 1;
                vacant.insert(record);
            }
        }
    }

    fn consume_free_scan(&self, user_id: &str, cap: u32) -> ScanConsumption {
        match self.records.entry(user_id.to_string()) {
            Entry::Occupied(mut occupied) => {
                let record = occupied.get_mut();
                if record.subscription_status.is_paid() {
                    ScanConsumption::PaidTier {
                        subscription_status: record.subscription_status,
                    }
                } else if record.scan_count < cap {
                    record.scan_count += 1;
                    record.updated_at = Utc::now();
                    ScanConsumption::Granted {
                        remaining: cap - record.scan_count,
                    }
                } else {
                    ScanConsumption::Exhausted
                }
            }
            Entry::Vacant(vacant) => {
                if cap == 0 {
                    return ScanConsumption::Exhausted;
                }
                let mut record = EntitlementRecord::default_for(user_id);
                record.scan_count = 1;
                vacant.insert(record);
                ScanConsumption::Granted { remaining: cap - 1 }
            }
        }
    }

    fn record_customer(&self, customer_id: &str, user_id: &str) {
        self.customers
            .insert(customer_id.to_string(), user_id.to_string());
    }

    fn lookup_user_by_customer(&self, customer_id: &str) -> Option<String> {
        self.customers.get(customer_id).map(|u| u.clone())
    }
}

#[derive(Clone)]
pub struct RedisEntitlementStore {
    conn: redis::aio::MultiplexedConnection,
    op_timeout: Duration,
    consume_script: Arc<Script>,
    increment_script: Arc<Script>,
}

fn entitlement_key(user_id: &str) -> String {
    format!("entitlement:{user_id}")
}

fn customer_key(customer_id: &str) -> String {
    format!("customer:{customer_id}")
}

impl RedisEntitlementStore {
    pub async fn new(url: &str, op_timeout: Duration) -> Result<Self, Error> {
        let client = redis::Client::open(url).map_err(|e| {
            Error::new(ErrorDetails::StorageUnavailable {
                message: format!("Failed to create Redis client: {e}"),
            })
        })?;
        let conn = client
            .get_multiplexed_tokio_connection()
            .await
            .map_err(|e| {
                Error::new(ErrorDetails::StorageUnavailable {
                    message: format!("Failed to connect to Redis: {e}"),
                })
            })?;
        info!("Connected to Redis for entitlement storage");

        // Branch on tier inside Redis so check-and-consume is one atomic step.
        // The paid reply encodes the tier (1 monthly, 2 annual) so the caller
        // gets the status the consume actually saw.
        let consume_script = Script::new(
            r#"
            local status = redis.call('HGET', KEYS[1], 'status')
            if status == 'annual' then
                return {2, 2}
            elseif status == 'monthly' then
                return {2, 1}
            end
            local cap = tonumber(ARGV[1])
            local count = redis.call('HGET', KEYS[1], 'scan_count')
            if count then count = tonumber(count) else count = 0 end
            if count < cap then
                count = redis.call('HINCRBY', KEYS[1], 'scan_count', 1)
                if not status then
                    redis.call('HSET', KEYS[1], 'status', 'free')
                end
                redis.call('HSET', KEYS[1], 'updated_at', ARGV[2])
                return {1, cap - count}
            else
                return {0, 0}
            end
            "#,
        );

        let increment_script = Script::new(
            r#"
            local status = redis.call('HGET', KEYS[1], 'status')
            if status == 'monthly' or status == 'annual' then
                return redis.status_reply('OK')
            end
            if not status then
                redis.call('HSET', KEYS[1], 'status', 'free')
            end
            redis.call('HINCRBY', KEYS[1], 'scan_count', 1)
            redis.call('HSET', KEYS[1], 'updated_at', ARGV[1])
            return redis.status_reply('OK')
            "#,
        );

        Ok(Self {
            conn,
            op_timeout,
            consume_script: Arc::new(consume_script),
            increment_script: Arc::new(increment_script),
        })
    }

    async fn run<T, F>(&self, operation: &str, fut: F) -> Result<T, Error>
    where
        F: Future<Output = redis::RedisResult<T>>,
    {
        match timeout(self.op_timeout, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(Error::new(ErrorDetails::StorageUnavailable {
                message: format!("{operation}: {e}"),
            })),
            Err(_) => Err(Error::new(ErrorDetails::StorageUnavailable {
                message: format!(
                    "{operation}: timed out after {}ms",
                    self.op_timeout.as_millis()
                ),
            })),
        }
    }

    async fn get(&self, user_id: &str) -> Result<Option<EntitlementRecord>, Error> {
        let mut conn = self.conn.clone();
        let key = entitlement_key(user_id);
        let fields: std::collections::HashMap<String, String> =
            self.run("entitlement get", conn.hgetall(&key)).await?;

        if fields.is_empty() {
            return Ok(None);
        }

        let subscription_status = fields
            .get("status")
            .and_then(|s| SubscriptionStatus::from_str_opt(s))
            .unwrap_or(SubscriptionStatus::Free);
        let scan_count = fields
            .get("scan_count")
            .and_then(|c| c.parse().ok())
            .unwrap_or(0);
        let updated_at = fields
            .get("updated_at")
            .and_then(|t| chrono::DateTime::parse_from_rfc3339(t).ok())
            .map(|t| t.with_timezone(&Utc))
            .unwrap_or_else(Utc::now);

        Ok(Some(EntitlementRecord {
            user_id: user_id.to_string(),
            subscription_status,
            scan_count,
            updated_at,
        }))
    }

    async fn apply_activation(
        &self,
        user_id: &str,
        status: SubscriptionStatus,
    ) -> Result<(), Error> {
        let mut conn = self.conn.clone();
        let key = entitlement_key(user_id);
        // One HSET with all fields: a single atomic upsert, last writer wins
        let items: [(&str, String); 3] = [
            ("status", status.as_str().to_string()),
            ("scan_count", "0".to_string()),
            ("updated_at", Utc::now().to_rfc3339()),
        ];
        self.run("entitlement activation", conn.hset_multiple(&key, &items))
            .await
    }

    async fn apply_cancellation(&self, user_id: &str) -> Result<(), Error> {
        let mut conn = self.conn.clone();
        let key = entitlement_key(user_id);
        let items: [(&str, String); 2] = [
            ("status", SubscriptionStatus::Free.as_str().to_string()),
            ("updated_at", Utc::now().to_rfc3339()),
        ];
        self.run("entitlement cancellation", conn.hset_multiple(&key, &items))
            .await
    }

    async fn increment_scan_count(&self, user_id: &str) -> Result<(), Error> {
        let mut conn = self.conn.clone();
        let key = entitlement_key(user_id);
        let result: Result<(), redis::RedisError> = match timeout(
            self.op_timeout,
            self.increment_script
                .key(&key)
                .arg(Utc::now().to_rfc3339())
                .invoke_async(&mut conn),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => return Err(self.timeout_error("scan count increment")),
        };
        result.map_err(|e| {
            Error::new(ErrorDetails::StorageUnavailable {
                message: format!("scan count increment: {e}"),
            })
        })
    }

    async fn consume_free_scan(&self, user_id: &str, cap: u32) -> Result<ScanConsumption, Error> {
        let mut conn = self.conn.clone();
        let key = entitlement_key(user_id);
        let result: Result<Vec<i64>, redis::RedisError> = match timeout(
            self.op_timeout,
            self.consume_script
                .key(&key)
                .arg(cap)
                .arg(Utc::now().to_rfc3339())
                .invoke_async(&mut conn),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => return Err(self.timeout_error("free scan consume")),
        };
        let result = result.map_err(|e| {
            Error::new(ErrorDetails::StorageUnavailable {
                message: format!("free scan consume: {e}"),
            })
        })?;

        match result.first().copied() {
            Some(2) => Ok(ScanConsumption::PaidTier {
                subscription_status: if result.get(1).copied() == Some(2) {
                    SubscriptionStatus::Annual
                } else {
                    SubscriptionStatus::Monthly
                },
            }),
            Some(1) => Ok(ScanConsumption::Granted {
                remaining: result.get(1).copied().unwrap_or(0).max(0) as u32,
            }),
            Some(0) => Ok(ScanConsumption::Exhausted),
            _ => Err(Error::new(ErrorDetails::InternalError {
                message: "Invalid Redis response for free scan consume".to_string(),
            })),
        }
    }

    fn timeout_error(&self, operation: &str) -> Error {
        Error::new(ErrorDetails::StorageUnavailable {
            message: format!(
                "{operation}: timed out after {}ms",
                self.op_timeout.as_millis()
            ),
        })
    }

    async fn record_customer(&self, customer_id: &str, user_id: &str) -> Result<(), Error> {
        let mut conn = self.conn.clone();
        let key = customer_key(customer_id);
        self.run("customer directory write", conn.set(&key, user_id))
            .await
    }

    async fn lookup_user_by_customer(&self, customer_id: &str) -> Result<Option<String>, Error> {
        let mut conn = self.conn.clone();
        let key = customer_key(customer_id);
        self.run("customer directory lookup", conn.get(&key)).await
    }
}
