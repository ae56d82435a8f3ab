use crate::config::RedisConfig;
use crate::error::MfResult;
use crate::models::{EntityKind, IdentityBinding};
use async_trait::async_trait;
use parking_lot::Mutex;
use redis::AsyncCommands;
use std::collections::HashMap;
use tracing::debug;

/// Shared mirror of the identity index for other processes.
///
/// The snapshot stays authoritative; everything here is republished from
/// it, so writes are idempotent overwrites.
#[async_trait]
pub trait IdentityStore: Send + Sync {
    /// Adds or overwrites bindings, leaving others in place.
    async fn publish(&self, kind: EntityKind, bindings: &[IdentityBinding]) -> MfResult<()>;

    /// Drops every binding of `kind` and installs `bindings` instead.
    async fn replace_all(&self, kind: EntityKind, bindings: &[IdentityBinding]) -> MfResult<()>;

    async fn count(&self, kind: EntityKind) -> MfResult<usize>;

    async fn lookup(&self, kind: EntityKind, external_id: &str) -> MfResult<Option<usize>>;

    async fn ping(&self) -> MfResult<()>;
}

/// Two hashes per kind: `{prefix}:{kind}:by_id` maps id to index and
/// `{prefix}:{kind}:by_index` maps back.
pub struct RedisIdentityStore {
    client: redis::Client,
    key_prefix: String,
}

impl RedisIdentityStore {
    pub fn new(config: &RedisConfig) -> MfResult<Self> {
        Ok(Self {
            client: redis::Client::open(config.url.as_str())?,
            key_prefix: config.key_prefix.clone(),
        })
    }

    fn by_id_key(&self, kind: EntityKind) -> String {
        format!("{}:{}:by_id", self.key_prefix, kind)
    }

    fn by_index_key(&self, kind: EntityKind) -> String {
        format!("{}:{}:by_index", self.key_prefix, kind)
    }

    fn fields(bindings: &[IdentityBinding]) -> (Vec<(&str, usize)>, Vec<(usize, &str)>) {
        bindings
            .iter()
            .map(|b| {
                (
                    (b.external_id.as_str(), b.index),
                    (b.index, b.external_id.as_str()),
                )
            })
            .unzip()
    }

    async fn write(
        &self,
        kind: EntityKind,
        bindings: &[IdentityBinding],
        clear_first: bool,
    ) -> MfResult<()> {
        let by_id = self.by_id_key(kind);
        let by_index = self.by_index_key(kind);
        let (forward, reverse) = Self::fields(bindings);

        let mut pipe = redis::pipe();
        pipe.atomic();
        if clear_first {
            pipe.del(&by_id).ignore().del(&by_index).ignore();
        }
        // HSET with no fields is a syntax error
        if !bindings.is_empty() {
            pipe.hset_multiple(&by_id, &forward)
                .ignore()
                .hset_multiple(&by_index, &reverse)
                .ignore();
        }

        let mut conn = self.client.get_async_connection().await?;
        let _: () = pipe.query_async(&mut conn).await?;

        debug!(%kind, count = bindings.len(), clear_first, "Published identity bindings");
        Ok(())
    }
}

#[async_trait]
impl IdentityStore for RedisIdentityStore {
    async fn publish(&self, kind: EntityKind, bindings: &[IdentityBinding]) -> MfResult<()> {
        if bindings.is_empty() {
            return Ok(());
        }
        self.write(kind, bindings, false).await
    }

    async fn replace_all(&self, kind: EntityKind, bindings: &[IdentityBinding]) -> MfResult<()> {
        self.write(kind, bindings, true).await
    }

    async fn count(&self, kind: EntityKind) -> MfResult<usize> {
        let mut conn = self.client.get_async_connection().await?;
        let count: usize = conn.hlen(self.by_id_key(kind)).await?;
        Ok(count)
    }

    async fn lookup(&self, kind: EntityKind, external_id: &str) -> MfResult<Option<usize>> {
        let mut conn = self.client.get_async_connection().await?;
        let index: Option<usize> = conn.hget(self.by_id_key(kind), external_id).await?;
        Ok(index)
    }

    async fn ping(&self) -> MfResult<()> {
        let mut conn = self.client.get_async_connection().await?;
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct InMemoryIdentityStore {
    bindings: Mutex<HashMap<EntityKind, HashMap<String, usize>>>,
}

impl InMemoryIdentityStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl IdentityStore for InMemoryIdentityStore {
    async fn publish(&self, kind: EntityKind, bindings: &[IdentityBinding]) -> MfResult<()> {
        let mut all = self.bindings.lock();
        let side = all.entry(kind).or_default();
        for binding in bindings {
            side.insert(binding.external_id.clone(), binding.index);
        }
        Ok(())
    }

    async fn replace_all(&self, kind: EntityKind, bindings: &[IdentityBinding]) -> MfResult<()> {
        let side = bindings
            .iter()
            .map(|b| (b.external_id.clone(), b.index))
            .collect();
        self.bindings.lock().insert(kind, side);
        Ok(())
    }

    async fn count(&self, kind: EntityKind) -> MfResult<usize> {
        Ok(self.bindings.lock().get(&kind).map_or(0, |side| side.len()))
    }

    async fn lookup(&self, kind: EntityKind, external_id: &str) -> MfResult<Option<usize>> {
        Ok(self
            .bindings
            .lock()
            .get(&kind)
            .and_then(|side| side.get(external_id).copied()))
    }

    async fn ping(&self) -> MfResult<()> {
        Ok(())
    }
}
