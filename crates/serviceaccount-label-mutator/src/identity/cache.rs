//! Deadline and short-lived memoization around an [`IdentityResolver`].
use std::{
    collections::HashMap,
    sync::{Mutex, PoisonError},
    time::{Duration, Instant},
};

use async_trait::async_trait;
use tracing::{debug, instrument};

use crate::identity::{IdentityResolver, ResolveError};

pub const DEFAULT_LOOKUP_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(5 * 60);

#[derive(Debug)]
struct CachedClientId {
    client_id: String,
    resolved_at: Instant,
}

/// Bounds every lookup of the wrapped resolver by `timeout` and remembers
/// successful lookups for `ttl`. A zero `ttl` disables memoization.
///
/// Failed lookups are never remembered.
#[derive(Debug)]
pub struct CachingResolver<R> {
    inner: R,
    timeout: Duration,
    ttl: Duration,
    entries: Mutex<HashMap<String, CachedClientId>>,
}

impl<R> CachingResolver<R>
where
    R: IdentityResolver,
{
    pub fn new(inner: R, timeout: Duration, ttl: Duration) -> Self {
        Self {
            inner,
            timeout,
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn cached(&self, name: &str) -> Option<String> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);

        match entries.get(name) {
            Some(entry) if entry.resolved_at.elapsed() < self.ttl => Some(entry.client_id.clone()),
            Some(_) => {
                entries.remove(name);
                None
            }
            None => None,
        }
    }

    fn remember(&self, name: &str, client_id: &str) {
        if self.ttl.is_zero() {
            return;
        }

        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.retain(|_, entry| entry.resolved_at.elapsed() < self.ttl);
        entries.insert(name.to_owned(), CachedClientId {
            client_id: client_id.to_owned(),
            resolved_at: Instant::now(),
        });
    }
}

#[async_trait]
impl<R> IdentityResolver for CachingResolver<R>
where
    R: IdentityResolver,
{
    #[instrument(skip(self))]
    async fn resolve_client_id(&self, name: &str) -> Result<String, ResolveError> {
        if let Some(client_id) = self.cached(name) {
            debug!("using remembered client id");
            return Ok(client_id);
        }

        let client_id = tokio::time::timeout(self.timeout, self.inner.resolve_client_id(name))
            .await
            .map_err(|_| ResolveError::Timeout {
                name: name.to_owned(),
                timeout: self.timeout,
            })??;

        self.remember(name, &client_id);
        Ok(client_id)
    }
}
