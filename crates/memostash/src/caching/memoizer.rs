use std::future::Future;
use std::sync::Arc;

use crate::config::Config;

use super::{
    AlwaysFresh, ArgumentSnapshot, CacheEntry, CacheError, CacheKey, CallArgs, EntryStore,
    LockManager, MemoError, PayloadFormat, Producer, ProducerIdentity, StalenessDecider,
};

/// Where in the protocol an entry is looked up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    /// The optimistic lookup before taking the key lock.
    Initial,
    /// The lookup after taking the key lock, finding results of concurrent computations.
    Recheck,
}

/// Memoizes the results of producers in an [`EntryStore`].
///
/// Each call is fingerprinted, looked up and validated by the [`StalenessDecider`]. On a miss,
/// or when the entry is stale, the key lock is taken, the store is checked again, and only then
/// the producer runs. The result is encoded with the [`PayloadFormat`] and written back.
///
/// Errors of the producer are returned to the caller verbatim, and nothing is stored for them.
/// Failures of the memoization machinery itself are converted into the caller's error type via
/// [`MemoError`].
#[derive(Debug, Clone)]
pub struct Memoizer<F> {
    store: EntryStore,
    locks: LockManager,
    decider: Arc<dyn StalenessDecider>,
    format: F,
    force_refresh: bool,
}

impl<F: PayloadFormat> Memoizer<F> {
    /// Creates a memoizer storing results in `format` below the configured store root.
    ///
    /// Entries never go stale unless a decider is set via [`with_decider`](Self::with_decider).
    pub fn new(config: &Config, format: F) -> Result<Self, CacheError> {
        let store = EntryStore::open(&config.store_root)?;
        let locks = LockManager::new(
            store.locks_dir(),
            config.lock_timeout,
            config.lock_poll_interval,
        );

        Ok(Self {
            store,
            locks,
            decider: Arc::new(AlwaysFresh),
            format,
            force_refresh: config.force_refresh,
        })
    }

    pub fn with_decider(mut self, decider: impl StalenessDecider + 'static) -> Self {
        self.decider = Arc::new(decider);
        self
    }

    /// Ignores existing entries, always recomputing and overwriting them.
    pub fn with_force_refresh(mut self, force_refresh: bool) -> Self {
        self.force_refresh = force_refresh;
        self
    }

    pub fn store(&self) -> &EntryStore {
        &self.store
    }

    /// Calls `producer` with `call`, or returns the memoized result of an earlier equivalent call.
    ///
    /// `compute` receives the bound arguments and is only invoked if there is no valid entry.
    pub async fn call<E, C, Fut>(
        &self,
        producer: &Producer,
        call: CallArgs,
        compute: C,
    ) -> Result<F::Item, E>
    where
        E: From<MemoError>,
        C: FnOnce(ArgumentSnapshot) -> Fut,
        Fut: Future<Output = Result<F::Item, E>>,
    {
        if let Err(e) = producer.check(&call) {
            return Err(MemoError::unkeyed(producer.identity(), call.render(), e).into());
        }
        let arguments = producer.bind_checked(call);

        self.call_with_snapshot(producer.identity(), arguments, compute)
            .await
    }

    /// Like [`call`](Self::call), but with arguments that are already bound.
    #[tracing::instrument(skip_all, fields(producer = %identity))]
    pub async fn call_with_snapshot<E, C, Fut>(
        &self,
        identity: &ProducerIdentity,
        arguments: ArgumentSnapshot,
        compute: C,
    ) -> Result<F::Item, E>
    where
        E: From<MemoError>,
        C: FnOnce(ArgumentSnapshot) -> Fut,
        Fut: Future<Output = Result<F::Item, E>>,
    {
        let key = CacheKey::fingerprint(identity, &arguments);
        let fail = |error| E::from(MemoError::new(&key, &arguments, error));
        let producer = identity.name();

        metric!(counter("memo.access") += 1, "producer" => producer);

        if !self.force_refresh {
            if let Some(item) = self
                .lookup_valid(&key, &arguments, Stage::Initial)
                .await
                .map_err(fail)?
            {
                return Ok(item);
            }
        }

        let _lock = self.locks.acquire(&key).await.map_err(fail)?;

        if !self.force_refresh {
            if let Some(item) = self
                .lookup_valid(&key, &arguments, Stage::Recheck)
                .await
                .map_err(fail)?
            {
                return Ok(item);
            }
        }

        // the state has to be captured before computing, so that changes to the inputs during
        // the computation make the entry stale
        let state = match self.decider.capture_state(&arguments) {
            Ok(state) => Some(state),
            Err(e) => {
                tracing::warn!(
                    error = &e as &dyn std::error::Error,
                    "Failed to capture decider state, the result will not be stored",
                );
                None
            }
        };

        tracing::trace!("Computing {}", key.cache_path());
        metric!(counter("memo.computation") += 1, "producer" => producer);
        let item = compute(arguments.clone()).await?;

        if let Some(state) = state {
            let payload = self
                .format
                .encode(&item)
                .map_err(|e| fail(CacheError::PayloadEncoding(e)))?;
            let entry = CacheEntry::new(&key, &arguments, state, payload);

            let store = self.store.clone();
            let write_key = key.clone();
            match run_blocking(move || store.write(&write_key, &entry)).await {
                Ok(()) => {}
                // the entry could not be read back, so it is not written at all
                Err(e @ CacheError::PayloadEncoding(_)) => {
                    tracing::warn!(
                        error = &e as &dyn std::error::Error,
                        key = %key,
                        "Computed result cannot be stored",
                    );
                }
                Err(e) => {
                    tracing::error!(
                        error = &e as &dyn std::error::Error,
                        key = %key,
                        "Failed to store computed result",
                    );
                }
            }
        }

        Ok(item)
    }

    /// Looks up the entry for `key` and decodes it, unless it is missing or stale.
    async fn lookup_valid(
        &self,
        key: &CacheKey,
        arguments: &ArgumentSnapshot,
        stage: Stage,
    ) -> Result<Option<F::Item>, CacheError> {
        let producer = key.producer().name();

        let store = self.store.clone();
        let lookup_key = key.clone();
        let Some(entry) = run_blocking(move || store.lookup(&lookup_key)).await? else {
            if stage == Stage::Initial {
                metric!(counter("memo.miss") += 1, "producer" => producer);
            }
            tracing::trace!(?stage, "No entry for {}", key.cache_path());
            return Ok(None);
        };

        match self.decider.is_entry_stale(arguments, &entry) {
            Ok(false) => {}
            Ok(true) => {
                if stage == Stage::Initial {
                    metric!(counter("memo.stale") += 1, "producer" => producer);
                }
                tracing::trace!(?stage, "Entry {} is stale", key.cache_path());
                return Ok(None);
            }
            Err(e) => {
                tracing::warn!(
                    error = &e as &dyn std::error::Error,
                    "Failed to validate entry, recomputing",
                );
                return Ok(None);
            }
        }

        let item = self.format.decode(entry.payload()).map_err(|e| {
            CacheError::corrupt(
                self.store.entry_path(key),
                format!("failed to decode payload: {e}"),
            )
        })?;

        match stage {
            Stage::Initial => metric!(counter("memo.hit") += 1, "producer" => producer),
            Stage::Recheck => metric!(counter("memo.recheck.hit") += 1, "producer" => producer),
        }
        tracing::trace!(?stage, "Using entry {}", key.cache_path());

        Ok(Some(item))
    }

    /// Removes the entry of calling `producer` with `call`, returning whether there was one.
    pub async fn uncache(&self, producer: &Producer, call: CallArgs) -> Result<bool, MemoError> {
        if let Err(e) = producer.check(&call) {
            return Err(MemoError::unkeyed(producer.identity(), call.render(), e));
        }
        let arguments = producer.bind_checked(call);

        self.uncache_snapshot(producer.identity(), &arguments).await
    }

    /// Removes the entry of calling `identity` with already bound `arguments`.
    pub async fn uncache_snapshot(
        &self,
        identity: &ProducerIdentity,
        arguments: &ArgumentSnapshot,
    ) -> Result<bool, MemoError> {
        let key = CacheKey::fingerprint(identity, arguments);
        let fail = |error| MemoError::new(&key, arguments, error);

        let _lock = self.locks.acquire(&key).await.map_err(fail)?;
        let removed = self.store.remove(&key).map_err(fail)?;
        tracing::debug!("Uncached {} (existed: {removed})", key.cache_path());

        Ok(removed)
    }

    /// Removes all entries of `identity`, returning how many there were.
    ///
    /// Each entry is removed under its key lock, waiting for computations in flight.
    pub async fn uncache_producer(&self, identity: &ProducerIdentity) -> Result<usize, MemoError> {
        let store = self.store.clone();
        let locks = self.locks.clone();
        let producer = identity.clone();

        run_blocking(move || store.remove_producer(&producer, &locks))
            .await
            .map_err(|e| MemoError::unkeyed(identity, "*", e))
    }
}

/// Runs blocking store I/O outside of the async runtime.
async fn run_blocking<T, F>(f: F) -> Result<T, CacheError>
where
    F: FnOnce() -> Result<T, CacheError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f).await?
}
