//! Storing and retrieving values, with a short lived cache of recent results.

use std::collections::{HashMap, VecDeque};
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::Bytes;
use futures::stream::{self, StreamExt};
use lru::LruCache;
use parking_lot::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::common::{DhtRecord, Message, MessageType, PeerId};
use crate::events::{abortable, spawn_stream, EventStream, QueryEvent};
use crate::query::{QueryContext, QueryManager, QueryOptions};
use crate::record::{Selectors, Validators};
use crate::routing::PeerRouting;
use crate::rpc::Rpc;
use crate::store::{record_key, Datastore};
use crate::{Error, Result};

/// How long a fetched or stored value is served from the cache.
pub const MAX_CACHE_AGE: Duration = Duration::from_secs(5 * 60);
/// How often expired cache entries are purged.
pub const CACHE_SWEEP_INTERVAL: Duration = Duration::from_secs(60);
pub const MAX_CACHE_SIZE: usize = 1000;
/// Number of recent response times a peer's timeout is derived from.
pub const TIMEOUT_WINDOW: usize = 10;
pub const MIN_TIMEOUT: Duration = Duration::from_secs(1);
pub const MAX_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
struct CacheEntry {
    record: DhtRecord,
    expires: Instant,
}

#[derive(Clone)]
pub struct ContentFetching {
    inner: Arc<Inner>,
}

struct Inner {
    local: PeerId,
    datastore: Arc<dyn Datastore>,
    datastore_prefix: String,
    validators: Validators,
    selectors: Selectors,
    peer_routing: PeerRouting,
    query_manager: QueryManager,
    rpc: Rpc,
    alpha: usize,
    /// Read with `peek`, so eviction is oldest inserted first.
    cache: Mutex<LruCache<String, CacheEntry>>,
    response_times: Mutex<HashMap<PeerId, VecDeque<Duration>>>,
    sweeper: Mutex<Option<CancellationToken>>,
}

impl ContentFetching {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        rpc: Rpc,
        datastore: Arc<dyn Datastore>,
        datastore_prefix: String,
        validators: Validators,
        selectors: Selectors,
        peer_routing: PeerRouting,
        query_manager: QueryManager,
        alpha: usize,
    ) -> Self {
        let capacity = NonZeroUsize::new(MAX_CACHE_SIZE).unwrap_or(NonZeroUsize::MIN);

        Self {
            inner: Arc::new(Inner {
                local: rpc.local().clone(),
                datastore,
                datastore_prefix,
                validators,
                selectors,
                peer_routing,
                query_manager,
                rpc,
                alpha: alpha.max(1),
                cache: Mutex::new(LruCache::new(capacity)),
                response_times: Mutex::new(HashMap::new()),
                sweeper: Mutex::new(None),
            }),
        }
    }

    // === Lifecycle ===

    /// Start sweeping expired cache entries.
    pub fn start(&self) {
        let mut sweeper = self.inner.sweeper.lock();

        if sweeper.is_some() {
            return;
        }

        let token = CancellationToken::new();
        *sweeper = Some(token.clone());

        let this = self.clone();

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(CACHE_SWEEP_INTERVAL);

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = interval.tick() => this.sweep_cache(),
                }
            }
        });
    }

    /// Stop the sweeper and forget cached values and response times.
    pub fn stop(&self) {
        if let Some(token) = self.inner.sweeper.lock().take() {
            token.cancel();
        }

        self.inner.cache.lock().clear();
        self.inner.response_times.lock().clear();
    }

    // === Cache ===

    fn cache_key(key: &[u8]) -> String {
        STANDARD.encode(key)
    }

    fn cache_record(&self, record: DhtRecord) {
        let entry = CacheEntry {
            expires: Instant::now() + MAX_CACHE_AGE,
            record,
        };

        self.inner
            .cache
            .lock()
            .put(Self::cache_key(entry.record.key()), entry);
    }

    /// The unexpired cached record for `key`.
    pub fn cached(&self, key: &[u8]) -> Option<DhtRecord> {
        let cache_key = Self::cache_key(key);
        let mut cache = self.inner.cache.lock();

        match cache.peek(&cache_key) {
            Some(entry) if entry.expires > Instant::now() => Some(entry.record.clone()),
            Some(_) => {
                cache.pop(&cache_key);
                None
            }
            None => None,
        }
    }

    pub fn cache_len(&self) -> usize {
        self.inner.cache.lock().len()
    }

    fn sweep_cache(&self) {
        let now = Instant::now();
        let mut cache = self.inner.cache.lock();

        let expired: Vec<String> = cache
            .iter()
            .filter(|(_, entry)| entry.expires <= now)
            .map(|(key, _)| key.clone())
            .collect();

        for key in &expired {
            cache.pop(key);
        }

        if !expired.is_empty() {
            trace!(expired = expired.len(), "Swept value cache");
        }
    }

    // === Timeouts ===

    fn update_response_time(&self, peer: &PeerId, elapsed: Duration) {
        let mut response_times = self.inner.response_times.lock();
        let window = response_times.entry(peer.clone()).or_default();

        window.push_back(elapsed);

        while window.len() > TIMEOUT_WINDOW {
            window.pop_front();
        }
    }

    /// Mean plus two standard deviations of the peer's recent response times,
    /// within [MIN_TIMEOUT] and [MAX_TIMEOUT].
    pub fn get_peer_timeout(&self, peer: &PeerId) -> Duration {
        let response_times = self.inner.response_times.lock();

        let Some(window) = response_times.get(peer).filter(|w| !w.is_empty()) else {
            return MAX_TIMEOUT;
        };

        let samples: Vec<f64> = window.iter().map(|d| d.as_secs_f64()).collect();
        let count = samples.len() as f64;
        let mean = samples.iter().sum::<f64>() / count;
        let variance = samples.iter().map(|s| (s - mean).powi(2)).sum::<f64>() / count;

        let timeout = Duration::from_secs_f64(mean + 2.0 * variance.sqrt());

        timeout.clamp(MIN_TIMEOUT, MAX_TIMEOUT)
    }

    // === Local records ===

    /// Read, decode and validate the record stored locally under `key`.
    pub fn get_local(&self, key: &[u8]) -> Result<DhtRecord> {
        let stored = self
            .inner
            .datastore
            .get(&record_key(&self.inner.datastore_prefix, key))?
            .ok_or_else(|| Error::NotFound("no local record".to_string()))?;

        let record = DhtRecord::deserialize(&stored)?;
        self.inner.validators.verify_record(&record)?;

        Ok(record)
    }

    fn store_local(&self, record: &DhtRecord) -> Result<()> {
        self.inner.datastore.put(
            &record_key(&self.inner.datastore_prefix, record.key()),
            record.serialize()?.into(),
        )
    }

    // === Public Methods ===

    /// Store a value locally and on the closest peers to its key.
    pub fn put(&self, key: Bytes, value: Bytes, options: &QueryOptions) -> Result<EventStream> {
        if options.signal.is_cancelled() {
            return Err(Error::Aborted);
        }

        let record = DhtRecord::new(key.clone(), value);
        self.store_local(&record)?;
        self.cache_record(record.clone());

        let closest = self.inner.peer_routing.get_closest_peers(key, options)?;
        let rpc = self.inner.rpc.clone();
        let signal = options.signal.clone();

        let events = closest
            .map(move |event| {
                let rpc = rpc.clone();
                let record = record.clone();
                let signal = signal.clone();

                async move {
                    let peer = match event {
                        QueryEvent::FinalPeer { peer, .. } => peer,
                        event => return vec![event],
                    };

                    let message = Message::new(MessageType::PutValue, record.key().clone())
                        .with_record(record.clone());
                    let mut responses = rpc.send_request(&peer.id, message, &signal, None);
                    let mut events = Vec::new();

                    while let Some(event) = responses.next().await {
                        let acknowledged = match &event {
                            QueryEvent::PeerResponse { record: stored, .. } => Some(
                                stored
                                    .as_ref()
                                    .is_some_and(|stored| stored.value() == record.value()),
                            ),
                            _ => None,
                        };

                        events.push(event);

                        if acknowledged == Some(false) {
                            events.push(QueryEvent::QueryError {
                                from: peer.id.clone(),
                                error: Error::Query("value not put correctly".to_string()),
                            });
                        }
                    }

                    events
                }
            })
            .buffer_unordered(self.inner.alpha)
            .flat_map(stream::iter)
            .boxed();

        Ok(abortable(events, &options.signal))
    }

    /// Get the best value for `key`, correcting peers that returned other values.
    pub fn get(&self, key: Bytes, options: &QueryOptions) -> Result<EventStream> {
        if options.signal.is_cancelled() {
            return Err(Error::Aborted);
        }

        if let Some(record) = self.cached(&key) {
            debug!(?key, "Value cache hit");

            return Ok(stream::iter([QueryEvent::Value {
                from: self.inner.local.clone(),
                value: record.value().clone(),
            }])
            .boxed());
        }

        let mut events = self.get_many(key.clone(), options)?;
        let this = self.clone();

        Ok(spawn_stream(&options.signal, move |sender, signal| async move {
            let mut values: Vec<(PeerId, Bytes)> = Vec::new();

            while let Some(event) = events.next().await {
                if let QueryEvent::Value { from, value } = &event {
                    values.push((from.clone(), value.clone()));
                }

                if !sender.send(event).await {
                    return;
                }
            }

            if values.is_empty() {
                return;
            }

            let candidates: Vec<Bytes> = values.iter().map(|(_, value)| value.clone()).collect();

            let (from, best) = match this.inner.selectors.best_record(&key, &candidates) {
                Ok(index) => values[index].clone(),
                Err(error) => {
                    warn!(?key, ?error, "Failed to select a value");

                    sender
                        .send(QueryEvent::QueryError {
                            from: this.inner.local.clone(),
                            error,
                        })
                        .await;
                    return;
                }
            };

            match this
                .send_correction_record(&key, values, &best, &signal)
                .await
            {
                Ok(corrections) => {
                    for event in corrections {
                        if !sender.send(event).await {
                            return;
                        }
                    }
                }
                Err(error) => {
                    warn!(?key, ?error, "Failed to correct stale records");

                    if !sender
                        .send(QueryEvent::QueryError {
                            from: this.inner.local.clone(),
                            error,
                        })
                        .await
                    {
                        return;
                    }
                }
            }

            this.cache_record(DhtRecord::new(key, best.clone()));

            sender.send(QueryEvent::Value { from, value: best }).await;
        }))
    }

    /// Every value found for `key`: the local one first, then those of the
    /// peers visited by a `GET_VALUE` lookup.
    pub fn get_many(&self, key: Bytes, options: &QueryOptions) -> Result<EventStream> {
        if options.signal.is_cancelled() {
            return Err(Error::Aborted);
        }

        let local = match self.get_local(&key) {
            Ok(record) => Some(QueryEvent::Value {
                from: self.inner.local.clone(),
                value: record.value().clone(),
            }),
            Err(error) => {
                debug!(?key, ?error, "No usable local record");
                None
            }
        };

        let this = self.clone();

        let query_func = move |context: QueryContext| {
            let timeout = context
                .timeout
                .unwrap_or_else(|| this.get_peer_timeout(&context.peer));
            let started = Instant::now();
            let fetching = this.clone();

            trace!(peer = ?context.peer, ?timeout, "Asking for value");

            this.inner
                .peer_routing
                .get_value_or_peers(&context.peer, context.key, &context.signal, Some(timeout))
                .flat_map(move |event| {
                    let value = match &event {
                        QueryEvent::PeerResponse { from, record, .. } => {
                            fetching.update_response_time(from, started.elapsed());

                            record.as_ref().map(|record| QueryEvent::Value {
                                from: from.clone(),
                                value: record.value().clone(),
                            })
                        }
                        _ => None,
                    };

                    stream::iter(std::iter::once(event).chain(value))
                })
                .boxed()
        };

        let network = self.inner.query_manager.run(&key, query_func, options)?;

        Ok(stream::iter(local).chain(network).boxed())
    }

    /// Send `best` to every peer in `values` that returned something else.
    ///
    /// Our own stale record is replaced in the datastore. Fails if a peer did
    /// not confirm the correction.
    pub async fn send_correction_record(
        &self,
        key: &Bytes,
        values: Vec<(PeerId, Bytes)>,
        best: &Bytes,
        signal: &CancellationToken,
    ) -> Result<Vec<QueryEvent>> {
        let fixup = DhtRecord::new(key.clone(), best.clone());

        let corrections = values
            .into_iter()
            .filter(|(_, value)| value != best)
            .map(|(from, _)| self.correct(from, fixup.clone(), signal));

        let results: Vec<Result<Vec<QueryEvent>>> = stream::iter(corrections)
            .buffer_unordered(self.inner.alpha)
            .collect()
            .await;

        let mut events = Vec::new();

        for result in results {
            events.extend(result?);
        }

        Ok(events)
    }

    async fn correct(
        &self,
        peer: PeerId,
        fixup: DhtRecord,
        signal: &CancellationToken,
    ) -> Result<Vec<QueryEvent>> {
        if peer == self.inner.local {
            debug!(key = ?fixup.key(), "Correcting local record");
            self.store_local(&fixup)?;

            return Ok(Vec::new());
        }

        trace!(?peer, "Sending correction record");

        let message =
            Message::new(MessageType::PutValue, fixup.key().clone()).with_record(fixup.clone());
        let mut responses = self.inner.rpc.send_request(&peer, message, signal, None);
        let mut events = Vec::new();
        let mut confirmed = false;

        while let Some(event) = responses.next().await {
            if let QueryEvent::PeerResponse {
                record: Some(stored),
                ..
            } = &event
            {
                confirmed |= stored.value() == fixup.value();
            }

            events.push(event);
        }

        if !confirmed {
            return Err(Error::Query(format!(
                "correction record not stored by {peer}"
            )));
        }

        Ok(events)
    }
}
