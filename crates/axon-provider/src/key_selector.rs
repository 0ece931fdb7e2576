use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::{Notify, RwLock};
use tokio::time::{sleep_until, Instant};

/// One credential belonging to a provider. `allowed_models` empty means "any
/// model this provider serves"; `weight` biases weighted sampling among
/// otherwise-eligible keys (e.g. a key with a higher rate limit gets more
/// traffic).
#[derive(Debug, Clone)]
pub struct KeyRecord {
    pub id: String,
    pub secret: String,
    pub allowed_models: Vec<String>,
    pub weight: f64,
}

impl KeyRecord {
    fn allows(&self, model: &str) -> bool {
        self.allowed_models.is_empty() || self.allowed_models.iter().any(|m| m == model)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnavailableReason {
    RateLimited,
    AuthRejected,
    UpstreamError,
}

#[derive(Debug, Clone)]
enum KeyState {
    Active,
    Unavailable { until: Instant, reason: UnavailableReason },
}

#[derive(Debug, Clone, Copy)]
pub enum SelectError {
    ProviderUnknown,
    NoEligibleKey,
}

type ModelStateKey = (String, String);

/// Bounded-heap recovery queue: tracks when an unavailable key becomes
/// eligible again and flips its state back to `Active` without a polling
/// loop. The same shape backs both the key-level and model-level cooldowns
/// here, and the MCP client reconnect backoff elsewhere.
struct RecoverQueue {
    heap: tokio::sync::Mutex<BinaryHeap<Reverse<(Instant, String)>>>,
    notify: Notify,
}

impl RecoverQueue {
    fn new() -> Self {
        Self {
            heap: tokio::sync::Mutex::new(BinaryHeap::new()),
            notify: Notify::new(),
        }
    }

    async fn push(&self, until: Instant, key: String) {
        self.heap.lock().await.push(Reverse((until, key)));
        self.notify.notify_one();
    }

    fn spawn_recover_task(self: Arc<Self>, states: Arc<RwLock<HashMap<String, KeyState>>>) {
        tokio::spawn(async move {
            loop {
                let next = {
                    let heap = self.heap.lock().await;
                    heap.peek().map(|Reverse((t, k))| (*t, k.clone()))
                };
                match next {
                    None => {
                        self.notify.notified().await;
                        continue;
                    }
                    Some((deadline, _)) => sleep_until(deadline).await,
                }

                let now = Instant::now();
                let mut due = Vec::new();
                {
                    let mut heap = self.heap.lock().await;
                    while let Some(Reverse((t, _))) = heap.peek() {
                        if *t > now {
                            break;
                        }
                        let Reverse((t, key)) = heap.pop().unwrap();
                        due.push((t, key));
                    }
                }
                if due.is_empty() {
                    continue;
                }

                let mut guard = states.write().await;
                for (_t, key) in due {
                    let should_recover = matches!(
                        guard.get(&key),
                        Some(KeyState::Unavailable { until, .. }) if *until <= now
                    );
                    if should_recover {
                        tracing::info!(event = "key_recovered", key = %key, "credential returned to active pool");
                        guard.insert(key, KeyState::Active);
                    }
                }
            }
        });
    }
}

/// Weighted, model-aware key selection for a single gateway instance.
/// Cooldowns (both whole-key and key-for-a-specific-model) recover
/// automatically via a background task; callers never poll.
pub struct KeySelector {
    keys: RwLock<HashMap<String, Vec<KeyRecord>>>,
    states: Arc<RwLock<HashMap<String, KeyState>>>,
    model_states: Arc<RwLock<HashMap<ModelStateKey, (Instant, UnavailableReason)>>>,
    queue: Arc<RecoverQueue>,
    model_queue: Arc<RecoverQueue>,
}

impl KeySelector {
    pub fn new() -> Self {
        let states = Arc::new(RwLock::new(HashMap::new()));
        let model_states = Arc::new(RwLock::new(HashMap::new()));
        let queue = Arc::new(RecoverQueue::new());
        let model_queue = Arc::new(RecoverQueue::new());
        queue.clone().spawn_recover_task(states.clone());
        model_queue.clone().spawn_recover_task_model(model_states.clone());
        Self {
            keys: RwLock::new(HashMap::new()),
            states,
            model_states,
            queue,
            model_queue,
        }
    }

    pub async fn register(&self, provider_id: impl Into<String>, key: KeyRecord) {
        let provider_id = provider_id.into();
        let mut states = self.states.write().await;
        states.entry(key.id.clone()).or_insert(KeyState::Active);
        drop(states);
        self.keys.write().await.entry(provider_id).or_default().push(key);
    }

    /// Weighted selection among keys that are (a) registered for `provider`,
    /// (b) allowed for `model`, (c) not in a whole-key cooldown, and (d) not
    /// in a model-specific cooldown. Sampling is deterministic given `rng`.
    pub async fn select(
        &self,
        provider: &str,
        model: &str,
        rng: &mut impl Rng,
    ) -> Result<KeyRecord, SelectError> {
        let keys = {
            let guard = self.keys.read().await;
            guard.get(provider).cloned()
        };
        let Some(keys) = keys else {
            return Err(SelectError::ProviderUnknown);
        };

        let states = self.states.read().await;
        let model_states = self.model_states.read().await;
        let now = Instant::now();
        let eligible: Vec<&KeyRecord> = keys
            .iter()
            .filter(|k| k.allows(model))
            .filter(|k| matches!(states.get(&k.id), Some(KeyState::Active)))
            .filter(|k| match model_states.get(&(k.id.clone(), model.to_string())) {
                Some((until, _)) => *until <= now,
                None => true,
            })
            .collect();

        if eligible.is_empty() {
            return Err(SelectError::NoEligibleKey);
        }

        let total_weight: f64 = eligible.iter().map(|k| k.weight.max(0.0)).sum();
        if total_weight <= 0.0 {
            let idx = rng.random_range(0..eligible.len());
            return Ok(eligible[idx].clone());
        }

        let mut pick = rng.random::<f64>() * total_weight;
        for key in &eligible {
            pick -= key.weight.max(0.0);
            if pick <= 0.0 {
                return Ok((*key).clone());
            }
        }
        Ok(eligible[eligible.len() - 1].clone())
    }

    pub async fn mark_unavailable(&self, key_id: &str, duration: Duration, reason: UnavailableReason) {
        let until = Instant::now() + duration;
        self.states
            .write()
            .await
            .insert(key_id.to_string(), KeyState::Unavailable { until, reason });
        self.queue.push(until, key_id.to_string()).await;
        tracing::warn!(event = "key_marked_unavailable", key = %key_id, ?reason, cooldown_secs = duration.as_secs(), "credential entered cooldown");
    }

    pub async fn mark_model_unavailable(
        &self,
        key_id: &str,
        model: &str,
        duration: Duration,
        reason: UnavailableReason,
    ) {
        let until = Instant::now() + duration;
        self.model_states
            .write()
            .await
            .insert((key_id.to_string(), model.to_string()), (until, reason));
        self.model_queue
            .push(until, format!("{key_id}\u{0}{model}"))
            .await;
    }
}

impl Default for KeySelector {
    fn default() -> Self {
        Self::new()
    }
}

impl RecoverQueue {
    /// Variant of `spawn_recover_task` for the model-level cooldown map,
    /// whose keys are the synthetic `"<key_id>\0<model>"` strings pushed by
    /// `mark_model_unavailable`.
    fn spawn_recover_task_model(
        self: Arc<Self>,
        model_states: Arc<RwLock<HashMap<ModelStateKey, (Instant, UnavailableReason)>>>,
    ) {
        tokio::spawn(async move {
            loop {
                let next = {
                    let heap = self.heap.lock().await;
                    heap.peek().map(|Reverse((t, k))| (*t, k.clone()))
                };
                match next {
                    None => {
                        self.notify.notified().await;
                        continue;
                    }
                    Some((deadline, _)) => sleep_until(deadline).await,
                }

                let now = Instant::now();
                let mut due = Vec::new();
                {
                    let mut heap = self.heap.lock().await;
                    while let Some(Reverse((t, _))) = heap.peek() {
                        if *t > now {
                            break;
                        }
                        let Reverse((t, flat_key)) = heap.pop().unwrap();
                        due.push((t, flat_key));
                    }
                }
                if due.is_empty() {
                    continue;
                }

                let mut guard = model_states.write().await;
                for (_t, flat_key) in due {
                    let Some((key_id, model)) = flat_key.split_once('\u{0}') else {
                        continue;
                    };
                    let map_key = (key_id.to_string(), model.to_string());
                    let should_recover =
                        matches!(guard.get(&map_key), Some((until, _)) if *until <= now);
                    if should_recover {
                        guard.remove(&map_key);
                    }
                }
            }
        });
    }
}
