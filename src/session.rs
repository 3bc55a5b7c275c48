//! Per-call session state and the process-wide session registry
//!
//! A session is owned by its WebSocket task; the pieces the turn
//! pipeline and TTS writer touch concurrently (sequence counter, flags,
//! buffers, history) sit behind atomics and locks. No state is shared
//! between sessions except the registry map itself.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, OnceLock};
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, warn};

use crate::agent::prompt;
use crate::types::{Message, Role};

/// Greeting progress. `Done` is absorbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GreetingState {
    Pending,
    InProgress,
    Done,
}

pub struct Session {
    pub call_id: String,
    pub sample_rate: u32,
    stream_sid: OnceLock<String>,
    custom_parameters: StdMutex<HashMap<String, String>>,
    inbound: StdMutex<Vec<u8>>,
    history: Mutex<Vec<Message>>,
    sequence: AtomicU64,
    is_active: AtomicBool,
    greeting: StdMutex<GreetingState>,
    processing_turn: AtomicBool,
    barge_in: AtomicBool,
    started_at: Instant,
    last_media_at: StdMutex<Instant>,
}

impl Session {
    pub fn new(call_id: impl Into<String>, sample_rate: u32) -> Arc<Self> {
        Arc::new(Self {
            call_id: call_id.into(),
            sample_rate,
            stream_sid: OnceLock::new(),
            custom_parameters: StdMutex::new(HashMap::new()),
            inbound: StdMutex::new(Vec::new()),
            history: Mutex::new(Vec::new()),
            sequence: AtomicU64::new(0),
            is_active: AtomicBool::new(true),
            greeting: StdMutex::new(GreetingState::Pending),
            processing_turn: AtomicBool::new(false),
            barge_in: AtomicBool::new(false),
            started_at: Instant::now(),
            last_media_at: StdMutex::new(Instant::now()),
        })
    }

    // ─── Stream identity ─────────────────────────────────────

    /// Pin the stream sid. The first value wins; later values are
    /// ignored (the carrier must not reassign mid-call).
    pub fn set_stream_sid(&self, sid: &str) {
        if sid.is_empty() {
            return;
        }
        if self.stream_sid.set(sid.to_string()).is_err() {
            let pinned = self.stream_sid.get().map(String::as_str).unwrap_or_default();
            if pinned != sid {
                warn!(call_id = %self.call_id, "Ignoring stream sid change {} -> {}", pinned, sid);
            }
        }
    }

    pub fn stream_sid(&self) -> Option<&str> {
        self.stream_sid.get().map(String::as_str)
    }

    // ─── Custom parameters ───────────────────────────────────

    pub fn merge_custom_parameters(&self, params: &HashMap<String, String>) {
        if params.is_empty() {
            return;
        }
        if let Ok(mut current) = self.custom_parameters.lock() {
            for (key, value) in params {
                current.insert(key.clone(), value.clone());
            }
        }
    }

    pub fn custom_parameters(&self) -> HashMap<String, String> {
        self.custom_parameters.lock().map(|p| p.clone()).unwrap_or_default()
    }

    pub fn custom_parameter(&self, key: &str) -> Option<String> {
        self.custom_parameters.lock().ok()?.get(key).cloned()
    }

    // ─── Inbound audio buffer ────────────────────────────────

    /// Append caller PCM. Inactive sessions accept nothing. Returns the
    /// buffered byte count after the append.
    pub fn append_inbound(&self, pcm: &[u8]) -> usize {
        if !self.is_active() {
            return 0;
        }
        if let Ok(mut stamp) = self.last_media_at.lock() {
            *stamp = Instant::now();
        }
        match self.inbound.lock() {
            Ok(mut buffer) => {
                buffer.extend_from_slice(pcm);
                buffer.len()
            }
            Err(_) => 0,
        }
    }

    /// Snapshot and clear the inbound buffer.
    pub fn take_inbound(&self) -> Vec<u8> {
        self.inbound.lock().map(|mut b| std::mem::take(&mut *b)).unwrap_or_default()
    }

    pub fn inbound_len(&self) -> usize {
        self.inbound.lock().map(|b| b.len()).unwrap_or(0)
    }

    /// Bytes of buffered audio that trigger a turn: two seconds at the
    /// session rate.
    pub fn turn_threshold_bytes(&self) -> usize {
        self.sample_rate as usize * 2 * 2
    }

    // ─── Outbound sequencing ─────────────────────────────────

    /// Allocate the next outbound media sequence number. Strictly
    /// monotonic per session, starting at 0.
    pub fn next_sequence(&self) -> u64 {
        self.sequence.fetch_add(1, Ordering::SeqCst)
    }

    // ─── Flags ───────────────────────────────────────────────

    pub fn is_active(&self) -> bool {
        self.is_active.load(Ordering::SeqCst)
    }

    pub fn deactivate(&self) {
        self.is_active.store(false, Ordering::SeqCst);
    }

    /// Claim the turn gate. Returns false if a turn is already running.
    pub fn try_begin_turn(&self) -> bool {
        self.processing_turn
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub fn end_turn(&self) {
        self.processing_turn.store(false, Ordering::SeqCst);
    }

    pub fn turn_in_flight(&self) -> bool {
        self.processing_turn.load(Ordering::SeqCst)
    }

    pub fn set_barge_in(&self) {
        self.barge_in.store(true, Ordering::SeqCst);
    }

    pub fn barge_in_pending(&self) -> bool {
        self.barge_in.load(Ordering::SeqCst)
    }

    /// Read and clear the barge-in flag.
    pub fn take_barge_in(&self) -> bool {
        self.barge_in.swap(false, Ordering::SeqCst)
    }

    // ─── Greeting ────────────────────────────────────────────

    /// Transition pending → in_progress. False if already underway or done.
    pub fn begin_greeting(&self) -> bool {
        let Ok(mut state) = self.greeting.lock() else { return false };
        if *state == GreetingState::Pending {
            *state = GreetingState::InProgress;
            true
        } else {
            false
        }
    }

    pub fn finish_greeting(&self) {
        if let Ok(mut state) = self.greeting.lock() {
            *state = GreetingState::Done;
        }
    }

    /// Roll in_progress back to pending (greeting failed before any
    /// audio left). Done stays done.
    pub fn revert_greeting(&self) {
        if let Ok(mut state) = self.greeting.lock() {
            if *state == GreetingState::InProgress {
                *state = GreetingState::Pending;
            }
        }
    }

    pub fn greeting_state(&self) -> GreetingState {
        self.greeting.lock().map(|s| *s).unwrap_or(GreetingState::Done)
    }

    // ─── Conversation history ────────────────────────────────

    /// Insert or refresh the persona system entry. The retrieval
    /// context block, when present, is a separate system entry and is
    /// left alone.
    pub async fn ensure_system_message(&self, system_text: &str) {
        let mut history = self.history.lock().await;
        let persona_entry = history
            .iter_mut()
            .find(|m| m.role == Role::System && !m.content.starts_with(prompt::CONTEXT_PREFIX));
        match persona_entry {
            Some(entry) => entry.content = system_text.to_string(),
            None => history.insert(0, Message::system(system_text)),
        }
    }

    pub async fn push_user(&self, text: &str) {
        self.history.lock().await.push(Message::user(text));
    }

    pub async fn push_assistant(&self, text: &str) {
        self.history.lock().await.push(Message::assistant(text));
    }

    pub async fn history_snapshot(&self) -> Vec<Message> {
        self.history.lock().await.clone()
    }

    // ─── Timing ──────────────────────────────────────────────

    pub fn idle_for(&self) -> Duration {
        self.last_media_at.lock().map(|s| s.elapsed()).unwrap_or_default()
    }

    pub fn duration_secs(&self) -> f64 {
        self.started_at.elapsed().as_secs_f64()
    }
}

/// Process-wide registry of live sessions, keyed by call id.
#[derive(Clone, Default)]
pub struct SessionRegistry {
    inner: Arc<RwLock<HashMap<String, Arc<Session>>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, session: Arc<Session>) {
        let mut map = self.inner.write().await;
        if map.insert(session.call_id.clone(), session.clone()).is_some() {
            warn!(call_id = %session.call_id, "Replaced an existing session with the same call id");
        }
    }

    pub async fn remove(&self, call_id: &str) -> Option<Arc<Session>> {
        self.inner.write().await.remove(call_id)
    }

    pub async fn get(&self, call_id: &str) -> Option<Arc<Session>> {
        self.inner.read().await.get(call_id).cloned()
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.is_empty()
    }

    /// Deactivate and drop sessions idle past the deadline. The carrier
    /// socket notices the dead session on its next frame and closes.
    pub async fn reap_idle(&self, idle_timeout: Duration) -> usize {
        let mut map = self.inner.write().await;
        let stale: Vec<String> = map
            .values()
            .filter(|s| s.idle_for() > idle_timeout)
            .map(|s| s.call_id.clone())
            .collect();
        for call_id in &stale {
            if let Some(session) = map.remove(call_id) {
                session.deactivate();
                debug!(call_id = %call_id, "Reaped idle session");
            }
        }
        stale.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_sid_pins_first_value() {
        let session = Session::new("c1", 8000);
        assert_eq!(session.stream_sid(), None);
        session.set_stream_sid("S1");
        session.set_stream_sid("S2");
        assert_eq!(session.stream_sid(), Some("S1"));
    }

    #[test]
    fn test_sequence_monotonic_from_zero() {
        let session = Session::new("c1", 8000);
        assert_eq!(session.next_sequence(), 0);
        assert_eq!(session.next_sequence(), 1);
        assert_eq!(session.next_sequence(), 2);
    }

    #[test]
    fn test_inactive_session_rejects_audio() {
        let session = Session::new("c1", 8000);
        assert_eq!(session.append_inbound(&[0u8; 100]), 100);
        session.deactivate();
        assert_eq!(session.append_inbound(&[0u8; 100]), 0);
        assert_eq!(session.inbound_len(), 100);
    }

    #[test]
    fn test_take_inbound_clears() {
        let session = Session::new("c1", 8000);
        session.append_inbound(&[1u8; 10]);
        assert_eq!(session.take_inbound().len(), 10);
        assert_eq!(session.inbound_len(), 0);
    }

    #[test]
    fn test_turn_threshold() {
        assert_eq!(Session::new("a", 8000).turn_threshold_bytes(), 32000);
        assert_eq!(Session::new("b", 16000).turn_threshold_bytes(), 64000);
    }

    #[test]
    fn test_turn_gate_is_exclusive() {
        let session = Session::new("c1", 8000);
        assert!(session.try_begin_turn());
        assert!(!session.try_begin_turn());
        session.end_turn();
        assert!(session.try_begin_turn());
    }

    #[test]
    fn test_greeting_transitions() {
        let session = Session::new("c1", 8000);
        assert_eq!(session.greeting_state(), GreetingState::Pending);
        assert!(session.begin_greeting());
        assert!(!session.begin_greeting());
        session.finish_greeting();
        assert_eq!(session.greeting_state(), GreetingState::Done);
        // Done is absorbing.
        session.revert_greeting();
        assert_eq!(session.greeting_state(), GreetingState::Done);
        assert!(!session.begin_greeting());
    }

    #[test]
    fn test_greeting_revert_from_in_progress() {
        let session = Session::new("c1", 8000);
        assert!(session.begin_greeting());
        session.revert_greeting();
        assert_eq!(session.greeting_state(), GreetingState::Pending);
    }

    #[test]
    fn test_barge_in_take_clears() {
        let session = Session::new("c1", 8000);
        assert!(!session.take_barge_in());
        session.set_barge_in();
        assert!(session.barge_in_pending());
        assert!(session.take_barge_in());
        assert!(!session.barge_in_pending());
    }

    #[tokio::test]
    async fn test_ensure_system_message_inserts_then_replaces() {
        let session = Session::new("c1", 8000);
        session.push_user("hello").await;
        session.ensure_system_message("persona v1").await;
        let history = session.history_snapshot().await;
        assert_eq!(history[0].role, Role::System);
        assert_eq!(history[0].content, "persona v1");

        session.ensure_system_message("persona v2").await;
        let history = session.history_snapshot().await;
        assert_eq!(history[0].content, "persona v2");
        assert_eq!(history.iter().filter(|m| m.role == Role::System).count(), 1);
    }

    #[tokio::test]
    async fn test_registry_lifecycle() {
        let registry = SessionRegistry::new();
        let session = Session::new("c1", 8000);
        registry.insert(session.clone()).await;
        assert_eq!(registry.len().await, 1);
        assert!(registry.get("c1").await.is_some());
        assert!(registry.remove("c1").await.is_some());
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_reap_idle() {
        let registry = SessionRegistry::new();
        let session = Session::new("c1", 8000);
        registry.insert(session.clone()).await;
        assert_eq!(registry.reap_idle(Duration::from_secs(60)).await, 0);
        assert_eq!(registry.reap_idle(Duration::ZERO).await, 1);
        assert!(!session.is_active());
        assert!(registry.is_empty().await);
    }
}
