//! Turn pipeline: STT → LLM → TTS streaming orchestration
//!
//! Three stages per turn, joined by channels instead of locks: the LLM
//! producer pushes deltas, the token-buffer stage flushes speakable
//! fragments, and a single writer task drains the fragment queue to the
//! WebSocket. The writer is the only task emitting media frames for a
//! session, which is what keeps sequence numbers gapless on the wire.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::agent::{prompt, LlmClient};
use crate::carrier;
use crate::config::Settings;
use crate::knowledge::{KnowledgeStore, DEFAULT_PERSONA_NAME};
use crate::session::{GreetingState, Session};
use crate::voice::{audio, SttClient, TtsClient};

/// Pause between outbound media frames so the carrier is not flooded.
const CHUNK_PACING: Duration = Duration::from_millis(10);

/// Length past which a buffered fragment is flushed without waiting for
/// sentence punctuation.
const FLUSH_LEN_THRESHOLD: usize = 50;

/// Minimum words for a length-based flush.
const FLUSH_MIN_WORDS: usize = 8;

/// A length-based flush cuts at the last space before this position.
const FLUSH_CUT_LIMIT: usize = 100;

/// JSON frames headed for the carrier socket.
pub type FrameSink = mpsc::Sender<String>;

/// Everything a turn needs besides the session itself.
#[derive(Clone)]
pub struct PipelineDeps {
    pub settings: Arc<Settings>,
    pub store: Arc<KnowledgeStore>,
    pub stt: Option<Arc<SttClient>>,
    pub tts: Option<Arc<TtsClient>>,
    pub llm: Option<Arc<LlmClient>>,
}

/// Clears the turn gate on every exit path.
struct TurnGuard(Arc<Session>);

impl Drop for TurnGuard {
    fn drop(&mut self) {
        self.0.end_turn();
    }
}

// ─── Greeting ────────────────────────────────────────────────

/// Strip the `GREETING_TEXT=` prefix and surrounding quotes that leak
/// in when the value is pasted straight from an env file.
pub fn clean_greeting(raw: &str) -> String {
    let text = raw.trim();
    let text = text.strip_prefix("GREETING_TEXT=").unwrap_or(text).trim();
    let text = text
        .strip_prefix('"')
        .and_then(|t| t.strip_suffix('"'))
        .or_else(|| text.strip_prefix('\'').and_then(|t| t.strip_suffix('\'')))
        .unwrap_or(text);
    text.trim().to_string()
}

/// Kick off the greeting once, as soon as the stream sid is known.
///
/// The greeting holds the turn gate while it streams so a turn started
/// by early caller audio cannot interleave frames with it.
pub fn maybe_start_greeting(session: &Arc<Session>, deps: &PipelineDeps, sink: &FrameSink) {
    if session.stream_sid().is_none() || session.greeting_state() != GreetingState::Pending {
        return;
    }
    if !session.try_begin_turn() {
        return;
    }
    if !session.begin_greeting() {
        session.end_turn();
        return;
    }
    let session = session.clone();
    let deps = deps.clone();
    let sink = sink.clone();
    tokio::spawn(async move {
        let _guard = TurnGuard(session.clone());
        run_greeting(session, deps, sink).await;
    });
}

async fn run_greeting(session: Arc<Session>, deps: PipelineDeps, sink: FrameSink) {
    let text = session
        .custom_parameter("greeting")
        .map(|g| clean_greeting(&g))
        .filter(|g| !g.is_empty())
        .unwrap_or_else(|| deps.settings.greeting_text.clone());

    info!(call_id = %session.call_id, "Greeting: \"{}\"", crate::truncate_safe(&text, 80));

    let voice = session.custom_parameter("voice");
    let synthesis = match deps.tts.as_ref() {
        Some(tts) => tts.synthesize(&text, voice.as_deref(), session.sample_rate).await,
        None => Err(anyhow::anyhow!("TTS not configured")),
    };

    match synthesis {
        Ok(synth) => {
            let pcm = to_session_rate(synth.pcm, synth.sample_rate, session.sample_rate);
            let sent = stream_fragment(&session, &sink, &pcm).await;
            if sent.frames > 0 {
                if sent.completed {
                    send_mark(&session, &sink).await;
                }
                session.finish_greeting();
            } else {
                session.revert_greeting();
                keepalive_silence(&session, &sink).await;
            }
        }
        Err(e) => {
            warn!(call_id = %session.call_id, "Greeting synthesis failed: {}", e);
            session.revert_greeting();
            keepalive_silence(&session, &sink).await;
        }
    }
}

/// One second of zeros so the carrier keeps the call up after a failed
/// greeting.
async fn keepalive_silence(session: &Arc<Session>, sink: &FrameSink) {
    let pcm = audio::silence(session.sample_rate, 1.0);
    let _ = stream_fragment(session, sink, &pcm).await;
}

// ─── Turn trigger ────────────────────────────────────────────

/// Start a turn when enough audio is buffered and none is in flight.
pub fn maybe_trigger_turn(session: &Arc<Session>, deps: &PipelineDeps, sink: &FrameSink) {
    if session.inbound_len() < session.turn_threshold_bytes() {
        return;
    }
    if !session.try_begin_turn() {
        return;
    }
    let session = session.clone();
    let deps = deps.clone();
    let sink = sink.clone();
    tokio::spawn(async move {
        let _guard = TurnGuard(session.clone());
        run_turn(session, deps, sink).await;
    });
}

/// Flush whatever audio is still buffered. Used on the carrier's stop
/// event; runs inline so teardown waits for it.
pub async fn flush_residual_turn(session: &Arc<Session>, deps: &PipelineDeps, sink: &FrameSink) {
    if session.inbound_len() == 0 || !session.try_begin_turn() {
        return;
    }
    let _guard = TurnGuard(session.clone());
    run_turn(session.clone(), deps.clone(), sink.clone()).await;
}

// ─── The turn itself ─────────────────────────────────────────

async fn run_turn(session: Arc<Session>, deps: PipelineDeps, sink: FrameSink) {
    let pcm = session.take_inbound();

    if session.take_barge_in() {
        debug!(call_id = %session.call_id, "Turn aborted by pending barge-in");
        return;
    }

    let ratio = audio::voiced_ratio(&pcm, deps.settings.silence_amplitude_threshold);
    if ratio < deps.settings.min_voiced_ratio {
        debug!(call_id = %session.call_id, "Skipping silent buffer (voiced ratio {:.3})", ratio);
        return;
    }

    let Some(stt) = deps.stt.as_ref() else {
        warn!("STT not configured; dropping {} bytes of audio", pcm.len());
        return;
    };
    let language = session.custom_parameter("language");
    let Some(user_text) =
        stt.transcribe(&pcm, session.sample_rate, language.as_deref()).await
    else {
        return;
    };

    session.push_user(&user_text).await;

    let params = session.custom_parameters();
    let system_text = if !params.is_empty() {
        prompt::system_prompt_from_parameters(&params)
    } else {
        match deps.store.load_persona(DEFAULT_PERSONA_NAME).await {
            Ok(text) => text,
            Err(e) => {
                warn!("Persona load failed: {}", e);
                prompt::system_prompt_from_parameters(&params)
            }
        }
    };
    session.ensure_system_message(&system_text).await;

    let chunks = match deps.store.relevant_chunks(&user_text, 3).await {
        Ok(chunks) => chunks,
        Err(e) => {
            warn!("Knowledge retrieval failed: {}", e);
            Vec::new()
        }
    };
    let context = prompt::context_block(&chunks);
    let history = session.history_snapshot().await;
    let prompt_text = prompt::build_prompt(&system_text, context.as_deref(), &history, &user_text);

    let reply = stream_reply(&session, &deps, &sink, &prompt_text).await;

    if !reply.is_empty() {
        let clean = prompt::postprocess_reply(&reply);
        session.push_assistant(&clean).await;
    }
}

// ─── LLM → token buffer → TTS queue ──────────────────────────

enum TtsJob {
    Fragment(String),
    Finish,
}

/// Stream the LLM reply through the token buffer into the TTS writer.
/// Returns the raw assembled reply (empty when nothing was produced).
async fn stream_reply(
    session: &Arc<Session>,
    deps: &PipelineDeps,
    sink: &FrameSink,
    prompt_text: &str,
) -> String {
    let Some(llm) = deps.llm.clone() else {
        warn!("LLM not configured; turn dropped");
        return String::new();
    };
    let Some(tts) = deps.tts.clone() else {
        warn!("TTS not configured; turn dropped");
        return String::new();
    };

    let (frag_tx, frag_rx) = mpsc::channel::<TtsJob>(16);
    let writer = tokio::spawn(tts_writer(session.clone(), tts, sink.clone(), frag_rx));

    let (delta_tx, mut delta_rx) = mpsc::unbounded_channel::<(String, bool)>();
    let llm_prompt = prompt_text.to_string();
    let producer = tokio::spawn(async move {
        llm.stream_reply(&llm_prompt, move |delta, done| {
            let _ = delta_tx.send((delta.to_string(), done));
        })
        .await
    });

    let mut buffer = String::new();
    let mut full_reply = String::new();
    let mut preempted = false;

    while let Some((delta, done)) = delta_rx.recv().await {
        if done {
            break;
        }
        if session.barge_in_pending() {
            preempted = true;
            buffer.clear();
            break;
        }
        buffer.push_str(&delta);
        full_reply.push_str(&delta);

        while let Some(cut) = flush_point(&buffer) {
            let fragment = buffer[..cut].trim().to_string();
            buffer = buffer[cut..].trim_start().to_string();
            if !fragment.is_empty() && frag_tx.send(TtsJob::Fragment(fragment)).await.is_err() {
                break;
            }
        }
    }

    let producer_result = producer.await;

    if !preempted && full_reply.is_empty() {
        // The stream died before the first delta; fall back to the
        // non-streaming endpoint so the caller is not left hanging.
        if let Ok(Err(stream_err)) = &producer_result {
            debug!("LLM stream failed before first delta: {}", stream_err);
            match llm_fallback(deps, prompt_text).await {
                Some(text) => {
                    full_reply = text.clone();
                    buffer = text;
                }
                None => {}
            }
        }
    }

    if !preempted {
        let tail = buffer.trim().to_string();
        if !tail.is_empty() {
            let _ = frag_tx.send(TtsJob::Fragment(tail)).await;
        }
        let _ = frag_tx.send(TtsJob::Finish).await;
    }
    drop(frag_tx);

    match writer.await {
        Ok(outcome) => debug!(
            call_id = %session.call_id,
            "Turn streamed {} frames (preempted={})",
            outcome.frames, outcome.preempted || preempted
        ),
        Err(e) => warn!("TTS writer task failed: {}", e),
    }

    full_reply
}

async fn llm_fallback(deps: &PipelineDeps, prompt_text: &str) -> Option<String> {
    let llm = deps.llm.as_ref()?;
    match llm.complete(prompt_text).await {
        Ok(text) if !text.trim().is_empty() => Some(text),
        Ok(_) => None,
        Err(e) => {
            warn!("LLM fallback failed: {}", e);
            None
        }
    }
}

/// Decide whether the token buffer holds a speakable fragment, and
/// where it ends (byte index, exclusive).
///
/// Sentence punctuation followed by whitespace flushes through the last
/// such boundary; otherwise a long-enough buffer flushes at the last
/// space before the cut limit.
fn flush_point(buffer: &str) -> Option<usize> {
    let mut boundary = None;
    let mut chars = buffer.char_indices().peekable();
    while let Some((idx, ch)) = chars.next() {
        if matches!(ch, '.' | '!' | '?') {
            if let Some((_, next)) = chars.peek() {
                if next.is_whitespace() {
                    boundary = Some(idx + ch.len_utf8());
                }
            }
        }
    }
    if boundary.is_some() {
        return boundary;
    }

    let char_count = buffer.chars().count();
    if char_count > FLUSH_LEN_THRESHOLD && buffer.split_whitespace().count() >= FLUSH_MIN_WORDS {
        let limit_byte = buffer
            .char_indices()
            .nth(FLUSH_CUT_LIMIT)
            .map(|(idx, _)| idx)
            .unwrap_or(buffer.len());
        if let Some(space) = buffer[..limit_byte].rfind(' ') {
            if space > 0 {
                return Some(space);
            }
        }
    }
    None
}

// ─── TTS writer: serial fragment → wire stage ────────────────

struct WriterOutcome {
    frames: usize,
    preempted: bool,
}

/// Drain the fragment queue strictly in order. Synthesis failures abort
/// the rest of the turn's audio; the session itself stays alive.
async fn tts_writer(
    session: Arc<Session>,
    tts: Arc<TtsClient>,
    sink: FrameSink,
    mut rx: mpsc::Receiver<TtsJob>,
) -> WriterOutcome {
    let voice = session.custom_parameter("voice");
    let mut outcome = WriterOutcome { frames: 0, preempted: false };
    let mut failed = false;

    while let Some(job) = rx.recv().await {
        match job {
            TtsJob::Fragment(text) => {
                if failed || outcome.preempted || session.barge_in_pending() {
                    outcome.preempted = outcome.preempted || session.barge_in_pending();
                    continue;
                }
                match tts.synthesize(&text, voice.as_deref(), session.sample_rate).await {
                    Ok(synth) => {
                        let pcm =
                            to_session_rate(synth.pcm, synth.sample_rate, session.sample_rate);
                        let sent = stream_fragment(&session, &sink, &pcm).await;
                        outcome.frames += sent.frames;
                        if !sent.completed {
                            outcome.preempted = true;
                        }
                    }
                    Err(e) => {
                        warn!(call_id = %session.call_id, "TTS failed mid-turn: {}", e);
                        failed = true;
                    }
                }
            }
            TtsJob::Finish => {
                if !failed && !outcome.preempted && !session.barge_in_pending() {
                    send_mark(&session, &sink).await;
                }
            }
        }
    }

    outcome
}

fn to_session_rate(pcm: Vec<u8>, source_rate: u32, session_rate: u32) -> Vec<u8> {
    if source_rate == session_rate {
        pcm
    } else {
        audio::resample(&pcm, source_rate, session_rate)
    }
}

struct FragmentSent {
    frames: usize,
    completed: bool,
}

/// Chunk a fragment's PCM into carrier frames and pace them out.
/// Stops at a chunk boundary on barge-in, closed sink, or session end.
async fn stream_fragment(session: &Arc<Session>, sink: &FrameSink, pcm: &[u8]) -> FragmentSent {
    let Some(stream_sid) = session.stream_sid().map(str::to_string) else {
        warn!(call_id = %session.call_id, "No stream sid; dropping outbound audio");
        return FragmentSent { frames: 0, completed: false };
    };

    let frame_size = audio::frame_size_for_rate(session.sample_rate);
    let chunks = audio::chunk_frames(pcm, frame_size);
    let total = chunks.len();
    let mut frames = 0usize;

    for chunk in chunks {
        if !session.is_active() || session.barge_in_pending() {
            return FragmentSent { frames, completed: false };
        }
        let seq = session.next_sequence();
        let frame = carrier::media_frame(&stream_sid, seq, &chunk);
        if sink.send(frame).await.is_err() {
            return FragmentSent { frames, completed: false };
        }
        frames += 1;
        if frames < total {
            tokio::time::sleep(CHUNK_PACING).await;
        }
    }

    FragmentSent { frames, completed: true }
}

async fn send_mark(session: &Arc<Session>, sink: &FrameSink) {
    if let Some(stream_sid) = session.stream_sid() {
        let _ = sink.send(carrier::mark_frame(stream_sid, carrier::REPLY_DONE_MARK)).await;
    }
}
