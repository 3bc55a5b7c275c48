//! Persona prompt assembly and reply post-processing
//!
//! The system prompt comes either from per-call custom parameters (a
//! fill-in template) or from the persisted persona document. Replies are
//! scrubbed of markdown artifacts and trimmed to a speakable length
//! before they reach TTS or the conversation history.

use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashMap;

use crate::types::{Message, Role};

/// Prior turns (one user utterance plus the reply) kept in a prompt.
const HISTORY_TURNS: usize = 10;

/// Maximum speakable reply length.
const MAX_REPLY_CHARS: usize = 300;

/// Build the persona system prompt from per-call custom parameters.
///
/// Omitted parameters drop their clause.
pub fn system_prompt_from_parameters(params: &HashMap<String, String>) -> String {
    let get = |key: &str| params.get(key).map(|v| v.trim()).filter(|v| !v.is_empty());

    let mut intro = String::from("You are ");
    intro.push_str(get("persona_name").unwrap_or("a voice assistant"));
    if let Some(age) = get("persona_age") {
        intro.push_str(&format!(", {} years old", age));
    }
    match (get("tone"), get("gender"), get("city")) {
        (None, None, None) => {}
        (tone, gender, city) => {
            intro.push_str(", a");
            if let Some(tone) = tone {
                intro.push(' ');
                intro.push_str(tone);
            }
            if let Some(gender) = gender {
                intro.push(' ');
                intro.push_str(gender);
            }
            if let Some(city) = city {
                intro.push_str(" from ");
                intro.push_str(city);
            }
        }
    }
    intro.push('.');

    let mut prompt = intro;
    if let Some(language) = get("language") {
        prompt.push_str("\n\n");
        prompt.push_str(&language_instruction(language));
    }
    if let Some(documents) = get("documents") {
        prompt.push_str("\n\nSirf in documents se jawab do:\n");
        prompt.push_str(documents);
    }
    if let Some(customer) = get("customer_name") {
        prompt.push_str("\n\nCustomer ka naam: ");
        prompt.push_str(customer);
    }
    prompt
}

fn language_instruction(language: &str) -> String {
    let lower = language.to_lowercase();
    if lower == "hi" || lower.contains("hindi") || lower.starts_with("hi-") {
        "Baat karo Hinglish mein (mix of Hindi and English).".to_string()
    } else {
        format!("Speak in {}.", language)
    }
}

/// Marker prefix distinguishing retrieval context from the persona
/// system entry.
pub const CONTEXT_PREFIX: &str = "Relevant context:";

/// Format retrieved knowledge chunks for prompt injection.
pub fn context_block(chunks: &[String]) -> Option<String> {
    if chunks.is_empty() {
        return None;
    }
    Some(format!("{}\n{}", CONTEXT_PREFIX, chunks.join("\n\n")))
}

/// Linearize the persona, optional context, and recent turns into a
/// single completion prompt ending with the current user utterance.
pub fn build_prompt(
    system_text: &str,
    context: Option<&str>,
    history: &[Message],
    user_text: &str,
) -> String {
    let mut prompt = String::with_capacity(system_text.len() + 512);
    prompt.push_str(system_text);
    prompt.push_str("\n\n");
    if let Some(context) = context {
        prompt.push_str(context);
        prompt.push_str("\n\n");
    }

    // Prior non-system messages, the most recent HISTORY_TURNS turns of
    // them (a turn is a user message plus the assistant reply, so two
    // entries each). The current user message is already in history; it
    // is emitted once, as the terminator, so drop it from the body.
    let mut turns: Vec<&Message> = history
        .iter()
        .filter(|m| m.role != Role::System)
        .collect();
    if turns
        .last()
        .is_some_and(|m| m.role == Role::User && m.content == user_text)
    {
        turns.pop();
    }
    let start = turns.len().saturating_sub(HISTORY_TURNS * 2);
    for message in &turns[start..] {
        prompt.push_str(&format!("{}: {}\n", message.role.transcript_label(), message.content));
    }

    prompt.push_str("User: ");
    prompt.push_str(user_text);
    prompt.push_str("\nAssistant:");
    prompt
}

static BOLD_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\*\*([^*]*)\*\*").unwrap());
static ITALIC_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\*([^*]*)\*").unwrap());
static CODE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"`([^`]*)`").unwrap());
static HEADING_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?m)^#{1,6}\s+").unwrap());
static LINK_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\[([^\]]*)\]\([^)]*\)").unwrap());

/// Scrub markdown artifacts, bound the length, and guarantee terminal
/// punctuation so TTS output does not trail off mid-clause.
pub fn postprocess_reply(reply: &str) -> String {
    let text = BOLD_RE.replace_all(reply, "$1");
    let text = ITALIC_RE.replace_all(&text, "$1");
    let text = CODE_RE.replace_all(&text, "$1");
    let text = LINK_RE.replace_all(&text, "$1");
    let text = HEADING_RE.replace_all(&text, "");
    let mut text = text.trim().to_string();

    if text.chars().count() > MAX_REPLY_CHARS {
        text = truncate_at_sentence(&text, MAX_REPLY_CHARS);
    }

    if !text.is_empty() && !text.ends_with(['.', '!', '?']) {
        text.push('.');
    }
    text
}

/// Cut to at most `max_chars`, preferring the last sentence boundary,
/// then the last space, then a hard character cut.
fn truncate_at_sentence(text: &str, max_chars: usize) -> String {
    let cut: String = text.chars().take(max_chars).collect();

    if let Some(pos) = cut.rfind(['.', '!', '?']) {
        let end = pos + cut[pos..].chars().next().map_or(1, char::len_utf8);
        return cut[..end].trim().to_string();
    }
    if let Some(pos) = cut.rfind(' ') {
        return cut[..pos].trim().to_string();
    }
    cut.trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn test_system_prompt_full() {
        let prompt = system_prompt_from_parameters(&params(&[
            ("persona_name", "Priya"),
            ("persona_age", "28"),
            ("tone", "friendly"),
            ("gender", "woman"),
            ("city", "Mumbai"),
            ("language", "hindi"),
            ("documents", "Plan A costs 500 rupees."),
            ("customer_name", "Rahul"),
        ]));
        assert!(prompt.starts_with("You are Priya, 28 years old, a friendly woman from Mumbai."));
        assert!(prompt.contains("Baat karo Hinglish mein"));
        assert!(prompt.contains("Sirf in documents se jawab do:\nPlan A costs 500 rupees."));
        assert!(prompt.contains("Customer ka naam: Rahul"));
    }

    #[test]
    fn test_system_prompt_omitted_clauses() {
        let prompt = system_prompt_from_parameters(&params(&[("persona_name", "Priya")]));
        assert_eq!(prompt, "You are Priya.");

        let prompt = system_prompt_from_parameters(&params(&[]));
        assert_eq!(prompt, "You are a voice assistant.");
    }

    #[test]
    fn test_language_instruction() {
        assert!(language_instruction("hi").contains("Hinglish"));
        assert!(language_instruction("Hindi").contains("Hinglish"));
        assert!(language_instruction("hi-IN").contains("Hinglish"));
        assert_eq!(language_instruction("Tamil"), "Speak in Tamil.");
    }

    #[test]
    fn test_context_block() {
        assert_eq!(context_block(&[]), None);
        let block = context_block(&["alpha".into(), "beta".into()]).unwrap();
        assert!(block.starts_with(CONTEXT_PREFIX));
        assert!(block.contains("alpha\n\nbeta"));
    }

    #[test]
    fn test_build_prompt_shape() {
        let history = vec![
            Message::system("You are Priya."),
            Message::user("hello"),
            Message::assistant("Hi! How can I help?"),
            Message::user("what plans do you have"),
        ];
        let prompt = build_prompt(
            "You are Priya.",
            Some("Relevant context:\nPlan A."),
            &history,
            "what plans do you have",
        );
        assert!(prompt.starts_with("You are Priya.\n\nRelevant context:\nPlan A.\n\n"));
        assert!(prompt.contains("User: hello\nAssistant: Hi! How can I help?\n"));
        assert!(prompt.ends_with("User: what plans do you have\nAssistant:"));
        // The current utterance appears once, as the terminator.
        assert_eq!(prompt.matches("what plans do you have").count(), 1);
    }

    #[test]
    fn test_build_prompt_keeps_last_ten_turns() {
        let mut history = vec![Message::system("sys")];
        for i in 0..30 {
            history.push(Message::user(format!("question {}", i)));
            history.push(Message::assistant(format!("answer {}", i)));
        }
        history.push(Message::user("latest"));
        let prompt = build_prompt("sys", None, &history, "latest");
        // Ten turns = the last ten user/assistant pairs, nothing older.
        assert!(prompt.contains("User: question 20\n"));
        assert!(prompt.contains("Assistant: answer 20\n"));
        assert!(!prompt.contains("User: question 19\n"));
        assert!(prompt.contains("Assistant: answer 29\n"));
    }

    #[test]
    fn test_postprocess_strips_markdown() {
        let reply = "# Offer\n**Great** news: *only* `500` rupees, see [details](http://x).";
        let clean = postprocess_reply(reply);
        assert_eq!(clean, "Offer\nGreat news: only 500 rupees, see details.");
    }

    #[test]
    fn test_postprocess_adds_terminal_punctuation() {
        assert_eq!(postprocess_reply("hello there"), "hello there.");
        assert_eq!(postprocess_reply("done!"), "done!");
        assert_eq!(postprocess_reply(""), "");
    }

    #[test]
    fn test_postprocess_truncates_at_sentence() {
        let long = format!("{} {}", "First sentence ends here.", "x".repeat(400));
        let clean = postprocess_reply(&long);
        assert_eq!(clean, "First sentence ends here.");
    }

    #[test]
    fn test_truncate_without_boundary() {
        let text = "y".repeat(400);
        let cut = truncate_at_sentence(&text, 300);
        assert_eq!(cut.chars().count(), 300);
    }
}
