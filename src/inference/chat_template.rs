pub const USER_TURN: &str = "<|im_start|>user\n";
pub const ASSISTANT_TURN: &str = "<|im_start|>assistant\n";
pub const END_OF_TURN: &str = "<|im_end|>";

/// Wraps a raw user message in the instruction template the checkpoint was tuned on.
pub fn format_prompt(message: &str) -> String {
    format!("{USER_TURN}{message}{END_OF_TURN}\n{ASSISTANT_TURN}")
}

/// Pulls the assistant's reply out of a decoded sequence.
///
/// `decoded` is the whole sequence including the prompt, `completion` only the newly generated part.
/// The reply is whatever follows the last assistant marker up to the next end-of-turn marker.
/// When the assistant marker did not survive decoding (truncated prompt, marker swallowed as a
/// special token) the completion is used instead.
pub fn extract_reply(decoded: &str, completion: &str) -> String {
    let tail = match decoded.rfind(ASSISTANT_TURN) {
        Some(start) => &decoded[start + ASSISTANT_TURN.len()..],
        None => completion,
    };
    tail.split(END_OF_TURN)
        .next()
        .unwrap_or_default()
        .trim()
        .to_string()
}
