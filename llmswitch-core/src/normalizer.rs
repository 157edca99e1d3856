use crate::model::ChatRequest;
use unicode_normalization::UnicodeNormalization;

const MAX_OUTPUT_TOKENS_CAP: u32 = 100_000;

fn clean_text(s: &str) -> String {
    // Unicode NFC normalization + BOM strip + CRLF -> LF + trim
    let mut t = s.nfc().collect::<String>();
    if t.starts_with('\u{FEFF}') {
        t.remove(0);
    }
    if t.contains("\r\n") {
        t = t.replace("\r\n", "\n");
    }
    t.trim().to_string()
}

/// Canonicalize a request before it is encoded for a provider.
pub fn normalize_chat(mut req: ChatRequest) -> ChatRequest {
    for msg in &mut req.messages {
        msg.content = clean_text(&msg.content);
    }
    if let Some(stops) = &mut req.stop_sequences {
        stops.sort();
        stops.dedup();
        if stops.is_empty() {
            req.stop_sequences = None;
        }
    }
    if let Some(max) = req.max_output_tokens
        && max > MAX_OUTPUT_TOKENS_CAP
    {
        req.max_output_tokens = Some(MAX_OUTPUT_TOKENS_CAP);
    }
    req
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ChatMessage;

    #[test]
    fn cleans_message_text() {
        let req = ChatRequest {
            messages: vec![ChatMessage::user("\u{FEFF}  cafe\u{301}\r\nline  ")],
            ..ChatRequest::default()
        };
        let out = normalize_chat(req);
        assert_eq!(out.messages[0].content, "caf\u{e9}\nline");
    }

    #[test]
    fn stop_sequences_sorted_deduped_and_dropped_when_empty() {
        let req = ChatRequest {
            messages: vec![],
            stop_sequences: Some(vec!["b".into(), "a".into(), "b".into()]),
            ..ChatRequest::default()
        };
        assert_eq!(
            normalize_chat(req).stop_sequences,
            Some(vec!["a".to_string(), "b".to_string()])
        );

        let req = ChatRequest {
            stop_sequences: Some(vec![]),
            ..ChatRequest::default()
        };
        assert_eq!(normalize_chat(req).stop_sequences, None);
    }

    #[test]
    fn caps_max_output_tokens() {
        let req = ChatRequest {
            max_output_tokens: Some(1_000_000),
            ..ChatRequest::default()
        };
        assert_eq!(normalize_chat(req).max_output_tokens, Some(100_000));

        let req = ChatRequest {
            max_output_tokens: Some(512),
            ..ChatRequest::default()
        };
        assert_eq!(normalize_chat(req).max_output_tokens, Some(512));
    }
}
