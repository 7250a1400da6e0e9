/// Lead-ins that chat-tuned models like to put before the actual caption.
const BOILERPLATE_PREFIXES: [&str; 8] = [
    "answer:",
    "caption:",
    "description:",
    "response:",
    "here is",
    "here's",
    "sure,",
    "sure.",
];

const LEADING_NOISE: &[char] = &[':', ';', '-', '–', '—', '.', '*', '•', ' ', '\t', '\n'];

/// Strip at most one boilerplate lead-in (case-insensitive), then any leading
/// punctuation noise. Falls back to the trimmed input when nothing would remain.
pub fn clean_caption(raw: &str) -> String {
    let caption = raw.trim();

    let mut rest = caption;
    for prefix in BOILERPLATE_PREFIXES {
        if let Some(head) = caption.get(..prefix.len()) {
            if head.eq_ignore_ascii_case(prefix) {
                rest = &caption[prefix.len()..];
                break;
            }
        }
    }

    match rest.trim_start_matches(LEADING_NOISE) {
        "" => caption.to_string(),
        cleaned => cleaned.to_string(),
    }
}

pub fn apply_affixes(caption: &str, prefix: &str, suffix: &str) -> String {
    let mut result = caption.to_string();

    let prefix = prefix.trim();
    if !prefix.is_empty() {
        result = format!("{} {}", prefix, result);
    }

    let suffix = suffix.trim();
    if !suffix.is_empty() {
        result = format!("{} {}", result, suffix);
    }

    result
}

/// Cleanup followed by prefix/suffix, as applied to every finished caption.
pub fn finalize_caption(raw: &str, prefix: &str, suffix: &str) -> String {
    apply_affixes(&clean_caption(raw), prefix, suffix)
}
