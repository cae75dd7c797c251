/// Upper bound for error text stored on task records or pushed to webhooks.
const MAX_STORED_ERROR_LEN: usize = 300;

/// Collapses whitespace and truncates an error string so multi-line signer
/// output fits in a single record column and a single alert line. Anything
/// after a backtrace marker is noise at this level and is dropped.
pub fn compact_error_message(message: &str) -> String {
    let raw = match message.split_once("Stack backtrace:") {
        Some((prefix, _)) => prefix,
        None => message,
    };

    let mut compact = String::with_capacity(raw.len().min(MAX_STORED_ERROR_LEN + 16));
    let mut prev_ws = false;
    for ch in raw.chars() {
        if ch.is_whitespace() {
            if !prev_ws && !compact.is_empty() {
                compact.push(' ');
            }
            prev_ws = true;
            continue;
        }
        compact.push(ch);
        prev_ws = false;
        if compact.len() > MAX_STORED_ERROR_LEN {
            break;
        }
    }
    while compact.ends_with(' ') {
        compact.pop();
    }
    if compact.len() > MAX_STORED_ERROR_LEN {
        let mut cut = MAX_STORED_ERROR_LEN;
        while !compact.is_char_boundary(cut) {
            cut -= 1;
        }
        compact.truncate(cut);
        compact.push_str("...(truncated)");
    }
    compact
}
