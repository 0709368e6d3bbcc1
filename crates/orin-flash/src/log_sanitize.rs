const MAX_LOG_CHARS: usize = 4096;

/// Scrubs one line of subprocess output before it reaches the terminal or a
/// log file: ANSI escape sequences are dropped (vendor flashing scripts are
/// heavy on colors and cursor movement), control characters are removed,
/// tabs become spaces, and very long lines are truncated.
pub fn sanitize_log_line(input: &str) -> String {
    let mut out = String::with_capacity(input.len().min(MAX_LOG_CHARS));
    let mut chars = input.chars();
    let mut truncated = false;
    let mut kept = 0usize;

    while let Some(c) = chars.next() {
        if c == '\x1b' {
            skip_escape_sequence(&mut chars);
            continue;
        }
        if c == '\t' {
            out.push(' ');
            kept += 1;
        } else if c.is_control() {
            continue;
        } else {
            out.push(c);
            kept += 1;
        }
        if kept >= MAX_LOG_CHARS {
            truncated = true;
            break;
        }
    }

    if truncated {
        out.push_str(" ...[truncated]");
    }
    out
}

fn skip_escape_sequence(chars: &mut impl Iterator<Item = char>) {
    match chars.next() {
        // CSI: parameters end at the first byte in '@'..='~'.
        Some('[') => {
            for c in chars.by_ref() {
                if ('@'..='~').contains(&c) {
                    break;
                }
            }
        }
        // OSC and the other string sequences end at BEL or ESC-\.
        Some(']') | Some('P') | Some('X') | Some('^') | Some('_') => {
            let mut prev_esc = false;
            for c in chars.by_ref() {
                if c == '\x07' || (prev_esc && c == '\\') {
                    break;
                }
                prev_esc = c == '\x1b';
            }
        }
        // Single-character escapes consume one byte, already taken above.
        _ => {}
    }
}
