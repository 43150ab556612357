//! Output accumulation: merging streamed fragments into a cell's outputs.

use crate::model::Output;

/// Fold one incoming output into a cell's output list.
///
/// Non-stream outputs are appended. A stream fragment is appended to the
/// text of the last output when that is a stream of the same name. When a
/// different stream sits in between (`stdout, stderr, stdout`), the
/// fragment goes to the entry before the last so each stream stays one
/// contiguous block. Otherwise the fragment starts a new entry.
pub fn reduce_outputs(mut outputs: Vec<Output>, incoming: Output) -> Vec<Output> {
    let (name, fragment) = match &incoming {
        Output::Stream { name, text } => (*name, text),
        _ => {
            outputs.push(incoming);
            return outputs;
        }
    };

    let len = outputs.len();
    let target = [len.checked_sub(1), len.checked_sub(2)]
        .into_iter()
        .flatten()
        .find(|&i| matches!(&outputs[i], Output::Stream { name: n, .. } if *n == name));

    // Only the last entry is a candidate when it is itself a stream;
    // the one before it is considered only when the last is the other stream.
    let target = match (target, outputs.last()) {
        (Some(i), _) if i + 1 == len => Some(i),
        (Some(i), Some(Output::Stream { .. })) => Some(i),
        _ => None,
    };

    match target {
        Some(i) => {
            if let Output::Stream { text, .. } = &mut outputs[i] {
                let combined = format!("{text}{fragment}");
                *text = escape_carriage_return_safe(&combined);
            }
        }
        None => outputs.push(incoming),
    }
    outputs
}

/// Apply carriage returns within completed lines.
///
/// A `\r` moves the cursor back to the start of its line and later text
/// overwrites what was there, the way a terminal renders progress bars.
/// `\r\n` is a plain newline. The last line, which has no `\n` yet, is left
/// untouched so a later fragment can still overwrite it. Text without any
/// newline is resolved in full, keeping a trailing `\r`.
pub fn escape_carriage_return_safe(text: &str) -> String {
    if !text.contains('\r') {
        return text.to_string();
    }
    let text = collapse_crlf(text);
    match text.rfind('\n') {
        Some(idx) => {
            let (complete, pending) = text.split_at(idx + 1);
            let mut resolved: String = complete
                .split_inclusive('\n')
                .map(|line| {
                    let body = line.strip_suffix('\n').unwrap_or(line);
                    let mut rendered = overwrite_line(body);
                    rendered.push('\n');
                    rendered
                })
                .collect();
            resolved.push_str(pending);
            resolved
        }
        None => {
            let mut rendered = overwrite_line(&text);
            if text.ends_with('\r') {
                rendered.push('\r');
            }
            rendered
        }
    }
}

fn collapse_crlf(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '\r' {
            let mut lookahead = chars.clone();
            while lookahead.peek() == Some(&'\r') {
                lookahead.next();
            }
            if lookahead.peek() == Some(&'\n') {
                chars = lookahead;
                continue;
            }
        }
        out.push(c);
    }
    out
}

/// Render one line (no `\n`) that may contain `\r`.
fn overwrite_line(line: &str) -> String {
    let mut segments = line.split('\r');
    let mut rendered: Vec<char> = segments.next().unwrap_or_default().chars().collect();
    for segment in segments {
        let overwrite: Vec<char> = segment.chars().collect();
        if overwrite.len() >= rendered.len() {
            rendered = overwrite;
        } else {
            rendered.splice(..overwrite.len(), overwrite);
        }
    }
    rendered.into_iter().collect()
}
