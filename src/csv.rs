//! Minimal CSV reader/writer for the roster export.
//!
//! The hosted staff roster is a plain comma-separated export with quoted
//! fields, so this stays deliberately small: no headers, no type coercion,
//! just ordered rows of ordered field strings. Malformed quoting never
//! raises an error; an unterminated quote consumes the rest of the input
//! as the final field.

/// Parse raw CSV text into rows of field strings.
///
/// - strips a leading UTF-8 BOM before parsing;
/// - `"`-enclosed fields may contain commas and newlines, `""` escapes a
///   literal quote;
/// - bare `\r` outside quotes is ignored, `\r\n` and `\n` terminate rows;
/// - a trailing partial row (no final newline) is still emitted.
pub fn parse_csv(text: &str) -> Vec<Vec<String>> {
    let text = text.strip_prefix('\u{FEFF}').unwrap_or(text);

    let mut rows: Vec<Vec<String>> = Vec::new();
    let mut row: Vec<String> = Vec::new();
    let mut field = String::new();
    let mut in_quotes = false;

    let mut chars = text.chars().peekable();
    while let Some(ch) = chars.next() {
        if in_quotes {
            if ch == '"' {
                if chars.peek() == Some(&'"') {
                    field.push('"');
                    chars.next();
                } else {
                    in_quotes = false;
                }
            } else {
                field.push(ch);
            }
            continue;
        }
        match ch {
            '"' => in_quotes = true,
            ',' => {
                row.push(std::mem::take(&mut field));
            }
            '\r' => {}
            '\n' => {
                row.push(std::mem::take(&mut field));
                rows.push(std::mem::take(&mut row));
            }
            _ => field.push(ch),
        }
    }

    if !field.is_empty() || !row.is_empty() {
        row.push(field);
        rows.push(row);
    }

    rows
}

/// Serialize rows back to CSV text, quoting only where needed.
/// `parse_csv(write_csv(rows)) == rows` for any row set.
pub fn write_csv(rows: &[Vec<String>]) -> String {
    let mut out = String::new();
    for row in rows {
        for (i, fieldv) in row.iter().enumerate() {
            if i > 0 {
                out.push(',');
            }
            if fieldv.contains(['"', ',', '\n', '\r']) {
                out.push('"');
                out.push_str(&fieldv.replace('"', "\"\""));
                out.push('"');
            } else {
                out.push_str(fieldv);
            }
        }
        out.push('\n');
    }
    out
}
