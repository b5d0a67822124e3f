//! Lexical helpers for SQL text that the workbench forwards to PostgreSQL.

/// Splits `text` into statements on top-level semicolons. Quoted strings,
/// quoted identifiers, dollar-quoted bodies and comments are opaque; pieces
/// that hold nothing but whitespace or comments are dropped.
pub fn split_statements(text: &str) -> Vec<String> {
    let bytes = text.as_bytes();
    let mut statements = Vec::new();
    let mut start = 0;
    let mut significant = false;
    let mut i = 0;

    while i < bytes.len() {
        match bytes[i] {
            b'\'' | b'"' => {
                i = skip_quoted(bytes, i);
                significant = true;
            }
            b'-' if bytes.get(i + 1) == Some(&b'-') => {
                i = skip_line_comment(bytes, i);
            }
            b'/' if bytes.get(i + 1) == Some(&b'*') => {
                i = skip_block_comment(bytes, i);
            }
            b'$' => match dollar_tag(bytes, i) {
                Some(tag) => {
                    i = skip_dollar_body(bytes, i, tag);
                    significant = true;
                }
                None => {
                    i += 1;
                    significant = true;
                }
            },
            b';' => {
                if significant {
                    statements.push(text[start..i].trim().to_string());
                }
                i += 1;
                start = i;
                significant = false;
            }
            b if b.is_ascii_whitespace() => i += 1,
            _ => {
                i += 1;
                significant = true;
            }
        }
    }
    if significant {
        statements.push(text[start..].trim().to_string());
    }
    statements
}

pub fn is_single_statement(text: &str) -> bool {
    split_statements(text).len() <= 1
}

/// Strips one trailing statement terminator, if present.
pub fn strip_terminator(text: &str) -> &str {
    let trimmed = text.trim_end();
    trimmed.strip_suffix(';').unwrap_or(trimmed).trim_end()
}

pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

pub fn qualified_name(schema: &str, table: &str) -> String {
    format!("{}.{}", quote_ident(schema), quote_ident(table))
}

/// Leading keyword, upper-cased, skipping comments. Used to label results.
pub fn statement_keyword(sql: &str) -> String {
    let bytes = sql.as_bytes();
    let mut i = 0;
    loop {
        while i < bytes.len() && bytes[i].is_ascii_whitespace() {
            i += 1;
        }
        if bytes[i..].starts_with(b"--") {
            i = skip_line_comment(bytes, i);
        } else if bytes[i..].starts_with(b"/*") {
            i = skip_block_comment(bytes, i);
        } else {
            break;
        }
    }
    sql[i..]
        .split(|c: char| c.is_whitespace() || c == '(' || c == ';')
        .find(|s| !s.is_empty())
        .map(str::to_uppercase)
        .unwrap_or_else(|| "UNKNOWN".to_string())
}

fn skip_quoted(bytes: &[u8], open: usize) -> usize {
    let quote = bytes[open];
    let mut i = open + 1;
    while i < bytes.len() {
        if bytes[i] == quote {
            // a doubled quote is an escaped quote
            if bytes.get(i + 1) == Some(&quote) {
                i += 2;
                continue;
            }
            return i + 1;
        }
        if quote == b'\'' && bytes[i] == b'\\' && is_escape_string(bytes, open) {
            i += 2;
            continue;
        }
        i += 1;
    }
    bytes.len()
}

fn is_escape_string(bytes: &[u8], open: usize) -> bool {
    open > 0
        && matches!(bytes[open - 1], b'e' | b'E')
        && (open == 1 || !is_ident_byte(bytes[open - 2]))
}

fn skip_line_comment(bytes: &[u8], start: usize) -> usize {
    let mut i = start + 2;
    while i < bytes.len() && bytes[i] != b'\n' {
        i += 1;
    }
    i
}

/// Block comments nest in PostgreSQL.
fn skip_block_comment(bytes: &[u8], start: usize) -> usize {
    let mut depth = 0usize;
    let mut i = start;
    while i < bytes.len() {
        if bytes[i..].starts_with(b"/*") {
            depth += 1;
            i += 2;
        } else if bytes[i..].starts_with(b"*/") {
            depth -= 1;
            i += 2;
            if depth == 0 {
                return i;
            }
        } else {
            i += 1;
        }
    }
    bytes.len()
}

fn is_ident_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_' || b >= 0x80
}

/// `$tag$` opening at `start`, or None for positional parameters like `$1`
/// and for `$` inside identifiers.
fn dollar_tag(bytes: &[u8], start: usize) -> Option<&[u8]> {
    if start > 0 && is_ident_byte(bytes[start - 1]) {
        return None;
    }
    let mut i = start + 1;
    if bytes.get(i).is_some_and(u8::is_ascii_digit) {
        return None;
    }
    while i < bytes.len() && is_ident_byte(bytes[i]) {
        i += 1;
    }
    if bytes.get(i) == Some(&b'$') {
        Some(&bytes[start..=i])
    } else {
        None
    }
}

fn skip_dollar_body(bytes: &[u8], start: usize, tag: &[u8]) -> usize {
    let mut i = start + tag.len();
    while i < bytes.len() {
        if bytes[i..].starts_with(tag) {
            return i + tag.len();
        }
        i += 1;
    }
    bytes.len()
}
