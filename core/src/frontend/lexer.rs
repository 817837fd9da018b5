//! Line-oriented tokenizer for the textual assembly format.
//!
//! Tokens are whitespace-separated. A `#` starts a comment that runs to the
//! end of the line: a leading `#` (after optional whitespace) comments the
//! whole line, and a `#` after code cuts the line short, including when it
//! is glued to the end of a token.

/// Returns true if the first non-space character of `line` is `#`.
/// Empty lines are not comments.
pub fn is_comment_line(line: &str) -> bool {
    line.trim_start().starts_with('#')
}

/// Splits one line into tokens, honouring trailing comments.
pub fn tokenize_line(line: &str) -> Vec<&str> {
    let mut tokens = Vec::new();
    for tok in line.split_whitespace() {
        match tok.find('#') {
            Some(0) => break,
            Some(pos) => {
                tokens.push(&tok[..pos]);
                break;
            }
            None => tokens.push(tok),
        }
    }
    tokens
}
