//! Injection-safe FTS5 query construction.
//!
//! User queries are tokenized with a quote-toggle state machine: balanced
//! double quotes form phrase tokens, whitespace separates word tokens, and
//! an unbalanced quote simply closes at end of input. Every token is
//! emitted quoted with inner quotes doubled, so no input can produce an
//! FTS5 parse error. The engine query prefers an exact-phrase hit over the
//! token disjunction:
//!
//! ```text
//! ("<all words joined>") OR ("t1" OR "t2" OR … OR "tn")
//! ```

/// Tokenize with the quote-toggle state machine. Phrase tokens keep their
/// inner spacing; empty tokens never appear.
pub fn tokenize(query: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;

    for ch in query.chars() {
        match ch {
            '"' => {
                if in_quotes {
                    // closing quote ends the phrase token
                    if !current.is_empty() {
                        tokens.push(std::mem::take(&mut current));
                    }
                    in_quotes = false;
                } else {
                    // an opening quote also terminates any word in flight
                    if !current.is_empty() {
                        tokens.push(std::mem::take(&mut current));
                    }
                    in_quotes = true;
                }
            }
            c if c.is_whitespace() && !in_quotes => {
                if !current.is_empty() {
                    tokens.push(std::mem::take(&mut current));
                }
            }
            c => current.push(c),
        }
    }
    if !current.is_empty() {
        tokens.push(current);
    }
    tokens
}

fn quote(token: &str) -> String {
    format!("\"{}\"", token.replace('"', "\"\""))
}

/// Build the engine query, or `None` for input with no tokens.
pub fn build_match_query(query: &str) -> Option<String> {
    let tokens = tokenize(query);
    if tokens.is_empty() {
        return None;
    }

    // exact phrase: every word of every token, in order
    let words: Vec<&str> = tokens
        .iter()
        .flat_map(|t| t.split_whitespace())
        .collect();
    let exact = quote(&words.join(" "));

    let alternatives = tokens
        .iter()
        .map(|t| quote(t))
        .collect::<Vec<_>>()
        .join(" OR ");

    Some(format!("({}) OR ({})", exact, alternatives))
}
