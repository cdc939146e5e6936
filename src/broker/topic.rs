//! Topic patterns
//!
//! Routing keys and binding patterns are dot-separated words. In a pattern
//! `*` stands for exactly one word and `#` for zero or more words, so
//! `logs.*.error` matches `logs.auth.error` but neither `logs.error` nor
//! `logs.auth.warn.error`, while `logs.#` matches all three.
//!
//! An empty key or pattern has zero words.

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Word(String),
    Star,
    Hash,
}

/// A binding pattern compiled once at bind time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicPattern {
    raw: String,
    tokens: Vec<Token>,
}

impl TopicPattern {
    pub fn new(pattern: &str) -> Self {
        let mut tokens = Vec::new();
        for word in words(pattern) {
            let token = match word {
                "*" => Token::Star,
                "#" => Token::Hash,
                w => Token::Word(w.to_string()),
            };
            // "#.#" is the same as "#"
            if token == Token::Hash && tokens.last() == Some(&Token::Hash) {
                continue;
            }
            tokens.push(token);
        }
        Self {
            raw: pattern.to_string(),
            tokens,
        }
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn matches(&self, routing_key: &str) -> bool {
        let key: Vec<&str> = words(routing_key).collect();
        match_tokens(&self.tokens, &key)
    }
}

/// Convenience for one-off checks.
pub fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    TopicPattern::new(pattern).matches(routing_key)
}

fn words(s: &str) -> impl Iterator<Item = &str> {
    let empty = s.is_empty();
    s.split('.').filter(move |_| !empty)
}

/// `reached[j]` holds when the tokens seen so far can consume exactly the
/// first `j` words of the key. One row per token keeps matching linear in
/// `tokens × words`.
fn match_tokens(pattern: &[Token], key: &[&str]) -> bool {
    let mut reached = vec![false; key.len() + 1];
    reached[0] = true;
    let mut next = vec![false; key.len() + 1];

    for token in pattern {
        match token {
            Token::Hash => {
                let mut any = false;
                for j in 0..=key.len() {
                    any |= reached[j];
                    next[j] = any;
                }
            }
            Token::Star => {
                next[0] = false;
                for j in 1..=key.len() {
                    next[j] = reached[j - 1];
                }
            }
            Token::Word(word) => {
                next[0] = false;
                for j in 1..=key.len() {
                    next[j] = reached[j - 1] && key[j - 1] == word.as_str();
                }
            }
        }
        std::mem::swap(&mut reached, &mut next);
        if !reached.contains(&true) {
            return false;
        }
    }
    reached[key.len()]
}
