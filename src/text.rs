//! Sentence splitting and tokenization rules shared by model building and
//! generation output.
//!
//! The rules are deliberately simple and fixed:
//! - a corpus is split into lines, and each line after any run of `.`, `!`
//!   or `?` that is followed by whitespace;
//! - a sentence is split into words on whitespace;
//! - generated words are joined back with single spaces.

use std::sync::OnceLock;

use regex::Regex;

/// Reserved token that pads the start of every sentence.
pub const BEGIN: &str = "___BEGIN__";
/// Reserved token that terminates every sentence.
pub const END: &str = "___END__";

fn is_terminator(c: char) -> bool {
    matches!(c, '.' | '!' | '?')
}

pub fn is_reserved(token: &str) -> bool {
    token == BEGIN || token == END
}

/// Split a corpus into sentences. Terminators stay attached to the sentence
/// they end; blank pieces are dropped.
pub fn split_sentences(corpus: &str) -> Vec<&str> {
    let mut sentences = Vec::new();

    for line in corpus.lines() {
        let mut start = 0;
        let mut prev_terminal = false;

        for (i, c) in line.char_indices() {
            if c.is_whitespace() && prev_terminal {
                push_trimmed(&mut sentences, &line[start..i]);
                start = i;
            }
            prev_terminal = is_terminator(c);
        }
        push_trimmed(&mut sentences, &line[start..]);
    }

    sentences
}

fn push_trimmed<'a>(out: &mut Vec<&'a str>, piece: &'a str) {
    let piece = piece.trim();
    if !piece.is_empty() {
        out.push(piece);
    }
}

/// Whitespace tokenization. Reserved marker strings are dropped so that user
/// text can never forge a begin or end transition.
pub fn tokenize(sentence: &str) -> Vec<String> {
    sentence
        .split_whitespace()
        .filter(|token| !is_reserved(token))
        .map(str::to_string)
        .collect()
}

fn reject_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r#"(^')|('$)|\s'|'\s|["()\[\]]"#).expect("static pattern is valid")
    })
}

/// Strict filter for prose corpora: rejects sentences with brackets, double
/// quotes or dangling single quotes, which tend to produce unbalanced output.
pub fn is_literary_sentence(sentence: &str) -> bool {
    !sentence.trim().is_empty() && !reject_pattern().is_match(sentence)
}

pub fn detokenize<S: AsRef<str>>(tokens: &[S]) -> String {
    let mut out = String::new();
    for token in tokens {
        if !out.is_empty() {
            out.push(' ');
        }
        out.push_str(token.as_ref());
    }
    out
}

/// Lookup key for a named reference text: lowercased words joined by `_`.
pub fn text_key<S: AsRef<str>>(words: &[S]) -> String {
    let joined = detokenize(words).to_lowercase();
    joined.split_whitespace().collect::<Vec<_>>().join("_")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_on_terminators_followed_by_space() {
        let sentences = split_sentences("Hello there. How are you? Fine!\nnew line");
        assert_eq!(sentences, vec!["Hello there.", "How are you?", "Fine!", "new line"]);
    }

    #[test]
    fn keeps_urls_and_decimals_intact() {
        let sentences = split_sentences("see https://example.com/a.b for 3.14 pies");
        assert_eq!(sentences, vec!["see https://example.com/a.b for 3.14 pies"]);
    }

    #[test]
    fn runs_of_terminators_stay_together() {
        let sentences = split_sentences("what?! no...   ok");
        assert_eq!(sentences, vec!["what?!", "no...", "ok"]);
    }

    #[test]
    fn blank_corpus_has_no_sentences() {
        assert!(split_sentences("").is_empty());
        assert!(split_sentences("  \n\t\n").is_empty());
    }

    #[test]
    fn tokenize_drops_reserved_markers() {
        let tokens = tokenize("a ___END__ b\t___BEGIN__ c");
        assert_eq!(tokens, vec!["a", "b", "c"]);
    }

    #[test]
    fn strict_filter_rejects_brackets_and_quotes() {
        assert!(is_literary_sentence("It was the best of times."));
        assert!(is_literary_sentence("don't stop"));
        assert!(!is_literary_sentence("he said \"no\""));
        assert!(!is_literary_sentence("an aside (really)"));
        assert!(!is_literary_sentence("'quoted"));
        assert!(!is_literary_sentence("dangling ' quote"));
    }

    #[test]
    fn text_key_lowercases_and_joins() {
        assert_eq!(text_key(&["Moby", "Dick"]), "moby_dick");
        assert_eq!(text_key(&["  War  and", "PEACE"]), "war_and_peace");
    }
}
