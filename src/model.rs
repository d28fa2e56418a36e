//! Second-order (by default) Markov chain over whitespace tokens.
//!
//! A model is a map from a state (the `state_size` preceding tokens) to the
//! tokens observed after it, with occurrence counts. Sentences are padded with
//! [`BEGIN`] markers and terminated with [`END`], so every generated walk
//! starts at the all-`BEGIN` state and finishes when it samples `END`.
//!
//! Models are merged by summing counts, which makes merge commutative and
//! associative: a participant's model can be grown one message at a time
//! without ever revisiting old messages.

use std::collections::BTreeMap;

use rand::distributions::{Distribution, WeightedIndex};
use rand::Rng;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use crate::error::ModelError;
use crate::text::{self, BEGIN, END};

pub const DEFAULT_STATE_SIZE: usize = 2;
pub const DEFAULT_MAX_ATTEMPTS: usize = 10;

/// Longest walk accepted before it is treated as a runaway loop.
const MAX_WALK_TOKENS: usize = 256;

const RECORD_FORMAT: &str = "mimic-bot/markov-v1";
const COMPRESSION_LEVEL: i32 = 3;

type State = Vec<String>;
type Transitions = FxHashMap<String, u64>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BuildOptions {
    pub state_size: usize,
    /// When false, sentences failing [`text::is_literary_sentence`] are skipped.
    pub accept_any_sentence: bool,
}

impl Default for BuildOptions {
    fn default() -> Self {
        Self {
            state_size: DEFAULT_STATE_SIZE,
            accept_any_sentence: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TextModel {
    state_size: usize,
    corpus_size: u64,
    chain: FxHashMap<State, Transitions>,
}

/// On-disk shape of a model. The chain is a sorted list so equal models
/// always produce identical bytes.
#[derive(Serialize, Deserialize)]
struct ModelRecord {
    format: String,
    state_size: usize,
    corpus_size: u64,
    chain: Vec<(State, BTreeMap<String, u64>)>,
}

impl TextModel {
    pub fn empty(state_size: usize) -> Self {
        Self {
            state_size: state_size.max(1),
            corpus_size: 0,
            chain: FxHashMap::default(),
        }
    }

    /// Build a model from a multi-sentence corpus.
    pub fn build(corpus: &str, options: &BuildOptions) -> Self {
        let mut model = Self::empty(options.state_size);
        for sentence in text::split_sentences(corpus) {
            if !options.accept_any_sentence && !text::is_literary_sentence(sentence) {
                continue;
            }
            model.add_sentence(&text::tokenize(sentence));
        }
        model
    }

    /// Build a model treating the whole text as one sentence. Chat messages
    /// take this path: fragments, single words and URLs are all kept.
    pub fn from_sentence(sentence: &str, state_size: usize) -> Self {
        let mut model = Self::empty(state_size);
        model.add_sentence(&text::tokenize(sentence));
        model
    }

    fn add_sentence(&mut self, tokens: &[String]) {
        if tokens.is_empty() {
            return;
        }

        let mut padded: Vec<&str> = Vec::with_capacity(tokens.len() + self.state_size + 1);
        padded.extend(std::iter::repeat(BEGIN).take(self.state_size));
        padded.extend(tokens.iter().map(String::as_str));
        padded.push(END);

        for window in padded.windows(self.state_size + 1) {
            let (state, next) = window.split_at(self.state_size);
            let state: State = state.iter().map(|s| s.to_string()).collect();
            *self
                .chain
                .entry(state)
                .or_default()
                .entry(next[0].to_string())
                .or_insert(0) += 1;
        }

        self.corpus_size += 1;
    }

    pub fn state_size(&self) -> usize {
        self.state_size
    }

    /// Number of sentences that went into this model, across merges.
    pub fn corpus_size(&self) -> u64 {
        self.corpus_size
    }

    pub fn state_count(&self) -> usize {
        self.chain.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chain.is_empty()
    }

    /// Observed count of `next` following `state`, zero when never seen.
    pub fn count(&self, state: &[&str], next: &str) -> u64 {
        let state: State = state.iter().map(|s| s.to_string()).collect();
        self.chain
            .get(&state)
            .and_then(|transitions| transitions.get(next))
            .copied()
            .unwrap_or(0)
    }

    /// Key-wise then count-wise sum of two chains of the same order.
    pub fn merge(&self, other: &TextModel) -> Result<TextModel, ModelError> {
        if self.state_size != other.state_size {
            return Err(ModelError::IncompatibleModel {
                left: self.state_size,
                right: other.state_size,
            });
        }

        let mut merged = self.clone();
        for (state, transitions) in &other.chain {
            let entry = merged.chain.entry(state.clone()).or_default();
            for (next, count) in transitions {
                *entry.entry(next.clone()).or_insert(0) += count;
            }
        }
        merged.corpus_size += other.corpus_size;
        Ok(merged)
    }

    /// Fold any number of models into one, starting from an empty model.
    pub fn merge_all<I>(state_size: usize, models: I) -> Result<TextModel, ModelError>
    where
        I: IntoIterator<Item = TextModel>,
    {
        models
            .into_iter()
            .try_fold(TextModel::empty(state_size), |acc, model| acc.merge(&model))
    }

    pub fn generate_sentence(&self, max_attempts: usize) -> Option<String> {
        self.generate_sentence_with(&mut rand::thread_rng(), max_attempts)
    }

    /// Random walk from the start state, retried up to `max_attempts` times
    /// until a non-empty walk reaches `END` within the length cap.
    pub fn generate_sentence_with<R: Rng + ?Sized>(
        &self,
        rng: &mut R,
        max_attempts: usize,
    ) -> Option<String> {
        if self.is_empty() {
            return None;
        }

        for _ in 0..max_attempts {
            match self.walk(rng) {
                Some(words) if !words.is_empty() => return Some(text::detokenize(&words)),
                _ => continue,
            }
        }
        None
    }

    fn walk<R: Rng + ?Sized>(&self, rng: &mut R) -> Option<Vec<&str>> {
        let mut state: State = vec![BEGIN.to_string(); self.state_size];
        let mut words = Vec::new();

        while words.len() < MAX_WALK_TOKENS {
            let transitions = self.chain.get(&state)?;
            let choices: Vec<(&String, &u64)> = transitions.iter().collect();
            let dist = WeightedIndex::new(choices.iter().map(|(_, count)| **count)).ok()?;
            let next = choices[dist.sample(rng)].0;

            if next == END {
                return Some(words);
            }
            words.push(next.as_str());
            state.remove(0);
            state.push(next.clone());
        }

        None
    }

    pub fn serialize(&self) -> Result<Vec<u8>, ModelError> {
        let mut chain: Vec<(State, BTreeMap<String, u64>)> = self
            .chain
            .iter()
            .map(|(state, transitions)| {
                let sorted = transitions
                    .iter()
                    .map(|(next, count)| (next.clone(), *count))
                    .collect();
                (state.clone(), sorted)
            })
            .collect();
        chain.sort_by(|a, b| a.0.cmp(&b.0));

        let record = ModelRecord {
            format: RECORD_FORMAT.to_string(),
            state_size: self.state_size,
            corpus_size: self.corpus_size,
            chain,
        };
        let json = serde_json::to_vec(&record).map_err(|e| ModelError::Encode(e.to_string()))?;
        zstd::encode_all(&json[..], COMPRESSION_LEVEL).map_err(|e| ModelError::Encode(e.to_string()))
    }

    pub fn deserialize(bytes: &[u8]) -> Result<TextModel, ModelError> {
        let json = zstd::decode_all(bytes)
            .map_err(|e| ModelError::CorruptModel(format!("not a compressed record: {e}")))?;
        let record: ModelRecord = serde_json::from_slice(&json)
            .map_err(|e| ModelError::CorruptModel(format!("malformed record: {e}")))?;

        if record.format != RECORD_FORMAT {
            return Err(ModelError::CorruptModel(format!(
                "unknown record format `{}`",
                record.format
            )));
        }
        if record.state_size == 0 {
            return Err(ModelError::CorruptModel("state size is zero".to_string()));
        }

        let mut chain: FxHashMap<State, Transitions> = FxHashMap::default();
        for (state, transitions) in record.chain {
            if state.len() != record.state_size {
                return Err(ModelError::CorruptModel(format!(
                    "state of length {} in a chain of order {}",
                    state.len(),
                    record.state_size
                )));
            }
            if transitions.is_empty() || transitions.values().any(|count| *count == 0) {
                return Err(ModelError::CorruptModel(
                    "state without positive transition counts".to_string(),
                ));
            }
            if chain.insert(state, transitions.into_iter().collect()).is_some() {
                return Err(ModelError::CorruptModel("duplicate state".to_string()));
            }
        }

        Ok(TextModel {
            state_size: record.state_size,
            corpus_size: record.corpus_size,
            chain,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn build(corpus: &str) -> TextModel {
        TextModel::build(corpus, &BuildOptions::default())
    }

    fn encode_record(record: &ModelRecord) -> Vec<u8> {
        let json = serde_json::to_vec(record).unwrap();
        zstd::encode_all(&json[..], COMPRESSION_LEVEL).unwrap()
    }

    #[test]
    fn build_pads_sentence_with_markers() {
        let model = build("hello world");
        assert_eq!(model.corpus_size(), 1);
        assert_eq!(model.state_count(), 3);
        assert_eq!(model.count(&[BEGIN, BEGIN], "hello"), 1);
        assert_eq!(model.count(&[BEGIN, "hello"], "world"), 1);
        assert_eq!(model.count(&["hello", "world"], END), 1);
    }

    #[test]
    fn build_accepts_fragments_and_urls() {
        let model = build("lol\nhttps://example.com/x?y=(1)\n\"quoted\" thing");
        assert_eq!(model.corpus_size(), 3);
        assert_eq!(model.count(&[BEGIN, BEGIN], "lol"), 1);
        assert_eq!(model.count(&[BEGIN, BEGIN], "https://example.com/x?y=(1)"), 1);
    }

    #[test]
    fn strict_build_skips_noisy_sentences() {
        let options = BuildOptions {
            accept_any_sentence: false,
            ..BuildOptions::default()
        };
        let model = TextModel::build("Call me Ishmael.\n(an aside)\n\"quoted\" thing", &options);
        assert_eq!(model.corpus_size(), 1);
        assert_eq!(model.count(&[BEGIN, BEGIN], "Call"), 1);
    }

    #[test]
    fn empty_corpus_builds_empty_model() {
        let model = build("");
        assert!(model.is_empty());
        assert_eq!(model, TextModel::empty(DEFAULT_STATE_SIZE));
        assert_eq!(model.generate_sentence(DEFAULT_MAX_ATTEMPTS), None);
    }

    #[test]
    fn from_sentence_ignores_terminators() {
        let model = TextModel::from_sentence("one. two! three?", DEFAULT_STATE_SIZE);
        assert_eq!(model.corpus_size(), 1);
        assert_eq!(model.count(&["one.", "two!"], "three?"), 1);
    }

    #[test]
    fn merge_sums_counts() {
        let a = build("the cat sat");
        let b = build("the cat ran\nthe cat sat");
        let merged = a.merge(&b).unwrap();
        assert_eq!(merged.count(&["the", "cat"], "sat"), 2);
        assert_eq!(merged.count(&["the", "cat"], "ran"), 1);
        assert_eq!(merged.count(&[BEGIN, BEGIN], "the"), 3);
        assert_eq!(merged.corpus_size(), 3);
    }

    #[test]
    fn merge_is_commutative_and_associative() {
        let a = build("the cat sat on the mat");
        let b = build("the dog sat on the log\nthe cat ran");
        let c = build("a bird flew over the mat");

        assert_eq!(a.merge(&b).unwrap(), b.merge(&a).unwrap());
        assert_eq!(
            a.merge(&b).unwrap().merge(&c).unwrap(),
            a.merge(&b.merge(&c).unwrap()).unwrap()
        );
    }

    #[test]
    fn merge_with_empty_is_identity() {
        let a = build("some words here. and more");
        let empty = TextModel::empty(DEFAULT_STATE_SIZE);
        assert_eq!(a.merge(&empty).unwrap(), a);
        assert_eq!(empty.merge(&a).unwrap(), a);
    }

    #[test]
    fn merge_rejects_different_orders() {
        let a = build("one two three");
        let b = TextModel::from_sentence("one two three", 3);
        assert_eq!(
            a.merge(&b),
            Err(ModelError::IncompatibleModel { left: 2, right: 3 })
        );
    }

    #[test]
    fn merge_all_matches_building_at_once() {
        let parts = ["alpha beta gamma", "beta gamma delta", "alpha beta delta"];
        let merged = TextModel::merge_all(DEFAULT_STATE_SIZE, parts.iter().map(|p| build(p))).unwrap();
        assert_eq!(merged, build(&parts.join("\n")));
    }

    #[test]
    fn single_sentence_model_reproduces_it() {
        let model = build("hello world");
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..20 {
            assert_eq!(
                model.generate_sentence_with(&mut rng, DEFAULT_MAX_ATTEMPTS).as_deref(),
                Some("hello world")
            );
        }
    }

    #[test]
    fn generation_follows_observed_counts() {
        let mut corpus = String::new();
        for _ in 0..9 {
            corpus.push_str("the cat sat\n");
        }
        corpus.push_str("the cat ran\n");
        let model = build(&corpus);

        let mut rng = StdRng::seed_from_u64(42);
        let samples = 2000;
        let sat = (0..samples)
            .filter(|_| model.generate_sentence_with(&mut rng, 1).as_deref() == Some("the cat sat"))
            .count();
        let ratio = sat as f64 / samples as f64;
        assert!((0.86..=0.94).contains(&ratio), "observed ratio {ratio}");
    }

    #[test]
    fn runaway_walk_is_rejected() {
        let cycle = |tokens: [&str; 2], next: &str| {
            (
                tokens.iter().map(|s| s.to_string()).collect::<State>(),
                BTreeMap::from([(next.to_string(), 1)]),
            )
        };
        let record = ModelRecord {
            format: RECORD_FORMAT.to_string(),
            state_size: 2,
            corpus_size: 1,
            chain: vec![
                cycle([BEGIN, BEGIN], "a"),
                cycle([BEGIN, "a"], "a"),
                cycle(["a", "a"], "a"),
            ],
        };
        let model = TextModel::deserialize(&encode_record(&record)).unwrap();
        assert_eq!(model.generate_sentence(3), None);
    }

    #[test]
    fn round_trip_preserves_counts() {
        let model = build("the cat sat\nthe cat sat\nthe dog ran. a b c");
        let restored = TextModel::deserialize(&model.serialize().unwrap()).unwrap();
        assert_eq!(restored, model);

        let empty = TextModel::empty(DEFAULT_STATE_SIZE);
        assert_eq!(TextModel::deserialize(&empty.serialize().unwrap()).unwrap(), empty);
    }

    #[test]
    fn serialized_bytes_do_not_depend_on_merge_order() {
        let a = build("x y z\nx y w");
        let b = build("y z x");
        assert_eq!(
            a.merge(&b).unwrap().serialize().unwrap(),
            b.merge(&a).unwrap().serialize().unwrap()
        );
    }

    #[test]
    fn deserialize_rejects_garbage() {
        assert!(matches!(
            TextModel::deserialize(b"definitely not zstd"),
            Err(ModelError::CorruptModel(_))
        ));

        let not_json = zstd::encode_all(&b"{ nope"[..], COMPRESSION_LEVEL).unwrap();
        assert!(matches!(
            TextModel::deserialize(&not_json),
            Err(ModelError::CorruptModel(_))
        ));
    }

    #[test]
    fn deserialize_validates_shape() {
        let wrong_length = ModelRecord {
            format: RECORD_FORMAT.to_string(),
            state_size: 2,
            corpus_size: 1,
            chain: vec![(vec![BEGIN.to_string()], BTreeMap::from([("a".to_string(), 1)]))],
        };
        assert!(TextModel::deserialize(&encode_record(&wrong_length)).is_err());

        let zero_count = ModelRecord {
            format: RECORD_FORMAT.to_string(),
            state_size: 2,
            corpus_size: 1,
            chain: vec![(
                vec![BEGIN.to_string(), BEGIN.to_string()],
                BTreeMap::from([("a".to_string(), 0)]),
            )],
        };
        assert!(TextModel::deserialize(&encode_record(&zero_count)).is_err());

        let wrong_format = ModelRecord {
            format: "something-else".to_string(),
            state_size: 2,
            corpus_size: 0,
            chain: Vec::new(),
        };
        assert!(TextModel::deserialize(&encode_record(&wrong_format)).is_err());
    }
}
