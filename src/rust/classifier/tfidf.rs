use std::collections::{HashMap, HashSet};

use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};

use super::error::{ClassifierError, Result};
use super::utils::tokenize;
use crate::config::StopWords;

const ENGLISH_STOP_WORDS: &[&str] = &[
    "a", "about", "above", "across", "after", "afterwards", "again", "against", "all", "almost",
    "alone", "along", "already", "also", "although", "always", "am", "among", "amongst",
    "amoungst", "amount", "an", "and", "another", "any", "anyhow", "anyone", "anything", "anyway",
    "anywhere", "are", "around", "as", "at", "back", "be", "became", "because", "become",
    "becomes", "becoming", "been", "before", "beforehand", "behind", "being", "below", "beside",
    "besides", "between", "beyond", "bill", "both", "bottom", "but", "by", "call", "can",
    "cannot", "cant", "co", "con", "could", "couldnt", "cry", "de", "describe", "detail", "do",
    "done", "down", "due", "during", "each", "eg", "eight", "either", "eleven", "else",
    "elsewhere", "empty", "enough", "etc", "even", "ever", "every", "everyone", "everything",
    "everywhere", "except", "few", "fifteen", "fifty", "fill", "find", "fire", "first", "five",
    "for", "former", "formerly", "forty", "found", "four", "from", "front", "full", "further",
    "get", "give", "go", "had", "has", "hasnt", "have", "he", "hence", "her", "here", "hereafter",
    "hereby", "herein", "hereupon", "hers", "herself", "him", "himself", "his", "how", "however",
    "hundred", "i", "ie", "if", "in", "inc", "indeed", "interest", "into", "is", "it", "its",
    "itself", "keep", "last", "latter", "latterly", "least", "less", "ltd", "made", "many", "may",
    "me", "meanwhile", "might", "mill", "mine", "more", "moreover", "most", "mostly", "move",
    "much", "must", "my", "myself", "name", "namely", "neither", "never", "nevertheless", "next",
    "nine", "no", "nobody", "none", "noone", "nor", "not", "nothing", "now", "nowhere", "of",
    "off", "often", "on", "once", "one", "only", "onto", "or", "other", "others", "otherwise",
    "our", "ours", "ourselves", "out", "over", "own", "part", "per", "perhaps", "please", "put",
    "rather", "re", "same", "see", "seem", "seemed", "seeming", "seems", "serious", "several",
    "she", "should", "show", "side", "since", "sincere", "six", "sixty", "so", "some", "somehow",
    "someone", "something", "sometime", "sometimes", "somewhere", "still", "such", "system",
    "take", "ten", "than", "that", "the", "their", "them", "themselves", "then", "thence",
    "there", "thereafter", "thereby", "therefore", "therein", "thereupon", "these", "they",
    "thick", "thin", "third", "this", "those", "though", "three", "through", "throughout", "thru",
    "thus", "to", "together", "too", "top", "toward", "towards", "twelve", "twenty", "two", "un",
    "under", "until", "up", "upon", "us", "very", "via", "was", "we", "well", "were", "what",
    "whatever", "when", "whence", "whenever", "where", "whereafter", "whereas", "whereby",
    "wherein", "whereupon", "wherever", "whether", "which", "while", "whither", "who", "whoever",
    "whole", "whom", "whose", "why", "will", "with", "within", "without", "would", "yet", "you",
    "your", "yours", "yourself", "yourselves",
];

fn stop_word_set(policy: &StopWords) -> HashSet<String> {
    match policy {
        StopWords::English => ENGLISH_STOP_WORDS.iter().map(|w| w.to_string()).collect(),
        StopWords::None => HashSet::new(),
        StopWords::Custom(words) => words.iter().map(|w| w.to_lowercase()).collect(),
    }
}

/// Sublinear TF-IDF features over an alphabetically ordered vocabulary.
///
/// Terms are lower-cased words of at least two characters. Term counts become
/// `1 + ln(tf)`, the inverse document frequency is smoothed as
/// `ln((1 + n) / (1 + df)) + 1` and every row is L2 normalised.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(from = "VectorizerState", into = "VectorizerState")]
pub struct TfIdfVectorizer {
    stop_words: StopWords,
    stop_set: HashSet<String>,
    vocabulary: Vec<String>,
    index: HashMap<String, usize>,
    idf: Array1<f32>,
}

#[derive(Serialize, Deserialize)]
struct VectorizerState {
    stop_words: StopWords,
    vocabulary: Vec<String>,
    idf: Array1<f32>,
}

impl From<VectorizerState> for TfIdfVectorizer {
    fn from(state: VectorizerState) -> Self {
        Self::from_parts(state.stop_words, state.vocabulary, state.idf)
    }
}

impl From<TfIdfVectorizer> for VectorizerState {
    fn from(vectorizer: TfIdfVectorizer) -> Self {
        Self {
            stop_words: vectorizer.stop_words,
            vocabulary: vectorizer.vocabulary,
            idf: vectorizer.idf,
        }
    }
}

impl TfIdfVectorizer {
    fn from_parts(stop_words: StopWords, vocabulary: Vec<String>, idf: Array1<f32>) -> Self {
        let index = vocabulary
            .iter()
            .enumerate()
            .map(|(i, term)| (term.clone(), i))
            .collect();
        Self {
            stop_set: stop_word_set(&stop_words),
            stop_words,
            vocabulary,
            index,
            idf,
        }
    }

    fn terms(stop_set: &HashSet<String>, text: &str) -> Vec<String> {
        tokenize(text)
            .into_iter()
            .filter(|token| token.chars().count() >= 2 && !stop_set.contains(token))
            .collect()
    }

    /// Learns the vocabulary and document frequencies of `texts`.
    ///
    /// # Errors
    /// - `TrainingFailure` if no term survives tokenization and stop word removal
    pub fn fit<S: AsRef<str>>(texts: &[S], stop_words: StopWords) -> Result<Self> {
        let stop_set = stop_word_set(&stop_words);
        let mut document_frequency: HashMap<String, usize> = HashMap::new();
        for text in texts {
            let unique: HashSet<String> = Self::terms(&stop_set, text.as_ref()).into_iter().collect();
            for term in unique {
                *document_frequency.entry(term).or_insert(0) += 1;
            }
        }
        if document_frequency.is_empty() {
            return Err(ClassifierError::TrainingFailure(
                "Empty vocabulary; perhaps the documents only contain stop words".into(),
            ));
        }

        let mut vocabulary: Vec<String> = document_frequency.keys().cloned().collect();
        vocabulary.sort();
        let n = texts.len() as f32;
        let idf = vocabulary
            .iter()
            .map(|term| ((1.0 + n) / (1.0 + document_frequency[term] as f32)).ln() + 1.0)
            .collect();
        log::debug!("TF-IDF vocabulary of {} terms from {} texts", vocabulary.len(), texts.len());
        Ok(Self::from_parts(stop_words, vocabulary, idf))
    }

    pub fn vocabulary_size(&self) -> usize {
        self.vocabulary.len()
    }

    /// One L2 normalised row per text; unknown terms are ignored.
    pub fn transform<S: AsRef<str>>(&self, texts: &[S]) -> Array2<f32> {
        let mut features = Array2::zeros((texts.len(), self.vocabulary.len()));
        for (mut row, text) in features.rows_mut().into_iter().zip(texts) {
            let mut counts: HashMap<usize, usize> = HashMap::new();
            for term in Self::terms(&self.stop_set, text.as_ref()) {
                if let Some(&column) = self.index.get(&term) {
                    *counts.entry(column).or_insert(0) += 1;
                }
            }
            for (column, count) in counts {
                row[column] = (1.0 + (count as f32).ln()) * self.idf[column];
            }
            let norm = row.dot(&row).sqrt();
            if norm > 0.0 {
                row /= norm;
            }
        }
        features
    }
}
