use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::PathBuf;

use ndarray::{Array1, Array2, ArrayView1};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::error::{ClassifierError, Result};
use super::utils::{average_vectors, normalize_vector, tokenize};

/// Token id reserved for padding; padded positions are masked out by the recurrent layer.
pub const PADDING_ID: usize = 0;
/// Token id shared by every word missing from the vocabulary.
pub const UNKNOWN_ID: usize = 1;

/// Converts raw text into the numeric form a network consumes.
///
/// Implementations must be deterministic: the same text always encodes to the
/// same row, which is what lets a restored classifier reproduce its predictions.
pub trait Embedder: fmt::Display {
    /// Element type of an encoded row (`f32` vectors or `usize` token ids)
    type Element: Clone;

    /// Encodes a batch of texts, one row per text, `encoding_shape()` columns.
    fn encode<S: AsRef<str>>(&self, texts: &[S]) -> Array2<Self::Element>;

    /// Number of distinct tokens the embedder can index, `None` when every
    /// token has a vector
    fn vocabulary_size(&self) -> Option<usize>;

    /// Dimensionality of a single word vector
    fn embedding_size(&self) -> usize;

    /// Shape of one encoded text
    fn encoding_shape(&self) -> Vec<usize>;

    /// Pretrained vector table, one row per token id, for embedders that emit ids
    fn embedding_matrix(&self) -> Option<Array2<f32>> {
        None
    }
}

/// Where word vectors come from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum VectorSource {
    /// Deterministic unit vectors derived from a SHA-256 digest of the token
    Hashed { dimension: usize, seed: u64 },
    /// Whitespace separated text table, one `word v1 v2 ... vn` entry per line
    Table { path: PathBuf },
}

impl Default for VectorSource {
    fn default() -> Self {
        Self::Hashed { dimension: 50, seed: 42 }
    }
}

impl fmt::Display for VectorSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Hashed { seed, .. } => write!(f, "hashed word vectors (seed {})", seed),
            Self::Table { path } => write!(f, "word vectors from {}", path.display()),
        }
    }
}

/// A word vector table. Table entries are persisted along with the source, so a
/// restored artifact does not depend on the original file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "StoredVectors", into = "StoredVectors")]
pub struct WordVectors {
    source: VectorSource,
    dimension: usize,
    table: HashMap<String, Array1<f32>>,
}

impl WordVectors {
    pub fn hashed(dimension: usize, seed: u64) -> Self {
        Self {
            source: VectorSource::Hashed { dimension, seed },
            dimension,
            table: HashMap::new(),
        }
    }

    /// Materialises the vectors `source` describes.
    ///
    /// # Errors
    /// - see `from_table`
    pub fn load(source: &VectorSource) -> Result<Self> {
        match source {
            VectorSource::Hashed { dimension, seed } => Ok(Self::hashed(*dimension, *seed)),
            VectorSource::Table { path } => Self::from_table(path.clone()),
        }
    }

    /// Reads a GloVe style table.
    ///
    /// # Errors
    /// - `PersistenceIo` if the file cannot be read
    /// - `CorruptArtifact` if a value does not parse or rows disagree on dimension
    pub fn from_table(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let file = File::open(&path).map_err(|e| ClassifierError::io(&path, e))?;

        let mut table = HashMap::new();
        let mut dimension = None;
        for (line_number, line) in BufReader::new(file).lines().enumerate() {
            let line = line.map_err(|e| ClassifierError::io(&path, e))?;
            let mut fields = line.split_whitespace();
            let Some(word) = fields.next() else {
                continue;
            };
            let values = fields
                .map(str::parse::<f32>)
                .collect::<std::result::Result<Vec<_>, _>>()
                .map_err(|e| ClassifierError::corrupt(&path, format!("line {}: {}", line_number + 1, e)))?;

            match dimension {
                None => dimension = Some(values.len()),
                Some(d) if d != values.len() => {
                    return Err(ClassifierError::corrupt(
                        &path,
                        format!("line {} has {} values, expected {}", line_number + 1, values.len(), d),
                    ));
                }
                Some(_) => {}
            }
            table.insert(word.to_string(), Array1::from(values));
        }

        let dimension = dimension
            .filter(|&d| d > 0)
            .ok_or_else(|| ClassifierError::corrupt(&path, "no word vectors found"))?;
        log::info!("Loaded {} word vectors of dimension {} from {:?}", table.len(), dimension, path);

        Ok(Self {
            source: VectorSource::Table { path },
            dimension,
            table,
        })
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn source(&self) -> &VectorSource {
        &self.source
    }

    /// Vector for `token`, `None` when a table has no entry for it.
    pub fn lookup(&self, token: &str) -> Option<Array1<f32>> {
        match &self.source {
            VectorSource::Hashed { dimension, seed } => Some(hashed_vector(token, *dimension, *seed)),
            VectorSource::Table { .. } => self.table.get(token).cloned(),
        }
    }

    /// Number of words with a stored vector, `None` for hashed vectors.
    pub fn word_count(&self) -> Option<usize> {
        match self.source {
            VectorSource::Hashed { .. } => None,
            VectorSource::Table { .. } => Some(self.table.len()),
        }
    }

    /// A copy holding only the table entries of `words`.
    pub fn restricted_to<'a>(&self, words: impl IntoIterator<Item = &'a String>) -> Self {
        let table = words
            .into_iter()
            .filter_map(|word| self.table.get(word).map(|vector| (word.clone(), vector.clone())))
            .collect();
        Self {
            source: self.source.clone(),
            dimension: self.dimension,
            table,
        }
    }
}

impl Default for WordVectors {
    fn default() -> Self {
        Self::hashed(50, 42)
    }
}

impl From<WordVectors> for VectorSource {
    fn from(vectors: WordVectors) -> Self {
        vectors.source
    }
}

/// Serialized form of `WordVectors`.
#[derive(Serialize, Deserialize)]
struct StoredVectors {
    source: VectorSource,
    dimension: usize,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    entries: BTreeMap<String, Vec<f32>>,
}

impl TryFrom<StoredVectors> for WordVectors {
    type Error = ClassifierError;

    fn try_from(stored: StoredVectors) -> Result<Self> {
        if let VectorSource::Hashed { dimension, .. } = stored.source {
            if dimension != stored.dimension {
                return Err(ClassifierError::ValidationError(format!(
                    "Hashed vectors declare dimension {} but are stored as {}",
                    dimension, stored.dimension
                )));
            }
        }
        let mut table = HashMap::with_capacity(stored.entries.len());
        for (word, values) in stored.entries {
            if values.len() != stored.dimension {
                return Err(ClassifierError::ValidationError(format!(
                    "Stored vector of {:?} has {} values, expected {}",
                    word,
                    values.len(),
                    stored.dimension
                )));
            }
            table.insert(word, Array1::from(values));
        }
        Ok(Self {
            source: stored.source,
            dimension: stored.dimension,
            table,
        })
    }
}

impl From<WordVectors> for StoredVectors {
    fn from(vectors: WordVectors) -> Self {
        Self {
            entries: vectors
                .table
                .into_iter()
                .map(|(word, vector)| (word, vector.to_vec()))
                .collect(),
            source: vectors.source,
            dimension: vectors.dimension,
        }
    }
}

fn hashed_vector(token: &str, dimension: usize, seed: u64) -> Array1<f32> {
    let mut hasher = Sha256::new();
    hasher.update(seed.to_le_bytes());
    hasher.update(token.as_bytes());
    let mut rng_seed = [0u8; 32];
    rng_seed.copy_from_slice(&hasher.finalize());

    let mut rng = StdRng::from_seed(rng_seed);
    let raw = Array1::from_shape_fn(dimension, |_| rng.gen_range(-1.0f32..1.0));
    normalize_vector(&raw)
}

/// Encodes a text as the mean of its word vectors.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BagOfWordsEmbedder {
    vectors: WordVectors,
}

impl BagOfWordsEmbedder {
    pub fn new(vectors: WordVectors) -> Self {
        Self { vectors }
    }

    fn embed_text(&self, text: &str) -> Array1<f32> {
        let vectors: Vec<Array1<f32>> = tokenize(text)
            .iter()
            .filter_map(|token| self.vectors.lookup(token))
            .collect();
        if vectors.is_empty() {
            log::warn!("No known tokens in {:?}, encoding as zeros", text);
        }
        let views: Vec<ArrayView1<f32>> = vectors.iter().map(Array1::view).collect();
        average_vectors(&views, self.vectors.dimension())
    }
}

impl Embedder for BagOfWordsEmbedder {
    type Element = f32;

    fn encode<S: AsRef<str>>(&self, texts: &[S]) -> Array2<f32> {
        let mut encoded = Array2::zeros((texts.len(), self.embedding_size()));
        for (mut row, text) in encoded.rows_mut().into_iter().zip(texts) {
            row.assign(&self.embed_text(text.as_ref()));
        }
        encoded
    }

    fn vocabulary_size(&self) -> Option<usize> {
        self.vectors.word_count()
    }

    fn embedding_size(&self) -> usize {
        self.vectors.dimension()
    }

    fn encoding_shape(&self) -> Vec<usize> {
        vec![self.embedding_size()]
    }
}

impl fmt::Display for BagOfWordsEmbedder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Bag of words embedder: ")?;
        match self.vectors.word_count() {
            Some(words) => write!(f, "vocabulary of {} words", words)?,
            None => write!(f, "open vocabulary")?,
        }
        write!(f, ", {}-dimensional {}", self.vectors.dimension(), self.vectors.source())
    }
}

/// Encodes a text as a fixed-length row of token ids over a vocabulary built from
/// training texts. Id 0 pads, id 1 stands for any out-of-vocabulary word.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(from = "SequenceEmbedderState", into = "SequenceEmbedderState")]
pub struct TextSequenceEmbedder {
    vocabulary: Vec<String>,
    index: HashMap<String, usize>,
    sequence_length: usize,
    vectors: WordVectors,
}

#[derive(Serialize, Deserialize)]
struct SequenceEmbedderState {
    vocabulary: Vec<String>,
    sequence_length: usize,
    vectors: WordVectors,
}

impl From<SequenceEmbedderState> for TextSequenceEmbedder {
    fn from(state: SequenceEmbedderState) -> Self {
        Self::from_parts(state.vocabulary, state.sequence_length, state.vectors)
    }
}

impl From<TextSequenceEmbedder> for SequenceEmbedderState {
    fn from(embedder: TextSequenceEmbedder) -> Self {
        Self {
            vocabulary: embedder.vocabulary,
            sequence_length: embedder.sequence_length,
            vectors: embedder.vectors,
        }
    }
}

impl TextSequenceEmbedder {
    /// Builds the vocabulary from `texts`, most frequent words first.
    ///
    /// # Arguments
    /// * `vocabulary_size` - Cap on the number of ids, the two reserved ids included.
    ///   `None` keeps every word.
    /// * `sequence_length` - Tokens kept per text. `None` uses the token count of the
    ///   longest text.
    ///
    /// # Errors
    /// - `InvalidConfiguration` if the cap leaves no room for words or the length is 0
    pub fn fit<S: AsRef<str>>(
        texts: &[S],
        vocabulary_size: Option<usize>,
        sequence_length: Option<usize>,
        vectors: WordVectors,
    ) -> Result<Self> {
        if let Some(cap) = vocabulary_size {
            if cap <= UNKNOWN_ID + 1 {
                return Err(ClassifierError::InvalidConfiguration(format!(
                    "Vocabulary size {} leaves no room beyond the padding and unknown ids",
                    cap
                )));
            }
        }
        if sequence_length == Some(0) {
            return Err(ClassifierError::InvalidConfiguration(
                "Sequence length must be positive".into(),
            ));
        }

        let mut counts: HashMap<String, usize> = HashMap::new();
        let mut longest = 0;
        for text in texts {
            let tokens = tokenize(text.as_ref());
            longest = longest.max(tokens.len());
            for token in tokens {
                *counts.entry(token).or_insert(0) += 1;
            }
        }

        let mut ranked: Vec<(String, usize)> = counts.into_iter().collect();
        ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        let keep = vocabulary_size.map_or(ranked.len(), |cap| cap - (UNKNOWN_ID + 1));
        let vocabulary: Vec<String> = ranked.into_iter().take(keep).map(|(word, _)| word).collect();

        let sequence_length = sequence_length.unwrap_or(longest).max(1);
        log::info!(
            "Built vocabulary of {} words, {} tokens per text",
            vocabulary.len(),
            sequence_length
        );
        let vectors = vectors.restricted_to(&vocabulary);
        Ok(Self::from_parts(vocabulary, sequence_length, vectors))
    }

    fn from_parts(vocabulary: Vec<String>, sequence_length: usize, vectors: WordVectors) -> Self {
        let index = vocabulary
            .iter()
            .enumerate()
            .map(|(i, word)| (word.clone(), i + UNKNOWN_ID + 1))
            .collect();
        Self {
            vocabulary,
            index,
            sequence_length,
            vectors,
        }
    }

    pub fn sequence_length(&self) -> usize {
        self.sequence_length
    }

    /// Number of ids, the two reserved ones included.
    pub fn id_count(&self) -> usize {
        self.vocabulary.len() + UNKNOWN_ID + 1
    }

    /// Id of `token`, `UNKNOWN_ID` when it is not in the vocabulary.
    pub fn token_id(&self, token: &str) -> usize {
        self.index.get(token).copied().unwrap_or(UNKNOWN_ID)
    }
}

impl Embedder for TextSequenceEmbedder {
    type Element = usize;

    fn encode<S: AsRef<str>>(&self, texts: &[S]) -> Array2<usize> {
        let mut encoded = Array2::from_elem((texts.len(), self.sequence_length), PADDING_ID);
        for (mut row, text) in encoded.rows_mut().into_iter().zip(texts) {
            for (slot, token) in row.iter_mut().zip(tokenize(text.as_ref())) {
                *slot = self.token_id(&token);
            }
        }
        encoded
    }

    fn vocabulary_size(&self) -> Option<usize> {
        Some(self.id_count())
    }

    fn embedding_size(&self) -> usize {
        self.vectors.dimension()
    }

    fn encoding_shape(&self) -> Vec<usize> {
        vec![self.sequence_length]
    }

    fn embedding_matrix(&self) -> Option<Array2<f32>> {
        let mut matrix = Array2::zeros((self.id_count(), self.embedding_size()));
        for (word, &id) in &self.index {
            if let Some(vector) = self.vectors.lookup(word) {
                matrix.row_mut(id).assign(&vector);
            }
        }
        Some(matrix)
    }
}

impl fmt::Display for TextSequenceEmbedder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Text sequence embedder: vocabulary of {} ids, {} tokens per text, {}-dimensional {}",
            self.id_count(),
            self.sequence_length,
            self.embedding_size(),
            self.vectors.source()
        )
    }
}
