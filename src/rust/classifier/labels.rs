use std::collections::{BTreeSet, HashMap};

use serde::{Deserialize, Serialize};

use super::error::{ClassifierError, Result};

/// The fixed, ordered set of category names a classifier predicts over.
///
/// A label's index is its position in the set. The set is never mutated after
/// construction, so an index handed out once stays valid for the lifetime of the
/// classifier that owns it (and of any artifact written from it).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<String>", into = "Vec<String>")]
pub struct LabelSpace {
    names: Vec<String>,
    index: HashMap<String, usize>,
}

impl LabelSpace {
    /// Builds a label space from explicit names, keeping their order.
    ///
    /// # Errors
    /// - `InvalidLabel` if a name appears more than once
    pub fn new<S: AsRef<str>>(names: &[S]) -> Result<Self> {
        let mut index = HashMap::with_capacity(names.len());
        for (position, name) in names.iter().enumerate() {
            let name = name.as_ref();
            if index.insert(name.to_string(), position).is_some() {
                return Err(ClassifierError::InvalidLabel(format!(
                    "Non-unique label name '{}' in {:?}",
                    name,
                    names.iter().map(AsRef::as_ref).collect::<Vec<_>>()
                )));
            }
        }
        Ok(Self {
            names: names.iter().map(|n| n.as_ref().to_string()).collect(),
            index,
        })
    }

    /// Derives a label space from raw label values and indexes every value.
    ///
    /// Without `known_names` the space is the sorted set of distinct values. With
    /// `known_names` (aligning a test set to a trained model) the given order is
    /// kept and every value must belong to it: out-of-set samples have to be
    /// dropped by the caller, they are never mapped silently.
    ///
    /// # Errors
    /// - `InvalidLabel` if `known_names` contains duplicates
    /// - `InvalidLabel` if a value is not one of `known_names`
    pub fn from_raw<S: AsRef<str>>(
        values: &[S],
        known_names: Option<&[String]>,
    ) -> Result<(Self, Vec<usize>)> {
        let space = match known_names {
            Some(names) => Self::new(names)?,
            None => {
                let distinct: BTreeSet<&str> = values.iter().map(AsRef::as_ref).collect();
                Self::new(&distinct.into_iter().collect::<Vec<_>>())?
            }
        };

        let indices = values
            .iter()
            .map(|value| {
                space.position(value.as_ref()).ok_or_else(|| {
                    ClassifierError::InvalidLabel(format!(
                        "Value '{}' is not one of the labels {:?}",
                        value.as_ref(),
                        space.names
                    ))
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok((space, indices))
    }

    fn position(&self, name: &str) -> Option<usize> {
        self.index.get(name).copied()
    }

    /// Index of `name`.
    pub fn index_of(&self, name: &str) -> Result<usize> {
        self.position(name).ok_or_else(|| {
            ClassifierError::UnknownLabel(format!("'{}' is not one of {:?}", name, self.names))
        })
    }

    /// Name stored at `index`.
    pub fn name_of(&self, index: usize) -> Result<&str> {
        self.names.get(index).map(String::as_str).ok_or_else(|| {
            ClassifierError::UnknownLabel(format!(
                "index {} is out of range for {} labels",
                index,
                self.names.len()
            ))
        })
    }

    /// Indexes a batch of label names, failing on the first unknown one.
    pub fn indices_of<S: AsRef<str>>(&self, names: &[S]) -> Result<Vec<usize>> {
        names.iter().map(|name| self.index_of(name.as_ref())).collect()
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.names.iter().map(String::as_str)
    }
}

impl TryFrom<Vec<String>> for LabelSpace {
    type Error = ClassifierError;

    fn try_from(names: Vec<String>) -> Result<Self> {
        Self::new(&names)
    }
}

impl From<LabelSpace> for Vec<String> {
    fn from(space: LabelSpace) -> Self {
        space.names
    }
}
