use ndarray::{Array1, ArrayView1};

pub(crate) fn normalize_vector(vec: &Array1<f32>) -> Array1<f32> {
    let norm: f32 = vec.iter().map(|&x| x * x).sum::<f32>().sqrt();
    if norm > 1e-10 {
        vec / norm
    } else {
        Array1::zeros(vec.len())
    }
}

pub(crate) fn average_vectors(vectors: &[ArrayView1<f32>], embedding_size: usize) -> Array1<f32> {
    if vectors.is_empty() {
        return Array1::zeros(embedding_size);
    }
    let sum = vectors
        .iter()
        .fold(Array1::zeros(embedding_size), |acc, v| acc + v);
    sum / vectors.len() as f32
}

/// Lower-cased word tokens: maximal runs of alphanumeric characters (and `_`),
/// everything else separates.
pub(crate) fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !(c.is_alphanumeric() || c == '_'))
        .filter(|token| !token.is_empty())
        .map(str::to_lowercase)
        .collect()
}

/// Position of the largest value; the first one wins ties.
pub(crate) fn argmax(values: ArrayView1<f32>) -> usize {
    values
        .iter()
        .enumerate()
        .fold((0, f32::NEG_INFINITY), |(best, best_value), (i, &v)| {
            if v > best_value {
                (i, v)
            } else {
                (best, best_value)
            }
        })
        .0
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_tokenize() {
        assert_eq!(
            tokenize("Buy NOW, cheap-pills!"),
            vec!["buy", "now", "cheap", "pills"]
        );
        assert!(tokenize("  ...  ").is_empty());
    }

    #[test]
    fn test_average_and_normalize() {
        let a = array![1.0f32, 3.0];
        let b = array![3.0f32, 1.0];
        let mean = average_vectors(&[a.view(), b.view()], 2);
        assert_eq!(mean, array![2.0, 2.0]);
        assert_eq!(average_vectors(&[], 3), Array1::<f32>::zeros(3));

        let unit = normalize_vector(&array![3.0f32, 4.0]);
        assert!((unit[0] - 0.6).abs() < 1e-6);
        assert_eq!(normalize_vector(&Array1::zeros(2)), Array1::<f32>::zeros(2));
    }

    #[test]
    fn test_argmax_prefers_first_on_ties() {
        assert_eq!(argmax(array![0.2f32, 0.7, 0.1].view()), 1);
        assert_eq!(argmax(array![0.5f32, 0.5].view()), 0);
    }
}
