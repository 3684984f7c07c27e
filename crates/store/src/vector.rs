//! Embedding encoding and similarity ranking.

use switchboard_common::types::KnowledgeMatch;

/// Deserialize a BLOB of little-endian f32s.
pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

pub fn vec_to_blob(v: &[f32]) -> Vec<u8> {
    v.iter().flat_map(|f| f.to_le_bytes()).collect()
}

/// Cosine similarity; `0.0` for empty or mismatched vectors.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let (dot, na, nb) = a
        .iter()
        .zip(b)
        .fold((0.0f32, 0.0f32, 0.0f32), |(dot, na, nb), (x, y)| {
            (dot + x * y, na + x * x, nb + y * y)
        });
    let denom = na.sqrt() * nb.sqrt();
    if denom == 0.0 { 0.0 } else { dot / denom }
}

/// Keep candidates strictly above `threshold`, best first, at most `limit`.
pub fn rank<I>(candidates: I, query: &[f32], threshold: f32, limit: usize) -> Vec<KnowledgeMatch>
where
    I: IntoIterator<Item = (i64, String, Vec<f32>)>,
{
    let mut matches: Vec<KnowledgeMatch> = candidates
        .into_iter()
        .map(|(id, content, embedding)| KnowledgeMatch {
            id,
            similarity: cosine_similarity(query, &embedding),
            content,
        })
        .filter(|m| m.similarity > threshold)
        .collect();
    matches.sort_by(|a, b| b.similarity.total_cmp(&a.similarity));
    matches.truncate(limit);
    matches
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blob_round_trip_preserves_values() {
        let v = vec![0.5, -1.25, 3.0];
        assert_eq!(blob_to_vec(&vec_to_blob(&v)), v);
    }

    #[test]
    fn cosine_of_orthogonal_and_parallel() {
        assert!((cosine_similarity(&[1.0, 0.0], &[2.0, 0.0]) - 1.0).abs() < 1e-6);
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-6);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 0.0]), 0.0);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]), 0.0);
    }

    #[test]
    fn rank_filters_sorts_and_truncates() {
        let candidates = vec![
            (1, "low".to_string(), vec![0.1, 0.995]),
            (2, "best".to_string(), vec![1.0, 0.0]),
            (3, "good".to_string(), vec![0.8, 0.6]),
            (4, "equal".to_string(), vec![0.0, 1.0]),
        ];
        let out = rank(candidates, &[1.0, 0.0], 0.65, 1);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].content, "best");

        let out = rank(vec![(5, "edge".to_string(), vec![1.0, 0.0])], &[1.0, 0.0], 1.0, 3);
        assert!(out.is_empty(), "threshold is exclusive");
    }
}
