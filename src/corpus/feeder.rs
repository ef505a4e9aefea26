use crate::types::WordVector;

/// Cuts a corpus into fixed-size batches for streaming index construction.
///
/// The last batch may be shorter. A `batch_size` of zero is treated as one.
#[derive(Debug, Clone)]
pub struct BatchFeeder<'a> {
    vectors: &'a [WordVector],
    batch_size: usize,
    cursor: usize,
}

impl<'a> BatchFeeder<'a> {
    pub fn new(vectors: &'a [WordVector], batch_size: usize) -> Self {
        Self {
            vectors,
            batch_size: batch_size.max(1),
            cursor: 0,
        }
    }

    pub fn has_next(&self) -> bool {
        self.cursor < self.vectors.len()
    }

    /// Position of the next vector to be handed out.
    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn total(&self) -> usize {
        self.vectors.len()
    }

    pub fn next_batch(&mut self) -> Option<&'a [WordVector]> {
        if !self.has_next() {
            return None;
        }
        let end = (self.cursor + self.batch_size).min(self.vectors.len());
        let batch = &self.vectors[self.cursor..end];
        self.cursor = end;
        Some(batch)
    }

    pub fn reset(&mut self) {
        self.cursor = 0;
    }
}

impl<'a> Iterator for BatchFeeder<'a> {
    type Item = &'a [WordVector];

    fn next(&mut self) -> Option<Self::Item> {
        self.next_batch()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn corpus(n: usize) -> Vec<WordVector> {
        (0..n)
            .map(|i| WordVector::new(i as u32 + 1, format!("w{i}"), vec![i as f32]))
            .collect()
    }

    #[test]
    fn test_batches_cover_corpus_in_order() {
        let vectors = corpus(7);
        let mut feeder = BatchFeeder::new(&vectors, 3);
        let sizes: Vec<usize> = feeder.by_ref().map(|b| b.len()).collect();
        assert_eq!(sizes, vec![3, 3, 1]);
        assert!(!feeder.has_next());
        assert_eq!(feeder.cursor(), 7);

        feeder.reset();
        let ids: Vec<u32> = feeder.flat_map(|b| b.iter().map(|v| v.id)).collect();
        assert_eq!(ids, (1..=7).collect::<Vec<_>>());
    }

    #[test]
    fn test_empty_corpus() {
        let vectors: Vec<WordVector> = Vec::new();
        let mut feeder = BatchFeeder::new(&vectors, 10);
        assert!(!feeder.has_next());
        assert!(feeder.next_batch().is_none());
    }

    #[test]
    fn test_zero_batch_size() {
        let vectors = corpus(2);
        let feeder = BatchFeeder::new(&vectors, 0);
        assert_eq!(feeder.batch_size(), 1);
        assert_eq!(feeder.count(), 2);
    }
}
