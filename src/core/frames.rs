//! Frame indexing: numeric range and gaps of a dataset.

use std::collections::BTreeSet;

use thiserror::Error;

use super::template::NamingTemplate;

/// Errors raised while indexing frames against a template.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IndexError {
    #[error("no frames to index")]
    Empty,

    #[error("file '{file}' does not match naming template '{template}'")]
    Nonconforming { file: String, template: String },
}

/// Result type for indexing operations.
pub type Result<T> = std::result::Result<T, IndexError>;

/// Range of frame indices present in a dataset and the gaps inside it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameIndex {
    min: u32,
    max: u32,
    missing: BTreeSet<u32>,
}

impl FrameIndex {
    /// Create an index with no gaps.
    pub fn new(min: u32, max: u32) -> Self {
        Self {
            min,
            max,
            missing: BTreeSet::new(),
        }
    }

    pub fn min(&self) -> u32 {
        self.min
    }

    pub fn max(&self) -> u32 {
        self.max
    }

    /// Indices inside `[min, max]` that must not be processed.
    pub fn missing(&self) -> &BTreeSet<u32> {
        &self.missing
    }

    /// Number of frames assumed present and well-formed.
    pub fn present_count(&self) -> usize {
        (self.max - self.min + 1) as usize - self.missing.len()
    }

    pub fn contains(&self, index: u32) -> bool {
        (self.min..=self.max).contains(&index) && !self.missing.contains(&index)
    }

    /// Indices to process, ascending.
    pub fn present(&self) -> impl Iterator<Item = u32> + '_ {
        (self.min..=self.max).filter(move |i| !self.missing.contains(i))
    }

    /// Add indices to the excluded set.
    ///
    /// The set only grows; indices outside `[min, max]` are ignored so the
    /// range invariant holds.
    pub fn exclude<I: IntoIterator<Item = u32>>(&mut self, indices: I) {
        let (min, max) = (self.min, self.max);
        self.missing
            .extend(indices.into_iter().filter(|i| (min..=max).contains(i)));
    }
}

/// Index `filenames` with `template`.
///
/// Listing order does not matter. Every name is re-validated against the
/// template.
///
/// # Errors
///
/// - [`IndexError::Empty`] if there are no names
/// - [`IndexError::Nonconforming`] if a name does not fit `template`
pub fn index<S: AsRef<str>>(filenames: &[S], template: &NamingTemplate) -> Result<FrameIndex> {
    let parsed = filenames
        .iter()
        .map(|name| {
            let name = name.as_ref();
            template
                .parse_index(name)
                .ok_or_else(|| IndexError::Nonconforming {
                    file: name.to_string(),
                    template: template.placeholder(),
                })
        })
        .collect::<Result<BTreeSet<u32>>>()?;

    let (min, max) = match (parsed.first(), parsed.last()) {
        (Some(&min), Some(&max)) => (min, max),
        _ => return Err(IndexError::Empty),
    };

    let missing: BTreeSet<u32> = (min..=max).filter(|i| !parsed.contains(i)).collect();
    if !missing.is_empty() {
        log::info!("Frames missing from {}..={}: {:?}", min, max, missing);
    }

    Ok(FrameIndex { min, max, missing })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn template() -> NamingTemplate {
        NamingTemplate::new("img_", ".tif", 3)
    }

    fn names(indices: &[u32]) -> Vec<String> {
        indices.iter().map(|&i| template().format(i)).collect()
    }

    #[test]
    fn test_index_finds_gap() {
        let frames = index(&names(&[1, 2, 4, 5]), &template()).unwrap();
        assert_eq!(frames.min(), 1);
        assert_eq!(frames.max(), 5);
        assert_eq!(frames.missing().iter().copied().collect::<Vec<_>>(), vec![3]);
        assert_eq!(frames.present_count(), 4);
    }

    #[test]
    fn test_index_is_order_independent() {
        let a = index(&names(&[5, 1, 4, 2]), &template()).unwrap();
        let b = index(&names(&[1, 2, 4, 5]), &template()).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_index_nonzero_start() {
        let frames = index(&names(&[10, 11, 12]), &template()).unwrap();
        assert_eq!(frames.min(), 10);
        assert_eq!(frames.max(), 12);
        assert!(frames.missing().is_empty());
    }

    #[test]
    fn test_index_rejects_nonconforming() {
        let mut files = names(&[1, 2]);
        files.push("img_3.tif".to_string());
        let err = index(&files, &template()).unwrap_err();
        assert!(matches!(err, IndexError::Nonconforming { .. }));
    }

    #[test]
    fn test_index_empty() {
        let files: Vec<String> = Vec::new();
        assert_eq!(index(&files, &template()).unwrap_err(), IndexError::Empty);
    }

    #[test]
    fn test_exclude_only_grows_within_range() {
        let mut frames = index(&names(&[1, 2, 4, 5]), &template()).unwrap();
        frames.exclude([2, 9]);
        assert_eq!(
            frames.missing().iter().copied().collect::<Vec<_>>(),
            vec![2, 3]
        );
        assert_eq!(frames.present().collect::<Vec<_>>(), vec![1, 4, 5]);
        assert!(!frames.contains(3));
        assert!(frames.contains(5));
    }
}
