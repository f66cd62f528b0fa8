//! Frame quality filter.
//!
//! Every numeric column of the metadata table is compared with its median. A
//! frame whose value differs from the median in any single column is excluded:
//! one anomalous dimension invalidates the whole frame. Comparison is exact,
//! with no tolerance.

use std::collections::BTreeSet;

use crate::core::metadata::{MetadataTable, COLUMNS};

/// Median of `values`; the mean of the two middle values for even counts.
pub fn median(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        Some((sorted[mid - 1] + sorted[mid]) / 2.0)
    } else {
        Some(sorted[mid])
    }
}

/// Median of every numeric column, in [`COLUMNS`] order (without `file`).
pub fn column_medians(table: &MetadataTable) -> Option<[f64; 9]> {
    if table.is_empty() {
        return None;
    }
    let values: Vec<[f64; 9]> = table.rows().iter().map(|r| r.numeric_values()).collect();

    let mut medians = [0.0; 9];
    for (column, slot) in medians.iter_mut().enumerate() {
        let cells: Vec<f64> = values.iter().map(|v| v[column]).collect();
        *slot = median(&cells)?;
    }
    Some(medians)
}

/// Frames with at least one column differing from that column's median.
pub fn outlier_frames(table: &MetadataTable) -> BTreeSet<u32> {
    let Some(medians) = column_medians(table) else {
        return BTreeSet::new();
    };

    let mut outliers = BTreeSet::new();
    for row in table.rows() {
        let deviating: Vec<&str> = row
            .numeric_values()
            .iter()
            .zip(medians.iter())
            .zip(COLUMNS.iter().skip(1))
            .filter(|((value, median), _)| value != median)
            .map(|(_, column)| *column)
            .collect();

        if !deviating.is_empty() {
            log::warn!(
                "Excluding frame {} ({}): {} differ from the dataset median",
                row.frame,
                row.file,
                deviating.join(", ")
            );
            outliers.insert(row.frame);
        }
    }
    outliers
}

/// Merge the quality outliers of `table` into `missing`.
///
/// The result is a superset of `missing`.
pub fn filter(table: &MetadataTable, missing: &BTreeSet<u32>) -> BTreeSet<u32> {
    let mut excluded = missing.clone();
    excluded.extend(outlier_frames(table));
    excluded
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::header::ImageHeader;
    use crate::core::metadata::FrameMetadataRow;

    fn row(frame: u32, size: [u32; 3], spacing: [f64; 3]) -> FrameMetadataRow {
        let header = ImageHeader {
            dimensions: 3,
            size,
            channels: 1,
            spacing,
        };
        FrameMetadataRow::from_header(format!("/data/img_{:03}.tif", frame), frame, &header)
    }

    fn uniform_table(frames: &[u32]) -> Vec<FrameMetadataRow> {
        frames
            .iter()
            .map(|&f| row(f, [64, 64, 20], [0.5, 0.5, 2.0]))
            .collect()
    }

    #[test]
    fn test_median_odd_and_even() {
        assert_eq!(median(&[3.0, 1.0, 2.0]), Some(2.0));
        assert_eq!(median(&[4.0, 1.0, 2.0, 3.0]), Some(2.5));
        assert_eq!(median(&[]), None);
    }

    #[test]
    fn test_uniform_table_has_no_outliers() {
        let table = MetadataTable::from_rows(uniform_table(&[1, 2, 3]));
        assert!(outlier_frames(&table).is_empty());
    }

    #[test]
    fn test_single_column_deviation_excludes_frame() {
        let mut rows = uniform_table(&[1, 2, 3, 5]);
        rows.push(row(4, [64, 64, 19], [0.5, 0.5, 2.0]));
        let table = MetadataTable::from_rows(rows);

        let outliers = outlier_frames(&table);
        assert_eq!(outliers.into_iter().collect::<Vec<_>>(), vec![4]);
    }

    #[test]
    fn test_spacing_deviation_is_exact() {
        let mut rows = uniform_table(&[1, 2]);
        rows.push(row(3, [64, 64, 20], [0.5, 0.5, 2.000001]));
        let table = MetadataTable::from_rows(rows);

        assert!(outlier_frames(&table).contains(&3));
    }

    #[test]
    fn test_exclusions_use_frame_index_not_row_position() {
        // Rows 0..2 hold frames 10, 12, 14; the outlier sits in row 1.
        let table = MetadataTable::from_rows(vec![
            row(10, [8, 8, 8], [1.0; 3]),
            row(12, [8, 8, 9], [1.0; 3]),
            row(14, [8, 8, 8], [1.0; 3]),
        ]);

        let outliers = outlier_frames(&table);
        assert_eq!(outliers.into_iter().collect::<Vec<_>>(), vec![12]);
    }

    #[test]
    fn test_filter_merges_with_missing() {
        let mut rows = uniform_table(&[1, 2, 4]);
        rows.push(row(5, [32, 64, 20], [0.5, 0.5, 2.0]));
        let table = MetadataTable::from_rows(rows);
        let missing: BTreeSet<u32> = [3].into_iter().collect();

        let excluded = filter(&table, &missing);
        assert_eq!(excluded.into_iter().collect::<Vec<_>>(), vec![3, 5]);
    }

    #[test]
    fn test_even_split_excludes_both_sides() {
        let table = MetadataTable::from_rows(vec![
            row(1, [8, 8, 8], [1.0; 3]),
            row(2, [8, 8, 10], [1.0; 3]),
        ]);
        assert_eq!(outlier_frames(&table).len(), 2);
    }

    #[test]
    fn test_empty_table() {
        let table = MetadataTable::default();
        assert!(column_medians(&table).is_none());
        assert!(filter(&table, &BTreeSet::new()).is_empty());
    }
}
