//! Preprocessing applied to instances before they are batched.
//!
//! Filters learn their statistics from training data with [`Filter::fit`] and
//! then transform any data set with the same header. The class attribute is
//! never modified. A filter that has not been fitted passes data through
//! unchanged, so a model restored from disk can still predict on data that
//! was preprocessed upstream.

use serde::{Deserialize, Serialize};

use crate::data::instances::{is_missing, AttributeKind, Instances};
use crate::error::{ForecastError, Result};

/// A data transformation with learnable statistics
pub trait Filter: Send {
    fn fit(&mut self, data: &Instances) -> Result<()>;

    fn transform(&self, data: &Instances) -> Result<Instances>;

    fn fit_transform(&mut self, data: &Instances) -> Result<Instances> {
        self.fit(data)?;
        self.transform(data)
    }
}

/// Scaling applied after missing-value replacement
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum FilterType {
    #[default]
    None,
    /// Min-max scaling into [0, 1]
    Normalize,
    /// Zero mean, unit variance
    Standardize,
}

fn check_width(stats_len: usize, data: &Instances) -> Result<()> {
    if stats_len != data.num_attributes() {
        return Err(ForecastError::InvalidData(format!(
            "filter fitted on {} attributes, got {}",
            stats_len,
            data.num_attributes()
        )));
    }
    Ok(())
}

fn is_filtered(data: &Instances, index: usize) -> bool {
    data.class_index() != Some(index)
}

/// Replaces missing attribute values with the column mean (numeric, date)
/// or mode (nominal).
#[derive(Clone, Debug, Default)]
pub struct ReplaceMissingValues {
    replacements: Option<Vec<f64>>,
}

impl Filter for ReplaceMissingValues {
    fn fit(&mut self, data: &Instances) -> Result<()> {
        let mut replacements = Vec::with_capacity(data.num_attributes());
        for (index, attribute) in data.attributes().iter().enumerate() {
            let present: Vec<f64> = data
                .rows()
                .map(|row| row[index])
                .filter(|v| !is_missing(*v))
                .collect();

            let value = match &attribute.kind {
                AttributeKind::Nominal(labels) => {
                    let mut counts = vec![0usize; labels.len()];
                    for v in &present {
                        if let Some(c) = counts.get_mut(*v as usize) {
                            *c += 1;
                        }
                    }
                    counts
                        .iter()
                        .enumerate()
                        .max_by(|a, b| a.1.cmp(b.1).then(b.0.cmp(&a.0)))
                        .map(|(i, _)| i as f64)
                        .unwrap_or(0.0)
                }
                _ if present.is_empty() => 0.0,
                _ => present.iter().sum::<f64>() / present.len() as f64,
            };
            replacements.push(value);
        }
        self.replacements = Some(replacements);
        Ok(())
    }

    fn transform(&self, data: &Instances) -> Result<Instances> {
        let replacements = match &self.replacements {
            Some(r) => r,
            None => return Ok(data.clone()),
        };
        check_width(replacements.len(), data)?;

        let mut out = data.clone();
        let class_index = data.class_index();
        for row in out.rows_mut() {
            for (index, value) in row.iter_mut().enumerate() {
                if Some(index) != class_index && is_missing(*value) {
                    *value = replacements[index];
                }
            }
        }
        Ok(out)
    }
}

/// Per-attribute affine rescaling: `(x - shift) / scale`
#[derive(Clone, Debug)]
pub struct Rescale {
    kind: FilterType,
    params: Option<Vec<(f64, f64)>>,
}

impl Rescale {
    pub fn normalize() -> Self {
        Rescale { kind: FilterType::Normalize, params: None }
    }

    pub fn standardize() -> Self {
        Rescale { kind: FilterType::Standardize, params: None }
    }
}

impl Filter for Rescale {
    fn fit(&mut self, data: &Instances) -> Result<()> {
        let mut params = Vec::with_capacity(data.num_attributes());
        for (index, attribute) in data.attributes().iter().enumerate() {
            if attribute.is_nominal() || !is_filtered(data, index) {
                params.push((0.0, 1.0));
                continue;
            }
            let values: Vec<f64> = data
                .rows()
                .map(|row| row[index])
                .filter(|v| !is_missing(*v))
                .collect();
            if values.is_empty() {
                params.push((0.0, 1.0));
                continue;
            }

            let (shift, scale) = match self.kind {
                FilterType::Normalize => {
                    let min = values.iter().cloned().fold(f64::INFINITY, f64::min);
                    let max = values.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
                    (min, max - min)
                }
                FilterType::Standardize => {
                    let n = values.len() as f64;
                    let mean = values.iter().sum::<f64>() / n;
                    let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
                    (mean, var.sqrt())
                }
                FilterType::None => (0.0, 1.0),
            };
            // Constant columns collapse to zero rather than dividing by zero
            params.push((shift, if scale > 0.0 { scale } else { 1.0 }));
        }
        self.params = Some(params);
        Ok(())
    }

    fn transform(&self, data: &Instances) -> Result<Instances> {
        let params = match &self.params {
            Some(p) => p,
            None => return Ok(data.clone()),
        };
        check_width(params.len(), data)?;

        let mut out = data.clone();
        let class_index = data.class_index();
        for row in out.rows_mut() {
            for (index, value) in row.iter_mut().enumerate() {
                if Some(index) == class_index || is_missing(*value) {
                    continue;
                }
                let (shift, scale) = params[index];
                *value = (*value - shift) / scale;
            }
        }
        Ok(out)
    }
}

/// Ordered chain of filters
#[derive(Default)]
pub struct FilterPipeline {
    filters: Vec<Box<dyn Filter>>,
}

impl FilterPipeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Missing-value replacement followed by the scaling `filter_type` names
    pub fn from_type(filter_type: FilterType) -> Self {
        let mut pipeline = FilterPipeline::new().with_filter(ReplaceMissingValues::default());
        match filter_type {
            FilterType::None => {}
            FilterType::Normalize => pipeline = pipeline.with_filter(Rescale::normalize()),
            FilterType::Standardize => pipeline = pipeline.with_filter(Rescale::standardize()),
        }
        pipeline
    }

    pub fn with_filter<F: Filter + 'static>(mut self, filter: F) -> Self {
        self.filters.push(Box::new(filter));
        self
    }

    pub fn len(&self) -> usize {
        self.filters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }
}

impl Filter for FilterPipeline {
    fn fit(&mut self, data: &Instances) -> Result<()> {
        self.fit_transform(data).map(|_| ())
    }

    fn transform(&self, data: &Instances) -> Result<Instances> {
        let mut current = data.clone();
        for filter in &self.filters {
            current = filter.transform(&current)?;
        }
        Ok(current)
    }

    // Each stage is fitted on the output of the previous one
    fn fit_transform(&mut self, data: &Instances) -> Result<Instances> {
        let mut current = data.clone();
        for filter in &mut self.filters {
            current = filter.fit_transform(&current)?;
        }
        Ok(current)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::instances::{Attribute, MISSING};

    fn data() -> Instances {
        Instances::from_rows(
            "series",
            vec![
                Attribute::numeric("a"),
                Attribute::nominal("b", vec!["x", "y"]),
                Attribute::numeric("target"),
            ],
            vec![
                vec![1.0, 1.0, 10.0],
                vec![MISSING, 1.0, 20.0],
                vec![5.0, MISSING, 30.0],
                vec![3.0, 0.0, MISSING],
            ],
        )
        .unwrap()
        .with_class_index(2)
        .unwrap()
    }

    #[test]
    fn test_replace_missing_uses_mean_and_mode() {
        let mut filter = ReplaceMissingValues::default();
        let out = filter.fit_transform(&data()).unwrap();

        assert_eq!(out.value(1, 0), 3.0);
        assert_eq!(out.value(2, 1), 1.0);
        // Class untouched
        assert!(is_missing(out.value(3, 2)));
    }

    #[test]
    fn test_unfitted_filter_passes_through() {
        let filter = Rescale::standardize();
        let input = data();
        let out = filter.transform(&input).unwrap();
        assert_eq!(out.value(0, 0), 1.0);
    }

    #[test]
    fn test_normalize_pipeline() {
        let mut pipeline = FilterPipeline::from_type(FilterType::Normalize);
        assert_eq!(pipeline.len(), 2);

        let out = pipeline.fit_transform(&data()).unwrap();
        let column: Vec<f64> = out.rows().map(|r| r[0]).collect();
        assert_eq!(column, vec![0.0, 0.5, 1.0, 0.5]);
        // Nominal and class columns are left alone
        assert_eq!(out.value(0, 1), 1.0);
        assert_eq!(out.value(0, 2), 10.0);
    }

    #[test]
    fn test_width_mismatch_is_an_error() {
        let mut filter = ReplaceMissingValues::default();
        filter.fit(&data()).unwrap();
        let other = Instances::new("other", vec![Attribute::numeric("a")]);
        assert!(filter.transform(&other).is_err());
    }
}
