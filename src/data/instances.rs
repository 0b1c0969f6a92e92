use std::ops::Range;

use serde::{Deserialize, Serialize};

use crate::error::{ForecastError, Result};

/// Value stored for a missing cell.
pub const MISSING: f64 = f64::NAN;

/// Returns true if `value` encodes a missing cell
pub fn is_missing(value: f64) -> bool {
    value.is_nan()
}

/// Type of an attribute column
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum AttributeKind {
    Numeric,
    /// Values are stored as the index into the label list
    Nominal(Vec<String>),
    /// Values are stored as milliseconds since the Unix epoch
    Date,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Attribute {
    pub name: String,
    pub kind: AttributeKind,
}

impl Attribute {
    pub fn numeric(name: impl Into<String>) -> Self {
        Attribute { name: name.into(), kind: AttributeKind::Numeric }
    }

    pub fn nominal<S: Into<String>>(name: impl Into<String>, labels: Vec<S>) -> Self {
        Attribute {
            name: name.into(),
            kind: AttributeKind::Nominal(labels.into_iter().map(Into::into).collect()),
        }
    }

    pub fn date(name: impl Into<String>) -> Self {
        Attribute { name: name.into(), kind: AttributeKind::Date }
    }

    pub fn is_nominal(&self) -> bool {
        matches!(self.kind, AttributeKind::Nominal(_))
    }

    /// Number of labels of a nominal attribute, 0 otherwise
    pub fn num_values(&self) -> usize {
        match &self.kind {
            AttributeKind::Nominal(labels) => labels.len(),
            _ => 0,
        }
    }

    /// Whether `value` can be stored in this column. Nominal cells must be
    /// missing or an integral label index in range.
    pub fn accepts(&self, value: f64) -> bool {
        match &self.kind {
            AttributeKind::Nominal(labels) => {
                is_missing(value) || (value >= 0.0 && value.fract() == 0.0 && (value as usize) < labels.len())
            }
            _ => true,
        }
    }
}

/// Ordered, time-indexed table of rows with an optional target column.
///
/// Row order is the time axis. Every row holds exactly one value per
/// attribute; missing cells are `NaN`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Instances {
    relation: String,
    attributes: Vec<Attribute>,
    rows: Vec<Vec<f64>>,
    class_index: Option<usize>,
}

impl Instances {
    pub fn new(relation: impl Into<String>, attributes: Vec<Attribute>) -> Self {
        Instances {
            relation: relation.into(),
            attributes,
            rows: Vec::new(),
            class_index: None,
        }
    }

    /// Creates a data set from rows, validating every row's width
    pub fn from_rows(
        relation: impl Into<String>,
        attributes: Vec<Attribute>,
        rows: Vec<Vec<f64>>,
    ) -> Result<Self> {
        let mut data = Instances::new(relation, attributes);
        for row in rows {
            data.push(row)?;
        }
        Ok(data)
    }

    /// Same header (relation, attributes, class index) with no rows
    pub fn empty_copy(&self) -> Self {
        Instances {
            relation: self.relation.clone(),
            attributes: self.attributes.clone(),
            rows: Vec::new(),
            class_index: self.class_index,
        }
    }

    pub fn with_class_index(mut self, index: usize) -> Result<Self> {
        self.set_class_index(index)?;
        Ok(self)
    }

    pub fn set_class_index(&mut self, index: usize) -> Result<()> {
        if index >= self.attributes.len() {
            return Err(ForecastError::InvalidData(format!(
                "class index {} out of range for {} attributes",
                index,
                self.attributes.len()
            )));
        }
        self.class_index = Some(index);
        Ok(())
    }

    pub fn push(&mut self, row: Vec<f64>) -> Result<()> {
        if row.len() != self.attributes.len() {
            return Err(ForecastError::InvalidData(format!(
                "row has {} values, expected {}",
                row.len(),
                self.attributes.len()
            )));
        }
        if let Some((attribute, value)) = self.attributes.iter().zip(&row).find(|(a, v)| !a.accepts(**v)) {
            return Err(ForecastError::InvalidData(format!(
                "value {} is not a label index of nominal attribute '{}' ({} labels)",
                value,
                attribute.name,
                attribute.num_values()
            )));
        }
        self.rows.push(row);
        Ok(())
    }

    pub fn relation(&self) -> &str {
        &self.relation
    }

    pub fn attributes(&self) -> &[Attribute] {
        &self.attributes
    }

    pub fn attribute(&self, index: usize) -> &Attribute {
        &self.attributes[index]
    }

    pub fn num_attributes(&self) -> usize {
        self.attributes.len()
    }

    pub fn num_instances(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn class_index(&self) -> Option<usize> {
        self.class_index
    }

    pub fn class_attribute(&self) -> Option<&Attribute> {
        self.class_index.map(|i| &self.attributes[i])
    }

    /// Label count for a nominal class, 1 for a numeric or date class,
    /// 0 when no class is set.
    pub fn num_classes(&self) -> usize {
        match self.class_attribute() {
            Some(attr) if attr.is_nominal() => attr.num_values(),
            Some(_) => 1,
            None => 0,
        }
    }

    pub fn row(&self, index: usize) -> &[f64] {
        &self.rows[index]
    }

    pub fn rows(&self) -> impl Iterator<Item = &[f64]> {
        self.rows.iter().map(|r| r.as_slice())
    }

    pub(crate) fn rows_mut(&mut self) -> impl Iterator<Item = &mut Vec<f64>> {
        self.rows.iter_mut()
    }

    pub fn value(&self, row: usize, attribute: usize) -> f64 {
        self.rows[row][attribute]
    }

    /// Target value of `row`, or `None` when no class index is set
    pub fn class_value(&self, row: usize) -> Option<f64> {
        self.class_index.map(|c| self.rows[row][c])
    }

    /// Contiguous copy of the rows in `range`, keeping the header
    pub fn slice(&self, range: Range<usize>) -> Self {
        let mut copy = self.empty_copy();
        copy.rows = self.rows[range].to_vec();
        copy
    }

    /// Splits off the last `count` rows, preserving time order in both halves
    pub fn split_tail(&self, count: usize) -> (Self, Self) {
        let split = self.rows.len().saturating_sub(count);
        (self.slice(0..split), self.slice(split..self.rows.len()))
    }
}
