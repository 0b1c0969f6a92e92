use std::collections::BTreeSet;

use crate::data::instances::{is_missing, AttributeKind, Instances};
use crate::error::{ForecastError, Result};

/// Something a consumer of [`Instances`] may or may not accept
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Capability {
    NumericAttributes,
    NominalAttributes,
    DateAttributes,
    MissingValues,
    NumericClass,
    NominalClass,
    DateClass,
    MissingClassValues,
}

impl Capability {
    pub const ALL: [Capability; 8] = [
        Capability::NumericAttributes,
        Capability::NominalAttributes,
        Capability::DateAttributes,
        Capability::MissingValues,
        Capability::NumericClass,
        Capability::NominalClass,
        Capability::DateClass,
        Capability::MissingClassValues,
    ];
}

/// Declarative statement of the data shapes a classifier accepts.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Capabilities {
    enabled: BTreeSet<Capability>,
    minimum_instances: usize,
}

impl Capabilities {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enable(&mut self, capability: Capability) -> &mut Self {
        self.enabled.insert(capability);
        self
    }

    pub fn disable(&mut self, capability: Capability) -> &mut Self {
        self.enabled.remove(&capability);
        self
    }

    pub fn enable_all(&mut self) -> &mut Self {
        self.enabled.extend(Capability::ALL);
        self
    }

    pub fn disable_all(&mut self) -> &mut Self {
        self.enabled.clear();
        self
    }

    pub fn set_minimum_instances(&mut self, minimum: usize) -> &mut Self {
        self.minimum_instances = minimum;
        self
    }

    pub fn handles(&self, capability: Capability) -> bool {
        self.enabled.contains(&capability)
    }

    /// Checks `data` against every enabled capability, failing with a
    /// description of the first violation.
    pub fn test_with_fail(&self, data: &Instances) -> Result<()> {
        let class_index = data
            .class_index()
            .ok_or_else(|| ForecastError::Capability("no class attribute set".to_string()))?;

        if data.num_instances() < self.minimum_instances {
            return Err(ForecastError::Capability(format!(
                "not enough training instances ({} < {})",
                data.num_instances(),
                self.minimum_instances
            )));
        }

        for (index, attribute) in data.attributes().iter().enumerate() {
            let is_class = index == class_index;
            let required = match (&attribute.kind, is_class) {
                (AttributeKind::Numeric, false) => Capability::NumericAttributes,
                (AttributeKind::Nominal(_), false) => Capability::NominalAttributes,
                (AttributeKind::Date, false) => Capability::DateAttributes,
                (AttributeKind::Numeric, true) => Capability::NumericClass,
                (AttributeKind::Nominal(_), true) => Capability::NominalClass,
                (AttributeKind::Date, true) => Capability::DateClass,
            };
            if !self.handles(required) {
                return Err(ForecastError::Capability(format!(
                    "cannot handle {:?} (attribute '{}')",
                    required, attribute.name
                )));
            }

            let missing = (0..data.num_instances()).any(|row| is_missing(data.value(row, index)));
            if missing {
                let required = if is_class {
                    Capability::MissingClassValues
                } else {
                    Capability::MissingValues
                };
                if !self.handles(required) {
                    return Err(ForecastError::Capability(format!(
                        "cannot handle {:?} (attribute '{}')",
                        required, attribute.name
                    )));
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::instances::{Attribute, MISSING};

    fn data_with_missing_class() -> Instances {
        Instances::from_rows(
            "series",
            vec![Attribute::numeric("x"), Attribute::numeric("y")],
            vec![vec![1.0, 2.0], vec![2.0, MISSING]],
        )
        .unwrap()
        .with_class_index(1)
        .unwrap()
    }

    #[test]
    fn test_missing_class_is_rejected() {
        let mut caps = Capabilities::new();
        caps.enable_all().disable(Capability::MissingClassValues);

        let err = caps.test_with_fail(&data_with_missing_class()).unwrap_err();
        assert!(format!("{}", err).contains("MissingClassValues"));
    }

    #[test]
    fn test_disabled_attribute_kind_is_rejected() {
        let mut caps = Capabilities::new();
        caps.enable(Capability::NumericClass);

        assert!(matches!(
            caps.test_with_fail(&data_with_missing_class()),
            Err(ForecastError::Capability(_))
        ));
    }

    #[test]
    fn test_minimum_instances_and_class_required() {
        let mut caps = Capabilities::new();
        caps.enable_all().set_minimum_instances(5);
        assert!(caps.test_with_fail(&data_with_missing_class()).is_err());

        let no_class = Instances::new("empty", vec![Attribute::numeric("x")]);
        assert!(Capabilities::new().test_with_fail(&no_class).is_err());
    }
}
