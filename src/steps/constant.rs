use crate::error::{FlowError, Result};
use crate::property::{Property, Values};
use crate::step::{ensure_unique_names, Step, StepContext, StepResult};
use async_trait::async_trait;

/// Emits fixed values
pub struct ConstantValuesStep {
    values: Values,
    outputs: Vec<Property>,
}

impl ConstantValuesStep {
    /// Output descriptors are inferred from the values
    pub fn new(values: Values) -> Self {
        let outputs = values.iter().map(|(name, value)| Property::infer(name, value)).collect();
        Self { values, outputs }
    }

    /// Declare the outputs explicitly; every value is cast to its descriptor
    pub fn with_outputs(values: Values, outputs: Vec<Property>) -> Result<Self> {
        ensure_unique_names("constant_values", &outputs)?;
        let mut cast = Values::new();
        for output in &outputs {
            let Some(value) = values.get(&output.name) else {
                return Err(FlowError::invalid_step(
                    "constant_values",
                    format!("no value for output `{}`", output.name),
                ));
            };
            let declared = Property::infer(&output.name, value);
            cast.insert(output.name.clone(), declared.cast_value(value, output)?);
        }
        if let Some(extra) = values.keys().find(|k| !cast.contains_key(*k)) {
            return Err(FlowError::invalid_step(
                "constant_values",
                format!("value `{extra}` has no output descriptor"),
            ));
        }
        Ok(Self { values: cast, outputs })
    }
}

#[async_trait]
impl Step for ConstantValuesStep {
    fn kind(&self) -> &'static str {
        "constant_values"
    }

    fn input_descriptors(&self) -> &[Property] {
        &[]
    }

    fn output_descriptors(&self) -> &[Property] {
        &self.outputs
    }

    async fn invoke(&self, _inputs: Values, _ctx: &mut StepContext<'_>) -> Result<StepResult> {
        Ok(StepResult::next(self.values.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::property::PropertyType;
    use serde_json::json;

    #[test]
    fn test_inferred_outputs() {
        let step = ConstantValuesStep::new(
            [("n".to_string(), json!(3)), ("s".to_string(), json!("x"))].into(),
        );
        let kinds: Vec<_> = step
            .output_descriptors()
            .iter()
            .map(|p| (p.name.as_str(), p.kind.clone()))
            .collect();
        assert_eq!(kinds, vec![("n", PropertyType::Integer), ("s", PropertyType::String)]);
    }

    #[test]
    fn test_declared_outputs_cast_and_check() {
        let step = ConstantValuesStep::with_outputs(
            [("ratio".to_string(), json!(2))].into(),
            vec![Property::float("ratio")],
        )
        .unwrap();
        assert_eq!(step.values["ratio"], json!(2.0));

        assert!(
            ConstantValuesStep::with_outputs(Values::new(), vec![Property::string("missing")])
                .is_err()
        );
        assert!(ConstantValuesStep::with_outputs(
            [("a".to_string(), json!(1)), ("b".to_string(), json!(2))].into(),
            vec![Property::integer("a")],
        )
        .is_err());
    }
}
