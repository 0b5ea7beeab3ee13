use crate::nn::context::{Initializer, Regularizer};
use crate::nn::error::{LayerError, Result};

/// Configuration of a [`MolAttention`](super::MolAttention) layer.
///
/// `unit` and `mol_k` have no default and must be set before `finalize`. Everything else
/// falls back to [`Default`].
///
/// ```rust
/// use mol_attn::nn::MolAttentionProps;
///
/// let mut props = MolAttentionProps::default().with_unit(8);
/// props.load(&["MoL_K = 2", "weight_regularizer=l2norm"]).unwrap();
/// assert_eq!(props.mol_k, Some(2));
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct MolAttentionProps {
    /// Hidden width of the first projection.
    pub unit: Option<usize>,
    /// Number of logistic mixture components.
    pub mol_k: Option<usize>,
    pub weight_initializer: Initializer,
    pub bias_initializer: Initializer,
    pub weight_regularizer: Regularizer,
    pub weight_regularizer_constant: f64,
}

impl Default for MolAttentionProps {
    fn default() -> Self {
        Self {
            unit: None,
            mol_k: None,
            weight_initializer: Initializer::XavierUniform,
            bias_initializer: Initializer::Zeros,
            weight_regularizer: Regularizer::None,
            weight_regularizer_constant: 1.0,
        }
    }
}

fn parse_positive(property: &str, value: &str) -> Result<usize> {
    match value.parse::<usize>() {
        Ok(v) if v > 0 => Ok(v),
        _ => Err(LayerError::InvalidProperty {
            property: property.to_string(),
            value: value.to_string(),
        }),
    }
}

impl MolAttentionProps {
    pub fn with_unit(mut self, unit: usize) -> Self {
        self.unit = Some(unit);
        self
    }

    pub fn with_mol_k(mut self, mol_k: usize) -> Self {
        self.mol_k = Some(mol_k);
        self
    }

    /// Sets a single property. Keys are case-insensitive; both sides are trimmed.
    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        let key = key.trim().to_ascii_lowercase();
        let value = value.trim();
        let wrap = |e: LayerError| match e {
            LayerError::InvalidProperty { value, .. } => LayerError::InvalidProperty {
                property: key.clone(),
                value,
            },
            other => other,
        };

        match key.as_str() {
            "unit" => self.unit = Some(parse_positive(&key, value)?),
            "mol_k" => self.mol_k = Some(parse_positive(&key, value)?),
            "weight_initializer" => self.weight_initializer = value.parse().map_err(wrap)?,
            "bias_initializer" => self.bias_initializer = value.parse().map_err(wrap)?,
            "weight_regularizer" => self.weight_regularizer = value.parse().map_err(wrap)?,
            "weight_regularizer_constant" => {
                self.weight_regularizer_constant = match value.parse::<f64>() {
                    Ok(c) if c.is_finite() && c >= 0.0 => c,
                    _ => {
                        return Err(LayerError::InvalidProperty {
                            property: key.clone(),
                            value: value.to_string(),
                        })
                    }
                }
            }
            _ => return Err(LayerError::UnknownProperty(key.clone())),
        }
        Ok(())
    }

    /// Applies a list of `key=value` entries in order.
    ///
    /// # Errors
    ///
    /// Stops at the first entry without `=`, with an unknown key or with a malformed value.
    pub fn load(&mut self, entries: &[&str]) -> Result<()> {
        for entry in entries {
            let (key, value) =
                entry
                    .split_once('=')
                    .ok_or_else(|| LayerError::InvalidProperty {
                        property: entry.trim().to_string(),
                        value: String::new(),
                    })?;
            self.set(key, value)?;
        }
        Ok(())
    }

    /// Lists the properties as `(key, value)` pairs; unset hyperparameters are omitted.
    pub fn export(&self) -> Vec<(String, String)> {
        let mut out = Vec::with_capacity(6);
        if let Some(unit) = self.unit {
            out.push(("unit".to_string(), unit.to_string()));
        }
        if let Some(mol_k) = self.mol_k {
            out.push(("mol_k".to_string(), mol_k.to_string()));
        }
        out.push((
            "weight_initializer".to_string(),
            self.weight_initializer.to_string(),
        ));
        out.push((
            "bias_initializer".to_string(),
            self.bias_initializer.to_string(),
        ));
        out.push((
            "weight_regularizer".to_string(),
            self.weight_regularizer.to_string(),
        ));
        out.push((
            "weight_regularizer_constant".to_string(),
            self.weight_regularizer_constant.to_string(),
        ));
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let props = MolAttentionProps::default();
        assert_eq!(props.unit, None);
        assert_eq!(props.mol_k, None);
        assert_eq!(props.weight_initializer, Initializer::XavierUniform);
        assert_eq!(props.bias_initializer, Initializer::Zeros);
        assert_eq!(props.weight_regularizer, Regularizer::None);
        assert_eq!(props.weight_regularizer_constant, 1.0);
    }

    #[test]
    fn test_load() {
        let mut props = MolAttentionProps::default();
        props
            .load(&[
                " Unit = 16",
                "mol_k=3",
                "bias_initializer=Ones",
                "weight_regularizer_constant=0.01",
            ])
            .unwrap();
        assert_eq!(props.unit, Some(16));
        assert_eq!(props.mol_k, Some(3));
        assert_eq!(props.bias_initializer, Initializer::Ones);
        assert_eq!(props.weight_regularizer_constant, 0.01);
    }

    #[test]
    fn test_load_errors() {
        let mut props = MolAttentionProps::default();
        assert!(matches!(
            props.load(&["unit=0"]),
            Err(LayerError::InvalidProperty { .. })
        ));
        assert!(matches!(
            props.load(&["unit"]),
            Err(LayerError::InvalidProperty { .. })
        ));
        assert!(matches!(
            props.load(&["heads=4"]),
            Err(LayerError::UnknownProperty(_))
        ));
        assert!(matches!(
            props.load(&["weight_regularizer_constant=-1"]),
            Err(LayerError::InvalidProperty { .. })
        ));

        let err = props.load(&["weight_initializer=normal"]).unwrap_err();
        match err {
            LayerError::InvalidProperty { property, value } => {
                assert_eq!(property, "weight_initializer");
                assert_eq!(value, "normal");
            }
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[test]
    fn test_export_round_trips_through_load() {
        let props = MolAttentionProps::default().with_unit(4).with_mol_k(2);
        let exported = props.export();
        assert_eq!(exported[0], ("unit".to_string(), "4".to_string()));

        let entries: Vec<String> = exported.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
        let refs: Vec<&str> = entries.iter().map(String::as_str).collect();
        let mut reloaded = MolAttentionProps::default();
        reloaded.load(&refs).unwrap();
        assert_eq!(reloaded, props);
    }
}
