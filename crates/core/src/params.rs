//! Named parameter snapshots and the sharing policy applied to them.

use std::collections::BTreeMap;

use ndarray::ArrayD;
use serde::{Deserialize, Serialize};

use crate::error::{DpError, Result};
use crate::tensor::Tensor;

/// A single named model parameter.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum ParamValue {
    /// Trainable floating-point tensor; the only kind that is aggregated.
    Float(Tensor),
    /// Integer buffer such as a batch counter; copied, never aggregated.
    Counter(ArrayD<i64>),
}

impl ParamValue {
    /// Borrow the tensor when this is a floating-point parameter.
    pub fn as_float(&self) -> Option<&Tensor> {
        match self {
            ParamValue::Float(t) => Some(t),
            ParamValue::Counter(_) => None,
        }
    }

    /// Mutably borrow the tensor when this is a floating-point parameter.
    pub fn as_float_mut(&mut self) -> Option<&mut Tensor> {
        match self {
            ParamValue::Float(t) => Some(t),
            ParamValue::Counter(_) => None,
        }
    }

    /// Whether the parameter is floating-point.
    pub fn is_float(&self) -> bool {
        matches!(self, ParamValue::Float(_))
    }

    /// Shape of the underlying array.
    pub fn shape(&self) -> &[usize] {
        match self {
            ParamValue::Float(t) => t.shape(),
            ParamValue::Counter(c) => c.shape(),
        }
    }
}

/// Ordered mapping from parameter name to value.
///
/// Iteration order is the lexicographic order of names, so every traversal
/// (norms, noise draws, serialization) is reproducible.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParameterSet {
    entries: BTreeMap<String, ParamValue>,
}

impl ParameterSet {
    /// Create an empty parameter set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a parameter, returning the previous value.
    pub fn insert<S: Into<String>>(&mut self, name: S, value: ParamValue) -> Option<ParamValue> {
        self.entries.insert(name.into(), value)
    }

    /// Insert a floating-point parameter.
    pub fn insert_float<S: Into<String>>(&mut self, name: S, value: Tensor) -> Option<ParamValue> {
        self.insert(name, ParamValue::Float(value))
    }

    /// Insert an integer buffer.
    pub fn insert_counter<S: Into<String>>(
        &mut self,
        name: S,
        value: ArrayD<i64>,
    ) -> Option<ParamValue> {
        self.insert(name, ParamValue::Counter(value))
    }

    /// Look up a parameter.
    pub fn get(&self, name: &str) -> Option<&ParamValue> {
        self.entries.get(name)
    }

    /// Look up a parameter mutably.
    pub fn get_mut(&mut self, name: &str) -> Option<&mut ParamValue> {
        self.entries.get_mut(name)
    }

    /// Look up a floating-point parameter.
    pub fn float(&self, name: &str) -> Option<&Tensor> {
        self.entries.get(name).and_then(ParamValue::as_float)
    }

    /// Look up a floating-point parameter mutably.
    pub fn float_mut(&mut self, name: &str) -> Option<&mut Tensor> {
        self.entries.get_mut(name).and_then(ParamValue::as_float_mut)
    }

    /// Look up a floating-point parameter, failing when it is absent.
    pub fn require_float(&self, name: &str) -> Result<&Tensor> {
        self.float(name).ok_or_else(|| DpError::missing_key(name))
    }

    /// Whether `name` is present.
    pub fn contains_key(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    /// Remove a parameter.
    pub fn remove(&mut self, name: &str) -> Option<ParamValue> {
        self.entries.remove(name)
    }

    /// Number of parameters.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the set holds no parameters.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterate over parameter names in order.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    /// Iterate over `(name, value)` pairs in order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &ParamValue)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Iterate over floating-point parameters in order.
    pub fn floats(&self) -> impl Iterator<Item = (&str, &Tensor)> {
        self.entries
            .iter()
            .filter_map(|(k, v)| v.as_float().map(|t| (k.as_str(), t)))
    }

    /// Iterate mutably over floating-point parameters in order.
    pub fn floats_mut(&mut self) -> impl Iterator<Item = (&str, &mut Tensor)> {
        self.entries
            .iter_mut()
            .filter_map(|(k, v)| v.as_float_mut().map(|t| (k.as_str(), t)))
    }

    /// Total number of scalar entries across floating-point parameters.
    pub fn num_float_elements(&self) -> usize {
        self.floats().map(|(_, t)| t.len()).sum()
    }
}

impl FromIterator<(String, ParamValue)> for ParameterSet {
    fn from_iter<I: IntoIterator<Item = (String, ParamValue)>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}

/// Which parameters stay on the client and which travel to the server.
///
/// Personalized parameters are never shared, aggregated, clipped or noised.
/// Task-head parameters are aggregated on the non-DP path but never
/// broadcast back, so each client keeps its own classifier head.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersonalizationPolicy {
    personal_prefixes: Vec<String>,
    head_prefixes: Vec<String>,
}

impl Default for PersonalizationPolicy {
    fn default() -> Self {
        Self::new(["transform_layer"]).with_head_prefixes(["few_classify", "transformer"])
    }
}

impl PersonalizationPolicy {
    /// Policy with the given personalized prefixes and no task head.
    pub fn new<I, S>(personal_prefixes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            personal_prefixes: personal_prefixes.into_iter().map(Into::into).collect(),
            head_prefixes: Vec::new(),
        }
    }

    /// Replace the task-head prefixes.
    pub fn with_head_prefixes<I, S>(mut self, head_prefixes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.head_prefixes = head_prefixes.into_iter().map(Into::into).collect();
        self
    }

    /// Personalized prefixes.
    pub fn personal_prefixes(&self) -> &[String] {
        &self.personal_prefixes
    }

    /// Task-head prefixes.
    pub fn head_prefixes(&self) -> &[String] {
        &self.head_prefixes
    }

    /// Whether `name` belongs to a personalized sub-tree.
    pub fn is_personal(&self, name: &str) -> bool {
        self.personal_prefixes
            .iter()
            .any(|p| name.starts_with(p.as_str()))
    }

    /// Whether `name` is shared with the server.
    pub fn is_shared(&self, name: &str) -> bool {
        !self.is_personal(name)
    }

    /// Whether `name` is part of the task head.
    pub fn is_head(&self, name: &str) -> bool {
        self.head_prefixes.iter().any(|p| name.starts_with(p.as_str()))
    }

    /// Whether the server overwrites `name` on clients at the start of a round.
    pub fn is_broadcast(&self, name: &str) -> bool {
        self.is_shared(name) && !self.is_head(name)
    }

    /// Overwrite the client's broadcast parameters with the global values.
    ///
    /// Returns the number of parameters written.
    pub fn broadcast(&self, global: &ParameterSet, client: &mut ParameterSet) -> usize {
        let mut written = 0;
        for (name, value) in global.iter() {
            if self.is_broadcast(name) {
                client.insert(name, value.clone());
                written += 1;
            }
        }
        written
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn sample_set() -> ParameterSet {
        let mut p = ParameterSet::new();
        p.insert_float("encoder.w", array![1.0, 2.0].into_dyn());
        p.insert_float("few_classify.weight", array![0.5].into_dyn());
        p.insert_float("transform_layer.w", array![9.0].into_dyn());
        p.insert_counter("encoder.bn.num_batches_tracked", array![4_i64].into_dyn());
        p
    }

    #[test]
    fn keys_are_ordered() {
        let p = sample_set();
        let keys: Vec<_> = p.keys().collect();
        let mut sorted = keys.clone();
        sorted.sort();
        assert_eq!(keys, sorted);
    }

    #[test]
    fn floats_skip_counters() {
        let p = sample_set();
        assert_eq!(p.floats().count(), 3);
        assert!(p.float("encoder.bn.num_batches_tracked").is_none());
        assert_eq!(p.num_float_elements(), 4);
    }

    #[test]
    fn default_policy_classifies_names() {
        let policy = PersonalizationPolicy::default();
        assert!(policy.is_personal("transform_layer.w"));
        assert!(policy.is_shared("encoder.w"));
        assert!(policy.is_shared("few_classify.weight"));
        assert!(!policy.is_broadcast("few_classify.weight"));
        assert!(!policy.is_broadcast("transformer.attn.q"));
        assert!(policy.is_broadcast("encoder.w"));
    }

    #[test]
    fn broadcast_leaves_personal_and_head_untouched() {
        let policy = PersonalizationPolicy::default();
        let mut global = sample_set();
        global.insert_float("encoder.w", array![7.0, 7.0].into_dyn());
        global.insert_float("few_classify.weight", array![-1.0].into_dyn());
        global.insert_float("transform_layer.w", array![-1.0].into_dyn());

        let mut client = sample_set();
        let written = policy.broadcast(&global, &mut client);

        assert_eq!(written, 2);
        assert_eq!(client.float("encoder.w"), global.float("encoder.w"));
        assert_eq!(client.float("few_classify.weight").map(|t| t[[0]]), Some(0.5));
        assert_eq!(client.float("transform_layer.w").map(|t| t[[0]]), Some(9.0));
    }
}
