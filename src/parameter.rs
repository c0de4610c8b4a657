//! Search-space description: typed dimensions, validation, sampling, and casting.
//!
//! A [`ParameterSpace`] is an ordered list of [`ParamSpec`]s. It is handed to
//! samplers, which either draw uniform samples from it or map between
//! parameter values and the real-valued internal vectors a simplex search
//! works on.
//!
//! # Example
//!
//! ```
//! use tuner::parameter::{ParamSpec, ParameterSpace};
//!
//! let space = ParameterSpace::new(vec![
//!     ParamSpec::float("lr", 1e-5, 1e-1).log_scale(),
//!     ParamSpec::int("layers", 1, 8).initial(3),
//!     ParamSpec::ordinal("batch", [16, 32, 64, 128]),
//!     ParamSpec::categorical("optimizer", ["sgd", "adam"]),
//! ])
//! .unwrap();
//!
//! let mut rng = fastrand::Rng::with_seed(42);
//! let params = space.sample(&mut rng);
//! assert_eq!(params.len(), 4);
//! ```

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::param::{ParamValue, Params};
use crate::rng_util;

/// The type and domain of one dimension.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ParamKind {
    /// A real value in `[low, high]`.
    Float {
        low: f64,
        high: f64,
        #[serde(default)]
        log: bool,
    },
    /// An integer value in `[low, high]`.
    Int {
        low: i64,
        high: i64,
        #[serde(default)]
        log: bool,
    },
    /// One of an unordered set of choices.
    Categorical { choices: Vec<ParamValue> },
    /// One element of an ordered sequence.
    Ordinal { sequence: Vec<ParamValue> },
}

impl ParamKind {
    fn label(&self) -> &'static str {
        match self {
            ParamKind::Float { .. } => "float",
            ParamKind::Int { .. } => "int",
            ParamKind::Categorical { .. } => "categorical",
            ParamKind::Ordinal { .. } => "ordinal",
        }
    }
}

/// One named dimension of the search space.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ParamSpec {
    pub name: String,
    #[serde(flatten)]
    pub kind: ParamKind,
    /// Initial values; the k-th entry seeds the k-th simplex vertex.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub initial: Vec<ParamValue>,
}

impl ParamSpec {
    /// A float dimension with the given bounds.
    #[must_use]
    pub fn float(name: impl Into<String>, low: f64, high: f64) -> Self {
        Self::with_kind(name, ParamKind::Float { low, high, log: false })
    }

    /// An integer dimension with the given bounds.
    #[must_use]
    pub fn int(name: impl Into<String>, low: i64, high: i64) -> Self {
        Self::with_kind(name, ParamKind::Int { low, high, log: false })
    }

    /// A categorical dimension.
    #[must_use]
    pub fn categorical<V: Into<ParamValue>>(
        name: impl Into<String>,
        choices: impl IntoIterator<Item = V>,
    ) -> Self {
        let choices = choices.into_iter().map(Into::into).collect();
        Self::with_kind(name, ParamKind::Categorical { choices })
    }

    /// An ordinal dimension over `sequence`.
    #[must_use]
    pub fn ordinal<V: Into<ParamValue>>(
        name: impl Into<String>,
        sequence: impl IntoIterator<Item = V>,
    ) -> Self {
        let sequence = sequence.into_iter().map(Into::into).collect();
        Self::with_kind(name, ParamKind::Ordinal { sequence })
    }

    fn with_kind(name: impl Into<String>, kind: ParamKind) -> Self {
        Self {
            name: name.into(),
            kind,
            initial: Vec::new(),
        }
    }

    /// Enables log-scale for float and int dimensions. No effect otherwise.
    #[must_use]
    pub fn log_scale(mut self) -> Self {
        match &mut self.kind {
            ParamKind::Float { log, .. } | ParamKind::Int { log, .. } => *log = true,
            ParamKind::Categorical { .. } | ParamKind::Ordinal { .. } => {}
        }
        self
    }

    /// Appends an initial value.
    #[must_use]
    pub fn initial(mut self, value: impl Into<ParamValue>) -> Self {
        self.initial.push(value.into());
        self
    }

    /// Validates bounds, log flags, choices, and initial values.
    ///
    /// # Errors
    ///
    /// Returns the first configuration error found.
    #[allow(clippy::cast_precision_loss)]
    pub fn validate(&self) -> Result<()> {
        match &self.kind {
            ParamKind::Float { low, high, log } => {
                check_bounds(&self.name, *low, *high, *log)?;
            }
            ParamKind::Int { low, high, log } => {
                check_bounds(&self.name, *low as f64, *high as f64, *log)?;
            }
            ParamKind::Categorical { choices: items } | ParamKind::Ordinal { sequence: items } => {
                if items.is_empty() {
                    return Err(Error::EmptyChoices(self.name.clone()));
                }
            }
        }
        for value in &self.initial {
            let cast = self.cast(value)?;
            if !self.contains(&cast) {
                return Err(Error::InvalidValue {
                    name: self.name.clone(),
                    reason: format!("initial value {value} lies outside the domain"),
                });
            }
        }
        Ok(())
    }

    /// Casts `value` to this dimension's member type.
    ///
    /// Integers are accepted for float dimensions and integral floats for int
    /// dimensions. Categorical and ordinal values must match a member exactly
    /// (numerically for numbers).
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidValue`] if the value has no sensible cast.
    #[allow(clippy::cast_possible_truncation, clippy::float_cmp)]
    pub fn cast(&self, value: &ParamValue) -> Result<ParamValue> {
        let invalid = |reason: &str| Error::InvalidValue {
            name: self.name.clone(),
            reason: reason.to_string(),
        };
        match &self.kind {
            ParamKind::Float { .. } => value
                .as_f64()
                .map(ParamValue::Float)
                .ok_or_else(|| invalid("expected a number")),
            ParamKind::Int { .. } => match value {
                ParamValue::Int(v) => Ok(ParamValue::Int(*v)),
                ParamValue::Float(v) if v.fract() == 0.0 && v.is_finite() => {
                    Ok(ParamValue::Int(*v as i64))
                }
                _ => Err(invalid("expected an integer")),
            },
            ParamKind::Categorical { choices: items } | ParamKind::Ordinal { sequence: items } => {
                items
                    .iter()
                    .find(|item| same_member(item, value))
                    .cloned()
                    .ok_or_else(|| invalid("not one of the declared members"))
            }
        }
    }

    /// Returns `true` if an already-cast value lies in the domain.
    #[allow(clippy::cast_precision_loss)]
    fn contains(&self, value: &ParamValue) -> bool {
        match (&self.kind, value) {
            (ParamKind::Float { low, high, .. }, ParamValue::Float(v)) => (*low..=*high).contains(v),
            (ParamKind::Int { low, high, .. }, ParamValue::Int(v)) => (*low..=*high).contains(v),
            (ParamKind::Categorical { .. } | ParamKind::Ordinal { .. }, _) => true,
            _ => false,
        }
    }

    /// Draws a uniform sample (log-uniform when `log` is set).
    #[allow(clippy::cast_possible_truncation, clippy::cast_precision_loss)]
    pub fn sample(&self, rng: &mut fastrand::Rng) -> ParamValue {
        match &self.kind {
            ParamKind::Float { low, high, log } => {
                let value = if *log {
                    rng_util::f64_range(rng, low.ln(), high.ln()).exp()
                } else {
                    rng_util::f64_range(rng, *low, *high)
                };
                ParamValue::Float(value.clamp(*low, *high))
            }
            ParamKind::Int { low, high, log } => {
                let value = if *log {
                    let raw = rng_util::f64_range(rng, (*low as f64).ln(), (*high as f64).ln());
                    (raw.exp().round() as i64).clamp(*low, *high)
                } else {
                    rng.i64(*low..=*high)
                };
                ParamValue::Int(value)
            }
            ParamKind::Categorical { choices: items } | ParamKind::Ordinal { sequence: items } => {
                items[rng.usize(0..items.len())].clone()
            }
        }
    }

    /// Internal-space bounds used by the simplex search.
    #[allow(clippy::cast_precision_loss)]
    fn internal_bounds(&self) -> Option<(f64, f64)> {
        match &self.kind {
            ParamKind::Float { low, high, log } => Some(if *log {
                (low.ln(), high.ln())
            } else {
                (*low, *high)
            }),
            ParamKind::Int { low, high, log } => {
                let (low, high) = (*low as f64, *high as f64);
                Some(if *log { (low.ln(), high.ln()) } else { (low, high) })
            }
            ParamKind::Ordinal { sequence } => Some((0.0, (sequence.len() - 1) as f64)),
            ParamKind::Categorical { .. } => None,
        }
    }

    /// Maps an already-cast value to its internal coordinate.
    #[allow(clippy::cast_precision_loss)]
    fn to_internal(&self, value: &ParamValue) -> Option<f64> {
        match &self.kind {
            ParamKind::Float { log, .. } | ParamKind::Int { log, .. } => {
                let v = value.as_f64()?;
                Some(if *log { v.ln() } else { v })
            }
            ParamKind::Ordinal { sequence } => sequence
                .iter()
                .position(|item| same_member(item, value))
                .map(|i| i as f64),
            ParamKind::Categorical { .. } => None,
        }
    }

    /// Maps an internal coordinate back to a member value.
    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        clippy::cast_precision_loss
    )]
    fn from_internal(&self, x: f64) -> Option<ParamValue> {
        match &self.kind {
            ParamKind::Float { low, high, log } => {
                let v = if *log { x.exp() } else { x };
                Some(ParamValue::Float(v.clamp(*low, *high)))
            }
            ParamKind::Int { low, high, log } => {
                let v = if *log { x.exp() } else { x };
                Some(ParamValue::Int((v.round() as i64).clamp(*low, *high)))
            }
            ParamKind::Ordinal { sequence } => {
                let index = (x.round().max(0.0) as usize).min(sequence.len() - 1);
                Some(sequence[index].clone())
            }
            ParamKind::Categorical { .. } => None,
        }
    }
}

fn check_bounds(name: &str, low: f64, high: f64, log: bool) -> Result<()> {
    if !(low <= high) {
        return Err(Error::InvalidBounds {
            name: name.to_string(),
            low,
            high,
        });
    }
    if log && low <= 0.0 {
        return Err(Error::InvalidLogBounds(name.to_string()));
    }
    Ok(())
}

#[allow(clippy::float_cmp)]
fn same_member(member: &ParamValue, value: &ParamValue) -> bool {
    match (member, value) {
        (ParamValue::Str(a), ParamValue::Str(b)) => a == b,
        (a, b) => match (a.as_f64(), b.as_f64()) {
            (Some(a), Some(b)) => a == b,
            _ => false,
        },
    }
}

/// An ordered, validated list of dimensions.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<ParamSpec>", into = "Vec<ParamSpec>")]
pub struct ParameterSpace {
    params: Vec<ParamSpec>,
}

impl ParameterSpace {
    /// Builds and validates a space.
    ///
    /// # Errors
    ///
    /// Returns an error for an empty list, duplicate names, or any invalid
    /// dimension.
    pub fn new(params: Vec<ParamSpec>) -> Result<Self> {
        if params.is_empty() {
            return Err(Error::EmptySpace);
        }
        for (i, spec) in params.iter().enumerate() {
            spec.validate()?;
            if params[..i].iter().any(|p| p.name == spec.name) {
                return Err(Error::DuplicateParameter(spec.name.clone()));
            }
        }
        Ok(Self { params })
    }

    /// Number of dimensions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.params.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    #[must_use]
    pub fn params(&self) -> &[ParamSpec] {
        &self.params
    }

    /// Draws one uniform sample per dimension.
    pub fn sample(&self, rng: &mut fastrand::Rng) -> Params {
        self.params
            .iter()
            .map(|spec| (spec.name.clone(), spec.sample(rng)))
            .collect()
    }

    /// Validates `params` against the space and casts every value to its
    /// member type, returning them in declaration order.
    ///
    /// # Errors
    ///
    /// Returns an error for unknown or missing names and uncastable or
    /// out-of-domain values.
    pub fn cast(&self, params: &Params) -> Result<Params> {
        for (name, _) in params.iter() {
            if !self.params.iter().any(|p| p.name == name) {
                return Err(Error::UnknownParameter(name.to_string()));
            }
        }
        let mut out = Params::new();
        for spec in &self.params {
            let value = params.get(&spec.name).ok_or_else(|| Error::InvalidValue {
                name: spec.name.clone(),
                reason: "missing value".to_string(),
            })?;
            let cast = spec.cast(value)?;
            if !spec.contains(&cast) {
                return Err(Error::InvalidValue {
                    name: spec.name.clone(),
                    reason: format!("{value} lies outside the domain"),
                });
            }
            out.insert(spec.name.clone(), cast);
        }
        Ok(out)
    }

    /// Checks that every dimension has a real-valued encoding.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnsupportedParameter`] for the first categorical dimension.
    pub fn require_numeric(&self, sampler: &'static str) -> Result<()> {
        match self.params.iter().find(|p| p.internal_bounds().is_none()) {
            Some(p) => Err(Error::UnsupportedParameter {
                name: p.name.clone(),
                kind: p.kind.label(),
                sampler,
            }),
            None => Ok(()),
        }
    }

    /// Internal-space bounds, one pair per dimension.
    ///
    /// # Errors
    ///
    /// Fails when a dimension has no real-valued encoding.
    pub fn internal_bounds(&self) -> Result<Vec<(f64, f64)>> {
        self.require_numeric("the internal encoding")?;
        Ok(self
            .params
            .iter()
            .filter_map(ParamSpec::internal_bounds)
            .collect())
    }

    /// Internal coordinates for a full parameter set.
    ///
    /// # Errors
    ///
    /// Fails when a value is missing, uncastable, or has no encoding.
    pub fn to_internal(&self, params: &Params) -> Result<Vec<f64>> {
        let params = self.cast(params)?;
        self.params
            .iter()
            .map(|spec| {
                params
                    .get(&spec.name)
                    .and_then(|v| spec.to_internal(v))
                    .ok_or_else(|| Error::InvalidValue {
                        name: spec.name.clone(),
                        reason: "no internal encoding".to_string(),
                    })
            })
            .collect()
    }

    /// Decodes an internal vector into member values (rounded and clamped).
    ///
    /// # Errors
    ///
    /// Fails on a length mismatch or a dimension without encoding.
    pub fn from_internal(&self, x: &[f64]) -> Result<Params> {
        if x.len() != self.params.len() {
            return Err(Error::Internal("internal vector length does not match the space"));
        }
        self.params
            .iter()
            .zip(x)
            .map(|(spec, &xi)| {
                spec.from_internal(xi)
                    .map(|v| (spec.name.clone(), v))
                    .ok_or_else(|| Error::InvalidValue {
                        name: spec.name.clone(),
                        reason: "no internal encoding".to_string(),
                    })
            })
            .collect()
    }

    /// Initial points in internal coordinates; `None` marks a coordinate to
    /// be sampled. The number of points is the longest `initial` list.
    ///
    /// # Errors
    ///
    /// Fails when an initial value has no encoding.
    pub fn initial_points(&self) -> Result<Vec<Vec<Option<f64>>>> {
        let count = self.params.iter().map(|p| p.initial.len()).max().unwrap_or(0);
        (0..count)
            .map(|k| {
                self.params
                    .iter()
                    .map(|spec| -> Result<Option<f64>> {
                        let Some(value) = spec.initial.get(k) else {
                            return Ok(None);
                        };
                        let cast = spec.cast(value)?;
                        spec.to_internal(&cast)
                            .map(Some)
                            .ok_or_else(|| Error::InvalidValue {
                                name: spec.name.clone(),
                                reason: "no internal encoding".to_string(),
                            })
                    })
                    .collect::<Result<Vec<_>>>()
            })
            .collect()
    }
}

impl TryFrom<Vec<ParamSpec>> for ParameterSpace {
    type Error = Error;

    fn try_from(params: Vec<ParamSpec>) -> Result<Self> {
        Self::new(params)
    }
}

impl From<ParameterSpace> for Vec<ParamSpec> {
    fn from(space: ParameterSpace) -> Self {
        space.params
    }
}
