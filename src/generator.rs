//! Value generators for device fields
//!
//! Each generator is a closed set of kinds interpreted by [`Generator::next`].
//! Generators hold no state and no randomness of their own: the caller owns
//! the [`GeneratorState`] and passes the random source in, so a seeded RNG
//! replays the same sequence.

use crate::error::InvalidSpec;
use rand::Rng;
use rand_distr::StandardNormal;
use serde::Serialize;
use serde_json::Value;

/// Largest accepted `decimals` setting for float output
pub const MAX_DECIMALS: u32 = 12;

/// The value production rule for one field
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GeneratorKind {
    /// Uniform sample in `[min, max]`
    Range { min: f64, max: f64 },
    /// Normal sample, optionally clamped to `[min, max]`
    Gaussian {
        mean: f64,
        stddev: f64,
        clamp: Option<(f64, f64)>,
    },
    /// Previous value plus a uniform delta in `[-step, step]`, clamped
    RandomWalk {
        min: f64,
        max: f64,
        step: f64,
        /// Starting point; uniform in `[min, max]` when absent
        start: Option<f64>,
    },
    /// `true` with the given probability, independently per tick
    Boolean { probability: f64 },
    /// Fixed literals emitted in order, wrapping at the end
    Cycle { values: Vec<Value> },
    /// Fixed literals emitted once in order. The field is inactive after the
    /// last one.
    Sequence { values: Vec<Value> },
}

impl GeneratorKind {
    /// Inclusive bounds of every numeric value this kind produces
    #[must_use]
    pub fn bounds(&self) -> Option<(f64, f64)> {
        match self {
            Self::Range { min, max } | Self::RandomWalk { min, max, .. } => Some((*min, *max)),
            Self::Gaussian { clamp, .. } => *clamp,
            Self::Boolean { .. } | Self::Cycle { .. } | Self::Sequence { .. } => None,
        }
    }

    fn is_numeric(&self) -> bool {
        matches!(
            self,
            Self::Range { .. } | Self::Gaussian { .. } | Self::RandomWalk { .. }
        )
    }
}

/// How a generated value is rendered into the payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutputType {
    Int,
    Float { decimals: Option<u32> },
    Bool,
    Literal,
}

/// One generated value
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum FieldValue {
    Int(i64),
    Float(f64),
    Bool(bool),
    Literal(Value),
}

impl FieldValue {
    #[must_use]
    pub fn to_json(&self) -> Value {
        match self {
            Self::Int(v) => Value::from(*v),
            Self::Float(v) => Value::from(*v),
            Self::Bool(v) => Value::Bool(*v),
            Self::Literal(v) => v.clone(),
        }
    }

    /// Numeric view of the value, if it has one
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int(v) => Some(*v as f64),
            Self::Float(v) => Some(*v),
            Self::Bool(_) => None,
            Self::Literal(v) => v.as_f64(),
        }
    }
}

/// Per-field mutable state, owned by the device that runs the field
#[derive(Debug, Clone, PartialEq)]
pub enum GeneratorState {
    Stateless,
    /// Last value a random walk emitted
    Walk { last: f64 },
    /// Index of the next literal of a cycle
    Cursor { index: usize },
}

/// A validated generator: a kind plus its output rendering
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Generator {
    kind: GeneratorKind,
    output: OutputType,
}

fn finite(name: &str, value: f64) -> Result<(), InvalidSpec> {
    if value.is_finite() {
        Ok(())
    } else {
        Err(InvalidSpec(format!("{name} must be a finite number")))
    }
}

fn ordered(min: f64, max: f64) -> Result<(), InvalidSpec> {
    finite("min", min)?;
    finite("max", max)?;
    if min > max {
        return Err(InvalidSpec(format!(
            "min ({min}) must not exceed max ({max})"
        )));
    }
    if !(max - min).is_finite() {
        return Err(InvalidSpec(format!("range [{min}, {max}] is too wide")));
    }
    Ok(())
}

impl Generator {
    /// Validates the parameters and pairs them with an output type
    ///
    /// # Errors
    ///
    /// Returns `InvalidSpec` when a parameter is out of domain or the output
    /// type cannot render what the kind produces
    pub fn new(kind: GeneratorKind, output: OutputType) -> Result<Self, InvalidSpec> {
        match &kind {
            GeneratorKind::Range { min, max } => ordered(*min, *max)?,
            GeneratorKind::Gaussian {
                mean,
                stddev,
                clamp,
            } => {
                finite("mean", *mean)?;
                finite("stddev", *stddev)?;
                if *stddev < 0.0 {
                    return Err(InvalidSpec(format!(
                        "stddev ({stddev}) must not be negative"
                    )));
                }
                if let Some((min, max)) = clamp {
                    ordered(*min, *max)?;
                }
            }
            GeneratorKind::RandomWalk {
                min,
                max,
                step,
                start,
            } => {
                ordered(*min, *max)?;
                finite("step", *step)?;
                if *step < 0.0 {
                    return Err(InvalidSpec(format!("step ({step}) must not be negative")));
                }
                finite("step range", step * 2.0)?;
                if let Some(start) = start {
                    finite("start", *start)?;
                    if start < min || start > max {
                        return Err(InvalidSpec(format!(
                            "start ({start}) must lie within [{min}, {max}]"
                        )));
                    }
                }
            }
            GeneratorKind::Boolean { probability } => {
                if !(0.0..=1.0).contains(probability) {
                    return Err(InvalidSpec(format!(
                        "probability ({probability}) must lie within [0, 1]"
                    )));
                }
            }
            GeneratorKind::Cycle { values } | GeneratorKind::Sequence { values } => {
                if values.is_empty() {
                    return Err(InvalidSpec("cycle needs at least one value".to_string()));
                }
            }
        }

        match output {
            OutputType::Int | OutputType::Float { .. } if !kind.is_numeric() => {
                return Err(InvalidSpec(
                    "numeric output requires a range, gaussian or random_walk generator"
                        .to_string(),
                ));
            }
            OutputType::Bool if !matches!(kind, GeneratorKind::Boolean { .. }) => {
                return Err(InvalidSpec("bool output requires a bool generator".to_string()));
            }
            OutputType::Literal
                if !matches!(
                    kind,
                    GeneratorKind::Cycle { .. } | GeneratorKind::Sequence { .. }
                ) =>
            {
                return Err(InvalidSpec(
                    "literal output requires a cycle generator".to_string(),
                ));
            }
            OutputType::Float {
                decimals: Some(decimals),
            } if decimals > MAX_DECIMALS => {
                return Err(InvalidSpec(format!(
                    "decimals ({decimals}) must not exceed {MAX_DECIMALS}"
                )));
            }
            _ => {}
        }

        if output == OutputType::Int {
            if let Some((min, max)) = kind.bounds() {
                if min.ceil() > max.floor() {
                    return Err(InvalidSpec(format!(
                        "no integer lies within [{min}, {max}]"
                    )));
                }
            }
        }

        let generator = Self { kind, output };
        if let (GeneratorKind::RandomWalk { step, .. }, Some(resolution)) =
            (&generator.kind, generator.resolution())
        {
            if *step > 0.0 && *step < resolution {
                return Err(InvalidSpec(format!(
                    "step ({step}) is finer than the output resolution ({resolution})"
                )));
            }
        }
        Ok(generator)
    }

    /// Builds a generator with the natural output type of its kind: float for
    /// numeric kinds, bool for booleans, literal for cycles and sequences
    ///
    /// # Errors
    ///
    /// Returns `InvalidSpec` when a parameter is out of domain
    pub fn with_default_output(kind: GeneratorKind) -> Result<Self, InvalidSpec> {
        let output = match kind {
            GeneratorKind::Boolean { .. } => OutputType::Bool,
            GeneratorKind::Cycle { .. } | GeneratorKind::Sequence { .. } => OutputType::Literal,
            _ => OutputType::Float { decimals: None },
        };
        Self::new(kind, output)
    }

    #[must_use]
    pub fn kind(&self) -> &GeneratorKind {
        &self.kind
    }

    #[must_use]
    pub fn output(&self) -> OutputType {
        self.output
    }

    /// State a fresh device starts from
    pub fn initial_state<R: Rng + ?Sized>(&self, rng: &mut R) -> GeneratorState {
        match &self.kind {
            GeneratorKind::RandomWalk {
                min, max, start, ..
            } => GeneratorState::Walk {
                last: self.snap(start.unwrap_or_else(|| rng.random_range(*min..=*max))),
            },
            GeneratorKind::Cycle { .. } | GeneratorKind::Sequence { .. } => {
                GeneratorState::Cursor { index: 0 }
            }
            _ => GeneratorState::Stateless,
        }
    }

    /// Whether `next` still has a value to give. Only a sequence past its
    /// last literal is inactive.
    #[must_use]
    pub fn is_active(&self, state: &GeneratorState) -> bool {
        match (&self.kind, state) {
            (GeneratorKind::Sequence { values }, GeneratorState::Cursor { index }) => {
                *index < values.len()
            }
            _ => true,
        }
    }

    /// Produces the next value and the state to use for the following call
    ///
    /// A state of the wrong shape (for example one built for another kind)
    /// is treated as a fresh start.
    pub fn next<R: Rng + ?Sized>(
        &self,
        state: &GeneratorState,
        rng: &mut R,
    ) -> (FieldValue, GeneratorState) {
        match &self.kind {
            GeneratorKind::Range { min, max } => {
                let value = rng.random_range(*min..=*max);
                (self.render(value), GeneratorState::Stateless)
            }
            GeneratorKind::Gaussian {
                mean,
                stddev,
                clamp,
            } => {
                let z: f64 = rng.sample(StandardNormal);
                let mut value = mean + stddev * z;
                if let Some((min, max)) = clamp {
                    value = value.clamp(*min, *max);
                }
                (self.render(value), GeneratorState::Stateless)
            }
            GeneratorKind::RandomWalk { min, max, step, .. } => {
                let last = match state {
                    GeneratorState::Walk { last } => self.snap(last.clamp(*min, *max)),
                    _ => match self.initial_state(rng) {
                        GeneratorState::Walk { last } => last,
                        _ => *min,
                    },
                };
                let delta = rng.random_range(-*step..=*step);
                let mut value = self.snap((last + delta).clamp(*min, *max));
                // Rounding may overshoot the step; fall back to the nearest
                // grid point on the near side of the limit.
                if value > last + step {
                    value = self.grid_floor(last + step);
                } else if value < last - step {
                    value = self.grid_ceil(last - step);
                }
                let emitted = self.render(value);
                let last = emitted.as_f64().unwrap_or(value);
                (emitted, GeneratorState::Walk { last })
            }
            GeneratorKind::Boolean { probability } => (
                FieldValue::Bool(rng.random_bool(*probability)),
                GeneratorState::Stateless,
            ),
            GeneratorKind::Cycle { values } => {
                let index = match state {
                    GeneratorState::Cursor { index } => index % values.len(),
                    _ => 0,
                };
                (
                    FieldValue::Literal(values[index].clone()),
                    GeneratorState::Cursor {
                        index: (index + 1) % values.len(),
                    },
                )
            }
            GeneratorKind::Sequence { values } => {
                let index = match state {
                    GeneratorState::Cursor { index } => *index,
                    _ => 0,
                };
                // An exhausted sequence repeats its last literal
                let value = values.get(index).or_else(|| values.last());
                (
                    FieldValue::Literal(value.cloned().unwrap_or(Value::Null)),
                    GeneratorState::Cursor {
                        index: index.saturating_add(1).min(values.len()),
                    },
                )
            }
        }
    }

    /// Multiplier applied before rounding to the output's decimal places
    fn scale(&self) -> Option<f64> {
        match self.output {
            OutputType::Float {
                decimals: Some(decimals),
            } => Some(10f64.powi(i32::try_from(decimals).unwrap_or(i32::MAX))),
            _ => None,
        }
    }

    /// Spacing between the values the output can represent, if it rounds
    fn resolution(&self) -> Option<f64> {
        match self.output {
            OutputType::Int => Some(1.0),
            _ => self.scale().map(f64::recip),
        }
    }

    fn grid_floor(&self, value: f64) -> f64 {
        match self.output {
            OutputType::Int => value.floor(),
            _ => self.scale().map_or(value, |scale| (value * scale).floor() / scale),
        }
    }

    fn grid_ceil(&self, value: f64) -> f64 {
        match self.output {
            OutputType::Int => value.ceil(),
            _ => self.scale().map_or(value, |scale| (value * scale).ceil() / scale),
        }
    }

    /// Numeric value of `render(value)`
    fn snap(&self, value: f64) -> f64 {
        self.render(value).as_f64().unwrap_or(value)
    }

    /// Applies the output type to a numeric sample. Rounding never moves a
    /// value outside the kind's bounds.
    #[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
    fn render(&self, value: f64) -> FieldValue {
        let bounds = self.kind.bounds();
        match self.output {
            OutputType::Int => {
                let mut rounded = value.round();
                if let Some((min, max)) = bounds {
                    rounded = rounded.clamp(min.ceil(), max.floor());
                }
                FieldValue::Int(rounded as i64)
            }
            OutputType::Float {
                decimals: Some(_),
            } => {
                let scale = self.scale().unwrap_or(1.0);
                let mut rounded = (value * scale).round() / scale;
                if let Some((min, max)) = bounds {
                    rounded = rounded.clamp(min, max);
                }
                FieldValue::Float(rounded)
            }
            _ => FieldValue::Float(value),
        }
    }
}
