//! Device profile registry
//!
//! Turns the `devices` section of a configuration document into validated,
//! immutable [`DeviceProfile`]s. Loading is all or nothing: the first invalid
//! profile rejects the whole registry.

use crate::config::{child, deserialize, positive_seconds, qos, seconds};
use crate::connection::serialize_secs;
use crate::error::ConfigError;
use crate::generator::{Generator, GeneratorKind, OutputType};
use crate::payload::RESERVED_KEYS;
use crate::QoS;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};
use std::time::Duration;

/// Shortest delay between two ticks, whatever the jitter draws
pub const MIN_INTERVAL: Duration = Duration::from_millis(1);

/// Upper bound on devices produced by one `replicas` block
pub const MAX_REPLICAS: u32 = 10_000;

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "snake_case")]
enum FieldType {
    Range,
    Gaussian,
    RandomWalk,
    Bool,
    Cycle,
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "snake_case")]
enum OutputName {
    Float,
    Int,
    Bool,
    Literal,
}

/// One `fields[i]` entry as written. Generator parameters stay flat next to
/// `type`; which of them are required depends on the type.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawField {
    name: String,
    #[serde(rename = "type")]
    kind: FieldType,
    min: Option<f64>,
    max: Option<f64>,
    mean: Option<f64>,
    stddev: Option<f64>,
    step: Option<f64>,
    start: Option<f64>,
    probability: Option<f64>,
    values: Option<Vec<Value>>,
    /// `false` turns a cycle into a one-shot sequence
    repeat: Option<bool>,
    output: Option<OutputName>,
    decimals: Option<u32>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawReplicas {
    start: u32,
    end: u32,
}

/// One `devices[i]` entry as written
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct RawDevice {
    name: String,
    topic: String,
    interval: f64,
    jitter: Option<f64>,
    qos: Option<u8>,
    retain: Option<bool>,
    payload_root: Option<Map<String, Value>>,
    replicas: Option<RawReplicas>,
    fields: Vec<RawField>,
}

#[derive(Debug, Deserialize)]
struct DevicesSection {
    devices: Vec<RawDevice>,
}

/// Publish cadence: a base interval plus a symmetric jitter bound
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct IntervalSpec {
    #[serde(serialize_with = "serialize_secs")]
    pub base: Duration,
    #[serde(serialize_with = "serialize_secs")]
    pub jitter: Duration,
}

impl IntervalSpec {
    #[must_use]
    pub fn new(base: Duration, jitter: Duration) -> Self {
        Self { base, jitter }
    }

    #[must_use]
    pub fn fixed(base: Duration) -> Self {
        Self::new(base, Duration::ZERO)
    }

    /// Draws the delay until the next tick, uniform in
    /// `[base - jitter, base + jitter]` and never below [`MIN_INTERVAL`]
    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> Duration {
        if self.jitter.is_zero() {
            return self.base.max(MIN_INTERVAL);
        }
        let jitter = self.jitter.as_secs_f64();
        let offset = rng.random_range(-jitter..=jitter);
        let secs = (self.base.as_secs_f64() + offset).max(MIN_INTERVAL.as_secs_f64());
        Duration::try_from_secs_f64(secs).unwrap_or(self.base)
    }

    /// Smallest and largest delay [`IntervalSpec::sample`] can return
    #[must_use]
    pub fn bounds(&self) -> (Duration, Duration) {
        (
            self.base.saturating_sub(self.jitter).max(MIN_INTERVAL),
            (self.base + self.jitter).max(MIN_INTERVAL),
        )
    }
}

/// One named field and the generator that fills it
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FieldSpec {
    pub name: String,
    pub generator: Generator,
}

impl FieldSpec {
    #[must_use]
    pub fn new(name: impl Into<String>, generator: Generator) -> Self {
        Self {
            name: name.into(),
            generator,
        }
    }
}

/// A validated device description. Immutable once loaded.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceProfile {
    pub name: String,
    /// Fully resolved topic
    pub topic: String,
    pub interval: IntervalSpec,
    pub qos: QoS,
    pub retain: bool,
    /// Static keys merged into every payload
    pub payload_root: Map<String, Value>,
    pub fields: Vec<FieldSpec>,
}

impl DeviceProfile {
    /// Profile with a fixed topic and no static keys
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        topic: impl Into<String>,
        interval: IntervalSpec,
        fields: Vec<FieldSpec>,
    ) -> Self {
        Self {
            name: name.into(),
            topic: topic.into(),
            interval,
            qos: QoS::AtMostOnce,
            retain: false,
            payload_root: Map::new(),
            fields,
        }
    }

    #[must_use]
    pub fn with_qos(mut self, qos: QoS) -> Self {
        self.qos = qos;
        self
    }

    #[must_use]
    pub fn with_retain(mut self, retain: bool) -> Self {
        self.retain = retain;
        self
    }

    #[must_use]
    pub fn with_payload_root(mut self, root: Map<String, Value>) -> Self {
        self.payload_root = root;
        self
    }
}

/// A topic with `{device}` and `{index}` placeholders
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicTemplate {
    raw: String,
}

enum Segment<'a> {
    Text(&'a str),
    Var(&'a str),
}

impl TopicTemplate {
    #[must_use]
    pub fn new(raw: impl Into<String>) -> Self {
        Self { raw: raw.into() }
    }

    fn segments(&self) -> Result<Vec<Segment<'_>>, String> {
        let mut segments = Vec::new();
        let mut rest = self.raw.as_str();
        while let Some(open) = rest.find('{') {
            if let Some(stray) = rest[..open].find('}') {
                return Err(format!("unmatched `}}` at byte {stray}"));
            }
            segments.push(Segment::Text(&rest[..open]));
            let after = &rest[open + 1..];
            let close = after
                .find('}')
                .ok_or_else(|| "unclosed `{` in topic".to_string())?;
            segments.push(Segment::Var(&after[..close]));
            rest = &after[close + 1..];
        }
        if rest.contains('}') {
            return Err("unmatched `}` in topic".to_string());
        }
        segments.push(Segment::Text(rest));
        Ok(segments)
    }

    /// Substitutes the placeholders. `{index}` is only bound for replicated
    /// devices; any other placeholder is an error.
    ///
    /// # Errors
    ///
    /// Returns a description of the first unbound or malformed placeholder
    pub fn resolve(&self, device: &str, index: Option<u32>) -> Result<String, String> {
        let mut topic = String::with_capacity(self.raw.len());
        for segment in self.segments()? {
            match segment {
                Segment::Text(text) => topic.push_str(text),
                Segment::Var("device") => topic.push_str(device),
                Segment::Var("index") => match index {
                    Some(i) => topic.push_str(&i.to_string()),
                    None => {
                        return Err(
                            "`{index}` is only available for devices with replicas".to_string()
                        )
                    }
                },
                Segment::Var(other) => return Err(format!("unbound template variable `{{{other}}}`")),
            }
        }
        Ok(topic)
    }
}

/// Checks a resolved topic is publishable
fn validate_topic(topic: &str) -> Result<(), String> {
    if topic.is_empty() {
        return Err("topic must not be empty".to_string());
    }
    if topic.contains(['+', '#']) {
        return Err(format!("topic `{topic}` contains a wildcard"));
    }
    if topic.contains('\0') {
        return Err("topic contains a NUL character".to_string());
    }
    if topic.len() > usize::from(u16::MAX) {
        return Err("topic is longer than 65535 bytes".to_string());
    }
    Ok(())
}

fn missing(path: &str, key: &str) -> ConfigError {
    ConfigError::MissingField {
        path: child(path, key),
    }
}

fn required<T>(value: Option<T>, path: &str, key: &str) -> Result<T, ConfigError> {
    value.ok_or_else(|| missing(path, key))
}

fn build_field(raw: RawField, path: &str) -> Result<FieldSpec, ConfigError> {
    if raw.name.is_empty() {
        return Err(ConfigError::out_of_domain(
            child(path, "name"),
            "must not be empty",
        ));
    }
    if RESERVED_KEYS.contains(&raw.name.as_str()) {
        return Err(ConfigError::out_of_domain(
            child(path, "name"),
            format!("`{}` is reserved for payload metadata", raw.name),
        ));
    }

    let kind = match raw.kind {
        FieldType::Range => GeneratorKind::Range {
            min: required(raw.min, path, "min")?,
            max: required(raw.max, path, "max")?,
        },
        FieldType::Gaussian => {
            let clamp = match (raw.min, raw.max) {
                (Some(min), Some(max)) => Some((min, max)),
                (None, None) => None,
                (Some(_), None) => return Err(missing(path, "max")),
                (None, Some(_)) => return Err(missing(path, "min")),
            };
            GeneratorKind::Gaussian {
                mean: required(raw.mean, path, "mean")?,
                stddev: required(raw.stddev, path, "stddev")?,
                clamp,
            }
        }
        FieldType::RandomWalk => GeneratorKind::RandomWalk {
            min: required(raw.min, path, "min")?,
            max: required(raw.max, path, "max")?,
            step: required(raw.step, path, "step")?,
            start: raw.start,
        },
        FieldType::Bool => GeneratorKind::Boolean {
            probability: required(raw.probability, path, "probability")?,
        },
        FieldType::Cycle => {
            let values = required(raw.values, path, "values")?;
            if raw.repeat.unwrap_or(true) {
                GeneratorKind::Cycle { values }
            } else {
                GeneratorKind::Sequence { values }
            }
        }
    };
    if raw.repeat.is_some() && !matches!(raw.kind, FieldType::Cycle) {
        return Err(ConfigError::out_of_domain(
            child(path, "repeat"),
            "only applies to cycle fields",
        ));
    }

    let decimals = raw.decimals;
    let output = match raw.output {
        None => match kind {
            GeneratorKind::Boolean { .. } => OutputType::Bool,
            GeneratorKind::Cycle { .. } | GeneratorKind::Sequence { .. } => OutputType::Literal,
            _ => OutputType::Float { decimals },
        },
        Some(OutputName::Float) => OutputType::Float { decimals },
        Some(OutputName::Int) => OutputType::Int,
        Some(OutputName::Bool) => OutputType::Bool,
        Some(OutputName::Literal) => OutputType::Literal,
    };
    if decimals.is_some() && !matches!(output, OutputType::Float { .. }) {
        return Err(ConfigError::out_of_domain(
            child(path, "decimals"),
            "only applies to float output",
        ));
    }

    let generator = Generator::new(kind, output).map_err(|e| ConfigError::from_spec(path, e))?;
    Ok(FieldSpec::new(raw.name, generator))
}

/// Validates one `devices[i]` entry, expanding replicas into several
/// profiles
fn build_device(raw: RawDevice, path: &str) -> Result<Vec<DeviceProfile>, ConfigError> {
    if raw.name.is_empty() {
        return Err(ConfigError::out_of_domain(
            child(path, "name"),
            "must not be empty",
        ));
    }
    let topic_path = child(path, "topic");
    let template = TopicTemplate::new(raw.topic);

    let interval = IntervalSpec::new(
        positive_seconds(raw.interval, &child(path, "interval"))?,
        raw.jitter
            .map(|secs| seconds(secs, &child(path, "jitter")))
            .transpose()?
            .unwrap_or(Duration::ZERO),
    );
    let qos = raw
        .qos
        .map(|level| qos(level, &child(path, "qos")))
        .transpose()?
        .unwrap_or_default();
    let retain = raw.retain.unwrap_or(false);

    let payload_root = raw.payload_root.unwrap_or_default();
    if let Some(key) = payload_root
        .keys()
        .find(|k| RESERVED_KEYS.contains(&k.as_str()))
    {
        return Err(ConfigError::out_of_domain(
            child(path, "payload_root"),
            format!("`{key}` is reserved for payload metadata"),
        ));
    }

    let fields_path = child(path, "fields");
    if raw.fields.is_empty() {
        return Err(ConfigError::out_of_domain(
            fields_path,
            "a device needs at least one field",
        ));
    }
    let mut fields = Vec::with_capacity(raw.fields.len());
    let mut seen = HashSet::new();
    for (i, raw_field) in raw.fields.into_iter().enumerate() {
        let field_path = format!("{fields_path}[{i}]");
        let field = build_field(raw_field, &field_path)?;
        if payload_root.contains_key(&field.name) {
            return Err(ConfigError::out_of_domain(
                field_path,
                format!("field `{}` collides with a payload_root key", field.name),
            ));
        }
        if !seen.insert(field.name.clone()) {
            return Err(ConfigError::out_of_domain(
                field_path,
                format!("duplicate field `{}`", field.name),
            ));
        }
        fields.push(field);
    }

    let instances: Vec<(String, Option<u32>)> = match raw.replicas {
        Some(RawReplicas { start, end }) => {
            let replicas_path = child(path, "replicas");
            if start > end {
                return Err(ConfigError::out_of_domain(
                    replicas_path,
                    format!("start ({start}) must not exceed end ({end})"),
                ));
            }
            if end - start >= MAX_REPLICAS {
                return Err(ConfigError::out_of_domain(
                    replicas_path,
                    format!("at most {MAX_REPLICAS} replicas per device"),
                ));
            }
            (start..=end)
                .map(|i| (format!("{}-{i}", raw.name), Some(i)))
                .collect()
        }
        None => vec![(raw.name, None)],
    };

    instances
        .into_iter()
        .map(|(device, index)| -> Result<DeviceProfile, ConfigError> {
            let topic = template
                .resolve(&device, index)
                .and_then(|topic| validate_topic(&topic).map(|()| topic))
                .map_err(|reason| ConfigError::out_of_domain(topic_path.as_str(), reason))?;
            Ok(DeviceProfile {
                name: device,
                topic,
                interval,
                qos,
                retain,
                payload_root: payload_root.clone(),
                fields: fields.clone(),
            })
        })
        .collect()
}

/// The validated set of devices to simulate
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(transparent)]
pub struct Registry {
    profiles: Vec<DeviceProfile>,
}

impl Registry {
    /// Builds a registry from profiles constructed in code
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::DuplicateDevice` or
    /// `ConfigError::DuplicateTopic` on collisions
    pub fn new(profiles: Vec<DeviceProfile>) -> Result<Self, ConfigError> {
        let mut names = HashSet::new();
        let mut topics: HashMap<&str, &str> = HashMap::new();
        for profile in &profiles {
            if !names.insert(profile.name.as_str()) {
                return Err(ConfigError::DuplicateDevice {
                    name: profile.name.clone(),
                });
            }
            if let Some(first) = topics.insert(profile.topic.as_str(), profile.name.as_str()) {
                return Err(ConfigError::DuplicateTopic {
                    topic: profile.topic.clone(),
                    first: first.to_string(),
                    second: profile.name.clone(),
                });
            }
        }
        Ok(Self { profiles })
    }

    /// Loads the registry from a configuration document, reading its
    /// `devices` array
    ///
    /// # Errors
    ///
    /// Returns the first `ConfigError` found; nothing is loaded on error
    pub fn load(raw: &str) -> Result<Self, ConfigError> {
        let document: Value =
            serde_json::from_str(raw).map_err(|e| ConfigError::Parse(e.to_string()))?;
        Self::from_value(&document)
    }

    /// As [`Registry::load`], for an already parsed document
    ///
    /// # Errors
    ///
    /// Returns the first `ConfigError` found
    pub fn from_value(document: &Value) -> Result<Self, ConfigError> {
        let section: DevicesSection = deserialize(document)?;
        Self::from_raw(section.devices, "devices")
    }

    /// Validates deserialized device entries found at `path`
    pub(crate) fn from_raw(devices: Vec<RawDevice>, path: &str) -> Result<Self, ConfigError> {
        if devices.is_empty() {
            return Err(ConfigError::out_of_domain(
                path,
                "at least one device is required",
            ));
        }
        let mut profiles = Vec::with_capacity(devices.len());
        for (i, device) in devices.into_iter().enumerate() {
            profiles.extend(build_device(device, &format!("{path}[{i}]"))?);
        }
        Self::new(profiles)
    }

    #[must_use]
    pub fn profiles(&self) -> &[DeviceProfile] {
        &self.profiles
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&DeviceProfile> {
        self.profiles.iter().find(|p| p.name == name)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.profiles.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, DeviceProfile> {
        self.profiles.iter()
    }
}

impl<'a> IntoIterator for &'a Registry {
    type Item = &'a DeviceProfile;
    type IntoIter = std::slice::Iter<'a, DeviceProfile>;

    fn into_iter(self) -> Self::IntoIter {
        self.profiles.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use serde_json::json;

    fn load(devices: Value) -> Result<Registry, ConfigError> {
        Registry::from_value(&json!({ "devices": devices }))
    }

    fn thermostat() -> Value {
        json!({
            "name": "thermostat",
            "topic": "home/{device}/state",
            "interval": 2,
            "jitter": 0.5,
            "qos": 1,
            "payload_root": {"site": "lab"},
            "fields": [
                {"name": "temperature", "type": "random_walk", "min": 15, "max": 30, "step": 0.5, "decimals": 1},
                {"name": "heating", "type": "bool", "probability": 0.3},
                {"name": "mode", "type": "cycle", "values": ["eco", "comfort"]}
            ]
        })
    }

    #[test]
    fn test_load_resolves_profile() {
        let registry = load(json!([thermostat()])).unwrap();
        assert_eq!(registry.len(), 1);
        let profile = registry.get("thermostat").unwrap();
        assert_eq!(profile.topic, "home/thermostat/state");
        assert_eq!(profile.qos, QoS::AtLeastOnce);
        assert_eq!(
            profile.interval,
            IntervalSpec::new(Duration::from_secs(2), Duration::from_millis(500))
        );
        assert_eq!(profile.payload_root.get("site"), Some(&json!("lab")));
        let names: Vec<_> = profile.fields.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["temperature", "heating", "mode"]);
        assert_eq!(
            profile.fields[0].generator.output(),
            OutputType::Float { decimals: Some(1) }
        );
        assert_eq!(profile.fields[1].generator.output(), OutputType::Bool);
    }

    #[test]
    fn test_replicas_expand() {
        let mut device = thermostat();
        device["replicas"] = json!({"start": 1, "end": 3});
        device["topic"] = json!("home/room{index}/{device}");
        let registry = load(json!([device])).unwrap();
        let topics: Vec<_> = registry.iter().map(|p| p.topic.as_str()).collect();
        assert_eq!(
            topics,
            vec![
                "home/room1/thermostat-1",
                "home/room2/thermostat-2",
                "home/room3/thermostat-3"
            ]
        );
    }

    #[test]
    fn test_unbound_template_variable() {
        let mut device = thermostat();
        device["topic"] = json!("home/{room}/state");
        let err = load(json!([device])).unwrap_err();
        assert!(matches!(&err, ConfigError::OutOfDomain { path, reason }
            if path == "devices[0].topic" && reason.contains("{room}")));

        let mut device = thermostat();
        device["topic"] = json!("home/{index}/state");
        assert!(load(json!([device])).is_err());

        let mut device = thermostat();
        device["topic"] = json!("home/{device/state");
        assert!(load(json!([device])).is_err());
    }

    #[test]
    fn test_duplicate_name_and_topic() {
        let err = load(json!([thermostat(), thermostat()])).unwrap_err();
        assert_eq!(
            err,
            ConfigError::DuplicateDevice {
                name: "thermostat".into()
            }
        );

        let mut other = thermostat();
        other["name"] = json!("boiler");
        other["topic"] = json!("home/thermostat/state");
        let err = load(json!([thermostat(), other])).unwrap_err();
        assert_eq!(
            err,
            ConfigError::DuplicateTopic {
                topic: "home/thermostat/state".into(),
                first: "thermostat".into(),
                second: "boiler".into()
            }
        );
    }

    #[test]
    fn test_invalid_generator_is_atomic_and_located() {
        let mut bad = thermostat();
        bad["name"] = json!("broken");
        bad["topic"] = json!("home/broken");
        bad["fields"][0] = json!({"name": "t", "type": "range", "min": 10, "max": 1});
        let err = load(json!([thermostat(), bad])).unwrap_err();
        assert!(matches!(&err, ConfigError::OutOfDomain { path, .. } if path == "devices[1].fields[0]"));
    }

    #[test]
    fn test_field_errors() {
        let cases = [
            (json!({"name": "device", "type": "bool", "probability": 0.5}), "devices[0].fields[0].name"),
            (json!({"name": "x", "type": "sine"}), "devices[0].fields[0].type"),
            (json!({"name": "x", "type": "range", "min": 1}), "devices[0].fields[0].max"),
            (json!({"name": "x", "type": "range", "min": "1", "max": 2}), "devices[0].fields[0].min"),
            (json!({"name": "x", "type": "gaussian", "mean": 1, "stddev": 1, "min": 0}), "devices[0].fields[0].max"),
            (json!({"name": "x", "type": "bool", "probability": 0.5, "decimals": 2}), "devices[0].fields[0].decimals"),
            (json!({"name": "site", "type": "bool", "probability": 0.5}), "devices[0].fields[0]"),
            (json!({"name": "x", "type": "bool", "probabilty": 0.5}), "devices[0].fields[0].probabilty"),
            (json!({"name": "x", "type": "range", "min": 0, "max": 1, "output": "hex"}), "devices[0].fields[0].output"),
            (json!({"name": "x", "type": "cycle", "values": "abc"}), "devices[0].fields[0].values"),
            (json!({"name": "x", "type": "bool", "probability": 0.5, "repeat": false}), "devices[0].fields[0].repeat"),
        ];
        for (field, expected_path) in cases {
            let mut device = thermostat();
            device["fields"] = json!([field]);
            let err = load(json!([device])).unwrap_err();
            let path = match &err {
                ConfigError::MissingField { path }
                | ConfigError::TypeMismatch { path, .. }
                | ConfigError::OutOfDomain { path, .. } => path.clone(),
                other => panic!("unexpected error {other:?}"),
            };
            assert_eq!(path, expected_path, "for {field}");
        }
    }

    #[test]
    fn test_cycle_without_repeat_is_one_shot() {
        let mut device = thermostat();
        device["fields"][2]["repeat"] = json!(false);
        let registry = load(json!([device])).unwrap();
        let mode = &registry.get("thermostat").unwrap().fields[2];
        assert_eq!(
            mode.generator.kind(),
            &GeneratorKind::Sequence {
                values: vec![json!("eco"), json!("comfort")]
            }
        );
        assert_eq!(mode.generator.output(), OutputType::Literal);

        let mut device = thermostat();
        device["fields"][2]["repeat"] = json!(true);
        let registry = load(json!([device])).unwrap();
        assert!(matches!(
            registry.get("thermostat").unwrap().fields[2].generator.kind(),
            GeneratorKind::Cycle { .. }
        ));
    }

    #[test]
    fn test_device_errors() {
        let mut device = thermostat();
        device["interval"] = json!(0);
        assert!(matches!(load(json!([device])).unwrap_err(),
            ConfigError::OutOfDomain { path, .. } if path == "devices[0].interval"));

        let mut device = thermostat();
        device["topic"] = json!("home/+/state");
        assert!(load(json!([device])).is_err());

        let mut device = thermostat();
        device["qos"] = json!(2);
        assert!(load(json!([device])).is_err());

        let mut device = thermostat();
        device["fields"] = json!([]);
        assert!(load(json!([device])).is_err());

        let mut device = thermostat();
        device["replicas"] = json!({"start": 5, "end": 1});
        assert!(load(json!([device])).is_err());

        assert!(load(json!([])).is_err());
        assert!(matches!(
            load(json!({})).unwrap_err(),
            ConfigError::TypeMismatch { path, expected: "an array" } if path == "devices"
        ));
    }

    #[test]
    fn test_interval_sample_bounds() {
        let interval = IntervalSpec::new(Duration::from_millis(100), Duration::from_millis(30));
        let (low, high) = interval.bounds();
        assert_eq!(low, Duration::from_millis(70));
        assert_eq!(high, Duration::from_millis(130));

        let mut rng = StdRng::seed_from_u64(3);
        for _ in 0..200 {
            let d = interval.sample(&mut rng);
            assert!(d >= low && d <= high, "{d:?}");
        }

        let wide = IntervalSpec::new(Duration::from_millis(5), Duration::from_millis(50));
        for _ in 0..200 {
            assert!(wide.sample(&mut rng) >= MIN_INTERVAL);
        }
    }

    #[test]
    fn test_topic_template() {
        let template = TopicTemplate::new("site/{index}/{device}/up");
        assert_eq!(
            template.resolve("pump-7", Some(7)).unwrap(),
            "site/7/pump-7/up"
        );
        assert!(template.resolve("pump", None).is_err());
        assert!(TopicTemplate::new("a}b").resolve("d", None).is_err());
        assert_eq!(TopicTemplate::new("plain/topic").resolve("d", None).unwrap(), "plain/topic");
    }
}
