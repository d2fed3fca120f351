//! Encoding of structured game-state snapshots into network input vectors.
//!
//! A snapshot is a nested JSON document. It is flattened into dotted paths
//! (`PlayerParty.0.Stats.HP`), every path is classified by the first matching rule of the
//! [`EncodingSchema`], and the per-path features are concatenated into one vector.
//! Paths matching no rule are dropped.
//!
//! # Canonical order
//!
//! Object keys are visited in lexical order at every nesting level and array elements in
//! index order, whatever order the worker serialized them in. The layout of the vector is
//! therefore a function of the schema and of the snapshot's key set only.
//!
//! # Versioning
//!
//! The networks being trained depend on the exact layout. Any change to the rules, widths or
//! normalization constants must bump [`SCHEMA_VERSION`] and restart training.

use std::sync::OnceLock;

use regex::Regex;
use serde_json::Value;

use crate::error::EvalError;

pub const SCHEMA_VERSION: u32 = 1;

/// Decimal digits kept by normalized features.
pub const ROUND_DIGITS: i32 = 16;

pub const STAT_MAX: f64 = 255.0;
pub const BOOST_MAX: f64 = 12.0;
pub const HP_MAX: f64 = 315.0;
pub const PP_MAX: f64 = 40.0;

/// Identifier catalogs: (number of values, bits needed).
pub const ABILITIES: (u32, u32) = (123, 7);
pub const MOVES: (u32, u32) = (467, 9);
pub const POKEMON: (u32, u32) = (493, 9);
pub const ITEMS: (u32, u32) = (327, 9);
pub const GAME_STATE: (u32, u32) = (3, 2);

/// Bits of the status and confusion bitmasks.
pub const STATUS_BITS: u32 = 8;

/// How one scalar is turned into features.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FeatureKind {
    /// The value itself, booleans as 0/1.
    PassThrough,
    /// Fixed-width binary digits, most significant first.
    Binary { bits: u32 },
    /// `value / max`, rounded to [`ROUND_DIGITS`].
    Normalized { max: f64 },
    /// 1 if the counter is positive, 0 otherwise.
    Available,
}

impl FeatureKind {
    /// Number of features produced for one value.
    pub fn width(&self) -> usize {
        match self {
            FeatureKind::Binary { bits } => *bits as usize,
            FeatureKind::PassThrough | FeatureKind::Normalized { .. } | FeatureKind::Available => 1,
        }
    }

    fn encode(&self, path: &str, value: &Value, out: &mut Vec<f64>) -> Result<(), EvalError> {
        match self {
            FeatureKind::PassThrough => out.push(number(path, value)?),
            FeatureKind::Binary { bits } => {
                let n = unsigned(path, value)?;
                if *bits < 64 && n >> *bits != 0 {
                    return Err(EvalError::protocol(format!(
                        "{path}: {n} does not fit in {bits} bits"
                    )));
                }
                out.extend((0..*bits).rev().map(|bit| ((n >> bit) & 1) as f64));
            }
            FeatureKind::Normalized { max } => {
                out.push(round_to(number(path, value)? / max, ROUND_DIGITS))
            }
            FeatureKind::Available => out.push(if number(path, value)? > 0.0 { 1.0 } else { 0.0 }),
        }
        Ok(())
    }
}

#[derive(Debug)]
struct Rule {
    pattern: Regex,
    kind: FeatureKind,
}

/// Ordered path-pattern → feature-kind table.
#[derive(Debug)]
pub struct EncodingSchema {
    version: u32,
    rules: Vec<Rule>,
}

impl EncodingSchema {
    /// Build a schema from `(pattern, kind)` rules, tried in order.
    ///
    /// Patterns must match the whole dotted path.
    pub fn new(version: u32, rules: &[(&str, FeatureKind)]) -> Result<Self, regex::Error> {
        let rules = rules
            .iter()
            .map(|(pattern, kind)| {
                Ok(Rule {
                    pattern: Regex::new(&format!("^(?:{pattern})$"))?,
                    kind: *kind,
                })
            })
            .collect::<Result<Vec<_>, regex::Error>>()?;
        Ok(Self { version, rules })
    }

    /// The battle factory schema the current networks are trained on.
    pub fn v1() -> &'static EncodingSchema {
        static SCHEMA: OnceLock<EncodingSchema> = OnceLock::new();
        SCHEMA.get_or_init(|| {
            EncodingSchema::new(
                SCHEMA_VERSION,
                &[
                    (r"\w*Party\.\d\.Active", FeatureKind::PassThrough),
                    (r"\w*Party\.\d\.ID", FeatureKind::Binary { bits: POKEMON.1 }),
                    (r"\w*Party\.\d\.Moves\.\d\.PP", FeatureKind::Available),
                    (
                        r"\w*Party\.\d\.Stats\.\w*_Boost",
                        FeatureKind::Normalized { max: BOOST_MAX },
                    ),
                    (
                        r"\w*Party\.\d\.Stats\.(?:Status|Confused)",
                        FeatureKind::Binary { bits: STATUS_BITS },
                    ),
                    (
                        r"\w*Party\.\d\.Stats\.HP",
                        FeatureKind::Normalized { max: HP_MAX },
                    ),
                    (
                        r"\w*Party\.\d\.Stats\.(?:ATK|DEF|SPA|SPD|SPE|EVA|ACC)",
                        FeatureKind::Normalized { max: STAT_MAX },
                    ),
                    ("State", FeatureKind::Binary { bits: GAME_STATE.1 }),
                ],
            )
            .expect("schema v1 patterns are valid")
        })
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    /// Kind of the feature encoded for `path`, `None` if the path is dropped.
    pub fn classify(&self, path: &str) -> Option<FeatureKind> {
        self.rules
            .iter()
            .find(|rule| rule.pattern.is_match(path))
            .map(|rule| rule.kind)
    }

    /// Vector length for a snapshot holding exactly `paths`.
    pub fn vector_len<'a>(&self, paths: impl IntoIterator<Item = &'a str>) -> usize {
        paths
            .into_iter()
            .filter_map(|path| self.classify(path))
            .map(|kind| kind.width())
            .sum()
    }

    /// Encode a parsed snapshot.
    ///
    /// # Errors
    /// [`EvalError::Protocol`] when a matched value has the wrong type or does not fit its
    /// binary width.
    pub fn vectorize(&self, snapshot: &Value) -> Result<Vec<f64>, EvalError> {
        let mut out = Vec::new();
        for (path, value) in flatten(snapshot) {
            if let Some(kind) = self.classify(&path) {
                kind.encode(&path, value, &mut out)?;
            }
        }
        Ok(out)
    }

    /// Parse a JSON snapshot and encode it.
    pub fn vectorize_json(&self, raw: &[u8]) -> Result<Vec<f64>, EvalError> {
        let snapshot: Value = serde_json::from_slice(raw)
            .map_err(|err| EvalError::protocol(format!("invalid state snapshot: {err}")))?;
        self.vectorize(&snapshot)
    }
}

/// Dotted path → scalar pairs in canonical order.
pub fn flatten(snapshot: &Value) -> Vec<(String, &Value)> {
    let mut out = Vec::new();
    // explicit stack, children pushed in reverse so they pop in order
    let mut stack: Vec<(String, &Value)> = vec![(String::new(), snapshot)];
    while let Some((path, value)) = stack.pop() {
        match value {
            Value::Object(map) => {
                let mut keys: Vec<&String> = map.keys().collect();
                keys.sort();
                for key in keys.into_iter().rev() {
                    stack.push((join(&path, key), &map[key.as_str()]));
                }
            }
            Value::Array(items) => {
                for (i, item) in items.iter().enumerate().rev() {
                    stack.push((join(&path, &i.to_string()), item));
                }
            }
            scalar => out.push((path, scalar)),
        }
    }
    out
}

/// Reply sent for a state request: `{ v0, v1, … }` with 32 decimals.
pub fn render_vector(values: &[f64]) -> String {
    let body = values
        .iter()
        .map(|v| format!("{v:.32}"))
        .collect::<Vec<_>>()
        .join(", ");
    format!("{{ {body} }}")
}

fn join(parent: &str, key: &str) -> String {
    if parent.is_empty() {
        key.to_owned()
    } else {
        format!("{parent}.{key}")
    }
}

fn round_to(x: f64, digits: i32) -> f64 {
    let scale = 10f64.powi(digits);
    (x * scale).round() / scale
}

fn number(path: &str, value: &Value) -> Result<f64, EvalError> {
    match value {
        Value::Bool(b) => Ok(if *b { 1.0 } else { 0.0 }),
        Value::Number(n) => n
            .as_f64()
            .ok_or_else(|| EvalError::protocol(format!("{path}: {n} is not representable"))),
        other => Err(EvalError::protocol(format!(
            "{path}: expected a number, got {other}"
        ))),
    }
}

fn unsigned(path: &str, value: &Value) -> Result<u64, EvalError> {
    if let Some(n) = value.as_u64() {
        return Ok(n);
    }
    let x = number(path, value)?;
    if x >= 0.0 && x.fract() == 0.0 && x < u64::MAX as f64 {
        Ok(x as u64)
    } else {
        Err(EvalError::protocol(format!(
            "{path}: expected a non-negative integer, got {x}"
        )))
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn snapshot(hp: u64, atk: u64) -> Value {
        json!({
            "State": 1,
            "PlayerParty": {
                "0": {
                    "Stats": {
                        "Status": 0,
                        "HP": hp,
                        "DEF": 40,
                        "Confused": 1,
                        "ATK_Boost": 6,
                        "ATK": atk
                    },
                    "Moves": {
                        "1": { "PP": 0, "ID": 1 },
                        "0": { "ID": 85, "PP": 15 }
                    },
                    "ID": 25,
                    "HeldItem": 3,
                    "Active": true
                }
            }
        })
    }

    #[test]
    fn flatten_sorts_keys_per_level() {
        let value = json!({"b": {"z": 1, "a": [true, 2]}, "a": null});
        let paths: Vec<String> = flatten(&value).into_iter().map(|(p, _)| p).collect();
        assert_eq!(paths, vec!["a", "b.a.0", "b.a.1", "b.z"]);
    }

    #[test]
    fn encodes_v1_layout() {
        let vector = EncodingSchema::v1().vectorize(&snapshot(315, 51)).unwrap();
        let mut expected = vec![1.0]; // Active
        expected.extend([0., 0., 0., 0., 1., 1., 0., 0., 1.]); // ID 25
        expected.extend([1.0, 0.0]); // Moves PP
        expected.push(0.2); // ATK 51/255
        expected.push(0.5); // ATK_Boost
        expected.extend([0., 0., 0., 0., 0., 0., 0., 1.]); // Confused
        expected.push(round_to(40.0 / 255.0, ROUND_DIGITS)); // DEF
        expected.push(1.0); // HP
        expected.extend([0.0; 8]); // Status
        expected.extend([0.0, 1.0]); // State
        assert_eq!(vector, expected);
    }

    #[test]
    fn deterministic_and_value_independent_length() {
        let schema = EncodingSchema::v1();
        let a = schema.vectorize(&snapshot(10, 20)).unwrap();
        let b = schema.vectorize(&snapshot(10, 20)).unwrap();
        let c = schema.vectorize(&snapshot(300, 255)).unwrap();
        assert_eq!(
            a.iter().map(|x| x.to_bits()).collect::<Vec<_>>(),
            b.iter().map(|x| x.to_bits()).collect::<Vec<_>>()
        );
        assert_eq!(a.len(), c.len());

        let value = snapshot(10, 20);
        let paths = flatten(&value);
        assert_eq!(schema.vector_len(paths.iter().map(|(p, _)| p.as_str())), a.len());
    }

    #[test]
    fn key_order_of_the_document_does_not_matter() {
        let schema = EncodingSchema::v1();
        let one = br#"{"State": 2, "EnemyParty": {"0": {"Active": 0, "ID": 3}}}"#;
        let two = br#"{"EnemyParty": {"0": {"ID": 3, "Active": 0}}, "State": 2}"#;
        assert_eq!(
            schema.vectorize_json(one).unwrap(),
            schema.vectorize_json(two).unwrap()
        );
    }

    #[test]
    fn normalization_boundaries() {
        let schema = EncodingSchema::v1();
        for (path, max) in [
            ("PlayerParty.0.Stats.SPA", STAT_MAX),
            ("PlayerParty.0.Stats.HP", HP_MAX),
            ("PlayerParty.0.Stats.SPE_Boost", BOOST_MAX),
        ] {
            let kind = schema.classify(path).unwrap();
            let mut out = vec![];
            kind.encode(path, &json!(max), &mut out).unwrap();
            kind.encode(path, &json!(0), &mut out).unwrap();
            assert_eq!(out, vec![1.0, 0.0], "{path}");
        }
    }

    #[test]
    fn unmatched_paths_are_dropped() {
        let schema = EncodingSchema::v1();
        assert_eq!(schema.classify("PlayerParty.0.HeldItem"), None);
        assert_eq!(schema.classify("PlayerParty.0.Moves.0.ID"), None);
        assert_eq!(schema.classify("Party.10.ID"), None);
        assert_eq!(schema.classify("States"), None);
        assert_eq!(
            schema.vectorize_json(br#"{"Weather": "rain"}"#).unwrap(),
            Vec::<f64>::new()
        );
    }

    #[test]
    fn status_is_a_bitmask() {
        assert_eq!(
            EncodingSchema::v1().classify("EnemyParty.2.Stats.Status"),
            Some(FeatureKind::Binary { bits: STATUS_BITS })
        );
    }

    #[test]
    fn out_of_range_values_are_rejected() {
        let schema = EncodingSchema::v1();
        assert!(matches!(
            schema.vectorize_json(br#"{"State": 4}"#),
            Err(EvalError::Protocol(_))
        ));
        assert!(matches!(
            schema.vectorize_json(br#"{"PlayerParty": {"0": {"ID": -1}}}"#),
            Err(EvalError::Protocol(_))
        ));
        assert!(matches!(
            schema.vectorize_json(br#"{"PlayerParty": {"0": {"Active": "yes"}}}"#),
            Err(EvalError::Protocol(_))
        ));
        assert!(matches!(
            schema.vectorize_json(b"not json"),
            Err(EvalError::Protocol(_))
        ));
    }

    #[test]
    fn render_uses_fixed_precision() {
        assert_eq!(
            render_vector(&[0.5, -1.0]),
            format!("{{ 0.5{z}, -1.0{z} }}", z = "0".repeat(31))
        );
        assert_eq!(render_vector(&[]), "{  }");
    }
}
