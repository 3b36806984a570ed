//! Shared, GUI-writable shader parameters.
//!
//! Writers replace whole values under a single write lock; readers take a
//! snapshot by cloning an `Arc` to the current map. A snapshot is never
//! mutated afterwards, so a frame sees one consistent view of every parameter
//! no matter how many `set` calls race with it.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Instant;

use crate::error::ParameterError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ParamType {
    Float,
    Int,
    Uint,
    Vec2,
    Vec3,
    Vec4,
    Color,
    Mat4,
}

impl fmt::Display for ParamType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ParamType::Float => "float",
            ParamType::Int => "int",
            ParamType::Uint => "uint",
            ParamType::Vec2 => "vec2",
            ParamType::Vec3 => "vec3",
            ParamType::Vec4 => "vec4",
            ParamType::Color => "color",
            ParamType::Mat4 => "mat4",
        };
        f.write_str(name)
    }
}

impl ParamType {
    pub fn arity(self) -> usize {
        match self {
            ParamType::Float | ParamType::Int | ParamType::Uint => 1,
            ParamType::Vec2 => 2,
            ParamType::Vec3 => 3,
            ParamType::Vec4 | ParamType::Color => 4,
            ParamType::Mat4 => 16,
        }
    }
}

/// Typed parameter value. Vectors are replaced as a unit, never per component.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ParamValue {
    Float(f32),
    Int(i32),
    Uint(u32),
    Vec2([f32; 2]),
    Vec3([f32; 3]),
    Vec4([f32; 4]),
    /// Linear RGBA.
    Color([f32; 4]),
    /// Column-major.
    Mat4([[f32; 4]; 4]),
}

impl ParamValue {
    pub fn kind(&self) -> ParamType {
        match self {
            ParamValue::Float(_) => ParamType::Float,
            ParamValue::Int(_) => ParamType::Int,
            ParamValue::Uint(_) => ParamType::Uint,
            ParamValue::Vec2(_) => ParamType::Vec2,
            ParamValue::Vec3(_) => ParamType::Vec3,
            ParamValue::Vec4(_) => ParamType::Vec4,
            ParamValue::Color(_) => ParamType::Color,
            ParamValue::Mat4(_) => ParamType::Mat4,
        }
    }

    /// Components widened to `f64`, in memory order.
    pub fn components(&self) -> Vec<f64> {
        match self {
            ParamValue::Float(v) => vec![f64::from(*v)],
            ParamValue::Int(v) => vec![f64::from(*v)],
            ParamValue::Uint(v) => vec![f64::from(*v)],
            ParamValue::Vec2(v) => v.iter().map(|c| f64::from(*c)).collect(),
            ParamValue::Vec3(v) => v.iter().map(|c| f64::from(*c)).collect(),
            ParamValue::Vec4(v) | ParamValue::Color(v) => v.iter().map(|c| f64::from(*c)).collect(),
            ParamValue::Mat4(m) => m.iter().flatten().map(|c| f64::from(*c)).collect(),
        }
    }

    /// Builds a value of `kind` from raw components.
    pub fn from_components(kind: ParamType, values: &[f64]) -> Option<Self> {
        if values.len() != kind.arity() {
            return None;
        }
        let f = |index: usize| values[index] as f32;
        let value = match kind {
            ParamType::Float => ParamValue::Float(f(0)),
            ParamType::Int => {
                let v = values[0];
                if v.fract() != 0.0 || v < f64::from(i32::MIN) || v > f64::from(i32::MAX) {
                    return None;
                }
                ParamValue::Int(v as i32)
            }
            ParamType::Uint => {
                let v = values[0];
                if v.fract() != 0.0 || v < 0.0 || v > f64::from(u32::MAX) {
                    return None;
                }
                ParamValue::Uint(v as u32)
            }
            ParamType::Vec2 => ParamValue::Vec2([f(0), f(1)]),
            ParamType::Vec3 => ParamValue::Vec3([f(0), f(1), f(2)]),
            ParamType::Vec4 => ParamValue::Vec4([f(0), f(1), f(2), f(3)]),
            ParamType::Color => ParamValue::Color([f(0), f(1), f(2), f(3)]),
            ParamType::Mat4 => {
                let mut m = [[0.0f32; 4]; 4];
                for (index, value) in values.iter().enumerate() {
                    m[index / 4][index % 4] = *value as f32;
                }
                ParamValue::Mat4(m)
            }
        };
        Some(value)
    }

    /// Parses comma-separated components, e.g. `0.5` or `1,0,0,1`.
    pub fn parse(kind: ParamType, input: &str) -> Result<Self, ParameterError> {
        let error = || ParameterError::Parse {
            input: input.to_string(),
            expected: kind,
        };
        let values = input
            .split(',')
            .map(|part| part.trim().parse::<f64>())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|_| error())?;
        Self::from_components(kind, &values).ok_or_else(error)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Parameter {
    pub value: ParamValue,
    pub written_at: Instant,
    /// Store-wide write counter at the time of this write.
    pub revision: u64,
}

type ParamMap = BTreeMap<String, Parameter>;

/// Thread-safe name → value table shared between the GUI and the renderer.
#[derive(Debug, Clone, Default)]
pub struct ParameterStore {
    current: Arc<RwLock<Arc<ParamMap>>>,
    revision: Arc<AtomicU64>,
}

impl ParameterStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Writes `value`, rejecting a type change for an existing name.
    pub fn set(&self, name: &str, value: ParamValue) -> Result<(), ParameterError> {
        if name.trim().is_empty() {
            return Err(ParameterError::EmptyName);
        }
        let mut guard = self
            .current
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(existing) = guard.get(name) {
            let expected = existing.value.kind();
            if expected != value.kind() {
                return Err(ParameterError::TypeMismatch {
                    name: name.to_string(),
                    expected,
                    found: value.kind(),
                });
            }
        }
        let revision = self.revision.fetch_add(1, Ordering::Relaxed) + 1;
        Arc::make_mut(&mut guard).insert(
            name.to_string(),
            Parameter {
                value,
                written_at: Instant::now(),
                revision,
            },
        );
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<ParamValue> {
        self.read().get(name).map(|parameter| parameter.value)
    }

    pub fn kind_of(&self, name: &str) -> Option<ParamType> {
        self.get(name).map(|value| value.kind())
    }

    /// Immutable view of every parameter as of this call.
    pub fn snapshot(&self) -> ParamSnapshot {
        ParamSnapshot {
            entries: self.read(),
        }
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    fn read(&self) -> Arc<ParamMap> {
        Arc::clone(&self.current.read().unwrap_or_else(PoisonError::into_inner))
    }
}

#[derive(Debug, Clone, Default)]
pub struct ParamSnapshot {
    entries: Arc<ParamMap>,
}

impl ParamSnapshot {
    pub fn get(&self, name: &str) -> Option<ParamValue> {
        self.entries.get(name).map(|parameter| parameter.value)
    }

    pub fn parameter(&self, name: &str) -> Option<&Parameter> {
        self.entries.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Parameter)> {
        self.entries
            .iter()
            .map(|(name, parameter)| (name.as_str(), parameter))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Layered lookup used while encoding one dispatch: step overrides first,
/// then the frame snapshot, then the frame builtins.
#[derive(Debug, Clone, Copy)]
pub struct ParamView<'a> {
    pub overrides: &'a [(String, ParamValue)],
    pub snapshot: &'a ParamSnapshot,
    pub builtins: &'a [(&'static str, ParamValue)],
}

impl<'a> ParamView<'a> {
    pub fn get(&self, name: &str) -> Option<ParamValue> {
        self.overrides
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| *value)
            .or_else(|| self.snapshot.get(name))
            .or_else(|| {
                self.builtins
                    .iter()
                    .find(|(key, _)| *key == name)
                    .map(|(_, value)| *value)
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::prelude::*;
    use std::collections::HashSet;
    use std::thread;

    #[test]
    fn snapshot_is_isolated_from_later_writes() {
        let store = ParameterStore::new();
        store.set("Decay", ParamValue::Float(0.5)).unwrap();
        let snapshot = store.snapshot();
        store.set("Decay", ParamValue::Float(0.9)).unwrap();
        assert_eq!(snapshot.get("Decay"), Some(ParamValue::Float(0.5)));
        assert_eq!(store.get("Decay"), Some(ParamValue::Float(0.9)));
    }

    #[test]
    fn rejects_type_change() {
        let store = ParameterStore::new();
        store.set("Tint", ParamValue::Vec3([1.0, 0.0, 0.0])).unwrap();
        let err = store.set("Tint", ParamValue::Float(1.0)).unwrap_err();
        assert_eq!(
            err,
            ParameterError::TypeMismatch {
                name: "Tint".into(),
                expected: ParamType::Vec3,
                found: ParamType::Float,
            }
        );
    }

    #[test]
    fn revisions_increase() {
        let store = ParameterStore::new();
        store.set("A", ParamValue::Uint(1)).unwrap();
        store.set("B", ParamValue::Uint(2)).unwrap();
        let snapshot = store.snapshot();
        let a = snapshot.parameter("A").unwrap();
        let b = snapshot.parameter("B").unwrap();
        assert!(b.revision > a.revision);
        assert!(b.written_at >= a.written_at);
    }

    #[test]
    fn parses_components() {
        assert_eq!(
            ParamValue::parse(ParamType::Color, "1, 0.5, 0, 1").unwrap(),
            ParamValue::Color([1.0, 0.5, 0.0, 1.0])
        );
        assert_eq!(
            ParamValue::parse(ParamType::Uint, "3").unwrap(),
            ParamValue::Uint(3)
        );
        assert!(ParamValue::parse(ParamType::Uint, "-3").is_err());
        assert!(ParamValue::parse(ParamType::Vec2, "1").is_err());
        assert!(ParamValue::parse(ParamType::Float, "abc").is_err());
    }

    #[test]
    fn view_prefers_overrides_then_snapshot_then_builtins() {
        let store = ParameterStore::new();
        store.set("Time", ParamValue::Float(99.0)).unwrap();
        store.set("Stage", ParamValue::Uint(7)).unwrap();
        let snapshot = store.snapshot();
        let overrides = vec![("Stage".to_string(), ParamValue::Uint(1))];
        let builtins = [
            ("Time", ParamValue::Float(1.5)),
            ("Frame", ParamValue::Uint(3)),
        ];
        let view = ParamView {
            overrides: &overrides,
            snapshot: &snapshot,
            builtins: &builtins,
        };
        assert_eq!(view.get("Stage"), Some(ParamValue::Uint(1)));
        assert_eq!(view.get("Time"), Some(ParamValue::Float(99.0)));
        assert_eq!(view.get("Frame"), Some(ParamValue::Uint(3)));
        assert_eq!(view.get("Missing"), None);
    }

    #[test]
    fn concurrent_snapshots_never_observe_torn_vectors() {
        let store = ParameterStore::new();
        store.set("Color", ParamValue::Vec4([0.0; 4])).unwrap();

        let writers: Vec<_> = (0..4u64)
            .map(|seed| {
                let store = store.clone();
                thread::spawn(move || {
                    let mut rng = StdRng::seed_from_u64(seed);
                    let mut written = Vec::new();
                    for _ in 0..2_000 {
                        // Every component equal, so a torn write would show mixed values.
                        let v = rng.gen_range(0..1_000) as f32;
                        store.set("Color", ParamValue::Vec4([v; 4])).unwrap();
                        written.push(v);
                        if rng.gen_bool(0.1) {
                            thread::yield_now();
                        }
                    }
                    written
                })
            })
            .collect();

        let reader = {
            let store = store.clone();
            thread::spawn(move || {
                let mut seen = Vec::new();
                for _ in 0..5_000 {
                    let snapshot = store.snapshot();
                    match snapshot.get("Color") {
                        Some(ParamValue::Vec4(v)) => seen.push(v),
                        other => panic!("unexpected value {other:?}"),
                    }
                }
                seen
            })
        };

        let mut written: HashSet<u32> = HashSet::from([0.0f32.to_bits()]);
        for writer in writers {
            written.extend(writer.join().unwrap().into_iter().map(f32::to_bits));
        }
        for value in reader.join().unwrap() {
            assert!(value.iter().all(|c| *c == value[0]), "torn read {value:?}");
            assert!(written.contains(&value[0].to_bits()));
        }
    }
}
