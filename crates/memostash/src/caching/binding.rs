//! Canonical argument snapshots and binding of calls to producer parameters.

use std::collections::BTreeMap;
use std::io::{self, Write};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{CacheError, ProducerIdentity};

/// The canonical arguments of a single call.
///
/// Arguments are stored by parameter name, in a structural representation obtained through
/// [`serde`]. Objects are stored with sorted keys, so the snapshot does not depend on the
/// iteration order of maps passed as arguments.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ArgumentSnapshot(BTreeMap<String, Value>);

impl ArgumentSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records the canonical form of `value` for the parameter `name`.
    ///
    /// Replaces a previously recorded value.
    pub fn insert<T>(&mut self, name: &str, value: &T) -> Result<(), CacheError>
    where
        T: Serialize + ?Sized,
    {
        validate_name(name)?;
        let value = canonical_value(value).map_err(|reason| CacheError::UnrepresentableArgument {
            name: name.to_owned(),
            reason,
        })?;
        self.0.insert(name.to_owned(), value);
        Ok(())
    }

    /// Builder-style version of [`insert`](Self::insert).
    pub fn with<T>(mut self, name: &str, value: &T) -> Result<Self, CacheError>
    where
        T: Serialize + ?Sized,
    {
        self.insert(name, value)?;
        Ok(self)
    }

    /// Deserializes the argument `name` into a `T`.
    pub fn get<T: DeserializeOwned>(&self, name: &str) -> Result<T, CacheError> {
        let value = self
            .value(name)
            .ok_or_else(|| CacheError::InvalidCall(format!("missing argument `{name}`")))?;
        T::deserialize(value).map_err(|e| CacheError::InvalidCall(format!("argument `{name}`: {e}")))
    }

    pub fn value(&self, name: &str) -> Option<&Value> {
        self.0.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.contains_key(name)
    }

    /// Iterates over all arguments, sorted by name.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.0.iter().map(|(name, value)| (name.as_str(), value))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Renders the snapshot as a single-line JSON object.
    pub fn render_compact(&self) -> String {
        serde_json::to_string(&self.0).unwrap_or_default()
    }

    /// Like [`render_compact`](Self::render_compact), but cut off after a fixed length.
    pub(crate) fn render_bounded(&self) -> String {
        let mut out = BoundedRender::default();
        // errors only signal that the limit was reached
        let _ = serde_json::to_writer(&mut out, &self.0);
        out.finish()
    }
}

fn validate_name(name: &str) -> Result<(), CacheError> {
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_alphanumeric() || c == '_' || c == '-' || c == '.');
    if valid {
        Ok(())
    } else {
        Err(CacheError::InvalidCall(format!(
            "`{}` is not a valid parameter name",
            name.escape_debug()
        )))
    }
}

/// Converts `value` into its canonical structural form.
///
/// `serde_json` silently turns non-finite floats into `null`, which would make distinct
/// arguments collide. The YAML data model keeps them, so it is used to reject them first.
fn canonical_value<T>(value: &T) -> Result<Value, String>
where
    T: Serialize + ?Sized,
{
    let shape = serde_yaml::to_value(value).map_err(|e| e.to_string())?;
    if has_non_finite_float(&shape) {
        return Err("non-finite floats cannot be represented".into());
    }

    let value = serde_json::to_value(value).map_err(|e| e.to_string())?;
    Ok(sort_objects(value))
}

fn has_non_finite_float(value: &serde_yaml::Value) -> bool {
    match value {
        serde_yaml::Value::Number(n) => n.is_nan() || n.is_infinite(),
        serde_yaml::Value::Sequence(seq) => seq.iter().any(has_non_finite_float),
        serde_yaml::Value::Mapping(map) => map
            .iter()
            .any(|(k, v)| has_non_finite_float(k) || has_non_finite_float(v)),
        serde_yaml::Value::Tagged(tagged) => has_non_finite_float(&tagged.value),
        _ => false,
    }
}

/// Rebuilds all objects with sorted keys, independent of how `serde_json` orders its maps.
fn sort_objects(value: Value) -> Value {
    match value {
        Value::Array(items) => Value::Array(items.into_iter().map(sort_objects).collect()),
        Value::Object(map) => {
            let sorted: BTreeMap<String, Value> = map
                .into_iter()
                .map(|(k, v)| (k, sort_objects(v)))
                .collect();
            Value::Object(sorted.into_iter().collect())
        }
        other => other,
    }
}

#[derive(Debug, Clone)]
struct Parameter {
    name: String,
    default: Option<Value>,
}

/// A producer identity together with the formal parameters it accepts.
///
/// The parameters are used to bind positional and keyword arguments of a [`CallArgs`] into a
/// canonical [`ArgumentSnapshot`], so that `f(1)` and `f(x = 1)` share one cache entry.
#[derive(Debug, Clone)]
pub struct Producer {
    identity: ProducerIdentity,
    params: Vec<Parameter>,
}

impl Producer {
    pub fn new(identity: ProducerIdentity) -> Self {
        Self {
            identity,
            params: Vec::new(),
        }
    }

    /// Declares the next required parameter.
    pub fn param(mut self, name: impl Into<String>) -> Self {
        self.params.push(Parameter {
            name: name.into(),
            default: None,
        });
        self
    }

    /// Declares the next parameter, which takes `default` when it is not passed.
    pub fn param_with_default<T>(mut self, name: impl Into<String>, default: &T) -> Result<Self, CacheError>
    where
        T: Serialize + ?Sized,
    {
        let name = name.into();
        let default =
            canonical_value(default).map_err(|reason| CacheError::UnrepresentableArgument {
                name: name.clone(),
                reason,
            })?;
        self.params.push(Parameter {
            name,
            default: Some(default),
        });
        Ok(self)
    }

    pub fn identity(&self) -> &ProducerIdentity {
        &self.identity
    }

    /// Binds `call` to the declared parameters.
    ///
    /// Positional arguments fill the parameters in declaration order, keyword arguments are
    /// matched by name, and unbound parameters fall back to their defaults.
    pub fn bind(&self, call: CallArgs) -> Result<ArgumentSnapshot, CacheError> {
        self.check(&call)?;
        Ok(self.bind_checked(call))
    }

    /// Validates `call` against the declared parameters, leaving it intact for error reporting.
    pub(crate) fn check(&self, call: &CallArgs) -> Result<(), CacheError> {
        for (i, param) in self.params.iter().enumerate() {
            validate_name(&param.name)?;
            if self.params[..i].iter().any(|p| p.name == param.name) {
                return Err(CacheError::InvalidCall(format!(
                    "`{}` declares parameter `{}` twice",
                    self.identity, param.name
                )));
            }
        }

        if call.positional.len() > self.params.len() {
            return Err(CacheError::InvalidCall(format!(
                "`{}` takes {} positional arguments but {} were given",
                self.identity,
                self.params.len(),
                call.positional.len()
            )));
        }

        for (param, value) in self.params.iter().zip(&call.positional) {
            if let Err(reason) = value {
                return Err(CacheError::UnrepresentableArgument {
                    name: param.name.clone(),
                    reason: reason.clone(),
                });
            }
        }

        let (by_position, rest) = self.params.split_at(call.positional.len());
        for (i, (name, value)) in call.keyword.iter().enumerate() {
            if !self.params.iter().any(|p| &p.name == name) {
                return Err(CacheError::InvalidCall(format!(
                    "`{}` got an unexpected keyword argument `{name}`",
                    self.identity
                )));
            }
            let bound_before = by_position.iter().any(|p| &p.name == name)
                || call.keyword[..i].iter().any(|(other, _)| other == name);
            if bound_before {
                return Err(CacheError::InvalidCall(format!(
                    "`{}` got multiple values for argument `{name}`",
                    self.identity
                )));
            }
            if let Err(reason) = value {
                return Err(CacheError::UnrepresentableArgument {
                    name: name.clone(),
                    reason: reason.clone(),
                });
            }
        }

        for param in rest {
            let passed = call.keyword.iter().any(|(name, _)| name == &param.name);
            if !passed && param.default.is_none() {
                return Err(CacheError::InvalidCall(format!(
                    "`{}` is missing the required argument `{}`",
                    self.identity, param.name
                )));
            }
        }

        Ok(())
    }

    /// Builds the snapshot of a call that passed [`check`](Self::check).
    pub(crate) fn bind_checked(&self, call: CallArgs) -> ArgumentSnapshot {
        let names = self.params.iter().map(|param| param.name.clone());
        let passed = names.zip(call.positional).chain(call.keyword);

        let mut snapshot = BTreeMap::new();
        for (name, value) in passed {
            if let Ok(value) = value {
                snapshot.insert(name, value);
            }
        }
        for param in &self.params {
            if let Some(default) = &param.default {
                snapshot
                    .entry(param.name.clone())
                    .or_insert_with(|| default.clone());
            }
        }

        ArgumentSnapshot(snapshot)
    }
}

/// The positional and keyword arguments of one call, before binding.
///
/// Values are converted to their canonical form right away; conversion errors are reported by
/// [`Producer::bind`], once the parameter they belong to is known.
#[derive(Debug, Clone, Default)]
pub struct CallArgs {
    positional: Vec<Result<Value, String>>,
    keyword: Vec<(String, Result<Value, String>)>,
}

impl CallArgs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a positional argument.
    pub fn arg<T>(mut self, value: &T) -> Self
    where
        T: Serialize + ?Sized,
    {
        self.positional.push(canonical_value(value));
        self
    }

    /// Appends a keyword argument.
    pub fn kwarg<T>(mut self, name: impl Into<String>, value: &T) -> Self
    where
        T: Serialize + ?Sized,
    {
        self.keyword.push((name.into(), canonical_value(value)));
        self
    }

    /// Renders the unbound arguments for error messages, cut off after a fixed length.
    pub(crate) fn render(&self) -> String {
        let mut out = BoundedRender::default();
        // errors only signal that the limit was reached
        let _ = self.write_rendered(&mut out);
        out.finish()
    }

    fn write_rendered(&self, out: &mut BoundedRender) -> io::Result<()> {
        let positional = self.positional.iter().map(|value| (None, value));
        let keyword = self
            .keyword
            .iter()
            .map(|(name, value)| (Some(name), value));

        out.write_all(b"(")?;
        for (i, (name, value)) in positional.chain(keyword).enumerate() {
            if i > 0 {
                out.write_all(b", ")?;
            }
            if let Some(name) = name {
                write!(out, "{name}=")?;
            }
            match value {
                Ok(value) => serde_json::to_writer(&mut *out, value)?,
                Err(_) => out.write_all(b"<unrepresentable>")?,
            }
        }
        out.write_all(b")")
    }
}

/// The number of bytes of arguments rendered into error messages.
const MAX_RENDERED_LEN: usize = 1024;

/// A writer that keeps the first [`MAX_RENDERED_LEN`] bytes and rejects anything beyond.
#[derive(Debug, Default)]
struct BoundedRender {
    buf: Vec<u8>,
    truncated: bool,
}

impl BoundedRender {
    fn finish(self) -> String {
        // the cut may have split a character
        let valid_len = match std::str::from_utf8(&self.buf) {
            Ok(_) => self.buf.len(),
            Err(e) => e.valid_up_to(),
        };
        let mut rendered = String::from_utf8_lossy(&self.buf[..valid_len]).into_owned();
        if self.truncated {
            rendered.push_str("...");
        }
        rendered
    }
}

impl io::Write for BoundedRender {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        let room = MAX_RENDERED_LEN.saturating_sub(self.buf.len());
        if room == 0 && !data.is_empty() {
            self.truncated = true;
            return Err(io::Error::new(
                io::ErrorKind::WriteZero,
                "rendering limit reached",
            ));
        }
        let len = data.len().min(room);
        self.buf.extend_from_slice(&data[..len]);
        Ok(len)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
