//! message — the typed value list passed between detectors, sources and the
//! control plane, plus its OSC wire mapping
//!
//! Blob reports, parameter get/set and every control request share this one
//! shape, so a detector's output can be re-packed onto the wire without the
//! scheduler knowing anything about the detector.

use anyhow::{bail, Result};
use rosc::{OscMessage, OscType};

/// A single message element.  OSC longs and doubles are narrowed on decode so
/// handlers only ever deal with these three variants.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Int(i32),
    Float(f32),
    Str(String),
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v)
    }
}

impl From<f32> for Value {
    fn from(v: f32) -> Self {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Str(v)
    }
}

/// An ordered list of values.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Message {
    values: Vec<Value>,
}

impl Message {
    pub fn new() -> Self {
        Self { values: Vec::new() }
    }

    pub fn push<V: Into<Value>>(&mut self, value: V) {
        self.values.push(value.into());
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }

    pub fn get(&self, index: usize) -> Option<&Value> {
        self.values.get(index)
    }

    /// Sub-message over `[start, end)`, clamped to the actual length; the
    /// scheduler uses this to re-pack blob records from a report.
    pub fn slice(&self, start: usize, end: usize) -> Message {
        let end = end.min(self.values.len());
        let start = start.min(end);
        Message {
            values: self.values[start..end].to_vec(),
        }
    }

    /// Integer at `index`; floats are accepted and truncated the way the
    /// original message library converted them.
    pub fn int_at(&self, index: usize) -> Result<i32> {
        match self.values.get(index) {
            Some(Value::Int(v)) => Ok(*v),
            Some(Value::Float(v)) => Ok(*v as i32),
            Some(other) => bail!("expected an integer at position {index}, got {other:?}"),
            None => bail!("message too short: no value at position {index}"),
        }
    }

    pub fn float_at(&self, index: usize) -> Result<f32> {
        match self.values.get(index) {
            Some(Value::Float(v)) => Ok(*v),
            Some(Value::Int(v)) => Ok(*v as f32),
            Some(other) => bail!("expected a float at position {index}, got {other:?}"),
            None => bail!("message too short: no value at position {index}"),
        }
    }

    pub fn str_at(&self, index: usize) -> Result<&str> {
        match self.values.get(index) {
            Some(Value::Str(v)) => Ok(v.as_str()),
            Some(other) => bail!("expected a string at position {index}, got {other:?}"),
            None => bail!("message too short: no value at position {index}"),
        }
    }

    /// Build an OSC message on `addr` carrying every value.
    pub fn to_osc(&self, addr: &str) -> OscMessage {
        let args = self
            .values
            .iter()
            .map(|v| match v {
                Value::Int(i) => OscType::Int(*i),
                Value::Float(f) => OscType::Float(*f),
                Value::Str(s) => OscType::String(s.clone()),
            })
            .collect();
        OscMessage {
            addr: addr.to_string(),
            args,
        }
    }

    /// Decode an OSC message's argument list, narrowing wide numeric types.
    /// Unsupported argument types are a caller error and reported as such.
    pub fn from_osc(osc: &OscMessage) -> Result<Message> {
        let mut message = Message::new();
        for arg in &osc.args {
            match arg {
                OscType::Int(i) => message.push(*i),
                OscType::Long(i) => message.push(*i as i32),
                OscType::Float(f) => message.push(*f),
                OscType::Double(f) => message.push(*f as f32),
                OscType::String(s) => message.push(s.as_str()),
                other => bail!("unsupported OSC argument type: {other:?}"),
            }
        }
        Ok(message)
    }
}

impl<V: Into<Value>> FromIterator<V> for Message {
    fn from_iter<I: IntoIterator<Item = V>>(iter: I) -> Self {
        Message {
            values: iter.into_iter().map(Into::into).collect(),
        }
    }
}

/// Shorthand for building a message from heterogeneous values.
#[macro_export]
macro_rules! message {
    ($($value:expr),* $(,)?) => {{
        let mut m = $crate::message::Message::new();
        $(m.push($value);)*
        m
    }};
}
