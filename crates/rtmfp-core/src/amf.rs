//! AMF0 commands
//!
//! Value encoding is delegated to `rml_amf0`; this module adds the command
//! layout used by NetConnection and NetStream invocations:
//! `name, transaction id, command object, args...`.

use std::collections::HashMap;
use std::io::Cursor;

use bytes::Bytes;
pub use rml_amf0::Amf0Value;

use crate::{Error, Result};

pub fn encode(values: &[Amf0Value]) -> Result<Bytes> {
    rml_amf0::serialize(&values.to_vec())
        .map(Bytes::from)
        .map_err(|e| Error::Amf(format!("{:?}", e)))
}

pub fn decode(data: &[u8]) -> Result<Vec<Amf0Value>> {
    let mut cursor = Cursor::new(data);
    rml_amf0::deserialize(&mut cursor).map_err(|e| Error::Amf(format!("{:?}", e)))
}

/// Build an AMF0 object from key/value pairs
pub fn object<K: Into<String>>(pairs: impl IntoIterator<Item = (K, Amf0Value)>) -> Amf0Value {
    Amf0Value::Object(
        pairs
            .into_iter()
            .map(|(k, v)| (k.into(), v))
            .collect::<HashMap<_, _>>(),
    )
}

pub fn string(value: impl Into<String>) -> Amf0Value {
    Amf0Value::Utf8String(value.into())
}

/// Look up a string property of an object
pub fn get_str<'a>(value: &'a Amf0Value, key: &str) -> Option<&'a str> {
    match value {
        Amf0Value::Object(props) => match props.get(key) {
            Some(Amf0Value::Utf8String(s)) => Some(s.as_str()),
            _ => None,
        },
        _ => None,
    }
}

/// Remote procedure call
#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    pub name: String,
    pub transaction_id: f64,
    pub object: Amf0Value,
    pub args: Vec<Amf0Value>,
}

impl Command {
    pub fn new(name: impl Into<String>, transaction_id: f64) -> Self {
        Self {
            name: name.into(),
            transaction_id,
            object: Amf0Value::Null,
            args: Vec::new(),
        }
    }

    pub fn with_object(mut self, object: Amf0Value) -> Self {
        self.object = object;
        self
    }

    pub fn arg(mut self, value: Amf0Value) -> Self {
        self.args.push(value);
        self
    }

    pub fn encode(&self) -> Result<Bytes> {
        let mut values = Vec::with_capacity(3 + self.args.len());
        values.push(string(self.name.clone()));
        values.push(Amf0Value::Number(self.transaction_id));
        values.push(self.object.clone());
        values.extend(self.args.iter().cloned());
        encode(&values)
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut values = decode(data)?.into_iter();
        let name = match values.next() {
            Some(Amf0Value::Utf8String(name)) => name,
            other => return Err(Error::Amf(format!("expected command name, got {:?}", other))),
        };
        let transaction_id = match values.next() {
            Some(Amf0Value::Number(id)) => id,
            _ => 0.0,
        };
        let object = values.next().unwrap_or(Amf0Value::Null);
        Ok(Self {
            name,
            transaction_id,
            object,
            args: values.collect(),
        })
    }

    /// First argument, where status replies carry their info object
    pub fn info(&self) -> &Amf0Value {
        self.args.first().unwrap_or(&self.object)
    }
}

/// `code` and `description` of a status info object
pub fn status(info: &Amf0Value) -> Option<(String, String)> {
    let code = get_str(info, "code")?;
    let description = get_str(info, "description").unwrap_or_default();
    Some((code.to_string(), description.to_string()))
}

/// Build a status info object
pub fn status_object(level: &str, code: &str, description: &str) -> Amf0Value {
    object([
        ("level", string(level)),
        ("code", string(code)),
        ("description", string(description)),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_layout() {
        let command = Command::new("play", 0.0).arg(string("live"));
        let decoded = Command::decode(&command.encode().unwrap()).unwrap();
        assert_eq!(decoded.name, "play");
        assert_eq!(decoded.object, Amf0Value::Null);
        assert_eq!(decoded.args, vec![string("live")]);
    }

    #[test]
    fn test_status_from_info() {
        let command = Command::new("onStatus", 0.0).arg(status_object(
            "status",
            "NetStream.Play.Start",
            "Started playing",
        ));
        let decoded = Command::decode(&command.encode().unwrap()).unwrap();
        let (code, description) = status(decoded.info()).unwrap();
        assert_eq!(code, "NetStream.Play.Start");
        assert_eq!(description, "Started playing");
    }

    #[test]
    fn test_rejects_missing_name() {
        let data = encode(&[Amf0Value::Number(1.0)]).unwrap();
        assert!(Command::decode(&data).is_err());
    }
}
