//! AMF value type
//!
//! Only the AMF0 types that show up in NetConnection/NetStream commands and
//! `onMetaData` are represented. Object properties keep their insertion
//! order so encoded commands are byte-for-byte reproducible.

/// An AMF0 value
#[derive(Debug, Clone, PartialEq, Default)]
pub enum AmfValue {
    /// Null (0x05)
    #[default]
    Null,

    /// Undefined (0x06)
    Undefined,

    /// Boolean (0x01)
    Boolean(bool),

    /// IEEE 754 double (0x00)
    Number(f64),

    /// UTF-8 string (0x02, or 0x0C when longer than 65535 bytes)
    String(String),

    /// Anonymous object (0x03)
    Object(Vec<(String, AmfValue)>),

    /// Associative array (0x08)
    EcmaArray(Vec<(String, AmfValue)>),

    /// Dense array (0x0A)
    StrictArray(Vec<AmfValue>),
}

impl AmfValue {
    /// Build an object from `(key, value)` pairs
    pub fn object<K, V, I>(pairs: I) -> Self
    where
        K: Into<String>,
        V: Into<AmfValue>,
        I: IntoIterator<Item = (K, V)>,
    {
        AmfValue::Object(
            pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            AmfValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            AmfValue::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            AmfValue::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    /// Properties of an object or ECMA array
    pub fn properties(&self) -> Option<&[(String, AmfValue)]> {
        match self {
            AmfValue::Object(p) | AmfValue::EcmaArray(p) => Some(p),
            _ => None,
        }
    }

    /// Look up a property by key
    pub fn get(&self, key: &str) -> Option<&AmfValue> {
        self.properties()?
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v)
    }

    /// Look up a string property by key
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key)?.as_str()
    }

    /// Look up a number property by key
    pub fn get_number(&self, key: &str) -> Option<f64> {
        self.get(key)?.as_number()
    }

    pub fn is_null_or_undefined(&self) -> bool {
        matches!(self, AmfValue::Null | AmfValue::Undefined)
    }
}

impl From<bool> for AmfValue {
    fn from(v: bool) -> Self {
        AmfValue::Boolean(v)
    }
}

impl From<f64> for AmfValue {
    fn from(v: f64) -> Self {
        AmfValue::Number(v)
    }
}

impl From<u32> for AmfValue {
    fn from(v: u32) -> Self {
        AmfValue::Number(v as f64)
    }
}

impl From<String> for AmfValue {
    fn from(v: String) -> Self {
        AmfValue::String(v)
    }
}

impl From<&str> for AmfValue {
    fn from(v: &str) -> Self {
        AmfValue::String(v.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_object_lookup_keeps_order() {
        let obj = AmfValue::object([
            ("app", AmfValue::from("live")),
            ("objectEncoding", AmfValue::from(0.0)),
        ]);

        assert_eq!(obj.get_str("app"), Some("live"));
        assert_eq!(obj.get_number("objectEncoding"), Some(0.0));
        assert!(obj.get("missing").is_none());

        let keys: Vec<_> = obj.properties().unwrap().iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, ["app", "objectEncoding"]);
    }

    #[test]
    fn test_accessors_reject_other_types() {
        let n = AmfValue::Number(3.0);
        assert_eq!(n.as_str(), None);
        assert_eq!(n.as_bool(), None);
        assert!(n.properties().is_none());
        assert!(AmfValue::Undefined.is_null_or_undefined());
        assert!(!AmfValue::Boolean(false).is_null_or_undefined());
    }
}
