//! Self-describing variant values used for server metadata.
//!
//! A variant travels as a declared type signature (D-Bus notation, e.g. `s`,
//! `x`, `a{sv}`) plus its raw value. Only the shapes the server actually uses
//! for metadata are decoded: strings, 64-bit integers carried as a low/high
//! 32-bit pair, and variant dictionaries. Everything decodes to either a
//! string or a nested string map, so integers are rendered in decimal.

use std::collections::BTreeMap;
use std::fmt;
use std::iter::Peekable;
use std::str::Chars;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Errors raised while parsing signatures or decoding variants.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VariantError {
    /// The declared type is not one the decoder understands.
    #[error("unsupported variant type: {signature}")]
    UnsupportedVariantType { signature: String },

    /// The declared type is supported but the raw value has another shape.
    #[error("variant value does not match its declared type {signature}")]
    TypeMismatch { signature: String },

    /// The type signature itself could not be parsed.
    #[error("invalid type signature: {0:?}")]
    InvalidSignature(String),
}

/// One node of a parsed type signature.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeNode {
    code: char,
    children: Vec<TypeNode>,
}

impl TypeNode {
    /// A basic (non-container) type such as `s` or `x`.
    pub const fn basic(code: char) -> Self {
        Self {
            code,
            children: Vec::new(),
        }
    }

    /// An array of `element`.
    pub fn array(element: Self) -> Self {
        Self {
            code: 'a',
            children: vec![element],
        }
    }

    /// A dictionary entry `{key value}`.
    pub fn dict_entry(key: Self, value: Self) -> Self {
        Self {
            code: '{',
            children: vec![key, value],
        }
    }

    /// The `a{sv}` signature of a variant dictionary.
    pub fn variant_dict() -> Self {
        Self::array(Self::dict_entry(Self::basic('s'), Self::basic('v')))
    }

    /// Parse a single complete type from a signature string.
    pub fn parse(signature: &str) -> Result<Self, VariantError> {
        let mut chars = signature.chars().peekable();
        let node = parse_single(&mut chars, signature)?;
        if chars.next().is_some() {
            return Err(VariantError::InvalidSignature(signature.to_string()));
        }
        Ok(node)
    }

    /// The leading type code.
    pub const fn code(&self) -> char {
        self.code
    }

    /// Whether this is exactly `a{sv}`.
    pub fn is_variant_dict(&self) -> bool {
        match (self.code, self.children.as_slice()) {
            ('a', [entry]) => {
                entry.code == '{'
                    && matches!(
                        entry.children.as_slice(),
                        [key, value] if key.code == 's' && value.code == 'v'
                    )
            }
            _ => false,
        }
    }
}

fn parse_single(chars: &mut Peekable<Chars<'_>>, signature: &str) -> Result<TypeNode, VariantError> {
    let invalid = || VariantError::InvalidSignature(signature.to_string());

    let code = chars.next().ok_or_else(invalid)?;
    match code {
        'y' | 'b' | 'n' | 'q' | 'i' | 'u' | 'x' | 't' | 'd' | 's' | 'o' | 'g' | 'h' | 'v' => {
            Ok(TypeNode::basic(code))
        }
        'a' => Ok(TypeNode::array(parse_single(chars, signature)?)),
        '(' => {
            let mut children = Vec::new();
            loop {
                match chars.peek() {
                    Some(')') => {
                        chars.next();
                        break;
                    }
                    Some(_) => children.push(parse_single(chars, signature)?),
                    None => return Err(invalid()),
                }
            }
            if children.is_empty() {
                return Err(invalid());
            }
            Ok(TypeNode { code, children })
        }
        '{' => {
            let key = parse_single(chars, signature)?;
            let value = parse_single(chars, signature)?;
            if chars.next() != Some('}') {
                return Err(invalid());
            }
            Ok(TypeNode::dict_entry(key, value))
        }
        _ => Err(invalid()),
    }
}

impl fmt::Display for TypeNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code)?;
        for child in &self.children {
            write!(f, "{child}")?;
        }
        match self.code {
            '(' => write!(f, ")"),
            '{' => write!(f, "}}"),
            _ => Ok(()),
        }
    }
}

impl Serialize for TypeNode {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for TypeNode {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let signature = String::deserialize(deserializer)?;
        Self::parse(&signature).map_err(serde::de::Error::custom)
    }
}

/// Ordered `(key, variant)` pairs, as carried on the wire for `a{sv}`.
pub type VariantDict = Vec<(String, Variant)>;

/// Raw value half of a variant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RawValue {
    String(String),
    /// 64-bit integer split into 32-bit halves. Halves may arrive in signed
    /// or unsigned 32-bit form; only the low 32 bits of each are used.
    Int64Parts { low: i64, high: i64 },
    Dict(VariantDict),
    Other(serde_json::Value),
}

/// A value together with its declared type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Variant {
    pub signature: TypeNode,
    pub value: RawValue,
}

impl Variant {
    pub fn string(value: impl Into<String>) -> Self {
        Self {
            signature: TypeNode::basic('s'),
            value: RawValue::String(value.into()),
        }
    }

    #[allow(clippy::cast_sign_loss)]
    pub fn int64(value: i64) -> Self {
        let (low, high) = split_parts(value as u64);
        Self {
            signature: TypeNode::basic('x'),
            value: RawValue::Int64Parts { low, high },
        }
    }

    pub fn uint64(value: u64) -> Self {
        let (low, high) = split_parts(value);
        Self {
            signature: TypeNode::basic('t'),
            value: RawValue::Int64Parts { low, high },
        }
    }

    pub fn dict(entries: VariantDict) -> Self {
        Self {
            signature: TypeNode::variant_dict(),
            value: RawValue::Dict(entries),
        }
    }
}

#[allow(clippy::cast_possible_wrap)]
const fn split_parts(bits: u64) -> (i64, i64) {
    ((bits & 0xFFFF_FFFF) as i64, (bits >> 32) as i64)
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn join_parts(low: i64, high: i64) -> u64 {
    (u64::from(high as u32) << 32) | u64::from(low as u32)
}

/// A decoded variant: a string, or a map of nested decoded values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum Decoded {
    String(String),
    Map(DecodedMap),
}

pub type DecodedMap = BTreeMap<String, Decoded>;

impl Decoded {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            Self::Map(_) => None,
        }
    }

    pub const fn as_map(&self) -> Option<&DecodedMap> {
        match self {
            Self::Map(map) => Some(map),
            Self::String(_) => None,
        }
    }

    /// Look up `key` if this is a map.
    pub fn get(&self, key: &str) -> Option<&Self> {
        self.as_map().and_then(|map| map.get(key))
    }
}

/// Decode one variant.
#[allow(clippy::cast_possible_wrap)]
pub fn decode(variant: &Variant) -> Result<Decoded, VariantError> {
    let signature = &variant.signature;
    match (signature.code, &variant.value) {
        ('s', RawValue::String(s)) => Ok(Decoded::String(s.clone())),
        ('x', RawValue::Int64Parts { low, high }) => {
            Ok(Decoded::String((join_parts(*low, *high) as i64).to_string()))
        }
        ('t', RawValue::Int64Parts { low, high }) => {
            Ok(Decoded::String(join_parts(*low, *high).to_string()))
        }
        (_, RawValue::Dict(entries)) if signature.is_variant_dict() => {
            decode_dict(entries).map(Decoded::Map)
        }
        ('s' | 'x' | 't', _) => Err(VariantError::TypeMismatch {
            signature: signature.to_string(),
        }),
        _ if signature.is_variant_dict() => Err(VariantError::TypeMismatch {
            signature: signature.to_string(),
        }),
        _ => Err(VariantError::UnsupportedVariantType {
            signature: signature.to_string(),
        }),
    }
}

/// Decode every entry of a variant dictionary. Later duplicates win.
pub fn decode_dict(dict: &[(String, Variant)]) -> Result<DecodedMap, VariantError> {
    let mut decoded = DecodedMap::new();
    for (key, value) in dict {
        decoded.insert(key.clone(), decode(value)?);
    }
    Ok(decoded)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn string_is_returned_unchanged() {
        let decoded = decode(&Variant::string("full")).unwrap();
        assert_eq!(decoded, Decoded::String("full".into()));
    }

    #[test]
    fn dict_keeps_every_key() {
        let dict = vec![
            ("arch".to_string(), Variant::string("x64")),
            ("platform".to_string(), Variant::string("linux")),
            ("pid".to_string(), Variant::uint64(4242)),
        ];
        let decoded = decode_dict(&dict).unwrap();
        assert_eq!(decoded.len(), 3);
        assert_eq!(decoded["arch"].as_str(), Some("x64"));
        assert_eq!(decoded["platform"].as_str(), Some("linux"));
        assert_eq!(decoded["pid"].as_str(), Some("4242"));
    }

    #[test]
    fn nested_dicts_decode_recursively() {
        let os = Variant::dict(vec![
            ("id".to_string(), Variant::string("ubuntu")),
            ("version".to_string(), Variant::string("24.04")),
        ]);
        let decoded = decode(&Variant::dict(vec![("os".to_string(), os)])).unwrap();
        assert_eq!(
            decoded.get("os").and_then(|os| os.get("version")).and_then(Decoded::as_str),
            Some("24.04")
        );
    }

    #[test]
    fn unsigned_pair_renders_decimal() {
        let one = Variant {
            signature: TypeNode::basic('t'),
            value: RawValue::Int64Parts { low: 1, high: 0 },
        };
        assert_eq!(decode(&one).unwrap(), Decoded::String("1".into()));
        assert_eq!(
            decode(&Variant::uint64(u64::MAX)).unwrap(),
            Decoded::String(u64::MAX.to_string())
        );
    }

    #[test]
    fn signed_minus_one_in_either_half_encoding() {
        let unsigned_halves = Variant {
            signature: TypeNode::basic('x'),
            value: RawValue::Int64Parts {
                low: 0xFFFF_FFFF,
                high: 0xFFFF_FFFF,
            },
        };
        let signed_halves = Variant {
            signature: TypeNode::basic('x'),
            value: RawValue::Int64Parts { low: -1, high: -1 },
        };
        assert_eq!(decode(&unsigned_halves).unwrap(), Decoded::String("-1".into()));
        assert_eq!(decode(&signed_halves).unwrap(), Decoded::String("-1".into()));
        assert_eq!(
            decode(&Variant::int64(i64::MIN)).unwrap(),
            Decoded::String(i64::MIN.to_string())
        );
    }

    #[test]
    fn unsupported_type_carries_signature() {
        let boolean = Variant {
            signature: TypeNode::parse("ab").unwrap(),
            value: RawValue::Other(serde_json::json!([true])),
        };
        assert_eq!(
            decode(&boolean),
            Err(VariantError::UnsupportedVariantType {
                signature: "ab".into()
            })
        );
    }

    #[test]
    fn unsupported_nested_value_fails_the_dict() {
        let dict = vec![(
            "icon".to_string(),
            Variant {
                signature: TypeNode::parse("ay").unwrap(),
                value: RawValue::Other(serde_json::json!([1, 2, 3])),
            },
        )];
        assert!(matches!(
            decode_dict(&dict),
            Err(VariantError::UnsupportedVariantType { .. })
        ));
    }

    #[test]
    fn mismatched_value_is_reported() {
        let bad = Variant {
            signature: TypeNode::basic('s'),
            value: RawValue::Int64Parts { low: 1, high: 0 },
        };
        assert!(matches!(decode(&bad), Err(VariantError::TypeMismatch { .. })));
    }

    #[test]
    fn duplicate_keys_last_wins() {
        let dict = vec![
            ("access".to_string(), Variant::string("jailed")),
            ("access".to_string(), Variant::string("full")),
        ];
        let decoded = decode_dict(&dict).unwrap();
        assert_eq!(decoded.len(), 1);
        assert_eq!(decoded["access"].as_str(), Some("full"));
    }

    #[test]
    fn signatures_parse_and_render() {
        for sig in ["s", "x", "a{sv}", "a(usa{sv})", "(ssia{sv})", "aay"] {
            assert_eq!(TypeNode::parse(sig).unwrap().to_string(), sig);
        }
        assert!(TypeNode::parse("a{sv}").unwrap().is_variant_dict());
        assert!(!TypeNode::parse("a{ss}").unwrap().is_variant_dict());
    }

    #[test]
    fn invalid_signatures_are_rejected() {
        for sig in ["", "a", "()", "{s", "{sv", "ss", "z"] {
            assert!(
                matches!(TypeNode::parse(sig), Err(VariantError::InvalidSignature(_))),
                "{sig:?} should not parse"
            );
        }
    }

    #[test]
    fn system_parameters_from_json() {
        let json = r#"[
            ["arch", {"signature": "s", "value": "x64"}],
            ["os", {"signature": "a{sv}", "value": [
                ["id", {"signature": "s", "value": "linux"}]
            ]}],
            ["access", {"signature": "s", "value": "full"}],
            ["boot-time", {"signature": "t", "value": {"low": 1000, "high": 0}}]
        ]"#;
        let dict: VariantDict = serde_json::from_str(json).unwrap();
        let decoded = decode_dict(&dict).unwrap();
        assert_eq!(decoded["access"].as_str(), Some("full"));
        assert_eq!(decoded["boot-time"].as_str(), Some("1000"));
        assert_eq!(
            decoded["os"].get("id").and_then(Decoded::as_str),
            Some("linux")
        );
    }
}
