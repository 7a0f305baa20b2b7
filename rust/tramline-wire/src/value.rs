//! Dynamic body values, signatures and object paths.
//!
//! Bodies are sequences of [`Value`]. The transport codec encodes them
//! against the signature derived here; callers decode replies back into
//! plain Rust types through [`DecodeBody`]. A body whose signature differs
//! from the expected one is a [`BodyError::SignatureMismatch`]; a value
//! that is signature-compatible but does not convert is a cast failure.

use std::fmt;

use crate::validate::is_valid_path;

// ============================================================================
// Signature
// ============================================================================

/// A D-Bus type signature, e.g. `"a{sv}"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Signature(String);

impl Signature {
    pub fn new(s: impl Into<String>) -> Self {
        Signature(s.into())
    }

    pub fn empty() -> Self {
        Signature(String::new())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    fn push(&mut self, other: &Signature) {
        self.0.push_str(&other.0);
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The concatenated signature of a body.
pub fn signature_of(body: &[Value]) -> Signature {
    let mut sig = Signature::empty();
    for value in body {
        sig.push(&value.signature());
    }
    sig
}

// ============================================================================
// Object paths
// ============================================================================

/// A validated object path.
///
/// The root path is `"/"`; every other path is `/`-separated non-empty
/// elements of `[A-Za-z0-9_]`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ObjectPath(String);

/// A string did not satisfy the object-path grammar.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidPath(pub String);

impl fmt::Display for InvalidPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid object path: {:?}", self.0)
    }
}

impl std::error::Error for InvalidPath {}

impl ObjectPath {
    /// The root path `/`.
    pub fn root() -> Self {
        ObjectPath("/".to_string())
    }

    /// Validate and wrap a path string.
    pub fn new(s: impl Into<String>) -> Result<Self, InvalidPath> {
        let s = s.into();
        if is_valid_path(&s) {
            Ok(ObjectPath(s))
        } else {
            Err(InvalidPath(s))
        }
    }

    /// Build a path from its elements. No elements gives the root path.
    pub fn from_components<I, S>(components: I) -> Result<Self, InvalidPath>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut out = String::new();
        for c in components {
            out.push('/');
            out.push_str(c.as_ref());
        }
        if out.is_empty() {
            out.push('/');
        }
        ObjectPath::new(out)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_root(&self) -> bool {
        self.0 == "/"
    }

    /// The path elements, in order. Empty for the root path.
    pub fn components(&self) -> impl Iterator<Item = &str> {
        self.0.split('/').filter(|c| !c.is_empty())
    }

    /// Whether `self` is `prefix` itself or a descendant of it.
    pub fn starts_with(&self, prefix: &ObjectPath) -> bool {
        if prefix.is_root() {
            return true;
        }
        match self.0.strip_prefix(&prefix.0) {
            Some("") => true,
            Some(rest) => rest.starts_with('/'),
            None => false,
        }
    }
}

impl fmt::Display for ObjectPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<&str> for ObjectPath {
    type Error = InvalidPath;

    fn try_from(s: &str) -> Result<Self, InvalidPath> {
        ObjectPath::new(s)
    }
}

impl TryFrom<String> for ObjectPath {
    type Error = InvalidPath;

    fn try_from(s: String) -> Result<Self, InvalidPath> {
        ObjectPath::new(s)
    }
}

// ============================================================================
// Values
// ============================================================================

/// A dynamically typed body value.
///
/// Arrays and dicts carry their element signatures explicitly so that empty
/// containers still have a well-defined signature.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Byte(u8),
    Bool(bool),
    Int16(i16),
    Uint16(u16),
    Int32(i32),
    Uint32(u32),
    Int64(i64),
    Uint64(u64),
    Double(f64),
    Str(String),
    Path(ObjectPath),
    Sig(Signature),
    Variant(Box<Value>),
    Array(Signature, Vec<Value>),
    Struct(Vec<Value>),
    Dict(Signature, Signature, Vec<(Value, Value)>),
}

impl Value {
    /// The signature of this value.
    pub fn signature(&self) -> Signature {
        match self {
            Value::Byte(_) => Signature::new("y"),
            Value::Bool(_) => Signature::new("b"),
            Value::Int16(_) => Signature::new("n"),
            Value::Uint16(_) => Signature::new("q"),
            Value::Int32(_) => Signature::new("i"),
            Value::Uint32(_) => Signature::new("u"),
            Value::Int64(_) => Signature::new("x"),
            Value::Uint64(_) => Signature::new("t"),
            Value::Double(_) => Signature::new("d"),
            Value::Str(_) => Signature::new("s"),
            Value::Path(_) => Signature::new("o"),
            Value::Sig(_) => Signature::new("g"),
            Value::Variant(_) => Signature::new("v"),
            Value::Array(elem, _) => Signature::new(format!("a{elem}")),
            Value::Struct(fields) => {
                Signature::new(format!("({})", signature_of(fields)))
            }
            Value::Dict(k, v, _) => Signature::new(format!("a{{{k}{v}}}")),
        }
    }
}

impl From<u8> for Value {
    fn from(v: u8) -> Self {
        Value::Byte(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i16> for Value {
    fn from(v: i16) -> Self {
        Value::Int16(v)
    }
}

impl From<u16> for Value {
    fn from(v: u16) -> Self {
        Value::Uint16(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int32(v)
    }
}

impl From<u32> for Value {
    fn from(v: u32) -> Self {
        Value::Uint32(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int64(v)
    }
}

impl From<u64> for Value {
    fn from(v: u64) -> Self {
        Value::Uint64(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Double(v)
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

impl From<ObjectPath> for Value {
    fn from(v: ObjectPath) -> Self {
        Value::Path(v)
    }
}

// ============================================================================
// Typed decode
// ============================================================================

/// A value-level conversion failure on a signature-compatible value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CastError(pub String);

impl fmt::Display for CastError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cast failure: {}", self.0)
    }
}

impl std::error::Error for CastError {}

/// Why a body failed to decode into the expected tuple.
#[derive(Debug, Clone, PartialEq)]
pub enum BodyError {
    /// The body's signature differs from the expected one.
    SignatureMismatch { expected: Signature, got: Signature },
    /// The signature matched but a value would not convert.
    Cast(CastError),
}

impl fmt::Display for BodyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BodyError::SignatureMismatch { expected, got } => {
                write!(f, "signature mismatch: expected {expected:?}, got {got:?}")
            }
            BodyError::Cast(e) => e.fmt(f),
        }
    }
}

impl std::error::Error for BodyError {}

/// Conversion from a single [`Value`].
pub trait FromValue: Sized {
    /// The signature this type decodes from.
    fn value_signature() -> Signature;

    fn from_value(value: &Value) -> Result<Self, CastError>;
}

macro_rules! scalar_from_value {
    ($ty:ty, $variant:ident, $sig:literal) => {
        impl FromValue for $ty {
            fn value_signature() -> Signature {
                Signature::new($sig)
            }

            fn from_value(value: &Value) -> Result<Self, CastError> {
                match value {
                    Value::$variant(v) => Ok(v.clone()),
                    other => Err(CastError(format!(
                        concat!("expected ", $sig, ", got {:?}"),
                        other.signature()
                    ))),
                }
            }
        }
    };
}

scalar_from_value!(u8, Byte, "y");
scalar_from_value!(bool, Bool, "b");
scalar_from_value!(i16, Int16, "n");
scalar_from_value!(u16, Uint16, "q");
scalar_from_value!(i32, Int32, "i");
scalar_from_value!(u32, Uint32, "u");
scalar_from_value!(i64, Int64, "x");
scalar_from_value!(u64, Uint64, "t");
scalar_from_value!(f64, Double, "d");
scalar_from_value!(String, Str, "s");
scalar_from_value!(ObjectPath, Path, "o");
scalar_from_value!(Signature, Sig, "g");

impl<T: FromValue> FromValue for Vec<T> {
    fn value_signature() -> Signature {
        Signature::new(format!("a{}", T::value_signature()))
    }

    fn from_value(value: &Value) -> Result<Self, CastError> {
        match value {
            Value::Array(_, items) => items.iter().map(T::from_value).collect(),
            other => Err(CastError(format!(
                "expected array, got {:?}",
                other.signature()
            ))),
        }
    }
}

/// Conversion from a whole body.
///
/// Implemented for tuples of [`FromValue`] types up to five elements; the
/// unit type decodes the empty body.
pub trait DecodeBody: Sized {
    /// The expected body signature.
    fn body_signature() -> Signature;

    fn decode(body: &[Value]) -> Result<Self, BodyError>;
}

macro_rules! decode_body_tuple {
    ($($name:ident),*) => {
        impl<$($name: FromValue),*> DecodeBody for ($($name,)*) {
            fn body_signature() -> Signature {
                #[allow(unused_mut)]
                let mut sig = Signature::empty();
                $(sig.push(&$name::value_signature());)*
                sig
            }

            #[allow(unused_variables, unused_mut, unused_assignments)]
            fn decode(body: &[Value]) -> Result<Self, BodyError> {
                let expected = Self::body_signature();
                let got = signature_of(body);
                if expected != got {
                    return Err(BodyError::SignatureMismatch { expected, got });
                }
                let mut iter = body.iter();
                Ok(($(
                    $name::from_value(iter.next().expect("arity checked by signature"))
                        .map_err(BodyError::Cast)?,
                )*))
            }
        }
    };
}

decode_body_tuple!();
decode_body_tuple!(A);
decode_body_tuple!(A, B);
decode_body_tuple!(A, B, C);
decode_body_tuple!(A, B, C, D);
decode_body_tuple!(A, B, C, D, E);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signatures_compose() {
        let body = vec![
            Value::Str("hi".into()),
            Value::Array(Signature::new("u"), vec![Value::Uint32(1)]),
            Value::Struct(vec![Value::Bool(true), Value::Double(0.5)]),
            Value::Dict(Signature::new("s"), Signature::new("v"), Vec::new()),
        ];
        assert_eq!(signature_of(&body).as_str(), "sau(bd)a{sv}");
    }

    #[test]
    fn empty_array_keeps_its_signature() {
        let v = Value::Array(Signature::new("s"), Vec::new());
        assert_eq!(v.signature().as_str(), "as");
    }

    #[test]
    fn decode_matching_body() {
        let body = vec![Value::Str("abc".into()), Value::Uint32(7)];
        let (s, n): (String, u32) = DecodeBody::decode(&body).unwrap();
        assert_eq!(s, "abc");
        assert_eq!(n, 7);
    }

    #[test]
    fn decode_signature_mismatch_is_not_a_cast_failure() {
        let body = vec![Value::Uint32(7)];
        let err = <(String,)>::decode(&body).unwrap_err();
        match err {
            BodyError::SignatureMismatch { expected, got } => {
                assert_eq!(expected.as_str(), "s");
                assert_eq!(got.as_str(), "u");
            }
            other => panic!("expected signature mismatch, got {other:?}"),
        }
    }

    #[test]
    fn decode_empty_body_as_unit() {
        <()>::decode(&[]).unwrap();
        assert!(<()>::decode(&[Value::Byte(1)]).is_err());
    }

    #[test]
    fn vec_decodes_from_array() {
        let body = vec![Value::Array(
            Signature::new("s"),
            vec![Value::Str("a".into()), Value::Str("b".into())],
        )];
        let (items,): (Vec<String>,) = DecodeBody::decode(&body).unwrap();
        assert_eq!(items, vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn path_components_round_trip() {
        let p = ObjectPath::from_components(["a", "b"]).unwrap();
        assert_eq!(p.as_str(), "/a/b");
        assert_eq!(p.components().collect::<Vec<_>>(), vec!["a", "b"]);

        let root = ObjectPath::from_components(Vec::<&str>::new()).unwrap();
        assert!(root.is_root());
        assert_eq!(root.components().count(), 0);
    }

    #[test]
    fn path_prefix_respects_element_boundaries() {
        let a = ObjectPath::new("/a").unwrap();
        let ab = ObjectPath::new("/a/b").unwrap();
        let abc = ObjectPath::new("/abc").unwrap();
        assert!(ab.starts_with(&a));
        assert!(a.starts_with(&a));
        assert!(!abc.starts_with(&a));
        assert!(ab.starts_with(&ObjectPath::root()));
    }
}
