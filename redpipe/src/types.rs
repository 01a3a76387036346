use std::collections::{HashMap, HashSet};
use std::fmt;
use std::hash::{BuildHasher, Hash};
use std::str::from_utf8;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::errors::{RedisResult, ServerError};

/// Internal low-level redis value enum.
#[derive(PartialEq, Eq, Clone)]
pub enum Value {
    /// A nil response from the server.
    Nil,
    /// An integer response.  Note that there are a few situations
    /// in which redis actually returns a string for an integer which
    /// is why this library generally treats integers and strings
    /// the same for all numeric responses.
    Int(i64),
    /// An arbitrary binary data, usually represents a binary-safe string.
    BulkString(Vec<u8>),
    /// A response containing an array with more data. This is generally used by redis
    /// to express nested structures.
    Array(Vec<Value>),
    /// A simple string response, without line breaks and not binary safe.
    SimpleString(String),
    /// A status response which represents the string "OK".
    Okay,
    /// An error reply. It stays in the reply sequence so that the other
    /// replies of the same batch keep their positions.
    ServerError(ServerError),
}

impl Value {
    /// Checks if the return value looks like it fulfils the cursor
    /// protocol.  That means the result is an array item of length
    /// two with the first one being a cursor and the second an
    /// array response.
    pub fn looks_like_cursor(&self) -> bool {
        match *self {
            Value::Array(ref items) => {
                if items.len() != 2 {
                    return false;
                }
                matches!(items[0], Value::BulkString(_)) && matches!(items[1], Value::Array(_))
            }
            _ => false,
        }
    }

    /// Returns the server error if this value is one.
    pub fn as_server_error(&self) -> Option<&ServerError> {
        match self {
            Value::ServerError(err) => Some(err),
            _ => None,
        }
    }

    /// Converts a server error reply into `Err`, passing every other value through.
    pub fn extract_error(self) -> RedisResult<Self> {
        match self {
            Value::ServerError(err) => Err(err.into()),
            value => Ok(value),
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Value::Nil => write!(fmt, "nil"),
            Value::Int(val) => write!(fmt, "int({val:?})"),
            Value::BulkString(ref val) => match from_utf8(val) {
                Ok(x) => write!(fmt, "bulk-string('{x:?}')"),
                Err(_) => write!(fmt, "binary-data({val:?})"),
            },
            Value::Array(ref values) => write!(fmt, "array({values:?})"),
            Value::SimpleString(ref s) => write!(fmt, "simple-string({s:?})"),
            Value::Okay => write!(fmt, "ok"),
            Value::ServerError(ref err) => write!(fmt, "server-error({err})"),
        }
    }
}

/// Abstraction trait for redis command abstractions.
pub trait RedisWrite {
    /// Accepts a serialized redis command.
    fn write_arg(&mut self, arg: &[u8]);

    /// Accepts a serialized redis command.
    fn write_arg_fmt(&mut self, arg: impl fmt::Display) {
        self.write_arg(arg.to_string().as_bytes())
    }
}

impl RedisWrite for Vec<Vec<u8>> {
    fn write_arg(&mut self, arg: &[u8]) {
        self.push(arg.to_owned());
    }

    fn write_arg_fmt(&mut self, arg: impl fmt::Display) {
        self.push(arg.to_string().into_bytes())
    }
}

/// Used to convert a value into one or multiple redis argument
/// strings.  Most values will produce exactly one item but in
/// some cases it might make sense to produce more than one.
pub trait ToRedisArgs: Sized {
    /// This converts the value into a vector of bytes.  Each item
    /// is a single argument.  Most items generate a vector of a
    /// single item.
    ///
    /// The exception to this rule currently are vectors of items.
    fn to_redis_args(&self) -> Vec<Vec<u8>> {
        let mut out = Vec::new();
        self.write_redis_args(&mut out);
        out
    }

    /// This writes the value into a vector of bytes.  Each item
    /// is a single argument.  Most items generate a single item.
    fn write_redis_args<W>(&self, out: &mut W)
    where
        W: ?Sized + RedisWrite;

    /// This only exists internally as a workaround for the lack of
    /// specialization.
    #[doc(hidden)]
    fn write_args_from_slice<W>(items: &[Self], out: &mut W)
    where
        W: ?Sized + RedisWrite,
    {
        for item in items {
            item.write_redis_args(out);
        }
    }
}

macro_rules! itoa_based_to_redis_impl {
    ($t:ty) => {
        impl ToRedisArgs for $t {
            fn write_redis_args<W>(&self, out: &mut W)
            where
                W: ?Sized + RedisWrite,
            {
                let mut buf = ::itoa::Buffer::new();
                let s = buf.format(*self);
                out.write_arg(s.as_bytes())
            }
        }
    };
}

macro_rules! ryu_based_to_redis_impl {
    ($t:ty) => {
        impl ToRedisArgs for $t {
            fn write_redis_args<W>(&self, out: &mut W)
            where
                W: ?Sized + RedisWrite,
            {
                let mut buf = ::ryu::Buffer::new();
                let s = buf.format(*self);
                out.write_arg(s.as_bytes())
            }
        }
    };
}

impl ToRedisArgs for u8 {
    fn write_redis_args<W>(&self, out: &mut W)
    where
        W: ?Sized + RedisWrite,
    {
        let mut buf = ::itoa::Buffer::new();
        let s = buf.format(*self);
        out.write_arg(s.as_bytes())
    }

    fn write_args_from_slice<W>(items: &[u8], out: &mut W)
    where
        W: ?Sized + RedisWrite,
    {
        out.write_arg(items);
    }
}

itoa_based_to_redis_impl!(i8);
itoa_based_to_redis_impl!(i16);
itoa_based_to_redis_impl!(u16);
itoa_based_to_redis_impl!(i32);
itoa_based_to_redis_impl!(u32);
itoa_based_to_redis_impl!(i64);
itoa_based_to_redis_impl!(u64);
itoa_based_to_redis_impl!(isize);
itoa_based_to_redis_impl!(usize);

ryu_based_to_redis_impl!(f32);
ryu_based_to_redis_impl!(f64);

impl ToRedisArgs for bool {
    fn write_redis_args<W>(&self, out: &mut W)
    where
        W: ?Sized + RedisWrite,
    {
        out.write_arg(if *self { b"1" } else { b"0" })
    }
}

impl ToRedisArgs for String {
    fn write_redis_args<W>(&self, out: &mut W)
    where
        W: ?Sized + RedisWrite,
    {
        out.write_arg(self.as_bytes())
    }
}

impl<'a> ToRedisArgs for &'a str {
    fn write_redis_args<W>(&self, out: &mut W)
    where
        W: ?Sized + RedisWrite,
    {
        out.write_arg(self.as_bytes())
    }
}

impl<T: ToRedisArgs> ToRedisArgs for Vec<T> {
    fn write_redis_args<W>(&self, out: &mut W)
    where
        W: ?Sized + RedisWrite,
    {
        ToRedisArgs::write_args_from_slice(self, out)
    }
}

impl<'a, T: ToRedisArgs> ToRedisArgs for &'a [T] {
    fn write_redis_args<W>(&self, out: &mut W)
    where
        W: ?Sized + RedisWrite,
    {
        ToRedisArgs::write_args_from_slice(self, out)
    }
}

impl<T: ToRedisArgs, const N: usize> ToRedisArgs for [T; N] {
    fn write_redis_args<W>(&self, out: &mut W)
    where
        W: ?Sized + RedisWrite,
    {
        ToRedisArgs::write_args_from_slice(self.as_slice(), out)
    }
}

impl<T: ToRedisArgs> ToRedisArgs for Option<T> {
    fn write_redis_args<W>(&self, out: &mut W)
    where
        W: ?Sized + RedisWrite,
    {
        if let Some(ref x) = *self {
            x.write_redis_args(out);
        }
    }
}

impl<T: ToRedisArgs> ToRedisArgs for &T {
    fn write_redis_args<W>(&self, out: &mut W)
    where
        W: ?Sized + RedisWrite,
    {
        (*self).write_redis_args(out)
    }
}

macro_rules! to_redis_args_for_tuple {
    () => ();
    ($($name:ident,)+) => (
        #[doc(hidden)]
        impl<$($name: ToRedisArgs),*> ToRedisArgs for ($($name,)*) {
            #[allow(non_snake_case, unused_variables)]
            fn write_redis_args<W>(&self, out: &mut W) where W: ?Sized + RedisWrite {
                let ($(ref $name,)*) = *self;
                $($name.write_redis_args(out);)*
            }
        }
        to_redis_args_for_tuple_peel!($($name,)*);
    )
}

macro_rules! to_redis_args_for_tuple_peel {
    ($name:ident, $($other:ident,)*) => (to_redis_args_for_tuple!($($other,)*);)
}

to_redis_args_for_tuple! { T1, T2, T3, T4, }

/// This trait is used to convert a redis value into a more appropriate
/// type.  While a redis `Value` can represent any response that comes
/// back from the redis server, usually you want to map this into something
/// that works better in rust.  For instance you might want to convert the
/// return value into a `String` or an integer.
///
/// A server error reply converts into `Err` for every type except
/// [`Value`] itself.
pub trait FromRedisValue: Sized {
    /// Given a redis `Value` this attempts to convert it into the given
    /// destination type.  If that fails because it's not compatible an
    /// appropriate error is generated.
    fn from_redis_value(v: &Value) -> RedisResult<Self>;

    /// Same as `from_redis_value` but takes ownership of the value.
    fn from_owned_redis_value(v: Value) -> RedisResult<Self> {
        Self::from_redis_value(&v)
    }

    /// Similar to `from_redis_value` but constructs a vector of objects
    /// from another vector of values.
    fn from_redis_values(items: &[Value]) -> RedisResult<Vec<Self>> {
        items.iter().map(FromRedisValue::from_redis_value).collect()
    }

    /// Convert bytes to a single element vector.
    #[doc(hidden)]
    fn from_byte_vec(vec: &[u8]) -> Option<Vec<Self>> {
        Self::from_owned_redis_value(Value::BulkString(vec.into()))
            .map(|rv| vec![rv])
            .ok()
    }
}

fn server_error<T>(err: &ServerError) -> RedisResult<T> {
    Err(err.clone().into())
}

macro_rules! from_redis_value_for_num_internal {
    ($t:ty, $v:expr) => {{
        let v = $v;
        match *v {
            Value::Int(val) => Ok(val as $t),
            Value::SimpleString(ref s) => match s.parse::<$t>() {
                Ok(rv) => Ok(rv),
                Err(_) => invalid_type_error!(v, "Could not convert from string."),
            },
            Value::BulkString(ref bytes) => match from_utf8(bytes)?.parse::<$t>() {
                Ok(rv) => Ok(rv),
                Err(_) => invalid_type_error!(v, "Could not convert from string."),
            },
            Value::ServerError(ref err) => server_error(err),
            _ => invalid_type_error!(v, "Response type not convertible to numeric."),
        }
    }};
}

macro_rules! from_redis_value_for_num {
    ($t:ty) => {
        impl FromRedisValue for $t {
            fn from_redis_value(v: &Value) -> RedisResult<$t> {
                from_redis_value_for_num_internal!($t, v)
            }
        }
    };
}

impl FromRedisValue for u8 {
    fn from_redis_value(v: &Value) -> RedisResult<u8> {
        from_redis_value_for_num_internal!(u8, v)
    }

    fn from_byte_vec(vec: &[u8]) -> Option<Vec<u8>> {
        Some(vec.to_vec())
    }
}

from_redis_value_for_num!(i8);
from_redis_value_for_num!(i16);
from_redis_value_for_num!(u16);
from_redis_value_for_num!(i32);
from_redis_value_for_num!(u32);
from_redis_value_for_num!(i64);
from_redis_value_for_num!(u64);
from_redis_value_for_num!(f32);
from_redis_value_for_num!(f64);
from_redis_value_for_num!(isize);
from_redis_value_for_num!(usize);

impl FromRedisValue for bool {
    fn from_redis_value(v: &Value) -> RedisResult<bool> {
        match *v {
            Value::Nil => Ok(false),
            Value::Int(val) => Ok(val != 0),
            Value::SimpleString(ref s) => {
                if &s[..] == "1" {
                    Ok(true)
                } else if &s[..] == "0" {
                    Ok(false)
                } else {
                    invalid_type_error!(v, "Response status not valid boolean");
                }
            }
            Value::BulkString(ref bytes) => {
                if bytes == b"1" {
                    Ok(true)
                } else if bytes == b"0" {
                    Ok(false)
                } else {
                    invalid_type_error!(v, "Response type not bool compatible.");
                }
            }
            Value::Okay => Ok(true),
            Value::ServerError(ref err) => server_error(err),
            _ => invalid_type_error!(v, "Response type not bool compatible."),
        }
    }
}

impl FromRedisValue for String {
    fn from_redis_value(v: &Value) -> RedisResult<String> {
        match *v {
            Value::BulkString(ref bytes) => Ok(from_utf8(bytes)?.to_string()),
            Value::Okay => Ok("OK".to_string()),
            Value::SimpleString(ref val) => Ok(val.to_string()),
            Value::Int(val) => Ok(val.to_string()),
            Value::ServerError(ref err) => server_error(err),
            _ => invalid_type_error!(v, "Response type not string compatible."),
        }
    }

    fn from_owned_redis_value(v: Value) -> RedisResult<String> {
        match v {
            Value::BulkString(bytes) => Ok(String::from_utf8(bytes)?),
            Value::SimpleString(val) => Ok(val),
            other => Self::from_redis_value(&other),
        }
    }
}

impl<T: FromRedisValue> FromRedisValue for Vec<T> {
    fn from_redis_value(v: &Value) -> RedisResult<Vec<T>> {
        match *v {
            // Binary data is parsed into a single-element vector, except
            // for the element type `u8`, which consumes the whole string.
            Value::BulkString(ref bytes) => match FromRedisValue::from_byte_vec(bytes) {
                Some(x) => Ok(x),
                None => invalid_type_error!(
                    v,
                    format!("Conversion to {} failed.", std::any::type_name::<Vec<T>>())
                ),
            },
            Value::Array(ref items) => FromRedisValue::from_redis_values(items),
            Value::Nil => Ok(vec![]),
            Value::ServerError(ref err) => server_error(err),
            _ => invalid_type_error!(v, "Response type not vector compatible."),
        }
    }
}

impl<K, V, S> FromRedisValue for HashMap<K, V, S>
where
    K: FromRedisValue + Eq + Hash,
    V: FromRedisValue,
    S: BuildHasher + Default,
{
    fn from_redis_value(v: &Value) -> RedisResult<HashMap<K, V, S>> {
        match *v {
            Value::Nil => Ok(Default::default()),
            Value::Array(ref items) if items.len() % 2 == 0 => items
                .chunks_exact(2)
                .map(|pair| {
                    Ok((
                        K::from_redis_value(&pair[0])?,
                        V::from_redis_value(&pair[1])?,
                    ))
                })
                .collect(),
            Value::ServerError(ref err) => server_error(err),
            _ => invalid_type_error!(v, "Response type not hashmap compatible"),
        }
    }
}

impl<T, S> FromRedisValue for HashSet<T, S>
where
    T: FromRedisValue + Eq + Hash,
    S: BuildHasher + Default,
{
    fn from_redis_value(v: &Value) -> RedisResult<HashSet<T, S>> {
        match *v {
            Value::Nil => Ok(Default::default()),
            Value::Array(ref items) => items.iter().map(FromRedisValue::from_redis_value).collect(),
            Value::ServerError(ref err) => server_error(err),
            _ => invalid_type_error!(v, "Response type not hashset compatible"),
        }
    }
}

impl FromRedisValue for Value {
    fn from_redis_value(v: &Value) -> RedisResult<Value> {
        Ok(v.clone())
    }

    fn from_owned_redis_value(v: Value) -> RedisResult<Self> {
        Ok(v)
    }
}

impl FromRedisValue for () {
    fn from_redis_value(v: &Value) -> RedisResult<()> {
        match *v {
            Value::ServerError(ref err) => server_error(err),
            _ => Ok(()),
        }
    }
}

impl<T: FromRedisValue> FromRedisValue for Option<T> {
    fn from_redis_value(v: &Value) -> RedisResult<Option<T>> {
        if *v == Value::Nil {
            return Ok(None);
        }
        Ok(Some(FromRedisValue::from_redis_value(v)?))
    }

    fn from_owned_redis_value(v: Value) -> RedisResult<Option<T>> {
        if v == Value::Nil {
            return Ok(None);
        }
        Ok(Some(FromRedisValue::from_owned_redis_value(v)?))
    }
}

macro_rules! from_redis_value_for_tuple {
    () => ();
    ($($name:ident,)+) => (
        #[doc(hidden)]
        impl<$($name: FromRedisValue),*> FromRedisValue for ($($name,)*) {
            // we have local variables named T1 as dummies and those
            // variables are unused.
            #[allow(non_snake_case, unused_variables)]
            fn from_redis_value(v: &Value) -> RedisResult<($($name,)*)> {
                match *v {
                    Value::Array(ref items) => {
                        // hacky way to count the tuple size
                        let mut n = 0;
                        $(let $name = (); n += 1;)*
                        if items.len() != n {
                            invalid_type_error!(v, "Array response of wrong dimension")
                        }

                        // this is pretty ugly too.  The { i += 1; i - 1} is rust's
                        // postfix increment :)
                        let mut i = 0;
                        Ok(($({let $name = (); from_redis_value(
                            &items[{ i += 1; i - 1 }])?},)*))
                    }
                    Value::ServerError(ref err) => server_error(err),
                    _ => invalid_type_error!(v, "Not an Array response")
                }
            }
        }
        from_redis_value_for_tuple_peel!($($name,)*);
    )
}

macro_rules! from_redis_value_for_tuple_peel {
    ($name:ident, $($other:ident,)*) => (from_redis_value_for_tuple!($($other,)*);)
}

from_redis_value_for_tuple! { T1, T2, T3, T4, }

/// A shortcut function to invoke `FromRedisValue::from_redis_value`
/// to make the API slightly nicer.
pub fn from_redis_value<T: FromRedisValue>(v: &Value) -> RedisResult<T> {
    FromRedisValue::from_redis_value(v)
}

/// A shortcut function to invoke `FromRedisValue::from_owned_redis_value`
/// to make the API slightly nicer.
pub fn from_owned_redis_value<T: FromRedisValue>(v: Value) -> RedisResult<T> {
    FromRedisValue::from_owned_redis_value(v)
}

/// Header written in front of every frozen payload.
pub const FROZEN_HEADER: &[u8] = b"\x00redpipe:json\x00";

/// A serde value stored as JSON behind [`FROZEN_HEADER`].
///
/// Freezing happens explicitly through [`Frozen::to_bytes`] (or
/// [`freeze`]).  Reading back works through `FromRedisValue` on raw
/// replies, or by decoding replies into plain [`Value`] trees with
/// [`thaw`].
#[derive(Debug, Clone, PartialEq)]
pub struct Frozen<T>(pub T);

impl<T: Serialize> Frozen<T> {
    /// Serializes the wrapped value into a prefixed payload.
    pub fn to_bytes(&self) -> RedisResult<Vec<u8>> {
        freeze(&self.0)
    }
}

impl<T> Frozen<T> {
    pub fn into_inner(self) -> T {
        self.0
    }
}

/// Serializes `value` into a prefixed payload suitable as a command argument.
pub fn freeze<T: Serialize + ?Sized>(value: &T) -> RedisResult<Vec<u8>> {
    let mut out = FROZEN_HEADER.to_vec();
    serde_json::to_writer(&mut out, value)?;
    Ok(out)
}

/// Returns true when `bytes` carries the frozen payload header.
pub fn is_frozen(bytes: &[u8]) -> bool {
    bytes.starts_with(FROZEN_HEADER)
}

impl<T: DeserializeOwned> FromRedisValue for Frozen<T> {
    fn from_redis_value(v: &Value) -> RedisResult<Frozen<T>> {
        match *v {
            Value::BulkString(ref bytes) if is_frozen(bytes) => Ok(Frozen(
                serde_json::from_slice(&bytes[FROZEN_HEADER.len()..])?,
            )),
            Value::ServerError(ref err) => server_error(err),
            _ => invalid_type_error!(v, "Response is not a frozen value"),
        }
    }
}

/// Decodes frozen payloads anywhere inside `value` into plain value trees.
///
/// JSON objects become flat `[key, value, ...]` arrays, booleans become
/// `0`/`1` integers and non-integral numbers become bulk strings.  Values
/// without the header, or whose payload fails to decode, are returned as
/// they are.
pub fn thaw(value: Value) -> Value {
    match value {
        Value::BulkString(bytes) if is_frozen(&bytes) => {
            match serde_json::from_slice::<serde_json::Value>(&bytes[FROZEN_HEADER.len()..]) {
                Ok(json) => json_to_value(json),
                Err(_) => Value::BulkString(bytes),
            }
        }
        Value::Array(items) => Value::Array(items.into_iter().map(thaw).collect()),
        other => other,
    }
}

fn json_to_value(json: serde_json::Value) -> Value {
    match json {
        serde_json::Value::Null => Value::Nil,
        serde_json::Value::Bool(b) => Value::Int(b as i64),
        serde_json::Value::Number(n) => match n.as_i64() {
            Some(i) => Value::Int(i),
            None => Value::BulkString(n.to_string().into_bytes()),
        },
        serde_json::Value::String(s) => Value::BulkString(s.into_bytes()),
        serde_json::Value::Array(items) => {
            Value::Array(items.into_iter().map(json_to_value).collect())
        }
        serde_json::Value::Object(map) => Value::Array(
            map.into_iter()
                .flat_map(|(k, v)| [Value::BulkString(k.into_bytes()), json_to_value(v)])
                .collect(),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ErrorKind;

    #[test]
    fn byte_slices_are_one_argument() {
        let data: &[u8] = b"abc";
        assert_eq!(data.to_redis_args(), vec![b"abc".to_vec()]);
        assert_eq!(
            vec!["a", "b"].to_redis_args(),
            vec![b"a".to_vec(), b"b".to_vec()]
        );
        assert_eq!(1.5f64.to_redis_args(), vec![b"1.5".to_vec()]);
        assert_eq!(None::<i32>.to_redis_args(), Vec::<Vec<u8>>::new());
    }

    #[test]
    fn server_errors_convert_to_err() {
        let v = Value::ServerError(ServerError::from_line("ERR boom"));
        let err = from_redis_value::<String>(&v).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ResponseError);
        assert_eq!(from_redis_value::<Value>(&v).unwrap(), v);
    }

    #[test]
    fn bulk_strings_convert_to_bytes_and_numbers() {
        let v = Value::BulkString(b"42".to_vec());
        assert_eq!(from_redis_value::<Vec<u8>>(&v).unwrap(), b"42".to_vec());
        assert_eq!(from_redis_value::<i64>(&v).unwrap(), 42);
        assert_eq!(from_redis_value::<Vec<i64>>(&v).unwrap(), vec![42]);
    }

    #[test]
    fn frozen_values_round_trip_through_thaw() {
        let bytes = freeze(&serde_json::json!({"n": 3, "tags": ["a"]})).unwrap();
        assert!(is_frozen(&bytes));
        let thawed = thaw(Value::Array(vec![
            Value::BulkString(bytes),
            Value::BulkString(b"plain".to_vec()),
        ]));
        assert_eq!(
            thawed,
            Value::Array(vec![
                Value::Array(vec![
                    Value::BulkString(b"n".to_vec()),
                    Value::Int(3),
                    Value::BulkString(b"tags".to_vec()),
                    Value::Array(vec![Value::BulkString(b"a".to_vec())]),
                ]),
                Value::BulkString(b"plain".to_vec()),
            ])
        );
    }

    #[test]
    fn frozen_decodes_typed() {
        let bytes = Frozen(vec![1u32, 2]).to_bytes().unwrap();
        let back: Frozen<Vec<u32>> = from_owned_redis_value(Value::BulkString(bytes)).unwrap();
        assert_eq!(back.into_inner(), vec![1, 2]);
    }
}
