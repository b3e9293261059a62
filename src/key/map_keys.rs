//! Walks a serializable value and rejects maps keyed by anything but strings.
//!
//! `serde_json` quietly turns integer and bool map keys into strings, which
//! would let `{1: 'a'}` and `{'1': 'a'}` share a key.

use std::fmt::Display;

use serde::ser::{self, Impossible, Serialize};

#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub(super) struct MapKeyError(String);

impl ser::Error for MapKeyError {
    fn custom<T: Display>(msg: T) -> Self {
        Self(msg.to_string())
    }
}

fn non_string(found: impl Display) -> MapKeyError {
    MapKeyError(format!("{found}, map keys must be strings"))
}

pub(super) fn check<T>(value: &T) -> Result<(), MapKeyError>
where
    T: Serialize + ?Sized,
{
    value.serialize(Walker)
}

/// Visits every value, handing map keys over to [`MapKey`].
struct Walker;

impl ser::Serializer for Walker {
    type Ok = ();
    type Error = MapKeyError;
    type SerializeSeq = Self;
    type SerializeTuple = Self;
    type SerializeTupleStruct = Self;
    type SerializeTupleVariant = Self;
    type SerializeMap = Self;
    type SerializeStruct = Self;
    type SerializeStructVariant = Self;

    fn serialize_bool(self, _: bool) -> Result<(), MapKeyError> {
        Ok(())
    }

    fn serialize_i8(self, _: i8) -> Result<(), MapKeyError> {
        Ok(())
    }

    fn serialize_i16(self, _: i16) -> Result<(), MapKeyError> {
        Ok(())
    }

    fn serialize_i32(self, _: i32) -> Result<(), MapKeyError> {
        Ok(())
    }

    fn serialize_i64(self, _: i64) -> Result<(), MapKeyError> {
        Ok(())
    }

    fn serialize_i128(self, _: i128) -> Result<(), MapKeyError> {
        Ok(())
    }

    fn serialize_u8(self, _: u8) -> Result<(), MapKeyError> {
        Ok(())
    }

    fn serialize_u16(self, _: u16) -> Result<(), MapKeyError> {
        Ok(())
    }

    fn serialize_u32(self, _: u32) -> Result<(), MapKeyError> {
        Ok(())
    }

    fn serialize_u64(self, _: u64) -> Result<(), MapKeyError> {
        Ok(())
    }

    fn serialize_u128(self, _: u128) -> Result<(), MapKeyError> {
        Ok(())
    }

    fn serialize_f32(self, _: f32) -> Result<(), MapKeyError> {
        Ok(())
    }

    fn serialize_f64(self, _: f64) -> Result<(), MapKeyError> {
        Ok(())
    }

    fn serialize_char(self, _: char) -> Result<(), MapKeyError> {
        Ok(())
    }

    fn serialize_str(self, _: &str) -> Result<(), MapKeyError> {
        Ok(())
    }

    fn serialize_bytes(self, _: &[u8]) -> Result<(), MapKeyError> {
        Ok(())
    }

    fn serialize_none(self) -> Result<(), MapKeyError> {
        Ok(())
    }

    fn serialize_some<T: Serialize + ?Sized>(self, value: &T) -> Result<(), MapKeyError> {
        value.serialize(self)
    }

    fn serialize_unit(self) -> Result<(), MapKeyError> {
        Ok(())
    }

    fn serialize_unit_struct(self, _: &'static str) -> Result<(), MapKeyError> {
        Ok(())
    }

    fn serialize_unit_variant(
        self,
        _: &'static str,
        _: u32,
        _: &'static str,
    ) -> Result<(), MapKeyError> {
        Ok(())
    }

    fn serialize_newtype_struct<T: Serialize + ?Sized>(
        self,
        _: &'static str,
        value: &T,
    ) -> Result<(), MapKeyError> {
        value.serialize(self)
    }

    fn serialize_newtype_variant<T: Serialize + ?Sized>(
        self,
        _: &'static str,
        _: u32,
        _: &'static str,
        value: &T,
    ) -> Result<(), MapKeyError> {
        value.serialize(self)
    }

    fn serialize_seq(self, _: Option<usize>) -> Result<Self, MapKeyError> {
        Ok(self)
    }

    fn serialize_tuple(self, _: usize) -> Result<Self, MapKeyError> {
        Ok(self)
    }

    fn serialize_tuple_struct(self, _: &'static str, _: usize) -> Result<Self, MapKeyError> {
        Ok(self)
    }

    fn serialize_tuple_variant(
        self,
        _: &'static str,
        _: u32,
        _: &'static str,
        _: usize,
    ) -> Result<Self, MapKeyError> {
        Ok(self)
    }

    fn serialize_map(self, _: Option<usize>) -> Result<Self, MapKeyError> {
        Ok(self)
    }

    fn serialize_struct(self, _: &'static str, _: usize) -> Result<Self, MapKeyError> {
        Ok(self)
    }

    fn serialize_struct_variant(
        self,
        _: &'static str,
        _: u32,
        _: &'static str,
        _: usize,
    ) -> Result<Self, MapKeyError> {
        Ok(self)
    }
}

impl ser::SerializeSeq for Walker {
    type Ok = ();
    type Error = MapKeyError;

    fn serialize_element<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<(), MapKeyError> {
        value.serialize(Walker)
    }

    fn end(self) -> Result<(), MapKeyError> {
        Ok(())
    }
}

impl ser::SerializeTuple for Walker {
    type Ok = ();
    type Error = MapKeyError;

    fn serialize_element<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<(), MapKeyError> {
        value.serialize(Walker)
    }

    fn end(self) -> Result<(), MapKeyError> {
        Ok(())
    }
}

impl ser::SerializeTupleStruct for Walker {
    type Ok = ();
    type Error = MapKeyError;

    fn serialize_field<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<(), MapKeyError> {
        value.serialize(Walker)
    }

    fn end(self) -> Result<(), MapKeyError> {
        Ok(())
    }
}

impl ser::SerializeTupleVariant for Walker {
    type Ok = ();
    type Error = MapKeyError;

    fn serialize_field<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<(), MapKeyError> {
        value.serialize(Walker)
    }

    fn end(self) -> Result<(), MapKeyError> {
        Ok(())
    }
}

impl ser::SerializeMap for Walker {
    type Ok = ();
    type Error = MapKeyError;

    fn serialize_key<T: Serialize + ?Sized>(&mut self, key: &T) -> Result<(), MapKeyError> {
        key.serialize(MapKey)
    }

    fn serialize_value<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<(), MapKeyError> {
        value.serialize(Walker)
    }

    fn end(self) -> Result<(), MapKeyError> {
        Ok(())
    }
}

impl ser::SerializeStruct for Walker {
    type Ok = ();
    type Error = MapKeyError;

    fn serialize_field<T: Serialize + ?Sized>(
        &mut self,
        _: &'static str,
        value: &T,
    ) -> Result<(), MapKeyError> {
        value.serialize(Walker)
    }

    fn end(self) -> Result<(), MapKeyError> {
        Ok(())
    }
}

impl ser::SerializeStructVariant for Walker {
    type Ok = ();
    type Error = MapKeyError;

    fn serialize_field<T: Serialize + ?Sized>(
        &mut self,
        _: &'static str,
        value: &T,
    ) -> Result<(), MapKeyError> {
        value.serialize(Walker)
    }

    fn end(self) -> Result<(), MapKeyError> {
        Ok(())
    }
}

/// Accepts strings, and what serializes as one: chars, unit variants and
/// newtypes around a string.
struct MapKey;

macro_rules! reject {
    ($($method:ident($ty:ty)),* $(,)?) => {
        $(
            fn $method(self, v: $ty) -> Result<(), MapKeyError> {
                Err(non_string(format_args!("'{v}', type: {}", stringify!($ty))))
            }
        )*
    };
}

impl ser::Serializer for MapKey {
    type Ok = ();
    type Error = MapKeyError;
    type SerializeSeq = Impossible<(), MapKeyError>;
    type SerializeTuple = Impossible<(), MapKeyError>;
    type SerializeTupleStruct = Impossible<(), MapKeyError>;
    type SerializeTupleVariant = Impossible<(), MapKeyError>;
    type SerializeMap = Impossible<(), MapKeyError>;
    type SerializeStruct = Impossible<(), MapKeyError>;
    type SerializeStructVariant = Impossible<(), MapKeyError>;

    reject! {
        serialize_bool(bool),
        serialize_i8(i8),
        serialize_i16(i16),
        serialize_i32(i32),
        serialize_i64(i64),
        serialize_i128(i128),
        serialize_u8(u8),
        serialize_u16(u16),
        serialize_u32(u32),
        serialize_u64(u64),
        serialize_u128(u128),
        serialize_f32(f32),
        serialize_f64(f64),
    }

    fn serialize_char(self, _: char) -> Result<(), MapKeyError> {
        Ok(())
    }

    fn serialize_str(self, _: &str) -> Result<(), MapKeyError> {
        Ok(())
    }

    fn serialize_bytes(self, _: &[u8]) -> Result<(), MapKeyError> {
        Err(non_string("bytes"))
    }

    fn serialize_none(self) -> Result<(), MapKeyError> {
        Err(non_string("none"))
    }

    fn serialize_some<T: Serialize + ?Sized>(self, _: &T) -> Result<(), MapKeyError> {
        Err(non_string("option"))
    }

    fn serialize_unit(self) -> Result<(), MapKeyError> {
        Err(non_string("unit"))
    }

    fn serialize_unit_struct(self, name: &'static str) -> Result<(), MapKeyError> {
        Err(non_string(name))
    }

    fn serialize_unit_variant(
        self,
        _: &'static str,
        _: u32,
        _: &'static str,
    ) -> Result<(), MapKeyError> {
        Ok(())
    }

    fn serialize_newtype_struct<T: Serialize + ?Sized>(
        self,
        _: &'static str,
        value: &T,
    ) -> Result<(), MapKeyError> {
        value.serialize(self)
    }

    fn serialize_newtype_variant<T: Serialize + ?Sized>(
        self,
        _: &'static str,
        _: u32,
        variant: &'static str,
        _: &T,
    ) -> Result<(), MapKeyError> {
        Err(non_string(variant))
    }

    fn serialize_seq(self, _: Option<usize>) -> Result<Self::SerializeSeq, MapKeyError> {
        Err(non_string("sequence"))
    }

    fn serialize_tuple(self, _: usize) -> Result<Self::SerializeTuple, MapKeyError> {
        Err(non_string("tuple"))
    }

    fn serialize_tuple_struct(
        self,
        name: &'static str,
        _: usize,
    ) -> Result<Self::SerializeTupleStruct, MapKeyError> {
        Err(non_string(name))
    }

    fn serialize_tuple_variant(
        self,
        _: &'static str,
        _: u32,
        variant: &'static str,
        _: usize,
    ) -> Result<Self::SerializeTupleVariant, MapKeyError> {
        Err(non_string(variant))
    }

    fn serialize_map(self, _: Option<usize>) -> Result<Self::SerializeMap, MapKeyError> {
        Err(non_string("map"))
    }

    fn serialize_struct(
        self,
        name: &'static str,
        _: usize,
    ) -> Result<Self::SerializeStruct, MapKeyError> {
        Err(non_string(name))
    }

    fn serialize_struct_variant(
        self,
        _: &'static str,
        _: u32,
        variant: &'static str,
        _: usize,
    ) -> Result<Self::SerializeStructVariant, MapKeyError> {
        Err(non_string(variant))
    }
}
