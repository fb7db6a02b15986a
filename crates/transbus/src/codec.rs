//! Marshals values against a declared signature.
//!
//! By-value types go straight to transpack primitives. Objects travel as
//! References in the namespace of the connection doing the encoding, and come
//! back as local objects or proxies depending on who owns them.

use transpack::Decoder;
use transpack::Encoder;

use crate::connection::Connection;
use crate::error::Fault;
use crate::error::Result;
use crate::route::Route;
use crate::value::Type;
use crate::value::Value;

pub fn encode_values(enc: &mut Encoder, types: &[Type], values: &[Value], connection: &Connection) -> Result<()> {
    if types.len() != values.len() {
        let message = format!("expected {} values, got {}", types.len(), values.len());
        return Err(Fault::Encoding(message).into());
    }
    for (ty, value) in types.iter().zip(values) {
        encode_value(enc, ty, value, connection)?;
    }
    Ok(())
}

pub fn encode_value(enc: &mut Encoder, ty: &Type, value: &Value, connection: &Connection) -> Result<()> {
    match (ty, value) {
        (Type::Null, Value::Null) => {}
        (Type::Int32, Value::Int32(v)) => enc.int32(*v),
        (Type::String, Value::String(s)) => enc
            .string(s)
            .map_err(|e| Fault::Encoding(e.to_string()))?,
        (Type::Bytes, Value::Bytes(b)) => enc.bytes(b),
        (Type::Serial, Value::Serial(v)) => enc.serial(*v),
        (Type::Transverse, Value::Transverse(tid)) => enc.transverse(tid),
        (Type::Object(_), Value::Object(handle)) => {
            let reference = connection.object_to_reference(handle);
            enc.reference(&reference);
        }
        (Type::Tuple(types), Value::Tuple(values)) => encode_values(enc, types, values, connection)?,
        (ty, value) => {
            let message = format!("{} does not fit {:?}", value.kind(), ty);
            return Err(Fault::Encoding(message).into());
        }
    }
    Ok(())
}

pub fn decode_values(dec: &mut Decoder<'_>, types: &[Type], connection: &Connection, route: &Route) -> Result<Vec<Value>> {
    types
        .iter()
        .map(|ty| decode_value(dec, ty, connection, route))
        .collect()
}

pub fn decode_value(dec: &mut Decoder<'_>, ty: &Type, connection: &Connection, route: &Route) -> Result<Value> {
    let value = match ty {
        Type::Null => Value::Null,
        Type::Int32 => Value::Int32(dec.int32()?),
        Type::String => Value::String(dec.string()?.to_string()),
        Type::Bytes => Value::Bytes(dec.bytes()?.to_vec()),
        Type::Serial => Value::Serial(dec.serial()?),
        Type::Transverse => Value::Transverse(dec.transverse()?),
        Type::Object(capability) => {
            let reference = dec.reference()?;
            Value::Object(connection.reference_to_object(reference, capability, route)?)
        }
        Type::Tuple(types) => Value::Tuple(decode_values(dec, types, connection, route)?),
    };
    Ok(value)
}
