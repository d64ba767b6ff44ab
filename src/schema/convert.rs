//! Conversion between generic values and typed protobuf messages.
//!
//! Parameter binding follows three shapes: an empty call binds an empty
//! message, a single map parameter is unfolded onto fields by name, and
//! anything else binds positionally in field order. Return decoding
//! unwraps well-known wrapper types to bare scalars and turns every
//! other message into a string-keyed map.

use log::debug;
use prost_reflect::{
    DynamicMessage, FieldDescriptor, Kind, MessageDescriptor, ReflectMessage, SerializeOptions,
    Value as ProtoValue,
};
use serde_json::{Map, Value};

use crate::error::{BridgeError, Result};
use crate::value::{self, Row, Strictness};

use super::proto::{ProtoDescriptor, EMPTY_TYPE, WRAPPER_STRING, WRAPPER_TYPES};

fn is_wrapper(desc: &MessageDescriptor) -> bool {
    WRAPPER_TYPES.contains(&desc.full_name())
}

pub(crate) fn fields_in_order(desc: &MessageDescriptor) -> Vec<FieldDescriptor> {
    let mut fields: Vec<_> = desc.fields().collect();
    fields.sort_by_key(|f| f.number());
    fields
}

impl ProtoDescriptor {
    /// Binds `params` against the input type of `method`, returning one
    /// typed value per message field in field order.
    pub fn convert_params(&self, method: &str, params: &[Value]) -> Result<Vec<ProtoValue>> {
        let m = self.method_or_err(method)?;
        self.bind_fields(&m.input(), params)
    }

    /// Binds `params` into a dynamic message of the method's input type.
    pub fn params_to_message(&self, method: &str, params: &[Value]) -> Result<DynamicMessage> {
        let m = self.method_or_err(method)?;
        let input = m.input();
        let typed = self.bind_fields(&input, params)?;
        let mut message = DynamicMessage::new(input.clone());
        for (field, v) in fields_in_order(&input).iter().zip(typed) {
            message.set_field(field, v);
        }
        Ok(message)
    }

    /// Binds `params` and serializes the resulting message as JSON. A
    /// single parameter against a `StringValue` input is passed through
    /// verbatim, so pre-encoded JSON strings survive untouched.
    pub fn params_to_json(&self, method: &str, params: &[Value]) -> Result<Vec<u8>> {
        if params.len() == 1 {
            let m = self.method_or_err(method)?;
            if m.input().full_name() == WRAPPER_STRING {
                let s = value::to_string_value(&params[0], Strictness::Strict)
                    .map_err(|e| BridgeError::binding(e.to_string()))?;
                return Ok(s.into_bytes());
            }
        }
        let message = self.params_to_message(method, params)?;
        message_to_json(&message)
    }

    /// Decodes a dynamic response message into a generic value.
    pub fn return_from_message(&self, method: &str, message: &DynamicMessage) -> Result<Value> {
        self.method_or_err(method)?;
        Ok(decode_message(message))
    }

    /// Decodes a JSON response body against the method's output type.
    pub fn return_from_json(&self, method: &str, data: &[u8]) -> Result<Value> {
        let m = self.method_or_err(method)?;
        let map: Map<String, Value> = serde_json::from_slice(data)
            .map_err(|e| BridgeError::invocation(e.to_string()))?;
        decode_map(&map, &m.output(), Strictness::SameKind)
    }

    /// Decodes a `text/plain` response through the wrapper-type path.
    pub fn return_from_text(&self, method: &str, data: &[u8]) -> Result<Value> {
        let m = self.method_or_err(method)?;
        let output = m.output();
        if !is_wrapper(&output) {
            return Err(BridgeError::invocation(format!(
                "fail to convert return val to text, return type must be primitive type but got {}",
                output.name()
            )));
        }
        let field = wrapper_field(&output)?;
        let text = String::from_utf8_lossy(data).into_owned();
        decode_json_field(&Value::String(text), &field, Strictness::ConvertAll)
    }

    /// Decodes an already-generic return value (the msgpack-rpc path).
    pub fn return_from_value(&self, method: &str, val: &Value) -> Result<Value> {
        let m = self.method_or_err(method)?;
        let output = m.output();
        if is_wrapper(&output) {
            let field = wrapper_field(&output)?;
            return decode_json_field(val, &field, Strictness::Strict);
        }
        match val {
            Value::Object(map) => decode_map(map, &output, Strictness::SameKind),
            other => Err(BridgeError::invocation(format!(
                "fail to convert return val, must be a map but got {other}"
            ))),
        }
    }

    fn bind_fields(&self, input: &MessageDescriptor, params: &[Value]) -> Result<Vec<ProtoValue>> {
        let fields = fields_in_order(input);
        match params.len() {
            0 => {
                if fields.is_empty() {
                    Ok(Vec::new())
                } else {
                    Err(BridgeError::binding(format!(
                        "require {} parameters but none",
                        fields.len()
                    )))
                }
            }
            1 => {
                match self.unfold(&fields, &params[0]) {
                    Ok(r) => return Ok(r),
                    Err(e) => {
                        debug!("try unfold param for message {} fail: {e}", input.name())
                    }
                }
                if fields.len() == 1 {
                    Ok(vec![self.encode_field(&fields[0], &params[0])?])
                } else {
                    Err(BridgeError::binding(format!(
                        "require {} parameters but only got 1",
                        fields.len()
                    )))
                }
            }
            n => {
                if fields.len() == n {
                    fields
                        .iter()
                        .zip(params)
                        .map(|(field, v)| self.encode_field(field, v))
                        .collect()
                } else {
                    Err(BridgeError::binding(format!(
                        "require {} parameters but only got {n}",
                        fields.len()
                    )))
                }
            }
        }
    }

    /// Binds a single map parameter onto fields by name.
    fn unfold(&self, fields: &[FieldDescriptor], param: &Value) -> Result<Vec<ProtoValue>> {
        let Value::Object(map) = param else {
            return Err(BridgeError::binding("not a map"));
        };
        let mut result = Vec::with_capacity(fields.len());
        for field in fields {
            let v = map
                .value(field.name())
                .ok_or_else(|| BridgeError::binding(format!("field {} not found", field.name())))?;
            result.push(self.encode_field(field, v)?);
        }
        Ok(result)
    }

    fn encode_field(&self, field: &FieldDescriptor, v: &Value) -> Result<ProtoValue> {
        if field.is_map() {
            return Err(BridgeError::binding(format!(
                "invalid type for field '{}'",
                field.name()
            )));
        }
        if field.is_list() {
            return self.encode_repeated(field, v);
        }
        self.encode_single(field, v)
    }

    fn encode_repeated(&self, field: &FieldDescriptor, v: &Value) -> Result<ProtoValue> {
        let fname = field.name();
        let sn = Strictness::Strict;
        let items = match field.kind() {
            Kind::Double => value::to_typed_slice(v, value::to_f64, "float64", sn)
                .map(|s| s.into_iter().map(ProtoValue::F64).collect()),
            Kind::Float => value::to_typed_slice(v, value::to_f64, "float", sn)
                .map(|s| s.into_iter().map(|f| ProtoValue::F32(f as f32)).collect()),
            Kind::Int32 | Kind::Sint32 | Kind::Sfixed32 => {
                value::to_typed_slice(v, value::to_i64, "int", sn)
                    .map(|s| s.into_iter().map(|i| ProtoValue::I32(i as i32)).collect())
            }
            Kind::Int64 | Kind::Sint64 | Kind::Sfixed64 => {
                value::to_typed_slice(v, value::to_i64, "int", sn)
                    .map(|s| s.into_iter().map(ProtoValue::I64).collect())
            }
            Kind::Uint32 | Kind::Fixed32 => value::to_typed_slice(v, value::to_u64, "uint", sn)
                .map(|s| s.into_iter().map(|u| ProtoValue::U32(u as u32)).collect()),
            Kind::Uint64 | Kind::Fixed64 => value::to_typed_slice(v, value::to_u64, "uint", sn)
                .map(|s| s.into_iter().map(ProtoValue::U64).collect()),
            Kind::Bool => value::to_typed_slice(v, value::to_bool, "bool", sn)
                .map(|s| s.into_iter().map(ProtoValue::Bool).collect()),
            Kind::String => value::to_typed_slice(v, value::to_string_value, "string", sn)
                .map(|s| s.into_iter().map(ProtoValue::String).collect()),
            Kind::Bytes => value::to_typed_slice(v, value::to_bytes, "bytes", sn)
                .map(|s| s.into_iter().map(|b| ProtoValue::Bytes(b.into())).collect()),
            Kind::Message(inner) => {
                let Value::Array(elems) = v else {
                    return Err(BridgeError::binding(format!(
                        "failed to encode field '{fname}': cannot convert to map slice"
                    )));
                };
                let mut out = Vec::with_capacity(elems.len());
                for elem in elems {
                    let m = self.encode_message_map(&inner, elem)?;
                    out.push(ProtoValue::Message(m));
                }
                return Ok(ProtoValue::List(out));
            }
            _ => {
                return Err(BridgeError::binding(format!(
                    "invalid type for field '{fname}'"
                )))
            }
        };
        items
            .map(ProtoValue::List)
            .map_err(|e| BridgeError::binding(format!("failed to encode field '{fname}': {e}")))
    }

    fn encode_single(&self, field: &FieldDescriptor, v: &Value) -> Result<ProtoValue> {
        let fname = field.name();
        let sn = Strictness::Strict;
        let typed = |label: &str, e: value::CastError| {
            BridgeError::binding(format!("invalid type for {label} type field '{fname}': {e}"))
        };
        match field.kind() {
            Kind::Double => value::to_f64(v, sn)
                .map(ProtoValue::F64)
                .map_err(|e| typed("float", e)),
            Kind::Float => value::to_f64(v, sn)
                .map(|f| ProtoValue::F32(f as f32))
                .map_err(|e| typed("float", e)),
            Kind::Int32 | Kind::Sint32 | Kind::Sfixed32 => value::to_i64(v, sn)
                .map(|i| ProtoValue::I32(i as i32))
                .map_err(|e| typed("int", e)),
            Kind::Int64 | Kind::Sint64 | Kind::Sfixed64 => value::to_i64(v, sn)
                .map(ProtoValue::I64)
                .map_err(|e| typed("int", e)),
            Kind::Uint32 | Kind::Fixed32 => value::to_u64(v, sn)
                .map(|u| ProtoValue::U32(u as u32))
                .map_err(|e| typed("uint", e)),
            Kind::Uint64 | Kind::Fixed64 => value::to_u64(v, sn)
                .map(ProtoValue::U64)
                .map_err(|e| typed("uint", e)),
            Kind::Bool => value::to_bool(v, sn)
                .map(ProtoValue::Bool)
                .map_err(|e| typed("bool", e)),
            Kind::String => value::to_string_value(v, sn)
                .map(ProtoValue::String)
                .map_err(|e| typed("string", e)),
            Kind::Bytes => value::to_bytes(v, sn)
                .map(|b| ProtoValue::Bytes(b.into()))
                .map_err(|e| typed("bytes", e)),
            Kind::Message(inner) => match v {
                Value::Object(_) => self.encode_message_map(&inner, v).map(ProtoValue::Message),
                other => Err(BridgeError::binding(format!(
                    "invalid type for map type field '{fname}': cannot convert {other} to map"
                ))),
            },
            _ => Err(BridgeError::binding(format!(
                "invalid type for field '{fname}'"
            ))),
        }
    }

    /// Encodes a map value into a nested message; every declared field
    /// must be present in the map.
    fn encode_message_map(&self, desc: &MessageDescriptor, v: &Value) -> Result<DynamicMessage> {
        let Value::Object(map) = v else {
            return Err(BridgeError::binding(format!(
                "cannot convert {v} to map"
            )));
        };
        let mut message = DynamicMessage::new(desc.clone());
        for field in desc.fields() {
            let fv = map
                .value(field.name())
                .ok_or_else(|| BridgeError::binding(format!("field {} not found", field.name())))?;
            let encoded = self.encode_field(&field, fv)?;
            message.set_field(&field, encoded);
        }
        Ok(message)
    }
}

/// Serializes a dynamic message as JSON using proto field names and
/// plain numbers for 64-bit integers.
pub(crate) fn message_to_json(message: &DynamicMessage) -> Result<Vec<u8>> {
    let options = SerializeOptions::new()
        .use_proto_field_name(true)
        .stringify_64_bit_integers(false);
    let mut buf = Vec::new();
    let mut serializer = serde_json::Serializer::new(&mut buf);
    message
        .serialize_with_options(&mut serializer, &options)
        .map_err(|e| BridgeError::invocation(format!("failed to encode message to json: {e}")))?;
    Ok(buf)
}

fn wrapper_field(desc: &MessageDescriptor) -> Result<FieldDescriptor> {
    desc.get_field(1).ok_or_else(|| {
        BridgeError::schema(format!("wrapper type {} has no value field", desc.full_name()))
    })
}

/// Decodes a dynamic message into a generic value: wrapper types become
/// their bare scalar, the empty type becomes null, everything else a map.
pub(crate) fn decode_message(message: &DynamicMessage) -> Value {
    let desc = message.descriptor();
    if is_wrapper(&desc) {
        if let Some(field) = desc.get_field(1) {
            return proto_value_to_json(&message.get_field(&field));
        }
    }
    if desc.full_name() == EMPTY_TYPE {
        return Value::Null;
    }
    let mut out = Map::new();
    for field in fields_in_order(&desc) {
        out.insert(
            field.name().to_string(),
            proto_value_to_json(&message.get_field(&field)),
        );
    }
    Value::Object(out)
}

/// Converts a typed protobuf value into a generic value.
pub(crate) fn proto_value_to_json(v: &ProtoValue) -> Value {
    match v {
        ProtoValue::Bool(b) => Value::from(*b),
        ProtoValue::I32(i) => Value::from(i64::from(*i)),
        ProtoValue::I64(i) => Value::from(*i),
        ProtoValue::U32(u) => Value::from(u64::from(*u)),
        ProtoValue::U64(u) => Value::from(*u),
        ProtoValue::F32(f) => Value::from(f64::from(*f)),
        ProtoValue::F64(f) => Value::from(*f),
        ProtoValue::String(s) => Value::from(s.clone()),
        ProtoValue::Bytes(b) => bytes_to_value(b),
        ProtoValue::EnumNumber(n) => Value::from(i64::from(*n)),
        ProtoValue::Message(m) => decode_message(m),
        ProtoValue::List(items) => Value::Array(items.iter().map(proto_value_to_json).collect()),
        ProtoValue::Map(entries) => {
            let mut out = Map::new();
            for (k, val) in entries {
                out.insert(map_key_to_string(k), proto_value_to_json(val));
            }
            Value::Object(out)
        }
    }
}

pub(crate) fn map_key_to_string(k: &prost_reflect::MapKey) -> String {
    use prost_reflect::MapKey;
    match k {
        MapKey::Bool(b) => b.to_string(),
        MapKey::I32(i) => i.to_string(),
        MapKey::I64(i) => i.to_string(),
        MapKey::U32(u) => u.to_string(),
        MapKey::U64(u) => u.to_string(),
        MapKey::String(s) => s.clone(),
    }
}

fn bytes_to_value(b: &[u8]) -> Value {
    use base64::Engine;
    match std::str::from_utf8(b) {
        Ok(s) => Value::from(s.to_string()),
        Err(_) => Value::from(base64::engine::general_purpose::STANDARD.encode(b)),
    }
}

/// Decodes a generic map against a message descriptor; fields absent
/// from the source are skipped.
pub(crate) fn decode_map(
    src: &Map<String, Value>,
    desc: &MessageDescriptor,
    sn: Strictness,
) -> Result<Value> {
    let mut out = Map::new();
    for field in fields_in_order(desc) {
        let Some(v) = src.get(field.name()) else {
            continue;
        };
        out.insert(field.name().to_string(), decode_json_field(v, &field, sn)?);
    }
    Ok(Value::Object(out))
}

/// Decodes one generic value against a field descriptor, applying the
/// provenance-dependent strictness.
pub(crate) fn decode_json_field(
    src: &Value,
    field: &FieldDescriptor,
    sn: Strictness,
) -> Result<Value> {
    let fname = field.name();
    let wrap =
        |e: String| BridgeError::invocation(format!("invalid type of return value for '{fname}': {e}"));
    if field.is_list() {
        let Value::Array(items) = src else {
            return Err(wrap(format!("cannot convert {src} to list")));
        };
        let mut out = Vec::with_capacity(items.len());
        for item in items {
            out.push(decode_scalar(item, field, sn).map_err(&wrap)?);
        }
        return Ok(Value::Array(out));
    }
    decode_scalar(src, field, sn).map_err(&wrap)
}

fn decode_scalar(
    src: &Value,
    field: &FieldDescriptor,
    sn: Strictness,
) -> std::result::Result<Value, String> {
    match field.kind() {
        Kind::Double | Kind::Float => value::to_f64(src, sn)
            .map(Value::from)
            .map_err(|e| e.to_string()),
        Kind::Int32
        | Kind::Sint32
        | Kind::Sfixed32
        | Kind::Int64
        | Kind::Sint64
        | Kind::Sfixed64
        | Kind::Fixed32
        | Kind::Uint32
        | Kind::Fixed64
        | Kind::Uint64 => value::to_i64(src, sn)
            .map(Value::from)
            .map_err(|e| e.to_string()),
        Kind::Bool => value::to_bool(src, sn)
            .map(Value::from)
            .map_err(|e| e.to_string()),
        Kind::String => value::to_string_value(src, sn)
            .map(Value::from)
            .map_err(|e| e.to_string()),
        Kind::Bytes => value::to_bytes(src, sn)
            .map(|b| bytes_to_value(&b))
            .map_err(|e| e.to_string()),
        Kind::Message(inner) => match src {
            Value::Object(map) => {
                decode_map(map, &inner, sn).map_err(|e| e.message().to_string())
            }
            other => Err(format!("cannot decode {other} to map")),
        },
        _ => Err(format!("unsupported type for {}", field.name())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil;
    use serde_json::json;

    fn descriptor() -> ProtoDescriptor {
        let dir = testutil::schema_dir();
        ProtoDescriptor::parse("hw.proto", &[dir]).unwrap()
    }

    #[test]
    fn test_convert_params_positional_and_unfold() {
        let d = descriptor();
        let bare = d.convert_params("SayHello", &[json!("world")]).unwrap();
        let named = d
            .convert_params("SayHello", &[json!({"name": "world"})])
            .unwrap();
        // Single-field unfold law: both shapes bind identically.
        assert_eq!(bare, named);
        assert_eq!(bare, vec![ProtoValue::String("world".into())]);
    }

    #[test]
    fn test_convert_params_unfold_mismatch_falls_through() {
        let d = descriptor();
        let err = d
            .convert_params("SayHello", &[json!({"arbitrary": "world"})])
            .unwrap_err();
        assert!(
            err.message()
                .starts_with("invalid type for string type field 'name'"),
            "unexpected error: {err}"
        );
    }

    #[test]
    fn test_convert_params_arity_errors() {
        let d = descriptor();
        let err = d.convert_params("SayHello", &[]).unwrap_err();
        assert_eq!(err.message(), "require 1 parameters but none");
        let err = d
            .convert_params("Compute", &[json!("a"), json!("b")])
            .unwrap_err();
        assert_eq!(err.message(), "require 6 parameters but only got 2");
        let err = d.convert_params("Compute", &[json!("only")]).unwrap_err();
        assert_eq!(err.message(), "require 6 parameters but only got 1");
    }

    #[test]
    fn test_params_to_json_default_body() {
        let d = descriptor();
        let body = d.params_to_json("SayHello", &[json!("world")]).unwrap();
        assert_eq!(body, br#"{"name":"world"}"#.to_vec());

        let body = d
            .params_to_json(
                "Compute",
                &[
                    json!("rid"),
                    json!("uuid"),
                    json!("outlet"),
                    json!("path"),
                    json!("data"),
                    json!("extra"),
                ],
            )
            .unwrap();
        let parsed: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(parsed["rid"], json!("rid"));
        // bytes fields serialize base64-encoded
        assert_eq!(parsed["data"], json!("ZGF0YQ=="));
    }

    #[test]
    fn test_params_to_json_string_value_passthrough() {
        let d = descriptor();
        let encoded = r#"{"name":"encoded json","size":1}"#;
        let body = d
            .params_to_json("RestEncodedJson", &[json!(encoded)])
            .unwrap();
        assert_eq!(body, encoded.as_bytes().to_vec());
    }

    #[test]
    fn test_return_from_value_map() {
        let d = descriptor();
        let out = d
            .return_from_value("SayHello", &json!({"message": "world"}))
            .unwrap();
        assert_eq!(out, json!({"message": "world"}));

        let err = d
            .return_from_value("SayHello", &json!({"message": 65}))
            .unwrap_err();
        assert!(err
            .message()
            .starts_with("invalid type of return value for 'message'"));
    }

    #[test]
    fn test_return_from_json_same_kind() {
        let d = descriptor();
        let out = d
            .return_from_json("Compute", br#"{"code":200,"msg":"success"}"#)
            .unwrap();
        assert_eq!(out, json!({"code": 200, "msg": "success"}));

        let err = d
            .return_from_json("SayHello", br#"{"message":65}"#)
            .unwrap_err();
        assert!(err
            .message()
            .starts_with("invalid type of return value for 'message'"));
    }

    #[test]
    fn test_return_from_text_wrapper() {
        let d = descriptor();
        let out = d.return_from_text("GetStatus", b"true").unwrap();
        assert_eq!(out, json!(true));

        let err = d.return_from_text("SayHello", b"whatever").unwrap_err();
        assert!(err.message().contains("must be primitive type"));
    }

    #[test]
    fn test_round_trip_params() {
        let d = descriptor();
        let message = d
            .params_to_message("SayHello", &[json!({"name": "world"})])
            .unwrap();
        let back = decode_message(&message);
        assert_eq!(back, json!({"name": "world"}));
    }

    #[test]
    fn test_decode_message_wrapper_and_empty() {
        let d = descriptor();
        let m = d.method("RestEncodedJson").unwrap();
        let mut reply = DynamicMessage::new(m.output());
        reply.set_field_by_number(1, ProtoValue::String("ok".into()));
        assert_eq!(decode_message(&reply), json!("ok"));

        let m = d.method("GetStatus").unwrap();
        let empty = DynamicMessage::new(m.input());
        assert_eq!(decode_message(&empty), Value::Null);
    }
}
