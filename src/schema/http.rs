//! Derivation of REST mappings from `google.api.http` annotations.
//!
//! At descriptor-parse time every annotated method is turned into an
//! [`HttpOptions`]: a verb, a URI template with positional placeholders
//! and a body-field selection. Fields claimed by neither the URI nor the
//! body are appended as query parameters, recursively flattening nested
//! messages with dot-joined names. At call time the template is filled
//! in from the bound message and the consumed fields are cleared so they
//! are not duplicated in the body.

use std::collections::HashMap;

use prost_reflect::{
    DynamicMessage, FileDescriptor, Kind, MessageDescriptor, MethodDescriptor, ReflectMessage,
    Value as ProtoValue,
};
use regex::Regex;
use serde_json::Value;

use crate::error::{BridgeError, Result};

use super::convert::{self, fields_in_order};
use super::proto::ProtoDescriptor;

const HTTP_OPTION: &str = "google.api.http";
const WILDCARD_BODY: &str = "*";

/// One ready-to-send request shape: verb, relative URI and optional
/// JSON body.
#[derive(Debug, Clone, PartialEq)]
pub struct HttpConnMeta {
    pub method: String,
    /// Relative path, always starting with `/`.
    pub uri: String,
    pub body: Option<Vec<u8>>,
}

#[derive(Debug, Clone)]
pub(crate) struct HttpOptions {
    pub method: String,
    pub uri_template: UriTemplate,
    pub body_field: String,
}

#[derive(Debug, Clone, Default)]
pub(crate) struct UriTemplate {
    /// Literal URI with `%s` markers, one per entry in `fields`.
    pub template: String,
    pub fields: Vec<TemplateField>,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct TemplateField {
    pub name: String,
    pub prefix: Option<String>,
}

/// Extracts the HTTP mapping of every annotated method in the file.
pub(crate) fn parse_http_options(
    fd: &FileDescriptor,
) -> Result<HashMap<String, HttpOptions>> {
    let mut options_map = HashMap::new();
    for service in fd.services() {
        for method in service.methods() {
            if let Some(ho) = parse_method_options(&method)? {
                options_map.insert(method.name().to_string(), ho);
            }
        }
    }
    Ok(options_map)
}

fn parse_method_options(method: &MethodDescriptor) -> Result<Option<HttpOptions>> {
    let options = method.options();
    for (ext, val) in options.extensions() {
        if ext.full_name() != HTTP_OPTION {
            continue;
        }
        let rule = val.as_message().ok_or_else(|| {
            BridgeError::mapping(format!(
                "invalid http option for method {} in proto",
                method.name()
            ))
        })?;
        let mut verb = None;
        let mut uri_opt = String::new();
        let mut body_opt = String::new();
        for field in rule.descriptor().fields() {
            if !rule.has_field(&field) {
                continue;
            }
            let fv = rule.get_field(&field);
            match field.name() {
                "get" => {
                    verb = Some("GET");
                    uri_opt = string_option(field.name(), &fv)?;
                }
                "put" => {
                    verb = Some("PUT");
                    uri_opt = string_option(field.name(), &fv)?;
                }
                "post" => {
                    verb = Some("POST");
                    uri_opt = string_option(field.name(), &fv)?;
                }
                "delete" => {
                    verb = Some("DELETE");
                    uri_opt = string_option(field.name(), &fv)?;
                }
                "patch" => {
                    verb = Some("PATCH");
                    uri_opt = string_option(field.name(), &fv)?;
                }
                "body" => {
                    body_opt = string_option(field.name(), &fv)?;
                }
                other => {
                    return Err(BridgeError::mapping(format!("unsupported option {other}")));
                }
            }
        }
        let Some(verb) = verb else {
            return Err(BridgeError::mapping(format!(
                "no http verb in option for method {} in proto",
                method.name()
            )));
        };
        return Ok(Some(convert_uri(method, verb, &uri_opt, &body_opt)?));
    }
    Ok(None)
}

fn string_option(name: &str, v: &ProtoValue) -> Result<String> {
    v.as_str().map(|s| s.to_string()).ok_or_else(|| {
        BridgeError::mapping(format!("invalid type for {name} option, string required"))
    })
}

/// Builds the URI template for one method: validates placeholders
/// against the input type, claims the body field and flattens the
/// leftovers into query parameters.
fn convert_uri(
    method: &MethodDescriptor,
    verb: &str,
    uri_opt: &str,
    body_opt: &str,
) -> Result<HttpOptions> {
    let input = method.input();
    // true = field still unclaimed by the URI or the body
    let mut fmap: HashMap<String, bool> = input
        .fields()
        .map(|f| (f.name().to_string(), true))
        .collect();

    let re = Regex::new(r"\{(.*?)\}").unwrap();
    let mut template = UriTemplate {
        template: re.replace_all(uri_opt, "%s").into_owned(),
        fields: Vec::new(),
    };
    for cap in re.captures_iter(uri_opt) {
        let inner = &cap[1];
        let parts: Vec<&str> = inner.split('=').collect();
        let field = match parts.as_slice() {
            [name] => TemplateField {
                name: name.to_string(),
                prefix: None,
            },
            [name, pattern] if pattern.ends_with('*') => TemplateField {
                name: name.to_string(),
                prefix: Some(pattern[..pattern.len() - 1].to_string()),
            },
            _ => {
                return Err(BridgeError::mapping(format!(
                    "invalid uri {uri_opt} in http option"
                )))
            }
        };
        match fmap.get_mut(&field.name) {
            Some(available) => *available = false,
            None => {
                return Err(BridgeError::mapping(format!(
                    "invalid uri {uri_opt} in http option, {} field not found",
                    field.name
                )))
            }
        }
        template.fields.push(field);
    }

    if body_opt != WILDCARD_BODY {
        if !body_opt.is_empty() {
            match input.get_field_by_name(body_opt) {
                Some(f) if matches!(f.kind(), Kind::Message(_)) && !f.is_list() => {
                    fmap.insert(body_opt.to_string(), false);
                }
                Some(_) => {
                    return Err(BridgeError::mapping(format!(
                        "invalid body field {body_opt}, must be a message"
                    )))
                }
                None => {
                    return Err(BridgeError::mapping(format!(
                        "invalid body {body_opt}, field not found"
                    )))
                }
            }
        }
        let mut param_added = false;
        append_query_params(&mut template, &input, "", &fmap, &mut param_added);
    }

    Ok(HttpOptions {
        method: verb.to_string(),
        uri_template: template,
        body_field: body_opt.to_string(),
    })
}

fn append_query_params(
    template: &mut UriTemplate,
    desc: &MessageDescriptor,
    prefix: &str,
    fmap: &HashMap<String, bool>,
    param_added: &mut bool,
) {
    for field in fields_in_order(desc) {
        // top-level fields must be unclaimed; nested fields always join
        let available = !prefix.is_empty() || fmap.get(field.name()).copied().unwrap_or(false);
        if !available {
            continue;
        }
        if let Kind::Message(inner) = field.kind() {
            let nested = format!("{prefix}{}.", field.name());
            append_query_params(template, &inner, &nested, fmap, param_added);
            continue;
        }
        let joiner = if *param_added { "&" } else { "?" };
        *param_added = true;
        template.template = format!(
            "{}{joiner}{prefix}{}=%s",
            template.template,
            field.name()
        );
        template.fields.push(TemplateField {
            name: format!("{prefix}{}", field.name()),
            prefix: None,
        });
    }
}

impl ProtoDescriptor {
    /// Builds the concrete request for one call: binds the parameters,
    /// substitutes URI placeholders, enforces prefix constraints and
    /// serializes the selected body. Methods without an annotation fall
    /// back to `POST /<method>` with the whole message as JSON body.
    pub fn convert_http_mapping(&self, method: &str, params: &[Value]) -> Result<HttpConnMeta> {
        let Some(ho) = self.http_options().get(method) else {
            return Ok(HttpConnMeta {
                method: "POST".to_string(),
                uri: format!("/{method}"),
                body: Some(self.params_to_json(method, params)?),
            });
        };
        let mut message = self.params_to_message(method, params)?;
        let uri = if ho.uri_template.fields.is_empty() {
            ho.uri_template.template.clone()
        } else {
            let mut args = Vec::with_capacity(ho.uri_template.fields.len());
            for field in &ho.uri_template.fields {
                let fv = get_field_with_dots(&message, &field.name)?;
                let mut arg = proto_value_to_string(&fv).ok_or_else(|| {
                    BridgeError::mapping(format!(
                        "invalid field {}({fv:?}) as http option, must be string",
                        field.name
                    ))
                })?;
                // Consumed by the URI; keep it out of the body.
                if let Some(level1) = field.name.split('.').next() {
                    message.clear_field_by_name(level1);
                }
                if let Some(prefix) = &field.prefix {
                    match arg.strip_prefix(prefix.as_str()) {
                        Some(rest) => arg = rest.to_string(),
                        None => {
                            return Err(BridgeError::mapping(format!(
                                "invalid field {}({arg}) as http option, must have prefix {prefix}",
                                field.name
                            )))
                        }
                    }
                }
                args.push(arg);
            }
            substitute(&ho.uri_template.template, &args)
        };
        let body = match ho.body_field.as_str() {
            WILDCARD_BODY => Some(convert::message_to_json(&message)?),
            "" => None,
            name => {
                let fv = message.get_field_by_name(name).ok_or_else(|| {
                    BridgeError::mapping(format!("invalid body field {name}, must be a message"))
                })?;
                match fv.as_ref() {
                    ProtoValue::Message(body_message) => {
                        Some(convert::message_to_json(body_message)?)
                    }
                    _ => {
                        return Err(BridgeError::mapping(format!(
                            "invalid body field {name}, must be a message"
                        )))
                    }
                }
            }
        };
        Ok(HttpConnMeta {
            method: ho.method.clone(),
            uri,
            body,
        })
    }
}

/// Resolves a dot-joined field path against a message.
fn get_field_with_dots(message: &DynamicMessage, name: &str) -> Result<ProtoValue> {
    let mut current = message.clone();
    let sections: Vec<&str> = name.split('.').collect();
    for (i, section) in sections.iter().enumerate() {
        let v = current
            .get_field_by_name(section)
            .ok_or_else(|| BridgeError::mapping(format!("fail to find field {name}")))?;
        if i == sections.len() - 1 {
            return Ok(v.into_owned());
        }
        match v.into_owned() {
            ProtoValue::Message(m) => current = m,
            _ => return Err(BridgeError::mapping(format!("fail to find field {name}"))),
        }
    }
    Err(BridgeError::mapping(format!("fail to find field {name}")))
}

fn proto_value_to_string(v: &ProtoValue) -> Option<String> {
    match v {
        ProtoValue::String(s) => Some(s.clone()),
        ProtoValue::Bool(b) => Some(b.to_string()),
        ProtoValue::I32(i) => Some(i.to_string()),
        ProtoValue::I64(i) => Some(i.to_string()),
        ProtoValue::U32(u) => Some(u.to_string()),
        ProtoValue::U64(u) => Some(u.to_string()),
        ProtoValue::F32(f) => Some(f.to_string()),
        ProtoValue::F64(f) => Some(f.to_string()),
        _ => None,
    }
}

/// Fills the `%s` markers of a template with positional arguments.
fn substitute(template: &str, args: &[String]) -> String {
    let mut out = String::with_capacity(template.len());
    let mut parts = template.split("%s");
    if let Some(first) = parts.next() {
        out.push_str(first);
    }
    for (part, arg) in parts.zip(args) {
        out.push_str(arg);
        out.push_str(part);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil;
    use serde_json::json;

    fn hw() -> ProtoDescriptor {
        ProtoDescriptor::parse("hw.proto", &[testutil::schema_dir()]).unwrap()
    }

    fn messaging() -> ProtoDescriptor {
        ProtoDescriptor::parse("messaging.proto", &[testutil::schema_dir()]).unwrap()
    }

    #[test]
    fn test_default_mapping() {
        let d = hw();
        let hm = d
            .convert_http_mapping("SayHello", &[json!("world")])
            .unwrap();
        assert_eq!(hm.method, "POST");
        assert_eq!(hm.uri, "/SayHello");
        assert_eq!(hm.body.unwrap(), br#"{"name":"world"}"#.to_vec());
    }

    #[test]
    fn test_get_with_prefix() {
        let d = messaging();
        let hm = d
            .convert_http_mapping("GetMessage", &[json!("messages/123456")])
            .unwrap();
        assert_eq!(hm.method, "GET");
        assert_eq!(hm.uri, "/v1/messages/123456");
        assert_eq!(hm.body, None);
    }

    #[test]
    fn test_get_prefix_mismatch_fails_before_send() {
        let d = messaging();
        let err = d
            .convert_http_mapping("GetMessage", &[json!("message/123456")])
            .unwrap_err();
        assert!(
            err.message().contains("must have prefix messages/"),
            "unexpected error: {err}"
        );
    }

    #[test]
    fn test_query_parameter_flattening() {
        let d = messaging();
        let params = json!({"name": "n1", "revision": "2", "sub": {"subfield": "sub1"}});
        let hm = d.convert_http_mapping("SearchMessage", &[params]).unwrap();
        assert_eq!(hm.method, "GET");
        assert_eq!(hm.uri, "/v1/messages/filter/n1?revision=2&sub.subfield=sub1");
        assert_eq!(hm.body, None);
    }

    #[test]
    fn test_named_body_field() {
        let d = messaging();
        let params = json!({"message_id": "123", "message": {"text": "hi"}});
        let hm = d.convert_http_mapping("UpdateMessage", &[params]).unwrap();
        assert_eq!(hm.method, "PUT");
        assert_eq!(hm.uri, "/v1/messages/123");
        assert_eq!(hm.body.unwrap(), br#"{"text":"hi"}"#.to_vec());
    }

    #[test]
    fn test_wildcard_body_excludes_uri_fields() {
        let d = messaging();
        let params = json!({"message_id": "123", "message": {"text": "hi"}});
        let hm = d.convert_http_mapping("PatchMessage", &[params]).unwrap();
        assert_eq!(hm.method, "PATCH");
        assert_eq!(hm.uri, "/v1/messages/123");
        let body: Value = serde_json::from_slice(&hm.body.unwrap()).unwrap();
        // message_id was consumed by the URI and cleared from the body
        assert_eq!(body, json!({"message": {"text": "hi"}}));
    }

    #[test]
    fn test_post_wildcard_body() {
        let d = messaging();
        let hm = d
            .convert_http_mapping("CreateMessage", &[json!({"text": "hello"})])
            .unwrap();
        assert_eq!(hm.method, "POST");
        assert_eq!(hm.uri, "/v1/messages");
        assert_eq!(hm.body.unwrap(), br#"{"text":"hello"}"#.to_vec());
    }

    #[test]
    fn test_template_determinism() {
        let dir = testutil::schema_dir();
        let a = ProtoDescriptor::parse("messaging.proto", &[dir.clone()]).unwrap();
        let b = ProtoDescriptor::parse("messaging.proto", &[dir]).unwrap();
        let ta = &a.http_options()["SearchMessage"].uri_template;
        let tb = &b.http_options()["SearchMessage"].uri_template;
        assert_eq!(ta.template, tb.template);
        assert_eq!(ta.fields, tb.fields);
        assert_eq!(ta.template.matches("%s").count(), ta.fields.len());
    }

    #[test]
    fn test_unknown_placeholder_is_load_error() {
        let dir = testutil::schema_dir();
        std::fs::write(
            dir.join("bad_http.proto"),
            r#"syntax = "proto3";
package bad;
import "google/api/annotations.proto";
service Bad {
  rpc Get(GetRequest) returns (GetRequest) {
    option (google.api.http) = { get: "/v1/things/{nosuch}" };
  }
}
message GetRequest { string name = 1; }
"#,
        )
        .unwrap();
        let err = ProtoDescriptor::parse("bad_http.proto", &[dir]).unwrap_err();
        assert!(matches!(err, BridgeError::Mapping(_)));
        assert!(err.message().contains("nosuch field not found"));
    }

    #[test]
    fn test_substitute_counts() {
        assert_eq!(
            substitute("/a/%s/b?x=%s", &["1".into(), "2".into()]),
            "/a/1/b?x=2"
        );
        assert_eq!(substitute("/plain", &[]), "/plain");
    }
}
