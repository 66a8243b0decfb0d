//! Event parameter coercion and validation.
//!
//! Each declared parameter is cast to its attribute's field type, checked
//! for presence, then validated against the schema's `range` rule. The
//! first failure produces the error envelope the invoker returns verbatim.

use dashmap::DashMap;
use matrix_protocol::{
    EntityAttribute, EntityEvent, Event, EventResponse, FieldType, ResponseCode,
};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Map, Number, Value};
use std::sync::Arc;

use crate::domain::DomainCache;
use crate::executor::CustomFieldParser;

static EMAIL_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}$").expect("static regex")
});
/// E.164: plus sign, then 7 to 15 digits not starting with zero.
static PHONE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\+[1-9][0-9]{6,14}$").expect("static regex"));
static URL_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^https?://\S+$").expect("static regex"));

/// Registered parsers for `custom` attribute fields, keyed by attribute code.
#[derive(Default)]
pub struct CustomParserRegistry {
    parsers: DashMap<String, Arc<dyn CustomFieldParser>>,
}

impl CustomParserRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, code: impl Into<String>, parser: Arc<dyn CustomFieldParser>) {
        self.parsers.insert(code.into(), parser);
    }

    fn get(&self, code: &str) -> Option<Arc<dyn CustomFieldParser>> {
        self.parsers.get(code).map(|entry| Arc::clone(entry.value()))
    }
}

/// Validate an event's params against its schema.
///
/// Returns the coerced parameter map; undeclared parameters pass through
/// untouched. The error case is a ready-to-send response envelope.
pub async fn validate_event_params(
    event: &Event,
    entity_event: &EntityEvent,
    attrs: &[EntityAttribute],
    domain: &DomainCache,
    custom: &CustomParserRegistry,
) -> Result<Map<String, Value>, EventResponse> {
    let mut params: Map<String, Value> = if event.params.trim().is_empty() {
        Map::new()
    } else {
        serde_json::from_str(&event.params).map_err(|_| {
            EventResponse::error(ResponseCode::InvalidParam, "params is not a JSON object")
        })?
    };

    for declared in entity_event.param_schema() {
        let attr = attrs.iter().find(|a| a.code == declared.code);
        let field_type = attr.map(|a| a.field_type).unwrap_or_default();

        let raw = match params.get(&declared.code) {
            Some(Value::Null) | None => {
                let default_value = attr.map(|a| a.default_value.as_str()).unwrap_or("");
                if !default_value.is_empty() {
                    Value::String(default_value.to_string())
                } else if declared.required {
                    return Err(EventResponse::error(
                        ResponseCode::MissingParam,
                        format!("missing param: {}", declared.code),
                    ));
                } else {
                    continue;
                }
            }
            Some(value) => value.clone(),
        };

        let coerced = cast(&declared.code, &raw, field_type, custom)
            .map_err(|msg| EventResponse::error(ResponseCode::InvalidParam, msg))?;

        check_range(event, attr, &declared.code, &declared.range, &coerced, domain)
            .await
            .map_err(|msg| EventResponse::error(ResponseCode::InvalidParam, msg))?;

        params.insert(declared.code.clone(), coerced);
    }

    Ok(params)
}

/// Coerce a raw JSON value to its declared field type.
fn cast(
    code: &str,
    value: &Value,
    field_type: FieldType,
    custom: &CustomParserRegistry,
) -> Result<Value, String> {
    if field_type == FieldType::Custom {
        let parser = custom
            .get(code)
            .ok_or_else(|| format!("no custom parser registered for {code}"))?;
        return parser.parse(code, value);
    }

    if field_type.is_string_like() {
        let s = match value {
            Value::String(s) => s.clone(),
            Value::Number(n) => n.to_string(),
            Value::Bool(b) => b.to_string(),
            _ => return Err(format!("{code} must be a string")),
        };
        return Ok(Value::String(s));
    }

    if field_type.is_integer() {
        let n = match value {
            Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    i
                } else {
                    return Err(format!("{code} must be an integer"));
                }
            }
            Value::String(s) => s
                .trim()
                .parse::<i64>()
                .map_err(|_| format!("{code} must be an integer"))?,
            _ => return Err(format!("{code} must be an integer")),
        };
        match field_type {
            FieldType::Int8 if !(-128..=127).contains(&n) => {
                return Err(format!("{code} is out of int8 range"))
            }
            FieldType::Int32 if i32::try_from(n).is_err() => {
                return Err(format!("{code} is out of int32 range"))
            }
            _ => {}
        }
        return Ok(Value::Number(Number::from(n)));
    }

    if field_type.is_float() {
        let f = match value {
            Value::Number(n) => n.as_f64().ok_or_else(|| format!("{code} must be a number"))?,
            Value::String(s) => s
                .trim()
                .parse::<f64>()
                .map_err(|_| format!("{code} must be a number"))?,
            _ => return Err(format!("{code} must be a number")),
        };
        return Number::from_f64(f)
            .map(Value::Number)
            .ok_or_else(|| format!("{code} must be a finite number"));
    }

    // Boolean
    match value {
        Value::Bool(b) => Ok(Value::Bool(*b)),
        Value::String(s) => match s.trim() {
            "true" | "1" => Ok(Value::Bool(true)),
            "false" | "0" => Ok(Value::Bool(false)),
            _ => Err(format!("{code} must be a boolean")),
        },
        _ => Err(format!("{code} must be a boolean")),
    }
}

async fn check_range(
    event: &Event,
    attr: Option<&EntityAttribute>,
    code: &str,
    range: &str,
    value: &Value,
    domain: &DomainCache,
) -> Result<(), String> {
    let range = range.trim();
    if range.is_empty() || range == "any" {
        return Ok(());
    }

    let (rule, args) = match range.split_once(':') {
        Some((rule, args)) => (rule.trim(), args.trim()),
        None => (range, ""),
    };

    match rule {
        "in" => {
            if !csv_contains(args, &text_of(value)) {
                return Err(format!("{code} must be one of: {args}"));
            }
        }
        "nin" => {
            if csv_contains(args, &text_of(value)) {
                return Err(format!("{code} must not be one of: {args}"));
            }
        }
        "length" => check_length(code, args, value)?,
        "r_like" => {
            if !text_of(value).starts_with(args) {
                return Err(format!("{code} must start with {args}"));
            }
        }
        "l_like" => {
            if !text_of(value).ends_with(args) {
                return Err(format!("{code} must end with {args}"));
            }
        }
        "a_like" => {
            if !text_of(value).contains(args) {
                return Err(format!("{code} must contain {args}"));
            }
        }
        "gt" | "gte" | "lt" | "lte" | "range" | "eq_range" | "out" | "eq_out" => {
            check_numeric(code, rule, args, value)?
        }
        "email" => {
            if !EMAIL_RE.is_match(&text_of(value)) {
                return Err(format!("{code} is not a valid email address"));
            }
        }
        "phone" => {
            if !is_valid_phone(&text_of(value)) {
                return Err(format!("{code} is not a valid phone number"));
            }
        }
        "url" => {
            if !URL_RE.is_match(&text_of(value)) {
                return Err(format!("{code} is not a valid url"));
            }
        }
        "uid" => {
            if !is_user_name(&text_of(value)) {
                return Err(format!("{code} is not a valid uid"));
            }
        }
        "constant" => {
            // Dict name from the rule args, falling back to the attribute's
            // value source.
            let dict = if args.is_empty() {
                attr.map(|a| a.value_source.as_str()).unwrap_or("")
            } else {
                args
            };
            let constants = domain.constants(&event.project, dict).await;
            let text = text_of(value);
            if !constants.iter().any(|c| c.value == text || c.code == text) {
                return Err(format!("{code} is not a known constant of {dict}"));
            }
        }
        other => return Err(format!("unknown range rule: {other}")),
    }

    Ok(())
}

fn text_of(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn csv_contains(args: &str, needle: &str) -> bool {
    args.split(',').any(|item| item.trim() == needle)
}

fn check_length(code: &str, args: &str, value: &Value) -> Result<(), String> {
    let len = text_of(value).chars().count();
    match args.split_once(',') {
        Some((min, max)) => {
            let min: usize = min.trim().parse().map_err(|_| bad_rule(code))?;
            let max: usize = max.trim().parse().map_err(|_| bad_rule(code))?;
            if len < min || len > max {
                return Err(format!("{code} length must be between {min} and {max}"));
            }
        }
        None => {
            let exact: usize = args.trim().parse().map_err(|_| bad_rule(code))?;
            if len != exact {
                return Err(format!("{code} length must be {exact}"));
            }
        }
    }
    Ok(())
}

fn check_numeric(code: &str, rule: &str, args: &str, value: &Value) -> Result<(), String> {
    let n = value
        .as_f64()
        .or_else(|| text_of(value).trim().parse::<f64>().ok())
        .ok_or_else(|| format!("{code} must be numeric"))?;

    let bounds = || -> Result<(f64, f64), String> {
        let (min, max) = args.split_once(',').ok_or_else(|| bad_rule(code))?;
        let min: f64 = min.trim().parse().map_err(|_| bad_rule(code))?;
        let max: f64 = max.trim().parse().map_err(|_| bad_rule(code))?;
        Ok((min, max))
    };
    let single = || -> Result<f64, String> {
        args.trim().parse::<f64>().map_err(|_| bad_rule(code))
    };

    let ok = match rule {
        "gt" => n > single()?,
        "gte" => n >= single()?,
        "lt" => n < single()?,
        "lte" => n <= single()?,
        "range" => {
            let (min, max) = bounds()?;
            n > min && n < max
        }
        "eq_range" => {
            let (min, max) = bounds()?;
            n >= min && n <= max
        }
        "out" => {
            let (min, max) = bounds()?;
            n < min || n > max
        }
        "eq_out" => {
            let (min, max) = bounds()?;
            n <= min || n >= max
        }
        _ => unreachable!(),
    };

    if ok {
        Ok(())
    } else {
        Err(format!("{code} violates rule {rule}:{args}"))
    }
}

fn bad_rule(code: &str) -> String {
    format!("malformed range rule for {code}")
}

/// E.164 with a default +86 country code when no plus prefix is given.
fn is_valid_phone(raw: &str) -> bool {
    let compact: String = raw
        .chars()
        .filter(|c| !matches!(c, ' ' | '-'))
        .collect();
    let normalized = if compact.starts_with('+') {
        compact
    } else {
        format!("+86{compact}")
    };
    PHONE_RE.is_match(&normalized)
}

const USER_NAME_CHARS: &str =
    "abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789_-";

/// A uid is accepted when it is 1..=64 chars and contains at least one
/// allowed character. Deliberately NOT "all characters allowed": historical
/// behavior that existing uids depend on.
fn is_user_name(s: &str) -> bool {
    !s.is_empty() && s.chars().count() <= 64 && s.chars().any(|c| USER_NAME_CHARS.contains(c))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_cast_string_like() {
        let custom = CustomParserRegistry::new();
        assert_eq!(
            cast("name", &json!("alice"), FieldType::String, &custom).unwrap(),
            json!("alice")
        );
        // Numbers coerce to their string form.
        assert_eq!(
            cast("code", &json!(42), FieldType::Id, &custom).unwrap(),
            json!("42")
        );
    }

    #[test]
    fn test_cast_integers() {
        let custom = CustomParserRegistry::new();
        assert_eq!(
            cast("age", &json!("30"), FieldType::Int32, &custom).unwrap(),
            json!(30)
        );
        assert!(cast("age", &json!(3.5), FieldType::Int32, &custom).is_err());
        assert!(cast("tiny", &json!(1000), FieldType::Int8, &custom).is_err());
        assert_eq!(
            cast("ts", &json!(1_700_000_000_000i64), FieldType::Datetime, &custom).unwrap(),
            json!(1_700_000_000_000i64)
        );
    }

    #[test]
    fn test_cast_float_bool() {
        let custom = CustomParserRegistry::new();
        assert_eq!(
            cast("rate", &json!("0.5"), FieldType::Float64, &custom).unwrap(),
            json!(0.5)
        );
        assert_eq!(
            cast("ok", &json!("true"), FieldType::Boolean, &custom).unwrap(),
            json!(true)
        );
        assert!(cast("ok", &json!("maybe"), FieldType::Boolean, &custom).is_err());
    }

    #[test]
    fn test_cast_custom_requires_parser() {
        let custom = CustomParserRegistry::new();
        assert!(cast("geo", &json!("1,2"), FieldType::Custom, &custom).is_err());

        struct GeoParser;
        impl CustomFieldParser for GeoParser {
            fn parse(&self, _code: &str, value: &Value) -> Result<Value, String> {
                Ok(json!({ "geo": value }))
            }
        }
        custom.register("geo", Arc::new(GeoParser));
        assert_eq!(
            cast("geo", &json!("1,2"), FieldType::Custom, &custom).unwrap(),
            json!({ "geo": "1,2" })
        );
    }

    #[test]
    fn test_length_rules() {
        assert!(check_length("name", "5", &json!("alice")).is_ok());
        assert!(check_length("name", "3,10", &json!("alice")).is_ok());
        assert!(check_length("name", "3,4", &json!("alice")).is_err());
    }

    #[test]
    fn test_numeric_rules() {
        assert!(check_numeric("n", "gt", "5", &json!(6)).is_ok());
        assert!(check_numeric("n", "gt", "5", &json!(5)).is_err());
        assert!(check_numeric("n", "gte", "5", &json!(5)).is_ok());
        assert!(check_numeric("n", "range", "1,10", &json!(1)).is_err());
        assert!(check_numeric("n", "eq_range", "1,10", &json!(1)).is_ok());
        assert!(check_numeric("n", "out", "1,10", &json!(11)).is_ok());
        assert!(check_numeric("n", "out", "1,10", &json!(10)).is_err());
        assert!(check_numeric("n", "eq_out", "1,10", &json!(10)).is_ok());
    }

    #[test]
    fn test_phone_defaults_to_cn() {
        assert!(is_valid_phone("13812345678"));
        assert!(is_valid_phone("+4915112345678"));
        assert!(is_valid_phone("+86 138-1234-5678"));
        assert!(!is_valid_phone("+0123"));
        assert!(!is_valid_phone("not-a-phone"));
    }

    #[test]
    fn test_email_and_url() {
        assert!(EMAIL_RE.is_match("a.b+c@example.co"));
        assert!(!EMAIL_RE.is_match("not-an-email"));
        assert!(URL_RE.is_match("https://example.com/x?y=1"));
        assert!(!URL_RE.is_match("ftp://example.com"));
    }

    #[test]
    fn test_uid_contains_any_semantics() {
        assert!(is_user_name("alice_01"));
        // One allowed character among garbage still passes; this matches the
        // historical matcher, not a full-character check.
        assert!(is_user_name("!!!a!!!"));
        assert!(!is_user_name("!!!"));
        assert!(!is_user_name(""));
    }
}
