//! Typed accessors for bus property maps

use serde_json::Value;

use super::{ObjectPath, PropertyMap};

pub fn get_str<'a>(props: &'a PropertyMap, key: &str) -> Option<&'a str> {
    props.get(key).and_then(Value::as_str)
}

pub fn get_path(props: &PropertyMap, key: &str) -> Option<ObjectPath> {
    get_str(props, key).map(ObjectPath::from)
}

pub fn get_bool(props: &PropertyMap, key: &str) -> Option<bool> {
    props.get(key).and_then(Value::as_bool)
}

pub fn get_u64(props: &PropertyMap, key: &str) -> Option<u64> {
    props.get(key).and_then(Value::as_u64)
}

pub fn get_u8(props: &PropertyMap, key: &str) -> Option<u8> {
    get_u64(props, key).and_then(|v| u8::try_from(v).ok())
}

pub fn get_u16(props: &PropertyMap, key: &str) -> Option<u16> {
    get_u64(props, key).and_then(|v| u16::try_from(v).ok())
}

pub fn get_u32(props: &PropertyMap, key: &str) -> Option<u32> {
    get_u64(props, key).and_then(|v| u32::try_from(v).ok())
}

/// Byte array property (`ay`), encoded as a list of numbers
pub fn get_bytes(props: &PropertyMap, key: &str) -> Option<Vec<u8>> {
    props.get(key)?.as_array()?.iter().map(|v| v.as_u64().and_then(|b| u8::try_from(b).ok())).collect()
}

/// String array property (`as` or `ao`)
pub fn get_str_list<'a>(props: &'a PropertyMap, key: &str) -> Option<Vec<&'a str>> {
    props.get(key)?.as_array()?.iter().map(Value::as_str).collect()
}

pub fn bytes_value(bytes: &[u8]) -> Value {
    Value::Array(bytes.iter().map(|b| Value::from(*b)).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn props(v: Value) -> PropertyMap {
        match v {
            Value::Object(map) => map,
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_scalar_accessors() {
        let p = props(json!({"Address": "00:11:22:33:44:55", "Paired": true, "Codec": 2, "Big": 300}));
        assert_eq!(get_str(&p, "Address"), Some("00:11:22:33:44:55"));
        assert_eq!(get_bool(&p, "Paired"), Some(true));
        assert_eq!(get_u8(&p, "Codec"), Some(2));
        assert_eq!(get_u8(&p, "Big"), None);
        assert_eq!(get_u16(&p, "Big"), Some(300));
        assert_eq!(get_str(&p, "Missing"), None);
    }

    #[test]
    fn test_bytes_round_trip() {
        let mut p = PropertyMap::new();
        p.insert("Capabilities".into(), bytes_value(&[0xff, 0x15, 2, 53]));
        assert_eq!(get_bytes(&p, "Capabilities"), Some(vec![0xff, 0x15, 2, 53]));

        p.insert("Bad".into(), json!([1, 256]));
        assert_eq!(get_bytes(&p, "Bad"), None);
    }

    #[test]
    fn test_str_list() {
        let p = props(json!({"UUIDs": ["a", "b"]}));
        assert_eq!(get_str_list(&p, "UUIDs"), Some(vec!["a", "b"]));
    }
}
