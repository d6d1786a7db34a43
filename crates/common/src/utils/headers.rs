use http::{HeaderMap, HeaderName, HeaderValue};
use std::collections::HashMap;

use crate::protocol::HeaderValues;

/// Convert HTTP headers to the response-frame format.
/// Repeated headers (e.g. set-cookie) become a list.
pub fn header_map_to_values(headers: &HeaderMap) -> HashMap<String, HeaderValues> {
    let mut map: HashMap<String, Vec<String>> = HashMap::new();

    for (name, value) in headers.iter() {
        let key = name.as_str().to_string();
        let val = String::from_utf8_lossy(value.as_bytes()).into_owned();

        map.entry(key).or_default().push(val);
    }

    map.into_iter()
        .map(|(name, values)| (name, HeaderValues::from(values)))
        .collect()
}

/// Convert response-frame headers back to an HTTP HeaderMap.
/// Names or values that are not valid HTTP are skipped.
pub fn values_to_header_map(map: &HashMap<String, HeaderValues>) -> HeaderMap {
    let mut headers = HeaderMap::new();

    for (name, values) in map.iter() {
        if let Ok(header_name) = HeaderName::from_bytes(name.as_bytes()) {
            for value in values.iter() {
                if let Ok(header_value) = HeaderValue::from_str(value) {
                    headers.append(header_name.clone(), header_value);
                }
            }
        }
    }

    headers
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_value_stays_scalar() {
        let mut headers = HeaderMap::new();
        headers.insert("content-type", "text/html".parse().unwrap());

        let map = header_map_to_values(&headers);
        assert_eq!(
            map.get("content-type"),
            Some(&HeaderValues::One("text/html".to_string()))
        );
    }

    #[test]
    fn test_repeated_header_becomes_list() {
        let mut headers = HeaderMap::new();
        headers.insert("set-cookie", "session=abc".parse().unwrap());
        headers.append("set-cookie", "token=xyz".parse().unwrap());

        let map = header_map_to_values(&headers);
        let cookies: Vec<_> = map.get("set-cookie").unwrap().iter().collect();
        assert_eq!(cookies, vec!["session=abc", "token=xyz"]);
    }

    #[test]
    fn test_values_to_header_map() {
        let mut map = HashMap::new();
        map.insert(
            "Set-Cookie".to_string(),
            HeaderValues::Many(vec!["a=1".to_string(), "b=2".to_string()]),
        );
        map.insert(
            "Location".to_string(),
            HeaderValues::One("/next".to_string()),
        );
        map.insert(
            "bad header".to_string(),
            HeaderValues::One("x".to_string()),
        );

        let headers = values_to_header_map(&map);
        assert_eq!(headers.get_all("set-cookie").iter().count(), 2);
        assert_eq!(headers.get("location").unwrap(), "/next");
        assert_eq!(headers.len(), 3);
    }

    #[test]
    fn test_invalid_value_is_skipped() {
        let mut map = HashMap::new();
        map.insert(
            "x-broken".to_string(),
            HeaderValues::One("line\nbreak".to_string()),
        );

        assert!(values_to_header_map(&map).is_empty());
    }
}
