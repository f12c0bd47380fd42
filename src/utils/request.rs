use std::collections::BTreeMap;

use bytes::Bytes;
use http::{HeaderMap, Request};
use serde_json::{json, Map, Value as JsonValue};

use crate::core::RequestContext;

/// Extracts the value of a specific query parameter from the request URI.
///
/// Returns the first occurrence of the parameter's value.
pub fn get_query_value<'a>(req: &'a Request<Bytes>, name: &str) -> Option<&'a str> {
    req.uri().query().and_then(|query| {
        query.split('&').find_map(|pair| match pair.split_once('=') {
            Some((k, v)) if k == name => Some(v.trim()),
            None if pair == name => Some(""),
            _ => None,
        })
    })
}

/// Removes a query parameter from the request URI in place.
pub fn remove_query_param(
    req: &mut Request<Bytes>,
    name: &str,
) -> Result<(), http::uri::InvalidUri> {
    let Some(query) = req.uri().query() else {
        return Ok(());
    };

    let kept: Vec<&str> = query
        .split('&')
        .filter(|item| item.split_once('=').map_or(*item, |(k, _)| k) != name)
        .collect();

    let mut path = req.uri().path().to_string();
    if !kept.is_empty() {
        path = format!("{path}?{}", kept.join("&"));
    }
    *req.uri_mut() = path.parse::<http::Uri>()?;
    Ok(())
}

/// Retrieves the value of a specific header from the request.
///
/// Returns `None` if the header is not present or its value is not valid UTF-8.
pub fn get_req_header_value<'a>(req: &'a Request<Bytes>, key: &str) -> Option<&'a str> {
    req.headers().get(key).and_then(|value| value.to_str().ok())
}

fn headers_to_json(headers: &HeaderMap) -> JsonValue {
    let mut map = Map::new();
    for (name, value) in headers {
        if let Ok(value) = value.to_str() {
            // header names from the http crate are already lower-case
            map.insert(name.as_str().to_string(), JsonValue::String(value.to_string()));
        }
    }
    JsonValue::Object(map)
}

fn query_to_json(query: Option<&str>) -> JsonValue {
    let mut map = Map::new();
    for pair in query.unwrap_or_default().split('&').filter(|p| !p.is_empty()) {
        let (k, v) = pair.split_once('=').unwrap_or((pair, ""));
        map.entry(k.to_string())
            .or_insert_with(|| JsonValue::String(v.to_string()));
    }
    JsonValue::Object(map)
}

fn body_to_json(body: &Bytes) -> JsonValue {
    if body.is_empty() {
        return JsonValue::Null;
    }
    serde_json::from_slice(body).unwrap_or_else(|_| match std::str::from_utf8(body) {
        Ok(text) => JsonValue::String(text.to_string()),
        Err(_) => JsonValue::Null,
    })
}

/// The `input` binding a pipeline run starts from.
pub fn input_bindings(req: &Request<Bytes>, ctx: &RequestContext) -> Map<String, JsonValue> {
    let params: BTreeMap<&str, &str> = ctx
        .route_params
        .iter()
        .map(|(k, v)| (k.as_str(), v.as_str()))
        .collect();

    let mut bindings = Map::new();
    bindings.insert(
        "input".to_string(),
        json!({
            "request": {
                "method": req.method().as_str(),
                "path": req.uri().path(),
                "query": query_to_json(req.uri().query()),
                "headers": headers_to_json(req.headers()),
                "params": params,
                "body": body_to_json(req.body()),
            },
            "client": ctx.client_id,
        }),
    );
    bindings
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(uri: &str, body: &'static str) -> Request<Bytes> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("X-Tenant", "acme")
            .body(Bytes::from_static(body.as_bytes()))
            .unwrap()
    }

    #[test]
    fn test_query_helpers() {
        let mut req = request("/orders?apikey=secret&page=2", "");
        assert_eq!(get_query_value(&req, "apikey"), Some("secret"));
        assert_eq!(get_query_value(&req, "missing"), None);

        remove_query_param(&mut req, "apikey").unwrap();
        assert_eq!(req.uri().to_string(), "/orders?page=2");
        remove_query_param(&mut req, "page").unwrap();
        assert_eq!(req.uri().to_string(), "/orders");
    }

    #[test]
    fn test_input_bindings() {
        let req = request("/orders/42?expand=items", r#"{"qty": 3}"#);
        let mut ctx = RequestContext::default();
        ctx.client_id = Some("acme".into());
        ctx.route_params.insert("id".into(), "42".into());

        let bindings = input_bindings(&req, &ctx);
        let input = &bindings["input"];
        assert_eq!(input["client"], json!("acme"));
        assert_eq!(input["request"]["method"], json!("POST"));
        assert_eq!(input["request"]["path"], json!("/orders/42"));
        assert_eq!(input["request"]["query"]["expand"], json!("items"));
        assert_eq!(input["request"]["headers"]["x-tenant"], json!("acme"));
        assert_eq!(input["request"]["params"]["id"], json!("42"));
        assert_eq!(input["request"]["body"]["qty"], json!(3));
    }

    #[test]
    fn test_plain_body_is_text() {
        let req = request("/echo", "hello");
        let bindings = input_bindings(&req, &RequestContext::default());
        assert_eq!(bindings["input"]["request"]["body"], json!("hello"));
        assert_eq!(bindings["input"]["client"], JsonValue::Null);
    }
}
