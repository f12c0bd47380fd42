use std::{net::IpAddr, sync::Arc};

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use http::{header, request::Parts, Request, Response, StatusCode};
use pingora::{
    apps::http_app::ServeHttp,
    listeners::tls::TlsSettings,
    protocols::http::ServerSession,
    services::listening::Service,
};
use pingora_error::Result;
use tokio_util::sync::CancellationToken;

use crate::{
    config::{Listener, Tls},
    core::GatewayError,
    gateway::Gateway,
};

/// Gateway HTTP application.
///
/// Admits the request into the global scope, buffers its body up to the configured limit,
/// hands it to [`Gateway::serve`] and writes the response back. Dropping the in-flight
/// handler (client gone, server shutting down) cancels every backend call the request started.
pub struct GatewayHttpApp {
    gateway: Arc<Gateway>,
}

impl GatewayHttpApp {
    pub fn new(gateway: Arc<Gateway>) -> Self {
        Self { gateway }
    }

    /// Build the listening service for the configured listeners.
    pub fn gateway_http_service(
        gateway: Arc<Gateway>,
        listeners: &[Listener],
    ) -> Result<Service<Self>> {
        let mut service = Service::new("Gateway HTTP".to_string(), Self::new(gateway));

        for listener in listeners {
            let addr = listener.address.to_string();
            match &listener.tls {
                Some(Tls {
                    cert_path,
                    key_path,
                }) => {
                    let mut settings = TlsSettings::intermediate(cert_path, key_path)
                        .map_err(|e| {
                            log::error!("Unable to load TLS settings for listener {addr}: {e}");
                            e
                        })?;
                    if listener.offer_h2 {
                        settings.enable_h2();
                    }
                    service.add_tls_with_settings(&addr, None, settings);
                }
                None => service.add_tcp(&addr),
            }
        }

        Ok(service)
    }
}

/// The parts of a downstream session the gateway reads from.
#[async_trait]
trait Downstream: Send {
    fn parts(&self) -> Parts;

    fn client_ip(&self) -> Option<IpAddr>;

    async fn next_chunk(&mut self) -> Result<Option<Bytes>>;
}

#[async_trait]
impl Downstream for ServerSession {
    fn parts(&self) -> Parts {
        self.req_header().as_owned_parts()
    }

    fn client_ip(&self) -> Option<IpAddr> {
        self.client_addr()
            .and_then(|addr| addr.as_inet())
            .map(|addr| addr.ip())
    }

    async fn next_chunk(&mut self) -> Result<Option<Bytes>> {
        self.read_request_body().await
    }
}

fn declared_length(parts: &Parts) -> Option<usize> {
    parts
        .headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok())
}

fn bad_request() -> Response<Bytes> {
    let mut resp = Response::new(Bytes::from_static(b"Bad Request"));
    *resp.status_mut() = StatusCode::BAD_REQUEST;
    resp
}

async fn serve_downstream<D: Downstream + ?Sized>(
    gateway: &Gateway,
    downstream: &mut D,
) -> Response<Bytes> {
    let permit = match gateway.admit() {
        Ok(permit) => permit,
        Err(e) => return gateway.reject(&e),
    };

    let limit = gateway.settings().max_body_bytes;
    let too_large = GatewayError::PayloadTooLarge(limit);
    let parts = downstream.parts();
    if declared_length(&parts).is_some_and(|len| len > limit) {
        return gateway.reject(&too_large);
    }

    let mut body = BytesMut::new();
    loop {
        match downstream.next_chunk().await {
            Ok(Some(chunk)) => {
                if body.len() + chunk.len() > limit {
                    return gateway.reject(&too_large);
                }
                body.extend_from_slice(&chunk);
            }
            Ok(None) => break,
            Err(e) => {
                log::warn!("Failed to read downstream request: {e}");
                return bad_request();
            }
        }
    }
    let req = Request::from_parts(parts, body.freeze());

    let cancel = CancellationToken::new();
    // fires if this future is dropped before the gateway answers
    let _guard = cancel.clone().drop_guard();

    gateway
        .serve(req, downstream.client_ip(), cancel, permit)
        .await
}

#[async_trait]
impl ServeHttp for GatewayHttpApp {
    async fn response(&self, http_session: &mut ServerSession) -> Response<Vec<u8>> {
        serve_downstream(&self.gateway, http_session)
            .await
            .map(|body| body.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use serde_json::{json, Value as JsonValue};

    use super::*;
    use crate::{
        config::{ConfigBundle, GatewaySettings},
        connector::ConnectorRegistry,
    };

    struct FakeDownstream {
        parts: Parts,
        chunks: VecDeque<Bytes>,
        reads: usize,
    }

    impl FakeDownstream {
        fn new(builder: http::request::Builder, chunks: &[&'static [u8]]) -> Self {
            let (parts, ()) = builder.body(()).unwrap().into_parts();
            Self {
                parts,
                chunks: chunks.iter().map(|c| Bytes::from_static(c)).collect(),
                reads: 0,
            }
        }
    }

    #[async_trait]
    impl Downstream for FakeDownstream {
        fn parts(&self) -> Parts {
            self.parts.clone()
        }

        fn client_ip(&self) -> Option<IpAddr> {
            None
        }

        async fn next_chunk(&mut self) -> Result<Option<Bytes>> {
            self.reads += 1;
            Ok(self.chunks.pop_front())
        }
    }

    fn gateway(max_body_bytes: usize) -> Gateway {
        let settings = GatewaySettings {
            max_body_bytes,
            ..Default::default()
        };
        let gw = Gateway::new(settings, ConnectorRegistry::with_builtin());
        let bundle = ConfigBundle::from_yaml(
            r#"
version: 1
routes:
  - id: echo
    uri: /echo
    methods: [POST]
    target: {type: proxy, connector: static, config: {value: "${input.request.body}"}}
admission:
  global: {max_concurrents: 1}
"#,
        )
        .unwrap();
        gw.apply_bundle(bundle).unwrap();
        gw
    }

    fn post() -> http::request::Builder {
        Request::builder().method("POST").uri("/echo")
    }

    fn body_json(resp: &Response<Bytes>) -> JsonValue {
        serde_json::from_slice(resp.body()).unwrap()
    }

    #[tokio::test]
    async fn test_saturated_gateway_rejects_before_reading_body() {
        let gw = gateway(1024);
        let _held = gw.admit().unwrap();

        let mut downstream = FakeDownstream::new(post(), &[b"{\"a\":1}"]);
        let resp = serve_downstream(&gw, &mut downstream).await;
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body_json(&resp)["error"], "admission_rejected");
        assert_eq!(downstream.reads, 0);
    }

    #[tokio::test]
    async fn test_oversized_body_rejected() {
        let gw = gateway(8);

        let declared = post().header("content-length", "64");
        let mut downstream = FakeDownstream::new(declared, &[]);
        let resp = serve_downstream(&gw, &mut downstream).await;
        assert_eq!(resp.status(), StatusCode::PAYLOAD_TOO_LARGE);
        assert_eq!(downstream.reads, 0);

        // chunked, no declared length
        let mut downstream = FakeDownstream::new(post(), &[b"12345", b"67890", b"xyz"]);
        let resp = serve_downstream(&gw, &mut downstream).await;
        assert_eq!(resp.status(), StatusCode::PAYLOAD_TOO_LARGE);
        assert_eq!(body_json(&resp)["error"], "payload_too_large");
        assert_eq!(downstream.reads, 2);
        assert_eq!(gw.admission().in_flight(), 0);
    }

    #[tokio::test]
    async fn test_body_within_limit_is_served() {
        let gw = gateway(64);
        let mut downstream =
            FakeDownstream::new(post().header("content-type", "text/plain"), &[b"hello ", b"there"]);
        let resp = serve_downstream(&gw, &mut downstream).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_json(&resp), json!("hello there"));
        assert_eq!(gw.admission().in_flight(), 0);
    }
}
