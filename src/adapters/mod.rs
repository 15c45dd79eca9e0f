//! Adapters: protocol front doors and the outbound upstream client.
pub mod coap_server;
pub mod http_server;
pub mod upstream_client;

pub use coap_server::CoapConnectionManager;
pub use http_server::HttpConnectionManager;
pub use upstream_client::HttpUpstreamClient;
