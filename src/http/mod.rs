//! HTTP access to the review API.

mod client;
mod freshness;
mod transport;

pub use client::{http_cache_key, request_key, ApiClient, RetryPolicy, HTTP_CACHE_PREFIX, RETRYABLE_STATUSES};
pub use freshness::{parse_freshness, Freshness};
pub use transport::{HttpRequest, HttpResponse, Method, ReqwestTransport, Transport, TransportError};
