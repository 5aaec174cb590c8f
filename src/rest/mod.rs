//! REST side: routes, rate-limit buckets, and the request executor.

pub mod bucket;
pub mod executor;
pub mod http;
pub mod limiter;
pub mod route;

pub use executor::{RequestExecutor, RestError};
pub use http::{ApiRequest, ApiResponse, HttpTransport, ReqwestTransport};
pub use route::{Route, RouteSignature};
