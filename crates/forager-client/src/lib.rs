pub mod http;

pub use http::{HttpClientConfig, HttpFetchClient};
