use std::sync::Arc;

use async_trait::async_trait;
use reqwest::{Request, Response};

/// Transport used for every remote fetch. Injected so tests can answer
/// requests without a network.
#[async_trait]
pub trait HttpClient: Send + Sync {
    async fn execute(&self, req: Request) -> reqwest::Result<Response>;
}

#[async_trait]
impl<C: HttpClient + ?Sized> HttpClient for Arc<C> {
    async fn execute(&self, req: Request) -> reqwest::Result<Response> {
        (**self).execute(req).await
    }
}
