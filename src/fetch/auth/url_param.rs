use crate::fetch::client::HttpClient;
use async_trait::async_trait;

/// Sets a feed's API key as a URL query parameter, e.g. TriMet's `appID`.
///
/// A parameter of the same name already present in the configured URL is
/// replaced rather than duplicated.
pub struct UrlParam<C> {
    pub inner: C,
    pub param_name: String,
    pub key: String,
}

#[async_trait]
impl<C: HttpClient> HttpClient for UrlParam<C> {
    async fn execute(&self, mut req: reqwest::Request) -> reqwest::Result<reqwest::Response> {
        let kept: Vec<(String, String)> = req
            .url()
            .query_pairs()
            .filter(|(name, _)| name != self.param_name.as_str())
            .map(|(name, value)| (name.into_owned(), value.into_owned()))
            .collect();

        let url = req.url_mut();
        url.set_query(None);
        url.query_pairs_mut()
            .extend_pairs(kept)
            .append_pair(&self.param_name, &self.key);
        self.inner.execute(req).await
    }
}
