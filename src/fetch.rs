//! HTTP request building

use reqwest::{
    header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION, CONTENT_TYPE},
    Client, Method, RequestBuilder,
};
use serde::Serialize;
use url::Url;

use crate::error::Error;

/// Helper for building and executing HTTP requests
pub struct FetchBuilder<'a> {
    client: &'a Client,
    url: String,
    method: Method,
    headers: HeaderMap,
    body: Option<Vec<u8>>,
}

impl<'a> FetchBuilder<'a> {
    /// Create a new FetchBuilder speaking JSON
    pub fn new(client: &'a Client, url: &str, method: Method) -> Self {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));

        Self {
            client,
            url: url.to_string(),
            method,
            headers,
            body: None,
        }
    }

    /// Add bearer token authentication to the request
    pub fn bearer_auth(mut self, token: &str) -> Self {
        if let Ok(mut value) = HeaderValue::from_str(&format!("Bearer {}", token)) {
            value.set_sensitive(true);
            self.headers.insert(AUTHORIZATION, value);
        }
        self
    }

    /// Add a JSON body to the request
    pub fn json<T: Serialize + ?Sized>(mut self, body: &T) -> Result<Self, Error> {
        self.body = Some(serde_json::to_vec(body)?);
        Ok(self)
    }

    fn build(&self) -> Result<RequestBuilder, Error> {
        let url = Url::parse(&self.url)?;

        let mut req = self
            .client
            .request(self.method.clone(), url)
            .headers(self.headers.clone());

        if let Some(body) = &self.body {
            req = req.body(body.clone());
        }

        Ok(req)
    }

    /// Execute the request and return the raw response
    pub async fn send(&self) -> Result<reqwest::Response, Error> {
        let req = self.build()?;
        Ok(req.send().await?)
    }
}

/// Join an API root and a request path with exactly one slash
pub fn join_url(base_url: &str, path: &str) -> String {
    format!(
        "{}/{}",
        base_url.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_join_url() {
        assert_eq!(
            join_url("http://localhost:5000/api", "/orders"),
            "http://localhost:5000/api/orders"
        );
        assert_eq!(
            join_url("http://localhost:5000/api/", "orders/7"),
            "http://localhost:5000/api/orders/7"
        );
    }

    #[test]
    fn test_default_headers() {
        let client = Client::new();
        let req = FetchBuilder::new(&client, "http://localhost/api/me", Method::GET)
            .bearer_auth("abc")
            .build()
            .unwrap()
            .build()
            .unwrap();

        assert_eq!(req.headers()[CONTENT_TYPE], "application/json");
        assert_eq!(req.headers()[ACCEPT], "application/json");
        assert_eq!(req.headers()[AUTHORIZATION], "Bearer abc");
        assert_eq!(req.headers().len(), 3);
    }

    #[test]
    fn test_invalid_url() {
        let client = Client::new();
        let result = FetchBuilder::new(&client, "not a url", Method::GET).build();
        assert!(matches!(result, Err(Error::Url(_))));
    }
}
