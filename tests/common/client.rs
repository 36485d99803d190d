//! HTTP client helpers for end-to-end tests.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde_json::json;

pub struct TestClient {
    base_url: String,
    client: reqwest::Client,
}

impl TestClient {
    pub fn new(base_url: String) -> Self {
        Self {
            base_url,
            client: reqwest::Client::new(),
        }
    }

    pub async fn health(&self) -> reqwest::Response {
        self.client
            .get(format!("{}/health", self.base_url))
            .send()
            .await
            .expect("health request failed")
    }

    pub async fn publish(
        &self,
        name: &str,
        content: &[u8],
        description: &str,
        tags: &[&str],
        author_id: &str,
        expected_parent_version: Option<u64>,
    ) -> reqwest::Response {
        self.client
            .post(format!("{}/v1/skills", self.base_url))
            .json(&json!({
                "name": name,
                "content": BASE64.encode(content),
                "description": description,
                "tags": tags,
                "author_id": author_id,
                "expected_parent_version": expected_parent_version,
            }))
            .send()
            .await
            .expect("publish request failed")
    }

    pub async fn list_skills(&self, query: &str) -> reqwest::Response {
        let mut url = format!("{}/v1/skills", self.base_url);
        if !query.is_empty() {
            url.push('?');
            url.push_str(query);
        }
        self.client
            .get(url)
            .send()
            .await
            .expect("list request failed")
    }

    pub async fn get_skill(&self, name: &str, version: Option<u64>) -> reqwest::Response {
        let mut url = format!("{}/v1/skills/{}", self.base_url, name);
        if let Some(v) = version {
            url.push_str(&format!("?version={}", v));
        }
        self.client
            .get(url)
            .send()
            .await
            .expect("get request failed")
    }

    pub async fn get_history(&self, name: &str) -> reqwest::Response {
        self.client
            .get(format!("{}/v1/skills/{}/history", self.base_url, name))
            .send()
            .await
            .expect("history request failed")
    }

    pub async fn delete_skill(&self, name: &str, author_id: &str) -> reqwest::Response {
        self.client
            .delete(format!(
                "{}/v1/skills/{}?author_id={}",
                self.base_url, name, author_id
            ))
            .send()
            .await
            .expect("delete request failed")
    }

    pub async fn search(&self, query: &str, top_k: usize, tags: &[&str]) -> reqwest::Response {
        self.client
            .post(format!("{}/v1/search", self.base_url))
            .json(&json!({
                "query": query,
                "top_k": top_k,
                "tags": tags,
            }))
            .send()
            .await
            .expect("search request failed")
    }

    pub async fn get_changes(&self, after: u64) -> reqwest::Response {
        self.client
            .get(format!("{}/v1/changes?after={}", self.base_url, after))
            .send()
            .await
            .expect("changes request failed")
    }
}

/// Decode a base64 content field from a JSON response body.
pub fn decode_content(value: &serde_json::Value) -> Vec<u8> {
    let content = value
        .get("content")
        .and_then(|c| c.as_str())
        .expect("response has no content field");
    BASE64.decode(content).expect("content is not valid base64")
}
