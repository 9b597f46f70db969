use reqwest::Url;
use serde_json::json;

use crate::{channels::Channel, messages::Message};

use super::ClientError;

/// REST side of the chat service, authenticated with a bearer token.
#[derive(Clone)]
pub struct Api {
    http: reqwest::Client,
    base: Url,
    token: String,
}

impl Api {
    pub fn new(base_url: &str, token: &str) -> Result<Api, ClientError> {
        let base = Url::parse(base_url).map_err(|_| ClientError::InvalidUrl(base_url.to_owned()))?;
        if base.cannot_be_a_base() {
            return Err(ClientError::InvalidUrl(base_url.to_owned()));
        }
        Ok(Api {
            http: reqwest::Client::new(),
            base,
            token: token.to_owned(),
        })
    }

    fn url(&self, segments: &[&str]) -> Result<Url, ClientError> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| ClientError::InvalidUrl(self.base.to_string()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    /// Websocket endpoint on the same host.
    pub fn ws_url(&self) -> Result<Url, ClientError> {
        let mut url = self.url(&["ws"])?;
        let scheme = if url.scheme() == "https" { "wss" } else { "ws" };
        url.set_scheme(scheme)
            .map_err(|_| ClientError::InvalidUrl(self.base.to_string()))?;
        Ok(url)
    }

    pub async fn channels(&self) -> Result<Vec<Channel>, ClientError> {
        Ok(self
            .http
            .get(self.url(&["channels"])?)
            .bearer_auth(&self.token)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?)
    }

    /// Creates `name`, or returns the existing channel of that name.
    pub async fn create_channel(&self, name: &str) -> Result<Channel, ClientError> {
        Ok(self
            .http
            .post(self.url(&["channels"])?)
            .bearer_auth(&self.token)
            .json(&json!({ "name": name }))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?)
    }

    /// Newest messages of `room`, oldest first.
    pub async fn history(&self, room: &str) -> Result<Vec<Message>, ClientError> {
        Ok(self
            .http
            .get(self.url(&["messages", room])?)
            .bearer_auth(&self.token)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?)
    }
}
