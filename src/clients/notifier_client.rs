use std::sync::Arc;

use chrono::{Duration, Utc};
use jsonwebtoken::{encode, EncodingKey, Header};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::warn;

use crate::crdt::ActivityRecord;
use crate::models::Collaborator;

/// Client for the notification service. Every event is fire-and-forget:
/// delivery failure never reaches the rooms.
#[derive(Debug)]
pub struct NotifierClient {
    client: Client,
    base_url: String,
    jwt_secret: String,
    service_name: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    sub: String,
    #[serde(rename = "type")]
    type_: String,
    exp: usize,
}

impl NotifierClient {
    pub fn new(base_url: String, jwt_secret: String, service_name: String) -> Self {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .expect("Failed to build reqwest client");

        Self {
            client,
            base_url,
            jwt_secret,
            service_name,
        }
    }

    fn generate_token(&self) -> String {
        let expiration = Utc::now()
            .checked_add_signed(Duration::seconds(60)) // 1 minute expiration
            .expect("valid timestamp")
            .timestamp();

        let claims = Claims {
            sub: self.service_name.clone(),
            type_: "service".to_string(),
            exp: expiration as usize,
        };

        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(self.jwt_secret.as_bytes()),
        )
        .expect("Failed to generate JWT")
    }

    pub async fn notify_activity(
        &self,
        project_id: &str,
        record: &ActivityRecord,
    ) -> Result<(), reqwest::Error> {
        let token = self.generate_token();
        let url = format!("{}/notify/activity", self.base_url);
        self.client
            .post(&url)
            .header("Authorization", format!("Bearer {}", token))
            .json(&json!({ "projectId": project_id, "record": record }))
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    pub async fn notify_presence(
        &self,
        event: &str,
        collaborator: &Collaborator,
    ) -> Result<(), reqwest::Error> {
        let token = self.generate_token();
        let url = format!("{}/notify/presence", self.base_url);
        self.client
            .post(&url)
            .header("Authorization", format!("Bearer {}", token))
            .json(&json!({ "event": event, "collaborator": collaborator }))
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    /// Post an activity event in the background.
    pub fn notify_activity_bg(self: &Arc<Self>, project_id: String, record: ActivityRecord) {
        let client = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = client.notify_activity(&project_id, &record).await {
                warn!("Failed to notify activity for project {}: {}", project_id, e);
            }
        });
    }

    /// Post a presence event in the background.
    pub fn notify_presence_bg(self: &Arc<Self>, event: &'static str, collaborator: Collaborator) {
        let client = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = client.notify_presence(event, &collaborator).await {
                warn!(
                    "Failed to notify presence {} for user {}: {}",
                    event, collaborator.user_id, e
                );
            }
        });
    }
}
