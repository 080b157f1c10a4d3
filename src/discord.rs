use anyhow::Result;
use serde::Serialize;
use tracing::{error, info};

const USERNAME: &str = "Cordillera";

const COLOR_SUCCESS: u32 = 0x2E_CC_71;
const COLOR_FAILURE: u32 = 0xE7_4C_3C;

#[derive(Serialize, Debug)]
struct EmbedField {
    name: String,
    value: String,
    inline: bool,
}

#[derive(Serialize, Debug)]
struct DiscordEmbed {
    title: String,
    description: String,
    color: u32,
    timestamp: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    fields: Vec<EmbedField>,
}

#[derive(Serialize, Debug)]
struct DiscordPayload {
    username: String,
    embeds: Vec<DiscordEmbed>,
}

/// Run notifications (start, region finished, fatal failure)
pub struct DiscordWebhook {
    url: String,
    client: reqwest::Client,
}

impl DiscordWebhook {
    pub fn new(url: String, client: reqwest::Client) -> Self {
        Self { url, client }
    }

    fn payload(title: &str, description: &str, success: bool, fields: &[(&str, String)]) -> DiscordPayload {
        DiscordPayload {
            username: USERNAME.to_string(),
            embeds: vec![DiscordEmbed {
                title: title.to_string(),
                description: description.to_string(),
                color: if success { COLOR_SUCCESS } else { COLOR_FAILURE },
                timestamp: chrono::Utc::now().to_rfc3339(),
                fields: fields
                    .iter()
                    .map(|(name, value)| EmbedField {
                        name: name.to_string(),
                        value: value.clone(),
                        inline: true,
                    })
                    .collect(),
            }],
        }
    }

    pub async fn send_notification(
        &self,
        title: &str,
        description: &str,
        success: bool,
        fields: &[(&str, String)],
    ) -> Result<()> {
        let payload = Self::payload(title, description, success, fields);
        let response = self.client.post(&self.url).json(&payload).send().await?;

        if !response.status().is_success() {
            let error_text = response.text().await?;
            error!("Failed to send Discord notification: {}", error_text);
            anyhow::bail!("Discord notification failed: {}", error_text);
        }

        info!("Sent Discord notification: {}", title);
        Ok(())
    }
}
