use std::error::Error;

use discord_wire::gateway::proto::{EventName, PresenceUpdate, Status};
use discord_wire::gateway::GatewayClient;
use discord_wire::rest::{ApiRequest, RequestExecutor, Route};
use discord_wire::ClientConfig;
use secrecy::SecretString;
use serde::Deserialize;
use serde_json::json;
use tracing_subscriber::EnvFilter;

/// GUILDS | GUILD_MESSAGES | MESSAGE_CONTENT
const INTENTS: u64 = (1 << 0) | (1 << 9) | (1 << 15);

#[derive(Debug, Deserialize)]
struct Author {
    #[serde(default)]
    bot: bool,
}

#[derive(Debug, Deserialize)]
struct MessageCreate {
    channel_id: String,
    content: String,
    author: Author,
}

fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let token = std::env::var("DISCORD_TOKEN")
        .unwrap_or_else(|_| "REPLACE_WITH_BOT_TOKEN".to_string());

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async {
        let config = ClientConfig::new(SecretString::new(token), INTENTS);
        let executor = RequestExecutor::new(&config)?;
        let client = GatewayClient::new(config);

        let mut connection = client.connect().await?;
        connection
            .sender()
            .update_presence(&PresenceUpdate::status(Status::Online))?;

        while let Some(event) = connection.recv().await {
            match event.name() {
                EventName::Ready => println!("ready sequence={:?}", event.sequence()),
                EventName::MessageCreate => {
                    let message: MessageCreate = event.decode()?;
                    if message.author.bot {
                        continue;
                    }
                    let Some(text) = message.content.strip_prefix("!echo ") else {
                        continue;
                    };
                    let route = Route::post("/channels/{channel_id}/messages")
                        .param("channel_id", &message.channel_id);
                    let response = executor
                        .execute(ApiRequest::new(route).json(json!({ "content": text })))
                        .await?;
                    println!("echoed channel={} status={}", message.channel_id, response.status);
                }
                other => println!("event={other} sequence={:?}", event.sequence()),
            }
        }

        Ok::<(), Box<dyn Error>>(())
    })
}
