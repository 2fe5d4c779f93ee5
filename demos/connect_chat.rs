use std::error::Error;

use chatstream_sdk::api::{ConversationApiClient, ConversationRepository};
use chatstream_sdk::stream::assembler::AssembledMessage;
use chatstream_sdk::stream::client::{ChatClient, ConnectionState};
use chatstream_sdk::stream::proto::Sender;
use chatstream_sdk::stream::session::SessionEvent;
use secrecy::SecretString;

fn main() -> Result<(), Box<dyn Error>> {
    let api_key = SecretString::new("REPLACE_WITH_API_KEY".to_string());
    let prompt = "What is the capital of France?";

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async {
        let api = ConversationApiClient::with_api_key(api_key.clone())?;
        let conversation = api.create("Demo conversation").await?;
        println!("created conversation id={}", conversation.id);

        let client = ChatClient::new().with_api_key(api_key);
        let mut session = client.session();
        session.subscribe(|message: &AssembledMessage| {
            for step in &message.thinking {
                println!("  thinking: {step}");
            }
            println!("[{:?}] {}", message.sender, message.content);
        });
        session.connect(&conversation.id);

        while let Some(event) = session.recv().await {
            match event {
                SessionEvent::StateChanged(ConnectionState::Open) => {
                    session.send(prompt)?;
                }
                SessionEvent::Reconnecting { attempt, delay } => {
                    println!("connection lost, retry {attempt} in {delay:?}");
                }
                SessionEvent::ConnectionFailed(failed) => return Err(failed.into()),
                SessionEvent::Completed(message) if message.sender == Sender::Ai => break,
                _ => {}
            }
        }

        session.disconnect();
        Ok::<(), Box<dyn Error>>(())
    })
}
