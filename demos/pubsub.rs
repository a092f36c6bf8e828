//! Publish/subscribe walkthrough.
//!
//! This example demonstrates:
//! - Connecting with explicit options
//! - Subscribing with a wildcard subject
//! - Publishing and pulling deliveries from the subscription handle
//!
//! Run against a local server:
//!
//! ```sh
//! cargo run --example pubsub
//! ```

use natswire::{Client, Options};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let client = Client::connect(
        Options::new()
            .server("127.0.0.1:4222")
            .name("pubsub-demo"),
    )
    .await?;

    let mut sub = client.subscribe("demo.>").await?;

    for i in 0..5 {
        client
            .publish(format!("demo.tick.{i}"), format!("payload {i}"))
            .await?;
    }
    client.flush().await?;

    for _ in 0..5 {
        match sub.next().await {
            Some(Ok(message)) => {
                println!("{} <- {:?}", message.subject, message.payload)
            }
            Some(Err(e)) => eprintln!("subscription error: {e}"),
            None => break,
        }
    }

    client.drain().await?;
    Ok(())
}
