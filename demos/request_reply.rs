//! Request/reply over the shared inbox.
//!
//! This example demonstrates:
//! - Serving requests from a subscription (reply-to publishing)
//! - Issuing concurrent requests multiplexed over one wildcard inbox
//! - The typed no-responders outcome
//!
//! Run against a local server:
//!
//! ```sh
//! cargo run --example request_reply
//! ```

use natswire::{Client, Error, Options};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let client = Client::connect(
        Options::new()
            .server("127.0.0.1:4222")
            .name("request-reply-demo"),
    )
    .await?;

    // A responder echoing payloads back, running off a callback.
    let responder = Client::connect(Options::new().server("127.0.0.1:4222")).await?;
    let mut service = responder.subscribe("svc.echo").await?;
    let responder_client = responder.clone();
    tokio::spawn(async move {
        while let Some(Ok(message)) = service.next().await {
            if let Some(reply) = message.reply {
                let _ = responder_client.publish(reply, message.payload).await;
            }
        }
    });

    let (a, b) = tokio::join!(
        client.request("svc.echo", "first"),
        client.request("svc.echo", "second"),
    );
    println!("a = {:?}", a?.payload);
    println!("b = {:?}", b?.payload);

    // No one listens on this subject: the server reports it immediately.
    match client.request("svc.missing", "anyone?").await {
        Err(Error::NoResponders) => println!("svc.missing has no responders"),
        other => println!("unexpected outcome: {other:?}"),
    }

    responder.drain().await?;
    client.drain().await?;
    Ok(())
}
