use std::error::Error;

use flow_sdk::{Credentials, FlowClient};
use secrecy::SecretString;
use tokio::sync::mpsc;

fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let account_id = "REPLACE_WITH_ACCOUNT_ID".to_string();
    let token = "REPLACE_WITH_TOKEN".to_string();
    let flow_id = "REPLACE_WITH_FLOW_ID".to_string();

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async {
        let client = FlowClient::new()?;
        let connection = client
            .connect(Credentials::new(account_id, SecretString::new(token)))
            .await?;
        let flow = connection.flow();

        let (tx, mut rx) = mpsc::unbounded_channel();
        flow.subscribe(flow_id.as_str(), move |record| {
            let _ = tx.send(record);
        })?;

        flow.ready().await?;
        println!("subscribed to {flow_id}");

        for _ in 0..10 {
            let Some(record) = rx.recv().await else {
                break;
            };
            println!("drop: {record}");
        }

        flow.unsubscribe(flow_id.as_str())?;
        drop(flow);
        connection.shutdown().await;
        println!("unsubscribed from {flow_id}");
        Ok::<(), Box<dyn Error>>(())
    })
}
