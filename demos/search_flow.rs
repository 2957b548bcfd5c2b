use std::error::Error;
use std::time::Duration;

use flow_sdk::retry::ReconnectPolicy;
use flow_sdk::{Credentials, FlowClient, FlowClientOptions};
use secrecy::SecretString;

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
        let client = FlowClient::with_options(FlowClientOptions {
            search_timeout: Some(Duration::from_secs(10)),
            reconnect: ReconnectPolicy::bounded(5),
            ..FlowClientOptions::default()
        })?;
        let flow = client
            .connect(Credentials::new(account_id, SecretString::new(token)))
            .await?
            .into_flow();

        let records = flow.search(flow_id, "EXISTS temperature", Some(20)).await?;
        for record in &records {
            println!("{record}");
        }
        println!("{} records", records.len());

        Ok::<(), Box<dyn Error>>(())
    })
}
