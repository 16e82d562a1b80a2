//! Connect to a hub and print the values of a few flags as they change.
//!
//! ```sh
//! cargo run -p toggled-client --example watch_flags -- \
//!     "Endpoint=https://flags.example.com;AccessKey=..." <HUB> <IDENTITY> <FLAG>...
//! ```
//!
//! Or pass the connection string via environment variable:
//! ```sh
//! TOGGLED_CONNECTION_STRING="Endpoint=...;AccessKey=..." \
//!     cargo run -p toggled-client --example watch_flags -- <HUB> <IDENTITY> <FLAG>...
//! ```

use std::time::Duration;

use toggled_client::{ClientConfig, ToggledClient};

const USAGE: &str = "usage: watch_flags [CONNECTION_STRING] <HUB> <IDENTITY> <FLAG>...";
const ROUNDS: u32 = 60;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let mut args = std::env::args().skip(1);
    let connection_string = match std::env::var("TOGGLED_CONNECTION_STRING") {
        Ok(value) => value,
        Err(_) => args.next().ok_or(USAGE)?,
    };
    let hub = args.next().ok_or(USAGE)?;
    let identity = args.next().ok_or(USAGE)?;
    let flags: Vec<String> = args.collect();
    if flags.is_empty() {
        return Err(USAGE.into());
    }

    eprintln!("connecting to hub '{hub}' as '{identity}' ...");
    let client = ToggledClient::connect(ClientConfig::new(connection_string, hub, identity)).await?;

    let mut states = client.state_changes();
    tokio::spawn(async move {
        while states.changed().await.is_ok() {
            let state = *states.borrow_and_update();
            eprintln!("[state] {state}");
        }
    });

    let mut ticker = tokio::time::interval(Duration::from_secs(2));
    for _ in 0..ROUNDS {
        ticker.tick().await;
        let line: Vec<String> = flags
            .iter()
            .map(|flag| match client.get_feature_value(flag) {
                Ok(value) => format!("{flag}={value}"),
                Err(_) => format!("{flag}=?"),
            })
            .collect();
        println!("{}", line.join(" "));
    }

    client.dispose().await;
    Ok(())
}
