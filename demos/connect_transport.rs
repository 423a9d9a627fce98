use std::error::Error;
use std::sync::Arc;

use realtime_transport::{BasicConnection, ClientTransport, ConnectionEvent, RealtimeTransport};

fn main() -> Result<(), Box<dyn Error>> {
    let url = "wss://REPLACE_WITH_HOST/signalr/connect".to_string();
    let client_id = "REPLACE_WITH_CLIENT_ID".to_string();

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async {
        let (connection, mut events) = BasicConnection::new(url, client_id);
        let transport = RealtimeTransport::new();

        transport
            .start(Arc::clone(&connection), Some(r#"[{"name":"chat"}]"#))
            .await?;
        println!("connected state={:?}", transport.state());

        transport
            .send::<_, ()>(connection.as_ref(), r#"{"H":"chat","M":"join","A":[]}"#)
            .await?;

        while let Some(event) = events.recv().await {
            match event {
                ConnectionEvent::Received(message) => println!("message={message}"),
                ConnectionEvent::Error(err) => {
                    eprintln!("transport error={err}");
                    break;
                }
            }
        }

        transport.stop(connection.as_ref()).await;
        Ok::<(), Box<dyn Error>>(())
    })
}
