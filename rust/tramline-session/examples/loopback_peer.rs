//! A scripted loopback session.
//!
//! The peer end answers pings and pushes a greeting signal back; the
//! connection side waits for both. Run with:
//!
//! ```sh
//! cargo run -p tramline-session --example loopback_peer
//! ```

use tramline_session::{Connection, SignalFilter};
use tramline_wire::{Message, MessageType, ObjectPath, Value};

#[tokio::main(flavor = "current_thread")]
async fn main() {
    tracing_subscriber::fmt::init();

    let (conn, mut peer) = Connection::loopback();
    conn.set_on_disconnect(|err| eprintln!("connection failed: {err}"));

    let script = tokio::spawn(async move {
        while let Some(msg) = peer.recv().await {
            if msg.message_type == MessageType::MethodCall
                && msg.member.as_deref() == Some("Ping")
            {
                peer.send(Message::method_return(&msg));
                peer.send(
                    Message::signal(ObjectPath::root(), "org.example.Demo", "Greeting")
                        .with_body(vec![Value::Str("hello from the other side".into())]),
                );
            }
        }
    });

    let (mut signals, _guard) = conn
        .add_signal_receiver(SignalFilter::new().with_interface("org.example.Demo"))
        .unwrap();

    conn.ping(None).await.unwrap();
    println!("ping answered");

    let greeting = signals.recv().await.unwrap();
    println!(
        "signal {}: {}",
        greeting.member.as_deref().unwrap_or(""),
        greeting.first_string().unwrap_or("")
    );

    conn.close().await;
    script.await.unwrap();
}
