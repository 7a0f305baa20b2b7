use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tramline_wire::{Message, ObjectPath, Value};

use super::*;

fn quiet(conn: &Connection) {
    conn.set_on_disconnect(|err| tracing::debug!(error = %err, "test connection gone"));
}

fn test_signal(member: &str) -> Message {
    Message::signal(ObjectPath::root(), "org.example.Test", member)
}

/// A write half that records what it observed about the connection at the
/// moment of each write.
struct ProbeTx {
    conn: Arc<Mutex<Option<Connection>>>,
    events: Arc<Mutex<Vec<(u32, bool)>>>,
    fail_data_on: Option<u32>,
}

#[async_trait]
impl TransportTx for ProbeTx {
    async fn send(&mut self, msg: &Message) -> Result<(), TransportFault> {
        if self.fail_data_on == Some(msg.serial) {
            self.fail_data_on = None;
            return Err(TransportFault::Data("scripted encode failure".into()));
        }
        let waiter_present = self
            .conn
            .lock()
            .unwrap()
            .as_ref()
            .is_some_and(|c| c.has_reply_waiter(msg.serial));
        self.events.lock().unwrap().push((msg.serial, waiter_present));
        Ok(())
    }

    async fn shutdown(&mut self) {}
}

struct PendingRx;

#[async_trait]
impl TransportRx for PendingRx {
    async fn recv(&mut self) -> Result<Message, TransportFault> {
        std::future::pending().await
    }
}

fn probe_connection(
    fail_data_on: Option<u32>,
) -> (Connection, Arc<Mutex<Vec<(u32, bool)>>>) {
    let conn_slot = Arc::new(Mutex::new(None));
    let events = Arc::new(Mutex::new(Vec::new()));
    let tx = ProbeTx {
        conn: conn_slot.clone(),
        events: events.clone(),
        fail_data_on,
    };
    let conn = Connection::from_transport(Transport::new(tx, PendingRx), None);
    quiet(&conn);
    *conn_slot.lock().unwrap() = Some(conn.clone());
    (conn, events)
}

#[tokio::test]
async fn reply_waiter_is_installed_before_the_wire_write() {
    let (conn, events) = probe_connection(None);

    let _pending = conn
        .send_message_with_reply(test_signal("ignored"))
        .await
        .unwrap();

    let events = events.lock().unwrap();
    assert_eq!(events.len(), 1);
    let (serial, waiter_present) = events[0];
    assert_eq!(serial, 1);
    assert!(waiter_present, "waiter must exist when the write happens");

    conn.close().await;
}

#[tokio::test]
async fn fire_and_forget_send_registers_no_waiter() {
    let (conn, events) = probe_connection(None);

    conn.send_message(test_signal("plain")).await.unwrap();

    let events = events.lock().unwrap();
    assert_eq!(*events, vec![(1, false)]);

    conn.close().await;
}

#[tokio::test]
async fn data_error_is_nonfatal_and_does_not_consume_the_serial() {
    let (conn, events) = probe_connection(Some(2));

    assert_eq!(conn.send_message(test_signal("one")).await.unwrap(), 1);

    // Serial 2 fails to encode; the connection stays up.
    let err = conn
        .send_message_with_reply(test_signal("two"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Data(_)), "got {err:?}");
    assert!(conn.is_running());
    // The never-sent reply slot is gone again.
    assert!(!conn.has_reply_waiter(2));

    // The failed serial was not consumed; the next send reuses it and,
    // with the scripted failure spent, goes through.
    events.lock().unwrap().clear();
    assert_eq!(conn.send_message(test_signal("retry")).await.unwrap(), 2);

    conn.close().await;
}

#[tokio::test]
async fn serials_increase_per_successful_send() {
    let (conn, events) = probe_connection(None);

    for _ in 0..3 {
        conn.send_message(test_signal("tick")).await.unwrap();
    }

    let serials: Vec<u32> = events.lock().unwrap().iter().map(|(s, _)| *s).collect();
    assert_eq!(serials, vec![1, 2, 3]);

    conn.close().await;
}

#[tokio::test]
async fn cancelled_caller_leaves_the_reply_slot_in_place() {
    let (conn, _events) = probe_connection(None);

    let pending = conn
        .send_message_with_reply(test_signal("call"))
        .await
        .unwrap();
    drop(pending);

    // The entry stays until the reply or a crash cleans it up.
    assert!(conn.has_reply_waiter(1));

    conn.close().await;
    assert!(!conn.has_reply_waiter(1));
}

/// A write half that never completes a write to the "Wedge" member, so
/// the sender keeps the send mutex forever.
struct WedgeTx;

#[async_trait]
impl TransportTx for WedgeTx {
    async fn send(&mut self, msg: &Message) -> Result<(), TransportFault> {
        if msg.member.as_deref() == Some("Wedge") {
            std::future::pending().await
        } else {
            Ok(())
        }
    }

    async fn shutdown(&mut self) {}
}

/// Reports end-of-stream once the gate fires.
struct EofAfterGate {
    gate: Option<tokio::sync::oneshot::Receiver<()>>,
}

#[async_trait]
impl TransportRx for EofAfterGate {
    async fn recv(&mut self) -> Result<Message, TransportFault> {
        if let Some(gate) = self.gate.take() {
            let _ = gate.await;
        }
        Err(TransportFault::Eof)
    }
}

#[tokio::test]
async fn fatal_crash_does_not_wait_on_a_wedged_sender() {
    let (eof_tx, eof_rx) = tokio::sync::oneshot::channel();
    let conn = Connection::from_transport(
        Transport::new(WedgeTx, EofAfterGate { gate: Some(eof_rx) }),
        None,
    );
    let (gone_tx, gone_rx) = tokio::sync::oneshot::channel();
    conn.set_on_disconnect(move |err| {
        let _ = gone_tx.send(err);
    });

    // This sender takes the send mutex and never comes back.
    let stuck = {
        let conn = conn.clone();
        tokio::spawn(async move { conn.send_message(test_signal("Wedge")).await })
    };
    tokio::task::yield_now().await;

    // End of stream: the crash must complete without the send mutex.
    eof_tx.send(()).unwrap();
    let err = tokio::time::timeout(std::time::Duration::from_secs(5), gone_rx)
        .await
        .expect("teardown must not wait on the wedged sender")
        .unwrap();
    assert!(matches!(err, Error::ConnectionLost));
    assert!(matches!(conn.crash_error(), Some(Error::ConnectionLost)));

    stuck.abort();
}

#[tokio::test]
async fn transport_info_survives_until_crash() {
    let (conn, _peer) = Connection::loopback();
    quiet(&conn);

    assert_eq!(conn.transport().unwrap().kind, "loopback");

    conn.close().await;
    assert!(conn.transport().is_none());
}

#[tokio::test]
async fn close_is_idempotent_and_sticky() {
    let (conn, _peer) = Connection::loopback();
    quiet(&conn);

    conn.close().await;
    conn.close().await;

    assert!(!conn.is_running());
    assert!(matches!(conn.crash_error(), Some(Error::ConnectionClosed)));
    let err = conn.send_message(test_signal("late")).await.unwrap_err();
    assert!(matches!(err, Error::ConnectionClosed));
    assert!(matches!(conn.watch().await, Error::ConnectionClosed));
}

#[tokio::test]
async fn outgoing_filter_drop_fails_the_send_only() {
    let (conn, events) = probe_connection(None);

    let drops = Arc::new(AtomicU32::new(0));
    let counter = drops.clone();
    let guard = conn
        .add_outgoing_filter(Box::new(move |msg: Message| {
            if msg.member.as_deref() == Some("secret") {
                counter.fetch_add(1, Ordering::Relaxed);
                Ok(None)
            } else {
                Ok(Some(msg))
            }
        }))
        .unwrap();

    let err = conn.send_message(test_signal("secret")).await.unwrap_err();
    assert!(matches!(err, Error::FilterDropped));
    assert!(conn.is_running());
    assert_eq!(drops.load(Ordering::Relaxed), 1);
    // Nothing hit the wire and the serial was not consumed.
    assert!(events.lock().unwrap().is_empty());
    assert_eq!(conn.send_message(test_signal("open")).await.unwrap(), 1);

    drop(guard);
    assert_eq!(conn.send_message(test_signal("secret")).await.unwrap(), 2);

    conn.close().await;
}

#[tokio::test]
async fn incoming_filters_apply_in_insertion_order() {
    let (conn, mut peer) = Connection::loopback();
    quiet(&conn);

    let order = Arc::new(Mutex::new(Vec::new()));

    let seen = order.clone();
    let _first = conn
        .add_incoming_filter(Box::new(move |msg: Message| {
            seen.lock().unwrap().push("first");
            if msg.member.as_deref() == Some("DropMe") {
                Ok(None)
            } else {
                Ok(Some(msg))
            }
        }))
        .unwrap();

    let seen = order.clone();
    let _second = conn
        .add_incoming_filter(Box::new(move |msg: Message| {
            seen.lock().unwrap().push("second");
            Ok(Some(msg))
        }))
        .unwrap();

    let (mut stream, _guard) = conn.add_signal_receiver(SignalFilter::new()).unwrap();

    // Dropped in the first filter: the second filter never runs and no
    // receiver sees the message.
    peer.send(test_signal("DropMe"));
    peer.send(test_signal("KeepMe"));

    let delivered = stream.recv().await.unwrap();
    assert_eq!(delivered.member.as_deref(), Some("KeepMe"));
    assert_eq!(
        *order.lock().unwrap(),
        vec!["first", "first", "second"],
    );

    conn.close().await;
}

#[tokio::test]
async fn failing_incoming_filter_drops_without_crashing() {
    let (conn, mut peer) = Connection::loopback();
    quiet(&conn);

    let _guard = conn
        .add_incoming_filter(Box::new(|msg: Message| {
            if msg.member.as_deref() == Some("Poison") {
                Err(Error::Data("filter blew up".into()))
            } else {
                Ok(Some(msg))
            }
        }))
        .unwrap();

    let (mut stream, _rg) = conn.add_signal_receiver(SignalFilter::new()).unwrap();

    peer.send(test_signal("Poison"));
    peer.send(test_signal("Fine"));

    assert_eq!(stream.recv().await.unwrap().member.as_deref(), Some("Fine"));
    assert!(conn.is_running());

    conn.close().await;
}

#[tokio::test]
async fn down_gate_pauses_dispatch() {
    let (conn, mut peer) = Connection::loopback();
    quiet(&conn);

    let (mut stream, _guard) = conn.add_signal_receiver(SignalFilter::new()).unwrap();

    assert!(conn.is_up());
    conn.set_down().unwrap();
    assert!(!conn.is_up());
    // Let the dispatcher observe the gate before feeding it.
    tokio::task::yield_now().await;

    peer.send(test_signal("Held"));
    tokio::task::yield_now().await;
    assert!(stream.try_recv().is_none());

    conn.set_up().unwrap();
    assert_eq!(stream.recv().await.unwrap().member.as_deref(), Some("Held"));

    conn.close().await;
}

#[tokio::test]
async fn receiver_guard_drop_removes_the_subscription() {
    let (conn, mut peer) = Connection::loopback();
    quiet(&conn);

    let (mut stream, guard) = conn.add_signal_receiver(SignalFilter::new()).unwrap();
    peer.send(test_signal("One"));
    assert_eq!(stream.recv().await.unwrap().member.as_deref(), Some("One"));

    drop(guard);
    peer.send(test_signal("Two"));
    tokio::task::yield_now().await;
    assert!(stream.recv().await.is_none());

    conn.close().await;
}

#[tokio::test]
async fn unexport_and_object_guard_respect_reexport() {
    struct Silent;

    #[async_trait]
    impl ObjectHandler for Silent {
        async fn handle_call(&self, _conn: &Connection, _call: Message) -> Result<(), Error> {
            Ok(())
        }
    }

    let (conn, _peer) = Connection::loopback();
    quiet(&conn);

    let path = ObjectPath::new("/com/example/thing").unwrap();
    let first = conn.export_object(path.clone(), Arc::new(Silent)).unwrap();

    // Re-export replaces the entry; the stale guard must not remove the
    // replacement.
    let second = conn.export_object(path.clone(), Arc::new(Silent)).unwrap();
    drop(first);
    assert!(conn.unexport(&path).unwrap());
    assert!(!conn.unexport(&path).unwrap());
    drop(second);

    conn.close().await;
}

#[tokio::test]
async fn method_error_reply_maps_to_native_error() {
    let (conn, mut peer) = Connection::loopback();
    quiet(&conn);

    let caller = {
        let conn = conn.clone();
        tokio::spawn(async move {
            conn.method_call::<()>(
                None,
                ObjectPath::root(),
                "org.example.Svc",
                "Explode",
                vec![],
            )
            .await
        })
    };

    let call = peer.recv().await.unwrap();
    let mut reply = Message::error(&call, "org.example.Error.Boom", "it broke");
    reply.serial = 1;
    peer.send(reply);

    let err = caller.await.unwrap().unwrap_err();
    let bus = err.as_bus_error().expect("method error");
    assert_eq!(bus.name(), "org.example.Error.Boom");
    assert_eq!(bus.message(), "it broke");

    conn.close().await;
}

#[tokio::test]
async fn reply_with_wrong_signature_is_a_mismatch_not_a_cast() {
    let (conn, mut peer) = Connection::loopback();
    quiet(&conn);

    let caller = {
        let conn = conn.clone();
        tokio::spawn(async move {
            conn.method_call::<(String,)>(
                None,
                ObjectPath::root(),
                "org.example.Svc",
                "Name",
                vec![],
            )
            .await
        })
    };

    let call = peer.recv().await.unwrap();
    let mut reply = Message::method_return(&call).with_body(vec![Value::Uint32(9)]);
    reply.serial = 1;
    peer.send(reply);

    let err = caller.await.unwrap().unwrap_err();
    match err {
        Error::SignatureMismatch { expected, got } => {
            assert_eq!(expected.as_str(), "s");
            assert_eq!(got.as_str(), "u");
        }
        other => panic!("expected signature mismatch, got {other:?}"),
    }
    assert!(conn.is_running());

    conn.close().await;
}
