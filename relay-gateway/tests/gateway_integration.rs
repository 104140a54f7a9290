use std::io::Write;
use std::net::TcpStream;
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, Sender};

use relay_common::message::Command;
use relay_common::GatewayConfig;
use relay_gateway::{GatewayRuntime, StateClient};

/// Captures every dispatched command so tests can assert on gateway behavior without a real
/// state service.
struct RecordingStateClient {
    sender: Sender<(u64, Command)>,
    closed: Sender<u64>,
}

impl StateClient for RecordingStateClient {
    fn dispatch(&self, conn_id: u64, command: Command) {
        let _ = self.sender.send((conn_id, command));
    }

    fn notify_closed(&self, conn_id: u64) {
        let _ = self.closed.send(conn_id);
    }
}

fn encode(command: &Command) -> Vec<u8> {
    let payload = bincode::serialize(command).unwrap();
    relay_common::codec::encode_frame(&payload).unwrap()
}

fn recv_within(rx: &Receiver<(u64, Command)>, timeout: Duration) -> (u64, Command) {
    rx.recv_timeout(timeout).expect("expected a dispatched command")
}

#[test]
fn login_frame_reaches_the_state_client() {
    let (cmd_tx, cmd_rx): (Sender<(u64, Command)>, Receiver<(u64, Command)>) = unbounded();
    let (closed_tx, _closed_rx) = unbounded();
    let state: Arc<dyn StateClient> = Arc::new(RecordingStateClient {
        sender: cmd_tx,
        closed: closed_tx,
    });

    let config = GatewayConfig {
        reactor_count: 1,
        worker_pool_size: 2,
        ..Default::default()
    };
    let runtime = GatewayRuntime::start("127.0.0.1:0".parse().unwrap(), &config, state)
        .expect("gateway should bind and start");

    let mut client = TcpStream::connect(runtime.local_addr()).expect("client should connect");
    let frame = encode(&Command::Login { device_id: 7 });
    client.write_all(&frame).expect("client should write the login frame");

    let (conn_id, command) = recv_within(&cmd_rx, Duration::from_secs(2));
    assert!(conn_id > 0);
    assert_eq!(command, Command::Login { device_id: 7 });

    assert_eq!(runtime.connection_count(), 1);

    runtime.request_shutdown();
    runtime.join();
}

#[test]
fn multiple_frames_on_one_connection_are_each_dispatched() {
    let (cmd_tx, cmd_rx): (Sender<(u64, Command)>, Receiver<(u64, Command)>) = unbounded();
    let (closed_tx, _closed_rx) = unbounded();
    let state: Arc<dyn StateClient> = Arc::new(RecordingStateClient {
        sender: cmd_tx,
        closed: closed_tx,
    });

    let config = GatewayConfig {
        reactor_count: 2,
        worker_pool_size: 4,
        ..Default::default()
    };
    let runtime = GatewayRuntime::start("127.0.0.1:0".parse().unwrap(), &config, state)
        .expect("gateway should bind and start");

    let mut client = TcpStream::connect(runtime.local_addr()).expect("client should connect");
    client
        .write_all(&encode(&Command::Login { device_id: 1 }))
        .unwrap();
    client.write_all(&encode(&Command::Heartbeat)).unwrap();

    let first = recv_within(&cmd_rx, Duration::from_secs(2));
    let second = recv_within(&cmd_rx, Duration::from_secs(2));
    assert_eq!(first.0, second.0, "both frames came from the same connection");
    assert_eq!(first.1, Command::Login { device_id: 1 });
    assert_eq!(second.1, Command::Heartbeat);

    runtime.request_shutdown();
    runtime.join();
}

/// Separates the two writes so the second frame arrives only after the first has already been
/// read and dispatched, forcing the connection's socket through a deregister-then-rearm cycle
/// between them rather than letting both frames land in one readiness event.
#[test]
fn a_second_frame_after_the_first_is_dispatched_takes_effect() {
    let (cmd_tx, cmd_rx): (Sender<(u64, Command)>, Receiver<(u64, Command)>) = unbounded();
    let (closed_tx, _closed_rx) = unbounded();
    let state: Arc<dyn StateClient> = Arc::new(RecordingStateClient {
        sender: cmd_tx,
        closed: closed_tx,
    });

    let config = GatewayConfig {
        reactor_count: 1,
        worker_pool_size: 2,
        ..Default::default()
    };
    let runtime = GatewayRuntime::start("127.0.0.1:0".parse().unwrap(), &config, state)
        .expect("gateway should bind and start");

    let mut client = TcpStream::connect(runtime.local_addr()).expect("client should connect");
    client
        .write_all(&encode(&Command::Login { device_id: 42 }))
        .unwrap();
    let (login_conn_id, login_command) = recv_within(&cmd_rx, Duration::from_secs(2));
    assert_eq!(login_command, Command::Login { device_id: 42 });

    // Give the reactor time to finish rearming before the second frame arrives; without a
    // working rearm the connection's socket is left deregistered and this never shows up.
    std::thread::sleep(Duration::from_millis(100));

    client.write_all(&encode(&Command::Heartbeat)).unwrap();
    let (heartbeat_conn_id, heartbeat_command) = recv_within(&cmd_rx, Duration::from_secs(2));
    assert_eq!(heartbeat_conn_id, login_conn_id, "same connection across both frames");
    assert_eq!(heartbeat_command, Command::Heartbeat);

    assert_eq!(runtime.connection_count(), 1, "connection must still be open after both frames");

    runtime.request_shutdown();
    runtime.join();
}
