//! Test harness for driving a relay engine over loopback TCP.
//!
//! - `CentralSink`: a stand-in central endpoint that records every reading.
//! - `SensorClient`: a raw sensor connection that can also send garbage.
//! - `next_event` / `wait_until`: wait for a tap event or a status condition.

use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use futures_util::StreamExt;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::codec::FramedRead;

use lib_common::relay::{
    AckPolicy, ForwarderSettings, PowerSettings, Reading, ReadingCodec, RelayEvent, RelaySettings,
};

/// Upper bound for anything a test waits on.
pub const WAIT: Duration = Duration::from_secs(5);

/// Settings for a loopback relay: ephemeral listen port, fast forwarding and
/// a power tick too slow to fire during a test.
pub fn test_settings(central_addr: SocketAddr, initial_level: f64) -> RelaySettings {
    RelaySettings {
        listen_addr: SocketAddr::from((Ipv4Addr::LOCALHOST, 0)),
        central_addr: central_addr.to_string(),
        forwarder: ForwarderSettings {
            interval: Duration::from_millis(100),
            timeout: Duration::from_secs(2),
            ack_policy: AckPolicy::Batch,
        },
        power: PowerSettings {
            initial_level,
            ..PowerSettings::default()
        },
        power_tick: Duration::from_secs(3600),
        ..RelaySettings::default()
    }
}

pub fn reading(sensor_id: &str, temperature: f64, humidity: f64) -> Reading {
    Reading::new(sensor_id, temperature, humidity, "2024-05-01T12:00:00Z")
}

/// Waits for the next event matching `pred`, skipping everything else.
pub async fn next_event<F>(events: &mut broadcast::Receiver<RelayEvent>, mut pred: F) -> RelayEvent
where
    F: FnMut(&RelayEvent) -> bool,
{
    let wait = async {
        loop {
            match events.recv().await {
                Ok(event) if pred(&event) => return event,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("relay event tap closed"),
            }
        }
    };
    timeout(WAIT, wait)
        .await
        .expect("timed out waiting for relay event")
}

/// Polls `condition` until it holds.
pub async fn wait_until<F>(mut condition: F)
where
    F: FnMut() -> bool,
{
    let poll = async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    };
    timeout(WAIT, poll)
        .await
        .expect("timed out waiting for condition")
}

/// Waits until `count` readings were ingested.
pub async fn ingested(events: &mut broadcast::Receiver<RelayEvent>, count: usize) -> Vec<Reading> {
    let mut readings = Vec::with_capacity(count);
    while readings.len() < count {
        if let RelayEvent::Ingested(reading) =
            next_event(events, |e| matches!(e, RelayEvent::Ingested(_))).await
        {
            readings.push(reading);
        }
    }
    readings
}

/// Central endpoint stand-in. Accepts any number of connections and hands
/// every decoded reading to the test in arrival order.
pub struct CentralSink {
    addr: SocketAddr,
    received: mpsc::UnboundedReceiver<Reading>,
    task: JoinHandle<()>,
}

impl CentralSink {
    pub async fn start() -> Self {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0))
            .await
            .expect("bind central sink");
        let addr = listener.local_addr().expect("central sink address");
        let (tx, received) = mpsc::unbounded_channel();
        let task = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let tx = tx.clone();
                tokio::spawn(async move {
                    let mut frames = FramedRead::new(stream, ReadingCodec::default());
                    while let Some(Ok(reading)) = frames.next().await {
                        if tx.send(reading).is_err() {
                            break;
                        }
                    }
                });
            }
        });
        Self {
            addr,
            received,
            task,
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Waits for the next `count` readings.
    pub async fn expect(&mut self, count: usize) -> Vec<Reading> {
        let mut readings = Vec::with_capacity(count);
        while readings.len() < count {
            let reading = timeout(WAIT, self.received.recv())
                .await
                .expect("timed out waiting for forwarded readings")
                .expect("central sink stopped");
            readings.push(reading);
        }
        readings
    }

    /// Asserts that nothing arrives within `period`.
    pub async fn expect_nothing(&mut self, period: Duration) {
        if let Ok(Some(reading)) = timeout(period, self.received.recv()).await {
            panic!("unexpected reading forwarded: {reading:?}");
        }
    }
}

impl Drop for CentralSink {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// A sensor connection writing raw bytes.
pub struct SensorClient {
    stream: TcpStream,
}

impl SensorClient {
    pub async fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.expect("connect to relay");
        Self { stream }
    }

    pub async fn send(&mut self, reading: &Reading) {
        let mut line = serde_json::to_vec(reading).expect("serialize reading");
        line.push(b'\n');
        self.send_raw(&line).await;
    }

    pub async fn send_raw(&mut self, bytes: &[u8]) {
        self.stream.write_all(bytes).await.expect("write to relay");
    }

    /// Half-closes the connection so the relay sees end of stream.
    pub async fn finish(mut self) {
        self.stream.shutdown().await.expect("shutdown sensor stream");
    }
}
