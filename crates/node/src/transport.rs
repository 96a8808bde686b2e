//! Getting queued telemetry off the node.
//!
//! The radio is the most expensive thing the node does, so a flush is one
//! short session: connect with bounded retries, publish every queued
//! message at QoS 1, disconnect.  If the broker cannot be reached the cycle's
//! messages are dropped; the queue does not survive sleep anyway.

use anyhow::{bail, ensure, Context, Result};
use rumqttc::{AsyncClient, ConnectReturnCode, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS};
use std::time::Duration;
use tokio::time::{sleep, timeout_at, Instant};
use tracing::{debug, error, info, warn};

use crate::queue::MessageQueue;

/// A connection to the collector.
#[allow(async_fn_in_trait)]
pub trait Transport {
    async fn connect(&mut self) -> Result<()>;
    async fn publish(&mut self, topic: &str, payload: &[u8]) -> Result<()>;
    async fn disconnect(&mut self);
    /// False once the session is gone, including after a failed publish.
    fn is_connected(&self) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub backoff: Duration,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushReport {
    pub connected: bool,
    /// Connect attempts made, reconnects included.
    pub attempts: u32,
    pub published: usize,
    /// Messages that exhausted their publish retries.
    pub failed: usize,
    /// Messages discarded because no connection could be made.
    pub dropped: usize,
}

async fn connect_with_retry<T: Transport>(
    transport: &mut T,
    policy: RetryPolicy,
    report: &mut FlushReport,
) -> bool {
    let attempts = policy.attempts.max(1);
    for attempt in 1..=attempts {
        report.attempts += 1;
        match transport.connect().await {
            Ok(()) => return true,
            Err(e) => {
                warn!(attempt, max_attempts = attempts, "transport: connect failed: {e:#}");
                if attempt < attempts {
                    sleep(policy.backoff).await;
                }
            }
        }
    }
    false
}

/// Drain `outbox` through `transport`.  A session lost mid-flush is
/// re-established before the next publish attempt.
pub async fn flush<T: Transport>(
    transport: &mut T,
    outbox: &mut MessageQueue,
    policy: RetryPolicy,
) -> FlushReport {
    let mut report = FlushReport::default();
    if outbox.is_empty() {
        debug!("transport: nothing queued");
        return report;
    }

    report.connected = connect_with_retry(transport, policy, &mut report).await;
    if !report.connected {
        report.dropped = outbox.clear();
        error!(
            dropped = report.dropped,
            "transport: broker unreachable, skipping publish this cycle"
        );
        return report;
    }

    let attempts = policy.attempts.max(1);
    while let Some(msg) = outbox.dequeue() {
        let mut delivered = false;
        for attempt in 1..=attempts {
            if !transport.is_connected() {
                info!(topic = %msg.topic, "transport: session lost, reconnecting");
                if !connect_with_retry(transport, policy, &mut report).await {
                    report.dropped = 1 + outbox.clear();
                    error!(
                        published = report.published,
                        dropped = report.dropped,
                        "transport: reconnect failed, dropping the rest of this cycle"
                    );
                    return report;
                }
            }
            match transport.publish(&msg.topic, &msg.payload).await {
                Ok(()) => {
                    delivered = true;
                    break;
                }
                Err(e) => {
                    warn!(topic = %msg.topic, attempt, "transport: publish failed: {e:#}");
                    // A lost session is retried through the reconnect instead.
                    if attempt < attempts && transport.is_connected() {
                        sleep(policy.backoff).await;
                    }
                }
            }
        }
        if delivered {
            report.published += 1;
        } else {
            report.failed += 1;
        }
    }

    transport.disconnect().await;
    info!(
        published = report.published,
        failed = report.failed,
        connect_attempts = report.attempts,
        "transport: flush complete"
    );
    report
}

// ---------------------------------------------------------------------------
// MQTT
// ---------------------------------------------------------------------------

/// One broker session per flush over `rumqttc`.  The event loop is driven
/// inline: every call polls it until the matching acknowledgement arrives.
pub struct MqttTransport {
    options: MqttOptions,
    ack_timeout: Duration,
    session: Option<(AsyncClient, EventLoop)>,
}

impl MqttTransport {
    pub fn new(client_id: &str, host: &str, port: u16, keep_alive: Duration, ack_timeout: Duration) -> Self {
        let mut options = MqttOptions::new(client_id, host, port);
        options.set_keep_alive(keep_alive);
        Self {
            options,
            ack_timeout,
            session: None,
        }
    }

    /// Poll until `done` matches an event, the deadline passes, or the
    /// connection errors.  Any failure tears the session down.
    async fn poll_until(
        &mut self,
        what: &str,
        mut done: impl FnMut(&Event) -> Result<bool>,
    ) -> Result<()> {
        let ack_timeout = self.ack_timeout;
        let deadline = Instant::now() + ack_timeout;
        let result = match self.session.as_mut() {
            None => Err(anyhow::anyhow!("not connected")),
            Some((_, eventloop)) => loop {
                match timeout_at(deadline, eventloop.poll()).await {
                    Err(_) => break Err(anyhow::anyhow!("no {what} within {ack_timeout:?}")),
                    Ok(Err(e)) => break Err(anyhow::Error::new(e).context(format!("waiting for {what}"))),
                    Ok(Ok(event)) => match done(&event) {
                        Ok(true) => break Ok(()),
                        Ok(false) => {}
                        Err(e) => break Err(e),
                    },
                }
            },
        };
        if result.is_err() {
            self.session = None;
        }
        result
    }
}

impl Transport for MqttTransport {
    async fn connect(&mut self) -> Result<()> {
        let (client, eventloop) = AsyncClient::new(self.options.clone(), 10);
        self.session = Some((client, eventloop));
        self.poll_until("CONNACK", |event| match event {
            Event::Incoming(Packet::ConnAck(ack)) => {
                ensure!(
                    ack.code == ConnectReturnCode::Success,
                    "broker refused connection: {:?}",
                    ack.code
                );
                Ok(true)
            }
            _ => Ok(false),
        })
        .await?;
        let (host, port) = self.options.broker_address();
        info!(%host, port, client_id = %self.options.client_id(), "transport: connected");
        Ok(())
    }

    async fn publish(&mut self, topic: &str, payload: &[u8]) -> Result<()> {
        let Some((client, _)) = self.session.as_ref() else {
            bail!("not connected");
        };
        client
            .publish(topic, QoS::AtLeastOnce, false, payload.to_vec())
            .await
            .with_context(|| format!("failed to queue publish to {topic}"))?;
        // Only the ack for the packet id this publish went out with counts.
        let mut sent = None;
        self.poll_until("PUBACK", |event| {
            match event {
                Event::Outgoing(Outgoing::Publish(pkid)) => sent = Some(*pkid),
                Event::Incoming(Packet::PubAck(ack)) => return Ok(Some(ack.pkid) == sent),
                _ => {}
            }
            Ok(false)
        })
        .await?;
        debug!(topic, bytes = payload.len(), "transport: published");
        Ok(())
    }

    async fn disconnect(&mut self) {
        let Some((client, _)) = self.session.as_ref() else {
            return;
        };
        if let Err(e) = client.disconnect().await {
            warn!("transport: disconnect request failed: {e}");
        }
        if let Err(e) = self
            .poll_until("DISCONNECT", |event| {
                Ok(matches!(event, Event::Outgoing(Outgoing::Disconnect)))
            })
            .await
        {
            debug!("transport: disconnect not confirmed: {e:#}");
        }
        self.session = None;
    }

    fn is_connected(&self) -> bool {
        self.session.is_some()
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::io::{Read, Write};
    use std::net::{TcpListener, TcpStream};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[derive(Default)]
    struct MockTransport {
        connect_results: VecDeque<bool>,
        publish_results: VecDeque<bool>,
        /// A failed publish tears the session down, like a missed ack.
        lose_session_on_failure: bool,
        connected: bool,
        connects: u32,
        published: Vec<(String, Vec<u8>)>,
        disconnected: bool,
    }

    impl Transport for MockTransport {
        async fn connect(&mut self) -> Result<()> {
            self.connects += 1;
            if self.connect_results.pop_front().unwrap_or(true) {
                self.connected = true;
                Ok(())
            } else {
                bail!("association timed out")
            }
        }

        async fn publish(&mut self, topic: &str, payload: &[u8]) -> Result<()> {
            ensure!(self.connected, "not connected");
            if self.publish_results.pop_front().unwrap_or(true) {
                self.published.push((topic.to_string(), payload.to_vec()));
                Ok(())
            } else {
                if self.lose_session_on_failure {
                    self.connected = false;
                }
                bail!("socket closed")
            }
        }

        async fn disconnect(&mut self) {
            self.connected = false;
            self.disconnected = true;
        }

        fn is_connected(&self) -> bool {
            self.connected
        }
    }

    // -- Loopback broker ---------------------------------------------------

    fn read_packet(stream: &mut TcpStream) -> Option<(u8, Vec<u8>)> {
        let mut byte = [0u8; 1];
        stream.read_exact(&mut byte).ok()?;
        let header = byte[0];
        let mut len = 0usize;
        let mut shift = 0;
        loop {
            stream.read_exact(&mut byte).ok()?;
            len |= ((byte[0] & 0x7F) as usize) << shift;
            if byte[0] & 0x80 == 0 {
                break;
            }
            shift += 7;
        }
        let mut body = vec![0u8; len];
        stream.read_exact(&mut body).ok()?;
        Some((header, body))
    }

    fn serve(mut stream: TcpStream, seen: &AtomicUsize, ignore: usize) {
        while let Some((header, body)) = read_packet(&mut stream) {
            let reply = match header >> 4 {
                // CONNECT
                1 => Some(vec![0x20, 0x02, 0x00, 0x00]),
                // PUBLISH, QoS 1: topic, packet id, payload
                3 => {
                    let n = seen.fetch_add(1, Ordering::SeqCst);
                    let topic_len = u16::from_be_bytes([body[0], body[1]]) as usize;
                    let pkid = [body[2 + topic_len], body[3 + topic_len]];
                    (n >= ignore).then(|| vec![0x40, 0x02, pkid[0], pkid[1]])
                }
                // PINGREQ
                12 => Some(vec![0xD0, 0x00]),
                // DISCONNECT
                14 => break,
                _ => None,
            };
            if let Some(reply) = reply {
                if stream.write_all(&reply).is_err() {
                    break;
                }
            }
        }
    }

    /// MQTT 3.1.1 on a loopback port that never acks the first `ignore`
    /// PUBLISH packets.  Returns the port and the PUBLISH count.
    fn spawn_broker(ignore: usize) -> (u16, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        std::thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(stream) = stream else { break };
                let counter = counter.clone();
                std::thread::spawn(move || serve(stream, &counter, ignore));
            }
        });
        (port, seen)
    }

    const POLICY: RetryPolicy = RetryPolicy {
        attempts: 3,
        backoff: Duration::from_millis(1),
    };

    fn queue_of(n: usize) -> MessageQueue {
        let mut q = MessageQueue::new(16);
        for i in 0..n {
            q.enqueue(&format!("tele/test/{i}"), &i);
        }
        q
    }

    #[tokio::test]
    async fn publishes_everything_in_order() {
        let mut t = MockTransport::default();
        let mut q = queue_of(3);
        let report = flush(&mut t, &mut q, POLICY).await;

        assert!(report.connected);
        assert_eq!(report.attempts, 1);
        assert_eq!(report.published, 3);
        assert!(q.is_empty());
        assert!(t.disconnected);
        let topics: Vec<&str> = t.published.iter().map(|(t, _)| t.as_str()).collect();
        assert_eq!(topics, vec!["tele/test/0", "tele/test/1", "tele/test/2"]);
        assert_eq!(t.published[1].1, b"1".to_vec());
    }

    #[tokio::test]
    async fn empty_queue_never_touches_the_radio() {
        let mut t = MockTransport::default();
        let report = flush(&mut t, &mut MessageQueue::new(4), POLICY).await;
        assert_eq!(report, FlushReport::default());
        assert_eq!(t.connects, 0);
    }

    #[tokio::test]
    async fn connect_retries_then_succeeds() {
        let mut t = MockTransport {
            connect_results: VecDeque::from([false, false, true]),
            ..Default::default()
        };
        let report = flush(&mut t, &mut queue_of(1), POLICY).await;
        assert!(report.connected);
        assert_eq!(report.attempts, 3);
        assert_eq!(report.published, 1);
    }

    #[tokio::test]
    async fn exhausted_connect_drops_the_cycle() {
        let mut t = MockTransport {
            connect_results: VecDeque::from([false, false, false, true]),
            ..Default::default()
        };
        let mut q = queue_of(2);
        let report = flush(&mut t, &mut q, POLICY).await;
        assert!(!report.connected);
        assert_eq!(t.connects, 3);
        assert_eq!(report.dropped, 2);
        assert!(q.is_empty());
        assert!(t.published.is_empty());
        assert!(!t.disconnected);
    }

    #[tokio::test]
    async fn publish_retries_are_bounded_per_message() {
        let mut t = MockTransport {
            publish_results: VecDeque::from([false, true, false, false, false, true]),
            ..Default::default()
        };
        let report = flush(&mut t, &mut queue_of(3), POLICY).await;
        assert_eq!(report.published, 2);
        assert_eq!(report.failed, 1);
        let topics: Vec<&str> = t.published.iter().map(|(t, _)| t.as_str()).collect();
        assert_eq!(topics, vec!["tele/test/0", "tele/test/2"]);
    }

    #[tokio::test]
    async fn lost_session_is_reestablished_before_retrying() {
        let mut t = MockTransport {
            publish_results: VecDeque::from([false]),
            lose_session_on_failure: true,
            ..Default::default()
        };
        let report = flush(&mut t, &mut queue_of(3), POLICY).await;
        assert_eq!(report.published, 3);
        assert_eq!(report.failed, 0);
        assert_eq!(report.attempts, 2);
        assert_eq!(t.connects, 2);
        let topics: Vec<&str> = t.published.iter().map(|(t, _)| t.as_str()).collect();
        assert_eq!(topics, vec!["tele/test/0", "tele/test/1", "tele/test/2"]);
    }

    #[tokio::test]
    async fn failed_reconnect_drops_the_rest_of_the_cycle() {
        let mut t = MockTransport {
            connect_results: VecDeque::from([true, false, false, false]),
            publish_results: VecDeque::from([true, false]),
            lose_session_on_failure: true,
            ..Default::default()
        };
        let mut q = queue_of(4);
        let report = flush(&mut t, &mut q, POLICY).await;
        assert_eq!(report.published, 1);
        assert_eq!(report.failed, 0);
        assert_eq!(report.dropped, 3);
        assert_eq!(report.attempts, 4);
        assert!(q.is_empty());
    }

    #[tokio::test]
    async fn mqtt_unacked_publish_reconnects_and_delivers_everything() {
        let (port, seen) = spawn_broker(1);
        let mut t = MqttTransport::new(
            "weather-node-test",
            "127.0.0.1",
            port,
            Duration::from_secs(30),
            Duration::from_millis(300),
        );
        let report = flush(&mut t, &mut queue_of(3), POLICY).await;

        assert!(report.connected);
        assert_eq!(report.published, 3, "{report:?}");
        assert_eq!(report.failed, 0);
        assert_eq!(report.attempts, 2, "one reconnect after the missed ack");
        assert_eq!(seen.load(Ordering::SeqCst), 4);
        assert!(!t.is_connected());
    }

    #[tokio::test]
    async fn mqtt_publish_without_session_fails() {
        let mut t = MqttTransport::new(
            "weather-node-test",
            "127.0.0.1",
            1883,
            Duration::from_secs(30),
            Duration::from_millis(10),
        );
        assert!(!t.is_connected());
        assert!(t.publish("tele/test/x", b"{}").await.is_err());
        t.disconnect().await;
    }
}
