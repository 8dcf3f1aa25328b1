// Copyright 2026 Daniel Pelikan
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Companion connection handler.

use anyhow::{anyhow, Result};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::protocol::{Message, MessageType, TimeResponsePayload};
use crate::events::{EventSender, SourceInput, SyncEvent};

/// Outgoing side of the companion link, as seen by the phone syncer.
pub trait CompanionLink: Send + Sync {
    /// Whether a connection to the phone is currently up.
    fn is_connected(&self) -> bool;

    /// Queue a message for the phone.
    fn send(&self, message: Message) -> Result<()>;
}

/// What to do with one received line.
#[derive(Debug)]
struct LineAction {
    event: Option<SyncEvent>,
    reply: Option<Message>,
}

/// TCP client for the companion bridge, reconnecting forever.
pub struct CompanionClient {
    address: String,
    reconnect_delay: Duration,
    outgoing: Mutex<Option<mpsc::UnboundedSender<Message>>>,
}

impl CompanionClient {
    pub fn new(address: impl Into<String>, reconnect_delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            address: address.into(),
            reconnect_delay,
            outgoing: Mutex::new(None),
        })
    }

    /// Run the connect loop in the background.
    pub fn spawn(self: Arc<Self>, events: EventSender) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                match TcpStream::connect(&self.address).await {
                    Ok(stream) => {
                        info!("Companion connected: {}", self.address);
                        if let Err(e) = self.run(stream, &events).await {
                            error!("Companion connection error: {}", e);
                        }
                    }
                    Err(e) => {
                        debug!("Companion not reachable at {}: {}", self.address, e);
                    }
                }

                if events.is_closed() {
                    break;
                }
                tokio::time::sleep(self.reconnect_delay).await;
            }
        })
    }

    /// Serve one connection until it closes.
    async fn run<S>(&self, stream: S, events: &EventSender) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let (reader, mut writer) = tokio::io::split(stream);
        let mut lines = BufReader::new(reader).lines();

        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Message>();
        *self.outgoing.lock() = Some(out_tx);
        let _ = events.send(SyncEvent::CompanionConnected {
            address: self.address.clone(),
        });

        let result = loop {
            tokio::select! {
                // next_line keeps partial input across cancellation.
                read = lines.next_line() => {
                    match read {
                        Ok(None) => {
                            info!("Companion closed the connection");
                            break Ok(());
                        }
                        Ok(Some(line)) if line.trim().is_empty() => {}
                        Ok(Some(line)) => {
                            debug!("Received: {}", line.trim());
                            match handle_line(&line) {
                                Ok(action) => {
                                    if let Some(event) = action.event {
                                        let _ = events.send(event);
                                    }
                                    if let Some(reply) = action.reply {
                                        if let Err(e) = write_message(&mut writer, &reply).await {
                                            break Err(e);
                                        }
                                    }
                                }
                                Err(e) => warn!("Dropping companion message: {}", e),
                            }
                        }
                        Err(e) => break Err(e.into()),
                    }
                }
                Some(message) = out_rx.recv() => {
                    debug!("Sending {}", message.message_type.as_str());
                    if let Err(e) = write_message(&mut writer, &message).await {
                        break Err(e);
                    }
                }
            }
        };

        *self.outgoing.lock() = None;
        let _ = events.send(SyncEvent::CompanionDisconnected);
        result
    }
}

impl CompanionLink for CompanionClient {
    fn is_connected(&self) -> bool {
        self.outgoing.lock().is_some()
    }

    fn send(&self, message: Message) -> Result<()> {
        let outgoing = self.outgoing.lock();
        let tx = outgoing
            .as_ref()
            .ok_or_else(|| anyhow!("Companion not connected"))?;
        tx.send(message)
            .map_err(|_| anyhow!("Companion connection closed"))
    }
}

async fn write_message<W: AsyncWrite + Unpin>(writer: &mut W, message: &Message) -> Result<()> {
    let json = message.to_json()?;
    writer.write_all(json.as_bytes()).await?;
    writer.flush().await?;
    Ok(())
}

/// Decode one line from the phone.
fn handle_line(line: &str) -> Result<LineAction> {
    let message = Message::from_json(line)?;

    let action = match message.message_type {
        MessageType::TimeResponse => {
            let payload = TimeResponsePayload::from_json(&message.payload)?;
            LineAction {
                event: Some(SyncEvent::Input(SourceInput::PhoneTime(payload))),
                reply: Some(Message::ack(message.timestamp)),
            }
        }
        MessageType::Heartbeat => LineAction {
            event: None,
            reply: Some(Message::ack(message.timestamp)),
        },
        MessageType::Ack => {
            debug!("ACK received for timestamp: {}", message.payload);
            LineAction {
                event: None,
                reply: None,
            }
        }
        MessageType::TimeRequest => {
            warn!("Unexpected TIME_REQ from companion");
            LineAction {
                event: None,
                reply: None,
            }
        }
    };

    Ok(action)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events;
    use crate::companion::protocol::TimeRequestPayload;

    #[test]
    fn test_heartbeat_acknowledged() {
        let heartbeat = Message::heartbeat();
        let action = handle_line(&heartbeat.to_json().unwrap()).unwrap();

        assert!(action.event.is_none());
        let reply = action.reply.unwrap();
        assert_eq!(reply.message_type, MessageType::Ack);
        assert_eq!(reply.payload, heartbeat.timestamp.to_string());
    }

    #[test]
    fn test_time_response_forwarded() {
        let payload = TimeResponsePayload {
            request_id: Some("abc".to_string()),
            time_millis: 42,
            time_zone: None,
        };
        let msg = Message::time_response(&payload).unwrap();
        let action = handle_line(&msg.to_json().unwrap()).unwrap();

        match action.event {
            Some(SyncEvent::Input(SourceInput::PhoneTime(received))) => {
                assert_eq!(received, payload)
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_garbage_rejected() {
        assert!(handle_line("not json\n").is_err());
    }

    #[tokio::test]
    async fn test_connection_round_trip() {
        let (tx, mut rx) = events::channel();
        let client = CompanionClient::new("phone", Duration::from_secs(1));
        let (local, remote) = tokio::io::duplex(4096);

        let serving = client.clone();
        let task = tokio::spawn(async move { serving.run(local, &tx).await });

        assert!(matches!(
            rx.recv().await,
            Some(SyncEvent::CompanionConnected { .. })
        ));
        assert!(client.is_connected());

        let (phone_read, mut phone_write) = tokio::io::split(remote);
        let mut phone_read = BufReader::new(phone_read);

        client.send(Message::time_request("r1").unwrap()).unwrap();
        let mut line = String::new();
        phone_read.read_line(&mut line).await.unwrap();
        let request = Message::from_json(&line).unwrap();
        assert_eq!(request.message_type, MessageType::TimeRequest);
        assert_eq!(
            TimeRequestPayload::from_json(&request.payload).unwrap().request_id,
            "r1"
        );

        let response = Message::time_response(&TimeResponsePayload {
            request_id: Some("r1".to_string()),
            time_millis: 1_000,
            time_zone: Some("UTC".to_string()),
        })
        .unwrap();
        write_message(&mut phone_write, &response).await.unwrap();

        assert!(matches!(
            rx.recv().await,
            Some(SyncEvent::Input(SourceInput::PhoneTime(_)))
        ));

        drop(phone_write);
        drop(phone_read);
        task.await.unwrap().unwrap();

        assert!(matches!(rx.recv().await, Some(SyncEvent::CompanionDisconnected)));
        assert!(!client.is_connected());
    }

    #[tokio::test]
    async fn test_line_split_around_outgoing_message() {
        let (tx, mut rx) = events::channel();
        let client = CompanionClient::new("phone", Duration::from_secs(1));
        let (local, remote) = tokio::io::duplex(4096);

        let serving = client.clone();
        let _task = tokio::spawn(async move { serving.run(local, &tx).await });
        assert!(matches!(
            rx.recv().await,
            Some(SyncEvent::CompanionConnected { .. })
        ));

        let (phone_read, mut phone_write) = tokio::io::split(remote);
        let mut phone_read = BufReader::new(phone_read);

        let response = Message::time_response(&TimeResponsePayload {
            request_id: Some("r2".to_string()),
            time_millis: 5_000,
            time_zone: None,
        })
        .unwrap()
        .to_json()
        .unwrap();
        let (head, tail) = response.split_at(response.len() / 2);

        phone_write.write_all(head.as_bytes()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        // The outgoing message interrupts the pending read.
        client.send(Message::heartbeat()).unwrap();
        let mut line = String::new();
        phone_read.read_line(&mut line).await.unwrap();
        assert_eq!(
            Message::from_json(&line).unwrap().message_type,
            MessageType::Heartbeat
        );

        phone_write.write_all(tail.as_bytes()).await.unwrap();

        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap();
        match event {
            Some(SyncEvent::Input(SourceInput::PhoneTime(payload))) => {
                assert_eq!(payload.request_id.as_deref(), Some("r2"));
                assert_eq!(payload.time_millis, 5_000);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }
}
