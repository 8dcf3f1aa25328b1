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

//! Companion bridge simulator for manual testing.
//!
//! Usage: cargo run --bin phone_sim -- [address] [skew_ms] [zone]
//!
//! Listens like the phone bridge, answers every TIME_REQ with the local
//! time shifted by `skew_ms` and sends a heartbeat every 30 seconds.

use anyhow::Result;
use std::env;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};

use wear_timesync::companion::protocol::TimeRequestPayload;
use wear_timesync::companion::{Message, MessageType, TimeResponsePayload};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    let args: Vec<String> = env::args().collect();
    let address = args.get(1).map(|s| s.as_str()).unwrap_or("127.0.0.1:7420");
    let skew_ms: i64 = match args.get(2) {
        Some(skew) => skew.parse()?,
        None => 0,
    };
    let zone = args.get(3).cloned();

    let listener = TcpListener::bind(address).await?;
    println!("Phone simulator listening on {} (skew {} ms)", address, skew_ms);

    loop {
        let (stream, peer) = listener.accept().await?;
        println!("Watch connected from {}", peer);

        if let Err(e) = serve(stream, skew_ms, zone.clone()).await {
            println!("Connection error: {}", e);
        }
        println!("Watch disconnected");
    }
}

async fn serve(stream: TcpStream, skew_ms: i64, zone: Option<String>) -> Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();
    let mut heartbeat = tokio::time::interval(Duration::from_secs(30));

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else {
                    return Ok(());
                };
                let message = match Message::from_json(&line) {
                    Ok(message) => message,
                    Err(e) => {
                        println!("Bad message: {}", e);
                        continue;
                    }
                };

                match message.message_type {
                    MessageType::TimeRequest => {
                        let request = TimeRequestPayload::from_json(&message.payload)?;
                        let now = SystemTime::now().duration_since(UNIX_EPOCH)?.as_millis() as i64;
                        let response = Message::time_response(&TimeResponsePayload {
                            request_id: Some(request.request_id.clone()),
                            time_millis: now + skew_ms,
                            time_zone: zone.clone(),
                        })?;
                        writer.write_all(response.to_json()?.as_bytes()).await?;
                        println!("Answered time request {}", request.request_id);
                    }
                    MessageType::Ack => {}
                    other => println!("Ignoring {}", other.as_str()),
                }
            }
            _ = heartbeat.tick() => {
                writer.write_all(Message::heartbeat().to_json()?.as_bytes()).await?;
            }
        }
    }
}
