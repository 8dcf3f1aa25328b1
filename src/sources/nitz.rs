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

//! Cellular NITZ time source.

use anyhow::{anyhow, bail, Result};
use chrono::NaiveDate;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::TimeSource;
use crate::clock::{adjust_clock, SystemClock};
use crate::events::{EventSender, SourceInput, SourceKind, SyncEvent, SyncOutcome};
use crate::timezone::TimeZoneMediator;

/// UTC offsets stay within ±14 h, in quarter hours.
const MAX_OFFSET_QUARTERS: i32 = 14 * 4;

/// A parsed NITZ report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NitzSignal {
    /// Network time in milliseconds since the UNIX epoch.
    pub utc_millis: i64,
    /// Total UTC offset including DST, in minutes.
    pub offset_minutes: i32,
    /// DST adjustment in hours, when reported.
    pub dst_hours: Option<i32>,
    /// IANA zone id, when reported.
    pub zone_id: Option<String>,
    /// Monotonic time the report was received.
    pub received_elapsed_millis: i64,
}

impl NitzSignal {
    /// Parse `yy/mm/dd,hh:mm:ss(+|-)tz[,dt[,tzid]]`.
    ///
    /// Date and time are UTC, `tz` is the offset in quarter hours and
    /// `tzid` uses `!` in place of `/`.
    pub fn parse(nitz: &str, received_elapsed_millis: i64) -> Result<Self> {
        let nitz = nitz.trim().trim_matches('"');
        let mut fields = nitz.split(',');

        let date = fields.next().ok_or_else(|| anyhow!("missing date"))?;
        let time_and_zone = fields.next().ok_or_else(|| anyhow!("missing time"))?;
        let dst = fields.next();
        let zone = fields.next();

        let ymd: Vec<&str> = date.split('/').collect();
        if ymd.len() != 3 {
            bail!("malformed date '{}'", date);
        }
        let yy = parse_field(ymd[0], "year")?;
        if yy > 99 {
            bail!("year '{}' is not two digits", ymd[0]);
        }
        let year = 2000 + yy as i32;
        let month = parse_field(ymd[1], "month")?;
        let day = parse_field(ymd[2], "day")?;

        let sign_pos = time_and_zone
            .find(|c: char| c == '+' || c == '-')
            .ok_or_else(|| anyhow!("missing zone offset in '{}'", time_and_zone))?;
        let (time, offset) = time_and_zone.split_at(sign_pos);

        let hms: Vec<&str> = time.split(':').collect();
        if hms.len() != 3 {
            bail!("malformed time '{}'", time);
        }
        let hour = parse_field(hms[0], "hour")?;
        let minute = parse_field(hms[1], "minute")?;
        let second = parse_field(hms[2], "second")?;

        let quarters: i32 = offset
            .parse()
            .map_err(|_| anyhow!("malformed zone offset '{}'", offset))?;
        if !(-MAX_OFFSET_QUARTERS..=MAX_OFFSET_QUARTERS).contains(&quarters) {
            bail!("zone offset '{}' out of range", offset);
        }

        let dst_hours = match dst {
            Some(dst) if !dst.trim().is_empty() => Some(
                dst.trim()
                    .parse()
                    .map_err(|_| anyhow!("malformed DST field '{}'", dst))?,
            ),
            _ => None,
        };

        let zone_id = zone
            .map(|z| z.trim().replace('!', "/"))
            .filter(|z| !z.is_empty());

        let utc = NaiveDate::from_ymd_opt(year, month, day)
            .and_then(|d| d.and_hms_opt(hour, minute, second))
            .ok_or_else(|| anyhow!("invalid date/time in '{}'", nitz))?
            .and_utc();

        Ok(Self {
            utc_millis: utc.timestamp_millis(),
            offset_minutes: quarters * 15,
            dst_hours,
            zone_id,
            received_elapsed_millis,
        })
    }
}

fn parse_field(s: &str, name: &str) -> Result<u32> {
    s.trim()
        .parse()
        .map_err(|_| anyhow!("malformed {} '{}'", name, s))
}

/// Something that reports NITZ strings from the modem.
pub trait NitzFeed: Send + Sync {
    /// Start listening, delivering parsed reports as events.
    fn spawn(&self, clock: Arc<dyn SystemClock>, events: EventSender) -> JoinHandle<()>;
}

/// Reads NITZ lines from a modem device or pipe.
///
/// Accepts bare NITZ strings and `+CTZE:`/`+NITZ:` style unsolicited results
/// carrying one.
pub struct ModemNitzFeed {
    device: PathBuf,
}

impl ModemNitzFeed {
    pub fn new(device: impl Into<PathBuf>) -> Self {
        Self {
            device: device.into(),
        }
    }
}

/// Strip an unsolicited result prefix such as `+CTZE: `.
fn nitz_payload(line: &str) -> &str {
    let line = line.trim();
    match line.split_once(':') {
        Some((prefix, rest)) if prefix.starts_with('+') => rest.trim(),
        _ => line,
    }
}

impl NitzFeed for ModemNitzFeed {
    fn spawn(&self, clock: Arc<dyn SystemClock>, events: EventSender) -> JoinHandle<()> {
        let device = self.device.clone();
        tokio::spawn(async move {
            let file = match tokio::fs::File::open(&device).await {
                Ok(file) => file,
                Err(e) => {
                    error!("Cannot open NITZ device {:?}: {}", device, e);
                    return;
                }
            };
            info!("Listening for NITZ on {:?}", device);

            let mut lines = BufReader::new(file).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) if line.trim().is_empty() => {}
                    Ok(Some(line)) => {
                        match NitzSignal::parse(nitz_payload(&line), clock.elapsed_millis()) {
                            Ok(signal) => {
                                debug!("NITZ received: {:?}", signal);
                                if events.send(SyncEvent::Input(SourceInput::Nitz(signal))).is_err() {
                                    break;
                                }
                            }
                            Err(e) => warn!("Ignoring NITZ line '{}': {}", line.trim(), e),
                        }
                    }
                    Ok(None) => {
                        // Character devices can report EOF while idle.
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                    Err(e) => {
                        error!("NITZ read error: {}", e);
                        break;
                    }
                }
            }
        })
    }
}

/// Time source driven by cellular NITZ reports.
pub struct NitzTimeSyncer {
    feed: Option<Arc<dyn NitzFeed>>,
    clock: Arc<dyn SystemClock>,
    time_zone: Arc<TimeZoneMediator>,
    events: EventSender,
    drift_threshold: Duration,
    listener: Option<JoinHandle<()>>,
}

impl NitzTimeSyncer {
    pub fn new(
        feed: Option<Arc<dyn NitzFeed>>,
        clock: Arc<dyn SystemClock>,
        time_zone: Arc<TimeZoneMediator>,
        events: EventSender,
        drift_threshold: Duration,
    ) -> Self {
        Self {
            feed,
            clock,
            time_zone,
            events,
            drift_threshold,
            listener: None,
        }
    }

    /// Whether the NITZ listener is running.
    pub fn is_listening(&self) -> bool {
        self.listener
            .as_ref()
            .map(|l| !l.is_finished())
            .unwrap_or(false)
    }

    fn apply(&self, signal: &NitzSignal) -> Result<SyncOutcome> {
        let age = (self.clock.elapsed_millis() - signal.received_elapsed_millis).max(0);
        let adjustment = adjust_clock(
            self.clock.as_ref(),
            signal.utc_millis + age,
            self.drift_threshold,
        )?;

        if let Err(e) = self.time_zone.on_nitz(signal) {
            warn!("NITZ time zone not applied: {}", e);
        }

        Ok(SyncOutcome::Success(adjustment))
    }
}

impl TimeSource for NitzTimeSyncer {
    fn kind(&self) -> SourceKind {
        SourceKind::Nitz
    }

    fn start_update(&mut self) -> Option<SyncOutcome> {
        if self.is_listening() {
            return None;
        }

        let Some(feed) = &self.feed else {
            return Some(SyncOutcome::failure("no NITZ device configured"));
        };

        info!("Starting NITZ listener");
        self.listener = Some(feed.spawn(self.clock.clone(), self.events.clone()));
        None
    }

    fn handle_refresh(&mut self) -> Option<SyncOutcome> {
        None
    }

    fn handle_input(&mut self, input: SourceInput) -> Option<SyncOutcome> {
        let SourceInput::Nitz(signal) = input else {
            return None;
        };

        if self.listener.is_none() {
            debug!("NITZ report while stopped, ignoring");
            return None;
        }

        Some(match self.apply(&signal) {
            Ok(outcome) => outcome,
            Err(e) => SyncOutcome::failure(e.to_string()),
        })
    }

    fn cancel_pending_tasks(&mut self) {
        if let Some(listener) = self.listener.take() {
            listener.abort();
            info!("NITZ listener stopped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::events;
    use crate::state::SyncState;
    use crate::timezone::TimeZoneSink;

    struct NullSink;

    impl TimeZoneSink for NullSink {
        fn current(&self) -> Option<String> {
            None
        }

        fn apply(&self, _zone: &str) -> Result<()> {
            Ok(())
        }
    }

    /// Feed that delivers one fixed report.
    struct OneShotFeed(NitzSignal);

    impl NitzFeed for OneShotFeed {
        fn spawn(&self, _clock: Arc<dyn SystemClock>, events: EventSender) -> JoinHandle<()> {
            let signal = self.0.clone();
            tokio::spawn(async move {
                let _ = events.send(SyncEvent::Input(SourceInput::Nitz(signal)));
                std::future::pending::<()>().await;
            })
        }
    }

    #[test]
    fn test_parse_full() {
        let signal = NitzSignal::parse("24/03/31,01:30:00+8,1,Europe!Berlin", 7).unwrap();

        // 2024-03-31 01:30:00 UTC
        assert_eq!(signal.utc_millis, 1_711_848_600_000);
        assert_eq!(signal.offset_minutes, 120);
        assert_eq!(signal.dst_hours, Some(1));
        assert_eq!(signal.zone_id.as_deref(), Some("Europe/Berlin"));
        assert_eq!(signal.received_elapsed_millis, 7);
    }

    #[test]
    fn test_parse_negative_offset_without_optional_fields() {
        let signal = NitzSignal::parse("15/06/20,01:02:03-32", 0).unwrap();
        assert_eq!(signal.offset_minutes, -480);
        assert_eq!(signal.dst_hours, None);
        assert_eq!(signal.zone_id, None);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(NitzSignal::parse("", 0).is_err());
        assert!(NitzSignal::parse("24/13/01,00:00:00+0", 0).is_err());
        assert!(NitzSignal::parse("24/01/01,25:00:00+0", 0).is_err());
        assert!(NitzSignal::parse("24/01/01,00:00:00", 0).is_err());
        assert!(NitzSignal::parse("24-01-01,00:00:00+4", 0).is_err());
        assert!(NitzSignal::parse("24/01/01,00:00:00+x", 0).is_err());
    }

    #[test]
    fn test_parse_rejects_out_of_range() {
        assert!(NitzSignal::parse("24/01/01,00:00:00+200000000", 0).is_err());
        assert!(NitzSignal::parse("24/01/01,00:00:00-57", 0).is_err());
        assert!(NitzSignal::parse("4294967295/01/01,00:00:00+0", 0).is_err());
        assert!(NitzSignal::parse("100/01/01,00:00:00+0", 0).is_err());

        let edge = NitzSignal::parse("99/12/31,23:59:59+56", 0).unwrap();
        assert_eq!(edge.offset_minutes, 14 * 60);
    }

    #[test]
    fn test_unsolicited_result_prefix() {
        assert_eq!(
            nitz_payload("+CTZE: \"24/01/01,00:00:00+4\""),
            "\"24/01/01,00:00:00+4\""
        );
        assert_eq!(nitz_payload("24/01/01,00:00:00+4"), "24/01/01,00:00:00+4");
        assert!(NitzSignal::parse(nitz_payload("+CTZE: \"24/01/01,00:00:00+4\""), 0).is_ok());
    }

    fn syncer(
        feed: Option<Arc<dyn NitzFeed>>,
        clock: Arc<ManualClock>,
    ) -> (NitzTimeSyncer, events::EventReceiver) {
        let (tx, rx) = events::channel();
        let mediator = TimeZoneMediator::new(Box::new(NullSink), SyncState::new());
        let syncer = NitzTimeSyncer::new(feed, clock, mediator, tx, Duration::from_secs(5));
        (syncer, rx)
    }

    #[test]
    fn test_no_device_fails_start() {
        let clock = Arc::new(ManualClock::new(0));
        let (mut syncer, _rx) = syncer(None, clock);
        assert!(matches!(syncer.start_update(), Some(SyncOutcome::Failure(_))));
    }

    #[tokio::test]
    async fn test_report_applied_while_listening() {
        let clock = Arc::new(ManualClock::new(1_000_000));
        let report = NitzSignal {
            utc_millis: 2_000_000,
            offset_minutes: 0,
            dst_hours: None,
            zone_id: None,
            received_elapsed_millis: 0,
        };
        let feed: Arc<dyn NitzFeed> = Arc::new(OneShotFeed(report.clone()));
        let (mut syncer, mut rx) = syncer(Some(feed), clock.clone());

        // Stopped syncers ignore reports.
        assert!(syncer.handle_input(SourceInput::Nitz(report)).is_none());

        assert!(syncer.start_update().is_none());
        let input = match rx.recv().await {
            Some(SyncEvent::Input(input)) => input,
            other => panic!("unexpected {:?}", other),
        };

        clock.advance(500);
        let outcome = syncer.handle_input(input);
        match outcome {
            Some(SyncOutcome::Success(adj)) => {
                assert!(adj.applied);
                assert_eq!(adj.drift_ms, 2_000_500 - 1_000_500);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(clock.writes(), vec![2_000_500]);

        syncer.cancel_pending_tasks();
        assert!(!syncer.is_listening());
    }

    fn expect_nitz(event: Option<SyncEvent>) -> NitzSignal {
        match event {
            Some(SyncEvent::Input(SourceInput::Nitz(signal))) => signal,
            other => panic!("expected NITZ report, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_modem_feed_reads_device_lines() {
        use std::io::Write;

        let mut device = tempfile::NamedTempFile::new().unwrap();
        writeln!(device, "+CTZE: \"24/03/31,01:30:00+8,1\"").unwrap();
        writeln!(device, "OK").unwrap();
        writeln!(device).unwrap();
        device.flush().unwrap();

        let (tx, mut rx) = events::channel();
        let clock: Arc<dyn SystemClock> = Arc::new(ManualClock::new(0));
        let feed = ModemNitzFeed::new(device.path());
        let listener = feed.spawn(clock, tx);

        let first = expect_nitz(rx.recv().await);
        assert_eq!(first.utc_millis, 1_711_848_600_000);
        assert_eq!(first.offset_minutes, 120);

        // The garbage and blank lines produce nothing.
        let idle = tokio::time::timeout(Duration::from_secs(3), rx.recv()).await;
        assert!(idle.is_err());

        // Lines appended after EOF are still picked up.
        writeln!(device, "24/06/01,12:00:00-16").unwrap();
        device.flush().unwrap();
        let second = expect_nitz(rx.recv().await);
        assert_eq!(second.offset_minutes, -240);

        listener.abort();
    }
}
