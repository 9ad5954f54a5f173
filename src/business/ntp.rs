//! SNTP clock drift probe
//!
//! Middle proxies reject envelopes whose timestamps are off, so the local
//! clock is checked against an SNTP server at startup and then periodically.

use async_trait::async_trait;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::net::{lookup_host, UdpSocket};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::core::hooks::ClockProbe;
use crate::error::ProxyError;
use crate::logger::log;

const PACKET_LEN: usize = 48;
/// LI = 0, VN = 3, mode = 3 (client)
const CLIENT_HEADER: u8 = 0x1b;
const MODE_SERVER: u8 = 4;
/// Seconds between 1900-01-01 and 1970-01-01
const NTP_UNIX_OFFSET: i128 = 2_208_988_800;
const NANOS_PER_SEC: i128 = 1_000_000_000;

/// Encode a wall-clock time as a 64-bit NTP timestamp
fn to_ntp(time: SystemTime) -> [u8; 8] {
    let since_unix = time.duration_since(UNIX_EPOCH).unwrap_or_default();
    let secs = (since_unix.as_secs() as i128 + NTP_UNIX_OFFSET) as u32;
    let frac = ((since_unix.subsec_nanos() as u64) << 32) / NANOS_PER_SEC as u64;

    let mut out = [0u8; 8];
    out[..4].copy_from_slice(&secs.to_be_bytes());
    out[4..].copy_from_slice(&(frac as u32).to_be_bytes());
    out
}

/// Decode a 64-bit NTP timestamp into nanoseconds since the unix epoch
fn from_ntp(raw: &[u8]) -> i128 {
    let secs = u32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]) as i128;
    let frac = u32::from_be_bytes([raw[4], raw[5], raw[6], raw[7]]) as i128;
    (secs - NTP_UNIX_OFFSET) * NANOS_PER_SEC + ((frac * NANOS_PER_SEC) >> 32)
}

fn unix_nanos(time: SystemTime) -> i128 {
    match time.duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_nanos() as i128,
        Err(e) => -(e.duration().as_nanos() as i128),
    }
}

/// Client request carrying `transmit` as its transmit timestamp
pub(crate) fn build_request(transmit: SystemTime) -> [u8; PACKET_LEN] {
    let mut packet = [0u8; PACKET_LEN];
    packet[0] = CLIENT_HEADER;
    packet[40..48].copy_from_slice(&to_ntp(transmit));
    packet
}

/// Server receive and transmit times, in unix nanoseconds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ServerTimes {
    pub receive: i128,
    pub transmit: i128,
}

/// Validate a server answer to `request`
pub(crate) fn parse_response(
    response: &[u8],
    request: &[u8; PACKET_LEN],
) -> io::Result<ServerTimes> {
    if response.len() < PACKET_LEN {
        return Err(invalid("short SNTP packet"));
    }
    if response[0] & 0x07 != MODE_SERVER {
        return Err(invalid("SNTP answer is not in server mode"));
    }
    // Stratum 0 is a kiss-of-death packet
    if response[1] == 0 {
        return Err(invalid("SNTP server sent kiss-of-death"));
    }
    if response[24..32] != request[40..48] {
        return Err(invalid("SNTP originate timestamp mismatch"));
    }
    Ok(ServerTimes {
        receive: from_ntp(&response[32..40]),
        transmit: from_ntp(&response[40..48]),
    })
}

/// Standard SNTP offset: ((t2 - t1) + (t3 - t4)) / 2
pub(crate) fn clock_offset(sent: i128, server: ServerTimes, received: i128) -> i128 {
    ((server.receive - sent) + (server.transmit - received)) / 2
}

fn invalid(msg: &'static str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg)
}

/// Clock probe querying one SNTP server over UDP
pub struct SntpProbe {
    server: String,
    timeout: Duration,
}

impl SntpProbe {
    pub fn new(server: impl Into<String>, timeout: Duration) -> Self {
        Self {
            server: server.into(),
            timeout,
        }
    }

    async fn query(&self) -> io::Result<Duration> {
        let server = lookup_host(self.server.as_str())
            .await?
            .next()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "SNTP server did not resolve"))?;
        let bind: SocketAddr = match server {
            SocketAddr::V4(_) => "0.0.0.0:0".parse().map_err(|_| invalid("bind address"))?,
            SocketAddr::V6(_) => "[::]:0".parse().map_err(|_| invalid("bind address"))?,
        };
        let socket = UdpSocket::bind(bind).await?;
        socket.connect(server).await?;

        let sent = SystemTime::now();
        let request = build_request(sent);
        socket.send(&request).await?;

        let mut buf = [0u8; 512];
        let n = socket.recv(&mut buf).await?;
        let received = SystemTime::now();

        let times = parse_response(&buf[..n], &request)?;
        let offset = clock_offset(unix_nanos(sent), times, unix_nanos(received));
        Ok(Duration::from_nanos(offset.unsigned_abs().min(u64::MAX as u128) as u64))
    }
}

#[async_trait]
impl ClockProbe for SntpProbe {
    async fn measure_drift(&self) -> io::Result<Duration> {
        tokio::time::timeout(self.timeout, self.query())
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "SNTP query timed out"))?
    }
}

/// Fail unless the probe reports a drift of at most `max_drift`
pub async fn check_clock(
    probe: &dyn ClockProbe,
    max_drift: Duration,
) -> Result<Duration, ProxyError> {
    let drift = probe
        .measure_drift()
        .await
        .map_err(|e| ProxyError::Clock(format!("cannot fetch time data: {}", e)))?;
    if drift > max_drift {
        return Err(ProxyError::Clock(format!(
            "local clock drifts by {:?}, more than the allowed {:?}; sync your time",
            drift, max_drift
        )));
    }
    Ok(drift)
}

/// Re-check the clock every `period` until `shutdown` fires.
///
/// Drift found after startup is only logged; sessions keep running.
pub fn spawn_clock_watch(
    probe: Arc<dyn ClockProbe>,
    max_drift: Duration,
    period: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // First tick completes immediately, startup already checked
        interval.tick().await;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    watch_once(probe.as_ref(), max_drift).await;
                }
                _ = shutdown.cancelled() => {
                    log::debug!("Clock watch shutting down");
                    break;
                }
            }
        }
    })
}

async fn watch_once(probe: &dyn ClockProbe, max_drift: Duration) -> bool {
    match check_clock(probe, max_drift).await {
        Ok(drift) => {
            log::debug!(drift = ?drift, "Clock drift within tolerance");
            true
        }
        Err(e) => {
            log::warn!(error = %e, "Clock check failed, middle proxies may reject envelopes");
            false
        }
    }
}
