use std::sync::Arc;
use std::time::Duration;

use photoscenery_shared::{ConnectionState, PositionFix};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use crate::state::AppState;

/// Snapshot interval while connected.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Minimum pause before a reconnect attempt.
const RECONNECT_BACKOFF: Duration = Duration::from_secs(5);

const KNOTS_TO_MPH: f64 = 1.150_779;

/// Control messages from the HTTP plane.
#[derive(Debug, Clone, Copy)]
pub enum TelemetryCommand {
    Connect { port: u16 },
    Disconnect,
}

/// Supervises at most one live connection to the simulator's property
/// protocol, reacting to connect/disconnect commands.
pub async fn run_supervisor(
    state: Arc<AppState>,
    mut cmd_rx: mpsc::Receiver<TelemetryCommand>,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut stop_current: Option<broadcast::Sender<()>> = None;
    loop {
        tokio::select! {
            _ = shutdown.recv() => break,
            cmd = cmd_rx.recv() => match cmd {
                Some(TelemetryCommand::Connect { port }) => {
                    if let Some(stop) = stop_current.take() {
                        let _ = stop.send(());
                    }
                    let (stop_tx, stop_rx) = broadcast::channel(1);
                    stop_current = Some(stop_tx);
                    tokio::spawn(connection_loop(state.clone(), port, stop_rx));
                }
                Some(TelemetryCommand::Disconnect) | None => {
                    if let Some(stop) = stop_current.take() {
                        let _ = stop.send(());
                    }
                    state.set_position(None);
                    state.set_connection(ConnectionState::Disconnected);
                    if cmd.is_none() {
                        break;
                    }
                }
            },
        }
    }
    if let Some(stop) = stop_current {
        let _ = stop.send(());
    }
}

/// Connect, poll until the stream breaks, back off, reconnect.
async fn connection_loop(state: Arc<AppState>, port: u16, mut stop: broadcast::Receiver<()>) {
    info!("position client targeting 127.0.0.1:{port}");
    loop {
        state.set_connection(ConnectionState::Connecting);
        match TcpStream::connect(("127.0.0.1", port)).await {
            Ok(stream) => {
                state.set_connection(ConnectionState::Connected);
                state.log_line(format!("simulator link established on port {port}"));
                let (read, write) = stream.into_split();
                match poll_stream(&state, read, write, &mut stop).await {
                    // The stop signal was consumed inside the poll loop.
                    Err(e) if e.kind() == std::io::ErrorKind::Interrupted => break,
                    Err(e) => debug!("position stream ended: {e}"),
                    Ok(()) => {}
                }
            }
            Err(e) => {
                debug!("position connect failed: {e}");
            }
        }
        state.set_position(None);
        state.set_connection(ConnectionState::Connecting);

        tokio::select! {
            _ = stop.recv() => break,
            _ = tokio::time::sleep(RECONNECT_BACKOFF) => {}
        }
    }
    state.set_position(None);
    state.set_connection(ConnectionState::Disconnected);
    debug!("position client stopped");
}

async fn poll_stream(
    state: &Arc<AppState>,
    read: OwnedReadHalf,
    mut write: OwnedWriteHalf,
    stop: &mut broadcast::Receiver<()>,
) -> std::io::Result<()> {
    let mut reader = BufReader::new(read);
    loop {
        let position = query(&mut reader, &mut write, "dump /position\r\n").await?;
        let orientation = query(&mut reader, &mut write, "dump /orientation\r\n").await?;
        let velocities = query(&mut reader, &mut write, "dump /velocities\r\n").await?;

        match parse_fix(&position, &orientation, &velocities) {
            Some(fix) => state.set_position(Some(fix)),
            None => warn!("unparseable property dump from simulator"),
        }

        tokio::select! {
            _ = stop.recv() => {
                return Err(std::io::Error::new(std::io::ErrorKind::Interrupted, "stopped"));
            }
            _ = tokio::time::sleep(DEFAULT_POLL_INTERVAL) => {}
        }
    }
}

/// Send one `dump` command and read until the closing PropertyList tag,
/// tolerating arbitrary stream fragmentation.
async fn query(
    reader: &mut BufReader<OwnedReadHalf>,
    write: &mut OwnedWriteHalf,
    command: &str,
) -> std::io::Result<String> {
    write.write_all(command.as_bytes()).await?;
    write.flush().await?;
    read_property_list(reader).await
}

/// Accumulate until `</PropertyList>` arrives.
pub async fn read_property_list<R: AsyncBufReadExt + AsyncReadExt + Unpin>(
    reader: &mut R,
) -> std::io::Result<String> {
    const CLOSING: &str = "</PropertyList>";
    let mut buf = String::new();
    let mut chunk = [0u8; 1024];
    loop {
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "stream closed mid-document",
            ));
        }
        buf.push_str(&String::from_utf8_lossy(&chunk[..n]));
        if buf.contains(CLOSING) {
            return Ok(buf);
        }
    }
}

/// Extract `<name ...>value</name>` as f64 from a property dump.
pub fn extract_f64(xml: &str, name: &str) -> Option<f64> {
    let open = format!("<{name}");
    let start = xml.find(&open)?;
    let rest = &xml[start..];
    let value_start = rest.find('>')? + 1;
    let value_end = rest[value_start..].find('<')? + value_start;
    rest[value_start..value_end].trim().parse().ok()
}

/// Combine the three dumps into a position snapshot.
pub fn parse_fix(position: &str, orientation: &str, velocities: &str) -> Option<PositionFix> {
    let lat_deg = extract_f64(position, "latitude-deg")?;
    let lon_deg = extract_f64(position, "longitude-deg")?;
    let altitude_msl_ft = extract_f64(position, "altitude-ft").unwrap_or(0.0);
    let ground_elevation_ft = extract_f64(position, "ground-elev-ft").unwrap_or(0.0);
    let heading_deg = extract_f64(orientation, "heading-deg").unwrap_or(0.0);
    let speed_mph =
        extract_f64(velocities, "groundspeed-kt").unwrap_or(0.0) * KNOTS_TO_MPH;
    Some(PositionFix {
        lat_deg,
        lon_deg,
        altitude_msl_ft,
        ground_elevation_ft,
        heading_deg,
        speed_mph,
    })
}
