//! Position sources.
//!
//! Each variant wraps one acquisition mechanism: the router's GNSS receiver
//! (`gpsctl`), the satellite terminal's location API (queried through
//! `grpcurl`), the cellular modem's GNSS engine (`gsmctl` AT commands) and an
//! in-process simulated receiver.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tether_common::models::{GpsData, GpsSourceKind};

use crate::config::GpsConfig;
use crate::error::GpsError;
use crate::geo::offset_north;
use crate::util::{binary_available, check_tcp_reachable};

const SATELLITE_DEFAULT_ACCURACY_M: f64 = 5.0;
const CELLULAR_ACCURACY_M: f64 = 15.0;
const LOCATION_REQUEST: &str = r#"{"get_location":{}}"#;
const DEVICE_HANDLE_METHOD: &str = "SpaceX.API.Device.Device/Handle";

#[derive(Debug, Clone)]
pub enum GpsSource {
    Primary {
        gpsctl: String,
    },
    Satellite {
        grpcurl: String,
        endpoint: String,
        reach_timeout: Duration,
    },
    Cellular {
        gsmctl: String,
    },
    Simulated(Arc<SimulatedGps>),
}

impl GpsSource {
    /// Build the hardware-backed source for `kind`. Simulated sources are
    /// constructed directly since they carry their own script.
    pub fn from_kind(kind: GpsSourceKind, cfg: &GpsConfig) -> Option<Self> {
        match kind {
            GpsSourceKind::Primary => Some(GpsSource::Primary {
                gpsctl: cfg.gpsctl_path.clone(),
            }),
            GpsSourceKind::Satellite => Some(GpsSource::Satellite {
                grpcurl: cfg.grpcurl_path.clone(),
                endpoint: cfg.satellite_endpoint.clone(),
                reach_timeout: cfg.command_timeout.min(Duration::from_secs(2)),
            }),
            GpsSourceKind::Cellular => Some(GpsSource::Cellular {
                gsmctl: cfg.gsmctl_path.clone(),
            }),
            GpsSourceKind::Simulated => None,
        }
    }

    pub fn kind(&self) -> GpsSourceKind {
        match self {
            GpsSource::Primary { .. } => GpsSourceKind::Primary,
            GpsSource::Satellite { .. } => GpsSourceKind::Satellite,
            GpsSource::Cellular { .. } => GpsSourceKind::Cellular,
            GpsSource::Simulated(_) => GpsSourceKind::Simulated,
        }
    }

    pub fn name(&self) -> &'static str {
        self.kind().as_str()
    }

    pub async fn is_available(&self) -> bool {
        match self {
            GpsSource::Primary { gpsctl } => binary_available(gpsctl),
            GpsSource::Satellite {
                grpcurl,
                endpoint,
                reach_timeout,
            } => binary_available(grpcurl) && check_tcp_reachable(endpoint, *reach_timeout).await,
            GpsSource::Cellular { gsmctl } => binary_available(gsmctl),
            GpsSource::Simulated(sim) => sim.is_available(),
        }
    }

    /// One collection attempt. Callers bound this with a timeout.
    pub async fn collect(&self) -> Result<GpsData, GpsError> {
        match self {
            GpsSource::Primary { gpsctl } => {
                let out = run(
                    gpsctl,
                    &["-i", "-x", "-a", "-u", "-p", "-s"],
                    GpsSourceKind::Primary,
                )
                .await?;
                parse_gpsctl(&out, Utc::now())
            }
            GpsSource::Satellite {
                grpcurl, endpoint, ..
            } => {
                let out = run(
                    grpcurl,
                    &[
                        "-plaintext",
                        "-d",
                        LOCATION_REQUEST,
                        endpoint,
                        DEVICE_HANDLE_METHOD,
                    ],
                    GpsSourceKind::Satellite,
                )
                .await?;
                parse_satellite_location(&out, Utc::now())
            }
            GpsSource::Cellular { gsmctl } => {
                let out = run(gsmctl, &["-A", "AT+CGPSINFO"], GpsSourceKind::Cellular).await?;
                parse_cgpsinfo(&out, Utc::now())
            }
            GpsSource::Simulated(sim) => sim.collect().await,
        }
    }
}

fn source_error(kind: GpsSourceKind, message: impl Into<String>) -> GpsError {
    GpsError::Source {
        origin: kind.as_str().to_string(),
        message: message.into(),
    }
}

async fn run(program: &str, args: &[&str], kind: GpsSourceKind) -> Result<String, GpsError> {
    let output = tokio::process::Command::new(program)
        .args(args)
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|e| source_error(kind, format!("{program} not available: {e}")))?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(source_error(
            kind,
            format!("{program} exited with {}: {}", output.status, stderr.trim()),
        ));
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

// ── Output parsers ──────────────────────────────────────────────────

fn field<T: std::str::FromStr>(kind: GpsSourceKind, name: &str, raw: &str) -> Result<T, GpsError> {
    raw.trim()
        .parse()
        .map_err(|_| source_error(kind, format!("unparseable {name}: {raw:?}")))
}

/// `gpsctl -i -x -a -u -p -s` prints one value per line in flag order:
/// latitude, longitude, altitude, accuracy, satellites, fix status.
pub fn parse_gpsctl(output: &str, now: DateTime<Utc>) -> Result<GpsData, GpsError> {
    let kind = GpsSourceKind::Primary;
    let lines: Vec<&str> = output.lines().map(str::trim).filter(|l| !l.is_empty()).collect();
    if lines.len() < 6 {
        return Err(source_error(
            kind,
            format!("expected 6 values, got {}", lines.len()),
        ));
    }
    let latitude: f64 = field(kind, "latitude", lines[0])?;
    let longitude: f64 = field(kind, "longitude", lines[1])?;
    let altitude: f64 = field(kind, "altitude", lines[2])?;
    let accuracy: f64 = field(kind, "accuracy", lines[3])?;
    let satellites: u32 = field(kind, "satellites", lines[4])?;
    let status: i32 = field(kind, "fix status", lines[5])?;

    Ok(GpsData {
        latitude,
        longitude,
        altitude,
        accuracy,
        satellites,
        source: kind,
        valid: status > 0 && latitude != 0.0 && longitude != 0.0 && satellites > 0,
        timestamp: now,
    })
}

/// Parse the JSON the terminal's `get_location` handler returns.
pub fn parse_satellite_location(output: &str, now: DateTime<Utc>) -> Result<GpsData, GpsError> {
    let kind = GpsSourceKind::Satellite;
    let value: serde_json::Value = serde_json::from_str(output)
        .map_err(|e| source_error(kind, format!("invalid JSON response: {e}")))?;
    let location = value
        .get("getLocation")
        .ok_or_else(|| source_error(kind, "getLocation field not found"))?;
    let lla = location
        .get("lla")
        .ok_or_else(|| source_error(kind, "lla field not found"))?;
    let latitude = lla
        .get("lat")
        .and_then(|v| v.as_f64())
        .ok_or_else(|| source_error(kind, "latitude missing"))?;
    let longitude = lla
        .get("lon")
        .and_then(|v| v.as_f64())
        .ok_or_else(|| source_error(kind, "longitude missing"))?;
    let altitude = lla.get("alt").and_then(|v| v.as_f64()).unwrap_or(0.0);
    let accuracy = location
        .get("sigmaM")
        .and_then(|v| v.as_f64())
        .filter(|s| *s > 0.0)
        .unwrap_or(SATELLITE_DEFAULT_ACCURACY_M);

    Ok(GpsData {
        latitude,
        longitude,
        altitude,
        accuracy,
        satellites: 0,
        source: kind,
        valid: latitude != 0.0 && longitude != 0.0,
        timestamp: now,
    })
}

/// `DDMM.MMMM` (or `DDDMM.MMMM`) with hemisphere letter to signed degrees.
fn nmea_to_degrees(raw: &str, hemisphere: &str) -> Option<f64> {
    let v: f64 = raw.trim().parse().ok()?;
    let degrees = (v / 100.0).floor();
    let minutes = v - degrees * 100.0;
    let unsigned = degrees + minutes / 60.0;
    match hemisphere.trim() {
        "N" | "E" => Some(unsigned),
        "S" | "W" => Some(-unsigned),
        _ => None,
    }
}

/// Parse `+CGPSINFO: lat,N,lon,E,date,time,alt,speed,course`. Empty fields
/// mean the modem has no fix.
pub fn parse_cgpsinfo(output: &str, now: DateTime<Utc>) -> Result<GpsData, GpsError> {
    let kind = GpsSourceKind::Cellular;
    let line = output
        .lines()
        .find_map(|l| l.trim().strip_prefix("+CGPSINFO:"))
        .ok_or_else(|| source_error(kind, "no +CGPSINFO line in modem output"))?;
    let parts: Vec<&str> = line.split(',').map(str::trim).collect();
    if parts.len() < 7 {
        return Err(source_error(
            kind,
            format!("expected 9 fields, got {}", parts.len()),
        ));
    }
    if parts[0].is_empty() || parts[2].is_empty() {
        return Err(source_error(kind, "modem reports no fix"));
    }
    let latitude = nmea_to_degrees(parts[0], parts[1])
        .ok_or_else(|| source_error(kind, format!("bad latitude {:?}", parts[0])))?;
    let longitude = nmea_to_degrees(parts[2], parts[3])
        .ok_or_else(|| source_error(kind, format!("bad longitude {:?}", parts[2])))?;
    let altitude = parts[6].parse().unwrap_or(0.0);

    Ok(GpsData {
        latitude,
        longitude,
        altitude,
        accuracy: CELLULAR_ACCURACY_M,
        satellites: 0,
        source: kind,
        valid: latitude != 0.0 && longitude != 0.0,
        timestamp: now,
    })
}

// ── Simulated receiver ──────────────────────────────────────────────

/// In-process receiver for `--simulate` runs and tests.
///
/// Scripted results are returned first, in order. Once the script is empty
/// the receiver reports its current position, advancing it by `step_m`
/// metres north on every call.
#[derive(Debug)]
pub struct SimulatedGps {
    available: AtomicBool,
    stalled: AtomicBool,
    script: Mutex<VecDeque<Result<GpsData, String>>>,
    position: Mutex<Option<(f64, f64)>>,
    step_m: f64,
    calls: AtomicUsize,
}

impl SimulatedGps {
    /// A receiver with no position; only scripted results are returned.
    pub fn scripted() -> Self {
        Self {
            available: AtomicBool::new(true),
            stalled: AtomicBool::new(false),
            script: Mutex::new(VecDeque::new()),
            position: Mutex::new(None),
            step_m: 0.0,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn stationary(latitude: f64, longitude: f64) -> Self {
        Self::moving(latitude, longitude, 0.0)
    }

    pub fn moving(latitude: f64, longitude: f64, step_m: f64) -> Self {
        Self {
            position: Mutex::new(Some((latitude, longitude))),
            step_m,
            ..Self::scripted()
        }
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::Relaxed);
    }

    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::Relaxed)
    }

    /// Make `collect` hang until the caller's timeout fires.
    pub fn set_stalled(&self, stalled: bool) {
        self.stalled.store(stalled, Ordering::Relaxed);
    }

    pub fn push_fix(&self, fix: GpsData) {
        self.script
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(Ok(fix));
    }

    pub fn push_error(&self, message: impl Into<String>) {
        self.script
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(Err(message.into()));
    }

    pub fn move_to(&self, latitude: f64, longitude: f64) {
        *self.position.lock().unwrap_or_else(|e| e.into_inner()) = Some((latitude, longitude));
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::Relaxed)
    }

    async fn collect(&self) -> Result<GpsData, GpsError> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        if self.stalled.load(Ordering::Relaxed) {
            std::future::pending::<()>().await;
        }
        let scripted = self
            .script
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front();
        if let Some(next) = scripted {
            return next.map_err(|m| source_error(GpsSourceKind::Simulated, m));
        }

        let mut position = self.position.lock().unwrap_or_else(|e| e.into_inner());
        let Some((latitude, longitude)) = *position else {
            return Err(source_error(GpsSourceKind::Simulated, "no simulated fix"));
        };
        if self.step_m > 0.0 {
            *position = Some((offset_north(latitude, self.step_m), longitude));
        }
        Ok(GpsData {
            latitude,
            longitude,
            altitude: 30.0,
            accuracy: 3.0,
            satellites: 12,
            source: GpsSourceKind::Simulated,
            valid: true,
            timestamp: Utc::now(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gpsctl_output() {
        let now = Utc::now();
        let fix = parse_gpsctl("59.334591\n18.063240\n28.5\n2.1\n11\n1\n", now).unwrap();
        assert_eq!(fix.latitude, 59.334591);
        assert_eq!(fix.satellites, 11);
        assert!(fix.valid);
        assert_eq!(fix.source, GpsSourceKind::Primary);

        let no_fix = parse_gpsctl("0\n0\n0\n0\n0\n0\n", now).unwrap();
        assert!(!no_fix.valid);

        assert!(parse_gpsctl("59.3\n18.0\n", now).is_err());
        assert!(parse_gpsctl("abc\n18\n1\n1\n1\n1\n", now).is_err());
    }

    #[test]
    fn satellite_location_json() {
        let now = Utc::now();
        let json = r#"{"apiVersion":"4","getLocation":{"lla":{"lat":59.3345,"lon":18.0632,"alt":41.2},"sigmaM":3.4,"source":"GNC_FUSED"}}"#;
        let fix = parse_satellite_location(json, now).unwrap();
        assert_eq!(fix.latitude, 59.3345);
        assert_eq!(fix.altitude, 41.2);
        assert_eq!(fix.accuracy, 3.4);
        assert!(fix.valid);

        let no_sigma = r#"{"getLocation":{"lla":{"lat":1.0,"lon":2.0}}}"#;
        let fix = parse_satellite_location(no_sigma, now).unwrap();
        assert_eq!(fix.accuracy, 5.0);
        assert_eq!(fix.altitude, 0.0);

        assert!(parse_satellite_location(r#"{"other":{}}"#, now).is_err());
        assert!(parse_satellite_location("not json", now).is_err());
    }

    #[test]
    fn cgpsinfo_output() {
        let now = Utc::now();
        let out = "+CGPSINFO: 5920.0754,N,01803.7944,E,181026,101500.0,28.4,0.0,0.0\r\nOK\r\n";
        let fix = parse_cgpsinfo(out, now).unwrap();
        assert!((fix.latitude - 59.334590).abs() < 1e-5);
        assert!((fix.longitude - 18.063240).abs() < 1e-5);
        assert_eq!(fix.accuracy, 15.0);

        let west = "+CGPSINFO: 4042.7700,N,07400.3600,W,181026,101500.0,10.0,0.0,0.0";
        let fix = parse_cgpsinfo(west, now).unwrap();
        assert!(fix.longitude < 0.0);

        let empty = "+CGPSINFO: ,,,,,,,,\r\nOK";
        assert!(parse_cgpsinfo(empty, now).is_err());
        assert!(parse_cgpsinfo("ERROR", now).is_err());
    }

    #[tokio::test]
    async fn simulated_script_then_position() {
        let sim = SimulatedGps::moving(59.0, 18.0, 100.0);
        sim.push_error("warming up");
        let src = GpsSource::Simulated(Arc::new(sim));

        assert!(src.collect().await.is_err());
        let first = src.collect().await.unwrap();
        let second = src.collect().await.unwrap();
        assert_eq!(first.latitude, 59.0);
        assert!(second.latitude > first.latitude);
        assert_eq!(src.kind(), GpsSourceKind::Simulated);
    }

    #[tokio::test]
    async fn missing_binaries_are_unavailable() {
        let src = GpsSource::Primary {
            gpsctl: "/nonexistent/gpsctl".into(),
        };
        assert!(!src.is_available().await);
        let err = src.collect().await.unwrap_err();
        assert!(err.to_string().contains("primary"));
    }
}
