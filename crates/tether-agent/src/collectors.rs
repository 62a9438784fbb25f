//! Member metric collectors.
//!
//! In production, each member is pinged with `ping` bound to its interface.
//! In `--simulate` mode, realistic per-class samples are generated with
//! occasional degradation episodes so failovers can be observed locally.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::Utc;
use tether_common::models::{Member, MemberClass, Metrics};
use tether_engine::config::MemberConfig;
use tether_engine::error::CollectError;
use tether_engine::interfaces::Collector;
use tether_engine::util::binary_available;

/// Per-echo reply deadline passed to `ping -W`, in seconds.
const PING_DEADLINE_S: u32 = 2;

// ── Ping ────────────────────────────────────────────────────────────

pub struct PingCollector {
    count: u32,
    targets: HashMap<String, String>,
}

impl PingCollector {
    pub fn new(members: &[MemberConfig], count: u32) -> Self {
        Self {
            count: count.max(2),
            targets: members
                .iter()
                .map(|mc| (mc.member.name.clone(), mc.ping_target.clone()))
                .collect(),
        }
    }

    fn target(&self, member: &Member) -> &str {
        self.targets
            .get(&member.name)
            .map_or("1.1.1.1", String::as_str)
    }
}

#[async_trait::async_trait]
impl Collector for PingCollector {
    async fn collect(&self, member: &Member) -> Result<Metrics, CollectError> {
        let count = self.count.to_string();
        let deadline = PING_DEADLINE_S.to_string();
        let mut args = vec!["-n", "-q", "-c", count.as_str(), "-W", deadline.as_str()];
        if let Some(iface) = &member.interface {
            args.extend(["-I", iface.as_str()]);
        }
        args.push(self.target(member));

        let output = tokio::process::Command::new("ping")
            .args(&args)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| CollectError::Command(format!("ping not available: {e}")))?;

        // ping exits 1 when no reply arrived; the summary is still printed.
        let stdout = String::from_utf8_lossy(&output.stdout);
        match parse_ping(&stdout) {
            Ok(summary) => Ok(summary.into_metrics(PING_DEADLINE_S)),
            Err(e) if output.status.success() => Err(e),
            Err(_) => Err(CollectError::Unreachable {
                member: member.name.clone(),
                reason: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            }),
        }
    }

    async fn validate(&self, member: &Member) -> Result<(), CollectError> {
        if !binary_available("ping") {
            return Err(CollectError::Command("ping not found in PATH".into()));
        }
        if let Some(iface) = &member.interface {
            let sys = format!("/sys/class/net/{iface}");
            if !std::path::Path::new(&sys).exists() {
                return Err(CollectError::Unreachable {
                    member: member.name.clone(),
                    reason: format!("interface {iface} does not exist"),
                });
            }
        }
        Ok(())
    }
}

/// Summary lines of one `ping -q` run.
#[derive(Debug, Clone, PartialEq)]
pub struct PingSummary {
    pub loss_pct: f64,
    /// min, avg, max and (when reported) mdev, in ms. Absent when nothing
    /// came back.
    pub rtt: Option<(f64, f64, f64, Option<f64>)>,
}

impl PingSummary {
    fn into_metrics(self, deadline_s: u32) -> Metrics {
        let (latency, jitter) = match self.rtt {
            Some((min, avg, max, mdev)) => (avg, mdev.unwrap_or((max - min) / 2.0)),
            None => (f64::from(deadline_s) * 1000.0, 0.0),
        };
        Metrics::new(Utc::now(), latency, self.loss_pct, jitter)
    }
}

/// Parse iputils or busybox `ping` summary output.
pub fn parse_ping(output: &str) -> Result<PingSummary, CollectError> {
    let loss_pct = output
        .lines()
        .find(|l| l.contains("packet loss"))
        .and_then(|l| {
            l.split(',')
                .find(|part| part.contains("packet loss"))
                .and_then(|part| part.trim().split('%').next())
                .and_then(|v| v.trim().parse::<f64>().ok())
        })
        .ok_or_else(|| CollectError::Parse("no packet loss line in ping output".into()))?;

    let rtt = output
        .lines()
        .find(|l| l.contains("min/avg/max"))
        .and_then(|l| l.split('=').nth(1))
        .map(|values| {
            values
                .trim()
                .trim_end_matches("ms")
                .trim()
                .split('/')
                .filter_map(|v| v.trim().parse::<f64>().ok())
                .collect::<Vec<_>>()
        })
        .and_then(|v| match v.as_slice() {
            [min, avg, max, mdev] => Some((*min, *avg, *max, Some(*mdev))),
            [min, avg, max] => Some((*min, *avg, *max, None)),
            _ => None,
        });

    if rtt.is_none() && loss_pct < 100.0 {
        return Err(CollectError::Parse(
            "replies received but no rtt summary".into(),
        ));
    }
    Ok(PingSummary { loss_pct, rtt })
}

// ── Simulation ──────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct SimLink {
    /// Remaining cycles of the current degradation episode.
    degraded_for: u32,
}

/// Generates plausible samples per member class.
pub struct SimulatedCollector {
    links: Mutex<HashMap<String, SimLink>>,
    degradation_chance: f64,
}

impl Default for SimulatedCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedCollector {
    pub fn new() -> Self {
        Self {
            links: Mutex::new(HashMap::new()),
            degradation_chance: 0.02,
        }
    }

    /// Probability per sample that a degradation episode starts.
    pub fn with_degradation_chance(mut self, chance: f64) -> Self {
        self.degradation_chance = chance.clamp(0.0, 1.0);
        self
    }

    fn sample(&self, member: &Member) -> Metrics {
        use rand::Rng;
        let mut rng = rand::rng();

        let degraded = {
            let mut links = self.links.lock().unwrap_or_else(|e| e.into_inner());
            let link = links.entry(member.name.clone()).or_default();
            if link.degraded_for == 0 && rng.random_bool(self.degradation_chance) {
                link.degraded_for = rng.random_range(3..=8);
                tracing::debug!(member = %member.name, cycles = link.degraded_for, "simulated degradation");
            }
            if link.degraded_for > 0 {
                link.degraded_for -= 1;
                true
            } else {
                false
            }
        };

        let (base_latency, spread) = match member.class {
            MemberClass::Satellite => (35.0, 10.0),
            MemberClass::Cellular => (55.0, 15.0),
            MemberClass::Wifi => (20.0, 5.0),
            MemberClass::Wired => (8.0, 3.0),
            MemberClass::Vpn => (45.0, 10.0),
        };
        let mut m = Metrics::new(
            Utc::now(),
            base_latency + rng.random_range(-spread..spread),
            rng.random_range(0.0..0.5),
            rng.random_range(1.0..6.0),
        );

        match member.class {
            MemberClass::Satellite => {
                m.obstruction_pct = Some(rng.random_range(0.0..2.0));
                m.obstruction_time_pct = Some(rng.random_range(0.0..0.5));
                m.obstruction_valid_s = Some(7200);
                m.obstruction_avg_prolonged_s = Some(0.0);
                m.obstruction_patches_valid = Some(2400);
                m.snr_above_noise_floor = Some(true);
                m.snr_persistently_low = Some(false);
                m.gps_valid = Some(true);
                m.gps_satellites = Some(rng.random_range(9..14));
            }
            MemberClass::Cellular => {
                m.rsrp_dbm = Some(rng.random_range(-95.0..-75.0));
                m.rsrq_db = Some(rng.random_range(-12.0..-6.0));
                m.sinr_db = Some(rng.random_range(5.0..20.0));
            }
            MemberClass::Wifi => {
                m.wifi_signal_dbm = Some(rng.random_range(-70.0..-50.0));
                m.wifi_noise_dbm = Some(-92.0);
            }
            MemberClass::Wired | MemberClass::Vpn => {}
        }

        if degraded {
            m.latency_ms *= rng.random_range(6.0..12.0);
            m.loss_pct += rng.random_range(6.0..15.0);
            m.jitter_ms *= 10.0;
            if let Some(o) = m.obstruction_pct.as_mut() {
                *o += rng.random_range(10.0..25.0);
            }
            if let Some(t) = m.obstruction_time_pct.as_mut() {
                *t += 3.0;
            }
        }
        m
    }
}

#[async_trait::async_trait]
impl Collector for SimulatedCollector {
    async fn collect(&self, member: &Member) -> Result<Metrics, CollectError> {
        Ok(self.sample(member))
    }

    async fn validate(&self, _member: &Member) -> Result<(), CollectError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn member(class: MemberClass) -> Member {
        Member {
            name: "m".into(),
            class,
            interface: None,
            metric: 1,
            weight: 100,
            eligible: true,
        }
    }

    #[test]
    fn parses_iputils_summary() {
        let out = "\
--- 1.1.1.1 ping statistics ---
5 packets transmitted, 4 received, 20% packet loss, time 4005ms
rtt min/avg/max/mdev = 10.112/12.400/15.020/1.734 ms
";
        let s = parse_ping(out).unwrap();
        assert_eq!(s.loss_pct, 20.0);
        assert_eq!(s.rtt, Some((10.112, 12.4, 15.02, Some(1.734))));
        let m = s.into_metrics(PING_DEADLINE_S);
        assert_eq!(m.latency_ms, 12.4);
        assert_eq!(m.jitter_ms, 1.734);
    }

    #[test]
    fn parses_busybox_summary() {
        let out = "\
--- 8.8.8.8 ping statistics ---
3 packets transmitted, 3 packets received, 0% packet loss
round-trip min/avg/max = 20.0/25.0/30.0 ms
";
        let s = parse_ping(out).unwrap();
        assert_eq!(s.loss_pct, 0.0);
        let m = s.into_metrics(PING_DEADLINE_S);
        assert_eq!(m.jitter_ms, 5.0);
    }

    #[test]
    fn total_loss_maps_to_deadline_latency() {
        let out = "3 packets transmitted, 0 received, 100% packet loss, time 2040ms\n";
        let m = parse_ping(out).unwrap().into_metrics(2);
        assert_eq!(m.loss_pct, 100.0);
        assert_eq!(m.latency_ms, 2000.0);
    }

    #[test]
    fn garbage_is_a_parse_error() {
        assert!(matches!(
            parse_ping("ping: unknown host"),
            Err(CollectError::Parse(_))
        ));
    }

    #[test]
    fn simulated_samples_carry_class_fields() {
        let sim = SimulatedCollector::new().with_degradation_chance(0.0);
        let sat = sim.sample(&member(MemberClass::Satellite));
        assert!(sat.obstruction_pct.is_some());
        assert!(sat.latency_ms > 20.0 && sat.latency_ms < 50.0);

        let lte = sim.sample(&member(MemberClass::Cellular));
        assert!(lte.rsrp_dbm.is_some());
        assert!(lte.obstruction_pct.is_none());
    }

    #[test]
    fn degradation_episode_inflates_metrics() {
        let sim = SimulatedCollector::new().with_degradation_chance(1.0);
        let m = sim.sample(&member(MemberClass::Wired));
        assert!(m.latency_ms > 20.0);
        assert!(m.loss_pct >= 6.0);
    }
}
