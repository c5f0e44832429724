use reqwest::blocking::{Client, RequestBuilder};
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use std::collections::BTreeMap;
use std::time::Duration;

use super::config::InfluxConfig;
use super::error::{MeterError, MeterResult};
use super::round::RoundRecord;
use super::types::*;

/// One time-series point, serialised as InfluxDB line protocol.
#[derive(Debug, Clone, PartialEq)]
pub struct Point {
    pub measurement: String,
    pub tags: BTreeMap<String, String>,
    pub fields: BTreeMap<String, f64>,
    pub timestamp_ms: i64,
}

fn escape(value: &str, equals: bool) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        if c == ',' || c == ' ' || (equals && c == '=') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

impl Point {
    pub fn new(measurement: &str, timestamp_ms: i64) -> Self {
        Self {
            measurement: measurement.to_string(),
            tags: BTreeMap::new(),
            fields: BTreeMap::new(),
            timestamp_ms,
        }
    }

    pub fn tag(mut self, key: &str, value: impl ToString) -> Self {
        self.tags.insert(key.to_string(), value.to_string());
        self
    }

    pub fn field(mut self, key: &str, value: f64) -> Self {
        self.fields.insert(key.to_string(), value);
        self
    }

    /// `measurement,tag=v field=v timestamp`, tags and fields in key order.
    pub fn to_line_protocol(&self) -> String {
        let mut line = escape(&self.measurement, false);
        for (key, value) in &self.tags {
            line.push_str(&format!(",{}={}", escape(key, true), escape(value, true)));
        }

        let fields: Vec<String> = self
            .fields
            .iter()
            .map(|(key, value)| format!("{}={}", escape(key, true), value))
            .collect();
        line.push(' ');
        line.push_str(&fields.join(","));
        line.push_str(&format!(" {}", self.timestamp_ms));
        line
    }
}

/*
* @brief Points of one flushed round.
* @param record Averaged round of one phase
* @param totals Cumulative kWh per CT after the round was applied
* @param host Host tag
* @return voltage point, then a current and a total point per installed CT
*/
pub fn round_points(record: &RoundRecord, totals: &[f64; CT_CHANNELS], host: &str) -> Vec<Point> {
    let ts = record.timestamp_ms();
    let mut points = vec![Point::new("voltage", ts)
        .tag("host", host)
        .tag("phase", record.phase)
        .field("voltage", round2(record.voltage))];

    for (ct, avg) in record.channels.iter().enumerate() {
        let sensor = ct + 1;
        points.push(
            Point::new("current", ts)
                .tag("host", host)
                .tag("phase", record.phase)
                .tag("sensor", sensor)
                .field("current", round2(avg.current))
                .field("power", round2(avg.power))
                .field("pf", round2(avg.power_factor)),
        );
        points.push(total_point(record.phase, sensor, totals[ct], host, ts));
    }

    points
}

fn total_point(phase: usize, sensor: usize, total: f64, host: &str, ts: i64) -> Point {
    Point::new("total", ts)
        .tag("host", host)
        .tag("phase", phase)
        .tag("sensor", sensor)
        .field("total", total)
}

/*
* @brief Cumulative totals of every installed CT, written once more on shutdown.
* @param sets Measurement sets holding the current totals
* @param host Host tag
* @param ts Timestamp of the points in milliseconds
*/
pub fn total_points(sets: &[PhaseMeasurementSet], host: &str, ts: i64) -> Vec<Point> {
    sets.iter()
        .flat_map(|set| {
            (0..set.ct_count()).map(move |ct| total_point(set.phase, ct + 1, set.energy[ct], host, ts))
        })
        .collect()
}

/// System hostname used as the `host` tag.
pub fn host_identity() -> String {
    match nix::unistd::gethostname() {
        Ok(name) => name.to_string_lossy().into_owned(),
        Err(e) => {
            log::warn!("Unable to read hostname: {}", e);
            "localhost".to_string()
        }
    }
}

/// Destination of the emitted rounds.
pub trait TimeSeriesSink {
    fn write(&mut self, points: &[Point]) -> MeterResult<()>;

    /// Best-effort final flush on shutdown.
    fn close(&mut self) -> MeterResult<()> {
        Ok(())
    }
}

impl<T: TimeSeriesSink + ?Sized> TimeSeriesSink for Box<T> {
    fn write(&mut self, points: &[Point]) -> MeterResult<()> {
        (**self).write(points)
    }

    fn close(&mut self) -> MeterResult<()> {
        (**self).close()
    }
}

/// InfluxDB v2 HTTP write endpoint.
pub struct InfluxSink {
    client: Client,
    write_url: String,
    query: Vec<(&'static str, String)>,
    token: String,
}

impl InfluxSink {
    pub fn new(config: &InfluxConfig) -> MeterResult<Self> {
        if config.bucket.is_empty() {
            return Err(MeterError::Config("influx.bucket must be set".into()));
        }

        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            client,
            write_url: format!("{}/api/v2/write", config.url.trim_end_matches('/')),
            query: vec![
                ("org", config.org.clone()),
                ("bucket", config.bucket.clone()),
                ("precision", "ms".to_string()),
            ],
            token: config.token.clone(),
        })
    }

    fn request(&self, body: String) -> RequestBuilder {
        self.client
            .post(&self.write_url)
            .query(&self.query)
            .header(AUTHORIZATION, format!("Token {}", self.token))
            .header(CONTENT_TYPE, "text/plain; charset=utf-8")
            .body(body)
    }
}

impl TimeSeriesSink for InfluxSink {
    fn write(&mut self, points: &[Point]) -> MeterResult<()> {
        if points.is_empty() {
            return Ok(());
        }

        let body = points
            .iter()
            .map(Point::to_line_protocol)
            .collect::<Vec<_>>()
            .join("\n");

        let response = self.request(body).send()?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().unwrap_or_default();
            return Err(MeterError::Sink(format!("InfluxDB answered {}: {}", status, text.trim())));
        }

        log::debug!("{} points written", points.len());
        Ok(())
    }
}

/// Keeps every written point, used by tests and dry runs.
#[derive(Debug, Default)]
pub struct MemorySink {
    pub points: Vec<Point>,
    pub closed: bool,
    echo: bool,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Log every point at info level as it is written.
    pub fn echoing() -> Self {
        Self {
            echo: true,
            ..Self::default()
        }
    }
}

impl TimeSeriesSink for MemorySink {
    fn write(&mut self, points: &[Point]) -> MeterResult<()> {
        if self.echo {
            for point in points {
                log::info!("{}", point.to_line_protocol());
            }
        }
        self.points.extend_from_slice(points);
        Ok(())
    }

    fn close(&mut self) -> MeterResult<()> {
        self.closed = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::energy_insight::round::ChannelAverage;
    use chrono::{Duration, TimeZone, Utc};
    use pretty_assertions::assert_eq;

    #[test]
    fn line_protocol_escapes_tags() {
        let point = Point::new("current", 1_700_000_000_123)
            .tag("host", "meter one")
            .tag("phase", 2)
            .field("power", 12.5)
            .field("current", 1.0);

        assert_eq!(
            point.to_line_protocol(),
            "current,host=meter\\ one,phase=2 current=1,power=12.5 1700000000123"
        );
    }

    #[test]
    fn round_points_carry_midpoint_and_totals() {
        let t0 = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        let record = RoundRecord {
            phase: 1,
            cycles: 5,
            voltage: 230.004,
            channels: vec![ChannelAverage {
                current: 8.0,
                power: 1839.996,
                power_factor: 0.999,
            }],
            started_at: t0,
            ended_at: t0 + Duration::seconds(2),
        };
        let totals = [12.5, 0.0, 0.0, 0.0, 0.0, 0.0];

        let points = round_points(&record, &totals, "pi");
        let lines: Vec<String> = points.iter().map(Point::to_line_protocol).collect();

        assert_eq!(
            lines,
            vec![
                "voltage,host=pi,phase=1 voltage=230 1700000001000".to_string(),
                "current,host=pi,phase=1,sensor=1 current=8,pf=1,power=1840 1700000001000".to_string(),
                "total,host=pi,phase=1,sensor=1 total=12.5 1700000001000".to_string(),
            ]
        );
    }

    #[test]
    fn memory_sink_collects_points() {
        let mut sink = MemorySink::new();
        sink.write(&[Point::new("voltage", 1).field("voltage", 230.0)]).unwrap();
        sink.close().unwrap();
        assert_eq!(sink.points.len(), 1);
        assert!(sink.closed);
    }

    #[test]
    fn influx_sink_requires_bucket() {
        assert!(InfluxSink::new(&InfluxConfig::default()).is_err());
    }

    #[test]
    fn influx_write_url_encodes_org_and_bucket() {
        let config = InfluxConfig {
            url: "http://influx.local:8086/".to_string(),
            org: "home & garden".to_string(),
            bucket: "power/raw".to_string(),
            token: "secret".to_string(),
            ..InfluxConfig::default()
        };
        let sink = InfluxSink::new(&config).unwrap();
        let request = sink.request(String::new()).build().unwrap();

        assert_eq!(request.url().path(), "/api/v2/write");
        let query: Vec<(String, String)> = request.url().query_pairs().into_owned().collect();
        assert_eq!(
            query,
            vec![
                ("org".to_string(), "home & garden".to_string()),
                ("bucket".to_string(), "power/raw".to_string()),
                ("precision".to_string(), "ms".to_string()),
            ]
        );
        assert!(!request.url().as_str().contains(' '));
        assert_eq!(request.headers()[AUTHORIZATION], "Token secret");
    }
}
