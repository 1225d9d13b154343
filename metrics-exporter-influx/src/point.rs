use std::{
    collections::BTreeMap,
    time::{SystemTime, UNIX_EPOCH},
};

use tracing::warn;

/// Value of a single point field.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum FieldValue {
    /// Signed integer.
    Integer(i64),

    /// Unsigned integer.
    UInteger(u64),

    /// Floating-point number.
    Float(f64),
}

impl From<i64> for FieldValue {
    fn from(value: i64) -> Self {
        FieldValue::Integer(value)
    }
}

impl From<u64> for FieldValue {
    fn from(value: u64) -> Self {
        FieldValue::UInteger(value)
    }
}

impl From<f64> for FieldValue {
    fn from(value: f64) -> Self {
        FieldValue::Float(value)
    }
}

/// A single time-series point.
#[derive(Clone, Debug, PartialEq)]
pub struct Point {
    measurement: String,
    tags: BTreeMap<String, String>,
    fields: Vec<(String, FieldValue)>,
    timestamp: SystemTime,
}

impl Point {
    /// Creates a new `Point`.
    pub fn new<M>(
        measurement: M,
        tags: BTreeMap<String, String>,
        fields: Vec<(String, FieldValue)>,
        timestamp: SystemTime,
    ) -> Self
    where
        M: Into<String>,
    {
        Self { measurement: measurement.into(), tags, fields, timestamp }
    }

    /// Measurement this point belongs to.
    pub fn measurement(&self) -> &str {
        &self.measurement
    }

    /// Tags of this point.
    pub fn tags(&self) -> &BTreeMap<String, String> {
        &self.tags
    }

    /// Fields of this point, in insertion order.
    pub fn fields(&self) -> &[(String, FieldValue)] {
        &self.fields
    }

    /// Gets the value of the field with the given key, if it exists.
    pub fn field(&self, key: &str) -> Option<FieldValue> {
        self.fields.iter().find(|(k, _)| k == key).map(|(_, v)| *v)
    }

    /// Timestamp of this point.
    pub fn timestamp(&self) -> SystemTime {
        self.timestamp
    }
}

struct FieldValueFormatter {
    int_writer: itoa::Buffer,
    float_writer: ryu::Buffer,
}

impl FieldValueFormatter {
    fn new() -> Self {
        Self { int_writer: itoa::Buffer::new(), float_writer: ryu::Buffer::new() }
    }

    fn write(&mut self, buf: &mut Vec<u8>, value: FieldValue) {
        match value {
            FieldValue::Integer(v) => {
                buf.extend_from_slice(self.int_writer.format(v).as_bytes());
                buf.push(b'i');
            }
            FieldValue::UInteger(v) => {
                buf.extend_from_slice(self.int_writer.format(v).as_bytes());
                buf.push(b'u');
            }
            FieldValue::Float(v) => buf.extend_from_slice(self.float_writer.format_finite(v).as_bytes()),
        }
    }
}

fn is_writable(value: FieldValue) -> bool {
    match value {
        FieldValue::Float(v) => v.is_finite(),
        FieldValue::Integer(_) | FieldValue::UInteger(_) => true,
    }
}

/// Encodes points in the InfluxDB line protocol.
///
/// Each point is written as `measurement[,tag=value...] field=value[,field=value...] timestamp`, with the timestamp
/// in nanoseconds since the Unix epoch. Non-finite floating-point fields cannot be represented and are skipped, and a
/// point with no representable fields, or with a timestamp before the epoch, is skipped entirely. Line breaks in names
/// and tags are written as spaces.
pub(crate) struct LineWriter {
    buf: Vec<u8>,
    formatter: FieldValueFormatter,
    lines: usize,
}

impl LineWriter {
    pub fn new() -> Self {
        Self { buf: Vec::new(), formatter: FieldValueFormatter::new(), lines: 0 }
    }

    pub fn write_point(&mut self, point: &Point) {
        if !point.fields.iter().any(|(_, value)| is_writable(*value)) {
            return;
        }

        let Ok(since_epoch) = point.timestamp.duration_since(UNIX_EPOCH) else {
            warn!(measurement = %point.measurement, "Skipping point with timestamp before the Unix epoch.");
            return;
        };

        write_escaped(&mut self.buf, &point.measurement, b", ");
        for (key, value) in &point.tags {
            // Empty tag keys and values are rejected by the server.
            if key.is_empty() || value.is_empty() {
                continue;
            }

            self.buf.push(b',');
            write_escaped(&mut self.buf, key, b",= ");
            self.buf.push(b'=');
            write_escaped(&mut self.buf, value, b",= ");
        }

        let mut first = true;
        for (key, value) in &point.fields {
            if !is_writable(*value) {
                continue;
            }

            self.buf.push(if first { b' ' } else { b',' });
            first = false;

            write_escaped(&mut self.buf, key, b",= ");
            self.buf.push(b'=');
            self.formatter.write(&mut self.buf, *value);
        }

        self.buf.push(b' ');
        self.buf.extend_from_slice(self.formatter.int_writer.format(since_epoch.as_nanos()).as_bytes());
        self.buf.push(b'\n');

        self.lines += 1;
    }

    /// Number of lines written so far.
    pub fn lines(&self) -> usize {
        self.lines
    }

    /// Consumes the writer, returning the encoded payload.
    pub fn into_payload(self) -> Vec<u8> {
        self.buf
    }
}

// Line breaks cannot be escaped, so they are folded into spaces, which every caller escapes.
fn write_escaped(buf: &mut Vec<u8>, s: &str, special: &[u8]) {
    for b in s.bytes() {
        let b = if b == b'\n' || b == b'\r' { b' ' } else { b };
        if b == b'\\' || special.contains(&b) {
            buf.push(b'\\');
        }
        buf.push(b);
    }
}

/// Encodes the given points as a line protocol payload, returning the payload and the number of points written.
pub(crate) fn encode(points: &[Point]) -> (Vec<u8>, usize) {
    let mut writer = LineWriter::new();
    for point in points {
        writer.write_point(point);
    }

    let lines = writer.lines();
    (writer.into_payload(), lines)
}
