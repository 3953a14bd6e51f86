// 1. Local crate imports
use crate::wal::{WALHeader, WAL_CURRENT_VERSION};
use wavestore_core::{Error, Nanos, Result, ScaleType, Value, ValueArray, ValueMode, ValueType};

// 2. External crate imports
// (none in this file)

// 3. Standard library imports
// (none in this file)

const NANOS_PER_SECOND: i64 = 1_000_000_000;

/// What kind of stream a message belongs to
#[derive(Debug, Clone, PartialEq)]
pub enum MessageKind {
    /// A fixed-rate waveform message; `data` holds `^`-delimited samples.
    ///
    /// When both scale factors are non-zero the samples are rescaled by
    /// `(v - scale_b) / scale_m`, rounded to int16 and stored with a linear
    /// scale header; otherwise they are stored as float64 unscaled.
    Waveform { scale_m: f64, scale_b: f64 },
    /// An aperiodic single-value metric; `data` holds one float.
    Metric,
}

/// One message from a producer, before header derivation
#[derive(Debug, Clone)]
pub struct SensorMessage {
    pub device_name: String,
    pub measure_name: String,
    pub measure_units: String,
    /// Sample rate in Hz; ignored (and conventionally 0) for metrics
    pub freq_hz: f64,
    /// Source-reported time of the first sample, ns since epoch
    pub data_time_ns: Nanos,
    /// Receiver-side timestamp, ns since epoch
    pub server_time_ns: Nanos,
    /// Raw value string as received from the broker
    pub data: String,
    pub kind: MessageKind,
}

/// Values parsed out of a message, typed per the derived header
#[derive(Debug, Clone, PartialEq)]
pub enum ParsedValues {
    /// A run of waveform samples forming one interval record
    Interval(ValueArray),
    /// A single metric sample forming one time-value pair record
    Pair(Value),
}

impl ParsedValues {
    /// Number of sample points the flush policy should account
    pub fn point_count(&self) -> u64 {
        match self {
            ParsedValues::Interval(values) => values.len() as u64,
            ParsedValues::Pair(_) => 1,
        }
    }
}

impl SensorMessage {
    /// Derives the WAL header and typed values for this message
    ///
    /// `file_length_time_s` controls the file-start-time bucket: every
    /// message of a stream within one bucket maps to the same header and
    /// therefore the same fingerprint, which is what pins a stream to a
    /// single file per bucket across restarts.
    pub fn derive_header(&self, file_length_time_s: u64) -> Result<(WALHeader, ParsedValues)> {
        let (mode, input_value_type, samples_per_message, scale_type, scale_0, scale_1, values) =
            match &self.kind {
                MessageKind::Waveform { scale_m, scale_b } => {
                    let raw = parse_waveform_samples(&self.data)?;
                    if *scale_m != 0.0 && *scale_b != 0.0 {
                        let scaled: Vec<i16> = raw
                            .iter()
                            .map(|v| ((v - scale_b) / scale_m).round() as i16)
                            .collect();
                        let count = scaled.len() as u32;
                        (
                            ValueMode::Intervals,
                            ValueType::Int16,
                            count,
                            ScaleType::Linear,
                            *scale_b,
                            *scale_m,
                            ParsedValues::Interval(ValueArray::Int16(scaled)),
                        )
                    } else {
                        let count = raw.len() as u32;
                        (
                            ValueMode::Intervals,
                            ValueType::Float64,
                            count,
                            ScaleType::None,
                            0.0,
                            0.0,
                            ParsedValues::Interval(ValueArray::Float64(raw)),
                        )
                    }
                }
                MessageKind::Metric => {
                    let value: f64 = self.data.trim().parse().map_err(|_| {
                        Error::Corruption(format!("unparseable metric value '{}'", self.data))
                    })?;
                    (
                        ValueMode::TimeValuePairs,
                        ValueType::Float64,
                        1,
                        ScaleType::None,
                        0.0,
                        0.0,
                        ParsedValues::Pair(Value::Float64(value)),
                    )
                }
            };

        let header = WALHeader {
            version: WAL_CURRENT_VERSION,
            device_name: WALHeader::pack_name(&self.device_name)?,
            sample_freq: freq_hz_to_nhz(self.freq_hz)?,
            input_value_type,
            true_value_type: ValueType::Float64,
            mode,
            samples_per_message,
            file_start_time: file_start_bucket(self.data_time_ns, file_length_time_s),
            scale_type,
            scale_0,
            scale_1,
            scale_2: 0.0,
            scale_3: 0.0,
            measure_name: WALHeader::pack_name(&self.measure_name)?,
            measure_units: WALHeader::pack_name(&self.measure_units)?,
        };

        Ok((header, values))
    }
}

/// Converts a sample rate in Hz to nano-hertz; aperiodic streams use 0
pub fn freq_hz_to_nhz(freq_hz: f64) -> Result<u64> {
    if !freq_hz.is_finite() || freq_hz < 0.0 {
        return Err(Error::Corruption(format!(
            "invalid sample frequency {freq_hz} Hz"
        )));
    }
    Ok((freq_hz * 1e9).round() as u64)
}

/// Floors a timestamp to its file-start-time bucket
///
/// All timestamps within `[k*L, (k+1)*L)` seconds map to `k*L` seconds, so a
/// stream produces exactly one fingerprint per bucket.
pub fn file_start_bucket(data_time_ns: i64, file_length_time_s: u64) -> i64 {
    let bucket = file_length_time_s as i64;
    let seconds = data_time_ns.div_euclid(NANOS_PER_SECOND);
    seconds.div_euclid(bucket) * bucket * NANOS_PER_SECOND
}

fn parse_waveform_samples(data: &str) -> Result<Vec<f64>> {
    data.split('^')
        .filter(|chunk| !chunk.trim().is_empty())
        .map(|chunk| {
            chunk.trim().parse::<f64>().map_err(|_| {
                Error::Corruption(format!("unparseable waveform sample '{chunk}'"))
            })
        })
        .collect()
}
