//! Streaming sample buffers.
//!
//! One time column plus up to [`MAX_COLUMNS`] data columns. Each append pushes the new
//! frame first; if the time column has then reached `max_data_points`, the oldest entry
//! is evicted from it and from every data column as long as the time column. A full
//! buffer therefore holds `max_data_points - 1` frames.

use super::device::MAX_COLUMNS;
use crate::error::{AppResult, Cn0503Error};
use std::collections::VecDeque;
use std::time::Instant;

/// One decoded data value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Sample {
    /// Raw ADC code from a `DATI` frame
    Code(u32),
    /// Ratio or instrumentation value from a `DATF` frame
    Value(f64),
}

impl Sample {
    /// Numeric value, codes converted losslessly.
    pub fn as_f64(self) -> f64 {
        match self {
            Sample::Code(code) => f64::from(code),
            Sample::Value(value) => value,
        }
    }
}

/// Bounded time and data columns filled by the dispatcher.
///
/// ```
/// use cn0503::model::stream::{Sample, StreamBuffers};
/// use std::time::Instant;
///
/// let mut buffers = StreamBuffers::new(3);
/// for code in 0..5 {
///     buffers.append(Instant::now(), &[Sample::Code(code)])?;
/// }
/// assert_eq!(buffers.len(), 2);
/// assert_eq!(buffers.column(0).unwrap().back(), Some(&Sample::Code(4)));
/// # Ok::<(), cn0503::Cn0503Error>(())
/// ```
#[derive(Debug, Clone)]
pub struct StreamBuffers {
    max_data_points: usize,
    start_time: Option<Instant>,
    time_list: VecDeque<f64>,
    columns: Vec<VecDeque<Sample>>,
}

impl StreamBuffers {
    /// Empty buffers that hold at most `max_data_points - 1` frames.
    pub fn new(max_data_points: usize) -> Self {
        Self {
            max_data_points,
            start_time: None,
            time_list: VecDeque::with_capacity(max_data_points),
            columns: (0..MAX_COLUMNS).map(|_| VecDeque::new()).collect(),
        }
    }

    /// Length at which the oldest frame is evicted.
    pub fn max_data_points(&self) -> usize {
        self.max_data_points
    }

    /// Drop all samples and forget the session start time.
    pub fn clear(&mut self) {
        self.start_time = None;
        self.time_list.clear();
        for column in &mut self.columns {
            column.clear();
        }
    }

    /// Drop the samples of a single column.
    pub fn clear_column(&mut self, index: usize) {
        if let Some(column) = self.columns.get_mut(index) {
            column.clear();
        }
    }

    /// Number of accepted frames held.
    pub fn len(&self) -> usize {
        self.time_list.len()
    }

    /// Whether no frame is held.
    pub fn is_empty(&self) -> bool {
        self.time_list.is_empty()
    }

    /// Arrival time of the first frame of the session, if any.
    pub fn start_time(&self) -> Option<Instant> {
        self.start_time
    }

    /// Mark the start of a streaming session. Elapsed times are measured from here.
    pub fn start(&mut self, now: Instant) {
        self.start_time = Some(now);
    }

    /// Append one frame received at `now`.
    ///
    /// The frame is rejected as a whole if it is wider than [`MAX_COLUMNS`].
    pub fn append(&mut self, now: Instant, samples: &[Sample]) -> AppResult<()> {
        if samples.len() > MAX_COLUMNS {
            return Err(Cn0503Error::SampleWidthMismatch {
                expected: MAX_COLUMNS,
                actual: samples.len(),
            });
        }

        let start = *self.start_time.get_or_insert(now);
        self.time_list
            .push_back(now.saturating_duration_since(start).as_secs_f64());
        for (column, sample) in self.columns.iter_mut().zip(samples) {
            column.push_back(*sample);
        }

        let len = self.time_list.len();
        if len >= self.max_data_points {
            self.time_list.pop_front();
            // Shorter columns hold only recent samples
            for column in self.columns.iter_mut().filter(|c| c.len() >= len) {
                column.pop_front();
            }
        }
        Ok(())
    }

    /// Seconds since the first sample of the session.
    pub fn time(&self) -> &VecDeque<f64> {
        &self.time_list
    }

    /// Data column `index`, or `None` past [`MAX_COLUMNS`].
    pub fn column(&self, index: usize) -> Option<&VecDeque<Sample>> {
        self.columns.get(index)
    }

    /// Copy out the time column and the first `width` data columns.
    pub fn snapshot(&self, width: usize) -> StreamSnapshot {
        StreamSnapshot {
            time: self.time_list.iter().copied().collect(),
            columns: self
                .columns
                .iter()
                .take(width.min(MAX_COLUMNS))
                .map(|c| c.iter().copied().collect())
                .collect(),
        }
    }
}

/// Point-in-time copy of the streaming buffers, safe to hold while new frames arrive.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StreamSnapshot {
    /// Seconds since the first sample
    pub time: Vec<f64>,
    /// Data columns in device order
    pub columns: Vec<Vec<Sample>>,
}

impl StreamSnapshot {
    /// Number of frames copied.
    pub fn len(&self) -> usize {
        self.time.len()
    }

    /// Whether the snapshot holds no frame.
    pub fn is_empty(&self) -> bool {
        self.time.is_empty()
    }

    /// Column values as floats.
    pub fn column_f64(&self, index: usize) -> Vec<f64> {
        self.columns
            .get(index)
            .map(|c| c.iter().map(|s| s.as_f64()).collect())
            .unwrap_or_default()
    }

    /// Write `time_s,col0,...` rows.
    #[cfg(feature = "storage_csv")]
    pub fn write_csv<W: std::io::Write>(&self, writer: W) -> AppResult<()> {
        let mut writer = csv::Writer::from_writer(writer);

        let mut header = vec!["time_s".to_string()];
        header.extend((0..self.columns.len()).map(|i| format!("col{i}")));
        writer
            .write_record(&header)
            .map_err(|e| Cn0503Error::Storage(e.to_string()))?;

        for (row, time) in self.time.iter().enumerate() {
            let mut record = vec![format!("{time:.3}")];
            for column in &self.columns {
                record.push(match column.get(row) {
                    Some(Sample::Code(code)) => code.to_string(),
                    Some(Sample::Value(value)) => value.to_string(),
                    None => String::new(),
                });
            }
            writer
                .write_record(&record)
                .map_err(|e| Cn0503Error::Storage(e.to_string()))?;
        }

        writer
            .flush()
            .map_err(|e| Cn0503Error::Storage(e.to_string()))?;
        Ok(())
    }

    /// Needs the `storage_csv` feature.
    #[cfg(not(feature = "storage_csv"))]
    pub fn write_csv<W: std::io::Write>(&self, _writer: W) -> AppResult<()> {
        Err(Cn0503Error::FeatureNotEnabled("storage_csv".to_string()))
    }
}
