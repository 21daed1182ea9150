//! Traces read back from the DAQs.

use crate::error::{AppResult, ExperimentorError};
use chrono::{DateTime, Utc};
use serde::Serialize;

/// Samples of one monitored device.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Trace {
    pub device: String,
    pub daq: String,
    pub data: Vec<f64>,
}

/// One read of every monitored DAQ.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ScanData {
    pub acquired_at: DateTime<Utc>,
    /// One trace per monitored device, DAQ by DAQ in registry order.
    pub traces: Vec<Trace>,
}

impl ScanData {
    pub fn new(traces: Vec<Trace>) -> Self {
        Self {
            acquired_at: Utc::now(),
            traces,
        }
    }

    /// The samples of `device`, if it was monitored.
    pub fn trace(&self, device: &str) -> Option<&[f64]> {
        self.traces
            .iter()
            .find(|t| t.device == device)
            .map(|t| t.data.as_slice())
    }

    pub fn devices(&self) -> impl Iterator<Item = &str> + '_ {
        self.traces.iter().map(|t| t.device.as_str())
    }

    pub fn len(&self) -> usize {
        self.traces.len()
    }

    pub fn is_empty(&self) -> bool {
        self.traces.is_empty()
    }

    /// Serialize for storage or hand-off to another process.
    pub fn to_json(&self) -> AppResult<String> {
        serde_json::to_string(self).map_err(|e| {
            ExperimentorError::Configuration(format!("failed to serialize scan data: {}", e))
        })
    }
}

/// Split a block-ordered buffer (`points` samples of the first channel, then
/// the second, ...) into one trace per channel. Extra samples are dropped.
pub fn split_blocks(
    daq: &str,
    channels: &[String],
    points: usize,
    mut data: Vec<f64>,
) -> AppResult<Vec<Trace>> {
    let expected = points * channels.len();
    if data.len() < expected {
        return Err(ExperimentorError::ShortRead {
            daq: daq.to_string(),
            expected,
            got: data.len(),
        });
    }
    data.truncate(expected);
    if points == 0 {
        return Ok(channels
            .iter()
            .map(|device| Trace {
                device: device.clone(),
                daq: daq.to_string(),
                data: Vec::new(),
            })
            .collect());
    }
    Ok(channels
        .iter()
        .zip(data.chunks(points))
        .map(|(device, block)| Trace {
            device: device.clone(),
            daq: daq.to_string(),
            data: block.to_vec(),
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_split_blocks_by_channel() {
        let traces = split_blocks(
            "NI-DAQ",
            &names(&["PD1", "PD2"]),
            3,
            vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 99.0],
        )
        .unwrap();
        assert_eq!(traces[0].data, [1.0, 2.0, 3.0]);
        assert_eq!(traces[1].data, [4.0, 5.0, 6.0]);
        assert_eq!(traces[1].daq, "NI-DAQ");
    }

    #[test]
    fn test_short_buffer_is_an_error() {
        let err = split_blocks("NI-DAQ", &names(&["PD1", "PD2"]), 3, vec![0.0; 4]).unwrap_err();
        assert!(matches!(err, ExperimentorError::ShortRead { expected: 6, got: 4, .. }));
    }

    #[test]
    fn test_lookup_and_json() {
        let data = ScanData::new(vec![Trace {
            device: "PD1".to_string(),
            daq: "NI-DAQ".to_string(),
            data: vec![0.5],
        }]);
        assert_eq!(data.trace("PD1"), Some(&[0.5][..]));
        assert!(data.trace("PD2").is_none());
        let json = data.to_json().unwrap();
        assert!(json.contains("\"device\":\"PD1\""));
        assert!(json.contains("acquired_at"));
    }
}
