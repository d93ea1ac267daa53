//! Per-channel (optical path) calibration state.

use crate::error::Cn0503Error;
use std::fmt;
use std::str::FromStr;

/// Number of coefficients in an instrumentation-unit polynomial (5th order).
pub const POLYNOMIAL_LEN: usize = 6;

/// Valid low-pass filter cutoff range in Hz.
pub const LPF_RANGE: std::ops::RangeInclusive<f64> = 0.01..=5.0;

const DEFAULT_NAMES: [&str; 4] = ["Quinine", "pH", "Nitrate", "Turbidity"];
const DEFAULT_RATIOS: [&str; 4] = [
    "A1#2048-A2#2048-/",
    "B1#2048-B2#2048-/",
    "C1#2048-C2#2048-/",
    "D2#2048-D1#2048-/",
];
const DEFAULT_WAVELENGTHS: [f64; 4] = [365.0, 430.0, 615.0, 530.0];
const DEFAULT_BASELINES: [f64; 4] = [1.0, 1.003, 1.329, 0.425];
const DEFAULT_TYPES: [MeasurementType; 4] = [
    MeasurementType::Fluorescence,
    MeasurementType::Absorption,
    MeasurementType::Absorption,
    MeasurementType::Turbidity,
];

/// What a channel measures.
///
/// The wire names are the ones the `CHANNn` command takes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MeasurementType {
    /// Absorption / colorimetry (`COLO`)
    Absorption,
    /// Fluorescence (`FLUO`)
    Fluorescence,
    /// Turbidity (`TURB`), only available on channels 1 and 4
    Turbidity,
}

impl MeasurementType {
    /// Every type, in menu order.
    pub const ALL: [MeasurementType; 3] = [
        MeasurementType::Absorption,
        MeasurementType::Fluorescence,
        MeasurementType::Turbidity,
    ];

    /// Token used by `CHANN`.
    pub fn wire_name(self) -> &'static str {
        match self {
            MeasurementType::Absorption => "COLO",
            MeasurementType::Fluorescence => "FLUO",
            MeasurementType::Turbidity => "TURB",
        }
    }

    /// Whether the relative ratio keeps the "1 -" term for this measurement.
    pub fn default_subtract_enabled(self) -> u8 {
        match self {
            MeasurementType::Absorption => 1,
            _ => 0,
        }
    }

    /// Whether a channel number (1-4) supports this measurement.
    pub fn supported_on(self, channel_number: usize) -> bool {
        match self {
            MeasurementType::Turbidity => matches!(channel_number, 1 | 4),
            _ => (1..=4).contains(&channel_number),
        }
    }
}

impl fmt::Display for MeasurementType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MeasurementType::Absorption => "Absorption",
            MeasurementType::Fluorescence => "Fluorescence",
            MeasurementType::Turbidity => "Turbidity",
        };
        f.write_str(name)
    }
}

impl FromStr for MeasurementType {
    type Err = Cn0503Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "COLO" | "ABSORPTION" => Ok(MeasurementType::Absorption),
            "FLUO" | "FLUORESCENCE" => Ok(MeasurementType::Fluorescence),
            "TURB" | "TURBIDITY" => Ok(MeasurementType::Turbidity),
            other => Err(Cn0503Error::InvalidCommand(format!(
                "Unknown measurement type '{other}'"
            ))),
        }
    }
}

/// Model of a single channel or optical path.
#[derive(Debug, Clone, PartialEq)]
pub struct Channel {
    /// Channel number, 1-4
    pub number: usize,
    /// Display name
    pub name: String,
    /// RPN ratio expression, `#` marks a constant
    pub ratio_expression: String,
    /// Divisor for the relative ratio
    pub baseline_ratio: f64,
    /// INS1 coefficients, low to high order
    pub ins1_polynomial: Vec<f64>,
    /// INS2 coefficients, low to high order
    pub ins2_polynomial: Vec<f64>,
    lpf_cutoff: f64,
    /// `1` when the relative ratio subtracts the baseline
    pub subtract_enabled: u8,
    /// What the channel measures
    pub measurement_type: MeasurementType,
    /// Excitation wavelength in nm
    pub excitation_wavelength: f64,
}

impl Channel {
    /// Channel with the board defaults for `number` (1-4).
    ///
    /// Numbers outside 1-4 fall back to the channel 1 defaults.
    pub fn new(number: usize) -> Self {
        let i = number.clamp(1, 4) - 1;
        let measurement_type = DEFAULT_TYPES[i];
        Self {
            number,
            name: DEFAULT_NAMES[i].to_string(),
            ratio_expression: DEFAULT_RATIOS[i].to_string(),
            baseline_ratio: DEFAULT_BASELINES[i],
            ins1_polynomial: identity_polynomial(),
            ins2_polynomial: identity_polynomial(),
            lpf_cutoff: 0.5,
            subtract_enabled: measurement_type.default_subtract_enabled(),
            measurement_type,
            excitation_wavelength: DEFAULT_WAVELENGTHS[i],
        }
    }

    /// Low-pass filter cutoff in Hz.
    pub fn lpf_cutoff(&self) -> f64 {
        self.lpf_cutoff
    }

    /// Set the low-pass cutoff. Values outside 0.01-5.0 Hz are ignored.
    ///
    /// Returns whether the stored value changed.
    pub fn set_lpf_cutoff(&mut self, cutoff: f64) -> bool {
        if !LPF_RANGE.contains(&cutoff) || self.lpf_cutoff == cutoff {
            return false;
        }
        self.lpf_cutoff = cutoff;
        true
    }
}

/// `y = x`
pub fn identity_polynomial() -> Vec<f64> {
    vec![0.0, 1.0, 0.0, 0.0, 0.0, 0.0]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_follow_board_layout() {
        let ch1 = Channel::new(1);
        assert_eq!(ch1.name, "Quinine");
        assert_eq!(ch1.measurement_type, MeasurementType::Fluorescence);
        assert_eq!(ch1.subtract_enabled, 0);

        let ch2 = Channel::new(2);
        assert_eq!(ch2.baseline_ratio, 1.003);
        assert_eq!(ch2.subtract_enabled, 1);

        let ch4 = Channel::new(4);
        assert_eq!(ch4.ratio_expression, "D2#2048-D1#2048-/");
        assert_eq!(ch4.measurement_type, MeasurementType::Turbidity);
        assert_eq!(ch4.ins1_polynomial, identity_polynomial());
    }

    #[test]
    fn lpf_out_of_range_is_a_no_op() {
        let mut ch = Channel::new(1);
        assert!(!ch.set_lpf_cutoff(0.001));
        assert!(!ch.set_lpf_cutoff(5.5));
        assert_eq!(ch.lpf_cutoff(), 0.5);

        assert!(ch.set_lpf_cutoff(5.0));
        assert_eq!(ch.lpf_cutoff(), 5.0);
        assert!(!ch.set_lpf_cutoff(5.0));
    }

    #[test]
    fn turbidity_only_on_outer_channels() {
        assert!(MeasurementType::Turbidity.supported_on(1));
        assert!(MeasurementType::Turbidity.supported_on(4));
        assert!(!MeasurementType::Turbidity.supported_on(2));
        assert!(MeasurementType::Fluorescence.supported_on(3));
        assert!(!MeasurementType::Fluorescence.supported_on(5));
    }

    #[test]
    fn parses_wire_names() {
        assert_eq!(
            "fluo".parse::<MeasurementType>().unwrap(),
            MeasurementType::Fluorescence
        );
        assert_eq!(MeasurementType::Absorption.wire_name(), "COLO");
        assert!("UV".parse::<MeasurementType>().is_err());
    }
}
