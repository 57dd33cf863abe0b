//! Human-readable sizes and approximate size verification
//!
//! Directory listings only publish rounded sizes such as `1.2M`, so a download can never be
//! checked byte-for-byte against its declared size. [`SizeTolerance`] decides how close the
//! on-disk size has to be before a file is accepted.

use crate::error::{CommonError, Result};
use byte_unit::{Byte, UnitType};
use serde::{Deserialize, Serialize};

/// Upper bound on [`SizeTolerance::SignificantDigits`]; an f64 holds no more than this
pub const MAX_SIGNIFICANT_DIGITS: u32 = 20;

/// Parse a listing size string (`1.2M`, `512K`, `3.4 GB`, `17`) into bytes.
///
/// Units are decimal, matching how listing pages round their sizes. A lone `-` is what
/// listings print for folders and is rejected.
pub fn parse_size(input: &str) -> Result<u64> {
    let trimmed = input.trim();
    if trimmed.is_empty() || trimmed == "-" {
        return Err(CommonError::invalid_size(input, "no size given"));
    }

    Byte::parse_str(trimmed, true)
        .map(|byte| byte.as_u64())
        .map_err(|e| CommonError::invalid_size(input, e.to_string()))
}

/// Format bytes into a human-readable string, in the same decimal units [`parse_size`] reads
pub fn format_size(bytes: u64) -> String {
    if bytes < 1000 {
        return format!("{bytes} B");
    }
    let adjusted = Byte::from_u64(bytes).get_appropriate_unit(UnitType::Decimal);
    format!("{adjusted:.2}")
}

/// How far an on-disk size may drift from a declared size and still be accepted.
///
/// Configuration files and the environment both spell it `digits:2` or `relative:0.01`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum SizeTolerance {
    /// Equal when both values agree to this many significant digits, after scaling both by
    /// the power of ten of their mean.
    SignificantDigits(u32),
    /// Equal when `|actual - declared| <= fraction * declared`.
    Relative(f64),
}

impl Default for SizeTolerance {
    fn default() -> Self {
        SizeTolerance::SignificantDigits(2)
    }
}

impl SizeTolerance {
    /// Whether `actual` is acceptably close to `declared`
    pub fn matches(&self, declared: u64, actual: u64) -> bool {
        if declared == actual {
            return true;
        }

        let declared = declared as f64;
        let actual = actual as f64;

        match *self {
            SizeTolerance::SignificantDigits(digits) => {
                let mean = 0.5 * (declared + actual);
                let scale = 10f64.powf(mean.log10().floor());
                let digits = i32::try_from(digits).unwrap_or(i32::MAX);
                let allowed = 10f64.powi(1i32.saturating_sub(digits));
                ((declared - actual) / scale).abs() < allowed
            },
            SizeTolerance::Relative(fraction) => (actual - declared).abs() <= fraction * declared,
        }
    }

    pub fn validate(&self) -> Result<()> {
        match *self {
            SizeTolerance::SignificantDigits(0) => Err(CommonError::InvalidTolerance(
                "significant digits must be at least 1".to_string(),
            )),
            SizeTolerance::SignificantDigits(d) if d > MAX_SIGNIFICANT_DIGITS => {
                Err(CommonError::InvalidTolerance(format!(
                    "significant digits must be at most {MAX_SIGNIFICANT_DIGITS}, got {d}"
                )))
            },
            SizeTolerance::Relative(f) if !(0.0..1.0).contains(&f) => Err(
                CommonError::InvalidTolerance(format!("relative tolerance {f} must be in [0, 1)")),
            ),
            _ => Ok(()),
        }
    }
}

impl std::str::FromStr for SizeTolerance {
    type Err = CommonError;

    /// Accepts `digits:2` or `relative:0.01`
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let (kind, value) = s
            .split_once(':')
            .ok_or_else(|| CommonError::InvalidTolerance(format!("expected KIND:VALUE, got '{s}'")))?;

        let tolerance = match kind.trim().to_lowercase().as_str() {
            "digits" | "significant_digits" => value
                .trim()
                .parse()
                .map(SizeTolerance::SignificantDigits)
                .map_err(|_| CommonError::InvalidTolerance(format!("bad digit count '{value}'")))?,
            "relative" | "rel" => value
                .trim()
                .parse()
                .map(SizeTolerance::Relative)
                .map_err(|_| CommonError::InvalidTolerance(format!("bad fraction '{value}'")))?,
            other => {
                return Err(CommonError::InvalidTolerance(format!("unknown tolerance kind '{other}'")))
            },
        };
        tolerance.validate()?;
        Ok(tolerance)
    }
}

impl std::fmt::Display for SizeTolerance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SizeTolerance::SignificantDigits(d) => write!(f, "digits:{d}"),
            SizeTolerance::Relative(r) => write!(f, "relative:{r}"),
        }
    }
}

impl TryFrom<String> for SizeTolerance {
    type Error = CommonError;

    fn try_from(value: String) -> std::result::Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<SizeTolerance> for String {
    fn from(tolerance: SizeTolerance) -> Self {
        tolerance.to_string()
    }
}
