use std::{fmt::Display, str::FromStr};

use thiserror::Error;

/// Lowest temperature a DS18B20 can report, in degC.
pub const MIN_CELSIUS: f32 = -55f32;
/// Highest temperature a DS18B20 can report, in degC.
pub const MAX_CELSIUS: f32 = 125f32;

/// A temperature in degrees Celsius, inside the range a 1-wire probe can report.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd)]
pub struct Temperature {
    pub value: f32,
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum TemperatureError {
    #[error("Temperature too high: {0} degC")]
    TooHigh(f32),

    #[error("Temperature too low: {0} degC")]
    TooLow(f32),

    #[error("Temperature is not a finite number")]
    NotFinite,
}

impl TryFrom<f32> for Temperature {
    type Error = TemperatureError;

    fn try_from(value: f32) -> Result<Self, Self::Error> {
        if !value.is_finite() {
            return Err(TemperatureError::NotFinite);
        }
        if value > MAX_CELSIUS {
            return Err(TemperatureError::TooHigh(value));
        }
        if value < MIN_CELSIUS {
            return Err(TemperatureError::TooLow(value));
        }
        Ok(Temperature { value })
    }
}

impl Temperature {
    /// Apply a calibration offset. The result is re-validated.
    pub fn with_offset(self, offset: f32) -> Result<Self, TemperatureError> {
        Self::try_from(self.value + offset)
    }

    /// Value expressed in the given output unit.
    pub fn in_unit(&self, unit: TemperatureUnit) -> f32 {
        match unit {
            TemperatureUnit::Celsius => self.value,
            TemperatureUnit::Fahrenheit => self.value * 9f32 / 5f32 + 32f32,
        }
    }
}

impl Display for Temperature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({} degC)", self.value)
    }
}

/// Unit temperatures are written out in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TemperatureUnit {
    #[default]
    Celsius,
    Fahrenheit,
}

impl TemperatureUnit {
    /// CSV column name for this unit.
    pub fn column_name(&self) -> &'static str {
        match self {
            TemperatureUnit::Celsius => "temperature_celsius",
            TemperatureUnit::Fahrenheit => "temperature_fahrenheit",
        }
    }
}

#[derive(Error, Debug)]
#[error("Unknown temperature unit '{0}'. Expected 'celsius' or 'fahrenheit'.")]
pub struct UnknownUnitError(String);

impl FromStr for TemperatureUnit {
    type Err = UnknownUnitError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "c" | "celsius" => Ok(TemperatureUnit::Celsius),
            "f" | "fahrenheit" => Ok(TemperatureUnit::Fahrenheit),
            other => Err(UnknownUnitError(other.to_string())),
        }
    }
}
