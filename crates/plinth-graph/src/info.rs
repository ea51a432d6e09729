//! Input/output metadata: what a unit's ports are called, what they measure,
//! their defaults and their legal ranges.

use crate::error::{GraphError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// How a port's value is carried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IOType {
    Unknown,
    Numerical,
    Variable,
    AtomicVariable,
    DoubleVariable,
    Unit,
    Units,
    Bus,
    Busses,
    Buffer,
    Wavetable,
    Breakpoints,
    BlockSize,
    SampleRate,
    Bool,
}

impl IOType {
    pub fn name(self) -> &'static str {
        match self {
            IOType::Unknown => "Unknown",
            IOType::Numerical => "Numerical",
            IOType::Variable => "Variable",
            IOType::AtomicVariable => "AtomicVariable",
            IOType::DoubleVariable => "DoubleVariable",
            IOType::Unit => "Unit",
            IOType::Units => "Units",
            IOType::Bus => "Bus",
            IOType::Busses => "Busses",
            IOType::Buffer => "Buffer",
            IOType::Wavetable => "Wavetable",
            IOType::Breakpoints => "Breakpoints",
            IOType::BlockSize => "BlockSize",
            IOType::SampleRate => "SampleRate",
            IOType::Bool => "Bool",
        }
    }
}

macro_rules! io_keys {
    ($($key:ident => $name:literal, $ty:ident;)*) => {
        /// Port names shared by every unit kind.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[repr(u8)]
        pub enum IOKey {
            $($key,)*
        }

        impl IOKey {
            /// Every key, in index order.
            pub const ALL: &'static [IOKey] = &[$(IOKey::$key,)*];

            /// Human-readable name.
            pub fn name(self) -> &'static str {
                match self {
                    $(IOKey::$key => $name,)*
                }
            }

            pub fn io_type(self) -> IOType {
                match self {
                    $(IOKey::$key => IOType::$ty,)*
                }
            }
        }
    };
}

io_keys! {
    Unknown => "Unknown", Unknown;
    Constant => "Constant", Numerical;
    Variable => "Variable", Variable;
    AtomicVariable => "Atomic Variable", AtomicVariable;
    Multiply => "Multiply", Unit;
    Add => "Add", Unit;
    Signal => "Signal", Unit;
    Control => "Control", Unit;
    LeftOperand => "Left Operand", Unit;
    RightOperand => "Right Operand", Unit;
    Position => "Position", Unit;
    Frequency => "Frequency", Unit;
    Q => "Q", Unit;
    S => "S", Unit;
    Gain => "Gain", Unit;
    Bandwidth => "Bandwidth", Unit;
    Duration => "Duration", Unit;
    Coeffs => "Coeffs", Unit;
    Fft => "FFT", Unit;
    Real => "Real", Unit;
    Imaginary => "Imaginary", Unit;
    BlockSize => "Block Size", BlockSize;
    SampleRate => "Sample Rate", SampleRate;
    FilterSampleRate => "Filter Sample Rate", SampleRate;
    OverlapMake => "Overlap Make", DoubleVariable;
    OverlapMix => "Overlap Mix", DoubleVariable;
    Units => "Units", Units;
    Bus => "Bus", Bus;
    Busses => "Busses", Busses;
    Buffer => "Buffer", Buffer;
    Wavetable => "Wavetable", Wavetable;
    Breakpoints => "Breakpoints", Breakpoints;
    AutoDeleteFlag => "Auto Delete Flag", Bool;
    HarmonicCount => "Harmonic Count", Numerical;
}

impl IOKey {
    /// Key at `index`, or `None` outside the key range.
    pub fn from_index(index: usize) -> Option<IOKey> {
        Self::ALL.get(index).copied()
    }

    #[inline]
    pub fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for IOKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// What a value measures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Measure {
    Unknown,
    None,
    Bool,
    NormalisedUnipolar,
    NormalisedBipolar,
    Factor,
    Percent,
    Seconds,
    Samples,
    Cents,
    Semitones,
    Octaves,
    Hertz,
    SampleRateRatio,
    Q,
    Slope,
    Decibels,
    Radians,
    Degrees,
    FftUnpacked,
    FftPacked,
    Real,
    Imaginary,
    Coeffs,
    Count,
}

impl Measure {
    pub fn name(self) -> &'static str {
        match self {
            Measure::Unknown => "Unknown",
            Measure::None => "None",
            Measure::Bool => "Bool",
            Measure::NormalisedUnipolar => "Normalised Unipolar",
            Measure::NormalisedBipolar => "Normalised Bipolar",
            Measure::Factor => "Factor",
            Measure::Percent => "Percent",
            Measure::Seconds => "Seconds",
            Measure::Samples => "Samples",
            Measure::Cents => "Cents",
            Measure::Semitones => "Semitones",
            Measure::Octaves => "Octaves",
            Measure::Hertz => "Hertz",
            Measure::SampleRateRatio => "Sample Rate Ratio",
            Measure::Q => "Q",
            Measure::Slope => "Slope",
            Measure::Decibels => "Decibels",
            Measure::Radians => "Radians",
            Measure::Degrees => "Degrees",
            Measure::FftUnpacked => "FFT Unpacked",
            Measure::FftPacked => "FFT Packed",
            Measure::Real => "Real",
            Measure::Imaginary => "Imaginary",
            Measure::Coeffs => "Coeffs",
            Measure::Count => "Count",
        }
    }

    /// Unit symbol, empty when the measure has none.
    pub fn symbol(self) -> &'static str {
        match self {
            Measure::Percent => "%",
            Measure::Seconds => "s",
            Measure::Samples => "samps",
            Measure::Cents => "cents",
            Measure::Octaves => "oct",
            Measure::Hertz => "Hz",
            Measure::Q => "Q",
            Measure::Slope => "S",
            Measure::Decibels => "dB",
            Measure::Degrees => "°",
            Measure::Imaginary => "i",
            _ => "",
        }
    }

    /// Anything other than `Unknown` or `None`.
    #[inline]
    pub fn is_known(self) -> bool {
        !matches!(self, Measure::Unknown | Measure::None)
    }
}

/// Legal range of a numeric port.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum IOLimit {
    None,
    Minimum { measure: Measure, minimum: f64 },
    Maximum { measure: Measure, maximum: f64 },
    /// Values are clamped into `[minimum, maximum]`.
    Clipped {
        measure: Measure,
        minimum: f64,
        maximum: f64,
    },
}

impl IOLimit {
    pub const fn none() -> Self {
        IOLimit::None
    }

    pub const fn minimum(measure: Measure, minimum: f64) -> Self {
        IOLimit::Minimum { measure, minimum }
    }

    pub const fn maximum(measure: Measure, maximum: f64) -> Self {
        IOLimit::Maximum { measure, maximum }
    }

    pub const fn clipped(measure: Measure, minimum: f64, maximum: f64) -> Self {
        IOLimit::Clipped {
            measure,
            minimum,
            maximum,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            IOLimit::None => "None",
            IOLimit::Minimum { .. } => "Minimum",
            IOLimit::Maximum { .. } => "Maximum",
            IOLimit::Clipped { .. } => "Clipped",
        }
    }

    pub fn measure(&self) -> Measure {
        match *self {
            IOLimit::None => Measure::None,
            IOLimit::Minimum { measure, .. }
            | IOLimit::Maximum { measure, .. }
            | IOLimit::Clipped { measure, .. } => measure,
        }
    }

    #[inline]
    pub fn is_none(&self) -> bool {
        matches!(self, IOLimit::None)
    }

    #[inline]
    pub fn is_clipped(&self) -> bool {
        matches!(self, IOLimit::Clipped { .. })
    }

    #[inline]
    pub fn has_minimum(&self) -> bool {
        self.minimum_value().is_some()
    }

    #[inline]
    pub fn has_maximum(&self) -> bool {
        self.maximum_value().is_some()
    }

    pub fn minimum_value(&self) -> Option<f64> {
        match *self {
            IOLimit::Minimum { minimum, .. } | IOLimit::Clipped { minimum, .. } => Some(minimum),
            _ => None,
        }
    }

    pub fn maximum_value(&self) -> Option<f64> {
        match *self {
            IOLimit::Maximum { maximum, .. } | IOLimit::Clipped { maximum, .. } => Some(maximum),
            _ => None,
        }
    }

    /// Whether `value` lies inside the limit.
    pub fn contains(&self, value: f64) -> bool {
        self.minimum_value().map_or(true, |min| value >= min)
            && self.maximum_value().map_or(true, |max| value <= max)
    }

    /// Clamp `value` into the limit.
    #[inline]
    pub fn apply(&self, value: f64) -> f64 {
        let value = self.minimum_value().map_or(value, |min| value.max(min));
        self.maximum_value().map_or(value, |max| value.min(max))
    }
}

impl fmt::Display for IOLimit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let symbol = self.measure().symbol();
        match (self.minimum_value(), self.maximum_value()) {
            (None, None) => f.write_str("no limit"),
            (Some(min), None) => write!(f, ">= {min}{symbol}"),
            (None, Some(max)) => write!(f, "<= {max}{symbol}"),
            (Some(min), Some(max)) => write!(f, "[{min}, {max}]{symbol}"),
        }
    }
}

/// Description of one unit port.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct IOInfo {
    pub key: IOKey,
    pub measure: Measure,
    pub default: Option<f64>,
    pub limit: IOLimit,
}

impl IOInfo {
    pub const fn new(key: IOKey, measure: Measure, default: Option<f64>, limit: IOLimit) -> Self {
        Self {
            key,
            measure,
            default,
            limit,
        }
    }

    #[inline]
    pub fn has_default(&self) -> bool {
        self.default.is_some()
    }

    #[inline]
    pub fn has_measure(&self) -> bool {
        self.measure.is_known()
    }

    pub fn name(&self) -> &'static str {
        self.key.name()
    }

    pub fn measure_name(&self) -> &'static str {
        self.measure.name()
    }

    pub fn measure_symbol(&self) -> &'static str {
        self.measure.symbol()
    }

    /// Check a constant about to be bound to this port.
    pub fn validate(&self, value: f64) -> Result<()> {
        if value.is_finite() && self.limit.contains(value) {
            return Ok(());
        }
        Err(GraphError::OutOfRange {
            key: self.key,
            value,
            limit: self.limit.to_string(),
        })
    }
}

impl fmt::Display for IOInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())?;
        if !self.measure_symbol().is_empty() {
            write!(f, " ({})", self.measure_symbol())?;
        }
        if let Some(default) = self.default {
            write!(f, " = {default}")?;
        }
        if !self.limit.is_none() {
            write!(f, " {}", self.limit)?;
        }
        Ok(())
    }
}

/// Port metadata of a unit kind.
#[derive(Debug, Clone, Copy)]
pub struct UnitInfo {
    pub name: &'static str,
    pub inputs: &'static [IOInfo],
    pub outputs: &'static [IOInfo],
}

impl UnitInfo {
    pub fn input(&self, key: IOKey) -> Option<&'static IOInfo> {
        self.inputs.iter().find(|info| info.key == key)
    }

    pub fn output(&self, key: IOKey) -> Option<&'static IOInfo> {
        self.outputs.iter().find(|info| info.key == key)
    }
}

/// Lookup of port metadata by unit kind name.
#[derive(Debug, Clone, Default)]
pub struct IORegistry {
    units: BTreeMap<&'static str, UnitInfo>,
}

impl IORegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, info: UnitInfo) {
        self.units.insert(info.name, info);
    }

    pub fn unit(&self, name: &str) -> Option<&UnitInfo> {
        self.units.get(name)
    }

    pub fn input(&self, unit: &str, key: IOKey) -> Option<&'static IOInfo> {
        self.unit(unit)?.input(key)
    }

    pub fn output(&self, unit: &str, key: IOKey) -> Option<&'static IOInfo> {
        self.unit(unit)?.output(key)
    }

    /// Registered unit names, sorted.
    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.units.keys().copied()
    }
}
