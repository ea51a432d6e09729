//! The built-in unit kinds and their per-block rendering.

use crate::info::{IOInfo, IOKey, IOLimit, IORegistry, Measure, UnitInfo};
use plinth_core::{AtomicHandle, ProcessInfo};
use std::f64::consts::TAU;
use std::fmt;
use std::sync::Arc;

/// Most inputs any built-in kind declares.
pub const MAX_UNIT_INPUTS: usize = 3;

const SIGNAL_OUT: [IOInfo; 1] = [IOInfo::new(
    IOKey::Signal,
    Measure::NormalisedBipolar,
    None,
    IOLimit::none(),
)];

const MULTIPLY_IN: IOInfo = IOInfo::new(IOKey::Multiply, Measure::Factor, Some(1.0), IOLimit::none());
const ADD_IN: IOInfo = IOInfo::new(IOKey::Add, Measure::None, Some(0.0), IOLimit::none());

static CONSTANT_INFO: UnitInfo = UnitInfo {
    name: "Constant",
    inputs: &[],
    outputs: &SIGNAL_OUT,
};

static VARIABLE_INFO: UnitInfo = UnitInfo {
    name: "Variable",
    inputs: &[],
    outputs: &SIGNAL_OUT,
};

static SINE_INFO: UnitInfo = UnitInfo {
    name: "Sine",
    inputs: &[
        IOInfo::new(
            IOKey::Frequency,
            Measure::Hertz,
            Some(440.0),
            IOLimit::clipped(Measure::Hertz, 0.0, 20000.0),
        ),
        MULTIPLY_IN,
        ADD_IN,
    ],
    outputs: &SIGNAL_OUT,
};

static MUL_ADD_INFO: UnitInfo = UnitInfo {
    name: "MulAdd",
    inputs: &[
        IOInfo::new(IOKey::Signal, Measure::None, None, IOLimit::none()),
        MULTIPLY_IN,
        ADD_IN,
    ],
    outputs: &SIGNAL_OUT,
};

static MIX_INFO: UnitInfo = UnitInfo {
    name: "Mix",
    inputs: &[
        IOInfo::new(IOKey::LeftOperand, Measure::None, None, IOLimit::none()),
        IOInfo::new(IOKey::RightOperand, Measure::None, None, IOLimit::none()),
    ],
    outputs: &SIGNAL_OUT,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnitKind {
    Constant,
    Variable,
    Sine,
    MulAdd,
    Mix,
}

impl UnitKind {
    pub const ALL: [UnitKind; 5] = [
        UnitKind::Constant,
        UnitKind::Variable,
        UnitKind::Sine,
        UnitKind::MulAdd,
        UnitKind::Mix,
    ];

    pub fn info(self) -> &'static UnitInfo {
        match self {
            UnitKind::Constant => &CONSTANT_INFO,
            UnitKind::Variable => &VARIABLE_INFO,
            UnitKind::Sine => &SINE_INFO,
            UnitKind::MulAdd => &MUL_ADD_INFO,
            UnitKind::Mix => &MIX_INFO,
        }
    }

    pub fn name(self) -> &'static str {
        self.info().name
    }

    pub fn inputs(self) -> &'static [IOInfo] {
        self.info().inputs
    }

    pub fn outputs(self) -> &'static [IOInfo] {
        self.info().outputs
    }

    /// Position of `key` among this kind's inputs.
    pub fn input_index(self, key: IOKey) -> Option<usize> {
        self.inputs().iter().position(|info| info.key == key)
    }
}

impl fmt::Display for UnitKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl IORegistry {
    /// Registry holding every built-in kind.
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        for kind in UnitKind::ALL {
            registry.register(*kind.info());
        }
        registry
    }
}

/// What to create for a graph node.
#[derive(Debug, Clone)]
pub enum UnitSpec {
    /// Outputs a fixed value.
    Constant(f32),
    /// Outputs a parameter published from a control thread, sampled once per block.
    Variable(Arc<AtomicHandle<f32>>),
    Sine,
    MulAdd,
    Mix,
}

impl UnitSpec {
    pub fn kind(&self) -> UnitKind {
        match self {
            UnitSpec::Constant(_) => UnitKind::Constant,
            UnitSpec::Variable(_) => UnitKind::Variable,
            UnitSpec::Sine => UnitKind::Sine,
            UnitSpec::MulAdd => UnitKind::MulAdd,
            UnitSpec::Mix => UnitKind::Mix,
        }
    }

    pub(crate) fn instantiate(&self) -> Box<dyn Unit> {
        match self {
            UnitSpec::Constant(value) => Box::new(ConstantUnit { value: *value }),
            UnitSpec::Variable(handle) => Box::new(VariableUnit {
                handle: Arc::clone(handle),
            }),
            UnitSpec::Sine => Box::new(SineUnit { phase: 0.0 }),
            UnitSpec::MulAdd => Box::new(MulAddUnit),
            UnitSpec::Mix => Box::new(MixUnit),
        }
    }
}

/// Runtime half of a node.
///
/// `inputs` holds one slice per declared input, in declaration order, each
/// `output.len()` samples long.
pub(crate) trait Unit: Send {
    fn render(&mut self, inputs: &[&[f32]], output: &mut [f32], info: &ProcessInfo);
}

struct ConstantUnit {
    value: f32,
}

impl Unit for ConstantUnit {
    fn render(&mut self, _inputs: &[&[f32]], output: &mut [f32], _info: &ProcessInfo) {
        output.fill(self.value);
    }
}

struct VariableUnit {
    handle: Arc<AtomicHandle<f32>>,
}

impl Unit for VariableUnit {
    fn render(&mut self, _inputs: &[&[f32]], output: &mut [f32], _info: &ProcessInfo) {
        let value = self.handle.get().map_or(0.0, |v| *v);
        output.fill(value);
    }
}

struct SineUnit {
    /// In cycles, kept in `[0, 1)`.
    phase: f64,
}

impl Unit for SineUnit {
    fn render(&mut self, inputs: &[&[f32]], output: &mut [f32], info: &ProcessInfo) {
        let limit = SINE_INFO.inputs[0].limit;
        let (freq, mul, add) = (inputs[0], inputs[1], inputs[2]);
        let inv_rate = 1.0 / info.sample_rate;

        for (i, out) in output.iter_mut().enumerate() {
            *out = (self.phase * TAU).sin() as f32 * mul[i] + add[i];
            let hz = limit.apply(freq[i] as f64);
            self.phase = (self.phase + hz * inv_rate).fract();
        }
    }
}

struct MulAddUnit;

impl Unit for MulAddUnit {
    fn render(&mut self, inputs: &[&[f32]], output: &mut [f32], _info: &ProcessInfo) {
        let (signal, mul, add) = (inputs[0], inputs[1], inputs[2]);
        for (i, out) in output.iter_mut().enumerate() {
            *out = signal[i] * mul[i] + add[i];
        }
    }
}

struct MixUnit;

impl Unit for MixUnit {
    fn render(&mut self, inputs: &[&[f32]], output: &mut [f32], _info: &ProcessInfo) {
        for ((out, l), r) in output.iter_mut().zip(inputs[0]).zip(inputs[1]) {
            *out = l + r;
        }
    }
}
