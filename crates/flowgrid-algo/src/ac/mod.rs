//! # AC Load Flow Domain
//!
//! Binds the generic equation machinery to AC networks:
//!
//! - [`network`]: numbered per-unit network with the discrete control state
//! - [`terms`]: pi-model branch flows, shunt flows, HVDC AC emulation
//! - [`system`]: equation system construction, activation rules and targets
//!
//! ## Bus equations
//!
//! | Bus type                 | Active equations        | Unknowns  |
//! |--------------------------|-------------------------|-----------|
//! | Slack                    | `BusTargetV`, `BusTargetPhi` | V, φ |
//! | PV (generator control)   | `BusTargetP`, `BusTargetV`   | V, φ |
//! | PQ                       | `BusTargetP`, `BusTargetQ`   | V, φ |
//!
//! A continuous transformer (shunt) voltage control adds `BusTargetV` on the
//! regulated bus and frees `BranchRho1` (`ShuntB`); in discrete mode the
//! variable is pinned by `BranchTargetRho1` (`ShuntTargetB`) instead.

pub mod network;
pub mod system;
pub mod terms;

pub use network::{
    BusVoltageControl, ControlMode, HvdcDirection, HvdcMode, LfBranch, LfBus, LfGenerator, LfHvdc, LfNetwork,
    LfNetworkParameters, LfShunt, LfZone, PhaseControl, ShuntVoltageControl,
    TransformerVoltageControl, VoltageControllerKind,
};
pub use system::{AcEquationSystem, AcTargets, BranchTerms};

use crate::equations::{EquationKind, MismatchCategory, VariableKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum AcVariableType {
    BusV,
    BusPhi,
    BranchRho1,
    BranchAlpha1,
    ShuntB,
    /// Active flow through a non-impedant branch
    DummyP,
    /// Reactive flow through a non-impedant branch
    DummyQ,
}

impl VariableKind for AcVariableType {
    fn is_voltage_magnitude(self) -> bool {
        self == AcVariableType::BusV
    }

    fn is_voltage_angle(self) -> bool {
        self == AcVariableType::BusPhi
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum AcEquationType {
    BusTargetP,
    BusTargetQ,
    BusTargetV,
    BusTargetPhi,
    BranchTargetRho1,
    BranchTargetAlpha1,
    ShuntTargetB,
    /// `V1 − V2 = 0` across a non-impedant branch
    ZeroV,
    /// `φ1 − φ2 = 0` across a non-impedant branch
    ZeroPhi,
}

impl EquationKind for AcEquationType {
    fn mismatch_category(self) -> MismatchCategory {
        match self {
            AcEquationType::BusTargetP => MismatchCategory::ActivePower,
            AcEquationType::BusTargetQ => MismatchCategory::ReactivePower,
            AcEquationType::BusTargetV | AcEquationType::ZeroV => MismatchCategory::Voltage,
            AcEquationType::BusTargetPhi
            | AcEquationType::BranchTargetAlpha1
            | AcEquationType::ZeroPhi => MismatchCategory::Angle,
            AcEquationType::BranchTargetRho1 => MismatchCategory::Ratio,
            AcEquationType::ShuntTargetB => MismatchCategory::Susceptance,
        }
    }
}
