pub mod cost_model;
pub mod error;
pub mod proportion;
pub mod role_manager;

pub use cost_model::{create_simulator, LlamaSimulator, LlamaSimulatorParams, ModelFamily, ModelSimulator, SimulatedAbility};
pub use error::{RoleManagerError, RoleManagerResult};
pub use proportion::{DIGSGroupPDRatio, DIGSRatioType, ProportionCalculator, ProportionInput, DIGS_ROLE_FLEX_NUM};
pub use role_manager::{RoleDecision, RoleManager, RoleManagerConfig, RoleManagerMode};
