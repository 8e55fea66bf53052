pub mod payload;
pub mod structure_contracts;

pub use payload::{
    compute_state_hash, normalize_payload, normalize_payload_value, StructuralStatePayload,
    TensionEdge,
};
pub use structure_contracts::*;
