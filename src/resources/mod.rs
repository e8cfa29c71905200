pub mod common;
pub mod instance;
pub mod pdb;
pub mod service;

pub use common::{API_VERSION, FIELD_MANAGER, KIND, owner_reference, standard_labels};
