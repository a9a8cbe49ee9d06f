pub mod common;
pub mod instance;
pub mod naming;
pub mod upgrade_job;

pub use common::{API_VERSION, FIELD_MANAGER, KIND, owner_reference, standard_labels};
