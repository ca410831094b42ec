//! Provisioning orchestrator
//!
//! A run is an ordered list of stage descriptors executed by one generic
//! loop. The cluster record is the checkpoint: marker stages record their
//! completion there, so a failed or cancelled run can be resumed by running
//! it again with the same definition.

pub mod error;
pub mod provisioner;
pub mod stage;

pub use error::{ErrorKind, ProvisionError, StageError};
pub use provisioner::{lease_holder, Collaborators, Provisioner};
pub use stage::{all_stages, Outcome, ProvisionReport, StageId, StageOutcome, Step, PIPELINE};
