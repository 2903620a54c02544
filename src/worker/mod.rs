//! Embedding worker process and its provisioning

pub mod process;
pub mod provisioner;

pub use process::{LaunchSpec, WorkerProcess};
pub use provisioner::{provisioner_from_config, CommandProvisioner, Provisioner, PythonProvisioner};
