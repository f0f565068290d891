pub mod bootstrap;
pub mod events;
pub mod image_inspector;
pub mod provider_manager;
pub mod provisioning;
pub mod settings;
pub mod state_machine;
pub mod worker;
