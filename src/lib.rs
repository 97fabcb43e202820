pub mod commands;
pub mod config;
pub mod device;
pub mod events;
pub mod settings;
pub mod transport;
pub mod update;

pub use commands::{CommandError, CommandResult, DfuCore};
pub use events::{dispatch, CoreEvent, EventBus, EventListener, Subscription};
pub use settings::DfuSettings;
