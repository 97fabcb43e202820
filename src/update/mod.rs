pub mod confirmation;
pub mod image;
pub mod models;
pub mod service;
mod session;

pub use confirmation::ConfirmationBroker;
pub use image::{Chunk, ChunkReader, FirmwareImage, ImageError, ImageLoader};
pub use models::*;
pub use service::UpgradeService;
