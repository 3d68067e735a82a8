pub mod cli;
pub mod config;
pub mod css;
pub mod downloader;
pub mod error;
pub mod file_manager;
pub mod html_parser;
pub mod manifest;
pub mod naming;
pub mod resolver;
pub mod session;

// Re-export main types for convenience
pub use cli::MirrorCommand;
pub use config::{AssetLayout, MirrorConfig, RetryPolicy};
pub use downloader::AssetFetcher;
pub use error::{MirrorError, Result};
pub use file_manager::FileManager;
pub use html_parser::{HtmlParser, PageResources, ResourceLink, ResourceType};
pub use manifest::{Asset, AssetRecord, AssetStatus, Manifest};
pub use naming::NameAllocator;
pub use resolver::Reference;
pub use session::{CancelHandle, MirrorReport, MirrorSession};
