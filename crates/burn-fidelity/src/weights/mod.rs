mod cache;
mod downloader;
mod provider;
mod source;

pub use cache::*;
pub use downloader::*;
pub use provider::*;
pub use source::*;
