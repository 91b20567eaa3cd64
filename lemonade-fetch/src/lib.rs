pub mod api;
pub mod downloader;
pub mod error;
pub mod install;

pub use api::{Api, RepoApi, VersionApi};
pub use error::FetchError;
pub use install::VersionInfo;
