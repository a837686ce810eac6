//! Platform adapters
//!
//! One adapter per streaming service behind the [`PlatformAdapter`] trait,
//! plus the shared HTTP layer, retry policy and registry.

pub mod apple_music;
pub mod deezer;
pub mod http;
pub mod metadata;
pub mod registry;
pub mod retry;
pub mod spotify;
pub mod trait_;
pub mod youtube;

pub use apple_music::{AppleMusicAdapter, AppleMusicConfig};
pub use deezer::{DeezerAdapter, DeezerConfig};
pub use http::{ApiClient, build_client};
pub use metadata::{AuthType, PlatformCapabilities, PlatformMetadata};
pub use registry::{PlatformRegistry, RegistryError};
pub use retry::RetryPolicy;
pub use spotify::{SpotifyAdapter, SpotifyConfig};
pub use trait_::{AccessContext, NormalizedTrack, PlatformAdapter, PlatformError, TokenGrant};
pub use youtube::{YoutubeAdapter, YoutubeConfig};
